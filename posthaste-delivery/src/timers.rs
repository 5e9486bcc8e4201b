//! Named latency counters.
//!
//! Pure observability: every queue command (and anything else worth timing)
//! records into a named timer. A periodic flush logs per-second rates over
//! the window since the last flush and rotates the window counters, keeping
//! running totals intact.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::info;

#[derive(Debug)]
struct TimerCell {
    total_sum: f64,
    total_count: u64,
    window_sum: f64,
    window_count: u64,
    prev_sum: f64,
    prev_count: u64,
    epoch: Instant,
}

impl TimerCell {
    fn new() -> Self {
        Self {
            total_sum: 0.0,
            total_count: 0,
            window_sum: 0.0,
            window_count: 0,
            prev_sum: 0.0,
            prev_count: 0,
            epoch: Instant::now(),
        }
    }
}

/// Point-in-time view of one timer, for inspection and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimerSnapshot {
    pub total_sum_ms: f64,
    pub total_count: u64,
    pub window_sum_ms: f64,
    pub window_count: u64,
    pub prev_sum_ms: f64,
    pub prev_count: u64,
}

#[derive(Debug, Default)]
pub struct TimerRegistry {
    timers: DashMap<String, Mutex<TimerCell>>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, name: &str, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let cell = self
            .timers
            .entry(name.to_string())
            .or_insert_with(|| Mutex::new(TimerCell::new()));
        let mut cell = cell.lock();
        cell.total_sum += ms;
        cell.total_count += 1;
        cell.window_sum += ms;
        cell.window_count += 1;
    }

    /// Log the current window of every timer and rotate it into the `prev`
    /// slot. Totals are preserved across flushes.
    pub fn flush(&self) {
        for entry in self.timers.iter() {
            let mut cell = entry.value().lock();
            let secs = cell.epoch.elapsed().as_secs_f64().max(f64::EPSILON);

            let rate = cell.window_count as f64 / secs;
            let avg_ms = if cell.window_count > 0 {
                cell.window_sum / cell.window_count as f64
            } else {
                0.0
            };

            info!(
                target: "posthaste::timers",
                timer = %entry.key(),
                rate_per_sec = format_args!("{rate:.2}"),
                avg_ms = format_args!("{avg_ms:.2}"),
                count = cell.window_count,
                total = cell.total_count,
            );

            cell.prev_sum = cell.window_sum;
            cell.prev_count = cell.window_count;
            cell.window_sum = 0.0;
            cell.window_count = 0;
            cell.epoch = Instant::now();
        }
    }

    pub fn snapshot(&self, name: &str) -> Option<TimerSnapshot> {
        self.timers.get(name).map(|cell| {
            let cell = cell.lock();
            TimerSnapshot {
                total_sum_ms: cell.total_sum,
                total_count: cell.total_count,
                window_sum_ms: cell.window_sum,
                window_count: cell.window_count,
                prev_sum_ms: cell.prev_sum,
                prev_count: cell.prev_count,
            }
        })
    }
}
