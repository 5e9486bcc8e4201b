//! Out-of-band bounce notification.
//!
//! Permanent rejects are reported two ways: a JSON webhook for external
//! consumers, and an internal bounce message emitted through the queue.
//! The webhook is fire-and-forget with bounded retries; it never blocks or
//! fails a delivery. Internal bounces carry a hop-count loop guard so a
//! bouncing bounce cannot circulate forever.

use std::time::Duration;

use posthaste_common::{config::BounceConfig, headers::HeaderBlock};
use serde::Serialize;
use tracing::{debug, warn};

/// Deliveries carrying more `Received` headers than this never generate an
/// internal bounce. Counted after this worker's own trace header.
pub const MAX_RECEIVED_HOPS: usize = 25;

const WEBHOOK_ATTEMPTS: u32 = 5;

/// The webhook payload.
#[derive(Debug, Clone, Serialize)]
pub struct BounceReport {
    pub id: String,
    pub to: Vec<String>,
    pub seq: u32,
    #[serde(rename = "returnPath")]
    pub return_path: String,
    pub category: String,
    /// Unix timestamp of the rejection.
    pub time: i64,
    /// The normalised reply that caused the bounce.
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fbl: Option<String>,
}

pub struct BounceNotifier {
    url: Option<String>,
    internal: bool,
    client: reqwest::Client,
}

impl BounceNotifier {
    pub fn new(config: &BounceConfig) -> Self {
        Self {
            url: config.url.clone(),
            internal: config.enabled,
            client: reqwest::Client::new(),
        }
    }

    /// Whether the headers disqualify this message from internal bouncing.
    pub fn loop_guard(headers: &HeaderBlock) -> bool {
        headers.count("Received") > MAX_RECEIVED_HOPS
    }

    /// Internal bounces are emitted only when enabled, for non-null senders,
    /// and under the hop limit. Webhooks are independent of this.
    pub fn should_emit_internal(&self, envelope_from: &str, headers: &HeaderBlock) -> bool {
        self.internal && !envelope_from.is_empty() && !Self::loop_guard(headers)
    }

    /// POST the report, retrying up to five times with quadratic back-off on
    /// non-blocking timers. Failures are logged and abandoned; a lost
    /// webhook never escalates.
    pub fn post_webhook(&self, report: BounceReport) {
        let Some(url) = self.url.clone() else {
            return;
        };
        let client = self.client.clone();

        tokio::spawn(async move {
            for attempt in 0..WEBHOOK_ATTEMPTS {
                if attempt > 0 {
                    tokio::time::sleep(Duration::from_secs(u64::from(attempt * attempt))).await;
                }

                match client.post(&url).json(&report).send().await {
                    Ok(response) if response.status().is_success() => {
                        debug!(id = %report.id, seq = report.seq, "bounce webhook delivered");
                        return;
                    }
                    Ok(response) => {
                        warn!(
                            id = %report.id,
                            status = response.status().as_u16(),
                            attempt,
                            "bounce webhook rejected"
                        );
                    }
                    Err(e) => {
                        warn!(id = %report.id, error = %e, attempt, "bounce webhook failed");
                    }
                }
            }
            warn!(id = %report.id, "bounce webhook abandoned after {WEBHOOK_ATTEMPTS} attempts");
        });
    }
}
