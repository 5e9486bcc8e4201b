//! Bounce classification and the defer/reject policy wrapped around it.
//!
//! The classifier maps a raw SMTP reply (or a local error message standing
//! in for one) to a verdict. The policy layer decides what the worker does
//! with the verdict: chronic deferrals are converted into permanent rejects,
//! and the defer TTL backs off exponentially.

use std::time::Duration;

use posthaste_smtp::normalize_reply;
use serde::{Deserialize, Serialize};

/// What the remote server's reply asks of us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BounceAction {
    /// Try again later.
    Defer,
    /// Give up and bounce.
    Reject,
}

/// Classification of one reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BounceVerdict {
    pub action: BounceAction,
    pub category: String,
    pub message: String,
}

/// Maps reply text to a verdict. The production tables live outside this
/// crate; [`CodeClassifier`] is the built-in code-driven fallback.
pub trait BounceClassifier: Send + Sync {
    fn classify(&self, reply: &str) -> BounceVerdict;
}

/// Classifies on the status code and enhanced status code alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct CodeClassifier;

impl CodeClassifier {
    fn category(code: u16, enhanced: Option<&str>) -> &'static str {
        if let Some(enhanced) = enhanced {
            let mut parts = enhanced.split('.').skip(1);
            let subject = parts.next();
            let detail = parts.next();
            match (subject, detail) {
                (Some("1"), _) => return "no-such-user",
                (Some("2"), Some("2")) => return "mailbox-full",
                (Some("2"), _) => return "mailbox",
                (Some("7"), _) => return "policy",
                _ => {}
            }
        }
        match code {
            421 | 450 | 451 => "network",
            452 => "mailbox-full",
            550 | 551 | 553 => "no-such-user",
            552 => "mailbox-full",
            554 => "policy",
            _ => "other",
        }
    }
}

impl BounceClassifier for CodeClassifier {
    fn classify(&self, reply: &str) -> BounceVerdict {
        let message = normalize_reply(reply);

        let code = message
            .split_whitespace()
            .next()
            .filter(|word| word.len() == 3)
            .and_then(|word| word.parse::<u16>().ok());

        let enhanced = message
            .split_whitespace()
            .nth(1)
            .filter(|word| is_enhanced_status(word));

        match code {
            Some(code) if (500..600).contains(&code) => BounceVerdict {
                action: BounceAction::Reject,
                category: Self::category(code, enhanced).to_string(),
                message,
            },
            Some(code) => BounceVerdict {
                action: BounceAction::Defer,
                category: Self::category(code, enhanced).to_string(),
                message,
            },
            // Local errors (connect failures, timeouts, OS messages) carry
            // no code and are always worth another try.
            None => BounceVerdict {
                action: BounceAction::Defer,
                category: String::from("network"),
                message,
            },
        }
    }
}

fn is_enhanced_status(word: &str) -> bool {
    let mut parts = word.split('.');
    let class = parts.next();
    matches!(class, Some("2" | "4" | "5"))
        && parts.next().is_some_and(|p| p.parse::<u16>().is_ok())
        && parts.next().is_some_and(|p| p.parse::<u16>().is_ok())
        && parts.next().is_none()
}

/// Deferrals past this count become permanent rejects.
pub const MAX_DEFERRALS: u32 = 6;

/// Whether the delivery is deferred. A deferring verdict stops deferring
/// once the delivery has been deferred more than [`MAX_DEFERRALS`] times.
pub const fn should_defer(action: BounceAction, deferred_count: u32) -> bool {
    matches!(action, BounceAction::Defer) && deferred_count <= MAX_DEFERRALS
}

/// Back-off TTL for the next deferral: `min(5^(deferred+1), 1024)` minutes.
pub fn defer_ttl(deferred_count: u32) -> Duration {
    let exponent = deferred_count.saturating_add(1).min(5);
    let minutes = 5u64.pow(exponent).min(1024);
    Duration::from_secs(minutes * 60)
}
