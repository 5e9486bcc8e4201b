//! Type definitions shared across the delivery pipeline.

use posthaste_common::headers::HeaderBlock;
use serde::{Deserialize, Serialize};

/// One recipient's copy of a message, as handed out by the queue authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    /// Opaque message identifier.
    pub id: String,

    /// Sequence within the message; one per recipient copy.
    pub seq: u32,

    /// Envelope sender. Empty for null-return messages.
    #[serde(default)]
    pub from: String,

    /// Recipients, all sharing `domain`.
    pub to: Vec<String>,

    /// RCPT domain used for exchange lookup.
    pub domain: String,

    /// Stored header block. The worker prepends its own trace header and
    /// signatures before streaming.
    #[serde(default)]
    pub headers: HeaderBlock,

    /// Byte count of the remote body, used for SIZE.
    #[serde(default)]
    pub body_size: u64,

    /// Number of prior deferrals; seeds the back-off.
    #[serde(default)]
    pub deferred_count: u32,

    /// Optional spam classification annotation.
    #[serde(default)]
    pub spam: Option<SpamVerdict>,

    /// Optional DKIM signing request.
    #[serde(default)]
    pub dkim: Option<DkimRequest>,

    /// Feedback-loop identifier, passed through to bounce reports.
    #[serde(default)]
    pub fbl: Option<String>,

    /// The message's own Message-ID, for logging only.
    #[serde(default)]
    pub message_id: Option<String>,
}

impl Delivery {
    /// The connection nonce: keeps the source address stable across retries
    /// of the same recipient copy.
    pub fn nonce(&self) -> String {
        format!("{}.{}", self.id, self.seq)
    }
}

/// Spam filter verdict attached upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpamVerdict {
    #[serde(default)]
    pub default: Option<SpamScore>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpamScore {
    pub spam: bool,

    #[serde(default)]
    pub score: Option<f64>,

    #[serde(default)]
    pub required: Option<f64>,

    #[serde(default)]
    pub tests: Vec<String>,
}

impl SpamScore {
    /// Render the debug header value: `Yes|No`, then `score=`, `required=`
    /// and `tests=[…]` for the fields that are present, joined by `, `.
    pub fn header_value(&self) -> String {
        let mut parts = vec![String::from(if self.spam { "Yes" } else { "No" })];
        if let Some(score) = self.score {
            parts.push(format!("score={score}"));
        }
        if let Some(required) = self.required {
            parts.push(format!("required={required}"));
        }
        if !self.tests.is_empty() {
            parts.push(format!("tests=[{}]", self.tests.join(",")));
        }
        parts.join(", ")
    }
}

/// A DKIM signing request: the precomputed body hash plus the keys to sign
/// with, in configuration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkimRequest {
    pub hash_algo: String,
    pub body_hash: String,
    pub keys: Vec<DkimKey>,
}

/// Key material for one signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkimKey {
    pub domain: String,
    pub selector: String,
    pub private_key: String,
}
