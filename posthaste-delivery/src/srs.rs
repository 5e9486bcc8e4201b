//! Sender Rewriting Scheme support.
//!
//! The rewriting rule itself sits behind [`SrsRewriter`]; deployments with
//! their own scheme inject it. [`Srs0Rewriter`] is the bundled SRS0-shaped
//! implementation. The policy layer decides *whether* to rewrite: the
//! `From:` header is never touched, only the envelope sender.

use std::sync::Arc;

use sha2::{Digest, Sha256};

/// Rewrites a localpart for forwarding: `(local, domain)` of the original
/// envelope sender becomes the new localpart.
pub trait SrsRewriter: Send + Sync {
    fn rewrite(&self, local: &str, domain: &str) -> String;
}

const BASE32: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// SRS0 rewriting: `SRS0=<hash>=<tt>=<domain>=<local>`, where `tt` is a
/// base32 day counter and `hash` binds the address to our secret.
pub struct Srs0Rewriter {
    secret: String,
}

impl Srs0Rewriter {
    pub const fn new(secret: String) -> Self {
        Self { secret }
    }

    fn timestamp() -> String {
        let days = chrono::Utc::now().timestamp() / 86_400;
        let days = (days % 1024) as usize;
        let mut out = String::with_capacity(2);
        out.push(char::from(BASE32[(days >> 5) & 0x1f]));
        out.push(char::from(BASE32[days & 0x1f]));
        out
    }

    fn hash(&self, timestamp: &str, domain: &str, local: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(timestamp.as_bytes());
        hasher.update(domain.to_ascii_lowercase().as_bytes());
        hasher.update(local.as_bytes());
        let digest = hasher.finalize();

        // First 20 bits of the digest as four base32 characters.
        let bits = (u32::from(digest[0]) << 12) | (u32::from(digest[1]) << 4)
            | (u32::from(digest[2]) >> 4);
        (0..4)
            .rev()
            .map(|i| char::from(BASE32[((bits >> (i * 5)) & 0x1f) as usize]))
            .collect()
    }
}

impl SrsRewriter for Srs0Rewriter {
    fn rewrite(&self, local: &str, domain: &str) -> String {
        let timestamp = Self::timestamp();
        let hash = self.hash(&timestamp, domain, local);
        format!("SRS0={hash}={timestamp}={domain}={local}")
    }
}

/// The worker-side rewrite policy.
pub struct SrsPolicy {
    rewrite_domain: String,
    exclude_domains: Vec<String>,
    rewriter: Arc<dyn SrsRewriter>,
}

impl SrsPolicy {
    pub fn new(
        rewrite_domain: String,
        exclude_domains: Vec<String>,
        rewriter: Arc<dyn SrsRewriter>,
    ) -> Self {
        Self {
            rewrite_domain,
            exclude_domains,
            rewriter,
        }
    }

    /// The envelope sender to use on the wire. Null senders, senders without
    /// a domain, and excluded domains pass through unchanged.
    pub fn apply(&self, envelope_from: &str) -> String {
        let Some((local, domain)) = envelope_from.rsplit_once('@') else {
            return envelope_from.to_string();
        };

        if self
            .exclude_domains
            .iter()
            .any(|excluded| excluded.eq_ignore_ascii_case(domain))
        {
            return envelope_from.to_string();
        }

        format!(
            "{}@{}",
            self.rewriter.rewrite(local, domain),
            self.rewrite_domain
        )
    }
}
