//! DKIM signing seam.
//!
//! Canonicalisation and the cryptography live outside this crate; the worker
//! only decides *when* to sign and *where* the signature headers land. The
//! signer receives the header block as it will go on the wire, the
//! precomputed body hash, and one key, and returns a complete
//! `DKIM-Signature` header value.

use posthaste_common::headers::HeaderBlock;

use crate::types::DkimKey;

pub trait DkimSigner: Send + Sync {
    /// `None` means this key cannot sign this message (bad key material,
    /// unsupported algorithm); the worker skips it and moves on.
    fn sign(
        &self,
        headers: &HeaderBlock,
        hash_algo: &str,
        body_hash: &str,
        key: &DkimKey,
    ) -> Option<String>;
}
