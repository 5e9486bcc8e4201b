//! Shared building blocks for the posthaste delivery workers: configuration,
//! the ordered header block, logging setup, and process-level plumbing.

pub mod config;
pub mod headers;
pub mod log;

pub use tracing;

/// The local system hostname, used for the `Received` trace when a delivery
/// terminates without ever establishing a connection.
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    // gethostname null-terminates unless the name fills the buffer exactly.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len() - 1) };
    if rc == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).into_owned()
    } else {
        String::from("localhost")
    }
}
