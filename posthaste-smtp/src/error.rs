//! Error types for the SMTP client.

use std::io;

use thiserror::Error;

use crate::response::Reply;

/// Errors that can occur while establishing or driving a session.
#[derive(Error, Debug)]
pub enum ClientError {
    /// IO error during network operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// An operation did not complete within its configured timeout.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// TLS negotiation failed. This kind is load-bearing: a dial that fails
    /// here is retried once in plaintext on the same address.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The server answered a session-setup command with a negative reply.
    #[error("server rejected {command}: {reply}")]
    Rejected { command: &'static str, reply: Reply },

    /// Failed to parse an SMTP response from the server.
    #[error("failed to parse SMTP response: {0}")]
    Parse(String),

    /// Connection was closed unexpectedly.
    #[error("connection closed unexpectedly")]
    ConnectionClosed,

    /// UTF-8 decoding error.
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

impl ClientError {
    /// Whether this failure came from the TLS layer.
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// The text handed to the bounce classifier: the server's own words when
    /// it answered, otherwise the local error message.
    pub fn reply_text(&self) -> String {
        match self {
            Self::Rejected { reply, .. } => reply.text(),
            other => other.to_string(),
        }
    }
}

/// Specialized `Result` type for SMTP client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
