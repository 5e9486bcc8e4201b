//! SMTP reply parsing and normalisation.

use std::fmt;

use crate::error::{ClientError, Result};

/// One line of a (possibly multi-line) SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    pub code: u16,
    /// Whether this is the last line of the reply.
    pub is_last: bool,
    pub message: String,
}

/// A complete SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// The normalised reply text: `NNN` (and the enhanced status code, when
    /// the server sent one, as part of the first line) followed by the
    /// message with all whitespace runs collapsed.
    pub fn text(&self) -> String {
        normalize_reply(&format!("{} {}", self.code, self.lines.join(" ")))
    }

    /// 2xx.
    pub const fn is_positive(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// 3xx, the `DATA` go-ahead.
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    /// 4xx.
    pub const fn is_transient(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    /// 5xx.
    pub const fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    /// Parses a single reply line.
    pub fn parse_line(line: &str) -> Result<ReplyLine> {
        if line.len() < 3 {
            return Err(ClientError::Parse(format!(
                "reply line too short: {line:?}"
            )));
        }

        let code = line[..3]
            .parse::<u16>()
            .map_err(|_| ClientError::Parse(format!("invalid status code in {line:?}")))?;

        // A space after the code marks the final line, a dash a continuation.
        let is_last = match line.as_bytes().get(3) {
            Some(b' ') | None => true,
            Some(b'-') => false,
            Some(c) => {
                return Err(ClientError::Parse(format!(
                    "invalid separator {:?} in {line:?}",
                    char::from(*c)
                )));
            }
        };

        let message = line.get(4..).unwrap_or_default().to_string();

        Ok(ReplyLine {
            code,
            is_last,
            message,
        })
    }

    /// Parses a complete reply from `buffer`, returning it together with the
    /// number of bytes consumed, or `None` if more data is needed.
    pub fn parse_reply(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut lines = Vec::new();
        let mut code = None;
        let mut consumed = 0;

        loop {
            let rest = &buffer[consumed..];
            let Some(eol) = rest.windows(2).position(|w| w == b"\r\n") else {
                return Ok(None);
            };

            let line = std::str::from_utf8(&rest[..eol])?;
            let parsed = Self::parse_line(line)?;

            match code {
                None => code = Some(parsed.code),
                Some(expected) if parsed.code != expected => {
                    return Err(ClientError::Parse(format!(
                        "status code changed mid-reply: {expected} then {}",
                        parsed.code
                    )));
                }
                Some(_) => {}
            }

            lines.push(parsed.message);
            consumed += eol + 2;

            if parsed.is_last {
                let code = code.unwrap_or_default();
                return Ok(Some((Self::new(code, lines), consumed)));
            }
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text())
    }
}

/// Normalise an SMTP reply (or a local error message standing in for one)
/// before logging and classification: internal newlines and runs of
/// whitespace collapse to single spaces, and surrounding whitespace is
/// trimmed. The status code and any enhanced status code survive as the
/// prefix since they were already at the front.
pub fn normalize_reply(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for word in text.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}
