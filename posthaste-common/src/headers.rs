//! An ordered header block with index-addressed insertion.
//!
//! Message headers are an ordered multiset: duplicate names are allowed and
//! the on-wire order is the sole observable contract. Index 0 is the top of
//! the block; inserting past the end appends to the bottom.

use serde::{Deserialize, Serialize};

/// One `Name: value` pair. The value is stored without the trailing CRLF;
/// folded continuation lines are kept verbatim inside the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Wire length of this header including the `: ` separator and CRLF.
    pub fn wire_len(&self) -> usize {
        self.name.len() + 2 + self.value.len() + 2
    }
}

/// The header block of a message in transit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderBlock {
    entries: Vec<Header>,
}

impl HeaderBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert at `index`, clamped to the block length. `0` is the top of the
    /// block; `usize::MAX` (or anything past the end) appends to the bottom.
    pub fn insert(&mut self, index: usize, name: impl Into<String>, value: impl Into<String>) {
        let at = index.min(self.entries.len());
        self.entries.insert(at, Header::new(name, value));
    }

    pub fn prepend(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.insert(0, name, value);
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.insert(usize::MAX, name, value);
    }

    /// All values for `name`, top to bottom. Header names compare
    /// case-insensitively.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Number of headers named `name`.
    pub fn count(&self, name: &str) -> usize {
        self.get_all(name).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.entries.iter()
    }

    /// Serialise the block for the wire: one `Name: value\r\n` line per
    /// header, terminated by the empty line separating headers from body.
    pub fn wire_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_len());
        for header in &self.entries {
            out.extend_from_slice(header.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(header.value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Exact byte length of [`Self::wire_bytes`], including the terminating
    /// empty line. This is the header contribution to the advertised SIZE.
    pub fn wire_len(&self) -> usize {
        self.entries.iter().map(Header::wire_len).sum::<usize>() + 2
    }
}

impl FromIterator<(String, String)> for HeaderBlock {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(name, value)| Header { name, value })
                .collect(),
        }
    }
}
