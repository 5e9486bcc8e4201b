//! Message body retrieval.
//!
//! Bodies are not stored with the queue: the worker streams them from the
//! message store over HTTP while the SMTP session is open, so a message is
//! never buffered whole. Back-pressure is inherent: the next chunk is only
//! pulled once the session has written the previous one.

use std::{io, pin::Pin, task::Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("body fetch failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("body fetch for {id} returned status {status}")]
    Status { id: String, status: u16 },

    #[error("no body stored for {0}")]
    NotFound(String),
}

/// A stream of body bytes. Errors mid-stream surface through the session as
/// send errors and classify as deferrable.
pub struct BodyStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>,
}

impl BodyStream {
    pub fn new(inner: impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(inner),
        }
    }

    /// A fully in-memory stream, for bounded payloads and tests.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self::new(futures_util::stream::iter([Ok(Bytes::from(data))]))
    }
}

impl Stream for BodyStream {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Where message bodies come from.
#[async_trait]
pub trait BodySource: Send + Sync {
    async fn fetch(&self, id: &str) -> Result<BodyStream, FetchError>;
}

/// The production source: `GET /fetch/<id>?body=yes` against the message
/// store API, headers excluded.
pub struct HttpBodyFetcher {
    client: reqwest::Client,
    base: String,
}

impl HttpBodyFetcher {
    pub fn new(hostname: &str, port: u16) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: format!("http://{hostname}:{port}"),
        }
    }
}

#[async_trait]
impl BodySource for HttpBodyFetcher {
    async fn fetch(&self, id: &str) -> Result<BodyStream, FetchError> {
        let url = format!("{}/fetch/{id}?body=yes", self.base);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(id.to_string()));
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                id: id.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(BodyStream::new(
            response.bytes_stream().map_err(io::Error::other),
        ))
    }
}

/// In-memory body store, mirroring the shape of the HTTP source. Used by
/// tests and embedders that already hold the body.
#[derive(Debug, Default)]
pub struct MemoryBodySource {
    bodies: dashmap::DashMap<String, Vec<u8>>,
}

impl MemoryBodySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.bodies.insert(id.into(), body.into());
    }
}

#[async_trait]
impl BodySource for MemoryBodySource {
    async fn fetch(&self, id: &str) -> Result<BodyStream, FetchError> {
        self.bodies
            .get(id)
            .map(|body| BodyStream::from_bytes(body.clone()))
            .ok_or_else(|| FetchError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;

    #[tokio::test]
    async fn memory_source_streams_the_stored_body() {
        let source = MemoryBodySource::new();
        source.insert("m1", b"hello body".to_vec());

        let mut stream = source.fetch("m1").await.unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"hello body");
    }

    #[tokio::test]
    async fn missing_body_is_not_found() {
        let source = MemoryBodySource::new();
        assert!(matches!(
            source.fetch("nope").await,
            Err(FetchError::NotFound(id)) if id == "nope"
        ));
    }
}
