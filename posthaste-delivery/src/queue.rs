//! The command channel to the queue authority.
//!
//! Four commands multiplex onto one stream, strictly request/response: the
//! worker never issues a second command before the prior reply. Frames are a
//! u32 big-endian length prefix followed by a bincode-encoded, versioned
//! request or response. Every command's latency lands in the timer registry
//! under `Command:<NAME>`.

use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use posthaste_common::headers::HeaderBlock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tracing::trace;

use crate::{timers::TimerRegistry, types::Delivery};

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frame size guard; a frame larger than this is a protocol violation.
const MAX_FRAME_SIZE: u32 = 10_000_000;

/// Any failure on this channel is fatal to the worker that owns it: the
/// queue lock state is no longer knowable, so the worker drains and lets the
/// supervisor restart it.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue channel IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("queue codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("queue frame of {0} bytes exceeds the limit")]
    FrameTooLarge(u32),

    #[error("queue protocol error: {0}")]
    Protocol(String),
}

/// A command sent to the queue authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    Get,
    Release {
        id: String,
        seq: u32,
        lock: String,
    },
    Defer {
        id: String,
        seq: u32,
        lock: String,
        ttl_ms: u64,
    },
    /// Terminal like `Release`, but also enqueues an internal bounce
    /// message built from the failed delivery.
    Bounce {
        id: String,
        seq: u32,
        lock: String,
        bounce: BounceMessage,
    },
}

impl Command {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Release { .. } => "RELEASE",
            Self::Defer { .. } => "DEFER",
            Self::Bounce { .. } => "BOUNCE",
        }
    }
}

/// Everything the queue authority needs to build the bounce message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BounceMessage {
    pub from: String,
    pub to: Vec<String>,
    /// The original headers, including the trace header this worker added.
    pub headers: HeaderBlock,
    pub return_path: String,
    pub category: String,
    /// Unix timestamp of the rejection.
    pub time: i64,
    /// The normalised reply that caused the bounce.
    pub response: String,
}

/// Versioned request wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub version: u32,
    pub command: Command,
}

/// Versioned response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub version: u32,
    pub payload: ResponsePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponsePayload {
    /// A locked delivery, in answer to `Get`.
    Job(Box<Job>),
    /// The queue had nothing for us.
    Empty,
    /// Acknowledgement of a mutating command.
    Ack { updated: bool },
    /// The authority refused the command.
    Error(String),
}

/// One delivery handed to a worker, with the lock token that every terminal
/// command must echo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub delivery: Delivery,
    pub lock: String,
    /// How many deliveries the authority still has queued, when it says.
    #[serde(default)]
    pub backlog: Option<u64>,
}

/// The queue operations the delivery loop needs. Implemented by
/// [`QueueClient`] for the wire and by test doubles.
#[async_trait]
pub trait QueueApi: Send {
    async fn get(&mut self) -> Result<Option<Job>, QueueError>;

    async fn release(&mut self, id: &str, seq: u32, lock: &str) -> Result<bool, QueueError>;

    async fn defer(
        &mut self,
        id: &str,
        seq: u32,
        lock: &str,
        ttl: std::time::Duration,
    ) -> Result<bool, QueueError>;

    async fn bounce(
        &mut self,
        id: &str,
        seq: u32,
        lock: &str,
        bounce: BounceMessage,
    ) -> Result<bool, QueueError>;
}

/// Wire client for the command channel.
pub struct QueueClient<S = TcpStream> {
    stream: S,
    timers: Arc<TimerRegistry>,
}

impl QueueClient<TcpStream> {
    pub async fn connect(addr: &str, timers: Arc<TimerRegistry>) -> Result<Self, QueueError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self { stream, timers })
    }
}

impl<S> QueueClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Build a client over an already-established stream.
    pub fn over(stream: S, timers: Arc<TimerRegistry>) -> Self {
        Self { stream, timers }
    }

    async fn send_command(&mut self, command: Command) -> Result<ResponsePayload, QueueError> {
        let name = command.name();
        let started = Instant::now();

        let frame = bincode::serialize(&Request {
            version: PROTOCOL_VERSION,
            command,
        })?;
        let len = u32::try_from(frame.len())
            .map_err(|_| QueueError::FrameTooLarge(u32::MAX))?;
        if len > MAX_FRAME_SIZE {
            return Err(QueueError::FrameTooLarge(len));
        }

        trace!(command = name, bytes = len, "sending queue command");

        self.stream.write_all(&len.to_be_bytes()).await?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;

        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await?;
        let response_len = u32::from_be_bytes(len_buf);
        if response_len > MAX_FRAME_SIZE {
            return Err(QueueError::FrameTooLarge(response_len));
        }

        let mut response_bytes = vec![0u8; response_len as usize];
        self.stream.read_exact(&mut response_bytes).await?;
        let response: Response = bincode::deserialize(&response_bytes)?;

        self.timers.record(&format!("Command:{name}"), started.elapsed());

        if response.version != PROTOCOL_VERSION {
            return Err(QueueError::Protocol(format!(
                "incompatible protocol version {}",
                response.version
            )));
        }

        match response.payload {
            ResponsePayload::Error(message) => Err(QueueError::Protocol(message)),
            payload => Ok(payload),
        }
    }
}

#[async_trait]
impl<S> QueueApi for QueueClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn get(&mut self) -> Result<Option<Job>, QueueError> {
        match self.send_command(Command::Get).await? {
            ResponsePayload::Job(job) => Ok(Some(*job)),
            ResponsePayload::Empty => Ok(None),
            other => Err(QueueError::Protocol(format!(
                "unexpected response to GET: {other:?}"
            ))),
        }
    }

    async fn release(&mut self, id: &str, seq: u32, lock: &str) -> Result<bool, QueueError> {
        let command = Command::Release {
            id: id.to_string(),
            seq,
            lock: lock.to_string(),
        };
        self.expect_ack(command).await
    }

    async fn defer(
        &mut self,
        id: &str,
        seq: u32,
        lock: &str,
        ttl: std::time::Duration,
    ) -> Result<bool, QueueError> {
        let command = Command::Defer {
            id: id.to_string(),
            seq,
            lock: lock.to_string(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        };
        self.expect_ack(command).await
    }

    async fn bounce(
        &mut self,
        id: &str,
        seq: u32,
        lock: &str,
        bounce: BounceMessage,
    ) -> Result<bool, QueueError> {
        let command = Command::Bounce {
            id: id.to_string(),
            seq,
            lock: lock.to_string(),
            bounce,
        };
        self.expect_ack(command).await
    }
}

impl<S> QueueClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn expect_ack(&mut self, command: Command) -> Result<bool, QueueError> {
        let name = command.name();
        match self.send_command(command).await? {
            ResponsePayload::Ack { updated } => Ok(updated),
            other => Err(QueueError::Protocol(format!(
                "unexpected response to {name}: {other:?}"
            ))),
        }
    }
}
