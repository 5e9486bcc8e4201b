//! The outbound delivery engine: resolution, classification, the queue
//! command channel, body streaming, bounce notification, and the per-worker
//! delivery loop that ties them together.
//!
//! One worker processes deliveries strictly sequentially; horizontal
//! concurrency comes from running many workers, typically one per
//! (zone, egress address) pair. The only mutable state shared between
//! workers is each zone's STARTTLS hint and throttle.

pub mod classify;
pub mod dkim;
pub mod fetch;
pub mod notify;
pub mod queue;
pub mod resolver;
pub mod speedometer;
pub mod srs;
pub mod timers;
pub mod types;
pub mod worker;
pub mod zone;

pub use classify::{BounceAction, BounceClassifier, BounceVerdict, CodeClassifier};
pub use dkim::DkimSigner;
pub use fetch::{BodySource, BodyStream, FetchError, HttpBodyFetcher, MemoryBodySource};
pub use notify::{BounceNotifier, BounceReport};
pub use queue::{BounceMessage, Job, QueueApi, QueueClient, QueueError};
pub use resolver::{DnsFailure, DnsResolver, Exchange, Resolver};
pub use speedometer::Speedometer;
pub use srs::{Srs0Rewriter, SrsPolicy, SrsRewriter};
pub use timers::{TimerRegistry, TimerSnapshot};
pub use types::{Delivery, DkimKey, DkimRequest, SpamScore, SpamVerdict};
pub use worker::{DrainHandle, Worker, WorkerDeps, WorkerError};
pub use zone::Zone;
