//! The per-worker delivery loop.
//!
//! A worker is one sequential task: it pulls a locked delivery from the
//! queue authority, resolves the recipient domain's exchanges, dials them in
//! preference order with address fall-through, streams the assembled message
//! through the session, and answers the queue with exactly one terminal
//! command. Every path through the loop ends in another iteration; only a
//! failed queue command ends the worker.

use std::{
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use posthaste_common::{config::SmtpTimeouts, hostname};
use posthaste_smtp::{ClientError, Envelope, Session, SessionConfig};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    classify::{BounceClassifier, defer_ttl, should_defer},
    dkim::DkimSigner,
    fetch::BodySource,
    notify::{BounceNotifier, BounceReport},
    queue::{BounceMessage, Job, QueueApi, QueueError},
    resolver::{Exchange, Resolver},
    srs::SrsPolicy,
    timers::TimerRegistry,
    types::Delivery,
    zone::Zone,
};

/// Fatal worker failure, surfaced to the supervisor. The worker never
/// resumes after this; restart is the supervisor's call.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("queue channel failed: {0}")]
    Queue(#[from] QueueError),
}

/// Shared flag asking a worker to drain: checked at the top of every loop
/// iteration, so an in-flight delivery always completes first.
#[derive(Debug, Clone, Default)]
pub struct DrainHandle {
    flag: Arc<AtomicBool>,
}

impl DrainHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_draining(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Collaborators a worker delegates to. Everything here is shared and
/// read-only from the worker's point of view.
pub struct WorkerDeps {
    pub resolver: Arc<dyn Resolver>,
    pub body: Arc<dyn BodySource>,
    pub classifier: Arc<dyn BounceClassifier>,
    pub srs: Option<SrsPolicy>,
    pub dkim: Option<Arc<dyn DkimSigner>>,
    pub notifier: BounceNotifier,
    pub timers: Arc<TimerRegistry>,
    pub timeouts: SmtpTimeouts,
}

/// The outcome of one delivery attempt, ready for classification.
#[derive(Debug)]
struct Outcome {
    success: bool,
    /// Normalised reply text: the server's words, or a local error message,
    /// or a synthetic `450` when no server ever answered.
    reply: String,
}

impl Outcome {
    fn success(reply: String) -> Self {
        Self {
            success: true,
            reply,
        }
    }

    fn failure(reply: String) -> Self {
        Self {
            success: false,
            reply,
        }
    }
}

struct Dialed {
    session: Session,
    /// The HELO name actually presented, recorded in the trace header.
    helo: String,
}

/// Empty-queue back-off: `min(empty_checks², 1000) × 10 ms`, so an idle
/// worker settles at one poll every ten seconds.
pub(crate) fn empty_backoff(empty_checks: u32) -> Duration {
    let checks = u64::from(empty_checks);
    let steps = checks.saturating_mul(checks).min(1000);
    Duration::from_millis(steps * 10)
}

pub struct Worker<Q> {
    zone: Arc<Zone>,
    queue: Q,
    deps: WorkerDeps,
    drain: DrainHandle,
    empty_checks: u32,
}

impl<Q: QueueApi> Worker<Q> {
    pub fn new(zone: Arc<Zone>, queue: Q, deps: WorkerDeps) -> Self {
        Self {
            zone,
            queue,
            deps,
            drain: DrainHandle::new(),
            empty_checks: 0,
        }
    }

    /// Handle for asking this worker to stop after the current delivery.
    pub fn drain_handle(&self) -> DrainHandle {
        self.drain.clone()
    }

    /// Run until drained or the queue channel fails.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        info!(zone = %self.zone.name(), "delivery worker started");

        loop {
            if self.drain.is_draining() {
                break;
            }

            match self.queue.get().await {
                Ok(Some(job)) => {
                    self.empty_checks = 0;
                    if let Some(backlog) = job.backlog {
                        debug!(zone = %self.zone.name(), backlog, "queue backlog");
                    }
                    if let Err(e) = self.process(job).await {
                        self.drain.close();
                        error!(zone = %self.zone.name(), error = %e, "queue command failed");
                        return Err(e.into());
                    }
                }
                Ok(None) => {
                    self.empty_checks = self.empty_checks.saturating_add(1);
                    tokio::time::sleep(empty_backoff(self.empty_checks)).await;
                }
                Err(e) => {
                    self.drain.close();
                    error!(zone = %self.zone.name(), error = %e, "queue GET failed");
                    return Err(e.into());
                }
            }
        }

        info!(zone = %self.zone.name(), "delivery worker drained");
        Ok(())
    }

    /// One delivery, from lock to terminal command. Only queue failures
    /// escape; everything else is classified and acknowledged.
    async fn process(&mut self, job: Job) -> Result<(), QueueError> {
        let Job {
            mut delivery, lock, ..
        } = job;

        if let Some(speedometer) = &self.zone.speedometer {
            speedometer.pace().await;
        }

        let started = Instant::now();
        let outcome = self.attempt(&mut delivery).await;
        self.deps.timers.record("Delivery", started.elapsed());

        self.acknowledge(delivery, &lock, outcome).await
    }

    /// Resolve, dial, and transmit. Never touches the queue.
    async fn attempt(&self, delivery: &mut Delivery) -> Outcome {
        let exchanges = if let Some(host) = self.zone.host() {
            vec![Exchange::new(host.to_string(), 0)]
        } else {
            match self.deps.resolver.resolve_mx(&delivery.domain).await {
                Ok(exchanges) => exchanges,
                Err(failure) => {
                    // No connection will be made; the trace header still
                    // gets prepended so bounce generation has a hop.
                    self.prepend_received(delivery, &hostname());
                    return Outcome::failure(failure.reply);
                }
            }
        };

        let mut last_reply: Option<String> = None;

        for exchange in &exchanges {
            let ips = self
                .deps
                .resolver
                .resolve_ip(&exchange.host, self.zone.family())
                .await;

            for ip in ips {
                match self.dial(delivery, exchange, ip).await {
                    Ok(dialed) => return self.transmit(delivery, dialed).await,
                    Err(e) => {
                        debug!(
                            zone = %self.zone.name(),
                            exchange = %exchange.host,
                            %ip,
                            error = %e,
                            "dial failed, trying next address"
                        );
                        last_reply = Some(e.reply_text());
                    }
                }
            }
        }

        self.prepend_received(delivery, &hostname());
        Outcome::failure(last_reply.unwrap_or_else(|| {
            format!("450 Can't connect to any MX server for {}", delivery.domain)
        }))
    }

    /// Establish a session to one address. A STARTTLS failure flips the
    /// zone's flag and retries the same address once in plaintext; every
    /// other failure moves the caller on to the next address.
    async fn dial(
        &self,
        delivery: &Delivery,
        exchange: &Exchange,
        ip: IpAddr,
    ) -> Result<Dialed, ClientError> {
        let (local_addr, helo) = match self.zone.address_for(&delivery.nonce(), ip.is_ipv6()) {
            Some(entry) => (Some(entry.address), entry.hostname.clone()),
            None => (None, hostname()),
        };

        let config = SessionConfig {
            local_addr,
            helo_name: helo.clone(),
            server_name: exchange.host.clone(),
            secure: self.zone.secure(),
            use_starttls: !self.zone.starttls_disabled(),
            auth: self.zone.auth().cloned(),
            timeouts: self.deps.timeouts.clone(),
        };

        match Session::connect(&config, ip, self.zone.port()).await {
            Ok(session) => {
                if self.zone.require_tls() && !session.is_tls() {
                    session.close().await;
                    return Err(ClientError::Tls(String::from(
                        "TLS required but could not be negotiated",
                    )));
                }
                Ok(Dialed { session, helo })
            }
            Err(e) if e.is_tls() && !self.zone.secure() && !self.zone.require_tls() => {
                warn!(
                    zone = %self.zone.name(),
                    exchange = %exchange.host,
                    %ip,
                    error = %e,
                    "STARTTLS failed, disabling it for this zone and retrying in plaintext"
                );
                self.zone.disable_starttls();

                let config = SessionConfig {
                    use_starttls: false,
                    ..config
                };
                let session = Session::connect(&config, ip, self.zone.port()).await?;
                Ok(Dialed { session, helo })
            }
            Err(e) => Err(e),
        }
    }

    /// Assemble the header block, fetch the body, and stream the message.
    async fn transmit(&self, delivery: &mut Delivery, dialed: Dialed) -> Outcome {
        let Dialed { mut session, helo } = dialed;

        self.prepare_headers(delivery, &helo);

        let envelope_from = self
            .deps
            .srs
            .as_ref()
            .map_or_else(|| delivery.from.clone(), |srs| srs.apply(&delivery.from));

        // The message stream is the built header block followed by the
        // remote body; the advertised size is exactly their sum.
        let header_bytes = delivery.headers.wire_bytes();
        let size = header_bytes.len() as u64 + delivery.body_size;

        let body = match self.deps.body.fetch(&delivery.id).await {
            Ok(body) => body,
            Err(e) => {
                session.close().await;
                return Outcome::failure(e.to_string());
            }
        };

        let envelope = Envelope {
            from: envelope_from,
            to: delivery.to.clone(),
            size,
        };

        let outcome = match session.send(&envelope, &header_bytes, body).await {
            Ok(reply) if reply.is_positive() => Outcome::success(reply.text()),
            Ok(reply) => Outcome::failure(reply.text()),
            Err(e) => Outcome::failure(e.reply_text()),
        };

        session.close().await;
        outcome
    }

    fn prepend_received(&self, delivery: &mut Delivery, helo: &str) {
        let received = self.zone.received_header(delivery, helo);
        delivery.headers.prepend("Received", received);
    }

    /// Build the final header block. On the wire the order is: the trace
    /// header at index 0, signatures beneath it, the stored headers, and
    /// the spam annotation at the bottom.
    fn prepare_headers(&self, delivery: &mut Delivery, helo: &str) {
        self.prepend_received(delivery, helo);

        if let Some(score) = delivery.spam.as_ref().and_then(|spam| spam.default.as_ref()) {
            delivery.headers.append("X-Zone-Spam-Status", score.header_value());
        }

        if let (Some(signer), Some(dkim)) = (&self.deps.dkim, delivery.dkim.clone()) {
            // Reverse order leaves the first configured key's signature on
            // top, the ordering verifiers expect.
            for key in dkim.keys.iter().rev() {
                if let Some(signature) =
                    signer.sign(&delivery.headers, &dkim.hash_algo, &dkim.body_hash, key)
                {
                    delivery.headers.insert(1, "DKIM-Signature", signature);
                }
            }
        }
    }

    /// Answer the queue with exactly one terminal command for this lock.
    async fn acknowledge(
        &mut self,
        delivery: Delivery,
        lock: &str,
        outcome: Outcome,
    ) -> Result<(), QueueError> {
        if outcome.success {
            info!(
                zone = %self.zone.name(),
                id = %delivery.id,
                seq = delivery.seq,
                message_id = delivery.message_id.as_deref().unwrap_or(""),
                reply = %outcome.reply,
                "delivered"
            );
            self.queue.release(&delivery.id, delivery.seq, lock).await?;
            return Ok(());
        }

        let verdict = self.deps.classifier.classify(&outcome.reply);

        if should_defer(verdict.action, delivery.deferred_count) {
            let ttl = defer_ttl(delivery.deferred_count);
            info!(
                zone = %self.zone.name(),
                id = %delivery.id,
                seq = delivery.seq,
                deferred = delivery.deferred_count,
                ttl_secs = ttl.as_secs(),
                reply = %verdict.message,
                "deferred"
            );
            self.queue
                .defer(&delivery.id, delivery.seq, lock, ttl)
                .await?;
            return Ok(());
        }

        warn!(
            zone = %self.zone.name(),
            id = %delivery.id,
            seq = delivery.seq,
            category = %verdict.category,
            reply = %verdict.message,
            "rejected"
        );

        let time = chrono::Utc::now().timestamp();

        self.deps.notifier.post_webhook(BounceReport {
            id: delivery.id.clone(),
            to: delivery.to.clone(),
            seq: delivery.seq,
            return_path: delivery.from.clone(),
            category: verdict.category.clone(),
            time,
            response: verdict.message.clone(),
            fbl: delivery.fbl.clone(),
        });

        if self
            .deps
            .notifier
            .should_emit_internal(&delivery.from, &delivery.headers)
        {
            let bounce = BounceMessage {
                from: delivery.from.clone(),
                to: delivery.to.clone(),
                headers: delivery.headers.clone(),
                return_path: delivery.from,
                category: verdict.category,
                time,
                response: verdict.message,
            };
            self.queue
                .bounce(&delivery.id, delivery.seq, lock, bounce)
                .await?;
        } else {
            self.queue.release(&delivery.id, delivery.seq, lock).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_backoff_grows_quadratically() {
        assert_eq!(empty_backoff(0), Duration::ZERO);
        assert_eq!(empty_backoff(1), Duration::from_millis(10));
        assert_eq!(empty_backoff(5), Duration::from_millis(250));
        assert_eq!(empty_backoff(31), Duration::from_millis(9610));
    }

    #[test]
    fn empty_backoff_caps_at_ten_seconds() {
        assert_eq!(empty_backoff(32), Duration::from_secs(10));
        assert_eq!(empty_backoff(1000), Duration::from_secs(10));
        assert_eq!(empty_backoff(u32::MAX), Duration::from_secs(10));
    }
}
