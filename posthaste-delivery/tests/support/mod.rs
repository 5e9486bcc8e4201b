//! Shared fixtures for delivery integration tests.
#![allow(dead_code)]

pub mod mock_server;

use std::{
    collections::{HashMap, VecDeque},
    net::IpAddr,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use posthaste_common::config::{
    AddressFamily, BounceConfig, PoolAddress, SmtpTimeouts, ZoneConfig,
};
use posthaste_common::headers::HeaderBlock;
use posthaste_delivery::{
    BodySource, BounceMessage, BounceNotifier, CodeClassifier, Delivery, DnsFailure, Exchange,
    Job, QueueApi, QueueError, Resolver, TimerRegistry, WorkerDeps,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
};

/// A terminal command the worker issued against the queue.
#[derive(Debug, Clone)]
pub enum TerminalCommand {
    Release {
        id: String,
        seq: u32,
        lock: String,
    },
    Defer {
        id: String,
        seq: u32,
        lock: String,
        ttl: Duration,
    },
    Bounce {
        id: String,
        seq: u32,
        lock: String,
        bounce: BounceMessage,
    },
}

/// In-process queue authority: hands out scripted jobs and records every
/// terminal command.
pub struct MockQueue {
    jobs: Mutex<VecDeque<Job>>,
    pub commands: Arc<Mutex<Vec<TerminalCommand>>>,
}

impl MockQueue {
    pub fn new(jobs: Vec<Job>) -> Self {
        Self {
            jobs: Mutex::new(jobs.into()),
            commands: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn command_log(&self) -> Arc<Mutex<Vec<TerminalCommand>>> {
        self.commands.clone()
    }
}

#[async_trait]
impl QueueApi for MockQueue {
    async fn get(&mut self) -> Result<Option<Job>, QueueError> {
        Ok(self.jobs.lock().pop_front())
    }

    async fn release(&mut self, id: &str, seq: u32, lock: &str) -> Result<bool, QueueError> {
        self.commands.lock().push(TerminalCommand::Release {
            id: id.to_string(),
            seq,
            lock: lock.to_string(),
        });
        Ok(true)
    }

    async fn defer(
        &mut self,
        id: &str,
        seq: u32,
        lock: &str,
        ttl: Duration,
    ) -> Result<bool, QueueError> {
        self.commands.lock().push(TerminalCommand::Defer {
            id: id.to_string(),
            seq,
            lock: lock.to_string(),
            ttl,
        });
        Ok(true)
    }

    async fn bounce(
        &mut self,
        id: &str,
        seq: u32,
        lock: &str,
        bounce: BounceMessage,
    ) -> Result<bool, QueueError> {
        self.commands.lock().push(TerminalCommand::Bounce {
            id: id.to_string(),
            seq,
            lock: lock.to_string(),
            bounce,
        });
        Ok(true)
    }
}

/// Resolver answering from fixed tables; unknown domains fail like DNS.
#[derive(Default)]
pub struct StaticResolver {
    mx: HashMap<String, Vec<Exchange>>,
    ips: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mx(mut self, domain: &str, exchanges: Vec<Exchange>) -> Self {
        self.mx.insert(domain.to_string(), exchanges);
        self
    }

    pub fn with_ip(mut self, host: &str, ips: Vec<IpAddr>) -> Self {
        self.ips.insert(host.to_string(), ips);
        self
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<Exchange>, DnsFailure> {
        self.mx
            .get(domain)
            .cloned()
            .ok_or_else(|| DnsFailure::no_mx(domain))
    }

    async fn resolve_ip(&self, host: &str, family: AddressFamily) -> Vec<IpAddr> {
        self.ips
            .get(host)
            .map(|ips| {
                ips.iter()
                    .filter(|ip| family.permits(ip))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Minimal HTTP server capturing webhook POST bodies.
pub struct WebhookServer {
    pub url: String,
    pub bodies: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl WebhookServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/bounce", listener.local_addr().unwrap());
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let captured = bodies.clone();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let captured = captured.clone();
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    let mut reader = BufReader::new(read);
                    let mut line = String::new();
                    let mut content_length = 0usize;

                    loop {
                        line.clear();
                        if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                            return;
                        }
                        if line == "\r\n" {
                            break;
                        }
                        if let Some(value) = line
                            .to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .map(str::trim)
                        {
                            content_length = value.parse().unwrap_or(0);
                        }
                    }

                    let mut body = vec![0u8; content_length];
                    tokio::io::AsyncReadExt::read_exact(&mut reader, &mut body)
                        .await
                        .ok();
                    if let Ok(value) = serde_json::from_slice(&body) {
                        captured.lock().push(value);
                    }

                    let _ = write
                        .write_all(
                            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        )
                        .await;
                });
            }
        });

        Self { url, bodies }
    }
}

pub fn test_delivery(id: &str, body_size: u64) -> Delivery {
    Delivery {
        id: id.to_string(),
        seq: 1,
        from: String::from("a@x.test"),
        to: vec![String::from("b@y.test")],
        domain: String::from("y.test"),
        headers: {
            let mut headers = HeaderBlock::new();
            headers.append("From", "a@x.test");
            headers.append("To", "b@y.test");
            headers.append("Subject", "integration");
            headers
        },
        body_size,
        deferred_count: 0,
        spam: None,
        dkim: None,
        fbl: None,
        message_id: None,
    }
}

pub fn test_job(delivery: Delivery) -> Job {
    let lock = format!("lock-{}", delivery.id);
    Job {
        delivery,
        lock,
        backlog: None,
    }
}

/// A zone pointed at the loopback mock server, with one pooled address so
/// the HELO name is deterministic.
pub fn test_zone(port: u16) -> ZoneConfig {
    ZoneConfig {
        name: String::from("test"),
        host: None,
        port,
        secure: false,
        disable_starttls: false,
        require_tls: false,
        auth: None,
        family: AddressFamily::Any,
        pool: vec![PoolAddress {
            address: "127.0.0.1".parse().unwrap(),
            hostname: String::from("out.relay.test"),
        }],
        throttle: None,
        received_template: None,
    }
}

pub fn test_deps(
    resolver: Arc<dyn Resolver>,
    body: Arc<dyn BodySource>,
    bounces: &BounceConfig,
) -> WorkerDeps {
    WorkerDeps {
        resolver,
        body,
        classifier: Arc::new(CodeClassifier),
        srs: None,
        dkim: None,
        notifier: BounceNotifier::new(bounces),
        timers: Arc::new(TimerRegistry::new()),
        timeouts: SmtpTimeouts::default(),
    }
}

/// Poll until `predicate` holds or `timeout` elapses.
pub async fn wait_for(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    predicate()
}
