//! Process entry point: load configuration, build the shared delivery
//! machinery, run one worker per (zone, egress address), and drain cleanly
//! on SIGTERM or ctrl-c.

use std::{sync::Arc, time::Duration};

use posthaste_common::{config::Config, log::Logger};
use posthaste_delivery::{
    BodySource, BounceClassifier, BounceNotifier, CodeClassifier, DnsResolver, DrainHandle,
    HttpBodyFetcher, QueueClient, Resolver, Srs0Rewriter, SrsPolicy, SrsRewriter, TimerRegistry,
    Worker, WorkerDeps, Zone,
};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// How often the timer registry logs its window rates.
const TIMER_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| String::from("posthaste.toml"));
    let config = Config::load(&config_path)?;

    Logger::init(&config.log.mx);
    info!(config = %config_path, zones = config.zones.len(), "posthaste starting");

    if config.zones.is_empty() {
        warn!("no zones configured, nothing to deliver");
        return Ok(());
    }

    let timers = Arc::new(TimerRegistry::new());
    let resolver: Arc<dyn Resolver> = Arc::new(DnsResolver::new());
    let body: Arc<dyn BodySource> = Arc::new(HttpBodyFetcher::new(
        &config.api.hostname,
        config.api.port,
    ));
    let classifier: Arc<dyn BounceClassifier> = Arc::new(CodeClassifier);
    let queue_addr = format!("{}:{}", config.queue.host, config.queue.port);

    if config.dkim.enabled {
        // The signing backend (canonicalisation + key crypto) is injected by
        // embedders through the DkimSigner seam; this binary ships none.
        warn!("dkim.enabled is set but no signer is linked, messages go out unsigned");
    }

    let mut workers = JoinSet::new();
    let mut handles: Vec<DrainHandle> = Vec::new();

    for zone_config in config.zones.clone() {
        // One worker per egress address keeps each source IP warm; a zone
        // without a pool still gets one worker on the OS-chosen address.
        let worker_count = zone_config.pool.len().max(1);
        let zone = Arc::new(Zone::new(zone_config));

        for _ in 0..worker_count {
            let queue = QueueClient::connect(&queue_addr, timers.clone()).await?;

            let srs = config.srs.enabled.then(|| {
                let rewriter: Arc<dyn SrsRewriter> =
                    Arc::new(Srs0Rewriter::new(config.srs.secret.clone()));
                SrsPolicy::new(
                    config.srs.rewrite_domain.clone(),
                    config.srs.exclude_domains.clone(),
                    rewriter,
                )
            });

            let worker = Worker::new(
                zone.clone(),
                queue,
                WorkerDeps {
                    resolver: resolver.clone(),
                    body: body.clone(),
                    classifier: classifier.clone(),
                    srs,
                    dkim: None,
                    notifier: BounceNotifier::new(&config.bounces),
                    timers: timers.clone(),
                    timeouts: config.timeouts.clone(),
                },
            );

            handles.push(worker.drain_handle());
            workers.spawn(worker.run());
        }
    }

    let flush_timers = timers.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TIMER_FLUSH_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            flush_timers.flush();
        }
    });

    shutdown_signal().await;
    info!("shutdown requested, draining workers");
    for handle in &handles {
        handle.close();
    }

    while let Some(result) = workers.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "worker exited with a fatal error"),
            Err(e) => error!(error = %e, "worker task panicked"),
        }
    }

    timers.flush();
    info!("all workers drained");
    Ok(())
}

async fn shutdown_signal() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received");
        }
        () = terminate => {
            info!("SIGTERM received");
        }
    }
}
