//! Daemon command: run the dispatch and repost workers plus the reconciler.
//!
//! Layout of one daemon process:
//! - fan-out pool on `pod-dispatch` turning triggers into activities and jobs
//! - repost pool on `pod-repost`, bounded by `repost_concurrency`
//! - reconciler re-enqueuing stale `queued` activities
//!
//! Several daemons can share the same SQLite files; the queue's atomic claim
//! is the only coordination between them.

use std::sync::Arc;

use chorus_browser::{ActionPlan, AutomationExecutor, BrowserDriver};
use chorus_ledger::SqliteStore;
use chorus_pod::{
    DISPATCH_QUEUE, Dispatcher, REPOST_QUEUE, Reconciler, RepostWorker, dispatch_queue_options,
    fanout_handler, repost_queue_options,
};
use chorus_queue::{QueueBroker, WorkerPool};
use chorus_session::{BrokerClient, BrokerConfig};
use miette::{Result, miette};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{DEFAULT_DISPATCH_CONCURRENCY, DaemonConfig};

pub async fn run(config: DaemonConfig) -> Result<()> {
    let stagger = config.stagger().map_err(|e| miette!("{}", e))?;

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .map_err(|e| miette!("failed to open ledger {}: {}", config.db_path.display(), e))?,
    );
    let broker = QueueBroker::open(&config.queue_path).map_err(|e| {
        miette!(
            "failed to open queue {}: {}",
            config.queue_path.display(),
            e
        )
    })?;
    let dispatch_queue = broker
        .queue(DISPATCH_QUEUE, dispatch_queue_options())
        .map_err(|e| miette!("{}", e))?;
    let repost_queue = broker
        .queue(REPOST_QUEUE, repost_queue_options())
        .map_err(|e| miette!("{}", e))?;

    let resolver = Arc::new(
        BrokerClient::new(BrokerConfig::new(&config.broker_url, &config.broker_api_key))
            .map_err(|e| miette!("failed to create session broker client: {}", e))?,
    );
    let executor = Arc::new(AutomationExecutor::new(
        browser_driver(&config),
        ActionPlan::repost(),
        config.executor(),
    ));

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        Arc::new(repost_queue.clone()),
        stagger,
    ));
    let worker = Arc::new(RepostWorker::new(store.clone(), resolver, executor));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = signal_tx.send(true);
    });

    let mut handles = WorkerPool::new(dispatch_queue, DEFAULT_DISPATCH_CONCURRENCY)
        .start(shutdown_rx.clone(), fanout_handler(dispatcher))
        .await
        .map_err(|e| miette!("failed to start dispatch workers: {}", e))?;
    handles.extend(
        WorkerPool::new(repost_queue.clone(), config.repost_concurrency())
            .start(shutdown_rx.clone(), worker.handler())
            .await
            .map_err(|e| miette!("failed to start repost workers: {}", e))?,
    );

    match config.sweep_interval() {
        Some(interval) => {
            let reconciler = Reconciler::new(
                store.clone(),
                Arc::new(repost_queue),
                stagger,
                config.stale_after(),
            );
            let rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                reconciler.run(interval, rx).await;
            }));
        }
        None => warn!("reconciliation sweep disabled"),
    }

    info!(
        repost_concurrency = config.repost_concurrency(),
        stagger_secs = stagger.interval().as_secs(),
        "daemon running"
    );

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "worker task panicked");
        }
    }
    drop(shutdown_tx);

    broker
        .shutdown()
        .map_err(|e| miette!("failed to close queue broker: {}", e))?;
    info!("daemon stopped");
    Ok(())
}

#[cfg(feature = "chromium")]
fn browser_driver(config: &DaemonConfig) -> Arc<dyn BrowserDriver> {
    Arc::new(chorus_browser::ChromiumDriver {
        executable: config.chrome_path.clone(),
        headed: config.headed,
    })
}

#[cfg(not(feature = "chromium"))]
fn browser_driver(_config: &DaemonConfig) -> Arc<dyn BrowserDriver> {
    warn!("built without the `chromium` feature; every repost will fail");
    Arc::new(chorus_browser::UnavailableDriver)
}
