//! Swap Watcher - lifecycle tracking for swaps sent through a round-based sequencer
//!
//! The watcher files signed swaps, follows each one until the sequencer's batch
//! executes it, verifies the committed order against the recorder's hash chain
//! and records the outcome in an append-only history.

use anyhow::{Context, Result};
use ethers::types::Address;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

mod api;
mod chain;
mod config;
mod error;
mod events;
mod lifecycle;
mod metrics;
mod notify;
mod reconcile;
mod sequencer;
mod state;
mod tx;
mod verify;

use chain::{ChainProvider, EvmLedger, Ledger, LedgerAddresses};
use config::Settings;
use lifecycle::LifecycleController;
use metrics::MetricsServer;
use notify::{NotificationEvent, Notifier};
use reconcile::{ReconcileConfig, ReconciliationEngine};
use sequencer::{Sequencer, SequencerClient};
use state::StateManager;
use tx::TransactionSender;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Swap Watcher v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    let account = settings.account()?;
    info!(
        "Tracking account {:?} on chain {} ({})",
        account, settings.chain.chain_id, settings.chain.name
    );

    // Initialize database connection
    let state_manager = Arc::new(StateManager::new(&settings.database).await?);
    info!("Database connection established");

    // Run migrations
    state_manager.run_migrations().await?;
    info!("Database migrations complete");

    let addresses = LedgerAddresses {
        router: parse_address("chain.router_address", &settings.chain.router_address)?,
        recorder: parse_address("chain.recorder_address", &settings.chain.recorder_address)?,
        vault: parse_address("chain.vault_address", &settings.chain.vault_address)?,
    };

    let provider = Arc::new(ChainProvider::new(settings.chain.clone())?);

    // Writes are only available with a wallet; reads work without one
    let sender = match TransactionSender::new(provider.clone(), &settings.chain, &settings.wallet) {
        Ok(sender) => {
            if sender.wallet_address() != account {
                warn!(
                    "Wallet {:?} differs from the tracked account {:?}",
                    sender.wallet_address(),
                    account
                );
            }
            Some(Arc::new(sender))
        }
        Err(e) => {
            warn!("{} - cancel and reimbursement are disabled", e);
            None
        }
    };

    let ledger: Arc<dyn Ledger> = Arc::new(EvmLedger::new(provider.clone(), sender, addresses));
    let sequencer: Arc<dyn Sequencer> = Arc::new(SequencerClient::new(
        &settings.sequencer,
        provider.clone(),
        addresses.recorder,
    )?);
    let notifier = Arc::new(Notifier::new());

    let controller = Arc::new(LifecycleController::new(
        state_manager.clone(),
        sequencer.clone(),
        ledger.clone(),
        notifier.clone(),
        Duration::from_millis(settings.watcher.cancel_settle_ms),
    ));

    let engine = Arc::new(ReconciliationEngine::new(
        state_manager.clone(),
        sequencer,
        ledger,
        notifier.clone(),
        ReconcileConfig {
            chain_id: settings.chain.chain_id,
            router: addresses.router,
            account,
            poll_interval_ms: settings.watcher.poll_interval_ms,
        },
    ));
    info!("Reconciliation engine initialized");

    // Start API server
    let api_handle = tokio::spawn({
        let state = api::AppState {
            state_manager: state_manager.clone(),
            controller,
            engine: engine.clone(),
            notifier: notifier.clone(),
        };
        let config = settings.api.clone();
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start reconciliation
    let engine_handle = tokio::spawn({
        let engine = engine.clone();
        async move {
            if let Err(e) = engine.run().await {
                error!("Reconciliation engine error: {}", e);
            }
        }
    });

    // Log notifications as they are published
    let notification_handle = tokio::spawn({
        let mut events = notifier.subscribe();
        async move {
            loop {
                match events.recv().await {
                    Ok(NotificationEvent::Emitted(n)) => {
                        info!(key = %n.key, status = ?n.status, "{}", n.title)
                    }
                    Ok(NotificationEvent::Removed { key }) => info!(key = %key, "Dismissed"),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Notification log skipped {} events", skipped)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let provider = provider.clone();
        let state_manager = state_manager.clone();
        let notifier = notifier.clone();
        async move {
            loop {
                tokio::time::sleep(HEALTH_CHECK_INTERVAL).await;

                let lapsed = notifier.prune();
                if lapsed > 0 {
                    debug!("Dismissed {} lapsed notifications", lapsed);
                }

                let chain_ok = provider.health_check().await;
                if chain_ok {
                    debug!(
                        "Chain {} at block {}",
                        provider.chain_id(),
                        provider.last_block().await
                    );
                } else {
                    warn!("Chain {} health check failed", provider.chain_id());
                }

                let db_ok = match state_manager.health_check().await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Database health check failed: {}", e);
                        false
                    }
                };

                if chain_ok && db_ok {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("Swap Watcher is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    engine.stop().await;

    // Abort background tasks
    api_handle.abort();
    engine_handle.abort();
    notification_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Swap Watcher stopped");
    Ok(())
}

fn parse_address(name: &str, value: &str) -> Result<Address> {
    Address::from_str(value).with_context(|| format!("{} is not a valid address", name))
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,swap_watcher=debug,sqlx=warn,hyper=warn"));

    // LOG_FORMAT=json switches to structured output
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
