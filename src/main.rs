//! Zeropoint Mediator - multi-chain transaction mediation service
//!
//! Wires the ledger, mediator, chain adapters and coordinator together,
//! replays unfinished transactions, and serves the status API and metrics.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use zeropoint_mediator::api::{self, AppState};
use zeropoint_mediator::chain::AdapterRegistry;
use zeropoint_mediator::config::Settings;
use zeropoint_mediator::coordination::{ChainBindings, TransactionCoordinator};
use zeropoint_mediator::ledger::AssetLedger;
use zeropoint_mediator::mediator::{Mediator, StaticRateSource};
use zeropoint_mediator::metrics::{self, MetricsServer};
use zeropoint_mediator::session::Authorizer;
use zeropoint_mediator::state::{MemoryStore, PgStore, Store};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Zeropoint Mediator v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    // Durable state
    let store: Arc<dyn Store> = match &settings.database {
        Some(database) => {
            let pg = PgStore::new(database).await?;
            info!("Database connection established");
            pg.run_migrations().await?;
            Arc::new(pg)
        }
        None => {
            warn!("No database configured, state will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    // Chain adapters
    let adapters = Arc::new(AdapterRegistry::from_settings(&settings).await?);
    info!("Chain adapters initialized: {:?}", adapters.connected_chains());

    let ledger = Arc::new(AssetLedger::new());
    let mediator = Arc::new(Mediator::new(
        Arc::new(StaticRateSource::from_config(&settings.mediator)),
        &settings.mediator,
    ));
    let authorizer = Arc::new(Authorizer::new(&settings.auth));
    let bindings = Arc::new(ChainBindings::new());

    let coordinator = Arc::new(TransactionCoordinator::new(
        ledger.clone(),
        mediator.clone(),
        adapters.clone(),
        bindings,
        authorizer,
        store.clone(),
        settings.coordinator.clone(),
    ));
    info!("Transaction coordinator initialized");

    // Replay transactions left unfinished by the previous run
    let recovery_handle = tokio::spawn({
        let coordinator = coordinator.clone();
        async move {
            match coordinator.recover().await {
                Ok(report) => info!("Startup recovery finished: {:?}", report),
                Err(e) => error!("Startup recovery failed: {}", e),
            }
        }
    });

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState {
            coordinator: coordinator.clone(),
            ledger: ledger.clone(),
            adapters: adapters.clone(),
            store: store.clone(),
        };
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

    // Health check loop
    let health_handle = tokio::spawn({
        let adapters = adapters.clone();
        let store = store.clone();
        let mediator = mediator.clone();
        let coordinator = coordinator.clone();
        let interval = settings.service.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(interval)).await;

                // health_check records per-chain gauges
                for (chain, healthy) in adapters.health_check().await {
                    if !healthy {
                        warn!("Chain {} health check failed", chain);
                    }
                }

                if let Err(e) = store.health_check().await {
                    warn!("Store health check failed: {}", e);
                }

                let purged = mediator.purge_expired();
                if purged > 0 {
                    info!("Purged {} expired quotes", purged);
                }
                coordinator.expire_stale().await;
                metrics::set_active_reservations(ledger.active_reservations());
            }
        }
    });

    info!("Zeropoint Mediator is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");
    if coordinator.in_flight_count() > 0 {
        warn!(
            "{} transactions still in flight; they will be recovered on next start",
            coordinator.in_flight_count()
        );
    }

    recovery_handle.abort();
    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Zeropoint Mediator stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,zeropoint_mediator=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
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
