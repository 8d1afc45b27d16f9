//! Batch Submitter - teleportr disbursement service
//!
//! Pays out confirmed L1 deposits on L2 in batches, publishing each batch
//! through the fee-bumping transaction manager.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use batch_submitter::chain::ChainProvider;
use batch_submitter::config::Settings;
use batch_submitter::drivers::{DisburserDriver, DisburserDriverConfig};
use batch_submitter::metrics::MetricsServer;
use batch_submitter::service::{BatchSubmitter, BatchSubmitterConfig};
use batch_submitter::state::StateManager;
use batch_submitter::txmgr::TxManager;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Batch Submitter v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    let name = settings.service.name.clone();
    info!("Loaded configuration for {}", name);

    // Initialize database connection
    let state_manager = Arc::new(StateManager::new(&settings.database).await?);
    info!("Database connection established");

    // Run migrations
    state_manager.run_migrations().await?;

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Chain connections
    let l1 = Arc::new(ChainProvider::new(settings.l1.clone()).await?);
    let l2 = Arc::new(ChainProvider::new(settings.l2.clone()).await?);
    info!("Chain connections initialized");

    // Disbursements are signed for and published to L2
    let wallet = settings.wallet.load_wallet(l2.chain_id())?;

    let txmgr = TxManager::new(name.clone(), settings.txmgr_config(), l2.clone())
        .context("Invalid transaction manager configuration")?;

    let driver = Arc::new(DisburserDriver::new(
        DisburserDriverConfig {
            name: name.clone(),
            num_confirmations: settings.disburser.num_deposit_confirmations,
            disburser_address: settings.disburser.disburser_address,
            deposit_address: settings.disburser.deposit_address,
            deploy_block_number: settings.disburser.deploy_block_number,
            filter_query_max_blocks: settings.disburser.filter_query_max_blocks,
        },
        l2.clone(),
        l1.clone(),
        state_manager.clone(),
        wallet.clone(),
    )?);

    let submitter = BatchSubmitter::new(
        BatchSubmitterConfig {
            name: name.clone(),
            poll_interval: settings.poll_interval(),
            clear_pending_txs: settings.service.clear_pending_txs,
            clear_pending_timeout: settings.clear_pending_timeout(),
        },
        driver,
        txmgr,
        wallet,
    );

    // Health check loop
    let health_handle = tokio::spawn({
        let l1 = l1.clone();
        let l2 = l2.clone();
        let state_manager = state_manager.clone();
        let interval = settings.poll_interval() * 10;
        async move {
            loop {
                tokio::time::sleep(interval).await;

                for provider in [&l1, &l2] {
                    if !provider.health_check().await {
                        warn!("Chain {} health check failed", provider.chain_id());
                    }
                }

                if let Err(e) = state_manager.health_check().await {
                    warn!("Database health check failed: {}", e);
                }
            }
        }
    });

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received, stopping...");
            cancel.cancel();
        }
    });

    info!("{} is running", name);

    // Returns once the in-flight submission has wound down
    let result = submitter.run(cancel).await;

    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    result?;
    info!("Batch Submitter stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,batch_submitter=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
