use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use quotagate::config::{QuotaConfig, StoreBackend};
use quotagate::error::QuotaError;
use quotagate::grpc::{GrpcServer, QuotaServiceImpl};
use quotagate::ratelimit::{MaintenanceJob, RateLimiter};
use quotagate::store::{MemoryStore, PostgresStore, QuotaStore};

#[derive(Debug, Parser)]
#[command(name = "quotagate", version, about = "Per-caller quota enforcement service")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(long, short)]
    config: Option<String>,

    /// Override the gRPC listen address
    #[arg(long)]
    grpc_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the gRPC service (default)
    Serve,
    /// Remove one batch of inactive entries and exit
    Cleanup,
    /// Delete the entry for one identifier and limit type
    Reset {
        #[arg(long)]
        identifier: String,
        #[arg(long)]
        limit_type: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = QuotaConfig::load(cli.config.as_deref())?;
    if let Some(addr) = cli.grpc_addr {
        config.server.grpc_addr = addr;
    }

    init_tracing(&config);

    info!("Starting Quotagate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = cli.config.as_deref() {
        info!(path = %path, "Configuration file loaded");
    }

    let command = cli.command.unwrap_or(Command::Serve);
    if matches!(command, Command::Serve) && !config.store.backend.is_shared() {
        warn!(
            backend = ?config.store.backend,
            "Quota counters are local to this instance; use the postgres backend to share them"
        );
    }

    match config.store.backend {
        StoreBackend::Memory => {
            if config.maintenance.interval_secs == 0 {
                warn!("In-memory store without maintenance grows without bound");
            }
            run(Arc::new(MemoryStore::new()), &config, command).await
        }
        StoreBackend::Postgres => {
            let url = config.store.database_url.as_deref().ok_or_else(|| {
                QuotaError::Config("store.database_url is required".to_string())
            })?;
            let store = PostgresStore::connect(url, config.store.max_connections)
                .await?
                .with_max_attempts(config.store.max_transaction_attempts);
            store.migrate().await?;
            run(Arc::new(store), &config, command).await
        }
    }
}

fn init_tracing(config: &QuotaConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run<S: QuotaStore + 'static>(
    store: Arc<S>,
    config: &QuotaConfig,
    command: Command,
) -> anyhow::Result<()> {
    let limiter = Arc::new(
        RateLimiter::new(store, config.policy_registry()?)
            .with_transaction_timeout(config.transaction_timeout()),
    );
    let maintenance = Arc::new(
        MaintenanceJob::for_limiter(&limiter)
            .with_retention(config.retention())
            .with_batch_size(config.maintenance.batch_size),
    );
    info!(policies = limiter.policies().len(), "Rate limiter initialized");

    match command {
        Command::Cleanup => {
            let removed = maintenance.cleanup().await?;
            println!("{removed}");
        }
        Command::Reset {
            identifier,
            limit_type,
        } => {
            let removed = limiter.reset_rate_limit(&identifier, &limit_type).await?;
            println!("{}", if removed { "removed" } else { "not found" });
        }
        Command::Serve => {
            let cleanup_task = config
                .maintenance_interval()
                .map(|interval| maintenance.clone().spawn(interval));

            let service = QuotaServiceImpl::new(
                limiter,
                Arc::new(config.identity_resolver()),
                maintenance,
            );
            let grpc_server = GrpcServer::new(config.server.grpc_addr, service);

            info!("Starting gRPC server on {}", config.server.grpc_addr);

            // Run the server with graceful shutdown on Ctrl+C
            grpc_server.serve_with_shutdown(shutdown_signal()).await?;

            if let Some(task) = cleanup_task {
                task.abort();
            }
            info!("Quotagate stopped");
        }
    }

    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
