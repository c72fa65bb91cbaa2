use anyhow::{Context, Result};
use clap::Parser;
use query_exchange::MailboxService;
use query_transport::{PooledAllocator, QueryServer, RequestHandler};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;

use config::WorkerConfig;

#[derive(Parser)]
#[command(name = "qw")]
#[command(author, version, about = "Query Engine worker - mailbox transport endpoint", long_about = None)]
struct Cli {
    /// Configuration file path (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on, overriding the configuration file
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to, overriding the configuration file
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => WorkerConfig::from_file(path)?,
        None => WorkerConfig::default(),
    };
    if let Some(port) = cli.port {
        config.transport.port = port;
    }
    if let Some(host) = cli.host {
        config.transport.host = host;
    }

    let allocator = PooledAllocator::new(config.transport.allocator.clone());
    let service = MailboxService::new(config.mailbox.clone());
    let handler: Arc<dyn RequestHandler> = service.clone();
    let mut server = QueryServer::new(config.transport.clone(), Arc::clone(&allocator), handler)
        .context("creating query server")?;
    let addr = server.start().context("starting query server")?;
    info!(
        "Worker listening on {} ({} backend, tls: {})",
        addr,
        server.io_backend(),
        config.transport.tls.is_some()
    );

    match config.metrics_interval() {
        Some(period) => {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = ticker.tick() => {
                        let metrics = allocator.metrics();
                        let guardian = server.guardian().stats();
                        info!(
                            used_direct = metrics.used_direct_memory,
                            used_heap = metrics.used_heap_memory,
                            peak_direct = metrics.peak_direct_memory,
                            active_accounts = metrics.active_accounts,
                            connections = server.registry().len(),
                            mailboxes = service.len(),
                            guardian_trips = guardian.trips,
                            connections_shed = guardian.connections_shed,
                            "Worker status"
                        );
                    }
                }
            }
        }
        None => {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
        }
    }

    info!("Shutting down worker");
    server.shutdown().context("shutting down query server")?;
    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        "qw=debug,query_transport=debug,query_exchange=debug"
    } else {
        "qw=info,query_transport=info,query_exchange=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
