//! Edge router
//!
//! Load-balances HTTP requests across a pool of backend replicas, admits them under a
//! per-client rate limit and keeps unhealthy replicas out of rotation.
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌──────────────────────────────────────────────────────┐
//!                        │                     EDGE ROUTER                      │
//!                        │                                                      │
//!   Client Request       │  ┌──────────┐   ┌──────────┐   ┌───────────────┐    │
//!   ─────────────────────┼─▶│ routing  │──▶│  rate    │──▶│ load_balancer │    │
//!                        │  │  table   │   │ limiter  │   │  (snapshot)   │    │
//!                        │  └──────────┘   └──────────┘   └───────┬───────┘    │
//!                        │                                        ▼            │
//!   Client Response      │  ┌──────────┐                  ┌───────────────┐    │
//!   ◀────────────────────┼──│ response │◀─────────────────│ forward/retry │◀───┼── Backend
//!                        │  └──────────┘                  └───────┬───────┘    │
//!                        │                                        │ failures   │
//!                        │  ┌──────────────┐   ┌──────────────┐   ▼            │
//!                        │  │  discovery   │──▶│    pool      │◀──health       │
//!                        │  └──────────────┘   └──────────────┘   monitor      │
//!                        └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use edge_router::config::{loader::load_config, watcher::ConfigWatcher};
use edge_router::lifecycle::{self, Shutdown};
use edge_router::net;
use edge_router::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "edge-router", version, about = "HTTP edge router", long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "EDGE_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {e}", args.config.display());
            return Err(e.into());
        }
    };
    if args.check {
        println!("{}: configuration is valid", args.config.display());
        return Ok(());
    }

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "edge-router starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        routes = config.routes.len(),
        backends = config.backends.len(),
        discovery = config.discovery.len(),
        no_healthy_policy = ?config.routing.no_healthy_policy,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        metrics::init_metrics();
    }

    let server = lifecycle::prepare(config.clone()).await?;
    let listener = net::bind(&config.listener).await?;

    // Hot reload of the backend list
    let (watcher, config_updates) = ConfigWatcher::new(&args.config);
    let _watcher = match watcher.run() {
        Ok(w) => Some(w),
        Err(e) => {
            tracing::warn!(error = %e, "Config watcher unavailable, hot reload disabled");
            None
        }
    };

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    lifecycle::spawn_signal_handler(shutdown.clone());

    server.run(listener, config_updates, server_shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
