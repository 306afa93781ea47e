#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # tunl
//!
//! HTTP tunnel relay: expose a local HTTP service through a public URL.
//!
//! A broker process (`tunl serve`) accepts public traffic at
//! `/t/{tunnelId}/...` and queues it; an agent process (`tunl expose`) running
//! next to the local service long-polls the broker, replays each request
//! against localhost, and posts the response back. No inbound connectivity to
//! the agent is ever required.
//!
//! ## Subcommands
//!
//! - `tunl serve` — run the relay server
//! - `tunl expose <target-url>` — expose a local service through a relay
//!
//! ## Relay API surface
//!
//! | Method | Path                        | Auth           | Description             |
//! |--------|-----------------------------|----------------|-------------------------|
//! | GET    | `/api/health`               | No             | Liveness probe          |
//! | POST   | `/api/tunnels/register`     | optional       | Register a tunnel       |
//! | POST   | `/api/tunnels/{id}/poll`    | owner or token | Long-poll for work      |
//! | POST   | `/api/tunnels/{id}/respond` | owner or token | Deliver a response      |
//! | POST   | `/api/tunnels/{id}/stream`  | owner or token | Append chunk / mark EOF |
//! | GET    | `/api/tunnels`              | owner          | List active tunnels     |
//! | DELETE | `/api/tunnels/{id}`         | owner or token | Deactivate              |
//! | ANY    | `/t/{id}/{*path}`           | No             | Public gateway          |

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use tunl::agent::{self, AgentConfig};
use tunl::{AppState, Config};

/// HTTP tunnel relay: expose a local HTTP service through a public URL.
#[derive(Parser)]
#[command(name = "tunl", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server.
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Expose a local HTTP service through a relay.
    Expose {
        /// Loopback URL to expose, e.g. http://localhost:3000
        target_url: String,
        /// Relay base URL.
        #[arg(long, default_value = "http://localhost:3001")]
        relay: String,
        /// Bearer token identifying the tunnel owner.
        #[arg(long)]
        bearer: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => run_server(config.as_deref()).await,
        Commands::Expose {
            target_url,
            relay,
            bearer,
        } => {
            init_tracing("info");
            let result = agent::run(AgentConfig {
                relay_url: relay,
                target_url,
                bearer,
            })
            .await;
            if let Err(e) = result {
                error!("{e}");
                std::process::exit(1);
            }
        }
    }
}

fn init_tracing(default_level: &str) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);
    init_tracing(&config.logging.level);

    info!("tunl v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    info!("Public URL: {}", config.server.public_url);
    if config.server.public_url.contains("localhost") {
        warn!("Public URL points at localhost — set TUNL_PUBLIC_URL for real deployments");
    }

    let listen = config.server.listen.clone();
    let state = AppState::new(config);
    let app = tunl::router(state.clone());

    let listener = match TcpListener::bind(&listen).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind {listen}: {e}");
            std::process::exit(1);
        }
    };

    info!("Relay ready");

    // Periodic sweep: deactivate idle tunnels, expire retained requests, and
    // drop their chunk logs.
    let sweep_state = state.clone();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            let timing = &sweep_state.config.timing;
            let idle = sweep_state.registry.sweep_idle(timing.idle_tunnel_secs).await;
            if idle > 0 {
                info!("Deactivated {idle} idle tunnel(s)");
            }
            let expired = sweep_state
                .mailbox
                .sweep_expired(timing.request_retention_secs)
                .await;
            if !expired.is_empty() {
                info!("Expired {} retained request(s)", expired.len());
                sweep_state.streams.drop_requests(&expired).await;
            }
        }
    });

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("Server error: {e}");
    }

    info!("Shutting down...");
    sweep_task.abort();
    info!("Goodbye");
}
