#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::implicit_hasher)]

//! tunl library — the relay's building blocks, exposed for integration tests
//! and downstream embedding.
//!
//! - `registry` — tunnel lifecycle (register, authorize, deactivate, sweep)
//! - `mailbox` — pending-request queue with atomic claim and response rendezvous
//! - `stream` — ordered chunk log for streaming responses
//! - `routes` — public gateway and agent control API handlers
//! - `agent` — client-side expose loop
//! - `auth` — caller identity extraction and token comparison
//! - `config` — TOML + env-var configuration

pub mod agent;
pub mod auth;
pub mod config;
pub mod error;
pub mod mailbox;
pub mod registry;
pub mod routes;
pub mod state;
pub mod stream;
pub mod util;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::RelayError;
pub use mailbox::RequestMailbox;
pub use registry::TunnelRegistry;
pub use state::AppState;
pub use stream::StreamRelay;

use axum::{
    routing::{any, get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Build the full relay router: control API, health, and public gateway.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/health", get(routes::health::health))
        .route("/api/tunnels/register", post(routes::tunnels::register))
        .route("/api/tunnels", get(routes::tunnels::list))
        .route(
            "/api/tunnels/{tunnel_id}",
            axum::routing::delete(routes::tunnels::deactivate),
        )
        .route("/api/tunnels/{tunnel_id}/poll", post(routes::tunnels::poll))
        .route(
            "/api/tunnels/{tunnel_id}/respond",
            post(routes::tunnels::respond),
        )
        .route(
            "/api/tunnels/{tunnel_id}/stream",
            post(routes::tunnels::stream),
        );

    // Public gateway takes any method on any path under /t/{id}. CORS is wide
    // open here so browser apps can hit tunneled endpoints directly.
    let gateway = Router::new()
        .route("/t/{tunnel_id}", any(routes::gateway::forward_root))
        .route("/t/{tunnel_id}/{*path}", any(routes::gateway::forward_path))
        .layer(CorsLayer::permissive());

    Router::new()
        .merge(api)
        .merge(gateway)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
