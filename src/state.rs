//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::mailbox::{MailboxLimits, RequestMailbox};
use crate::registry::TunnelRegistry;
use crate::stream::StreamRelay;

/// Shared application state for the tunl relay.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Live tunnels: registration, authorization, activity, deactivation.
    pub registry: Arc<TunnelRegistry>,
    /// The request rendezvous between gateway and agent.
    pub mailbox: Arc<RequestMailbox>,
    /// Ordered chunk logs for streaming requests.
    pub streams: Arc<StreamRelay>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let registry = TunnelRegistry::new(
            config.limits.max_tunnels_per_owner,
            config.limits.max_anonymous_tunnels,
        );
        let mailbox = RequestMailbox::new(MailboxLimits {
            max_payload_bytes: config.limits.max_payload_bytes,
            stored_body_bytes: config.limits.stored_body_bytes,
            requests_per_minute: config.limits.requests_per_minute,
        });
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            registry: Arc::new(registry),
            mailbox: Arc::new(mailbox),
            streams: Arc::new(StreamRelay::new()),
        }
    }
}
