//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `TUNL_LISTEN`, `TUNL_PUBLIC_URL`
//! 2. **Config file** — path via `--config <path>`, or `tunl.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:3001"
//! public_url = "https://tunl.example.com"
//!
//! [limits]
//! max_payload_bytes = 1048576       # 1 MB request/response ceiling
//! stored_body_bytes = 10240         # bodies above this are kept truncated
//! requests_per_minute = 60          # per-tunnel trailing-window budget
//! max_tunnels_per_owner = 5
//! max_anonymous_tunnels = 1         # the unauthenticated singleton slot
//!
//! [timing]
//! max_poll_wait_ms = 25000          # server-side long-poll ceiling
//! claim_poll_interval_ms = 500
//! response_wait_ms = 30000          # gateway wait for a non-streaming reply
//! response_poll_interval_ms = 300
//! stream_poll_interval_ms = 100
//! stream_max_duration_ms = 300000   # 5 min wall-clock stream ceiling
//! idle_tunnel_secs = 3600           # reaper deactivates tunnels idle longer
//! request_retention_secs = 86400    # reaper drops requests/chunks older
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:3001`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Base URL advertised in register responses (default `http://localhost:3001`).
    #[serde(default = "default_public_url")]
    pub public_url: String,
}

/// Resource-limiting policy. Advisory counters, not hard reservations —
/// slight overshoot under extreme concurrency is acceptable.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Request/response payload ceiling in bytes (default 1 MB).
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Bodies above this are replaced with a truncation marker in the
    /// retained audit copy (default 10 KB). Full bodies are still relayed.
    #[serde(default = "default_stored_body_bytes")]
    pub stored_body_bytes: usize,
    /// Per-tunnel request budget over a trailing 60 s window (default 60).
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: usize,
    /// Active tunnels per authenticated owner (default 5).
    #[serde(default = "default_max_tunnels_per_owner")]
    pub max_tunnels_per_owner: usize,
    /// Active tunnels without an owner (default 1).
    #[serde(default = "default_max_anonymous_tunnels")]
    pub max_anonymous_tunnels: usize,
}

/// Polling intervals and wait ceilings. Tunable knobs, not structural
/// constraints — tests shrink them to keep runtimes sane.
#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    /// Server-side long-poll ceiling for `POST /api/tunnels/{id}/poll`
    /// (default 25 000 ms).
    #[serde(default = "default_max_poll_wait_ms")]
    pub max_poll_wait_ms: u64,
    /// Interval between claim attempts inside the long-poll (default 500 ms).
    #[serde(default = "default_claim_poll_interval_ms")]
    pub claim_poll_interval_ms: u64,
    /// Gateway wait for a non-streaming response (default 30 000 ms).
    #[serde(default = "default_response_wait_ms")]
    pub response_wait_ms: u64,
    /// Interval between response status checks (default 300 ms).
    #[serde(default = "default_response_poll_interval_ms")]
    pub response_poll_interval_ms: u64,
    /// Interval between stream chunk reads (default 100 ms).
    #[serde(default = "default_stream_poll_interval_ms")]
    pub stream_poll_interval_ms: u64,
    /// Absolute wall-clock ceiling for a streaming response (default 5 min).
    #[serde(default = "default_stream_max_duration_ms")]
    pub stream_max_duration_ms: u64,
    /// Tunnels idle longer than this are deactivated by the sweep (default 1 h).
    #[serde(default = "default_idle_tunnel_secs")]
    pub idle_tunnel_secs: u64,
    /// Requests (and their chunks) older than this are dropped (default 24 h).
    #[serde(default = "default_request_retention_secs")]
    pub request_retention_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:3001".to_string()
}
fn default_public_url() -> String {
    "http://localhost:3001".to_string()
}
fn default_max_payload_bytes() -> usize {
    1024 * 1024 // 1 MB
}
fn default_stored_body_bytes() -> usize {
    10 * 1024
}
fn default_requests_per_minute() -> usize {
    60
}
fn default_max_tunnels_per_owner() -> usize {
    5
}
fn default_max_anonymous_tunnels() -> usize {
    1
}
fn default_max_poll_wait_ms() -> u64 {
    25_000
}
fn default_claim_poll_interval_ms() -> u64 {
    500
}
fn default_response_wait_ms() -> u64 {
    30_000
}
fn default_response_poll_interval_ms() -> u64 {
    300
}
fn default_stream_poll_interval_ms() -> u64 {
    100
}
fn default_stream_max_duration_ms() -> u64 {
    300_000
}
fn default_idle_tunnel_secs() -> u64 {
    3600
}
fn default_request_retention_secs() -> u64 {
    86_400
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            public_url: default_public_url(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
            stored_body_bytes: default_stored_body_bytes(),
            requests_per_minute: default_requests_per_minute(),
            max_tunnels_per_owner: default_max_tunnels_per_owner(),
            max_anonymous_tunnels: default_max_anonymous_tunnels(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            max_poll_wait_ms: default_max_poll_wait_ms(),
            claim_poll_interval_ms: default_claim_poll_interval_ms(),
            response_wait_ms: default_response_wait_ms(),
            response_poll_interval_ms: default_response_poll_interval_ms(),
            stream_poll_interval_ms: default_stream_poll_interval_ms(),
            stream_max_duration_ms: default_stream_max_duration_ms(),
            idle_tunnel_secs: default_idle_tunnel_secs(),
            request_retention_secs: default_request_retention_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            limits: LimitsConfig::default(),
            timing: TimingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `tunl.toml` in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("tunl.toml").exists() {
            let content = std::fs::read_to_string("tunl.toml").expect("Failed to read tunl.toml");
            toml::from_str(&content).expect("Failed to parse tunl.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("TUNL_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(url) = std::env::var("TUNL_PUBLIC_URL") {
            config.server.public_url = url;
        }

        config
    }
}
