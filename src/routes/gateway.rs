//! Public gateway — the inbound edge of the relay.
//!
//! `ANY /t/{tunnelId}/{*path}` accepts arbitrary methods and paths addressed
//! to a tunnel, drops the request into the mailbox, and either waits for the
//! agent's response or drives a chunked streaming read loop. Everything the
//! relay returns here is the stored agent response verbatim — the relay
//! never interprets payloads.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{Path as AxumPath, Request, State},
    http::{header::HeaderName, header::HeaderValue, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::AppState;

/// Headers forwarded to the agent: `x-*` plus a small explicit allowlist.
/// Everything else is transport-level noise we must not leak through the
/// tunnel. `upgrade` is included so WebSocket upgrade attempts are
/// classified as streaming.
const HEADER_ALLOWLIST: [&str; 5] = ["content-type", "user-agent", "accept", "authorization", "upgrade"];

/// `ANY /t/{tunnelId}` — forward to the tunnel target's root path.
pub async fn forward_root(
    State(state): State<AppState>,
    AxumPath(tunnel_id): AxumPath<String>,
    request: Request,
) -> Response {
    forward(state, tunnel_id, String::new(), request).await
}

/// `ANY /t/{tunnelId}/{*path}` — forward to the tunnel target.
pub async fn forward_path(
    State(state): State<AppState>,
    AxumPath((tunnel_id, path)): AxumPath<(String, String)>,
    request: Request,
) -> Response {
    forward(state, tunnel_id, format!("/{path}"), request).await
}

async fn forward(state: AppState, tunnel_id: String, path: String, request: Request) -> Response {
    if let Err(e) = state.registry.resolve_public(&tunnel_id).await {
        return e.into_response();
    }

    let method = request.method().as_str().to_string();
    // Keep the query string attached so the target sees the full URL.
    let path = match request.uri().query() {
        Some(q) => format!("{}?{q}", if path.is_empty() { "/" } else { path.as_str() }),
        None if path.is_empty() => "/".to_string(),
        None => path,
    };
    let headers = filter_headers(request.headers());

    let limit = state.config.limits.max_payload_bytes;
    let body = match axum::body::to_bytes(request.into_body(), limit).await {
        Ok(b) => b.to_vec(),
        Err(_) => return RelayError::PayloadTooLarge.into_response(),
    };

    let (request_id, is_streaming) = match state
        .mailbox
        .enqueue(&tunnel_id, method, path, headers, body)
        .await
    {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };
    debug!(tunnel_id = %tunnel_id, request_id = %request_id, is_streaming, "Public request enqueued");

    if is_streaming {
        stream_response(state, request_id)
    } else {
        await_response(state, request_id).await
    }
}

/// Filter an inbound header map down to the forwardable subset, lowercasing
/// keys for the agent.
fn filter_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut filtered = HashMap::new();
    for (name, value) in headers {
        let key = name.as_str().to_ascii_lowercase();
        if !(key.starts_with("x-") || HEADER_ALLOWLIST.contains(&key.as_str())) {
            continue;
        }
        if let Ok(v) = value.to_str() {
            filtered.insert(key, v.to_string());
        }
    }
    filtered
}

/// Non-streaming path: block until the agent responds or the wait budget
/// runs out, then replay the stored status/headers/body verbatim.
async fn await_response(state: AppState, request_id: String) -> Response {
    let timing = &state.config.timing;
    let response = match state
        .mailbox
        .wait_for_response(
            &request_id,
            Duration::from_millis(timing.response_wait_ms),
            Duration::from_millis(timing.response_poll_interval_ms),
        )
        .await
    {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };

    let status =
        StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    for (key, value) in &response.headers {
        // The body is replayed from storage, so framing headers from the
        // agent's local exchange no longer apply.
        if matches!(
            key.to_ascii_lowercase().as_str(),
            "content-length" | "transfer-encoding" | "connection"
        ) {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::try_from(key.as_str()),
            HeaderValue::from_str(value),
        ) else {
            warn!(request_id = %request_id, header = %key, "Dropping unrepresentable response header");
            continue;
        };
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// State carried across iterations of the streaming read loop.
struct StreamCursor {
    state: AppState,
    request_id: String,
    next_sequence: u64,
    deadline: tokio::time::Instant,
    draining: bool,
}

/// Streaming path: open a chunked event-stream response fed by a polling
/// read loop over the chunk log.
///
/// The loop ends when the owning request reaches a terminal state (EOF) or
/// the wall-clock ceiling passes. Dropping the response body — the inbound
/// client disconnected — drops the loop with it; the claimed request is left
/// to complete or expire normally.
fn stream_response(state: AppState, request_id: String) -> Response {
    let timing = &state.config.timing;
    let interval = Duration::from_millis(timing.stream_poll_interval_ms);
    let deadline =
        tokio::time::Instant::now() + Duration::from_millis(timing.stream_max_duration_ms);

    let cursor = StreamCursor {
        state,
        request_id,
        next_sequence: 0,
        deadline,
        draining: false,
    };

    let body_stream = futures::stream::unfold(cursor, move |mut cursor| async move {
        loop {
            let chunks = cursor
                .state
                .streams
                .read_from(&cursor.request_id, cursor.next_sequence)
                .await;
            if !chunks.is_empty() {
                let mut buf = Vec::new();
                for chunk in chunks {
                    cursor.next_sequence = chunk.sequence + 1;
                    buf.extend_from_slice(&chunk.data);
                }
                return Some((Ok::<_, Infallible>(Bytes::from(buf)), cursor));
            }
            if cursor.draining {
                // Terminal state already observed and the log is drained.
                return None;
            }

            let status = cursor.state.mailbox.status(&cursor.request_id).await;
            if status.is_none_or(|s| s.is_terminal()) {
                // One more read pass catches chunks that landed between the
                // read above and the status check.
                cursor.draining = true;
                continue;
            }
            if tokio::time::Instant::now() >= cursor.deadline {
                warn!(request_id = %cursor.request_id, "Stream hit wall-clock ceiling");
                return None;
            }
            tokio::time::sleep(interval).await;
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        // Disable nginx buffering so chunks flush as they arrive
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
