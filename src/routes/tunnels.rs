//! Agent-facing control API.
//!
//! | Method | Path                        | Auth            | Description              |
//! |--------|-----------------------------|-----------------|--------------------------|
//! | POST   | `/api/tunnels/register`     | optional        | Register a tunnel        |
//! | POST   | `/api/tunnels/{id}/poll`    | owner or token  | Long-poll for work       |
//! | POST   | `/api/tunnels/{id}/respond` | owner or token  | Deliver a response       |
//! | POST   | `/api/tunnels/{id}/stream`  | owner or token  | Append chunk / mark EOF  |
//! | GET    | `/api/tunnels`              | owner           | List active tunnels      |
//! | DELETE | `/api/tunnels/{id}`         | owner or token  | Deactivate               |
//!
//! Request/response bodies and stream chunks are opaque bytes to the relay;
//! they cross this JSON API base64-encoded.

use std::collections::HashMap;
use std::time::Duration;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::Identity;
use crate::error::RelayError;
use crate::registry::is_loopback_url;
use crate::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBody {
    target_url: String,
}

/// `POST /api/tunnels/register` — create a tunnel for a loopback target.
///
/// Unauthenticated callers receive a `secretToken` that must accompany every
/// subsequent call for this tunnel.
pub async fn register(
    State(state): State<AppState>,
    identity: Identity,
    Json(body): Json<RegisterBody>,
) -> Response {
    if !is_loopback_url(&body.target_url) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "targetUrl must point at a loopback address, e.g. http://localhost:3000"})),
        )
            .into_response();
    }

    let tunnel = match state
        .registry
        .register(&body.target_url, identity.owner_id.clone())
        .await
    {
        Ok(t) => t,
        Err(e) => return e.into_response(),
    };

    let public_url = format!(
        "{}/t/{}",
        state.config.server.public_url.trim_end_matches('/'),
        tunnel.id
    );
    let mut response = json!({
        "id": tunnel.id,
        "publicUrl": public_url,
        "targetUrl": tunnel.target_url,
        "createdAt": tunnel.created_at_ms,
    });
    if let Some(token) = tunnel.secret_token {
        response["secretToken"] = json!(token);
    }
    Json(response).into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollBody {
    max_wait_ms: Option<u64>,
}

/// `POST /api/tunnels/{id}/poll` — the agent's long-poll claim.
///
/// Blocks server-side up to `maxWaitMs` (capped by config) waiting for a
/// pending request, re-attempting the claim at the configured interval.
/// Returns `{"requestId": null}` when the window closes empty.
pub async fn poll(
    State(state): State<AppState>,
    AxumPath(tunnel_id): AxumPath<String>,
    identity: Identity,
    Json(body): Json<PollBody>,
) -> Response {
    let tunnel = match state.registry.authorized(&tunnel_id, &identity).await {
        Ok(t) => t,
        Err(e) => return e.into_response(),
    };
    if !tunnel.active {
        return RelayError::Gone.into_response();
    }
    state.registry.touch(&tunnel_id).await;

    let timing = &state.config.timing;
    let max_wait = body
        .max_wait_ms
        .unwrap_or(timing.max_poll_wait_ms)
        .min(timing.max_poll_wait_ms);
    let interval = Duration::from_millis(timing.claim_poll_interval_ms);
    let deadline = tokio::time::Instant::now() + Duration::from_millis(max_wait);

    loop {
        if let Some(claimed) = state.mailbox.claim(&tunnel_id).await {
            return Json(json!({
                "requestId": claimed.id,
                "method": claimed.method,
                "path": claimed.path,
                "headers": claimed.headers,
                "body": BASE64.encode(&claimed.body),
                "isStreaming": claimed.is_streaming,
            }))
            .into_response();
        }
        if tokio::time::Instant::now() >= deadline {
            return Json(json!({"requestId": null})).into_response();
        }
        tokio::time::sleep_until(deadline.min(tokio::time::Instant::now() + interval)).await;
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondBody {
    request_id: String,
    status_code: u16,
    #[serde(default)]
    headers: HashMap<String, String>,
    /// Base64-encoded response body.
    body: Option<String>,
}

/// `POST /api/tunnels/{id}/respond` — deliver the local response for a
/// claimed non-streaming request.
pub async fn respond(
    State(state): State<AppState>,
    AxumPath(tunnel_id): AxumPath<String>,
    identity: Identity,
    Json(body): Json<RespondBody>,
) -> Response {
    if let Err(e) = state.registry.authorized(&tunnel_id, &identity).await {
        return e.into_response();
    }

    let response_body = match decode_b64(body.body.as_deref()) {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    match state
        .mailbox
        .respond(
            &body.request_id,
            &tunnel_id,
            body.status_code,
            body.headers,
            response_body,
        )
        .await
    {
        Ok(()) => Json(json!({"success": true})).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamBody {
    request_id: String,
    sequence: Option<u64>,
    /// Base64-encoded chunk payload.
    chunk: Option<String>,
    #[serde(default)]
    eof: bool,
}

/// `POST /api/tunnels/{id}/stream` — append a chunk to a streaming request,
/// or mark end-of-stream. EOF completes the request; for a streaming request
/// there is no separate respond call.
pub async fn stream(
    State(state): State<AppState>,
    AxumPath(tunnel_id): AxumPath<String>,
    identity: Identity,
    Json(body): Json<StreamBody>,
) -> Response {
    if let Err(e) = state.registry.authorized(&tunnel_id, &identity).await {
        return e.into_response();
    }

    if body.eof {
        return match state.mailbox.complete_stream(&body.request_id, &tunnel_id).await {
            Ok(()) => Json(json!({"success": true})).into_response(),
            Err(e) => e.into_response(),
        };
    }

    let (Some(sequence), Some(chunk)) = (body.sequence, body.chunk.as_deref()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Either eof or both sequence and chunk are required"})),
        )
            .into_response();
    };
    let data = match decode_b64(Some(chunk)) {
        Ok(d) => d,
        Err(resp) => return resp,
    };

    // Appends are only accepted while the request is claimed; a request the
    // gateway already failed rejects stragglers here.
    if let Err(e) = state
        .mailbox
        .verify_in_flight(&body.request_id, &tunnel_id)
        .await
    {
        return e.into_response();
    }
    state.streams.append(&body.request_id, sequence, data).await;
    Json(json!({"success": true})).into_response()
}

/// `GET /api/tunnels` — the caller's active tunnels, newest first.
pub async fn list(State(state): State<AppState>, identity: Identity) -> Response {
    let Some(owner_id) = identity.owner_id else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Missing or invalid Authorization header"})),
        )
            .into_response();
    };

    let tunnels = state.registry.list_active(&owner_id).await;
    let list: Vec<Value> = tunnels
        .iter()
        .map(|t| {
            json!({
                "id": t.id,
                "targetUrl": t.target_url,
                "createdAt": t.created_at_ms,
                "lastSeenAt": t.last_seen_at_ms,
                "isActive": t.active,
            })
        })
        .collect();
    Json(json!(list)).into_response()
}

/// `DELETE /api/tunnels/{id}` — deactivate a tunnel. Subsequent polls get 410.
pub async fn deactivate(
    State(state): State<AppState>,
    AxumPath(tunnel_id): AxumPath<String>,
    identity: Identity,
) -> Response {
    match state.registry.deactivate(&tunnel_id, &identity).await {
        Ok(()) => Json(json!({"success": true})).into_response(),
        Err(e) => e.into_response(),
    }
}

fn decode_b64(encoded: Option<&str>) -> Result<Vec<u8>, Response> {
    match encoded {
        None => Ok(Vec::new()),
        Some(s) => BASE64.decode(s).map_err(|_| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Invalid base64 payload"})),
            )
                .into_response()
        }),
    }
}
