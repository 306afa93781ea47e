//! Request mailbox — the rendezvous between the public gateway and the agent.
//!
//! The gateway and the agent run in different processes with no direct
//! channel between them, so every request goes through this store: the
//! gateway enqueues, the agent's long-poll claims, and one side or the other
//! eventually drives the request to a terminal state. All state lives behind
//! a single mutex, which makes the `pending → in_flight` claim a locked
//! read-modify-write — two concurrent pollers can never both receive the
//! same request.
//!
//! Status machine: `pending → in_flight → completed`, or
//! `pending/in_flight → failed` on timeout. No transition leaves a terminal
//! state; a stray respond from a slow agent after the gateway gave up is
//! rejected as `NotFound`.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RelayError;
use crate::util::unix_ms;

/// Lifecycle state of a tunneled request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    InFlight,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// The agent's answer to a non-streaming request.
#[derive(Debug, Clone)]
pub struct RelayedResponse {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// A stored tunneled request.
///
/// `body` holds the full payload for live delivery to the agent;
/// `body_preview` is the size-capped audit copy that outlives delivery.
#[derive(Debug)]
pub struct TunnelRequest {
    pub id: String,
    pub tunnel_id: String,
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub body_preview: String,
    pub is_streaming: bool,
    pub status: RequestStatus,
    pub response: Option<RelayedResponse>,
    pub response_preview: String,
    pub request_bytes: usize,
    pub response_bytes: usize,
    pub created_at_ms: u64,
    pub completed_at_ms: Option<u64>,
}

/// The fields an agent needs to replay a claimed request locally.
#[derive(Debug, Clone)]
pub struct ClaimedRequest {
    pub id: String,
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub is_streaming: bool,
}

struct MailboxInner {
    requests: HashMap<String, TunnelRequest>,
    /// Per-tunnel FIFO of pending request ids. Ids whose request has since
    /// left `pending` are skipped at claim time.
    pending: HashMap<String, VecDeque<String>>,
    /// Per-tunnel enqueue timestamps (ms) for the trailing rate window.
    recent: HashMap<String, VecDeque<u64>>,
}

/// Mailbox size/rate policy, split out so tests can shrink it.
#[derive(Debug, Clone)]
pub struct MailboxLimits {
    pub max_payload_bytes: usize,
    pub stored_body_bytes: usize,
    pub requests_per_minute: usize,
}

const RATE_WINDOW_MS: u64 = 60_000;

pub struct RequestMailbox {
    inner: Mutex<MailboxInner>,
    limits: MailboxLimits,
}

/// Audit copy of a payload: kept verbatim when small, replaced with a
/// truncation marker above the stored-body cap so storage stays bounded.
fn preview(body: &[u8], cap: usize) -> String {
    if body.len() <= cap {
        String::from_utf8_lossy(body).into_owned()
    } else {
        format!("[truncated: {} bytes]", body.len())
    }
}

/// Rough wire size of a header map plus body.
fn estimate_size(headers: &HashMap<String, String>, body: &[u8]) -> usize {
    headers
        .iter()
        .map(|(k, v)| k.len() + v.len())
        .sum::<usize>()
        + body.len()
}

/// A request is streaming when the caller asked for SSE or a WebSocket
/// upgrade. Neither protocol is spoken natively — the relay just switches to
/// chunked delivery. Header keys are expected lowercased.
fn classify_streaming(headers: &HashMap<String, String>) -> bool {
    let accept = headers.get("accept").map(String::as_str).unwrap_or("");
    let upgrade = headers.get("upgrade").map(String::as_str).unwrap_or("");
    accept.to_ascii_lowercase().contains("text/event-stream")
        || upgrade.to_ascii_lowercase().contains("websocket")
}

impl RequestMailbox {
    pub fn new(limits: MailboxLimits) -> Self {
        Self {
            inner: Mutex::new(MailboxInner {
                requests: HashMap::new(),
                pending: HashMap::new(),
                recent: HashMap::new(),
            }),
            limits,
        }
    }

    /// Insert a new request at the tail of the tunnel's FIFO.
    ///
    /// Fails with `PayloadTooLarge` above the payload ceiling and
    /// `RateLimited` when the tunnel has used up its trailing-window budget.
    /// Returns the request id and whether it was classified as streaming.
    pub async fn enqueue(
        &self,
        tunnel_id: &str,
        method: String,
        path: String,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    ) -> Result<(String, bool), RelayError> {
        if estimate_size(&headers, &body) > self.limits.max_payload_bytes {
            return Err(RelayError::PayloadTooLarge);
        }

        let now = unix_ms();
        let mut inner = self.inner.lock().await;

        // Trailing window, recomputed per call — an advisory budget, not a
        // hard reservation.
        let window = inner.recent.entry(tunnel_id.to_string()).or_default();
        while window
            .front()
            .is_some_and(|&t| now.saturating_sub(t) > RATE_WINDOW_MS)
        {
            window.pop_front();
        }
        if window.len() >= self.limits.requests_per_minute {
            return Err(RelayError::RateLimited);
        }
        window.push_back(now);

        let is_streaming = classify_streaming(&headers);
        let request = TunnelRequest {
            id: Uuid::new_v4().to_string(),
            tunnel_id: tunnel_id.to_string(),
            method,
            path,
            body_preview: preview(&body, self.limits.stored_body_bytes),
            request_bytes: estimate_size(&headers, &body),
            headers,
            body,
            is_streaming,
            status: RequestStatus::Pending,
            response: None,
            response_preview: String::new(),
            response_bytes: 0,
            created_at_ms: now,
            completed_at_ms: None,
        };
        let id = request.id.clone();
        debug!(tunnel_id, request_id = %id, is_streaming, "Request enqueued");
        inner
            .pending
            .entry(tunnel_id.to_string())
            .or_default()
            .push_back(id.clone());
        inner.requests.insert(id.clone(), request);
        Ok((id, is_streaming))
    }

    /// Atomically claim the oldest pending request for `tunnel_id`, moving
    /// it to `in_flight`. Selection and transition happen under one lock
    /// hold, so concurrent claimers each receive a distinct request.
    pub async fn claim(&self, tunnel_id: &str) -> Option<ClaimedRequest> {
        let mut inner = self.inner.lock().await;
        let MailboxInner {
            requests, pending, ..
        } = &mut *inner;
        let queue = pending.get_mut(tunnel_id)?;
        while let Some(id) = queue.pop_front() {
            // The queue can hold ids that already timed out or were swept.
            let Some(request) = requests.get_mut(&id) else {
                continue;
            };
            if request.status != RequestStatus::Pending {
                continue;
            }
            request.status = RequestStatus::InFlight;
            return Some(ClaimedRequest {
                id: request.id.clone(),
                method: request.method.clone(),
                path: request.path.clone(),
                headers: request.headers.clone(),
                body: request.body.clone(),
                is_streaming: request.is_streaming,
            });
        }
        None
    }

    /// Record the agent's response and complete the request.
    ///
    /// The request must exist, belong to `tunnel_id`, and still be
    /// `in_flight` — anything else is `NotFound`, which also covers the
    /// slow-agent-after-timeout case without corrupting terminal state.
    pub async fn respond(
        &self,
        request_id: &str,
        tunnel_id: &str,
        status_code: u16,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    ) -> Result<(), RelayError> {
        if estimate_size(&headers, &body) > self.limits.max_payload_bytes {
            return Err(RelayError::PayloadTooLarge);
        }

        let mut inner = self.inner.lock().await;
        let request = inner
            .requests
            .get_mut(request_id)
            .filter(|r| r.tunnel_id == tunnel_id)
            .ok_or(RelayError::NotFound)?;
        if request.status != RequestStatus::InFlight {
            return Err(RelayError::NotFound);
        }

        let now = unix_ms();
        request.response_preview = preview(&body, self.limits.stored_body_bytes);
        request.response_bytes = estimate_size(&headers, &body);
        request.response = Some(RelayedResponse {
            status_code,
            headers,
            body,
        });
        request.status = RequestStatus::Completed;
        request.completed_at_ms = Some(now);
        info!(
            request_id,
            tunnel_id,
            status_code,
            duration_ms = now.saturating_sub(request.created_at_ms),
            "Request completed"
        );
        Ok(())
    }

    /// Current status, if the request exists.
    pub async fn status(&self, request_id: &str) -> Option<RequestStatus> {
        self.inner
            .lock()
            .await
            .requests
            .get(request_id)
            .map(|r| r.status)
    }

    /// Verify a request is a claimed streaming request of `tunnel_id` —
    /// gate for chunk appends.
    pub async fn verify_in_flight(
        &self,
        request_id: &str,
        tunnel_id: &str,
    ) -> Result<(), RelayError> {
        let inner = self.inner.lock().await;
        let request = inner
            .requests
            .get(request_id)
            .filter(|r| r.tunnel_id == tunnel_id)
            .ok_or(RelayError::NotFound)?;
        if request.status != RequestStatus::InFlight {
            return Err(RelayError::NotFound);
        }
        Ok(())
    }

    /// Complete a streaming request — EOF *is* completion; there is no
    /// conventional status/body response.
    pub async fn complete_stream(
        &self,
        request_id: &str,
        tunnel_id: &str,
    ) -> Result<(), RelayError> {
        let mut inner = self.inner.lock().await;
        let request = inner
            .requests
            .get_mut(request_id)
            .filter(|r| r.tunnel_id == tunnel_id)
            .ok_or(RelayError::NotFound)?;
        if request.status != RequestStatus::InFlight {
            return Err(RelayError::NotFound);
        }
        let now = unix_ms();
        request.status = RequestStatus::Completed;
        request.completed_at_ms = Some(now);
        info!(
            request_id,
            tunnel_id,
            duration_ms = now.saturating_sub(request.created_at_ms),
            "Stream completed"
        );
        Ok(())
    }

    /// Poll the request's status until it completes, fails, or the deadline
    /// elapses — the blocking half of the public request path.
    ///
    /// On deadline the request is transitioned to `failed`, so a late
    /// respond is rejected. Cancellation-safe: dropping the future (client
    /// disconnect) just stops the polling; the claimed request is left to
    /// complete or expire normally.
    pub async fn wait_for_response(
        &self,
        request_id: &str,
        timeout: Duration,
        interval: Duration,
    ) -> Result<RelayedResponse, RelayError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut inner = self.inner.lock().await;
                let request = inner.requests.get_mut(request_id).ok_or(RelayError::NotFound)?;
                match request.status {
                    RequestStatus::Completed => {
                        // Completed without a stored response means streaming
                        // EOF; an empty 200 stands in.
                        return Ok(request.response.clone().unwrap_or(RelayedResponse {
                            status_code: 200,
                            headers: HashMap::new(),
                            body: Vec::new(),
                        }));
                    }
                    RequestStatus::Failed => return Err(RelayError::BadGateway),
                    RequestStatus::Pending | RequestStatus::InFlight => {}
                }
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep_until(deadline.min(tokio::time::Instant::now() + interval)).await;
        }

        // Deadline elapsed — mark failed unless a response won the race.
        let mut inner = self.inner.lock().await;
        if let Some(request) = inner.requests.get_mut(request_id) {
            match request.status {
                RequestStatus::Completed => {
                    return Ok(request.response.clone().unwrap_or(RelayedResponse {
                        status_code: 200,
                        headers: HashMap::new(),
                        body: Vec::new(),
                    }));
                }
                RequestStatus::Failed => return Err(RelayError::BadGateway),
                _ => {
                    request.status = RequestStatus::Failed;
                    request.completed_at_ms = Some(unix_ms());
                    warn!(request_id, "Request timed out waiting for agent");
                }
            }
        }
        Err(RelayError::GatewayTimeout)
    }

    /// Pending requests across all tunnels (health/observability).
    pub async fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .requests
            .values()
            .filter(|r| r.status == RequestStatus::Pending)
            .count()
    }

    /// Drop requests older than `retention_secs` and prune bookkeeping.
    /// Returns the ids removed so the stream relay can drop their chunks.
    pub async fn sweep_expired(&self, retention_secs: u64) -> Vec<String> {
        let now = unix_ms();
        let cutoff = now.saturating_sub(retention_secs * 1000);
        let mut inner = self.inner.lock().await;
        let expired: Vec<String> = inner
            .requests
            .values()
            .filter(|r| r.created_at_ms < cutoff)
            .map(|r| r.id.clone())
            .collect();
        for id in &expired {
            inner.requests.remove(id);
        }
        for queue in inner.pending.values_mut() {
            queue.retain(|id| !expired.contains(id));
        }
        inner.pending.retain(|_, q| !q.is_empty());
        inner.recent.retain(|_, w| {
            w.back()
                .is_some_and(|&t| now.saturating_sub(t) <= RATE_WINDOW_MS)
        });
        if !expired.is_empty() {
            info!(count = expired.len(), "Swept expired requests");
        }
        expired
    }
}
