//! Agent poll/respond loop — the outbound edge of the relay.
//!
//! `tunl expose <target-url>` registers a tunnel and then runs a tight
//! claim → execute-locally → respond cycle until interrupted: long-poll the
//! relay for a claimed request, replay it against the loopback target, and
//! post back either the full response or, for streaming requests, a chunk
//! sequence followed by EOF. The local service's opinion of the request is
//! none of our business — any status code is forwarded as-is; only a
//! transport-level failure synthesizes a 502.

use std::collections::HashMap;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{json, Value};
use tracing::{error, info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Settings for one expose session.
pub struct AgentConfig {
    /// Relay base URL, e.g. `https://tunl.example.com`.
    pub relay_url: String,
    /// Loopback target to replay requests against.
    pub target_url: String,
    /// Owner principal forwarded as `Authorization: Bearer`, if any.
    pub bearer: Option<String>,
}

/// Long-poll window requested from the relay.
const POLL_WAIT_MS: u64 = 25_000;
/// Outer HTTP timeout for the poll call — tolerates the server-side wait.
const POLL_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for a non-streaming local call.
const LOCAL_TIMEOUT: Duration = Duration::from_secs(25);
/// Timeout for a streaming local call (matches the gateway's 5 min ceiling).
const STREAM_TIMEOUT: Duration = Duration::from_secs(300);
/// Backoff after a failed poll call.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(2);

struct Session {
    http: reqwest::Client,
    relay_url: String,
    target_url: String,
    tunnel_id: String,
    bearer: Option<String>,
    secret_token: Option<String>,
}

impl Session {
    /// Control-API request with whichever credential this session holds.
    fn control(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, format!("{}{path}", self.relay_url));
        if let Some(bearer) = &self.bearer {
            req = req.bearer_auth(bearer);
        }
        if let Some(token) = &self.secret_token {
            req = req.header("x-tunnel-token", token);
        }
        req
    }
}

/// Register the tunnel and run the poll loop until Ctrl+C or the relay
/// reports the tunnel gone.
pub async fn run(config: AgentConfig) -> Result<(), BoxError> {
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?;

    let relay_url = config.relay_url.trim_end_matches('/').to_string();
    let target_url = config.target_url.trim_end_matches('/').to_string();

    info!("Registering tunnel for {target_url}...");
    let mut register = http
        .post(format!("{relay_url}/api/tunnels/register"))
        .json(&json!({"targetUrl": target_url}));
    if let Some(bearer) = &config.bearer {
        register = register.bearer_auth(bearer);
    }
    let response = register.send().await.map_err(|e| {
        if e.is_connect() {
            format!("Could not connect to relay at {relay_url} — is it running?")
        } else {
            e.to_string()
        }
    })?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(format!("Registration failed (HTTP {status}): {body}").into());
    }
    let registered: Value = response.json().await?;
    let tunnel_id = registered["id"]
        .as_str()
        .ok_or("Relay returned no tunnel id")?
        .to_string();

    info!("Tunnel registered");
    info!("Public URL: {}", registered["publicUrl"].as_str().unwrap_or("?"));
    info!("Tunnel ID:  {tunnel_id}");
    info!("Press Ctrl+C to stop the tunnel");

    let session = Session {
        http,
        relay_url,
        target_url,
        tunnel_id,
        bearer: config.bearer,
        secret_token: registered["secretToken"].as_str().map(ToString::to_string),
    };

    tokio::select! {
        () = poll_loop(&session) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down tunnel...");
        }
    }

    // Best-effort deactivation — the relay's idle reaper covers us if this
    // fails.
    let path = format!("/api/tunnels/{}", session.tunnel_id);
    match session
        .control(reqwest::Method::DELETE, &path)
        .timeout(Duration::from_secs(5))
        .send()
        .await
    {
        Ok(_) => info!("Tunnel deactivated"),
        Err(_) => info!("Tunnel cleanup skipped"),
    }
    Ok(())
}

/// The claim cycle. Returns only when the relay says the tunnel is gone.
async fn poll_loop(session: &Session) {
    let mut request_count: u64 = 0;
    info!("Waiting for requests...");

    loop {
        let poll = session
            .control(
                reqwest::Method::POST,
                &format!("/api/tunnels/{}/poll", session.tunnel_id),
            )
            .timeout(POLL_TIMEOUT)
            .json(&json!({"maxWaitMs": POLL_WAIT_MS}))
            .send()
            .await;

        let response = match poll {
            Ok(r) => r,
            Err(e) if e.is_timeout() => continue,
            Err(e) => {
                warn!("Poll error: {e}, retrying in {}s", POLL_RETRY_DELAY.as_secs());
                tokio::time::sleep(POLL_RETRY_DELAY).await;
                continue;
            }
        };

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            error!("Tunnel not found or expired");
            return;
        }
        if !response.status().is_success() {
            warn!(
                "Poll failed (HTTP {}), retrying in {}s",
                response.status(),
                POLL_RETRY_DELAY.as_secs()
            );
            tokio::time::sleep(POLL_RETRY_DELAY).await;
            continue;
        }

        let claimed: Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                warn!("Invalid poll response: {e}");
                tokio::time::sleep(POLL_RETRY_DELAY).await;
                continue;
            }
        };
        if claimed["requestId"].is_null() {
            // Long-poll window closed empty — go right back around.
            continue;
        }

        request_count += 1;
        let method = claimed["method"].as_str().unwrap_or("GET");
        let path = claimed["path"].as_str().unwrap_or("/");
        let is_streaming = claimed["isStreaming"].as_bool().unwrap_or(false);
        info!(
            "{method} {path}{} (#{request_count})",
            if is_streaming { " [streaming]" } else { "" }
        );

        if is_streaming {
            handle_streaming(session, &claimed).await;
        } else {
            handle_request(session, &claimed).await;
        }
    }
}

/// Replay a non-streaming request locally and post the full result back.
async fn handle_request(session: &Session, claimed: &Value) {
    let request_id = claimed["requestId"].as_str().unwrap_or("").to_string();
    let method = claimed["method"].as_str().unwrap_or("GET");
    let path = claimed["path"].as_str().unwrap_or("/");
    let body = claimed["body"]
        .as_str()
        .and_then(|b| BASE64.decode(b).ok())
        .unwrap_or_default();

    let method = reqwest::Method::from_bytes(method.as_bytes()).unwrap_or(reqwest::Method::GET);
    let result = session
        .http
        .request(method, format!("{}{path}", session.target_url))
        .headers(claimed_headers(claimed))
        .body(body)
        .timeout(LOCAL_TIMEOUT)
        .send()
        .await;

    let (status_code, headers, body) = match result {
        Ok(local) => {
            let status_code = local.status().as_u16();
            let headers: HashMap<String, String> = local
                .headers()
                .iter()
                .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
                .collect();
            let body = local.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
            info!("  -> {status_code}");
            (status_code, headers, body)
        }
        Err(e) => {
            let message = local_failure_hint(&e);
            warn!("  -> local call failed: {message}");
            let body = serde_json::to_vec(&json!({
                "error": "Bad Gateway",
                "message": message,
            }))
            .unwrap_or_default();
            let mut headers = HashMap::new();
            headers.insert("content-type".to_string(), "application/json".to_string());
            (502, headers, body)
        }
    };

    let respond = session
        .control(
            reqwest::Method::POST,
            &format!("/api/tunnels/{}/respond", session.tunnel_id),
        )
        .json(&json!({
            "requestId": request_id,
            "statusCode": status_code,
            "headers": headers,
            "body": BASE64.encode(&body),
        }))
        .send()
        .await;
    if let Err(e) = respond {
        warn!("Failed to deliver response for {request_id}: {e}");
    }
}

/// Replay a streaming request locally, forwarding each chunk with a strictly
/// increasing sequence, then mark EOF — on clean end and on error alike.
async fn handle_streaming(session: &Session, claimed: &Value) {
    let request_id = claimed["requestId"].as_str().unwrap_or("").to_string();
    let path = claimed["path"].as_str().unwrap_or("/");

    let mut headers = claimed_headers(claimed);
    headers.insert("accept", HeaderValue::from_static("text/event-stream"));

    let local = session
        .http
        .get(format!("{}{path}", session.target_url))
        .headers(headers)
        .timeout(STREAM_TIMEOUT)
        .send()
        .await;

    let local = match local {
        Ok(r) => r,
        Err(e) => {
            warn!("  -> local stream failed: {}", local_failure_hint(&e));
            send_eof(session, &request_id).await;
            return;
        }
    };

    let mut sequence: u64 = 0;
    let mut stream = local.bytes_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(data) => {
                let sent = session
                    .control(
                        reqwest::Method::POST,
                        &format!("/api/tunnels/{}/stream", session.tunnel_id),
                    )
                    .json(&json!({
                        "requestId": request_id,
                        "sequence": sequence,
                        "chunk": BASE64.encode(&data),
                    }))
                    .send()
                    .await;
                if let Err(e) = sent {
                    warn!("Stream chunk {sequence} failed: {e}");
                }
                sequence += 1;
            }
            Err(e) => {
                // Abrupt end — signalled downstream the same as a clean one.
                warn!("  -> stream read error: {e}");
                break;
            }
        }
    }

    send_eof(session, &request_id).await;
    info!("  -> stream completed ({sequence} chunks)");
}

async fn send_eof(session: &Session, request_id: &str) {
    let sent = session
        .control(
            reqwest::Method::POST,
            &format!("/api/tunnels/{}/stream", session.tunnel_id),
        )
        .json(&json!({"requestId": request_id, "eof": true}))
        .send()
        .await;
    if let Err(e) = sent {
        warn!("Failed to send EOF for {request_id}: {e}");
    }
}

/// Rebuild the claimed request's header map for the local call.
fn claimed_headers(claimed: &Value) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(map) = claimed["headers"].as_object() {
        for (key, value) in map {
            let (Ok(name), Some(Ok(value))) = (
                HeaderName::try_from(key.as_str()),
                value.as_str().map(HeaderValue::from_str),
            ) else {
                continue;
            };
            headers.insert(name, value);
        }
    }
    headers
}

fn local_failure_hint(e: &reqwest::Error) -> String {
    if e.is_connect() {
        "Connection refused - is your local server running?".to_string()
    } else if e.is_timeout() {
        "Local request timed out".to_string()
    } else {
        e.to_string()
    }
}
