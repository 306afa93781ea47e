//! End-to-end relay flows over a real listener: register, gateway forward,
//! agent claim/respond, streaming, and deactivation.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::{json, Value};

use tunl::{AppState, Config};

/// Bind an ephemeral port and serve the relay with test-friendly timings.
async fn spawn_relay() -> (String, AppState) {
    let mut config = Config::default();
    config.timing.max_poll_wait_ms = 1_000;
    config.timing.claim_poll_interval_ms = 20;
    config.timing.response_wait_ms = 500;
    config.timing.response_poll_interval_ms = 20;
    config.timing.stream_poll_interval_ms = 10;
    config.timing.stream_max_duration_ms = 5_000;
    config.limits.max_anonymous_tunnels = 10;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let base_url = format!("http://{addr}");
    config.server.public_url = base_url.clone();

    let state = AppState::new(config);
    let app = tunl::router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (base_url, state)
}

async fn register_anonymous(client: &reqwest::Client, base: &str) -> (String, String) {
    let body: Value = client
        .post(format!("{base}/api/tunnels/register"))
        .json(&json!({"targetUrl": "http://localhost:3000"}))
        .send()
        .await
        .expect("register")
        .json()
        .await
        .expect("register json");
    (
        body["id"].as_str().expect("id").to_string(),
        body["secretToken"].as_str().expect("secretToken").to_string(),
    )
}

#[tokio::test]
async fn health_reports_ok() {
    let (base, _state) = spawn_relay().await;
    let client = reqwest::Client::new();

    let body: Value = client
        .get(format!("{base}/api/health"))
        .send()
        .await
        .expect("health")
        .json()
        .await
        .expect("health json");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["tunnels_active"], 0);
}

#[tokio::test]
async fn gateway_returns_404_for_unknown_tunnel() {
    let (base, _state) = spawn_relay().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{base}/t/no-such-tunnel/whatever"))
        .send()
        .await
        .expect("gateway");
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn gateway_times_out_when_no_agent_responds() {
    let (base, _state) = spawn_relay().await;
    let client = reqwest::Client::new();
    let (id, _token) = register_anonymous(&client, &base).await;

    let response = client
        .get(format!("{base}/t/{id}/slow"))
        .send()
        .await
        .expect("gateway");
    assert_eq!(response.status(), 504);
    let body: Value = response.json().await.expect("timeout body");
    assert!(
        body["message"]
            .as_str()
            .expect("message")
            .contains("did not respond"),
        "timeout body should hint at the agent: {body}"
    );
}

#[tokio::test]
async fn request_round_trips_through_agent() {
    let (base, _state) = spawn_relay().await;
    let client = reqwest::Client::new();
    let (id, token) = register_anonymous(&client, &base).await;

    // Agent side: claim the request, check what arrived, answer 201.
    let agent = {
        let base = base.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            let claimed: Value = client
                .post(format!("{base}/api/tunnels/{id}/poll"))
                .header("x-tunnel-token", &token)
                .json(&json!({"maxWaitMs": 1000}))
                .send()
                .await
                .expect("poll")
                .json()
                .await
                .expect("poll json");
            assert_eq!(claimed["method"], "POST");
            assert_eq!(claimed["path"], "/hello?x=1");
            assert_eq!(claimed["headers"]["x-custom"], "yes");
            assert_eq!(claimed["isStreaming"], false);
            let body = BASE64
                .decode(claimed["body"].as_str().expect("body"))
                .expect("body b64");
            assert_eq!(body, b"ping");

            let ack: Value = client
                .post(format!("{base}/api/tunnels/{id}/respond"))
                .header("x-tunnel-token", &token)
                .json(&json!({
                    "requestId": claimed["requestId"],
                    "statusCode": 201,
                    "headers": {"x-answered-by": "agent", "content-type": "text/plain"},
                    "body": BASE64.encode(b"pong"),
                }))
                .send()
                .await
                .expect("respond")
                .json()
                .await
                .expect("respond json");
            assert_eq!(ack["success"], true);
        })
    };

    let response = client
        .post(format!("{base}/t/{id}/hello?x=1"))
        .header("x-custom", "yes")
        .header("x-should-not-matter", "also forwarded")
        .body("ping")
        .send()
        .await
        .expect("gateway");
    assert_eq!(response.status(), 201);
    assert_eq!(
        response.headers().get("x-answered-by").expect("header"),
        "agent"
    );
    assert_eq!(response.text().await.expect("text"), "pong");

    agent.await.expect("agent task");
}

#[tokio::test]
async fn streaming_response_delivers_chunks_in_order() {
    let (base, _state) = spawn_relay().await;
    let client = reqwest::Client::new();
    let (id, token) = register_anonymous(&client, &base).await;

    let agent = {
        let base = base.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            let claimed: Value = client
                .post(format!("{base}/api/tunnels/{id}/poll"))
                .header("x-tunnel-token", &token)
                .json(&json!({"maxWaitMs": 1000}))
                .send()
                .await
                .expect("poll")
                .json()
                .await
                .expect("poll json");
            assert_eq!(claimed["isStreaming"], true);
            let request_id = claimed["requestId"].as_str().expect("requestId");

            // Deliver out of order; the relay re-sorts by sequence.
            for (sequence, chunk) in [(1_u64, "b"), (0, "a"), (2, "c")] {
                let ack = client
                    .post(format!("{base}/api/tunnels/{id}/stream"))
                    .header("x-tunnel-token", &token)
                    .json(&json!({
                        "requestId": request_id,
                        "sequence": sequence,
                        "chunk": BASE64.encode(chunk.as_bytes()),
                    }))
                    .send()
                    .await
                    .expect("chunk");
                assert!(ack.status().is_success());
            }
            let ack = client
                .post(format!("{base}/api/tunnels/{id}/stream"))
                .header("x-tunnel-token", &token)
                .json(&json!({"requestId": request_id, "eof": true}))
                .send()
                .await
                .expect("eof");
            assert!(ack.status().is_success());
        })
    };

    let response = client
        .get(format!("{base}/t/{id}/events"))
        .header("accept", "text/event-stream")
        .send()
        .await
        .expect("gateway");
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .expect("content-type"),
        "text/event-stream"
    );
    let body = response.bytes().await.expect("stream body");
    assert_eq!(&body[..], b"abc");

    agent.await.expect("agent task");
}

#[tokio::test]
async fn deactivated_tunnel_is_gone() {
    let (base, _state) = spawn_relay().await;
    let client = reqwest::Client::new();
    let (id, token) = register_anonymous(&client, &base).await;

    let deleted = client
        .delete(format!("{base}/api/tunnels/{id}"))
        .header("x-tunnel-token", &token)
        .send()
        .await
        .expect("delete");
    assert!(deleted.status().is_success());

    let gateway = client
        .get(format!("{base}/t/{id}/anything"))
        .send()
        .await
        .expect("gateway");
    assert_eq!(gateway.status(), 410);

    let poll = client
        .post(format!("{base}/api/tunnels/{id}/poll"))
        .header("x-tunnel-token", &token)
        .json(&json!({"maxWaitMs": 100}))
        .send()
        .await
        .expect("poll");
    assert_eq!(poll.status(), 410);
}

#[tokio::test]
async fn wrong_token_is_indistinguishable_from_missing_tunnel() {
    let (base, _state) = spawn_relay().await;
    let client = reqwest::Client::new();
    let (id, _token) = register_anonymous(&client, &base).await;

    let poll = client
        .post(format!("{base}/api/tunnels/{id}/poll"))
        .header("x-tunnel-token", "not-the-right-token")
        .json(&json!({"maxWaitMs": 100}))
        .send()
        .await
        .expect("poll");
    assert_eq!(poll.status(), 404);
}

#[tokio::test]
async fn register_rejects_non_loopback_target() {
    let (base, _state) = spawn_relay().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/api/tunnels/register"))
        .json(&json!({"targetUrl": "http://example.com"}))
        .send()
        .await
        .expect("register");
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn rate_limit_rejects_excess_requests() {
    let (base, state) = spawn_relay().await;
    let client = reqwest::Client::new();
    let (id, _token) = register_anonymous(&client, &base).await;

    // Exhaust the trailing-window budget directly, then check the gateway.
    let limit = state.config.limits.requests_per_minute;
    for _ in 0..limit {
        state
            .mailbox
            .enqueue(
                &id,
                "GET".to_string(),
                "/".to_string(),
                std::collections::HashMap::new(),
                Vec::new(),
            )
            .await
            .expect("enqueue");
    }

    let response = client
        .get(format!("{base}/t/{id}/limited"))
        .timeout(Duration::from_secs(2))
        .send()
        .await
        .expect("gateway");
    assert_eq!(response.status(), 429);
}
