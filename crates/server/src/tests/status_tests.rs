use std::time::Duration;

use super::*;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use shared::domain::{HealthState, RemoteId, UserId};
use tokio::sync::mpsc;

type Captured = mpsc::UnboundedSender<(Option<String>, BridgeState)>;

async fn capture(
    State(tx): State<Captured>,
    headers: HeaderMap,
    Json(report): Json<BridgeState>,
) -> StatusCode {
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let _ = tx.send((auth, report));
    StatusCode::OK
}

fn report(user: &str, state_event: HealthState) -> BridgeState {
    BridgeState {
        state_event,
        user_id: UserId::from(user),
        remote_id: Some(RemoteId::from("aaaaaaaa-0000-4000-8000-000000000001")),
        remote_name: None,
        error: None,
        message: None,
        timestamp: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn forwards_reports_with_bearer_token() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let app = Router::new().route("/status", post(capture)).with_state(tx);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    let (reports, receiver) = broadcast::channel(8);
    let forwarder = spawn_status_forwarder(
        format!("http://{addr}/status"),
        "as-token".to_string(),
        receiver,
    );
    reports
        .send(report("@alice:example.org", HealthState::Connected))
        .expect("send");

    let (auth, received) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("report arrives")
        .expect("channel open");
    assert_eq!(auth.as_deref(), Some("Bearer as-token"));
    assert_eq!(received.state_event, HealthState::Connected);
    assert_eq!(received.user_id, UserId::from("@alice:example.org"));

    drop(reports);
    tokio::time::timeout(Duration::from_secs(5), forwarder)
        .await
        .expect("forwarder stops")
        .expect("join");
}

#[tokio::test]
async fn unreachable_endpoint_does_not_stop_forwarding() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let (reports, receiver) = broadcast::channel(8);
    let forwarder = spawn_status_forwarder(
        "http://127.0.0.1:9/status".to_string(),
        "as-token".to_string(),
        receiver,
    );
    reports
        .send(report("@bob:example.org", HealthState::TransientError))
        .expect("send");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!forwarder.is_finished());

    drop(reports);
    tokio::time::timeout(Duration::from_secs(5), forwarder)
        .await
        .expect("forwarder stops")
        .expect("join");
}
