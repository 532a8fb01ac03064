use super::*;
use crate::test_support::*;
use anyhow::anyhow;

fn alice() -> UserId {
    UserId::from(ALICE)
}

#[test]
fn backoff_doubles_from_one_second() {
    let policy = RetryPolicy::default();
    let delays: Vec<u64> = (0..6).map(|n| policy.delay_for(n).as_secs()).collect();
    assert_eq!(delays, vec![1, 2, 4, 8, 16, 32]);
    assert_eq!(policy.max_retries, 6);
}

#[tokio::test]
async fn status_stream_maps_to_health_and_tracks_retries() {
    let h = harness().await;
    link_account(&h.storage, ALICE, ALICE_ACI).await;
    let status = h.remote.script_connection().await;
    let mut health = h.bridge.supervisor.subscribe_health();

    h.bridge.supervisor.start_managing(&alice()).await.expect("start");
    assert_eq!(next_health(&mut health).await.state_event, HealthState::Connecting);

    status.send(ConnectionStatus::Connected).await.expect("send");
    assert_eq!(next_health(&mut health).await.state_event, HealthState::Connected);

    status
        .send(ConnectionStatus::Disconnected {
            error: Some("socket reset".to_string()),
        })
        .await
        .expect("send");
    let report = next_health(&mut health).await;
    assert_eq!(report.state_event, HealthState::TransientError);
    assert_eq!(report.error.as_deref(), Some(UNKNOWN_WEBSOCKET_ERROR));
    assert_eq!(report.message.as_deref(), Some("socket reset"));
    let state = h.bridge.supervisor.connection_state(&alice()).await.expect("state");
    assert_eq!(state.retry_count, 1);

    status
        .send(ConnectionStatus::Disconnected { error: None })
        .await
        .expect("send");
    let report = next_health(&mut health).await;
    assert_eq!(report.state_event, HealthState::TransientError);
    assert_eq!(report.error, None);
    assert_eq!(
        h.bridge.supervisor.connection_state(&alice()).await.expect("state").retry_count,
        2
    );

    status.send(ConnectionStatus::Connected).await.expect("send");
    assert_eq!(next_health(&mut health).await.state_event, HealthState::Connected);
    assert_eq!(
        h.bridge.supervisor.connection_state(&alice()).await.expect("state").retry_count,
        0
    );
}

#[tokio::test]
async fn duplicate_connected_and_clean_shutdown_are_not_reported() {
    let h = harness().await;
    link_account(&h.storage, ALICE, ALICE_ACI).await;
    let status = h.remote.script_connection().await;
    let mut health = h.bridge.supervisor.subscribe_health();

    h.bridge.supervisor.start_managing(&alice()).await.expect("start");
    assert_eq!(next_health(&mut health).await.state_event, HealthState::Connecting);

    status.send(ConnectionStatus::Connected).await.expect("send");
    status.send(ConnectionStatus::Connected).await.expect("send");
    status.send(ConnectionStatus::CleanShutdown).await.expect("send");
    status
        .send(ConnectionStatus::Error {
            error: "protocol violation".to_string(),
        })
        .await
        .expect("send");

    assert_eq!(next_health(&mut health).await.state_event, HealthState::Connected);
    let report = next_health(&mut health).await;
    assert_eq!(report.state_event, HealthState::FatalError);
    assert_eq!(report.message.as_deref(), Some("protocol violation"));
}

#[tokio::test]
async fn logged_out_status_purges_keys() {
    let h = harness().await;
    link_account(&h.storage, ALICE, ALICE_ACI).await;
    let status = h.remote.script_connection().await;
    let mut health = h.bridge.supervisor.subscribe_health();

    h.bridge.supervisor.start_managing(&alice()).await.expect("start");
    next_health(&mut health).await;
    status
        .send(ConnectionStatus::LoggedOut {
            error: Some("device unlinked".to_string()),
        })
        .await
        .expect("send");

    let report = next_health(&mut health).await;
    assert_eq!(report.state_event, HealthState::BadCredentials);
    let device = h
        .storage
        .get_device(&RemoteId::from(ALICE_ACI))
        .await
        .expect("load")
        .expect("device row kept");
    assert!(!device.has_keys());
}

#[tokio::test]
async fn missing_credentials_fail_synchronously() {
    let h = harness().await;
    let mut health = h.bridge.supervisor.subscribe_health();

    let err = h
        .bridge
        .supervisor
        .start_managing(&alice())
        .await
        .expect_err("not linked");
    assert!(matches!(err, SupervisorError::NotAuthenticated));
    assert_eq!(next_health(&mut health).await.state_event, HealthState::BadCredentials);
    assert_eq!(*h.remote.connect_attempts.lock().await, 0);
}

#[tokio::test]
async fn purged_keys_fail_synchronously() {
    let h = harness().await;
    link_account(&h.storage, ALICE, ALICE_ACI).await;
    h.storage
        .clear_device_keys(&RemoteId::from(ALICE_ACI))
        .await
        .expect("purge");

    let err = h
        .bridge
        .supervisor
        .start_managing(&alice())
        .await
        .expect_err("no keys");
    assert!(matches!(err, SupervisorError::NotAuthenticated));
    assert!(!h.bridge.supervisor.is_managing(&alice()).await);
}

#[tokio::test]
async fn retries_with_backoff_then_gives_up() {
    let h = harness().await;
    link_account(&h.storage, ALICE, ALICE_ACI).await;
    for _ in 0..7 {
        h.remote
            .script_connect_error(ConnectError::Transient(anyhow!("network unreachable")))
            .await;
    }
    let mut health = h.bridge.supervisor.subscribe_health();

    h.bridge.supervisor.start_managing(&alice()).await.expect("start");

    let mut sequence = Vec::new();
    loop {
        let report = next_health(&mut health).await;
        sequence.push(report.state_event);
        if report.state_event == HealthState::FatalError {
            break;
        }
    }

    let mut expected = Vec::new();
    for _ in 0..6 {
        expected.push(HealthState::Connecting);
        expected.push(HealthState::TransientError);
    }
    expected.push(HealthState::Connecting);
    expected.push(HealthState::FatalError);
    assert_eq!(sequence, expected);
    assert_eq!(*h.remote.connect_attempts.lock().await, 7);
}

#[tokio::test]
async fn remote_not_logged_in_purges_keys_without_retrying() {
    let h = harness().await;
    link_account(&h.storage, ALICE, ALICE_ACI).await;
    h.remote.script_connect_error(ConnectError::NotAuthenticated).await;
    let mut health = h.bridge.supervisor.subscribe_health();

    h.bridge.supervisor.start_managing(&alice()).await.expect("start");

    assert_eq!(next_health(&mut health).await.state_event, HealthState::Connecting);
    assert_eq!(next_health(&mut health).await.state_event, HealthState::BadCredentials);
    assert_eq!(*h.remote.connect_attempts.lock().await, 1);
    let device = h
        .storage
        .get_device(&RemoteId::from(ALICE_ACI))
        .await
        .expect("load")
        .expect("device");
    assert!(!device.has_keys());
}

#[tokio::test]
async fn restarting_tears_down_previous_connection() {
    let h = harness().await;
    link_account(&h.storage, ALICE, ALICE_ACI).await;
    let _first = h.remote.script_connection().await;
    let _second = h.remote.script_connection().await;
    let mut health = h.bridge.supervisor.subscribe_health();

    h.bridge.supervisor.start_managing(&alice()).await.expect("first");
    assert_eq!(next_health(&mut health).await.state_event, HealthState::Connecting);
    h.bridge.supervisor.start_managing(&alice()).await.expect("second");

    assert_eq!(next_health(&mut health).await.state_event, HealthState::Disconnected);
    assert_eq!(next_health(&mut health).await.state_event, HealthState::Connecting);
    assert_eq!(
        *h.remote.disconnects.lock().await,
        vec![RemoteId::from(ALICE_ACI)]
    );
    assert!(h.bridge.supervisor.is_managing(&alice()).await);
}

#[tokio::test]
async fn stop_without_connection_is_not_connected() {
    let h = harness().await;
    let err = h
        .bridge
        .supervisor
        .stop_managing(&alice())
        .await
        .expect_err("nothing to stop");
    assert!(matches!(err, SupervisorError::NotConnected));
}

#[tokio::test]
async fn logout_disconnects_and_forgets_device() {
    let h = harness().await;
    link_account(&h.storage, ALICE, ALICE_ACI).await;
    h.bridge
        .identities
        .bind_custom_mxid(&RemoteId::from(ALICE_ACI), &alice())
        .await
        .expect("bind");
    let _status = h.remote.script_connection().await;
    h.bridge.supervisor.start_managing(&alice()).await.expect("start");

    h.bridge.supervisor.logout(&alice()).await.expect("logout");

    assert!(!h.bridge.supervisor.is_managing(&alice()).await);
    assert_eq!(*h.remote.disconnects.lock().await, vec![RemoteId::from(ALICE_ACI)]);
    assert!(h
        .storage
        .get_device(&RemoteId::from(ALICE_ACI))
        .await
        .expect("load")
        .is_none());
    assert!(h
        .bridge
        .identities
        .get_by_custom_mxid(&alice())
        .await
        .expect("lookup")
        .is_none());
    assert_eq!(
        h.bridge.supervisor.connection_state(&alice()).await.expect("state").health,
        HealthState::Disconnected
    );

    h.bridge.supervisor.logout(&alice()).await.expect("logout twice");
}

#[tokio::test]
async fn start_reconnects_logged_in_accounts() {
    let h = harness().await;
    link_account(&h.storage, ALICE, ALICE_ACI).await;
    link_account(&h.storage, "@bob:example.org", BOB_ACI).await;
    h.storage
        .get_or_create_account(&UserId::from("@carol:example.org"))
        .await
        .expect("unlinked account");
    let _a = h.remote.script_connection().await;
    let _b = h.remote.script_connection().await;

    let started = h.bridge.start().await.expect("start");

    assert_eq!(started, 2);
    assert!(h.bridge.supervisor.is_managing(&alice()).await);
    assert!(h
        .bridge
        .supervisor
        .is_managing(&UserId::from("@bob:example.org"))
        .await);
}

#[tokio::test]
async fn stop_after_giving_up_is_not_connected_and_keeps_fatal_state() {
    let h = harness().await;
    link_account(&h.storage, ALICE, ALICE_ACI).await;
    for _ in 0..7 {
        h.remote
            .script_connect_error(ConnectError::Transient(anyhow!("network unreachable")))
            .await;
    }
    let mut health = h.bridge.supervisor.subscribe_health();
    h.bridge.supervisor.start_managing(&alice()).await.expect("start");
    while next_health(&mut health).await.state_event != HealthState::FatalError {}

    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while h.bridge.supervisor.is_managing(&alice()).await {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("supervisor task ends");

    let err = h
        .bridge
        .supervisor
        .stop_managing(&alice())
        .await
        .expect_err("already given up");
    assert!(matches!(err, SupervisorError::NotConnected));
    assert!(h.remote.disconnects.lock().await.is_empty());
    assert_eq!(
        h.bridge.supervisor.connection_state(&alice()).await.expect("state").health,
        HealthState::FatalError
    );
    assert!(health.try_recv().is_err());
}
