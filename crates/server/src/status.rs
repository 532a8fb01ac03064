use reqwest::Client;
use shared::protocol::BridgeState;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, warn};

/// Pushes every health report to the operator's status endpoint.
pub(crate) fn spawn_status_forwarder(
    endpoint: String,
    as_token: String,
    mut reports: broadcast::Receiver<BridgeState>,
) -> JoinHandle<()> {
    let http = Client::new();
    tokio::spawn(async move {
        loop {
            match reports.recv().await {
                Ok(report) => {
                    let result = http
                        .post(&endpoint)
                        .bearer_auth(&as_token)
                        .json(&report)
                        .send()
                        .await
                        .and_then(|response| response.error_for_status());
                    match result {
                        Ok(_) => debug!(user_id = %report.user_id, state = ?report.state_event, "status: report delivered"),
                        Err(err) => warn!(user_id = %report.user_id, "status: failed to deliver report: {err}"),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "status: forwarder fell behind; reports dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
#[path = "tests/status_tests.rs"]
mod tests;
