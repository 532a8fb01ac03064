use std::{sync::Arc, time::Instant};

use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRequestParts, Request, State},
    http::{request::Parts, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bridge_core::ProvisioningError;
use serde::de::DeserializeOwned;
use shared::{
    domain::UserId,
    error::ApiError,
    protocol::{LinkWaitAccountRequest, LinkWaitScanRequest, ProvisioningResponse},
};
use storage::StoredAccount;
use tracing::{debug, info, warn};

use crate::app_state::AppState;

type ApiFailure = (StatusCode, Json<ApiError>);

/// The authenticated account a provisioning request acts for.
#[derive(Debug, Clone)]
pub(crate) struct Caller {
    pub(crate) account: StoredAccount,
}

impl Caller {
    fn user_id(&self) -> &UserId {
        &self.account.user_id
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Caller {
    type Rejection = ApiFailure;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.strip_prefix("Bearer ").unwrap_or(value))
            .unwrap_or_default();
        if state.shared_secret.is_empty() || token != state.shared_secret {
            info!(path = %parts.uri.path(), "provisioning: authentication token does not match shared secret");
            return Err((
                StatusCode::FORBIDDEN,
                Json(ApiError::forbidden(
                    "Authentication token does not match shared secret",
                )),
            ));
        }

        let user_id = query_user_id(parts.uri.query())
            .filter(|user_id| !user_id.is_empty())
            .ok_or_else(|| {
                (
                    StatusCode::BAD_REQUEST,
                    Json(ApiError::bad_json("Missing user_id query parameter")),
                )
            })?;
        let account = state
            .bridge
            .storage
            .get_or_create_account(&user_id)
            .await
            .map_err(|err| {
                warn!(user_id = %user_id, "provisioning: failed to load account: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ApiError::internal("Error loading account")),
                )
            })?;
        Ok(Caller { account })
    }
}

fn query_user_id(query: Option<&str>) -> Option<UserId> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == "user_id")
        .map(|(_, value)| UserId::new(value.into_owned()))
}

pub(crate) fn provisioning_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v2/link/new", post(link_new))
        .route("/v2/link/wait/scan", post(link_wait_scan))
        .route("/v2/link/wait/account", post(link_wait_account))
        .route("/v2/logout", post(logout))
}

/// Logs every provisioning request once it has been answered.
pub(crate) async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let user_id = query_user_id(request.uri().query())
        .map(|user_id| user_id.0)
        .unwrap_or_default();
    let started = Instant::now();

    let response = next.run(request).await;

    info!(
        method = %method,
        path = %path,
        user_id = %user_id,
        elapsed_seconds = started.elapsed().as_secs_f64(),
        status = response.status().as_u16(),
        "provisioning: request handled"
    );
    response
}

/// Body-limit rejections carry the same JSON envelope as every other failure.
pub(crate) async fn json_payload_too_large(request: Request, next: Next) -> Response {
    let response = next.run(request).await;
    if response.status() != StatusCode::PAYLOAD_TOO_LARGE {
        return response;
    }
    warn!("provisioning: request body too large");
    (
        StatusCode::PAYLOAD_TOO_LARGE,
        Json(ApiError::bad_json("Request body too large")),
    )
        .into_response()
}

async fn link_new(
    State(state): State<Arc<AppState>>,
    caller: Caller,
) -> Result<Json<ProvisioningResponse>, ApiFailure> {
    let provisioning = &state.bridge.provisioning;
    let session_id = provisioning
        .start_session(caller.user_id())
        .await
        .map_err(|err| provisioning_failure(err, "Error logging in"))?;
    debug!(user_id = %caller.user_id(), session_id, "provisioning: waiting for linking url");

    let uri = provisioning
        .await_url(caller.user_id(), session_id)
        .await
        .map_err(|err| provisioning_failure(err, "Error getting provisioning URL"))?;

    Ok(Json(ProvisioningResponse {
        session_id: Some(session_id.to_string()),
        uri: Some(uri),
        ..ProvisioningResponse::status("provisioning_url_received")
    }))
}

async fn link_wait_scan(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    body: Bytes,
) -> Result<Json<ProvisioningResponse>, ApiFailure> {
    let request: LinkWaitScanRequest = decode_body(&body)?;
    let session_id = request.session_id.parse().ok_or_else(bad_json)?;

    state
        .bridge
        .provisioning
        .await_scan(caller.user_id(), session_id)
        .await
        .map_err(|err| provisioning_failure(err, "Error getting provisioning URL"))?;

    Ok(Json(ProvisioningResponse::status(
        "provisioning_data_received",
    )))
}

async fn link_wait_account(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    body: Bytes,
) -> Result<Json<ProvisioningResponse>, ApiFailure> {
    let request: LinkWaitAccountRequest = decode_body(&body)?;
    let session_id = request.session_id.parse().ok_or_else(bad_json)?;

    let linked = state
        .bridge
        .provisioning
        .await_account_ready(caller.user_id(), session_id, &request.device_name)
        .await
        .map_err(|err| provisioning_failure(err, "Error getting provisioning URL"))?;

    Ok(Json(ProvisioningResponse {
        uuid: Some(linked.uuid),
        number: Some(linked.number),
        ..ProvisioningResponse::status("prekeys_registered")
    }))
}

/// Kept for clients that call logout before relinking. The connection is
/// deliberately left running so the account can reconnect.
async fn logout(caller: Caller) -> Json<ProvisioningResponse> {
    debug!(user_id = %caller.user_id(), "provisioning: logout requested; leaving connection in place");
    Json(ProvisioningResponse::status("logged_out"))
}

fn decode_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiFailure> {
    serde_json::from_slice(body).map_err(|err| {
        warn!("provisioning: error decoding JSON body: {err}");
        bad_json()
    })
}

fn bad_json() -> ApiFailure {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError::bad_json("Error decoding JSON body")),
    )
}

fn provisioning_failure(err: ProvisioningError, context: &str) -> ApiFailure {
    let message = match &err {
        ProvisioningError::Timeout => "Timeout waiting for provisioning response",
        ProvisioningError::UnexpectedState { .. } => "Unexpected state",
        _ => context,
    };
    warn!("provisioning: {context}: {err}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError::internal(message)),
    )
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
