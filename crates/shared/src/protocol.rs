use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{GroupId, HealthState, LinkState, RemoteId, UserId};

/// Error code attached to health reports caused by connection failures.
pub const UNKNOWN_WEBSOCKET_ERROR: &str = "unknown-websocket-error";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningData {
    pub aci: RemoteId,
    pub number: String,
}

/// One step of a linking handshake as reported by the remote client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningEvent {
    pub state: LinkState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ProvisioningData>,
}

impl ProvisioningEvent {
    pub fn url_issued(uri: impl Into<String>) -> Self {
        Self {
            state: LinkState::UrlIssued,
            error: None,
            uri: Some(uri.into()),
            data: None,
        }
    }

    pub fn data_received(data: ProvisioningData) -> Self {
        Self {
            state: LinkState::DataReceived,
            error: None,
            uri: None,
            data: Some(data),
        }
    }

    pub fn prekeys_registered() -> Self {
        Self {
            state: LinkState::PreKeysRegistered,
            error: None,
            uri: None,
            data: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            state: LinkState::Failed,
            error: Some(error.into()),
            uri: None,
            data: None,
        }
    }
}

/// Low-level lifecycle notifications from a managed remote connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected { error: Option<String> },
    LoggedOut { error: Option<String> },
    Error { error: String },
    CleanShutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    pub sender: RemoteId,
    pub recipient: RemoteId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum IncomingEvent {
    Message {
        meta: EventMeta,
        body: String,
    },
    ReadReceipt {
        meta: EventMeta,
        original_sender: RemoteId,
        original_timestamp: u64,
    },
    TypingNotification {
        meta: EventMeta,
        is_typing: bool,
    },
}

impl IncomingEvent {
    pub fn meta(&self) -> &EventMeta {
        match self {
            Self::Message { meta, .. }
            | Self::ReadReceipt { meta, .. }
            | Self::TypingNotification { meta, .. } => meta,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::ReadReceipt { .. } => "read_receipt",
            Self::TypingNotification { .. } => "typing",
        }
    }

    /// Receipts and typing notifications never touch cached metadata.
    pub fn needs_reconciliation(&self) -> bool {
        matches!(self, Self::Message { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteProfile {
    pub name: String,
    pub avatar_path: String,
    pub avatar: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteGroup {
    pub title: String,
    pub description: String,
    pub avatar_path: String,
    pub avatar: Option<Vec<u8>>,
    pub members: Vec<RemoteId>,
}

/// Health report for one account, as consumed by operators and clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeState {
    pub state_event: HealthState,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<RemoteId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SessionIdField {
    Text(String),
    Number(u64),
}

impl SessionIdField {
    pub fn parse(&self) -> Option<u64> {
        match self {
            Self::Text(raw) => raw.trim().parse().ok(),
            Self::Number(value) => Some(*value),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkWaitScanRequest {
    pub session_id: SessionIdField,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkWaitAccountRequest {
    pub session_id: SessionIdField,
    #[serde(default)]
    pub device_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisioningResponse {
    pub success: bool,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
}

impl ProvisioningResponse {
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            success: true,
            status: status.into(),
            ..Self::default()
        }
    }
}
