use shared::domain::LinkState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("Timeout waiting for provisioning response")]
    Timeout,
    #[error("unexpected provisioning state: expected {expected}, got {actual}")]
    UnexpectedState {
        expected: LinkState,
        actual: LinkState,
    },
    #[error("remote provisioning failed: {0}")]
    Remote(String),
    #[error("unknown provisioning session {0}")]
    UnknownSession(u64),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Outcome of a single attempt to open a remote connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("not logged in")]
    NotAuthenticated,
    #[error("connection failed: {0}")]
    Transient(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("not logged in")]
    NotAuthenticated,
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("delivery queue for {0} is closed")]
    QueueClosed(String),
    #[error("delivery queue for {0} is full")]
    QueueFull(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
