use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{GroupId, RemoteId, UserId},
    protocol::{ConnectionStatus, IncomingEvent, ProvisioningEvent, RemoteGroup, RemoteProfile},
};
use storage::StoredDevice;
use tokio::sync::mpsc;

use crate::error::ConnectError;

/// Receives every event read from one account's remote connection, in arrival order.
#[async_trait]
pub trait IncomingEventHandler: Send + Sync {
    async fn handle_event(&self, event: IncomingEvent) -> Result<()>;
}

/// Client library for the remote network.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Begins a device-linking handshake. Progress arrives on the returned channel.
    async fn start_provisioning(
        &self,
        user_id: &UserId,
    ) -> Result<mpsc::Receiver<ProvisioningEvent>>;

    /// Opens a connection using stored device credentials. Lifecycle updates
    /// arrive on the returned channel; messages go to `handler`.
    async fn connect(
        &self,
        device: &StoredDevice,
        handler: Arc<dyn IncomingEventHandler>,
    ) -> std::result::Result<mpsc::Receiver<ConnectionStatus>, ConnectError>;

    async fn disconnect(&self, aci: &RemoteId) -> Result<()>;

    async fn fetch_profile(&self, aci: &RemoteId, target: &RemoteId) -> Result<RemoteProfile>;

    async fn fetch_group(&self, aci: &RemoteId, group_id: &GroupId) -> Result<RemoteGroup>;
}

pub struct UnavailableRemoteClient;

#[async_trait]
impl RemoteClient for UnavailableRemoteClient {
    async fn start_provisioning(
        &self,
        user_id: &UserId,
    ) -> Result<mpsc::Receiver<ProvisioningEvent>> {
        Err(anyhow!(
            "remote client unavailable; cannot link device for {user_id}"
        ))
    }

    async fn connect(
        &self,
        device: &StoredDevice,
        _handler: Arc<dyn IncomingEventHandler>,
    ) -> std::result::Result<mpsc::Receiver<ConnectionStatus>, ConnectError> {
        Err(ConnectError::Transient(anyhow!(
            "remote client unavailable; cannot connect {}",
            device.aci
        )))
    }

    async fn disconnect(&self, _aci: &RemoteId) -> Result<()> {
        Ok(())
    }

    async fn fetch_profile(&self, _aci: &RemoteId, target: &RemoteId) -> Result<RemoteProfile> {
        Err(anyhow!("remote client unavailable; cannot fetch profile {target}"))
    }

    async fn fetch_group(&self, _aci: &RemoteId, group_id: &GroupId) -> Result<RemoteGroup> {
        Err(anyhow!("remote client unavailable; cannot fetch group {group_id}"))
    }
}
