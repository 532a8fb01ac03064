use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use shared::{
    domain::{HealthState, RemoteId, UserId},
    protocol::{BridgeState, ConnectionStatus, UNKNOWN_WEBSOCKET_ERROR},
};
use storage::{Storage, StoredAccount, StoredDevice};
use tokio::{
    sync::{broadcast, mpsc, Mutex, RwLock},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, error, info, warn};
use zeroize::Zeroize;

use crate::{
    directory::IdentityDirectory,
    dispatcher::{AccountContext, AccountEventHandler, EventDispatcher},
    error::{ConnectError, SupervisorError},
    remote::RemoteClient,
};

pub const DEFAULT_MAX_RETRIES: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Wait before attempt `retry_count + 1`: `base_delay * 2^retry_count`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(retry_count))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub user_id: UserId,
    pub health: HealthState,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

struct ManagedConnection {
    aci: RemoteId,
    task: JoinHandle<()>,
}

struct Transition {
    health: HealthState,
    error: Option<&'static str>,
    message: Option<String>,
}

impl Transition {
    fn new(health: HealthState) -> Self {
        Self {
            health,
            error: None,
            message: None,
        }
    }

    fn failed(health: HealthState, message: Option<String>) -> Self {
        Self {
            health,
            error: Some(UNKNOWN_WEBSOCKET_ERROR),
            message,
        }
    }

    fn with_message(mut self, message: Option<String>) -> Self {
        self.message = message;
        self
    }
}

/// Keeps each logged-in account's remote connection alive and publishes
/// its health. One supervisor task runs per managed account.
pub struct ConnectionSupervisor {
    storage: Storage,
    remote: Arc<dyn RemoteClient>,
    dispatcher: Arc<EventDispatcher>,
    identities: Arc<IdentityDirectory>,
    policy: RetryPolicy,
    connections: Mutex<HashMap<UserId, ManagedConnection>>,
    states: RwLock<HashMap<UserId, ConnectionState>>,
    health: broadcast::Sender<BridgeState>,
}

impl ConnectionSupervisor {
    pub fn new(
        storage: Storage,
        remote: Arc<dyn RemoteClient>,
        dispatcher: Arc<EventDispatcher>,
        identities: Arc<IdentityDirectory>,
        policy: RetryPolicy,
    ) -> Arc<Self> {
        let (health, _) = broadcast::channel(1024);
        Arc::new(Self {
            storage,
            remote,
            dispatcher,
            identities,
            policy,
            connections: Mutex::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            health,
        })
    }

    pub fn subscribe_health(&self) -> broadcast::Receiver<BridgeState> {
        self.health.subscribe()
    }

    pub async fn connection_state(&self, user_id: &UserId) -> Option<ConnectionState> {
        self.states.read().await.get(user_id).cloned()
    }

    pub async fn is_managing(&self, user_id: &UserId) -> bool {
        self.connections
            .lock()
            .await
            .get(user_id)
            .is_some_and(|managed| !managed.task.is_finished())
    }

    /// Starts supervising every account that has completed linking.
    pub async fn start_logged_in_accounts(self: &Arc<Self>) -> Result<usize> {
        let accounts = self.storage.list_logged_in_accounts().await?;
        let results = join_all(
            accounts
                .iter()
                .map(|account| self.start_managing(&account.user_id)),
        )
        .await;

        let mut started = 0;
        for (account, result) in accounts.iter().zip(results) {
            match result {
                Ok(()) => started += 1,
                Err(err) => warn!(user_id = %account.user_id, "supervisor: not starting account: {err}"),
            }
        }
        info!(started, total = accounts.len(), "supervisor: started logged-in accounts");
        Ok(started)
    }

    /// Replaces any live connection for `user_id` with a freshly supervised one.
    pub async fn start_managing(self: &Arc<Self>, user_id: &UserId) -> Result<(), SupervisorError> {
        let mut connections = self.connections.lock().await;
        if let Some(previous) = connections.remove(user_id) {
            info!(user_id = %user_id, "supervisor: replacing existing connection");
            self.teardown(user_id, previous).await;
        }

        let account = self
            .storage
            .get_account(user_id)
            .await?
            .unwrap_or_else(|| StoredAccount::new(user_id.clone()));
        let Some(aci) = account.remote_id.clone().filter(|aci| !aci.is_empty()) else {
            warn!(user_id = %user_id, "supervisor: account is not linked");
            self.report(&account, 0, Transition::new(HealthState::BadCredentials))
                .await;
            return Err(SupervisorError::NotAuthenticated);
        };

        let has_keys = self
            .storage
            .get_device(&aci)
            .await?
            .is_some_and(|device| device.has_keys());
        if !has_keys {
            warn!(user_id = %user_id, aci = %aci, "supervisor: no device credentials; purging");
            self.storage.clear_device_keys(&aci).await?;
            self.report(&account, 0, Transition::new(HealthState::BadCredentials))
                .await;
            return Err(SupervisorError::NotAuthenticated);
        }

        let supervisor = Arc::clone(self);
        let task_aci = aci.clone();
        let task = tokio::spawn(async move { supervisor.run(account, task_aci).await });
        connections.insert(user_id.clone(), ManagedConnection { aci, task });
        Ok(())
    }

    /// A supervisor task that already gave up counts as not connected, and
    /// its last reported health is left in place.
    pub async fn stop_managing(&self, user_id: &UserId) -> Result<(), SupervisorError> {
        let managed = self
            .connections
            .lock()
            .await
            .remove(user_id)
            .ok_or(SupervisorError::NotConnected)?;
        if managed.task.is_finished() {
            debug!(user_id = %user_id, "supervisor: connection already ended");
            return Err(SupervisorError::NotConnected);
        }
        self.teardown(user_id, managed).await;
        Ok(())
    }

    /// Tears down the connection and forgets the device. Succeeds even when
    /// no connection was live.
    pub async fn logout(&self, user_id: &UserId) -> Result<(), SupervisorError> {
        match self.stop_managing(user_id).await {
            Ok(()) | Err(SupervisorError::NotConnected) => {}
            Err(err) => return Err(err),
        }

        if let Some(aci) = self
            .storage
            .get_account(user_id)
            .await?
            .and_then(|account| account.remote_id)
        {
            self.storage.delete_device(&aci).await?;
        }
        self.identities.unlink_custom_mxid(user_id).await?;
        info!(user_id = %user_id, "supervisor: logged out");
        Ok(())
    }

    async fn teardown(&self, user_id: &UserId, managed: ManagedConnection) {
        if managed.task.is_finished() {
            debug!(user_id = %user_id, "supervisor: previous connection already ended");
            return;
        }
        if let Err(err) = self.remote.disconnect(&managed.aci).await {
            warn!(user_id = %user_id, "supervisor: disconnect failed: {err:#}");
        }
        managed.task.abort();
        let _ = managed.task.await;

        let account = self
            .storage
            .get_account(user_id)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| StoredAccount::new(user_id.clone()));
        self.report(&account, 0, Transition::new(HealthState::Disconnected))
            .await;
        debug!(user_id = %user_id, "supervisor: connection torn down");
    }

    async fn run(self: Arc<Self>, account: StoredAccount, aci: RemoteId) {
        let mut retry_count = 0;
        let statuses = loop {
            self.report(&account, retry_count, Transition::new(HealthState::Connecting))
                .await;
            match self.connect_once(&account, &aci).await {
                Ok(statuses) => break statuses,
                Err(ConnectError::NotAuthenticated) => {
                    warn!(user_id = %account.user_id, "supervisor: remote reports not logged in; purging keys");
                    self.purge_keys(&aci).await;
                    self.report(&account, retry_count, Transition::new(HealthState::BadCredentials))
                        .await;
                    return;
                }
                Err(ConnectError::Transient(err)) if retry_count < self.policy.max_retries => {
                    let delay = self.policy.delay_for(retry_count);
                    warn!(user_id = %account.user_id, retry_count, "supervisor: connect failed: {err:#}");
                    self.report(
                        &account,
                        retry_count,
                        Transition::failed(HealthState::TransientError, Some(err.to_string())),
                    )
                    .await;
                    debug!(
                        user_id = %account.user_id,
                        retry_in_seconds = delay.as_secs_f64(),
                        "supervisor: waiting before reconnect"
                    );
                    sleep(delay).await;
                    retry_count += 1;
                }
                Err(ConnectError::Transient(err)) => {
                    error!(user_id = %account.user_id, retry_count, "supervisor: giving up: {err:#}");
                    self.report(
                        &account,
                        retry_count,
                        Transition::failed(HealthState::FatalError, Some(err.to_string())),
                    )
                    .await;
                    return;
                }
            }
        };

        self.forward_statuses(&account, &aci, statuses, retry_count)
            .await;
    }

    async fn connect_once(
        &self,
        account: &StoredAccount,
        aci: &RemoteId,
    ) -> Result<mpsc::Receiver<ConnectionStatus>, ConnectError> {
        let mut device = match self.storage.get_device(aci).await? {
            Some(device) if device.has_keys() => device,
            _ => return Err(ConnectError::NotAuthenticated),
        };
        let handler = Arc::new(AccountEventHandler::new(
            Arc::clone(&self.dispatcher),
            AccountContext {
                user_id: account.user_id.clone(),
                remote_id: aci.clone(),
            },
        ));
        let result = self.remote.connect(&device, handler).await;
        scrub_device(&mut device);
        result
    }

    async fn forward_statuses(
        &self,
        account: &StoredAccount,
        aci: &RemoteId,
        mut statuses: mpsc::Receiver<ConnectionStatus>,
        mut retry_count: u32,
    ) {
        while let Some(status) = statuses.recv().await {
            let transition = match status {
                ConnectionStatus::Connected => {
                    retry_count = 0;
                    Transition::new(HealthState::Connected)
                }
                ConnectionStatus::Disconnected { error: None } => {
                    retry_count += 1;
                    Transition::new(HealthState::TransientError)
                }
                ConnectionStatus::Disconnected { error: Some(error) } => {
                    retry_count += 1;
                    Transition::failed(HealthState::TransientError, Some(error))
                }
                ConnectionStatus::LoggedOut { error } => {
                    self.purge_keys(aci).await;
                    Transition::new(HealthState::BadCredentials).with_message(error)
                }
                ConnectionStatus::Error { error } => {
                    Transition::failed(HealthState::FatalError, Some(error))
                }
                ConnectionStatus::CleanShutdown => {
                    debug!(user_id = %account.user_id, "supervisor: clean shutdown; no health report");
                    continue;
                }
            };
            self.report(account, retry_count, transition).await;
        }
        debug!(user_id = %account.user_id, "supervisor: status stream closed");
    }

    async fn purge_keys(&self, aci: &RemoteId) {
        if let Err(err) = self.storage.clear_device_keys(aci).await {
            error!(aci = %aci, "supervisor: failed to purge device keys: {err:#}");
        }
    }

    /// Records the new state, then publishes it. Consecutive `Connected`
    /// reports collapse into one.
    async fn report(&self, account: &StoredAccount, retry_count: u32, transition: Transition) {
        {
            let mut states = self.states.write().await;
            let state = states
                .entry(account.user_id.clone())
                .or_insert_with(|| ConnectionState {
                    user_id: account.user_id.clone(),
                    health: HealthState::Disconnected,
                    retry_count: 0,
                    last_error: None,
                });
            let duplicate =
                transition.health == HealthState::Connected && state.health == HealthState::Connected;
            state.health = transition.health;
            state.retry_count = retry_count;
            state.last_error = transition.message.clone();
            if duplicate {
                debug!(user_id = %account.user_id, "supervisor: suppressing duplicate connected report");
                return;
            }
        }

        let report = BridgeState {
            state_event: transition.health,
            user_id: account.user_id.clone(),
            remote_id: account.remote_id.clone(),
            remote_name: account.remote_number.clone(),
            error: transition.error.map(str::to_string),
            message: transition.message,
            timestamp: Utc::now(),
        };
        debug!(user_id = %account.user_id, state = ?report.state_event, "supervisor: health changed");
        let _ = self.health.send(report);
    }
}

fn scrub_device(device: &mut StoredDevice) {
    device.password.zeroize();
    if let Some(keys) = device.key_material.as_mut() {
        keys.zeroize();
    }
}

#[cfg(test)]
#[path = "tests/supervisor_tests.rs"]
mod tests;
