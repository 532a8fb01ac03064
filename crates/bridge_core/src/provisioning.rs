use std::{collections::HashMap, sync::Arc, time::Duration};

use shared::{
    domain::{LinkState, UserId},
    protocol::ProvisioningEvent,
};
use storage::Storage;
use tokio::{
    sync::{mpsc, Mutex},
    time::{timeout, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    directory::IdentityDirectory, error::ProvisioningError, remote::RemoteClient,
    supervisor::ConnectionSupervisor,
};

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(600);

/// Identifiers of a freshly linked remote account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedAccount {
    pub uuid: String,
    pub number: String,
}

struct LinkingSession {
    owner: UserId,
    state: LinkState,
    events: Arc<Mutex<mpsc::Receiver<ProvisioningEvent>>>,
    touched_at: Instant,
}

#[derive(Default)]
struct SessionTable {
    next_id: u64,
    sessions: HashMap<u64, LinkingSession>,
}

impl SessionTable {
    fn prune_idle(&mut self, ttl: Duration) {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| session.touched_at.elapsed() < ttl);
        let pruned = before - self.sessions.len();
        if pruned > 0 {
            debug!(pruned, "provisioning: dropped idle sessions");
        }
    }
}

/// Drives device-linking handshakes. Each session walks
/// `Created -> UrlIssued -> DataReceived -> PreKeysRegistered`, with
/// `Failed` reachable from any non-terminal state.
pub struct ProvisioningCoordinator {
    storage: Storage,
    remote: Arc<dyn RemoteClient>,
    identities: Arc<IdentityDirectory>,
    supervisor: Arc<ConnectionSupervisor>,
    wait_timeout: Duration,
    session_ttl: Duration,
    table: Mutex<SessionTable>,
}

impl ProvisioningCoordinator {
    pub fn new(
        storage: Storage,
        remote: Arc<dyn RemoteClient>,
        identities: Arc<IdentityDirectory>,
        supervisor: Arc<ConnectionSupervisor>,
        wait_timeout: Duration,
        session_ttl: Duration,
    ) -> Self {
        Self {
            storage,
            remote,
            identities,
            supervisor,
            wait_timeout,
            session_ttl,
            table: Mutex::new(SessionTable::default()),
        }
    }

    /// Opens a linking session owned by `user_id`. Identifiers are handed
    /// out in call order and never reused.
    pub async fn start_session(&self, user_id: &UserId) -> Result<u64, ProvisioningError> {
        let session_id = {
            let mut table = self.table.lock().await;
            table.prune_idle(self.session_ttl);
            let session_id = table.next_id;
            table.next_id += 1;
            session_id
        };

        let events = self.remote.start_provisioning(user_id).await?;
        self.table.lock().await.sessions.insert(
            session_id,
            LinkingSession {
                owner: user_id.clone(),
                state: LinkState::Created,
                events: Arc::new(Mutex::new(events)),
                touched_at: Instant::now(),
            },
        );
        info!(user_id = %user_id, session_id, "provisioning: session started");
        Ok(session_id)
    }

    pub async fn await_url(&self, user_id: &UserId, session_id: u64) -> Result<String, ProvisioningError> {
        let event = self.advance(user_id, session_id, LinkState::UrlIssued).await?;
        Ok(event.uri.unwrap_or_default())
    }

    /// Waits for the scan and records the remote identity on the account.
    pub async fn await_scan(&self, user_id: &UserId, session_id: u64) -> Result<(), ProvisioningError> {
        let event = self
            .advance(user_id, session_id, LinkState::DataReceived)
            .await?;
        let Some(data) = event.data.filter(|data| !data.aci.is_empty()) else {
            warn!(user_id = %user_id, session_id, "provisioning: scan reported without account data");
            return Ok(());
        };

        let mut account = self.storage.get_or_create_account(user_id).await?;
        account.remote_id = Some(data.aci.clone());
        account.remote_number = Some(data.number.clone());
        self.storage.update_account(&account).await?;
        self.identities.bind_custom_mxid(&data.aci, user_id).await?;
        info!(user_id = %user_id, session_id, aci = %data.aci, "provisioning: scan accepted");
        Ok(())
    }

    /// Waits for key registration, then hands the account to the supervisor.
    pub async fn await_account_ready(
        &self,
        user_id: &UserId,
        session_id: u64,
        device_name: &str,
    ) -> Result<LinkedAccount, ProvisioningError> {
        self.advance(user_id, session_id, LinkState::PreKeysRegistered)
            .await?;

        let supervisor = Arc::clone(&self.supervisor);
        let managed_user = user_id.clone();
        tokio::spawn(async move {
            if let Err(err) = supervisor.start_managing(&managed_user).await {
                warn!(user_id = %managed_user, "provisioning: failed to start connection: {err}");
            }
        });

        let account = self.storage.get_or_create_account(user_id).await?;
        info!(user_id = %user_id, session_id, device_name, "provisioning: account ready");
        Ok(LinkedAccount {
            uuid: account.remote_id.map(|aci| aci.0).unwrap_or_default(),
            number: account.remote_number.unwrap_or_default(),
        })
    }

    /// Discards a session. Returns whether it existed.
    pub async fn invalidate_session(&self, session_id: u64) -> bool {
        let removed = self.table.lock().await.sessions.remove(&session_id).is_some();
        if removed {
            debug!(session_id, "provisioning: session invalidated");
        }
        removed
    }

    pub async fn session_state(&self, session_id: u64) -> Option<LinkState> {
        self.table
            .lock()
            .await
            .sessions
            .get(&session_id)
            .map(|session| session.state)
    }

    async fn advance(
        &self,
        user_id: &UserId,
        session_id: u64,
        target: LinkState,
    ) -> Result<ProvisioningEvent, ProvisioningError> {
        let required = predecessor(target);
        let events = {
            let mut table = self.table.lock().await;
            let session = table
                .sessions
                .get_mut(&session_id)
                .filter(|session| session.owner == *user_id)
                .ok_or(ProvisioningError::UnknownSession(session_id))?;
            if session.state != required {
                return Err(ProvisioningError::UnexpectedState {
                    expected: required,
                    actual: session.state,
                });
            }
            session.touched_at = Instant::now();
            Arc::clone(&session.events)
        };

        let received = timeout(self.wait_timeout, async {
            events.lock().await.recv().await
        })
        .await;

        let mut table = self.table.lock().await;
        let event = match received {
            Err(_) => {
                debug!(user_id = %user_id, session_id, state = %target, "provisioning: wait timed out");
                return Err(ProvisioningError::Timeout);
            }
            Ok(None) => {
                table.sessions.remove(&session_id);
                warn!(user_id = %user_id, session_id, "provisioning: remote closed the session");
                return Err(ProvisioningError::Remote(
                    "provisioning channel closed".to_string(),
                ));
            }
            Ok(Some(event)) => event,
        };

        if event.error.is_some() || event.state == LinkState::Failed {
            table.sessions.remove(&session_id);
            let message = event
                .error
                .unwrap_or_else(|| "provisioning failed".to_string());
            warn!(user_id = %user_id, session_id, "provisioning: remote failure: {message}");
            return Err(ProvisioningError::Remote(message));
        }

        if event.state != target {
            warn!(
                user_id = %user_id,
                session_id,
                expected = %target,
                actual = %event.state,
                "provisioning: unexpected state"
            );
            return Err(ProvisioningError::UnexpectedState {
                expected: target,
                actual: event.state,
            });
        }

        if target == LinkState::UrlIssued && event.uri.as_deref().unwrap_or_default().is_empty() {
            table.sessions.remove(&session_id);
            warn!(user_id = %user_id, session_id, "provisioning: remote issued no linking url");
            return Err(ProvisioningError::Remote(
                "provisioning URL missing".to_string(),
            ));
        }

        if target.is_terminal() {
            table.sessions.remove(&session_id);
        } else if let Some(session) = table.sessions.get_mut(&session_id) {
            session.state = target;
            session.touched_at = Instant::now();
        }
        Ok(event)
    }
}

fn predecessor(target: LinkState) -> LinkState {
    match target {
        LinkState::UrlIssued => LinkState::Created,
        LinkState::DataReceived => LinkState::UrlIssued,
        LinkState::PreKeysRegistered => LinkState::DataReceived,
        LinkState::Created | LinkState::Failed => LinkState::Created,
    }
}

#[cfg(test)]
#[path = "tests/provisioning_tests.rs"]
mod tests;
