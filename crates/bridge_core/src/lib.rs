use std::{sync::Arc, time::Duration};

use anyhow::Result;
use storage::Storage;

pub mod delivery;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod intent;
pub mod matrix;
pub mod provisioning;
pub mod registry;
pub mod remote;
pub mod supervisor;

pub use delivery::{Delivery, DeliveryQueues};
pub use directory::{IdentityDirectory, PuppetNaming};
pub use dispatcher::{AccountContext, DispatchOutcome, DispatchSettings, EventDispatcher};
pub use error::{ConnectError, DispatchError, ProvisioningError, SupervisorError};
pub use intent::HomeIntent;
pub use matrix::MatrixIntent;
pub use provisioning::{LinkedAccount, ProvisioningCoordinator};
pub use registry::ConversationRegistry;
pub use remote::{IncomingEventHandler, RemoteClient, UnavailableRemoteClient};
pub use supervisor::{ConnectionState, ConnectionSupervisor, RetryPolicy};

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub naming: PuppetNaming,
    pub link_wait_timeout: Duration,
    pub session_ttl: Duration,
    pub retry: RetryPolicy,
    pub dispatch: DispatchSettings,
}

impl BridgeSettings {
    pub fn new(naming: PuppetNaming) -> Self {
        Self {
            naming,
            link_wait_timeout: provisioning::DEFAULT_WAIT_TIMEOUT,
            session_ttl: provisioning::DEFAULT_SESSION_TTL,
            retry: RetryPolicy::default(),
            dispatch: DispatchSettings::default(),
        }
    }
}

/// The assembled bridge core: shared caches plus the three cooperating
/// services built on top of them.
pub struct Bridge {
    pub storage: Storage,
    pub identities: Arc<IdentityDirectory>,
    pub conversations: Arc<ConversationRegistry>,
    pub queues: Arc<DeliveryQueues>,
    pub dispatcher: Arc<EventDispatcher>,
    pub supervisor: Arc<ConnectionSupervisor>,
    pub provisioning: Arc<ProvisioningCoordinator>,
}

impl Bridge {
    pub fn new(
        storage: Storage,
        remote: Arc<dyn RemoteClient>,
        intent: Arc<dyn HomeIntent>,
        settings: BridgeSettings,
    ) -> Arc<Self> {
        let identities = Arc::new(IdentityDirectory::new(storage.clone(), settings.naming));
        let conversations = Arc::new(ConversationRegistry::new(storage.clone()));
        let queues = Arc::new(DeliveryQueues::with_capacity(
            settings.dispatch.queue_capacity,
        ));
        let dispatcher = Arc::new(EventDispatcher::new(
            storage.clone(),
            Arc::clone(&remote),
            intent,
            Arc::clone(&identities),
            Arc::clone(&conversations),
            Arc::clone(&queues),
            settings.dispatch,
        ));
        let supervisor = ConnectionSupervisor::new(
            storage.clone(),
            Arc::clone(&remote),
            Arc::clone(&dispatcher),
            Arc::clone(&identities),
            settings.retry,
        );
        let provisioning = Arc::new(ProvisioningCoordinator::new(
            storage.clone(),
            remote,
            Arc::clone(&identities),
            Arc::clone(&supervisor),
            settings.link_wait_timeout,
            settings.session_ttl,
        ));

        Arc::new(Self {
            storage,
            identities,
            conversations,
            queues,
            dispatcher,
            supervisor,
            provisioning,
        })
    }

    /// Reconnects every account that was logged in before the last shutdown.
    pub async fn start(&self) -> Result<usize> {
        self.supervisor.start_logged_in_accounts().await
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
