use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Result};
use shared::domain::{RemoteId, UserId};
use storage::{IdentityRecord, Storage};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub type SharedIdentity = Arc<Mutex<IdentityRecord>>;

/// Maps remote identifiers to puppet user ids on the home network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PuppetNaming {
    pub username_template: String,
    pub domain: String,
    pub bot_localpart: String,
}

impl PuppetNaming {
    pub fn user_id_for(&self, remote_id: &RemoteId) -> UserId {
        let localpart = self
            .username_template
            .replace("{userid}", &remote_id.as_str().to_lowercase());
        UserId::new(format!("@{localpart}:{}", self.domain))
    }

    pub fn bot_user_id(&self) -> UserId {
        UserId::new(format!("@{}:{}", self.bot_localpart, self.domain))
    }
}

/// Process-wide cache of remote identities. Every record is handed out
/// behind its own lock so read-modify-write cycles on one identity are
/// serialized while unrelated identities proceed in parallel.
pub struct IdentityDirectory {
    storage: Storage,
    naming: PuppetNaming,
    entries: Mutex<HashMap<RemoteId, SharedIdentity>>,
}

impl IdentityDirectory {
    pub fn new(storage: Storage, naming: PuppetNaming) -> Self {
        Self {
            storage,
            naming,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn naming(&self) -> &PuppetNaming {
        &self.naming
    }

    pub async fn get_or_create(&self, remote_id: &RemoteId) -> Result<SharedIdentity> {
        if remote_id.is_empty() {
            return Err(anyhow!("cannot resolve identity for an empty remote id"));
        }

        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(remote_id) {
            return Ok(Arc::clone(existing));
        }

        let record = match self.storage.get_identity(remote_id).await? {
            Some(record) => record,
            None => {
                let record = IdentityRecord::new(remote_id.clone());
                self.storage.insert_identity(&record).await?;
                debug!(remote_id = %remote_id, "directory: created identity");
                record
            }
        };
        let shared = Arc::new(Mutex::new(record));
        entries.insert(remote_id.clone(), Arc::clone(&shared));
        Ok(shared)
    }

    /// Finds the identity a home user is double-puppeting as.
    pub async fn get_by_custom_mxid(&self, user_id: &UserId) -> Result<Option<SharedIdentity>> {
        match self.storage.identity_by_custom_mxid(user_id).await? {
            Some(record) => self.get_or_create(&record.remote_id).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn update(&self, identity: &IdentityRecord) -> Result<()> {
        self.storage.update_identity(identity).await
    }

    pub async fn bind_custom_mxid(&self, remote_id: &RemoteId, user_id: &UserId) -> Result<()> {
        if let Some(previous) = self.get_by_custom_mxid(user_id).await? {
            let mut previous = previous.lock().await;
            if previous.remote_id != *remote_id {
                previous.custom_mxid = None;
                self.update(&previous).await?;
            }
        }

        let identity = self.get_or_create(remote_id).await?;
        let mut identity = identity.lock().await;
        if identity.custom_mxid.as_ref() != Some(user_id) {
            identity.custom_mxid = Some(user_id.clone());
            self.update(&identity).await?;
            info!(remote_id = %remote_id, user_id = %user_id, "directory: bound double puppet");
        }
        Ok(())
    }

    /// Clears the double-puppet binding for `user_id`. Returns whether one existed.
    pub async fn unlink_custom_mxid(&self, user_id: &UserId) -> Result<bool> {
        let Some(identity) = self.get_by_custom_mxid(user_id).await? else {
            return Ok(false);
        };
        let mut identity = identity.lock().await;
        identity.custom_mxid = None;
        self.update(&identity).await?;
        info!(remote_id = %identity.remote_id, user_id = %user_id, "directory: unlinked double puppet");
        Ok(true)
    }
}

#[cfg(test)]
#[path = "tests/directory_tests.rs"]
mod tests;
