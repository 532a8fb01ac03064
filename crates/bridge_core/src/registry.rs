use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use shared::domain::{ConversationKey, RemoteId, RoomId};
use storage::{ConversationRecord, Storage};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub type SharedConversation = Arc<Mutex<ConversationRecord>>;

/// Process-wide cache of bridged conversations keyed by (chat, receiver).
pub struct ConversationRegistry {
    storage: Storage,
    entries: Mutex<HashMap<ConversationKey, SharedConversation>>,
}

impl ConversationRegistry {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_create(&self, key: &ConversationKey) -> Result<SharedConversation> {
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(key) {
            return Ok(Arc::clone(existing));
        }

        let record = match self.storage.get_conversation(key).await? {
            Some(record) => record,
            None => {
                let record = ConversationRecord::new(key.clone());
                self.storage.insert_conversation(&record).await?;
                debug!(conversation = %key, kind = record.kind.as_str(), "registry: created conversation");
                record
            }
        };
        let shared = Arc::new(Mutex::new(record));
        entries.insert(key.clone(), Arc::clone(&shared));
        Ok(shared)
    }

    pub async fn update(&self, conversation: &ConversationRecord) -> Result<()> {
        self.storage.update_conversation(conversation).await
    }

    /// Records a confirmed member. Membership only ever grows.
    pub async fn add_member(
        &self,
        conversation: &mut ConversationRecord,
        member: &RemoteId,
    ) -> Result<()> {
        self.storage
            .add_conversation_member(&conversation.key, member)
            .await?;
        conversation.members.insert(member.clone());
        Ok(())
    }

    /// Attaches the home-network room created for a conversation.
    pub async fn materialize(&self, key: &ConversationKey, room_id: RoomId) -> Result<()> {
        let conversation = self.get_or_create(key).await?;
        let mut conversation = conversation.lock().await;
        conversation.room_id = Some(room_id);
        self.update(&conversation).await?;
        info!(conversation = %key, "registry: conversation materialized");
        Ok(())
    }
}
