use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::{ConversationId, ConversationKey, ConversationKind, GroupId, RemoteId, RoomId, UserId},
    protocol::{IncomingEvent, RemoteGroup},
};
use storage::{ConversationRecord, Storage, StoredMessage};
use tracing::{debug, info, warn};

use crate::{
    delivery::{Delivery, DeliveryQueues, DEFAULT_QUEUE_CAPACITY},
    directory::{IdentityDirectory, SharedIdentity},
    error::DispatchError,
    intent::{avatar_hash, detect_content_type, HomeIntent},
    registry::{ConversationRegistry, SharedConversation},
    remote::{IncomingEventHandler, RemoteClient},
};

/// The home-network account an event stream belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountContext {
    pub user_id: UserId,
    pub remote_id: RemoteId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered(ConversationKey),
    /// No conversation could be resolved; the event was dropped.
    NotFound(String),
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    /// Mirror a direct chat peer's display name onto the conversation title.
    pub mirror_dm_names: bool,
    /// Per-conversation delivery buffer.
    pub queue_capacity: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            mirror_dm_names: true,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

pub struct EventDispatcher {
    storage: Storage,
    remote: Arc<dyn RemoteClient>,
    intent: Arc<dyn HomeIntent>,
    identities: Arc<IdentityDirectory>,
    conversations: Arc<ConversationRegistry>,
    queues: Arc<DeliveryQueues>,
    settings: DispatchSettings,
}

impl EventDispatcher {
    pub fn new(
        storage: Storage,
        remote: Arc<dyn RemoteClient>,
        intent: Arc<dyn HomeIntent>,
        identities: Arc<IdentityDirectory>,
        conversations: Arc<ConversationRegistry>,
        queues: Arc<DeliveryQueues>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            storage,
            remote,
            intent,
            identities,
            conversations,
            queues,
            settings,
        }
    }

    pub async fn dispatch(
        &self,
        account: &AccountContext,
        event: IncomingEvent,
    ) -> Result<DispatchOutcome, DispatchError> {
        let meta = event.meta().clone();
        let from_self = meta.sender == account.remote_id;

        let (mut chat_id, actor) = if from_self {
            (
                ConversationId::from(&meta.recipient),
                self.self_identity(account).await?,
            )
        } else {
            (
                ConversationId::from(&meta.sender),
                self.identities.get_or_create(&meta.sender).await?,
            )
        };

        if let Some(group_id) = &meta.group_id {
            chat_id = ConversationId::from(group_id);
        }

        if let IncomingEvent::ReadReceipt {
            original_sender,
            original_timestamp,
            ..
        } = &event
        {
            match self
                .storage
                .find_message(&account.remote_id, original_sender, *original_timestamp)
                .await?
            {
                Some(message) => chat_id = message.chat_id,
                None => {
                    let reason = format!(
                        "receipt for unknown message {original_sender}@{original_timestamp}"
                    );
                    warn!(user_id = %account.user_id, "dispatch: {reason}; dropping");
                    return Ok(DispatchOutcome::NotFound(reason));
                }
            }
        }

        if chat_id.is_empty() {
            let reason = format!("no conversation for {} event", event.kind());
            warn!(user_id = %account.user_id, sender = %meta.sender, "dispatch: {reason}; dropping");
            return Ok(DispatchOutcome::NotFound(reason));
        }

        let key = ConversationKey::new(chat_id, account.remote_id.clone());
        let conversation = self.conversations.get_or_create(&key).await?;

        if event.needs_reconciliation() {
            self.reconcile(account, &meta.group_id, from_self, &actor, &conversation)
                .await;
        }

        if let IncomingEvent::Message { .. } = &event {
            let record = StoredMessage {
                sender: meta.sender.clone(),
                timestamp: meta.timestamp,
                receiver: account.remote_id.clone(),
                chat_id: key.chat_id.clone(),
                event_id: None,
            };
            if let Err(err) = self.storage.insert_message(&record).await {
                warn!(conversation = %key, "dispatch: failed to record message: {err:#}");
            }
        }

        let actor = actor.lock().await.clone();
        debug!(conversation = %key, kind = event.kind(), "dispatch: queued event");
        self.queues
            .enqueue(Delivery {
                user_id: account.user_id.clone(),
                conversation: key.clone(),
                actor,
                event,
            })
            .await?;
        Ok(DispatchOutcome::Delivered(key))
    }

    /// Reconciliation failures never block delivery.
    async fn reconcile(
        &self,
        account: &AccountContext,
        group_id: &Option<GroupId>,
        from_self: bool,
        actor: &SharedIdentity,
        conversation: &SharedConversation,
    ) {
        if !from_self {
            if let Err(err) = self.sync_identity(account, actor).await {
                warn!(user_id = %account.user_id, "dispatch: failed to sync sender profile: {err:#}");
            }
        }

        match group_id {
            Some(group_id) => {
                if let Err(err) = self.sync_group(account, conversation, group_id).await {
                    warn!(group_id = %group_id, "dispatch: failed to sync group: {err:#}");
                }
            }
            None if !from_self && self.settings.mirror_dm_names => {
                if let Err(err) = self.mirror_direct_name(conversation, actor).await {
                    warn!(user_id = %account.user_id, "dispatch: failed to mirror direct chat name: {err:#}");
                }
            }
            None => {}
        }
    }

    async fn self_identity(&self, account: &AccountContext) -> Result<SharedIdentity> {
        if let Some(identity) = self.identities.get_by_custom_mxid(&account.user_id).await? {
            return Ok(identity);
        }
        debug!(user_id = %account.user_id, "dispatch: no double puppet bound; using account identity");
        self.identities.get_or_create(&account.remote_id).await
    }

    /// Changes are staged on a copy and only land in the cache once they are
    /// persisted. A failed avatar upload leaves the avatar for the next event.
    async fn sync_identity(&self, account: &AccountContext, identity: &SharedIdentity) -> Result<()> {
        let remote_id = identity.lock().await.remote_id.clone();
        let profile = self.remote.fetch_profile(&account.remote_id, &remote_id).await?;

        let mut identity = identity.lock().await;
        let mut next = identity.clone();
        let puppet = self.identities.naming().user_id_for(&remote_id);

        if profile.name != next.name || (!next.name_set && !profile.name.is_empty()) {
            self.intent.set_display_name(&puppet, &profile.name).await?;
            next.name = profile.name.clone();
            next.name_set = true;
        }

        match profile.avatar.as_deref().filter(|image| !image.is_empty()) {
            Some(image) => {
                let hash = avatar_hash(image);
                if hash != next.avatar_hash {
                    match self
                        .intent
                        .upload_media(Some(&puppet), image, detect_content_type(image))
                        .await
                    {
                        Ok(uri) => {
                            next.avatar_set = match self.intent.set_avatar_url(&puppet, Some(&uri)).await {
                                Ok(()) => true,
                                Err(err) => {
                                    warn!(remote_id = %remote_id, "dispatch: failed to set puppet avatar: {err:#}");
                                    false
                                }
                            };
                            next.avatar_hash = hash;
                            next.avatar_url = Some(uri);
                        }
                        Err(err) => {
                            warn!(remote_id = %remote_id, "dispatch: failed to upload puppet avatar: {err:#}");
                        }
                    }
                }
            }
            None if profile.avatar_path.is_empty() => {
                next.avatar_hash.clear();
                next.avatar_url = None;
                next.avatar_set = false;
            }
            None => {}
        }

        if next != *identity {
            self.identities.update(&next).await?;
            *identity = next;
            info!(remote_id = %remote_id, "dispatch: updated identity profile");
        }
        Ok(())
    }

    async fn sync_group(
        &self,
        account: &AccountContext,
        conversation: &SharedConversation,
        group_id: &GroupId,
    ) -> Result<()> {
        let group = self.remote.fetch_group(&account.remote_id, group_id).await?;

        let mut record = conversation.lock().await;
        let mut next = record.clone();
        self.apply_group_metadata(&mut next, &group).await;
        if next != *record {
            self.conversations.update(&next).await?;
            *record = next;
            info!(conversation = %record.key, "dispatch: updated group metadata");
        }
        self.sync_group_members(account, &mut record, &group).await
    }

    async fn apply_group_metadata(&self, record: &mut ConversationRecord, group: &RemoteGroup) {
        let room_id = record.room_id.clone();

        let materialized = room_id.is_some();
        if record.name != group.title || (materialized && !record.name_set && !group.title.is_empty()) {
            record.name = group.title.clone();
            record.name_set = match &room_id {
                Some(room_id) => pushed(self.intent.set_room_name(room_id, &record.name).await, "name", room_id),
                None => false,
            };
        }

        if record.topic != group.description {
            record.topic = group.description.clone();
            if let Some(room_id) = &room_id {
                pushed(self.intent.set_room_topic(room_id, &record.topic).await, "topic", room_id);
            }
        }

        match group.avatar.as_deref().filter(|image| !image.is_empty()) {
            Some(image) => {
                let hash = avatar_hash(image);
                if hash != record.avatar_hash {
                    match self
                        .intent
                        .upload_media(None, image, detect_content_type(image))
                        .await
                    {
                        Ok(uri) => {
                            record.avatar_set = match &room_id {
                                Some(room_id) => pushed(
                                    self.intent.set_room_avatar(room_id, Some(&uri)).await,
                                    "avatar",
                                    room_id,
                                ),
                                None => false,
                            };
                            record.avatar_hash = hash;
                            record.avatar_url = Some(uri);
                        }
                        Err(err) => {
                            warn!(conversation = %record.key, "dispatch: failed to upload group avatar: {err:#}");
                        }
                    }
                }
            }
            None if group.avatar_path.is_empty() => {
                record.avatar_hash.clear();
                record.avatar_url = None;
                record.avatar_set = false;
            }
            None => {}
        }
    }

    /// Every member gets an identity with a synced profile. Joining needs a
    /// room; members are only recorded once the join succeeded, so failures
    /// are retried on the next message.
    async fn sync_group_members(
        &self,
        account: &AccountContext,
        record: &mut ConversationRecord,
        group: &RemoteGroup,
    ) -> Result<()> {
        for member in &group.members {
            if *member == account.remote_id || record.members.contains(member) {
                continue;
            }
            let identity = self.identities.get_or_create(member).await?;
            if let Err(err) = self.sync_identity(account, &identity).await {
                warn!(remote_id = %member, "dispatch: failed to sync member profile: {err:#}");
            }

            let Some(room_id) = record.room_id.clone() else {
                continue;
            };
            let puppet = self.identities.naming().user_id_for(member);
            match self.intent.ensure_joined(&puppet, &room_id).await {
                Ok(()) => self.conversations.add_member(record, member).await?,
                Err(err) => {
                    warn!(remote_id = %member, room_id = %room_id, "dispatch: failed to join member: {err:#}");
                }
            }
        }
        Ok(())
    }

    async fn mirror_direct_name(
        &self,
        conversation: &SharedConversation,
        actor: &SharedIdentity,
    ) -> Result<()> {
        let name = actor.lock().await.name.clone();
        let mut record = conversation.lock().await;
        if record.kind != ConversationKind::Direct || name.is_empty() || record.name == name {
            return Ok(());
        }

        let mut next = record.clone();
        next.name = name;
        next.name_set = match &next.room_id {
            Some(room_id) => pushed(self.intent.set_room_name(room_id, &next.name).await, "name", room_id),
            None => false,
        };
        self.conversations.update(&next).await?;
        *record = next;
        Ok(())
    }
}

fn pushed(result: Result<()>, field: &str, room_id: &RoomId) -> bool {
    match result {
        Ok(()) => true,
        Err(err) => {
            warn!(room_id = %room_id, "dispatch: failed to set room {field}: {err:#}");
            false
        }
    }
}

/// Routes one account's incoming events into the shared dispatcher.
pub struct AccountEventHandler {
    dispatcher: Arc<EventDispatcher>,
    account: AccountContext,
}

impl AccountEventHandler {
    pub fn new(dispatcher: Arc<EventDispatcher>, account: AccountContext) -> Self {
        Self {
            dispatcher,
            account,
        }
    }
}

#[async_trait]
impl IncomingEventHandler for AccountEventHandler {
    async fn handle_event(&self, event: IncomingEvent) -> Result<()> {
        self.dispatcher
            .dispatch(&self.account, event)
            .await
            .map(|_| ())
            .map_err(anyhow::Error::from)
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
