use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{ContentUri, GroupId, RemoteId, RoomId, UserId},
    protocol::{
        BridgeState, ConnectionStatus, ProvisioningEvent, RemoteGroup, RemoteProfile,
    },
};
use storage::{Storage, StoredAccount, StoredDevice};
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::{
    error::ConnectError,
    intent::HomeIntent,
    remote::{IncomingEventHandler, RemoteClient},
    Bridge, BridgeSettings, PuppetNaming, RetryPolicy,
};

pub(crate) const ALICE: &str = "@alice:example.org";
pub(crate) const ALICE_ACI: &str = "aaaaaaaa-0000-4000-8000-000000000001";
pub(crate) const BOB_ACI: &str = "bbbbbbbb-0000-4000-8000-000000000002";
pub(crate) const CAROL_ACI: &str = "cccccccc-0000-4000-8000-000000000003";

#[derive(Default)]
pub(crate) struct FakeRemote {
    pub provisioning: Mutex<Vec<mpsc::Sender<ProvisioningEvent>>>,
    connections: Mutex<VecDeque<Result<mpsc::Receiver<ConnectionStatus>, ConnectError>>>,
    pub connect_attempts: Mutex<u32>,
    pub handlers: Mutex<Vec<Arc<dyn IncomingEventHandler>>>,
    pub disconnects: Mutex<Vec<RemoteId>>,
    profiles: Mutex<HashMap<RemoteId, RemoteProfile>>,
    groups: Mutex<HashMap<GroupId, RemoteGroup>>,
    pub profile_fetches: Mutex<Vec<RemoteId>>,
}

impl FakeRemote {
    pub(crate) async fn provisioning_sender(&self, index: usize) -> mpsc::Sender<ProvisioningEvent> {
        self.provisioning.lock().await[index].clone()
    }

    pub(crate) async fn script_connection(&self) -> mpsc::Sender<ConnectionStatus> {
        let (tx, rx) = mpsc::channel(16);
        self.connections.lock().await.push_back(Ok(rx));
        tx
    }

    pub(crate) async fn script_connect_error(&self, err: ConnectError) {
        self.connections.lock().await.push_back(Err(err));
    }

    pub(crate) async fn set_profile(&self, remote_id: &str, profile: RemoteProfile) {
        self.profiles
            .lock()
            .await
            .insert(RemoteId::from(remote_id), profile);
    }

    pub(crate) async fn set_group(&self, group_id: &str, group: RemoteGroup) {
        self.groups.lock().await.insert(GroupId::from(group_id), group);
    }
}

#[async_trait]
impl RemoteClient for FakeRemote {
    async fn start_provisioning(
        &self,
        _user_id: &UserId,
    ) -> Result<mpsc::Receiver<ProvisioningEvent>> {
        let (tx, rx) = mpsc::channel(8);
        self.provisioning.lock().await.push(tx);
        Ok(rx)
    }

    async fn connect(
        &self,
        _device: &StoredDevice,
        handler: Arc<dyn IncomingEventHandler>,
    ) -> Result<mpsc::Receiver<ConnectionStatus>, ConnectError> {
        *self.connect_attempts.lock().await += 1;
        self.handlers.lock().await.push(handler);
        self.connections
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(ConnectError::Transient(anyhow!("no scripted connection"))))
    }

    async fn disconnect(&self, aci: &RemoteId) -> Result<()> {
        self.disconnects.lock().await.push(aci.clone());
        Ok(())
    }

    async fn fetch_profile(&self, _aci: &RemoteId, target: &RemoteId) -> Result<RemoteProfile> {
        self.profile_fetches.lock().await.push(target.clone());
        self.profiles
            .lock()
            .await
            .get(target)
            .cloned()
            .ok_or_else(|| anyhow!("profile {target} unavailable"))
    }

    async fn fetch_group(&self, _aci: &RemoteId, group_id: &GroupId) -> Result<RemoteGroup> {
        self.groups
            .lock()
            .await
            .get(group_id)
            .cloned()
            .ok_or_else(|| anyhow!("group {group_id} unavailable"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum IntentCall {
    DisplayName(UserId, String),
    Upload(Option<UserId>, String),
    AvatarUrl(UserId, Option<ContentUri>),
    RoomName(RoomId, String),
    RoomTopic(RoomId, String),
    RoomAvatar(RoomId, Option<ContentUri>),
    Join(UserId, RoomId),
}

#[derive(Default)]
pub(crate) struct FakeIntent {
    calls: Mutex<Vec<IntentCall>>,
    pub fail_joins: Mutex<bool>,
    pub fail_uploads: Mutex<bool>,
}

impl FakeIntent {
    pub(crate) async fn calls(&self) -> Vec<IntentCall> {
        self.calls.lock().await.clone()
    }

    pub(crate) async fn clear(&self) {
        self.calls.lock().await.clear();
    }
}

#[async_trait]
impl HomeIntent for FakeIntent {
    async fn set_display_name(&self, user_id: &UserId, name: &str) -> Result<()> {
        self.calls
            .lock()
            .await
            .push(IntentCall::DisplayName(user_id.clone(), name.to_string()));
        Ok(())
    }

    async fn upload_media(
        &self,
        as_user: Option<&UserId>,
        data: &[u8],
        content_type: &str,
    ) -> Result<ContentUri> {
        if *self.fail_uploads.lock().await {
            return Err(anyhow!("media repository unavailable"));
        }
        let mut calls = self.calls.lock().await;
        calls.push(IntentCall::Upload(as_user.cloned(), content_type.to_string()));
        Ok(ContentUri::new(format!("mxc://test/{}-{}", calls.len(), data.len())))
    }

    async fn set_avatar_url(&self, user_id: &UserId, uri: Option<&ContentUri>) -> Result<()> {
        self.calls
            .lock()
            .await
            .push(IntentCall::AvatarUrl(user_id.clone(), uri.cloned()));
        Ok(())
    }

    async fn set_room_name(&self, room_id: &RoomId, name: &str) -> Result<()> {
        self.calls
            .lock()
            .await
            .push(IntentCall::RoomName(room_id.clone(), name.to_string()));
        Ok(())
    }

    async fn set_room_topic(&self, room_id: &RoomId, topic: &str) -> Result<()> {
        self.calls
            .lock()
            .await
            .push(IntentCall::RoomTopic(room_id.clone(), topic.to_string()));
        Ok(())
    }

    async fn set_room_avatar(&self, room_id: &RoomId, uri: Option<&ContentUri>) -> Result<()> {
        self.calls
            .lock()
            .await
            .push(IntentCall::RoomAvatar(room_id.clone(), uri.cloned()));
        Ok(())
    }

    async fn ensure_joined(&self, user_id: &UserId, room_id: &RoomId) -> Result<()> {
        if *self.fail_joins.lock().await {
            return Err(anyhow!("join rejected"));
        }
        self.calls
            .lock()
            .await
            .push(IntentCall::Join(user_id.clone(), room_id.clone()));
        Ok(())
    }
}

pub(crate) struct Harness {
    pub bridge: Arc<Bridge>,
    pub remote: Arc<FakeRemote>,
    pub intent: Arc<FakeIntent>,
    pub storage: Storage,
}

pub(crate) fn naming() -> PuppetNaming {
    PuppetNaming {
        username_template: "signal_{userid}".to_string(),
        domain: "example.org".to_string(),
        bot_localpart: "signalbot".to_string(),
    }
}

pub(crate) fn test_settings() -> BridgeSettings {
    let mut settings = BridgeSettings::new(naming());
    settings.link_wait_timeout = Duration::from_millis(100);
    settings.retry = RetryPolicy {
        max_retries: 6,
        base_delay: Duration::from_millis(1),
    };
    settings
}

pub(crate) async fn harness_with(settings: BridgeSettings) -> Harness {
    let storage = Storage::new("sqlite::memory:").await.expect("storage");
    let remote = Arc::new(FakeRemote::default());
    let intent = Arc::new(FakeIntent::default());
    let bridge = Bridge::new(
        storage.clone(),
        Arc::clone(&remote) as Arc<dyn RemoteClient>,
        Arc::clone(&intent) as Arc<dyn HomeIntent>,
        settings,
    );
    Harness {
        bridge,
        remote,
        intent,
        storage,
    }
}

pub(crate) async fn harness() -> Harness {
    harness_with(test_settings()).await
}

/// Stores a linked account for `user_id` with usable device keys.
pub(crate) async fn link_account(storage: &Storage, user_id: &str, aci: &str) -> StoredAccount {
    let mut account = storage
        .get_or_create_account(&UserId::from(user_id))
        .await
        .expect("account");
    account.remote_id = Some(RemoteId::from(aci));
    account.remote_number = Some("+15550001".to_string());
    storage.update_account(&account).await.expect("update");
    storage
        .save_device(&StoredDevice {
            aci: RemoteId::from(aci),
            user_id: UserId::from(user_id),
            number: "+15550001".to_string(),
            device_id: 2,
            password: "secret".to_string(),
            key_material: Some(vec![7; 32]),
        })
        .await
        .expect("device");
    account
}

pub(crate) async fn next_health(rx: &mut broadcast::Receiver<BridgeState>) -> BridgeState {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("health report in time")
        .expect("health channel open")
}
