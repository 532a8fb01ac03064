use super::*;

fn alice() -> UserId {
    UserId::new("@alice:example.org")
}

fn device_for(user_id: &UserId, aci: &str) -> StoredDevice {
    StoredDevice {
        aci: RemoteId::new(aci),
        user_id: user_id.clone(),
        number: "+15551234567".into(),
        device_id: 2,
        password: "device-password".into(),
        key_material: Some(b"identity-and-prekeys".to_vec()),
    }
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("bridge_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("bridge.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn account_is_created_once_and_updates_persist() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let first = storage.get_or_create_account(&alice()).await.expect("account");
    assert!(!first.is_logged_in());

    let mut account = storage.get_or_create_account(&alice()).await.expect("account");
    assert_eq!(first, account);
    account.remote_id = Some(RemoteId::new("abc-123"));
    account.remote_number = Some("+15551234567".into());
    storage.update_account(&account).await.expect("update");

    let reloaded = storage
        .get_account(&alice())
        .await
        .expect("load")
        .expect("present");
    assert!(reloaded.is_logged_in());
    assert_eq!(reloaded.remote_id, Some(RemoteId::new("abc-123")));

    let logged_in = storage.list_logged_in_accounts().await.expect("list");
    assert_eq!(logged_in.len(), 1);
    storage
        .get_or_create_account(&UserId::new("@bob:example.org"))
        .await
        .expect("bob");
    assert_eq!(storage.list_accounts().await.expect("all").len(), 2);
    assert_eq!(storage.list_logged_in_accounts().await.expect("list").len(), 1);
}

#[tokio::test]
async fn device_keys_can_be_purged_then_device_deleted() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let device = device_for(&alice(), "abc-123");
    storage.save_device(&device).await.expect("save");

    let loaded = storage.get_device(&device.aci).await.expect("load").expect("present");
    assert!(loaded.has_keys());

    assert!(storage.clear_device_keys(&device.aci).await.expect("purge"));
    assert!(!storage.clear_device_keys(&device.aci).await.expect("second purge is a no-op"));
    let purged = storage.get_device(&device.aci).await.expect("load").expect("present");
    assert!(!purged.has_keys());

    assert!(storage.delete_device(&device.aci).await.expect("delete"));
    assert!(storage.get_device(&device.aci).await.expect("load").is_none());
}

#[tokio::test]
async fn identity_round_trips_through_custom_mxid_lookup() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let mut identity = IdentityRecord::new(RemoteId::new("abc-123"));
    storage.insert_identity(&identity).await.expect("insert");

    identity.name = "Alice".into();
    identity.name_set = true;
    identity.custom_mxid = Some(alice());
    storage.update_identity(&identity).await.expect("update");

    let by_mxid = storage
        .identity_by_custom_mxid(&alice())
        .await
        .expect("lookup")
        .expect("present");
    assert_eq!(by_mxid, identity);
    assert_eq!(storage.list_identities().await.expect("list").len(), 1);
}

#[tokio::test]
async fn conversation_members_are_appended_idempotently() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let key = ConversationKey::new(ConversationId::new("group-one"), RemoteId::new("abc-123"));
    let mut conversation = ConversationRecord::new(key.clone());
    assert_eq!(conversation.kind, ConversationKind::Group);
    conversation.room_id = Some(RoomId::new("!room:example.org"));
    storage.insert_conversation(&conversation).await.expect("insert");

    let member = RemoteId::new("def-456");
    assert!(storage.add_conversation_member(&key, &member).await.expect("add"));
    assert!(!storage.add_conversation_member(&key, &member).await.expect("re-add"));

    conversation.name = "Weekend plans".into();
    storage.update_conversation(&conversation).await.expect("update");

    let loaded = storage.get_conversation(&key).await.expect("load").expect("present");
    assert_eq!(loaded.name, "Weekend plans");
    assert_eq!(loaded.room_id, Some(RoomId::new("!room:example.org")));
    assert!(loaded.members.contains(&member));
    assert_eq!(loaded.members.len(), 1);
}

#[tokio::test]
async fn messages_resolve_by_sender_and_timestamp_per_receiver() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let receiver = RemoteId::new("abc-123");
    let message = StoredMessage {
        sender: RemoteId::new("def-456"),
        timestamp: 1_700_000_000_000,
        receiver: receiver.clone(),
        chat_id: ConversationId::new("group-one"),
        event_id: Some("$event".into()),
    };
    storage.insert_message(&message).await.expect("insert");

    let found = storage
        .find_message(&receiver, &message.sender, message.timestamp)
        .await
        .expect("lookup");
    assert_eq!(found, Some(message.clone()));

    let other_receiver = storage
        .find_message(&RemoteId::new("zzz"), &message.sender, message.timestamp)
        .await
        .expect("lookup");
    assert!(other_receiver.is_none());

    let wrong_timestamp = storage
        .find_message(&receiver, &message.sender, message.timestamp + 1)
        .await
        .expect("lookup");
    assert!(wrong_timestamp.is_none());
}
