use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{
    ContentUri, ConversationId, ConversationKey, ConversationKind, RemoteId, RoomId, UserId,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// A home network user known to the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAccount {
    pub user_id: UserId,
    pub remote_id: Option<RemoteId>,
    pub remote_number: Option<String>,
    pub management_room: Option<RoomId>,
}

impl StoredAccount {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            remote_id: None,
            remote_number: None,
            management_room: None,
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.remote_id.as_ref().is_some_and(|id| !id.is_empty())
    }
}

/// Credentials of a linked remote device. `key_material` is `None` once purged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDevice {
    pub aci: RemoteId,
    pub user_id: UserId,
    pub number: String,
    pub device_id: i64,
    pub password: String,
    pub key_material: Option<Vec<u8>>,
}

impl StoredDevice {
    pub fn has_keys(&self) -> bool {
        self.key_material.as_ref().is_some_and(|keys| !keys.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityRecord {
    pub remote_id: RemoteId,
    pub number: Option<String>,
    pub name: String,
    pub name_set: bool,
    pub avatar_hash: String,
    pub avatar_url: Option<ContentUri>,
    pub avatar_set: bool,
    pub custom_mxid: Option<UserId>,
}

impl IdentityRecord {
    pub fn new(remote_id: RemoteId) -> Self {
        Self {
            remote_id,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub key: ConversationKey,
    pub kind: ConversationKind,
    pub room_id: Option<RoomId>,
    pub name: String,
    pub name_set: bool,
    pub topic: String,
    pub avatar_hash: String,
    pub avatar_url: Option<ContentUri>,
    pub avatar_set: bool,
    pub members: BTreeSet<RemoteId>,
}

impl ConversationRecord {
    pub fn new(key: ConversationKey) -> Self {
        let kind = ConversationKind::for_chat_id(&key.chat_id);
        Self {
            key,
            kind,
            room_id: None,
            name: String::new(),
            name_set: false,
            topic: String::new(),
            avatar_hash: String::new(),
            avatar_url: None,
            avatar_set: false,
            members: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub sender: RemoteId,
    pub timestamp: u64,
    pub receiver: RemoteId,
    pub chat_id: ConversationId,
    pub event_id: Option<String>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to an in-memory database is a separate database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn get_account(&self, user_id: &UserId) -> Result<Option<StoredAccount>> {
        let row = sqlx::query(
            "SELECT user_id, remote_id, remote_number, management_room FROM accounts WHERE user_id = ?",
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(account_from_row))
    }

    pub async fn get_or_create_account(&self, user_id: &UserId) -> Result<StoredAccount> {
        sqlx::query("INSERT INTO accounts (user_id) VALUES (?) ON CONFLICT(user_id) DO NOTHING")
            .bind(user_id.as_str())
            .execute(&self.pool)
            .await?;
        self.get_account(user_id)
            .await?
            .with_context(|| format!("account {user_id} vanished after insert"))
    }

    pub async fn update_account(&self, account: &StoredAccount) -> Result<()> {
        sqlx::query(
            "UPDATE accounts
             SET remote_id = ?, remote_number = ?, management_room = ?, updated_at = ?
             WHERE user_id = ?",
        )
        .bind(account.remote_id.as_ref().map(RemoteId::as_str))
        .bind(account.remote_number.as_deref())
        .bind(account.management_room.as_ref().map(RoomId::as_str))
        .bind(Utc::now())
        .bind(account.user_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_accounts(&self) -> Result<Vec<StoredAccount>> {
        let rows = sqlx::query(
            "SELECT user_id, remote_id, remote_number, management_room FROM accounts ORDER BY user_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(account_from_row).collect())
    }

    pub async fn list_logged_in_accounts(&self) -> Result<Vec<StoredAccount>> {
        let rows = sqlx::query(
            "SELECT user_id, remote_id, remote_number, management_room
             FROM accounts
             WHERE remote_id IS NOT NULL AND remote_id <> ''
             ORDER BY user_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(account_from_row).collect())
    }

    pub async fn save_device(&self, device: &StoredDevice) -> Result<()> {
        sqlx::query(
            "INSERT INTO remote_devices (aci, user_id, number, device_id, password, key_material)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(aci) DO UPDATE SET
                user_id = excluded.user_id,
                number = excluded.number,
                device_id = excluded.device_id,
                password = excluded.password,
                key_material = excluded.key_material,
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(device.aci.as_str())
        .bind(device.user_id.as_str())
        .bind(&device.number)
        .bind(device.device_id)
        .bind(&device.password)
        .bind(device.key_material.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_device(&self, aci: &RemoteId) -> Result<Option<StoredDevice>> {
        let row = sqlx::query(
            "SELECT aci, user_id, number, device_id, password, key_material
             FROM remote_devices
             WHERE aci = ?",
        )
        .bind(aci.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredDevice {
            aci: RemoteId(r.get::<String, _>(0)),
            user_id: UserId(r.get::<String, _>(1)),
            number: r.get::<String, _>(2),
            device_id: r.get::<i64, _>(3),
            password: r.get::<String, _>(4),
            key_material: r.get::<Option<Vec<u8>>, _>(5),
        }))
    }

    /// Drops the session key material but keeps the device row for diagnostics.
    pub async fn clear_device_keys(&self, aci: &RemoteId) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE remote_devices
             SET key_material = NULL, updated_at = CURRENT_TIMESTAMP
             WHERE aci = ? AND key_material IS NOT NULL",
        )
        .bind(aci.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    pub async fn delete_device(&self, aci: &RemoteId) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM remote_devices WHERE aci = ?")
            .bind(aci.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    pub async fn get_identity(&self, remote_id: &RemoteId) -> Result<Option<IdentityRecord>> {
        let row = sqlx::query(
            "SELECT remote_id, number, name, name_set, avatar_hash, avatar_url, avatar_set, custom_mxid
             FROM identities
             WHERE remote_id = ?",
        )
        .bind(remote_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(identity_from_row))
    }

    pub async fn identity_by_custom_mxid(&self, user_id: &UserId) -> Result<Option<IdentityRecord>> {
        let row = sqlx::query(
            "SELECT remote_id, number, name, name_set, avatar_hash, avatar_url, avatar_set, custom_mxid
             FROM identities
             WHERE custom_mxid = ?",
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(identity_from_row))
    }

    pub async fn list_identities(&self) -> Result<Vec<IdentityRecord>> {
        let rows = sqlx::query(
            "SELECT remote_id, number, name, name_set, avatar_hash, avatar_url, avatar_set, custom_mxid
             FROM identities
             ORDER BY remote_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(identity_from_row).collect())
    }

    pub async fn insert_identity(&self, identity: &IdentityRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO identities (remote_id, number, name, name_set, avatar_hash, avatar_url, avatar_set, custom_mxid)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(identity.remote_id.as_str())
        .bind(identity.number.as_deref())
        .bind(&identity.name)
        .bind(identity.name_set)
        .bind(&identity.avatar_hash)
        .bind(identity.avatar_url.as_ref().map(ContentUri::as_str))
        .bind(identity.avatar_set)
        .bind(identity.custom_mxid.as_ref().map(UserId::as_str))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert identity {}", identity.remote_id))?;
        Ok(())
    }

    pub async fn update_identity(&self, identity: &IdentityRecord) -> Result<()> {
        sqlx::query(
            "UPDATE identities
             SET number = ?, name = ?, name_set = ?, avatar_hash = ?, avatar_url = ?, avatar_set = ?,
                 custom_mxid = ?, updated_at = ?
             WHERE remote_id = ?",
        )
        .bind(identity.number.as_deref())
        .bind(&identity.name)
        .bind(identity.name_set)
        .bind(&identity.avatar_hash)
        .bind(identity.avatar_url.as_ref().map(ContentUri::as_str))
        .bind(identity.avatar_set)
        .bind(identity.custom_mxid.as_ref().map(UserId::as_str))
        .bind(Utc::now())
        .bind(identity.remote_id.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to update identity {}", identity.remote_id))?;
        Ok(())
    }

    pub async fn get_conversation(&self, key: &ConversationKey) -> Result<Option<ConversationRecord>> {
        let row = sqlx::query(
            "SELECT kind, room_id, name, name_set, topic, avatar_hash, avatar_url, avatar_set
             FROM conversations
             WHERE chat_id = ? AND receiver = ?",
        )
        .bind(key.chat_id.as_str())
        .bind(key.receiver.as_str())
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let members = sqlx::query(
            "SELECT remote_id FROM conversation_members WHERE chat_id = ? AND receiver = ?",
        )
        .bind(key.chat_id.as_str())
        .bind(key.receiver.as_str())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| RemoteId(r.get::<String, _>(0)))
        .collect();

        Ok(Some(ConversationRecord {
            key: key.clone(),
            kind: ConversationKind::parse(&row.get::<String, _>(0)),
            room_id: row.get::<Option<String>, _>(1).map(RoomId),
            name: row.get::<String, _>(2),
            name_set: row.get::<bool, _>(3),
            topic: row.get::<String, _>(4),
            avatar_hash: row.get::<String, _>(5),
            avatar_url: row.get::<Option<String>, _>(6).map(ContentUri),
            avatar_set: row.get::<bool, _>(7),
            members,
        }))
    }

    pub async fn insert_conversation(&self, conversation: &ConversationRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO conversations (chat_id, receiver, kind, room_id, name, name_set, topic, avatar_hash, avatar_url, avatar_set)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(conversation.key.chat_id.as_str())
        .bind(conversation.key.receiver.as_str())
        .bind(conversation.kind.as_str())
        .bind(conversation.room_id.as_ref().map(RoomId::as_str))
        .bind(&conversation.name)
        .bind(conversation.name_set)
        .bind(&conversation.topic)
        .bind(&conversation.avatar_hash)
        .bind(conversation.avatar_url.as_ref().map(ContentUri::as_str))
        .bind(conversation.avatar_set)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert conversation {}", conversation.key))?;
        for member in &conversation.members {
            self.add_conversation_member(&conversation.key, member).await?;
        }
        Ok(())
    }

    /// Persists metadata only; membership is appended through `add_conversation_member`.
    pub async fn update_conversation(&self, conversation: &ConversationRecord) -> Result<()> {
        sqlx::query(
            "UPDATE conversations
             SET room_id = ?, name = ?, name_set = ?, topic = ?, avatar_hash = ?, avatar_url = ?,
                 avatar_set = ?, updated_at = ?
             WHERE chat_id = ? AND receiver = ?",
        )
        .bind(conversation.room_id.as_ref().map(RoomId::as_str))
        .bind(&conversation.name)
        .bind(conversation.name_set)
        .bind(&conversation.topic)
        .bind(&conversation.avatar_hash)
        .bind(conversation.avatar_url.as_ref().map(ContentUri::as_str))
        .bind(conversation.avatar_set)
        .bind(Utc::now())
        .bind(conversation.key.chat_id.as_str())
        .bind(conversation.key.receiver.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to update conversation {}", conversation.key))?;
        Ok(())
    }

    pub async fn add_conversation_member(
        &self,
        key: &ConversationKey,
        remote_id: &RemoteId,
    ) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT INTO conversation_members (chat_id, receiver, remote_id)
             VALUES (?, ?, ?)
             ON CONFLICT(chat_id, receiver, remote_id) DO NOTHING",
        )
        .bind(key.chat_id.as_str())
        .bind(key.receiver.as_str())
        .bind(remote_id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(inserted > 0)
    }

    pub async fn insert_message(&self, message: &StoredMessage) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages (sender, timestamp, receiver, chat_id, event_id)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(sender, timestamp, receiver) DO UPDATE SET
                chat_id = excluded.chat_id,
                event_id = excluded.event_id",
        )
        .bind(message.sender.as_str())
        .bind(timestamp_to_i64(message.timestamp))
        .bind(message.receiver.as_str())
        .bind(message.chat_id.as_str())
        .bind(message.event_id.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Looks up a bridged message by its remote author and send timestamp.
    pub async fn find_message(
        &self,
        receiver: &RemoteId,
        sender: &RemoteId,
        timestamp: u64,
    ) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            "SELECT sender, timestamp, receiver, chat_id, event_id
             FROM messages
             WHERE receiver = ? AND sender = ? AND timestamp = ?",
        )
        .bind(receiver.as_str())
        .bind(sender.as_str())
        .bind(timestamp_to_i64(timestamp))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredMessage {
            sender: RemoteId(r.get::<String, _>(0)),
            timestamp: u64::try_from(r.get::<i64, _>(1)).unwrap_or_default(),
            receiver: RemoteId(r.get::<String, _>(2)),
            chat_id: ConversationId(r.get::<String, _>(3)),
            event_id: r.get::<Option<String>, _>(4),
        }))
    }
}

fn timestamp_to_i64(timestamp: u64) -> i64 {
    i64::try_from(timestamp).unwrap_or(i64::MAX)
}

fn account_from_row(r: SqliteRow) -> StoredAccount {
    StoredAccount {
        user_id: UserId(r.get::<String, _>(0)),
        remote_id: r.get::<Option<String>, _>(1).map(RemoteId),
        remote_number: r.get::<Option<String>, _>(2),
        management_room: r.get::<Option<String>, _>(3).map(RoomId),
    }
}

fn identity_from_row(r: SqliteRow) -> IdentityRecord {
    IdentityRecord {
        remote_id: RemoteId(r.get::<String, _>(0)),
        number: r.get::<Option<String>, _>(1),
        name: r.get::<String, _>(2),
        name_set: r.get::<bool, _>(3),
        avatar_hash: r.get::<String, _>(4),
        avatar_url: r.get::<Option<String>, _>(5).map(ContentUri),
        avatar_set: r.get::<bool, _>(6),
        custom_mxid: r.get::<Option<String>, _>(7).map(UserId),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.contains(":memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
