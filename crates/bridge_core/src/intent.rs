use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use shared::domain::{ContentUri, RoomId, UserId};

/// Writes to the home network, acting either as the bridge bot or as a
/// puppet user.
#[async_trait]
pub trait HomeIntent: Send + Sync {
    async fn set_display_name(&self, user_id: &UserId, name: &str) -> Result<()>;
    /// Uploads media as `as_user`, or as the bridge bot when `None`.
    async fn upload_media(
        &self,
        as_user: Option<&UserId>,
        data: &[u8],
        content_type: &str,
    ) -> Result<ContentUri>;
    async fn set_avatar_url(&self, user_id: &UserId, uri: Option<&ContentUri>) -> Result<()>;
    async fn set_room_name(&self, room_id: &RoomId, name: &str) -> Result<()>;
    async fn set_room_topic(&self, room_id: &RoomId, topic: &str) -> Result<()>;
    async fn set_room_avatar(&self, room_id: &RoomId, uri: Option<&ContentUri>) -> Result<()>;
    async fn ensure_joined(&self, user_id: &UserId, room_id: &RoomId) -> Result<()>;
}

pub fn avatar_hash(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

pub fn detect_content_type(data: &[u8]) -> &'static str {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
    ];

    for (magic, content_type) in SIGNATURES {
        if data.starts_with(magic) {
            return content_type;
        }
    }
    if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        return "image/webp";
    }
    "application/octet-stream"
}

#[cfg(test)]
#[path = "tests/intent_tests.rs"]
mod tests;
