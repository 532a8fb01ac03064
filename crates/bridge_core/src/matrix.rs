use std::collections::HashSet;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use shared::domain::{ContentUri, RoomId, UserId};
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use crate::intent::HomeIntent;

const CLIENT_API: [&str; 3] = ["_matrix", "client", "v3"];

#[derive(Debug, Deserialize)]
struct MatrixErrorBody {
    #[serde(default)]
    errcode: String,
    #[serde(default)]
    error: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    content_uri: ContentUri,
}

/// Application-service client for a Matrix homeserver. Puppet users are
/// registered lazily the first time they act.
pub struct MatrixIntent {
    http: Client,
    homeserver: Url,
    as_token: String,
    bot_user_id: UserId,
    registered: Mutex<HashSet<UserId>>,
}

impl MatrixIntent {
    pub fn new(homeserver_url: &str, as_token: impl Into<String>, bot_user_id: UserId) -> Result<Self> {
        let homeserver = Url::parse(homeserver_url)
            .with_context(|| format!("invalid homeserver url {homeserver_url}"))?;
        if homeserver.cannot_be_a_base() {
            return Err(anyhow!("homeserver url {homeserver_url} cannot be a base"));
        }
        Ok(Self {
            http: Client::new(),
            homeserver,
            as_token: as_token.into(),
            bot_user_id,
            registered: Mutex::new(HashSet::new()),
        })
    }

    pub fn bot_user_id(&self) -> &UserId {
        &self.bot_user_id
    }

    fn endpoint(&self, prefix: &[&str], segments: &[&str]) -> Result<Url> {
        let mut url = self.homeserver.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("homeserver url cannot be a base"))?
            .pop_if_empty()
            .extend(prefix)
            .extend(segments);
        Ok(url)
    }

    async fn send_json(
        &self,
        method: Method,
        url: Url,
        as_user: &UserId,
        body: &Value,
    ) -> Result<Value> {
        let response = self
            .http
            .request(method, url.clone())
            .bearer_auth(&self.as_token)
            .query(&[("user_id", as_user.as_str())])
            .json(body)
            .send()
            .await
            .with_context(|| format!("request to {} failed", url.path()))?;
        Self::read_response(response).await
    }

    async fn read_response(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<Value>().await.unwrap_or(Value::Null));
        }
        let body = response.json::<MatrixErrorBody>().await.ok();
        Err(MatrixRequestError {
            status,
            errcode: body.as_ref().map(|b| b.errcode.clone()).unwrap_or_default(),
            message: body.map(|b| b.error).unwrap_or_default(),
        }
        .into())
    }

    async fn ensure_registered(&self, user_id: &UserId) -> Result<()> {
        if *user_id == self.bot_user_id || self.registered.lock().await.contains(user_id) {
            return Ok(());
        }
        let localpart = user_id
            .as_str()
            .trim_start_matches('@')
            .split(':')
            .next()
            .unwrap_or_default()
            .to_string();
        let url = self.endpoint(&CLIENT_API, &["register"])?;
        let body = json!({ "type": "m.login.application_service", "username": localpart });
        match self.send_json(Method::POST, url, &self.bot_user_id, &body).await {
            Ok(_) => info!(user_id = %user_id, "matrix: registered puppet user"),
            Err(err) if MatrixRequestError::has_code(&err, "M_USER_IN_USE") => {
                debug!(user_id = %user_id, "matrix: puppet user already registered");
            }
            Err(err) => return Err(err),
        }
        self.registered.lock().await.insert(user_id.clone());
        Ok(())
    }

    async fn put_room_state(&self, room_id: &RoomId, event_type: &str, content: Value) -> Result<()> {
        let url = self.endpoint(&CLIENT_API, &["rooms", room_id.as_str(), "state", event_type, ""])?;
        self.send_json(Method::PUT, url, &self.bot_user_id, &content)
            .await
            .map(|_| ())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("homeserver returned {status} {errcode}: {message}")]
pub struct MatrixRequestError {
    pub status: StatusCode,
    pub errcode: String,
    pub message: String,
}

impl MatrixRequestError {
    fn has_code(err: &anyhow::Error, errcode: &str) -> bool {
        err.downcast_ref::<Self>()
            .is_some_and(|matrix| matrix.errcode == errcode)
    }

    fn is_already_joined(err: &anyhow::Error) -> bool {
        err.downcast_ref::<Self>()
            .is_some_and(|matrix| matrix.message.contains("is already in the room"))
    }
}

#[async_trait]
impl HomeIntent for MatrixIntent {
    async fn set_display_name(&self, user_id: &UserId, name: &str) -> Result<()> {
        self.ensure_registered(user_id).await?;
        let url = self.endpoint(&CLIENT_API, &["profile", user_id.as_str(), "displayname"])?;
        self.send_json(Method::PUT, url, user_id, &json!({ "displayname": name }))
            .await
            .map(|_| ())
    }

    async fn upload_media(
        &self,
        as_user: Option<&UserId>,
        data: &[u8],
        content_type: &str,
    ) -> Result<ContentUri> {
        let as_user = as_user.unwrap_or(&self.bot_user_id);
        self.ensure_registered(as_user).await?;
        let url = self.endpoint(&["_matrix", "media", "v3"], &["upload"])?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.as_token)
            .query(&[("user_id", as_user.as_str())])
            .header(CONTENT_TYPE, content_type)
            .body(data.to_vec())
            .send()
            .await
            .context("media upload request failed")?;
        let value = Self::read_response(response).await?;
        let upload: UploadResponse =
            serde_json::from_value(value).context("invalid media upload response")?;
        Ok(upload.content_uri)
    }

    async fn set_avatar_url(&self, user_id: &UserId, uri: Option<&ContentUri>) -> Result<()> {
        self.ensure_registered(user_id).await?;
        let url = self.endpoint(&CLIENT_API, &["profile", user_id.as_str(), "avatar_url"])?;
        let avatar_url = uri.map(ContentUri::as_str).unwrap_or_default();
        self.send_json(Method::PUT, url, user_id, &json!({ "avatar_url": avatar_url }))
            .await
            .map(|_| ())
    }

    async fn set_room_name(&self, room_id: &RoomId, name: &str) -> Result<()> {
        self.put_room_state(room_id, "m.room.name", json!({ "name": name }))
            .await
    }

    async fn set_room_topic(&self, room_id: &RoomId, topic: &str) -> Result<()> {
        self.put_room_state(room_id, "m.room.topic", json!({ "topic": topic }))
            .await
    }

    async fn set_room_avatar(&self, room_id: &RoomId, uri: Option<&ContentUri>) -> Result<()> {
        let content = match uri {
            Some(uri) => json!({ "url": uri }),
            None => json!({}),
        };
        self.put_room_state(room_id, "m.room.avatar", content).await
    }

    async fn ensure_joined(&self, user_id: &UserId, room_id: &RoomId) -> Result<()> {
        self.ensure_registered(user_id).await?;
        if *user_id != self.bot_user_id {
            let url = self.endpoint(&CLIENT_API, &["rooms", room_id.as_str(), "invite"])?;
            let body = json!({ "user_id": user_id });
            match self.send_json(Method::POST, url, &self.bot_user_id, &body).await {
                Ok(_) => {}
                Err(err) if MatrixRequestError::is_already_joined(&err) => {}
                Err(err) => return Err(err.context(format!("failed to invite {user_id}"))),
            }
        }
        let url = self.endpoint(&CLIENT_API, &["join", room_id.as_str()])?;
        self.send_json(Method::POST, url, user_id, &json!({}))
            .await
            .with_context(|| format!("failed to join {user_id} to {room_id}"))?;
        debug!(user_id = %user_id, room_id = %room_id, "matrix: ensured room membership");
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/matrix_tests.rs"]
mod tests;
