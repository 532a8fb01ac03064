use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

// Home network user, e.g. `@alice:example.org`.
id_newtype!(UserId);
id_newtype!(RoomId);
id_newtype!(ContentUri);
// Remote network account identifier (ACI).
id_newtype!(RemoteId);
id_newtype!(GroupId);
id_newtype!(ConversationId);

impl From<&RemoteId> for ConversationId {
    fn from(value: &RemoteId) -> Self {
        Self(value.0.clone())
    }
}

impl From<&GroupId> for ConversationId {
    fn from(value: &GroupId) -> Self {
        Self(value.0.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    /// Direct chats are keyed by the peer's UUID; group identifiers never parse as one.
    pub fn for_chat_id(chat_id: &ConversationId) -> Self {
        if uuid::Uuid::parse_str(chat_id.as_str()).is_ok() {
            Self::Direct
        } else {
            Self::Group
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "direct" => Self::Direct,
            _ => Self::Group,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Created,
    UrlIssued,
    DataReceived,
    PreKeysRegistered,
    Failed,
}

impl LinkState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::PreKeysRegistered | Self::Failed)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Created => "created",
            Self::UrlIssued => "url_issued",
            Self::DataReceived => "data_received",
            Self::PreKeysRegistered => "prekeys_registered",
            Self::Failed => "failed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    Disconnected,
    Connecting,
    Connected,
    TransientError,
    BadCredentials,
    FatalError,
}

/// Home network key for a bridged conversation. Direct chats with the same
/// peer are distinct per receiving account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey {
    pub chat_id: ConversationId,
    pub receiver: RemoteId,
}

impl ConversationKey {
    pub fn new(chat_id: ConversationId, receiver: RemoteId) -> Self {
        Self { chat_id, receiver }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.receiver, self.chat_id)
    }
}
