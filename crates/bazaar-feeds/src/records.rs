//! Domain records held by the feeds.

use std::fmt;

use bazaar_sync::Record;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Public profile fields joined onto rows that reference a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Short form of a message shown above its replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyPreview {
    pub id: String,
    pub sender_id: String,
    pub body: String,
}

/// One chat message.
///
/// `sender` and `reply_to` are filled by full fetches and reply resolution;
/// pushed rows never carry them and merging a pushed row keeps them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reply_to_id: Option<String>,
    /// Provisional identifier the sender attached; echoed back by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Profile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyPreview>,
}

impl Message {
    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }

    pub fn preview(&self) -> ReplyPreview {
        ReplyPreview {
            id: self.id.clone(),
            sender_id: self.sender_id.clone(),
            body: self.body.clone(),
        }
    }

    /// Whether the reply reference still needs resolving.
    pub fn needs_reply_preview(&self) -> bool {
        self.reply_to_id.is_some() && self.reply_to.is_none()
    }
}

impl Record for Message {
    fn id(&self) -> &str {
        &self.id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn correlation(&self) -> Option<&str> {
        self.client_ref.as_deref()
    }
}

/// One notification addressed to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    /// Kind tag ("like", "comment", "connection_request", ...).
    pub kind: String,
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub post_id: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }
}

impl Record for Notification {
    fn id(&self) -> &str {
        &self.id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Like state of one watched post. `is_liked` is derived for the current user
/// and never present in pushed post rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostLikes {
    pub id: String,
    #[serde(default)]
    pub likes_count: i64,
    #[serde(default)]
    pub is_liked: bool,
    pub created_at: DateTime<Utc>,
}

impl Record for PostLikes {
    fn id(&self) -> &str {
        &self.id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Pending,
    Accepted,
    Declined,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Pending => write!(f, "pending"),
            ConnectionStatus::Accepted => write!(f, "accepted"),
            ConnectionStatus::Declined => write!(f, "declined"),
        }
    }
}

/// A connection request between two users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub id: String,
    pub requester_id: String,
    pub addressee_id: String,
    pub status: ConnectionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

impl ConnectionRequest {
    /// The user on the other side of the request from `user_id`.
    pub fn other_party(&self, user_id: &str) -> &str {
        if self.requester_id == user_id {
            &self.addressee_id
        } else {
            &self.requester_id
        }
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.requester_id == user_id || self.addressee_id == user_id
    }
}

impl Record for ConnectionRequest {
    fn id(&self) -> &str {
        &self.id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn correlation(&self) -> Option<&str> {
        self.client_ref.as_deref()
    }
}

/// One entry of the user's conversation list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub other_user_id: String,
    #[serde(default)]
    pub other_display_name: Option<String>,
    #[serde(default)]
    pub last_message: Option<String>,
    pub last_message_at: DateTime<Utc>,
    #[serde(default)]
    pub unread_count: i64,
}

impl Record for Conversation {
    fn id(&self) -> &str {
        &self.id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.last_message_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendingPost {
    pub id: String,
    pub author_id: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub likes_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedUser {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub mutual_connections: i64,
}
