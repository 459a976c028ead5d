use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(ConversationId);
string_id!(PermanentId);
string_id!(ParticipantId);

/// Client-generated id carried by an optimistic record until the server
/// confirms it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProvisionalId(pub Uuid);

impl ProvisionalId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ProvisionalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tmp-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MessageId {
    Provisional(ProvisionalId),
    Permanent(PermanentId),
}

impl MessageId {
    pub fn as_permanent(&self) -> Option<&PermanentId> {
        match self {
            Self::Permanent(id) => Some(id),
            Self::Provisional(_) => None,
        }
    }

    pub fn as_provisional(&self) -> Option<ProvisionalId> {
        match self {
            Self::Provisional(id) => Some(*id),
            Self::Permanent(_) => None,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, Self::Provisional(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisional(id) => id.fmt(f),
            Self::Permanent(id) => id.fmt(f),
        }
    }
}

impl From<PermanentId> for MessageId {
    fn from(value: PermanentId) -> Self {
        Self::Permanent(value)
    }
}

impl From<ProvisionalId> for MessageId {
    fn from(value: ProvisionalId) -> Self {
        Self::Provisional(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    Customer,
    Vendor,
    Assistant,
}

impl SenderRole {
    /// Whether a record authored by `self` counts as unread for `local`.
    pub fn is_counterpart_of(self, local: SenderRole) -> bool {
        self != local
    }
}

impl fmt::Display for SenderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Customer => "customer",
            Self::Vendor => "vendor",
            Self::Assistant => "assistant",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    #[default]
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub media_type: String,
    pub byte_size: u64,
    /// Set when the upload failed and `url` only points at a local placeholder.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub local_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_role: SenderRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
    pub read: bool,
    pub generated_by_assistant: bool,
    #[serde(default)]
    pub delivery: DeliveryState,
}

impl Message {
    pub fn permanent_id(&self) -> Option<&PermanentId> {
        self.id.as_permanent()
    }

    pub fn provisional_id(&self) -> Option<ProvisionalId> {
        self.id.as_provisional()
    }

    pub fn is_provisional(&self) -> bool {
        self.id.is_provisional()
    }

    pub fn has_attachment(&self) -> bool {
        self.attachment.is_some()
    }

    pub fn is_unread_for(&self, local: SenderRole) -> bool {
        !self.read && self.sender_role.is_counterpart_of(local)
    }

    /// Short text shown in conversation lists.
    pub fn preview(&self) -> Option<String> {
        match (&self.body, &self.attachment) {
            (Some(body), _) if !body.trim().is_empty() => Some(body.clone()),
            (_, Some(attachment)) => Some(format!("[{}]", attachment.media_type)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMeta {
    pub id: ConversationId,
    #[serde(default)]
    pub participant_ids: Vec<ParticipantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_preview: Option<String>,
    #[serde(default)]
    pub unread_count: usize,
}

impl ConversationMeta {
    pub fn new(id: ConversationId) -> Self {
        Self {
            id,
            participant_ids: Vec::new(),
            last_message_at: None,
            last_message_preview: None,
            unread_count: 0,
        }
    }
}
