use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{Attachment, ConversationId, ConversationMeta, ParticipantId, PermanentId, SenderRole},
    error::ApiError,
};

/// Frames sent by the client over the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    JoinRoom {
        conversation_id: ConversationId,
    },
    LeaveRoom {
        conversation_id: ConversationId,
    },
    Typing {
        conversation_id: ConversationId,
        is_typing: bool,
    },
}

/// Server-side record of a confirmed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: PermanentId,
    pub conversation_id: ConversationId,
    pub sender_role: SenderRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub generated_by_assistant: bool,
    /// Idempotency key of the originating send, echoed verbatim when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
}

/// Events delivered by the server over the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageCreated {
        message: MessagePayload,
    },
    MessagesRead {
        conversation_id: ConversationId,
        message_ids: Vec<PermanentId>,
    },
    Typing {
        conversation_id: ConversationId,
        participant_id: ParticipantId,
        is_typing: bool,
    },
    ConversationUpdated {
        conversation: ConversationMeta,
    },
    Error(ApiError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    pub sender_role: SenderRole,
    #[serde(default)]
    pub generated_by_assistant: bool,
    pub client_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub message_id: PermanentId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkReadRequest {
    pub message_ids: Vec<PermanentId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub updated_count: usize,
}

/// Snapshot of one conversation, messages ascending by `created_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollResponse {
    pub messages: Vec<MessagePayload>,
    pub conversation: ConversationMeta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationListResponse {
    pub conversations: Vec<ConversationMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantTurn {
    pub role: SenderRole,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantRequest {
    pub conversation_id: ConversationId,
    pub recent_messages: Vec<AssistantTurn>,
    pub business_context: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_slot_state: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantResponse {
    pub response_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_state: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub url: String,
    pub media_type: String,
    pub byte_size: u64,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
