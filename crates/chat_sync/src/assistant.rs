//! Relay between a conversation and the external assistant service.
//!
//! The relay only shapes the request and keeps the opaque slot state that the
//! service hands back; the reply itself goes out through the regular send
//! path so it reconciles like any other message.

use std::collections::HashMap;

use serde_json::Value;
use shared::{
    domain::{ConversationId, Message},
    protocol::{AssistantRequest, AssistantResponse, AssistantTurn},
};
use tracing::debug;

use crate::error::SyncError;

#[derive(Debug, Default)]
pub struct AssistantRelay {
    context_limit: usize,
    slot_state: HashMap<ConversationId, Value>,
}

impl AssistantRelay {
    pub fn new(context_limit: usize) -> Self {
        Self {
            context_limit,
            slot_state: HashMap::new(),
        }
    }

    pub fn slot_state(&self, conversation_id: &ConversationId) -> Option<&Value> {
        self.slot_state.get(conversation_id)
    }

    /// `recent` is expected oldest first; only the newest `context_limit`
    /// text-bearing records are forwarded.
    pub fn build_request(
        &self,
        conversation_id: &ConversationId,
        recent: &[Message],
        business_context: Value,
    ) -> AssistantRequest {
        let mut turns: Vec<AssistantTurn> = recent
            .iter()
            .rev()
            .filter_map(|message| {
                let text = message.body.as_deref()?.trim();
                (!text.is_empty()).then(|| AssistantTurn {
                    role: message.sender_role,
                    text: text.to_string(),
                })
            })
            .take(self.context_limit)
            .collect();
        turns.reverse();

        AssistantRequest {
            conversation_id: conversation_id.clone(),
            recent_messages: turns,
            business_context,
            prior_slot_state: self.slot_state.get(conversation_id).cloned(),
        }
    }

    /// Stores the returned slot state and yields the reply text to send.
    pub fn accept_response(
        &mut self,
        conversation_id: &ConversationId,
        response: AssistantResponse,
    ) -> Result<String, SyncError> {
        if let Some(slot_state) = response.slot_state {
            self.slot_state.insert(conversation_id.clone(), slot_state);
        }
        let text = response.response_text.trim();
        if text.is_empty() {
            return Err(SyncError::Validation(format!(
                "assistant returned an empty reply for {conversation_id}"
            )));
        }
        debug!(%conversation_id, chars = text.len(), "assistant reply accepted");
        Ok(text.to_string())
    }

    pub fn forget(&mut self, conversation_id: &ConversationId) {
        self.slot_state.remove(conversation_id);
    }
}

#[cfg(test)]
#[path = "tests/assistant_tests.rs"]
mod tests;
