//! Visibility-driven read receipts.
//!
//! The host UI reports how much of each message element is on screen through
//! [`VisibilityObserver`]-attached callbacks; the tracker collects unread
//! counterpart messages that crossed the threshold and releases them as one
//! batch once the debounce window has been quiet.

use std::collections::HashSet;

use shared::domain::{ConversationId, Message, PermanentId, SenderRole};
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::config::SyncSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityContext {
    /// Conversation list or embedded widget.
    List,
    /// Full conversation view.
    Detail,
}

impl VisibilityContext {
    pub fn threshold(self, settings: &SyncSettings) -> f32 {
        match self {
            Self::List => settings.list_visibility_threshold,
            Self::Detail => settings.detail_visibility_threshold,
        }
    }
}

/// Capability provided by the UI layer: report when a message element of the
/// attached conversation becomes at least `threshold` visible.
pub trait VisibilityObserver: Send + Sync {
    fn attach(&self, conversation_id: &ConversationId, threshold: f32);
    fn detach(&self, conversation_id: &ConversationId);
}

pub struct NoopVisibilityObserver;

impl VisibilityObserver for NoopVisibilityObserver {
    fn attach(&self, _conversation_id: &ConversationId, _threshold: f32) {}

    fn detach(&self, _conversation_id: &ConversationId) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkReadBatch {
    pub conversation_id: ConversationId,
    pub message_ids: Vec<PermanentId>,
}

#[derive(Debug)]
pub struct ReadReceiptTracker {
    threshold: f32,
    debounce: Duration,
    conversation: Option<ConversationId>,
    pending: Vec<PermanentId>,
    flush_at: Option<Instant>,
    in_flight: HashSet<PermanentId>,
    /// Read locally but the server never acknowledged it.
    unconfirmed: HashSet<PermanentId>,
}

impl ReadReceiptTracker {
    pub fn new(threshold: f32, debounce: Duration) -> Self {
        Self {
            threshold,
            debounce,
            conversation: None,
            pending: Vec::new(),
            flush_at: None,
            in_flight: HashSet::new(),
            unconfirmed: HashSet::new(),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn conversation(&self) -> Option<&ConversationId> {
        self.conversation.as_ref()
    }

    /// Starts tracking `conversation_id`; anything queued for the previous
    /// conversation is dropped.
    pub fn attach(&mut self, conversation_id: ConversationId) {
        if self.conversation.as_ref() != Some(&conversation_id) {
            self.unconfirmed.clear();
        }
        self.pending.clear();
        self.flush_at = None;
        self.conversation = Some(conversation_id);
    }

    pub fn detach(&mut self) -> Option<ConversationId> {
        self.pending.clear();
        self.flush_at = None;
        self.unconfirmed.clear();
        self.conversation.take()
    }

    /// Records a visibility report. Returns true when the message was queued.
    pub fn observe(
        &mut self,
        message: &Message,
        visible_ratio: f32,
        local_role: SenderRole,
        now: Instant,
    ) -> bool {
        if self.conversation.as_ref() != Some(&message.conversation_id) {
            return false;
        }
        if visible_ratio < self.threshold {
            return false;
        }
        let Some(id) = message.permanent_id() else {
            return false;
        };
        if !message.sender_role.is_counterpart_of(local_role) {
            return false;
        }
        if message.read && !self.unconfirmed.contains(id) {
            return false;
        }
        if self.pending.contains(id) || self.in_flight.contains(id) {
            return false;
        }

        self.pending.push(id.clone());
        self.flush_at = Some(now + self.debounce);
        true
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        if self.pending.is_empty() {
            None
        } else {
            self.flush_at
        }
    }

    /// Releases the queued ids once the debounce window has elapsed.
    pub fn take_due(&mut self, now: Instant) -> Option<MarkReadBatch> {
        let due = self.flush_at.is_some_and(|at| at <= now);
        if !due || self.pending.is_empty() {
            return None;
        }
        let conversation_id = self.conversation.clone()?;
        self.flush_at = None;
        let message_ids = std::mem::take(&mut self.pending);
        self.in_flight.extend(message_ids.iter().cloned());
        debug!(%conversation_id, count = message_ids.len(), "flushing read receipts");
        Some(MarkReadBatch {
            conversation_id,
            message_ids,
        })
    }

    /// Records the outcome of a mark-as-read call for `batch`.
    pub fn complete(&mut self, batch: &MarkReadBatch, succeeded: bool) {
        for id in &batch.message_ids {
            self.in_flight.remove(id);
            if self.conversation.as_ref() != Some(&batch.conversation_id) {
                continue;
            }
            if succeeded {
                self.unconfirmed.remove(id);
            } else {
                self.unconfirmed.insert(id.clone());
            }
        }
    }

    pub fn unconfirmed(&self) -> usize {
        self.unconfirmed.len()
    }
}

#[cfg(test)]
#[path = "tests/read_receipts_tests.rs"]
mod tests;
