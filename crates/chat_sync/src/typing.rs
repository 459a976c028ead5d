//! Ephemeral typing indicators.
//!
//! Inbound: each peer's flag expires unless refreshed within the timeout.
//! Outbound: only start/stop transitions leave the client.

use std::collections::BTreeMap;

use shared::domain::{ConversationId, ParticipantId};
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingSignal {
    pub conversation_id: ConversationId,
    pub is_typing: bool,
}

#[derive(Debug)]
pub struct TypingTracker {
    local: ParticipantId,
    timeout: Duration,
    peers: BTreeMap<(ConversationId, ParticipantId), Instant>,
}

impl TypingTracker {
    pub fn new(local: ParticipantId, timeout: Duration) -> Self {
        Self {
            local,
            timeout,
            peers: BTreeMap::new(),
        }
    }

    /// Applies an inbound typing event. Returns true when the visible set of
    /// typists for the conversation changed.
    pub fn on_signal(
        &mut self,
        conversation_id: ConversationId,
        participant_id: ParticipantId,
        is_typing: bool,
        now: Instant,
    ) -> bool {
        if participant_id == self.local {
            return false;
        }
        let key = (conversation_id, participant_id);
        if is_typing {
            self.peers.insert(key, now + self.timeout).is_none()
        } else {
            self.peers.remove(&key).is_some()
        }
    }

    /// Clears indicators whose refresh never came. Returns the affected
    /// conversations.
    pub fn expire(&mut self, now: Instant) -> Vec<ConversationId> {
        let mut affected = Vec::new();
        self.peers.retain(|(conversation_id, _), deadline| {
            let keep = *deadline > now;
            if !keep && !affected.contains(conversation_id) {
                affected.push(conversation_id.clone());
            }
            keep
        });
        affected
    }

    pub fn typing_in(&self, conversation_id: &ConversationId) -> Vec<ParticipantId> {
        self.peers
            .keys()
            .filter(|(conv, _)| conv == conversation_id)
            .map(|(_, participant)| participant.clone())
            .collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.peers.values().min().copied()
    }

    pub fn clear_conversation(&mut self, conversation_id: &ConversationId) -> bool {
        let before = self.peers.len();
        self.peers.retain(|(conv, _), _| conv != conversation_id);
        before != self.peers.len()
    }
}

#[derive(Debug)]
pub struct TypingEmitter {
    idle_stop: Duration,
    active: Option<ConversationId>,
    stop_at: Option<Instant>,
}

impl TypingEmitter {
    pub fn new(idle_stop: Duration) -> Self {
        Self {
            idle_stop,
            active: None,
            stop_at: None,
        }
    }

    /// Records an input change. Emits a stop for a previous conversation and
    /// a start only on the idle-to-typing transition.
    pub fn on_input(&mut self, conversation_id: &ConversationId, now: Instant) -> Vec<TypingSignal> {
        let mut signals = Vec::new();
        self.stop_at = Some(now + self.idle_stop);
        match &self.active {
            Some(active) if active == conversation_id => {}
            Some(_) => {
                signals.extend(self.stop_now());
                self.stop_at = Some(now + self.idle_stop);
                signals.push(self.start(conversation_id));
            }
            None => signals.push(self.start(conversation_id)),
        }
        signals
    }

    /// Stop signal once input has paused long enough.
    pub fn due(&mut self, now: Instant) -> Option<TypingSignal> {
        match self.stop_at {
            Some(at) if at <= now => self.stop_now(),
            _ => None,
        }
    }

    /// Immediate stop, e.g. when the message is sent or the conversation
    /// closes.
    pub fn stop_now(&mut self) -> Option<TypingSignal> {
        self.stop_at = None;
        self.active.take().map(|conversation_id| TypingSignal {
            conversation_id,
            is_typing: false,
        })
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.active.as_ref().and(self.stop_at)
    }

    fn start(&mut self, conversation_id: &ConversationId) -> TypingSignal {
        self.active = Some(conversation_id.clone());
        TypingSignal {
            conversation_id: conversation_id.clone(),
            is_typing: true,
        }
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
