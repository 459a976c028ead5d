//! Maps optimistic provisional records onto server-confirmed ones.
//!
//! Two mechanisms live here and stay separate:
//! - the exact path: explicit send acknowledgements and echoed client keys;
//! - [`ProvisionalIndex`], the heuristic body/timestamp matcher, which can be
//!   dropped once every server echoes client keys.
//!
//! The permanent-id union itself is the [`MessageStore`]: a permanent id that
//! is already stored is a duplicate delivery.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, DeliveryState, Message, MessageId, ProvisionalId, SenderRole},
    protocol::SendMessageResponse,
};
use tracing::debug;

use crate::store::{MessageStore, ReplaceOutcome, UpsertOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPath {
    ClientKey,
    SendAck,
    Heuristic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// The permanent id was already stored; `changed` reports whether the
    /// merge altered the record (e.g. a read flag flip).
    Duplicate { changed: bool },
    /// A provisional record was rewritten to the permanent identity.
    Reconciled {
        provisional: ProvisionalId,
        path: MatchPath,
    },
    /// No provisional counterpart; stored as a fresh record.
    Appended,
}

impl Reconciliation {
    pub fn changed_store(&self) -> bool {
        match self {
            Self::Duplicate { changed } => *changed,
            Self::Reconciled { .. } | Self::Appended => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub provisional: ProvisionalId,
    pub conversation_id: ConversationId,
    pub sender_role: SenderRole,
    pub body: Option<String>,
    pub has_attachment: bool,
    pub created_at: DateTime<Utc>,
    pub client_key: String,
}

impl PendingSend {
    pub fn from_message(message: &Message, client_key: String) -> Option<Self> {
        Some(Self {
            provisional: message.provisional_id()?,
            conversation_id: message.conversation_id.clone(),
            sender_role: message.sender_role,
            body: message.body.clone(),
            has_attachment: message.has_attachment(),
            created_at: message.created_at,
            client_key,
        })
    }

    fn compatible_with(&self, incoming: &Message) -> bool {
        self.conversation_id == incoming.conversation_id
            && self.sender_role == incoming.sender_role
            && self.has_attachment == incoming.has_attachment()
    }
}

/// Client-local secondary index over unconfirmed sends, in send order.
#[derive(Debug, Default)]
pub struct ProvisionalIndex {
    pending: HashMap<ConversationId, Vec<PendingSend>>,
}

impl ProvisionalIndex {
    pub fn register(&mut self, send: PendingSend) {
        self.pending
            .entry(send.conversation_id.clone())
            .or_default()
            .push(send);
    }

    pub fn get(&self, provisional: ProvisionalId) -> Option<&PendingSend> {
        self.pending
            .values()
            .flat_map(|sends| sends.iter())
            .find(|send| send.provisional == provisional)
    }

    pub fn remove(&mut self, provisional: ProvisionalId) -> Option<PendingSend> {
        for sends in self.pending.values_mut() {
            if let Some(index) = sends.iter().position(|s| s.provisional == provisional) {
                return Some(sends.remove(index));
            }
        }
        None
    }

    pub fn by_client_key(&self, conversation_id: &ConversationId, key: &str) -> Option<ProvisionalId> {
        self.pending
            .get(conversation_id)?
            .iter()
            .find(|send| send.client_key == key)
            .map(|send| send.provisional)
    }

    /// Picks the provisional record most likely to be `incoming` among
    /// compatible sends created within `tolerance` of it: the oldest one with
    /// an equal body, else the oldest one overall.
    pub fn heuristic_match(
        &self,
        incoming: &Message,
        tolerance: chrono::Duration,
    ) -> Option<ProvisionalId> {
        let sends = self.pending.get(&incoming.conversation_id)?;
        let mut candidates = sends.iter().filter(|send| {
            let delta = incoming.created_at.signed_duration_since(send.created_at);
            send.compatible_with(incoming) && delta <= tolerance && delta >= -tolerance
        });

        if let Some(send) = candidates
            .clone()
            .find(|send| send.body == incoming.body)
        {
            return Some(send.provisional);
        }

        candidates.next().map(|send| send.provisional)
    }

    pub fn len(&self, conversation_id: &ConversationId) -> usize {
        self.pending.get(conversation_id).map_or(0, Vec::len)
    }
}

#[derive(Debug)]
pub struct IdentityReconciler {
    index: ProvisionalIndex,
    tolerance: chrono::Duration,
}

impl IdentityReconciler {
    pub fn new(tolerance: std::time::Duration) -> Self {
        Self {
            index: ProvisionalIndex::default(),
            tolerance: chrono::Duration::from_std(tolerance)
                .unwrap_or_else(|_| chrono::Duration::seconds(5)),
        }
    }

    pub fn index(&self) -> &ProvisionalIndex {
        &self.index
    }

    /// Records an optimistic send so later inbound copies can be matched.
    pub fn register_send(&mut self, message: &Message, client_key: String) {
        if let Some(send) = PendingSend::from_message(message, client_key) {
            self.index.register(send);
        }
    }

    pub fn client_key(&self, provisional: ProvisionalId) -> Option<&str> {
        self.index.get(provisional).map(|send| send.client_key.as_str())
    }

    /// Applies a synchronous send acknowledgement.
    pub fn confirm_send(
        &mut self,
        store: &mut MessageStore,
        provisional: ProvisionalId,
        ack: &SendMessageResponse,
    ) -> Reconciliation {
        self.index.remove(provisional);

        let Some(pending) = store.find_provisional(provisional).cloned() else {
            // Already rewritten by an inbound copy of the same message.
            return Reconciliation::Duplicate { changed: false };
        };

        let mut confirmed = pending;
        confirmed.id = MessageId::Permanent(ack.message_id.clone());
        confirmed.created_at = ack.created_at;
        confirmed.delivery = DeliveryState::Sent;

        match store.replace_provisional(provisional, confirmed) {
            ReplaceOutcome::Replaced => {
                debug!(%provisional, permanent = %ack.message_id, "send acknowledged");
                Reconciliation::Reconciled {
                    provisional,
                    path: MatchPath::SendAck,
                }
            }
            ReplaceOutcome::Collapsed => {
                debug!(%provisional, permanent = %ack.message_id, "send acknowledged after inbound copy");
                Reconciliation::Reconciled {
                    provisional,
                    path: MatchPath::SendAck,
                }
            }
            ReplaceOutcome::Missing => Reconciliation::Duplicate { changed: false },
        }
    }

    /// Folds an inbound permanent record into the store.
    ///
    /// Commutative with [`Self::confirm_send`] and idempotent: applying the
    /// same record again reports `Duplicate { changed: false }`.
    pub fn reconcile(
        &mut self,
        store: &mut MessageStore,
        incoming: Message,
        client_key: Option<&str>,
    ) -> Reconciliation {
        if incoming.is_provisional() || store.contains(&incoming.conversation_id, &incoming.id) {
            let outcome = store.upsert(incoming);
            return Reconciliation::Duplicate {
                changed: outcome != UpsertOutcome::Unchanged,
            };
        }

        if let Some(key) = client_key {
            if let Some(provisional) = self.index.by_client_key(&incoming.conversation_id, key) {
                if let Some(result) =
                    self.rewrite(store, provisional, &incoming, MatchPath::ClientKey)
                {
                    return result;
                }
            }
        }

        if let Some(provisional) = self.index.heuristic_match(&incoming, self.tolerance) {
            if let Some(result) = self.rewrite(store, provisional, &incoming, MatchPath::Heuristic) {
                return result;
            }
        }

        store.upsert(incoming);
        Reconciliation::Appended
    }

    fn rewrite(
        &mut self,
        store: &mut MessageStore,
        provisional: ProvisionalId,
        incoming: &Message,
        path: MatchPath,
    ) -> Option<Reconciliation> {
        match store.replace_provisional(provisional, incoming.clone()) {
            ReplaceOutcome::Replaced | ReplaceOutcome::Collapsed => {
                self.index.remove(provisional);
                debug!(%provisional, permanent = %incoming.id, ?path, "provisional record reconciled");
                Some(Reconciliation::Reconciled { provisional, path })
            }
            ReplaceOutcome::Missing => {
                // The index outlived its record (e.g. history eviction).
                self.index.remove(provisional);
                None
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
