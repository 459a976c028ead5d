//! Per-conversation ordered message collection.
//!
//! Records are kept sorted by `(created_at, seq)` where `seq` is the arrival
//! sequence assigned on first insertion. A provisional record rewritten to its
//! permanent id keeps its `seq`, so it stays where it was among records that
//! share its timestamp.

use std::{collections::HashMap, sync::Arc};

use shared::domain::{
    ConversationId, DeliveryState, Message, MessageId, PermanentId, ProvisionalId, SenderRole,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// The provisional record now carries the permanent id.
    Replaced,
    /// The permanent record was already stored; the provisional one was dropped.
    Collapsed,
    /// No provisional record with that id exists.
    Missing,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    seq: u64,
    message: Message,
}

impl StoredRecord {
    fn sort_key(&self) -> (chrono::DateTime<chrono::Utc>, u64) {
        (self.message.created_at, self.seq)
    }
}

#[derive(Debug, Default)]
struct ConversationLog {
    records: Vec<StoredRecord>,
}

impl ConversationLog {
    fn position(&self, id: &MessageId) -> Option<usize> {
        self.records.iter().position(|r| &r.message.id == id)
    }

    fn insert_sorted(&mut self, record: StoredRecord) {
        let key = record.sort_key();
        let at = self.records.partition_point(|r| r.sort_key() <= key);
        self.records.insert(at, record);
    }

    fn replace_at(&mut self, index: usize, message: Message) {
        let seq = self.records[index].seq;
        if self.records[index].message.created_at == message.created_at {
            self.records[index].message = message;
        } else {
            self.records.remove(index);
            self.insert_sorted(StoredRecord { seq, message });
        }
    }
}

#[derive(Debug, Default)]
pub struct MessageStore {
    conversations: HashMap<ConversationId, ConversationLog>,
    next_seq: u64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `message`, or merges it into the record with the same id.
    ///
    /// Merging takes the incoming copy but never flips `read` back to false.
    pub fn upsert(&mut self, message: Message) -> UpsertOutcome {
        let seq = self.next_seq;
        let log = self
            .conversations
            .entry(message.conversation_id.clone())
            .or_default();

        match log.position(&message.id) {
            Some(index) => {
                let existing = &log.records[index].message;
                let mut merged = message;
                merged.read |= existing.read;
                if merged.id.is_provisional() {
                    merged.delivery = existing.delivery;
                }
                if &merged == existing {
                    return UpsertOutcome::Unchanged;
                }
                log.replace_at(index, merged);
                UpsertOutcome::Updated
            }
            None => {
                log.insert_sorted(StoredRecord { seq, message });
                self.next_seq += 1;
                UpsertOutcome::Inserted
            }
        }
    }

    /// Immutable snapshot of a conversation in display order.
    pub fn get_ordered(&self, conversation_id: &ConversationId) -> Arc<[Message]> {
        self.conversations
            .get(conversation_id)
            .map(|log| log.records.iter().map(|r| r.message.clone()).collect())
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    /// Removes every provisional record matching `predicate`; permanent
    /// records are never touched.
    pub fn remove_provisional(&mut self, mut predicate: impl FnMut(&Message) -> bool) -> Vec<Message> {
        let mut removed = Vec::new();
        for log in self.conversations.values_mut() {
            let mut kept = Vec::with_capacity(log.records.len());
            for record in log.records.drain(..) {
                if record.message.is_provisional() && predicate(&record.message) {
                    removed.push(record.message);
                } else {
                    kept.push(record);
                }
            }
            log.records = kept;
        }
        removed
    }

    /// Rewrites a provisional record in place so it carries the permanent
    /// identity of `confirmed`.
    pub fn replace_provisional(
        &mut self,
        provisional: ProvisionalId,
        mut confirmed: Message,
    ) -> ReplaceOutcome {
        let provisional_id = MessageId::Provisional(provisional);
        let Some(log) = self.conversations.get_mut(&confirmed.conversation_id) else {
            return ReplaceOutcome::Missing;
        };
        let Some(index) = log.position(&provisional_id) else {
            return ReplaceOutcome::Missing;
        };

        if log.position(&confirmed.id).is_some() {
            log.records.remove(index);
            return ReplaceOutcome::Collapsed;
        }

        let previous = &log.records[index].message;
        confirmed.read |= previous.read;
        if confirmed.attachment.is_none() {
            confirmed.attachment = previous.attachment.clone();
        }
        confirmed.delivery = DeliveryState::Sent;
        log.replace_at(index, confirmed);
        ReplaceOutcome::Replaced
    }

    pub fn contains(&self, conversation_id: &ConversationId, id: &MessageId) -> bool {
        self.conversations
            .get(conversation_id)
            .is_some_and(|log| log.position(id).is_some())
    }

    pub fn get(&self, conversation_id: &ConversationId, id: &MessageId) -> Option<&Message> {
        let log = self.conversations.get(conversation_id)?;
        log.position(id).map(|index| &log.records[index].message)
    }

    pub fn find_provisional(&self, provisional: ProvisionalId) -> Option<&Message> {
        let id = MessageId::Provisional(provisional);
        self.conversations
            .values()
            .find_map(|log| log.position(&id).map(|index| &log.records[index].message))
    }

    /// Updates the attachment of a still-provisional record, e.g. once its
    /// upload finished.
    pub fn update_provisional(
        &mut self,
        provisional: ProvisionalId,
        update: impl FnOnce(&mut Message),
    ) -> bool {
        let id = MessageId::Provisional(provisional);
        for log in self.conversations.values_mut() {
            if let Some(index) = log.position(&id) {
                let created_at = log.records[index].message.created_at;
                update(&mut log.records[index].message);
                log.records[index].message.id = id;
                if log.records[index].message.created_at != created_at {
                    let record = log.records.remove(index);
                    log.insert_sorted(record);
                }
                return true;
            }
        }
        false
    }

    pub fn set_delivery(&mut self, provisional: ProvisionalId, state: DeliveryState) -> bool {
        self.update_provisional(provisional, |message| message.delivery = state)
    }

    /// Flips `read` to true for the given ids and returns the ones that
    /// actually changed.
    pub fn mark_read(
        &mut self,
        conversation_id: &ConversationId,
        ids: &[PermanentId],
    ) -> Vec<PermanentId> {
        let Some(log) = self.conversations.get_mut(conversation_id) else {
            return Vec::new();
        };
        let mut flipped = Vec::new();
        for record in &mut log.records {
            let Some(id) = record.message.permanent_id().cloned() else {
                continue;
            };
            if !record.message.read && ids.contains(&id) {
                record.message.read = true;
                flipped.push(id);
            }
        }
        flipped
    }

    pub fn unread_count(&self, conversation_id: &ConversationId, local: SenderRole) -> usize {
        self.conversations.get(conversation_id).map_or(0, |log| {
            log.records
                .iter()
                .filter(|r| r.message.is_unread_for(local))
                .count()
        })
    }

    pub fn last_message(&self, conversation_id: &ConversationId) -> Option<&Message> {
        self.conversations
            .get(conversation_id)
            .and_then(|log| log.records.last())
            .map(|r| &r.message)
    }

    /// The newest `limit` records, oldest first.
    pub fn recent(&self, conversation_id: &ConversationId, limit: usize) -> Vec<Message> {
        let Some(log) = self.conversations.get(conversation_id) else {
            return Vec::new();
        };
        let start = log.records.len().saturating_sub(limit);
        log.records[start..]
            .iter()
            .map(|r| r.message.clone())
            .collect()
    }

    pub fn len(&self, conversation_id: &ConversationId) -> usize {
        self.conversations
            .get(conversation_id)
            .map_or(0, |log| log.records.len())
    }

    pub fn is_empty(&self, conversation_id: &ConversationId) -> bool {
        self.len(conversation_id) == 0
    }

    /// Drops the conversation history ahead of a reload. Provisional records
    /// survive unless `keep_provisional` is false.
    pub fn evict(&mut self, conversation_id: &ConversationId, keep_provisional: bool) -> usize {
        let Some(log) = self.conversations.get_mut(conversation_id) else {
            return 0;
        };
        let before = log.records.len();
        log.records
            .retain(|r| keep_provisional && r.message.is_provisional());
        before - log.records.len()
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
