//! Folds push and poll deliveries into the message store.
//!
//! Both sources feed the same union over permanent ids: a record is added the
//! first time any source delivers it and is never removed because a later
//! snapshot omits it. Poll snapshots for a conversation that is no longer
//! open are recognised by their generation and dropped.

use std::{collections::HashMap, sync::Arc};

use shared::{
    domain::{
        ConversationId, ConversationMeta, DeliveryState, Message, MessageId, PermanentId,
        ProvisionalId, SenderRole,
    },
    protocol::{MessagePayload, PollResponse, SendMessageResponse},
};
use tracing::{debug, warn};

use crate::{
    error::SyncError,
    reconciler::{IdentityReconciler, Reconciliation},
    store::MessageStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundSource {
    Push,
    Poll,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub inserted: usize,
    pub reconciled: Vec<ProvisionalId>,
    pub updated: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        self.inserted > 0 || !self.reconciled.is_empty() || self.updated > 0
    }

    fn absorb(&mut self, result: &Reconciliation) {
        match result {
            Reconciliation::Duplicate { changed: true } => self.updated += 1,
            Reconciliation::Duplicate { changed: false } => self.duplicates += 1,
            Reconciliation::Reconciled { provisional, .. } => self.reconciled.push(*provisional),
            Reconciliation::Appended => self.inserted += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollDisposition {
    Applied(MergeReport),
    /// The snapshot belongs to a conversation that has since been closed or
    /// reopened.
    Stale,
}

/// Converts a wire record into a canonical message, rejecting malformed
/// input.
pub fn validate_payload(
    payload: MessagePayload,
    expected: Option<&ConversationId>,
) -> Result<(Message, Option<String>), SyncError> {
    if payload.message_id.as_str().trim().is_empty() {
        return Err(SyncError::Validation("message id is empty".into()));
    }
    if payload.conversation_id.as_str().trim().is_empty() {
        return Err(SyncError::Validation(format!(
            "message {} has no conversation",
            payload.message_id
        )));
    }
    if let Some(expected) = expected {
        if &payload.conversation_id != expected {
            return Err(SyncError::Validation(format!(
                "message {} belongs to {} but arrived for {expected}",
                payload.message_id, payload.conversation_id
            )));
        }
    }
    let has_body = payload
        .body
        .as_deref()
        .is_some_and(|body| !body.trim().is_empty());
    if !has_body && payload.attachment.is_none() {
        return Err(SyncError::Validation(format!(
            "message {} has neither body nor attachment",
            payload.message_id
        )));
    }
    if let Some(attachment) = &payload.attachment {
        if attachment.url.trim().is_empty() {
            return Err(SyncError::Validation(format!(
                "message {} has an attachment without url",
                payload.message_id
            )));
        }
    }

    let message = Message {
        id: MessageId::Permanent(payload.message_id),
        conversation_id: payload.conversation_id,
        sender_role: payload.sender_role,
        body: payload.body,
        attachment: payload.attachment,
        created_at: payload.created_at,
        read: payload.read,
        generated_by_assistant: payload.generated_by_assistant,
        delivery: DeliveryState::Sent,
    };
    Ok((message, payload.client_key))
}

/// Conversation list metadata.
#[derive(Debug, Default)]
pub struct ConversationDirectory {
    metas: HashMap<ConversationId, ConversationMeta>,
}

impl ConversationDirectory {
    pub fn get(&self, id: &ConversationId) -> Option<&ConversationMeta> {
        self.metas.get(id)
    }

    /// Most recently active first.
    pub fn list(&self) -> Vec<ConversationMeta> {
        let mut metas: Vec<_> = self.metas.values().cloned().collect();
        metas.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        metas
    }

    fn entry(&mut self, id: &ConversationId) -> &mut ConversationMeta {
        self.metas
            .entry(id.clone())
            .or_insert_with(|| ConversationMeta::new(id.clone()))
    }
}

#[derive(Debug)]
pub struct DeliveryMerge {
    store: MessageStore,
    reconciler: IdentityReconciler,
    directory: ConversationDirectory,
    local_role: SenderRole,
    active: Option<ConversationId>,
    generation: u64,
}

impl DeliveryMerge {
    pub fn new(local_role: SenderRole, reconcile_tolerance: std::time::Duration) -> Self {
        Self {
            store: MessageStore::new(),
            reconciler: IdentityReconciler::new(reconcile_tolerance),
            directory: ConversationDirectory::default(),
            local_role,
            active: None,
            generation: 0,
        }
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn reconciler(&self) -> &IdentityReconciler {
        &self.reconciler
    }

    pub fn directory(&self) -> &ConversationDirectory {
        &self.directory
    }

    pub fn active(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Makes `conversation_id` the open conversation and returns the
    /// generation that its poll requests must carry.
    pub fn open(&mut self, conversation_id: ConversationId) -> u64 {
        self.generation += 1;
        self.directory.entry(&conversation_id);
        self.active = Some(conversation_id);
        self.refresh_active_meta();
        self.generation
    }

    pub fn close(&mut self) -> Option<ConversationId> {
        self.generation += 1;
        self.active.take()
    }

    pub fn is_current(&self, conversation_id: &ConversationId, generation: u64) -> bool {
        generation == self.generation && self.active.as_ref() == Some(conversation_id)
    }

    pub fn snapshot(&self, conversation_id: &ConversationId) -> Arc<[Message]> {
        self.store.get_ordered(conversation_id)
    }

    pub fn unread_count(&self, conversation_id: &ConversationId) -> usize {
        if self.active.as_ref() == Some(conversation_id) {
            self.store.unread_count(conversation_id, self.local_role)
        } else {
            self.directory
                .get(conversation_id)
                .map_or(0, |meta| meta.unread_count)
        }
    }

    /// Stores an optimistic record for a send that has not been confirmed.
    pub fn record_local_send(&mut self, message: Message, client_key: String) {
        self.reconciler.register_send(&message, client_key);
        let conversation_id = message.conversation_id.clone();
        self.store.upsert(message);
        self.refresh_meta(&conversation_id);
    }

    pub fn client_key(&self, provisional: ProvisionalId) -> Option<String> {
        self.reconciler.client_key(provisional).map(str::to_owned)
    }

    pub fn confirm_send(
        &mut self,
        provisional: ProvisionalId,
        ack: &SendMessageResponse,
    ) -> Option<ConversationId> {
        let conversation_id = self
            .store
            .find_provisional(provisional)
            .map(|m| m.conversation_id.clone());
        let result = self.reconciler.confirm_send(&mut self.store, provisional, ack);
        debug!(%provisional, ?result, "applied send acknowledgement");
        if let Some(conversation_id) = &conversation_id {
            self.refresh_meta(conversation_id);
        }
        conversation_id
    }

    pub fn set_delivery(&mut self, provisional: ProvisionalId, state: DeliveryState) -> bool {
        self.store.set_delivery(provisional, state)
    }

    pub fn update_provisional(
        &mut self,
        provisional: ProvisionalId,
        update: impl FnOnce(&mut Message),
    ) -> bool {
        self.store.update_provisional(provisional, update)
    }

    /// Applies a batch of inbound records. Invalid records are dropped and
    /// logged; the rest of the batch still applies.
    pub fn apply_records(
        &mut self,
        source: InboundSource,
        expected: Option<&ConversationId>,
        payloads: Vec<MessagePayload>,
    ) -> MergeReport {
        let mut report = MergeReport::default();
        let mut touched: Vec<ConversationId> = Vec::new();
        let mut fresh_unread: HashMap<ConversationId, usize> = HashMap::new();

        for payload in payloads {
            let (message, client_key) = match validate_payload(payload, expected) {
                Ok(valid) => valid,
                Err(err) => {
                    warn!(?source, error = %err, "dropping invalid inbound record");
                    report.rejected += 1;
                    continue;
                }
            };
            let conversation_id = message.conversation_id.clone();
            let counts_unread = message.is_unread_for(self.local_role);
            let result = self
                .reconciler
                .reconcile(&mut self.store, message, client_key.as_deref());
            if result == Reconciliation::Appended && counts_unread {
                *fresh_unread.entry(conversation_id.clone()).or_default() += 1;
            }
            report.absorb(&result);
            if result.changed_store() && !touched.contains(&conversation_id) {
                touched.push(conversation_id);
            }
        }

        for conversation_id in touched {
            if self.active.as_ref() != Some(&conversation_id) {
                let added = fresh_unread.get(&conversation_id).copied().unwrap_or(0);
                self.directory.entry(&conversation_id).unread_count += added;
            }
            self.refresh_meta(&conversation_id);
        }

        if report.changed() || report.rejected > 0 {
            debug!(
                ?source,
                inserted = report.inserted,
                reconciled = report.reconciled.len(),
                updated = report.updated,
                duplicates = report.duplicates,
                rejected = report.rejected,
                "merged inbound records"
            );
        }
        report
    }

    /// Applies a poll snapshot of the open conversation.
    pub fn apply_poll(
        &mut self,
        conversation_id: &ConversationId,
        generation: u64,
        response: PollResponse,
    ) -> PollDisposition {
        if !self.is_current(conversation_id, generation) {
            debug!(%conversation_id, generation, current = self.generation, "discarding stale poll result");
            return PollDisposition::Stale;
        }
        let report = self.apply_records(
            InboundSource::Poll,
            Some(conversation_id),
            response.messages,
        );
        self.apply_meta(response.conversation);
        PollDisposition::Applied(report)
    }

    /// Monotonic read flip for ids reported read by the server or by the
    /// local tracker. Returns the ids that changed.
    pub fn mark_read(
        &mut self,
        conversation_id: &ConversationId,
        ids: &[PermanentId],
    ) -> Vec<PermanentId> {
        let flipped = self.store.mark_read(conversation_id, ids);
        if !flipped.is_empty() && self.active.as_ref() != Some(conversation_id) {
            let counterpart = flipped
                .iter()
                .filter(|id| {
                    self.store
                        .get(conversation_id, &MessageId::Permanent((*id).clone()))
                        .is_some_and(|m| m.sender_role.is_counterpart_of(self.local_role))
                })
                .count();
            let meta = self.directory.entry(conversation_id);
            meta.unread_count = meta.unread_count.saturating_sub(counterpart);
        }
        self.refresh_meta(conversation_id);
        flipped
    }

    /// Refreshes list metadata from the server without touching messages.
    ///
    /// For the open conversation only participants and the last-message
    /// preview can change; its unread count stays derived from the store.
    pub fn apply_meta(&mut self, incoming: ConversationMeta) {
        let is_active = self.active.as_ref() == Some(&incoming.id);
        let meta = self.directory.entry(&incoming.id);

        if !incoming.participant_ids.is_empty() {
            meta.participant_ids = incoming.participant_ids;
        }
        if incoming.last_message_at >= meta.last_message_at {
            meta.last_message_at = incoming.last_message_at;
            if incoming.last_message_preview.is_some() {
                meta.last_message_preview = incoming.last_message_preview;
            }
        }
        if !is_active {
            meta.unread_count = incoming.unread_count;
        }

        let id = incoming.id;
        self.refresh_meta(&id);
    }

    pub fn apply_conversation_list(&mut self, metas: Vec<ConversationMeta>) {
        for meta in metas {
            self.apply_meta(meta);
        }
    }

    /// Drops the conversation history before a full reload. Unconfirmed sends
    /// are kept so their confirmations still reconcile.
    pub fn evict(&mut self, conversation_id: &ConversationId) -> usize {
        let removed = self.store.evict(conversation_id, true);
        self.refresh_meta(conversation_id);
        removed
    }

    fn refresh_active_meta(&mut self) {
        if let Some(active) = self.active.clone() {
            self.refresh_meta(&active);
        }
    }

    fn refresh_meta(&mut self, conversation_id: &ConversationId) {
        let is_active = self.active.as_ref() == Some(conversation_id);
        let unread = self.store.unread_count(conversation_id, self.local_role);
        let last = self
            .store
            .last_message(conversation_id)
            .map(|m| (m.created_at, m.preview()));
        let meta = self.directory.entry(conversation_id);

        if is_active {
            meta.unread_count = unread;
        }
        if let Some((created_at, preview)) = last {
            if meta.last_message_at.map_or(true, |at| created_at >= at) {
                meta.last_message_at = Some(created_at);
                if preview.is_some() {
                    meta.last_message_preview = preview;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/merge_tests.rs"]
mod tests;
