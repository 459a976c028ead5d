//! The sync engine task.
//!
//! One tokio task owns the store, the reconciler, the conversation directory,
//! the read-receipt tracker, the connection supervisor and typing state. It
//! reacts to four inputs: commands from [`SyncHandle`]s, completions of the
//! I/O it spawned, push-channel events and its own timer deadlines.

use std::{collections::HashSet, future::Future, sync::Arc};

use chrono::Utc;
use serde_json::Value;
use shared::{
    domain::{
        Attachment, ConversationId, ConversationMeta, DeliveryState, Message, MessageId,
        ParticipantId, ProvisionalId, SenderRole,
    },
    protocol::{
        AssistantResponse, ClientRequest, MarkReadResponse, PollResponse, SendMessageRequest,
        SendMessageResponse, ServerEvent, UploadResponse,
    },
};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
    time::{sleep_until, timeout, Duration, Instant},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    assistant::AssistantRelay,
    config::SyncSettings,
    error::SyncError,
    merge::{DeliveryMerge, InboundSource, PollDisposition},
    read_receipts::{
        MarkReadBatch, NoopVisibilityObserver, ReadReceiptTracker, VisibilityContext,
        VisibilityObserver,
    },
    supervisor::{BackoffPolicy, ConnectionState, ConnectionSupervisor},
    transport::{
        AttachmentUpload, ChannelManager, ChatApi, HttpChatApi, PushConnection, PushConnector,
        WsPushConnector,
    },
    typing::{TypingEmitter, TypingSignal, TypingTracker},
};

const COMMAND_BUFFER: usize = 256;

/// Who this engine instance acts for and on which kind of surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalActor {
    pub participant_id: ParticipantId,
    pub role: SenderRole,
    pub context: VisibilityContext,
}

#[derive(Debug)]
pub enum EngineCommand {
    OpenConversation {
        conversation_id: ConversationId,
    },
    CloseConversation,
    SendMessage {
        conversation_id: ConversationId,
        body: Option<String>,
        attachment: Option<AttachmentUpload>,
    },
    RetrySend {
        provisional: ProvisionalId,
    },
    /// Fraction of a message element currently on screen.
    MessageVisible {
        message_id: MessageId,
        visible_ratio: f32,
    },
    SurfaceVisibility {
        visible: bool,
    },
    InputActivity,
    RequestAssistantReply {
        business_context: Value,
    },
    RetryConnection,
    ReloadConversation,
    RefreshConversations,
    Snapshot {
        conversation_id: ConversationId,
        reply: oneshot::Sender<ConversationSnapshot>,
    },
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct ConversationSnapshot {
    pub conversation_id: ConversationId,
    pub messages: Arc<[Message]>,
    pub unread_count: usize,
    pub typing: Vec<ParticipantId>,
    pub connection: ConnectionState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncErrorEvent {
    pub conversation_id: Option<ConversationId>,
    pub error: SyncError,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConversationUpdated {
        conversation_id: ConversationId,
        messages: Arc<[Message]>,
        unread_count: usize,
    },
    ConversationsListed {
        conversations: Vec<ConversationMeta>,
    },
    TypingChanged {
        conversation_id: ConversationId,
        participants: Vec<ParticipantId>,
    },
    ConnectionChanged(ConnectionState),
    MessageFailed {
        conversation_id: ConversationId,
        provisional: ProvisionalId,
        error: SyncError,
    },
    Error(SyncErrorEvent),
}

#[derive(Debug)]
enum Completion {
    Connected(Result<PushConnection, SyncError>),
    Polled {
        conversation_id: ConversationId,
        generation: u64,
        result: Result<PollResponse, SyncError>,
    },
    Listed(Result<Vec<ConversationMeta>, SyncError>),
    Uploaded {
        provisional: ProvisionalId,
        result: Result<UploadResponse, SyncError>,
    },
    Sent {
        conversation_id: ConversationId,
        provisional: ProvisionalId,
        result: Result<SendMessageResponse, SyncError>,
    },
    MarkedRead {
        batch: MarkReadBatch,
        result: Result<MarkReadResponse, SyncError>,
    },
    AssistantReplied {
        conversation_id: ConversationId,
        result: Result<AssistantResponse, SyncError>,
    },
}

/// Cloneable front door to a running engine.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<EngineCommand>,
    events: broadcast::Sender<ClientEvent>,
}

impl SyncHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn send(&self, command: EngineCommand) -> Result<(), SyncError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::EngineClosed)
    }

    pub async fn open_conversation(&self, conversation_id: ConversationId) -> Result<(), SyncError> {
        self.send(EngineCommand::OpenConversation { conversation_id })
            .await
    }

    pub async fn close_conversation(&self) -> Result<(), SyncError> {
        self.send(EngineCommand::CloseConversation).await
    }

    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        body: Option<String>,
        attachment: Option<AttachmentUpload>,
    ) -> Result<(), SyncError> {
        self.send(EngineCommand::SendMessage {
            conversation_id,
            body,
            attachment,
        })
        .await
    }

    pub async fn retry_send(&self, provisional: ProvisionalId) -> Result<(), SyncError> {
        self.send(EngineCommand::RetrySend { provisional }).await
    }

    pub async fn message_visible(
        &self,
        message_id: MessageId,
        visible_ratio: f32,
    ) -> Result<(), SyncError> {
        self.send(EngineCommand::MessageVisible {
            message_id,
            visible_ratio,
        })
        .await
    }

    pub async fn surface_visibility(&self, visible: bool) -> Result<(), SyncError> {
        self.send(EngineCommand::SurfaceVisibility { visible }).await
    }

    pub async fn input_activity(&self) -> Result<(), SyncError> {
        self.send(EngineCommand::InputActivity).await
    }

    pub async fn request_assistant_reply(&self, business_context: Value) -> Result<(), SyncError> {
        self.send(EngineCommand::RequestAssistantReply { business_context })
            .await
    }

    pub async fn retry_connection(&self) -> Result<(), SyncError> {
        self.send(EngineCommand::RetryConnection).await
    }

    pub async fn reload_conversation(&self) -> Result<(), SyncError> {
        self.send(EngineCommand::ReloadConversation).await
    }

    pub async fn refresh_conversations(&self) -> Result<(), SyncError> {
        self.send(EngineCommand::RefreshConversations).await
    }

    pub async fn snapshot(
        &self,
        conversation_id: ConversationId,
    ) -> Result<ConversationSnapshot, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Snapshot {
            conversation_id,
            reply,
        })
        .await?;
        rx.await.map_err(|_| SyncError::EngineClosed)
    }

    pub async fn shutdown(&self) -> Result<(), SyncError> {
        self.send(EngineCommand::Shutdown).await
    }
}

pub struct SyncEngine {
    settings: SyncSettings,
    actor: LocalActor,
    api: Arc<dyn ChatApi>,
    channel: ChannelManager,
    visibility: Arc<dyn VisibilityObserver>,
    merge: DeliveryMerge,
    receipts: ReadReceiptTracker,
    supervisor: ConnectionSupervisor,
    typing: TypingTracker,
    emitter: TypingEmitter,
    assistant: AssistantRelay,
    events: broadcast::Sender<ClientEvent>,
    commands: mpsc::Receiver<EngineCommand>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    published_state: Option<ConnectionState>,
    surface_visible: bool,
    next_conversation_poll: Option<Instant>,
    next_list_poll: Option<Instant>,
    poll_in_flight: Option<u64>,
    list_in_flight: bool,
    /// Conversations the server reported missing; no polls or joins.
    missing: HashSet<ConversationId>,
}

impl SyncEngine {
    /// Starts an engine against the HTTP and WebSocket endpoints of
    /// `settings.server_url`.
    pub fn spawn(
        settings: SyncSettings,
        actor: LocalActor,
    ) -> Result<(SyncHandle, JoinHandle<()>), SyncError> {
        let api = HttpChatApi::new(
            &settings.server_url,
            actor.participant_id.clone(),
            settings.request_timeout,
        )?;
        let push = WsPushConnector::new(settings.server_url.clone(), actor.participant_id.clone());
        Ok(Self::spawn_with_dependencies(
            settings,
            actor,
            Arc::new(api),
            Arc::new(push),
            Arc::new(NoopVisibilityObserver),
        ))
    }

    pub fn spawn_with_dependencies(
        settings: SyncSettings,
        actor: LocalActor,
        api: Arc<dyn ChatApi>,
        push: Arc<dyn PushConnector>,
        visibility: Arc<dyn VisibilityObserver>,
    ) -> (SyncHandle, JoinHandle<()>) {
        let (events, _) = broadcast::channel(settings.event_buffer);
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (completions_tx, completions) = mpsc::unbounded_channel();

        let engine = Self {
            merge: DeliveryMerge::new(actor.role, settings.reconcile_tolerance),
            receipts: ReadReceiptTracker::new(
                actor.context.threshold(&settings),
                settings.read_debounce,
            ),
            supervisor: ConnectionSupervisor::new(BackoffPolicy::from_settings(&settings)),
            typing: TypingTracker::new(actor.participant_id.clone(), settings.typing_timeout),
            emitter: TypingEmitter::new(settings.typing_idle_stop),
            assistant: AssistantRelay::new(settings.assistant_context_messages),
            channel: ChannelManager::new(push),
            api,
            visibility,
            events: events.clone(),
            commands,
            completions_tx,
            completions,
            published_state: None,
            surface_visible: true,
            next_conversation_poll: None,
            next_list_poll: None,
            poll_in_flight: None,
            list_in_flight: false,
            missing: HashSet::new(),
            settings,
            actor,
        };

        let handle = SyncHandle {
            commands: commands_tx,
            events,
        };
        let task = tokio::spawn(engine.run());
        (handle, task)
    }

    async fn run(mut self) {
        info!(
            participant_id = %self.actor.participant_id,
            role = %self.actor.role,
            server_url = %self.settings.server_url,
            "sync engine started"
        );
        self.start_connect();
        self.next_list_poll = Some(Instant::now());

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(EngineCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(completion) = self.completions.recv() => self.handle_completion(completion),
                event = self.channel.next_event() => self.handle_channel_event(event),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.fire_timers(Instant::now());
                }
            }
        }

        self.teardown();
        info!("sync engine stopped");
    }

    fn teardown(&mut self) {
        if let Some(signal) = self.emitter.stop_now() {
            self.send_typing(signal);
        }
        if let Some(conversation_id) = self.receipts.detach() {
            self.visibility.detach(&conversation_id);
        }
        self.channel.disconnect();
        self.supervisor.shutdown();
        self.publish_connection();
    }

    fn handle_command(&mut self, command: EngineCommand) {
        let now = Instant::now();
        match command {
            EngineCommand::OpenConversation { conversation_id } => {
                self.open_conversation(conversation_id)
            }
            EngineCommand::CloseConversation => self.close_conversation(),
            EngineCommand::SendMessage {
                conversation_id,
                body,
                attachment,
            } => self.submit(
                conversation_id,
                body,
                attachment,
                self.actor.role,
                false,
            ),
            EngineCommand::RetrySend { provisional } => self.retry_send(provisional),
            EngineCommand::MessageVisible {
                message_id,
                visible_ratio,
            } => {
                let Some(active) = self.merge.active().cloned() else {
                    return;
                };
                let Some(message) = self.merge.store().get(&active, &message_id).cloned() else {
                    return;
                };
                self.receipts
                    .observe(&message, visible_ratio, self.actor.role, now);
            }
            EngineCommand::SurfaceVisibility { visible } => self.set_surface_visible(visible),
            EngineCommand::InputActivity => {
                if self.supervisor.is_halted() {
                    return;
                }
                if let Some(active) = self.merge.active().cloned() {
                    for signal in self.emitter.on_input(&active, now) {
                        self.send_typing(signal);
                    }
                }
            }
            EngineCommand::RequestAssistantReply { business_context } => {
                self.request_assistant_reply(business_context)
            }
            EngineCommand::RetryConnection => {
                info!("manual connection retry");
                self.supervisor.reset_budget(now);
                self.refresh_poll_schedule(true);
            }
            EngineCommand::ReloadConversation => self.reload_conversation(),
            EngineCommand::RefreshConversations => {
                if !self.supervisor.is_halted() {
                    self.next_list_poll = Some(now);
                }
            }
            EngineCommand::Snapshot {
                conversation_id,
                reply,
            } => {
                let _ = reply.send(self.snapshot(&conversation_id));
            }
            EngineCommand::Shutdown => {}
        }
    }

    fn open_conversation(&mut self, conversation_id: ConversationId) {
        if let Some(previous) = self.merge.active().cloned() {
            if previous != conversation_id {
                self.leave_active(&previous);
            }
        }

        self.missing.remove(&conversation_id);
        let generation = self.merge.open(conversation_id.clone());
        self.receipts.attach(conversation_id.clone());
        self.visibility
            .attach(&conversation_id, self.receipts.threshold());
        if self.supervisor.join_room(conversation_id.clone()) {
            self.channel.send(ClientRequest::JoinRoom {
                conversation_id: conversation_id.clone(),
            });
        }
        info!(%conversation_id, generation, "conversation opened");

        self.emit_conversation(&conversation_id);
        self.refresh_poll_schedule(true);
    }

    fn close_conversation(&mut self) {
        if let Some(previous) = self.merge.active().cloned() {
            self.leave_active(&previous);
            self.merge.close();
            info!(conversation_id = %previous, "conversation closed");
        }
        self.refresh_poll_schedule(false);
    }

    /// Releases everything scoped to the conversation being left.
    fn leave_active(&mut self, previous: &ConversationId) {
        if self.supervisor.leave_room(previous) {
            self.channel.send(ClientRequest::LeaveRoom {
                conversation_id: previous.clone(),
            });
        }
        if let Some(signal) = self.emitter.stop_now() {
            self.send_typing(signal);
        }
        if self.typing.clear_conversation(previous) {
            self.emit_typing(previous);
        }
        if let Some(detached) = self.receipts.detach() {
            self.visibility.detach(&detached);
        }
        self.next_conversation_poll = None;
    }

    fn reload_conversation(&mut self) {
        let Some(conversation_id) = self.merge.active().cloned() else {
            return;
        };
        let evicted = self.merge.evict(&conversation_id);
        let generation = self.merge.open(conversation_id.clone());
        info!(%conversation_id, evicted, generation, "reloading conversation history");
        self.emit_conversation(&conversation_id);
        self.missing.remove(&conversation_id);
        self.refresh_poll_schedule(true);
    }

    fn set_surface_visible(&mut self, visible: bool) {
        let was_visible = self.surface_visible;
        self.surface_visible = visible;
        if visible {
            if !was_visible {
                info!("surface visible again, resynchronising");
            }
            self.supervisor.reset_budget(Instant::now());
            if !self.supervisor.is_halted() {
                self.next_list_poll = Some(Instant::now());
            }
            self.refresh_poll_schedule(true);
        } else {
            if let Some(signal) = self.emitter.stop_now() {
                self.send_typing(signal);
            }
            self.next_list_poll = None;
            self.refresh_poll_schedule(false);
        }
    }

    fn submit(
        &mut self,
        conversation_id: ConversationId,
        body: Option<String>,
        upload: Option<AttachmentUpload>,
        sender_role: SenderRole,
        generated_by_assistant: bool,
    ) {
        let body = body
            .map(|body| body.trim().to_string())
            .filter(|body| !body.is_empty());
        if body.is_none() && upload.is_none() {
            self.emit_error(
                Some(conversation_id),
                SyncError::Validation("a message needs a body or an attachment".into()),
            );
            return;
        }
        if self.supervisor.is_halted() {
            self.emit_error(
                Some(conversation_id),
                SyncError::AuthExpired("synchronization halted; sign in again".into()),
            );
            return;
        }
        if let Some(signal) = self.emitter.stop_now() {
            self.send_typing(signal);
        }

        let provisional = ProvisionalId::generate();
        let client_key = Uuid::new_v4().to_string();
        let placeholder = upload.as_ref().map(|upload| Attachment {
            url: format!("local://{}", upload.filename),
            media_type: upload.media_type.clone(),
            byte_size: upload.bytes.len() as u64,
            local_only: true,
        });
        let message = Message {
            id: MessageId::Provisional(provisional),
            conversation_id: conversation_id.clone(),
            sender_role,
            body,
            attachment: placeholder,
            created_at: Utc::now(),
            read: sender_role != self.actor.role,
            generated_by_assistant,
            delivery: DeliveryState::Pending,
        };
        debug!(%conversation_id, %provisional, "optimistic send");
        self.merge.record_local_send(message, client_key);
        self.emit_conversation(&conversation_id);

        match upload {
            Some(upload) => {
                let api = Arc::clone(&self.api);
                self.spawn_io(async move {
                    Completion::Uploaded {
                        provisional,
                        result: api.upload_attachment(upload).await,
                    }
                });
            }
            None => self.dispatch_send(provisional),
        }
    }

    fn dispatch_send(&mut self, provisional: ProvisionalId) {
        let Some(message) = self.merge.store().find_provisional(provisional).cloned() else {
            debug!(%provisional, "send target already reconciled");
            return;
        };
        let Some(client_key) = self.merge.client_key(provisional) else {
            warn!(%provisional, "no idempotency key for pending send");
            return;
        };
        let conversation_id = message.conversation_id.clone();
        let request = SendMessageRequest {
            body: message.body,
            attachment: message.attachment,
            sender_role: message.sender_role,
            generated_by_assistant: message.generated_by_assistant,
            client_key,
        };
        let api = Arc::clone(&self.api);
        self.spawn_io(async move {
            let result = api.send_message(&conversation_id, request).await;
            Completion::Sent {
                conversation_id,
                provisional,
                result,
            }
        });
    }

    fn retry_send(&mut self, provisional: ProvisionalId) {
        let Some(message) = self.merge.store().find_provisional(provisional) else {
            return;
        };
        if message.delivery != DeliveryState::Failed {
            debug!(%provisional, delivery = ?message.delivery, "retry ignored");
            return;
        }
        if self.supervisor.is_halted() {
            let conversation_id = message.conversation_id.clone();
            self.emit_error(
                Some(conversation_id),
                SyncError::AuthExpired("synchronization halted; sign in again".into()),
            );
            return;
        }
        let conversation_id = message.conversation_id.clone();
        self.merge.set_delivery(provisional, DeliveryState::Pending);
        info!(%conversation_id, %provisional, "retrying failed send");
        self.emit_conversation(&conversation_id);
        self.dispatch_send(provisional);
    }

    fn request_assistant_reply(&mut self, business_context: Value) {
        let Some(conversation_id) = self.merge.active().cloned() else {
            self.emit_error(
                None,
                SyncError::Validation("no conversation open for an assistant reply".into()),
            );
            return;
        };
        if self.supervisor.is_halted() {
            return;
        }
        let recent = self
            .merge
            .store()
            .recent(&conversation_id, self.settings.assistant_context_messages);
        let request = self
            .assistant
            .build_request(&conversation_id, &recent, business_context);
        let api = Arc::clone(&self.api);
        self.spawn_io(async move {
            let result = api.request_assistant_reply(request).await;
            Completion::AssistantReplied {
                conversation_id,
                result,
            }
        });
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Connected(result) => self.on_connect_result(result),
            Completion::Polled {
                conversation_id,
                generation,
                result,
            } => self.on_poll_result(conversation_id, generation, result),
            Completion::Listed(result) => {
                self.list_in_flight = false;
                match result {
                    Ok(conversations) => {
                        self.merge.apply_conversation_list(conversations);
                        self.emit(ClientEvent::ConversationsListed {
                            conversations: self.merge.directory().list(),
                        });
                    }
                    Err(err) => self.handle_error(None, err),
                }
            }
            Completion::Uploaded {
                provisional,
                result,
            } => {
                match result {
                    Ok(uploaded) => {
                        self.merge.update_provisional(provisional, |message| {
                            message.attachment = Some(Attachment {
                                url: uploaded.url,
                                media_type: uploaded.media_type,
                                byte_size: uploaded.byte_size,
                                local_only: false,
                            });
                        });
                    }
                    Err(err) => {
                        warn!(%provisional, error = %err, "attachment upload failed, keeping local placeholder");
                        let conversation_id = self
                            .merge
                            .store()
                            .find_provisional(provisional)
                            .map(|m| m.conversation_id.clone());
                        self.emit_error(conversation_id, err);
                    }
                }
                if let Some(conversation_id) = self
                    .merge
                    .store()
                    .find_provisional(provisional)
                    .map(|m| m.conversation_id.clone())
                {
                    self.emit_conversation(&conversation_id);
                }
                self.dispatch_send(provisional);
            }
            Completion::Sent {
                conversation_id,
                provisional,
                result,
            } => match result {
                Ok(ack) => {
                    self.merge.confirm_send(provisional, &ack);
                    self.emit_conversation(&conversation_id);
                }
                Err(err) => {
                    warn!(%conversation_id, %provisional, error = %err, "send failed");
                    if self.merge.set_delivery(provisional, DeliveryState::Failed) {
                        self.emit_conversation(&conversation_id);
                        self.emit(ClientEvent::MessageFailed {
                            conversation_id: conversation_id.clone(),
                            provisional,
                            error: err.clone(),
                        });
                    }
                    if err.requires_reauth() {
                        self.halt(err);
                    } else if matches!(err, SyncError::RoomNotFound(_)) {
                        self.handle_error(Some(conversation_id), err);
                    }
                }
            },
            Completion::MarkedRead { batch, result } => {
                self.receipts.complete(&batch, result.is_ok());
                match result {
                    Ok(response) => debug!(
                        conversation_id = %batch.conversation_id,
                        updated = response.updated_count,
                        "read receipts confirmed"
                    ),
                    Err(err) => self.handle_error(Some(batch.conversation_id), err),
                }
            }
            Completion::AssistantReplied {
                conversation_id,
                result,
            } => {
                let reply = result.and_then(|response| {
                    self.assistant.accept_response(&conversation_id, response)
                });
                match reply {
                    Ok(text) => self.submit(
                        conversation_id,
                        Some(text),
                        None,
                        SenderRole::Assistant,
                        true,
                    ),
                    Err(err) => {
                        warn!(%conversation_id, error = %err, "assistant reply failed");
                        if err.requires_reauth() {
                            self.halt(err);
                        } else {
                            self.emit_error(Some(conversation_id), err);
                        }
                    }
                }
            }
        }
    }

    fn on_connect_result(&mut self, result: Result<PushConnection, SyncError>) {
        match result {
            Ok(connection) => {
                if self.supervisor.is_halted() {
                    return;
                }
                self.channel.attach(connection);
                let rooms = self.supervisor.on_connected();
                for conversation_id in rooms {
                    self.channel.send(ClientRequest::JoinRoom { conversation_id });
                }
                self.publish_connection();
                // Catch up on whatever was pushed while the channel was down.
                self.spawn_poll();
                self.refresh_poll_schedule(false);
            }
            Err(err) => {
                warn!(error = %err, "push channel connect failed");
                if err.requires_reauth() {
                    self.halt(err);
                    return;
                }
                self.connection_down(false);
            }
        }
    }

    /// `lost` is true when a live channel dropped, which warrants an
    /// immediate poll; a failed reconnect keeps the current poll cadence.
    fn connection_down(&mut self, lost: bool) {
        self.channel.disconnect();
        self.supervisor.on_channel_lost(Instant::now());
        self.publish_connection();
        self.supervisor.degrade();
        self.publish_connection();
        self.refresh_poll_schedule(lost);
    }

    fn handle_channel_event(&mut self, event: Option<Result<ServerEvent, SyncError>>) {
        match event {
            Some(Ok(event)) => self.handle_server_event(event),
            Some(Err(SyncError::Validation(reason))) => {
                warn!(%reason, "dropping malformed push frame");
            }
            Some(Err(err)) => warn!(error = %err, "push channel error"),
            None => {
                warn!("push channel closed");
                self.connection_down(true);
            }
        }
    }

    fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::MessageCreated { message } => {
                let conversation_id = message.conversation_id.clone();
                let report = self
                    .merge
                    .apply_records(InboundSource::Push, None, vec![message]);
                if report.changed() {
                    self.emit_conversation(&conversation_id);
                    if self.merge.active() != Some(&conversation_id) {
                        self.emit(ClientEvent::ConversationsListed {
                            conversations: self.merge.directory().list(),
                        });
                    }
                }
            }
            ServerEvent::MessagesRead {
                conversation_id,
                message_ids,
            } => {
                if !self.merge.mark_read(&conversation_id, &message_ids).is_empty() {
                    self.emit_conversation(&conversation_id);
                }
            }
            ServerEvent::Typing {
                conversation_id,
                participant_id,
                is_typing,
            } => {
                let changed = self.typing.on_signal(
                    conversation_id.clone(),
                    participant_id,
                    is_typing,
                    Instant::now(),
                );
                if changed {
                    self.emit_typing(&conversation_id);
                }
            }
            ServerEvent::ConversationUpdated { conversation } => {
                self.merge.apply_meta(conversation);
                self.emit(ClientEvent::ConversationsListed {
                    conversations: self.merge.directory().list(),
                });
            }
            ServerEvent::Error(api_error) => {
                self.handle_error(None, SyncError::from_api_error(&api_error))
            }
        }
    }

    fn on_poll_result(
        &mut self,
        conversation_id: ConversationId,
        generation: u64,
        result: Result<PollResponse, SyncError>,
    ) {
        if self.poll_in_flight == Some(generation) {
            self.poll_in_flight = None;
        }
        match result {
            Ok(response) => match self.merge.apply_poll(&conversation_id, generation, response) {
                PollDisposition::Applied(report) => {
                    if report.changed() || report.rejected > 0 {
                        self.emit_conversation(&conversation_id);
                    }
                }
                PollDisposition::Stale => {}
            },
            Err(err) => {
                if self.merge.is_current(&conversation_id, generation) {
                    self.handle_error(Some(conversation_id), err);
                } else {
                    debug!(%conversation_id, error = %err, "ignoring failure of stale poll");
                }
            }
        }
    }

    fn handle_error(&mut self, conversation_id: Option<ConversationId>, err: SyncError) {
        match err {
            SyncError::AuthExpired(_) => self.halt(err),
            SyncError::RoomNotFound(_) => {
                let Some(conversation_id) = conversation_id else {
                    warn!(error = %err, "server reported a missing conversation");
                    self.emit_error(None, err);
                    return;
                };
                warn!(%conversation_id, "conversation not found, stopping sync for it");
                self.missing.insert(conversation_id.clone());
                self.assistant.forget(&conversation_id);
                if self.supervisor.leave_room(&conversation_id) {
                    self.channel.send(ClientRequest::LeaveRoom {
                        conversation_id: conversation_id.clone(),
                    });
                }
                self.refresh_poll_schedule(false);
                self.emit_error(Some(conversation_id), err);
            }
            SyncError::TransientNetwork(_) => {
                warn!(conversation_id = ?conversation_id.as_ref().map(|id| id.as_str()), error = %err, "transient failure");
            }
            SyncError::Validation(_) | SyncError::Config(_) | SyncError::EngineClosed => {
                warn!(error = %err, "request rejected");
                self.emit_error(conversation_id, err);
            }
        }
    }

    fn halt(&mut self, err: SyncError) {
        if !self.supervisor.is_halted() {
            warn!(error = %err, "session expired, halting synchronization");
        }
        self.supervisor.halt();
        self.channel.disconnect();
        self.next_conversation_poll = None;
        self.next_list_poll = None;
        self.publish_connection();
        self.emit_error(None, err);
    }

    fn fire_timers(&mut self, now: Instant) {
        if self.supervisor.reconnect_due(now) {
            self.start_connect();
        }
        if self.next_conversation_poll.is_some_and(|at| at <= now) {
            self.next_conversation_poll = None;
            if self.conversation_poll_enabled() {
                self.next_conversation_poll = Some(now + self.settings.conversation_poll_interval);
                self.spawn_poll();
            }
        }
        if self.next_list_poll.is_some_and(|at| at <= now) {
            self.next_list_poll = None;
            self.poll_list(now);
        }
        if let Some(batch) = self.receipts.take_due(now) {
            self.flush_read_batch(batch);
        }
        for conversation_id in self.typing.expire(now) {
            self.emit_typing(&conversation_id);
        }
        if let Some(signal) = self.emitter.due(now) {
            self.send_typing(signal);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.next_conversation_poll,
            self.next_list_poll,
            self.supervisor.next_deadline(),
            self.receipts.next_deadline(),
            self.typing.next_deadline(),
            self.emitter.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn start_connect(&mut self) {
        if !self.supervisor.begin_connect() {
            return;
        }
        self.publish_connection();
        let connector = self.channel.connector();
        self.spawn_io(async move { Completion::Connected(connector.connect().await) });
    }

    fn conversation_poll_enabled(&self) -> bool {
        let Some(active) = self.merge.active() else {
            return false;
        };
        !self.supervisor.is_halted()
            && self.surface_visible
            && !self.missing.contains(active)
            && (self.settings.poll_while_connected || !self.supervisor.is_connected())
    }

    fn refresh_poll_schedule(&mut self, immediate: bool) {
        if !self.conversation_poll_enabled() {
            self.next_conversation_poll = None;
        } else if immediate {
            self.next_conversation_poll = Some(Instant::now());
        } else if self.next_conversation_poll.is_none() {
            self.next_conversation_poll =
                Some(Instant::now() + self.settings.conversation_poll_interval);
        }
    }

    fn spawn_poll(&mut self) {
        let Some(conversation_id) = self.merge.active().cloned() else {
            return;
        };
        if self.supervisor.is_halted() || self.missing.contains(&conversation_id) {
            return;
        }
        let generation = self.merge.generation();
        if self.poll_in_flight == Some(generation) {
            return;
        }
        self.poll_in_flight = Some(generation);
        let api = Arc::clone(&self.api);
        let limit = self.settings.request_timeout;
        self.spawn_io(async move {
            let result = bounded(limit, "poll", api.poll_conversation(&conversation_id)).await;
            Completion::Polled {
                conversation_id,
                generation,
                result,
            }
        });
    }

    fn poll_list(&mut self, now: Instant) {
        if self.supervisor.is_halted() || !self.surface_visible {
            return;
        }
        self.next_list_poll = Some(now + self.settings.list_poll_interval);
        if self.list_in_flight {
            return;
        }
        self.list_in_flight = true;
        let api = Arc::clone(&self.api);
        let limit = self.settings.request_timeout;
        self.spawn_io(async move {
            Completion::Listed(bounded(limit, "conversation list", api.list_conversations()).await)
        });
    }

    fn flush_read_batch(&mut self, batch: MarkReadBatch) {
        let flipped = self
            .merge
            .mark_read(&batch.conversation_id, &batch.message_ids);
        if !flipped.is_empty() {
            self.emit_conversation(&batch.conversation_id);
        }
        let api = Arc::clone(&self.api);
        self.spawn_io(async move {
            let result = api
                .mark_read(&batch.conversation_id, batch.message_ids.clone())
                .await;
            Completion::MarkedRead { batch, result }
        });
    }

    fn send_typing(&self, signal: TypingSignal) {
        let sent = self.channel.send(ClientRequest::Typing {
            conversation_id: signal.conversation_id,
            is_typing: signal.is_typing,
        });
        if !sent {
            debug!(is_typing = signal.is_typing, "typing signal dropped, push channel down");
        }
    }

    fn snapshot(&self, conversation_id: &ConversationId) -> ConversationSnapshot {
        ConversationSnapshot {
            conversation_id: conversation_id.clone(),
            messages: self.merge.snapshot(conversation_id),
            unread_count: self.merge.unread_count(conversation_id),
            typing: self.typing.typing_in(conversation_id),
            connection: self.supervisor.state(),
        }
    }

    fn spawn_io<F>(&self, task: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let _ = completions.send(task.await);
        });
    }

    fn publish_connection(&mut self) {
        let state = self.supervisor.state();
        if self.published_state != Some(state) {
            self.published_state = Some(state);
            debug!(?state, "connection state changed");
            self.emit(ClientEvent::ConnectionChanged(state));
        }
    }

    fn emit_conversation(&self, conversation_id: &ConversationId) {
        self.emit(ClientEvent::ConversationUpdated {
            conversation_id: conversation_id.clone(),
            messages: self.merge.snapshot(conversation_id),
            unread_count: self.merge.unread_count(conversation_id),
        });
    }

    fn emit_typing(&self, conversation_id: &ConversationId) {
        self.emit(ClientEvent::TypingChanged {
            conversation_id: conversation_id.clone(),
            participants: self.typing.typing_in(conversation_id),
        });
    }

    fn emit_error(&self, conversation_id: Option<ConversationId>, error: SyncError) {
        self.emit(ClientEvent::Error(SyncErrorEvent {
            conversation_id,
            error,
        }));
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

/// Resolves a request that never answers as a transient failure so the
/// single in-flight slot it holds is released.
async fn bounded<T>(
    limit: Duration,
    what: &str,
    request: impl Future<Output = Result<T, SyncError>>,
) -> Result<T, SyncError> {
    match timeout(limit, request).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::TransientNetwork(format!(
            "{what} timed out after {}ms",
            limit.as_millis()
        ))),
    }
}
