//! Network seams of the engine.
//!
//! [`ChatApi`] covers request/response calls and [`PushConnector`] opens the
//! persistent push channel. Implementations work with `anyhow` internally and
//! classify failures into [`SyncError`] before returning.

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use serde::de::DeserializeOwned;
use shared::{
    domain::{ConversationId, ConversationMeta, ParticipantId, PermanentId},
    protocol::{
        AssistantRequest, AssistantResponse, ClientRequest, ConversationListResponse,
        MarkReadRequest, MarkReadResponse, PollResponse, SendMessageRequest, SendMessageResponse,
        ServerEvent, UploadResponse,
    },
};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};
use url::Url;

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentUpload {
    pub filename: String,
    pub media_type: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        request: SendMessageRequest,
    ) -> Result<SendMessageResponse, SyncError>;

    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        message_ids: Vec<PermanentId>,
    ) -> Result<MarkReadResponse, SyncError>;

    async fn poll_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<PollResponse, SyncError>;

    async fn list_conversations(&self) -> Result<Vec<ConversationMeta>, SyncError>;

    async fn upload_attachment(&self, upload: AttachmentUpload)
        -> Result<UploadResponse, SyncError>;

    async fn request_assistant_reply(
        &self,
        request: AssistantRequest,
    ) -> Result<AssistantResponse, SyncError>;
}

pub struct HttpChatApi {
    http: Client,
    server_url: Url,
    participant_id: ParticipantId,
}

impl HttpChatApi {
    pub fn new(
        server_url: &str,
        participant_id: ParticipantId,
        request_timeout: Duration,
    ) -> Result<Self, SyncError> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| SyncError::Config(format!("failed to build HTTP client: {err}")))?;
        Self::with_client(http, server_url, participant_id)
    }

    pub fn with_client(
        http: Client,
        server_url: &str,
        participant_id: ParticipantId,
    ) -> Result<Self, SyncError> {
        let server_url = Url::parse(server_url)
            .map_err(|err| SyncError::Config(format!("invalid server_url {server_url}: {err}")))?;
        if server_url.cannot_be_a_base() {
            return Err(SyncError::Config(format!(
                "server_url cannot carry paths: {server_url}"
            )));
        }
        Ok(Self {
            http,
            server_url,
            participant_id,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.server_url.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("server_url cannot be a base: {}", self.server_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn identity(&self) -> [(&'static str, &str); 1] {
        [("participant_id", self.participant_id.as_str())]
    }

    async fn send_message_impl(
        &self,
        conversation_id: &ConversationId,
        request: SendMessageRequest,
    ) -> Result<SendMessageResponse> {
        let url = self.endpoint(&["conversations", conversation_id.as_str(), "messages"])?;
        let response = self
            .http
            .post(url)
            .query(&self.identity())
            .json(&request)
            .send()
            .await
            .with_context(|| format!("failed to send message to {conversation_id}"))?;
        decode(response).await
    }

    async fn mark_read_impl(
        &self,
        conversation_id: &ConversationId,
        message_ids: Vec<PermanentId>,
    ) -> Result<MarkReadResponse> {
        let url = self.endpoint(&["conversations", conversation_id.as_str(), "read"])?;
        let response = self
            .http
            .post(url)
            .query(&self.identity())
            .json(&MarkReadRequest { message_ids })
            .send()
            .await
            .with_context(|| format!("failed to mark messages read in {conversation_id}"))?;
        decode(response).await
    }

    async fn poll_conversation_impl(&self, conversation_id: &ConversationId) -> Result<PollResponse> {
        let url = self.endpoint(&["conversations", conversation_id.as_str(), "messages"])?;
        let response = self
            .http
            .get(url)
            .query(&self.identity())
            .send()
            .await
            .with_context(|| format!("failed to poll {conversation_id}"))?;
        decode(response).await
    }

    async fn list_conversations_impl(&self) -> Result<Vec<ConversationMeta>> {
        let url = self.endpoint(&["conversations"])?;
        let response = self
            .http
            .get(url)
            .query(&self.identity())
            .send()
            .await
            .context("failed to list conversations")?;
        let body: ConversationListResponse = decode(response).await?;
        Ok(body.conversations)
    }

    async fn upload_attachment_impl(&self, upload: AttachmentUpload) -> Result<UploadResponse> {
        let url = self.endpoint(&["attachments"])?;
        let response = self
            .http
            .post(url)
            .query(&[
                ("participant_id", self.participant_id.as_str()),
                ("filename", upload.filename.as_str()),
                ("media_type", upload.media_type.as_str()),
            ])
            .header(reqwest::header::CONTENT_TYPE, upload.media_type.as_str())
            .body(upload.bytes)
            .send()
            .await
            .with_context(|| format!("failed to upload attachment {}", upload.filename))?;
        decode(response).await
    }

    async fn request_assistant_reply_impl(
        &self,
        request: AssistantRequest,
    ) -> Result<AssistantResponse> {
        let url = self.endpoint(&["assistant", "reply"])?;
        let response = self
            .http
            .post(url)
            .query(&self.identity())
            .json(&request)
            .send()
            .await
            .with_context(|| {
                format!("failed to request assistant reply for {}", request.conversation_id)
            })?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(SyncError::from_status(status.as_u16(), &body).into());
    }
    response
        .json::<T>()
        .await
        .context("server returned a malformed response body")
}

fn classified<T>(result: Result<T>) -> Result<T, SyncError> {
    result.map_err(|err| {
        let classified = SyncError::classify(&err);
        debug!(error = %format!("{err:#}"), ?classified, "transport call failed");
        classified
    })
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        request: SendMessageRequest,
    ) -> Result<SendMessageResponse, SyncError> {
        classified(self.send_message_impl(conversation_id, request).await)
    }

    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        message_ids: Vec<PermanentId>,
    ) -> Result<MarkReadResponse, SyncError> {
        classified(self.mark_read_impl(conversation_id, message_ids).await)
    }

    async fn poll_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<PollResponse, SyncError> {
        classified(self.poll_conversation_impl(conversation_id).await)
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationMeta>, SyncError> {
        classified(self.list_conversations_impl().await)
    }

    async fn upload_attachment(
        &self,
        upload: AttachmentUpload,
    ) -> Result<UploadResponse, SyncError> {
        classified(self.upload_attachment_impl(upload).await)
    }

    async fn request_assistant_reply(
        &self,
        request: AssistantRequest,
    ) -> Result<AssistantResponse, SyncError> {
        classified(self.request_assistant_reply_impl(request).await)
    }
}

/// A live push channel. Dropping `outbound` closes the writer; `inbound`
/// ends when the server closes or the socket fails.
#[derive(Debug)]
pub struct PushConnection {
    pub outbound: mpsc::UnboundedSender<ClientRequest>,
    pub inbound: mpsc::UnboundedReceiver<Result<ServerEvent, SyncError>>,
}

#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self) -> Result<PushConnection, SyncError>;
}

pub struct WsPushConnector {
    server_url: String,
    participant_id: ParticipantId,
}

impl WsPushConnector {
    pub fn new(server_url: impl Into<String>, participant_id: ParticipantId) -> Self {
        Self {
            server_url: server_url.into(),
            participant_id,
        }
    }

    async fn open(&self) -> Result<PushConnection> {
        let ws_url = push_url(&self.server_url, &self.participant_id)?;
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientRequest>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(request) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&request) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "failed to encode push frame");
                        continue;
                    }
                };
                if let Err(err) = ws_writer.send(WsMessage::Text(text)).await {
                    warn!(error = %err, "websocket send failed");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        let event = serde_json::from_str::<ServerEvent>(&text).map_err(|err| {
                            SyncError::Validation(format!("invalid server event: {err}"))
                        });
                        if inbound_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        let _ = inbound_tx.send(Err(SyncError::TransientNetwork(format!(
                            "websocket receive failed: {err}"
                        ))));
                        break;
                    }
                }
            }
            debug!("push channel reader finished");
        });

        Ok(PushConnection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[async_trait]
impl PushConnector for WsPushConnector {
    async fn connect(&self) -> Result<PushConnection, SyncError> {
        classified(self.open().await)
    }
}

/// `http(s)://host[/base]` → `ws(s)://host[/base]/ws?participant_id=…`.
pub fn push_url(server_url: &str, participant_id: &ParticipantId) -> Result<Url> {
    let mut url =
        Url::parse(server_url).with_context(|| format!("invalid server_url: {server_url}"))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => bail!("server_url must start with http:// or https://, got {other}://"),
    };
    url.set_scheme(scheme)
        .map_err(|()| anyhow!("cannot switch {server_url} to {scheme}"))?;
    url.path_segments_mut()
        .map_err(|()| anyhow!("server_url cannot be a base: {server_url}"))?
        .pop_if_empty()
        .push("ws");
    url.query_pairs_mut()
        .clear()
        .append_pair("participant_id", participant_id.as_str());
    Ok(url)
}

/// Session-scoped owner of the push connection.
pub struct ChannelManager {
    connector: Arc<dyn PushConnector>,
    outbound: Option<mpsc::UnboundedSender<ClientRequest>>,
    inbound: Option<mpsc::UnboundedReceiver<Result<ServerEvent, SyncError>>>,
}

impl ChannelManager {
    pub fn new(connector: Arc<dyn PushConnector>) -> Self {
        Self {
            connector,
            outbound: None,
            inbound: None,
        }
    }

    pub fn connector(&self) -> Arc<dyn PushConnector> {
        Arc::clone(&self.connector)
    }

    pub fn is_attached(&self) -> bool {
        self.inbound.is_some()
    }

    pub fn attach(&mut self, connection: PushConnection) {
        self.outbound = Some(connection.outbound);
        self.inbound = Some(connection.inbound);
    }

    pub fn disconnect(&mut self) {
        self.outbound = None;
        self.inbound = None;
    }

    /// Queues a frame. Returns false when no channel is attached or the
    /// writer has gone away.
    pub fn send(&self, request: ClientRequest) -> bool {
        match &self.outbound {
            Some(outbound) => outbound.send(request).is_ok(),
            None => false,
        }
    }

    /// Next inbound event; `None` means the channel was lost. Pending forever
    /// while detached.
    pub async fn next_event(&mut self) -> Option<Result<ServerEvent, SyncError>> {
        match self.inbound.as_mut() {
            Some(inbound) => inbound.recv().await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
