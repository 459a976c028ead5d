use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chat_sync::{
    load_settings_from, AttachmentUpload, ClientEvent, ConnectionState, LocalActor, SyncEngine,
    SyncHandle, VisibilityContext,
};
use clap::{Parser, ValueEnum};
use shared::domain::{ConversationId, DeliveryState, Message, ParticipantId, SenderRole};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::warn;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Role {
    Customer,
    Vendor,
}

impl From<Role> for SenderRole {
    fn from(value: Role) -> Self {
        match value {
            Role::Customer => SenderRole::Customer,
            Role::Vendor => SenderRole::Vendor,
        }
    }
}

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `server_url` from the settings file.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    participant_id: String,
    #[arg(long, value_enum, default_value = "customer")]
    role: Role,
    #[arg(long, default_value = chat_sync::config::DEFAULT_SETTINGS_FILE)]
    config: PathBuf,
    /// Conversation to open on start.
    #[arg(long)]
    conversation: Option<String>,
    /// Use the conversation-list visibility threshold.
    #[arg(long)]
    list_view: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let mut settings = load_settings_from(&args.config, |key| std::env::var(key).ok())
        .with_context(|| format!("failed to load settings from {}", args.config.display()))?;
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url.trim_end_matches('/').to_string();
    }

    let actor = LocalActor {
        participant_id: ParticipantId::new(args.participant_id),
        role: args.role.into(),
        context: if args.list_view {
            VisibilityContext::List
        } else {
            VisibilityContext::Detail
        },
    };
    println!(
        "Connecting to {} as {} ({})",
        settings.server_url, actor.participant_id, actor.role
    );

    let (handle, engine) = SyncEngine::spawn(settings, actor)?;
    let printer = tokio::spawn(print_events(BroadcastStream::new(handle.subscribe())));

    let mut active = args.conversation.map(ConversationId::new);
    if let Some(conversation_id) = &active {
        handle.open_conversation(conversation_id.clone()).await?;
    }
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match run_line(&handle, &mut active, line).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => println!("! {err:#}"),
        }
    }

    handle.shutdown().await.ok();
    let _ = engine.await;
    printer.abort();
    Ok(())
}

fn print_help() {
    println!(
        "Commands: /open <id>, /close, /list, /read, /resend, /attach <path>, \
         /assistant [json], /reload, /retry, /quit. Anything else is sent as a message."
    );
}

/// Returns false when the session should end.
async fn run_line(
    handle: &SyncHandle,
    active: &mut Option<ConversationId>,
    line: &str,
) -> Result<bool> {
    let (command, rest) = match line.strip_prefix('/') {
        Some(command) => command
            .split_once(' ')
            .map(|(command, rest)| (command, rest.trim()))
            .unwrap_or((command, "")),
        None => {
            let conversation_id = require_active(active)?;
            handle.input_activity().await?;
            handle
                .send_message(conversation_id, Some(line.to_string()), None)
                .await?;
            return Ok(true);
        }
    };

    match command {
        "open" => {
            if rest.is_empty() {
                return Err(anyhow!("usage: /open <conversation id>"));
            }
            let conversation_id = ConversationId::new(rest);
            handle.open_conversation(conversation_id.clone()).await?;
            *active = Some(conversation_id);
        }
        "close" => {
            handle.close_conversation().await?;
            *active = None;
        }
        "list" => handle.refresh_conversations().await?,
        "read" => {
            let conversation_id = require_active(active)?;
            let snapshot = handle.snapshot(conversation_id).await?;
            for message in snapshot.messages.iter() {
                handle.message_visible(message.id.clone(), 1.0).await?;
            }
        }
        "resend" => {
            let conversation_id = require_active(active)?;
            let snapshot = handle.snapshot(conversation_id).await?;
            let failed: Vec<_> = snapshot
                .messages
                .iter()
                .filter(|m| m.delivery == DeliveryState::Failed)
                .filter_map(Message::provisional_id)
                .collect();
            if failed.is_empty() {
                println!("No failed messages.");
            }
            for provisional in failed {
                handle.retry_send(provisional).await?;
            }
        }
        "attach" => {
            let conversation_id = require_active(active)?;
            let upload = read_attachment(Path::new(rest)).await?;
            handle
                .send_message(conversation_id, None, Some(upload))
                .await?;
        }
        "assistant" => {
            let business_context = if rest.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_str(rest).context("business context must be JSON")?
            };
            handle.request_assistant_reply(business_context).await?;
        }
        "reload" => handle.reload_conversation().await?,
        "retry" => handle.retry_connection().await?,
        "quit" | "exit" => return Ok(false),
        "help" => print_help(),
        other => return Err(anyhow!("unknown command /{other}")),
    }
    Ok(true)
}

fn require_active(active: &Option<ConversationId>) -> Result<ConversationId> {
    active
        .clone()
        .ok_or_else(|| anyhow!("no conversation open; use /open <id>"))
}

async fn read_attachment(path: &Path) -> Result<AttachmentUpload> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("invalid attachment path: {}", path.display()))?
        .to_string();
    let media_type = match path.extension().and_then(|ext| ext.to_str()) {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    };
    Ok(AttachmentUpload {
        filename,
        media_type: media_type.to_string(),
        bytes,
    })
}

async fn print_events(mut events: BroadcastStream<ClientEvent>) {
    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "event stream lagged");
                continue;
            }
        };
        match event {
            ClientEvent::ConversationUpdated {
                conversation_id,
                messages,
                unread_count,
            } => {
                println!("--- {conversation_id} ({unread_count} unread)");
                for message in messages.iter() {
                    println!("{}", render_message(message));
                }
            }
            ClientEvent::ConversationsListed { conversations } => {
                for meta in conversations {
                    println!(
                        "* {} [{} unread] {}",
                        meta.id,
                        meta.unread_count,
                        meta.last_message_preview.unwrap_or_default()
                    );
                }
            }
            ClientEvent::TypingChanged {
                conversation_id,
                participants,
            } => {
                if participants.is_empty() {
                    println!("({conversation_id}: nobody typing)");
                } else {
                    let names: Vec<_> = participants.iter().map(|p| p.as_str()).collect();
                    println!("({conversation_id}: {} typing…)", names.join(", "));
                }
            }
            ClientEvent::ConnectionChanged(state) => match state {
                ConnectionState::Connected => println!("[connected]"),
                ConnectionState::Connecting => println!("[connecting…]"),
                ConnectionState::Disconnected => println!("[disconnected]"),
                ConnectionState::Degraded => {
                    println!("[offline: polling only, /retry to reconnect]")
                }
            },
            ClientEvent::MessageFailed {
                conversation_id,
                error,
                ..
            } => println!("! message in {conversation_id} failed: {error}; /resend to retry"),
            ClientEvent::Error(event) => match event.conversation_id {
                Some(conversation_id) => println!("! {conversation_id}: {}", event.error),
                None => println!("! {}", event.error),
            },
        }
    }
}

fn render_message(message: &Message) -> String {
    let status = match message.delivery {
        DeliveryState::Pending => " (sending)",
        DeliveryState::Failed => " (failed)",
        DeliveryState::Sent if message.read => " ✓✓",
        DeliveryState::Sent => "",
    };
    let author = if message.generated_by_assistant {
        "assistant".to_string()
    } else {
        message.sender_role.to_string()
    };
    let body = message.preview().unwrap_or_default();
    format!(
        "  [{}] {author}: {body}{status}",
        message.created_at.format("%H:%M:%S")
    )
}
