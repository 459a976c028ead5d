//! Client-side chat synchronization.
//!
//! Keeps each conversation's message list consistent across the push channel
//! and periodic polls, reconciles optimistic sends with server-confirmed
//! records, batches read receipts, supervises the push connection and relays
//! typing indicators. Hosts drive it through [`SyncHandle`] and render the
//! [`ClientEvent`] stream.

pub mod assistant;
pub mod config;
pub mod engine;
pub mod error;
pub mod merge;
pub mod read_receipts;
pub mod reconciler;
pub mod store;
pub mod supervisor;
pub mod transport;
pub mod typing;

pub use config::{load_settings, load_settings_from, SyncSettings};
pub use engine::{
    ClientEvent, ConversationSnapshot, EngineCommand, LocalActor, SyncEngine, SyncErrorEvent,
    SyncHandle,
};
pub use error::SyncError;
pub use read_receipts::{NoopVisibilityObserver, VisibilityContext, VisibilityObserver};
pub use supervisor::ConnectionState;
pub use transport::{
    AttachmentUpload, ChatApi, HttpChatApi, PushConnection, PushConnector, WsPushConnector,
};
