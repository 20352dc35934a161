//! Seams to the hosted data/auth/storage/realtime platform.
//!
//! Everything the services touch outside the process goes through these
//! traits, injected as `Arc<dyn _>` handles at construction so tests can
//! substitute the in-memory implementation. Rows cross this boundary as
//! loosely-typed JSON and are re-validated by [`rows`] before they enter
//! the typed world.

use crate::domain::conversation::ParticipantPair;
use crate::domain::message::DeliveryStatus;
use crate::domain::typing::TypingSignal;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use uuid::Uuid;

pub mod memory;
pub mod rows;

pub use memory::InMemoryPlatform;

/// Change notification for a row of the conversation list. The payload is
/// deliberately thin: subscribers refetch the whole list rather than patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversationChange {
    pub conversation_id: Uuid,
}

/// Push event on a user's message stream: inserts addressed to the user,
/// plus status updates for messages the user sent.
#[derive(Debug, Clone)]
pub enum MessageEvent {
    Inserted(Value),
    Updated(Value),
}

/// Fields of a message row at insert time. The store assigns the canonical
/// id; everything else is client-provided.
#[derive(Debug, Clone)]
pub struct NewMessageRow {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub content: String,
    pub media_url: Option<String>,
    pub sent_at: OffsetDateTime,
}

/// The persistent relational store: filtered/ordered CRU over conversation
/// and message rows plus per-user change feeds. Schema and row-level access
/// control are owned on the platform side.
#[async_trait]
pub trait DataStore: Send + Sync + std::fmt::Debug + 'static {
    async fn get_conversation(&self, conversation_id: Uuid) -> Result<Option<Value>>;
    async fn find_conversation(&self, pair: ParticipantPair) -> Result<Option<Value>>;
    /// Errors with `AppError::Conflict` when a row for the pair already
    /// exists, which is how a lost creation race surfaces.
    async fn insert_conversation(&self, pair: ParticipantPair) -> Result<Value>;
    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<Value>>;
    async fn touch_conversation(
        &self,
        conversation_id: Uuid,
        last_message_at: OffsetDateTime,
        preview: &str,
        recipient_id: Uuid,
    ) -> Result<()>;
    async fn clear_unread(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()>;

    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Value>>;
    async fn insert_message(&self, row: NewMessageRow) -> Result<Value>;
    async fn update_message_status(&self, message_id: Uuid, status: DeliveryStatus) -> Result<()>;

    fn subscribe_conversations(&self, user_id: Uuid) -> broadcast::Receiver<ConversationChange>;
    fn subscribe_messages(&self, user_id: Uuid) -> broadcast::Receiver<MessageEvent>;
}

/// The ephemeral broadcast service: per-conversation topics with
/// at-most-once, best-effort delivery. Nothing published here is persisted.
#[async_trait]
pub trait Broadcast: Send + Sync + std::fmt::Debug + 'static {
    async fn publish(&self, signal: TypingSignal) -> Result<()>;
    fn subscribe(&self, conversation_id: Uuid) -> broadcast::Receiver<TypingSignal>;
}

/// The blob store: bytes + content type in, stable URL out. Size and type
/// validation happens on our side of this seam, before `put` is called.
#[async_trait]
pub trait BlobStore: Send + Sync + std::fmt::Debug + 'static {
    async fn put(&self, key: &str, content_type: &str, bytes: Bytes) -> Result<String>;
}
