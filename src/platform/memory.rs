//! In-memory implementation of the platform seams.
//!
//! Backs the integration tests and the host app's preview mode. Behaves
//! like the hosted platform where it matters: the canonical-pair uniqueness
//! constraint, change feeds on every mutating row operation, best-effort
//! typing topics, and injectable store failures.

use crate::config::Config;
use crate::domain::conversation::ParticipantPair;
use crate::domain::message::DeliveryStatus;
use crate::domain::typing::TypingSignal;
use crate::error::{AppError, Result};
use crate::platform::rows::{ConversationRow, MessageRow};
use crate::platform::{BlobStore, Broadcast, ConversationChange, DataStore, MessageEvent, NewMessageRow};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use time::OffsetDateTime;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug)]
pub struct InMemoryPlatform {
    conversations: DashMap<Uuid, ConversationRow>,
    by_pair: DashMap<ParticipantPair, Uuid>,
    messages: DashMap<Uuid, MessageRow>,
    conversation_feeds: DashMap<Uuid, broadcast::Sender<ConversationChange>>,
    message_feeds: DashMap<Uuid, broadcast::Sender<MessageEvent>>,
    typing_topics: DashMap<Uuid, broadcast::Sender<TypingSignal>>,
    blobs: DashMap<String, (String, Bytes)>,
    blob_puts: AtomicUsize,
    fail_next_message_insert: AtomicBool,
    feed_capacity: usize,
    typing_capacity: usize,
}

impl InMemoryPlatform {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            conversations: DashMap::new(),
            by_pair: DashMap::new(),
            messages: DashMap::new(),
            conversation_feeds: DashMap::new(),
            message_feeds: DashMap::new(),
            typing_topics: DashMap::new(),
            blobs: DashMap::new(),
            blob_puts: AtomicUsize::new(0),
            fail_next_message_insert: AtomicBool::new(false),
            feed_capacity: config.messaging.feed_capacity,
            typing_capacity: config.presence.channel_capacity,
        }
    }

    /// Makes the next `insert_message` fail with a transient store error.
    pub fn fail_next_message_insert(&self) {
        self.fail_next_message_insert.store(true, Ordering::SeqCst);
    }

    /// Number of blob uploads that reached the store.
    #[must_use]
    pub fn blob_put_count(&self) -> usize {
        self.blob_puts.load(Ordering::SeqCst)
    }

    /// Number of message rows held, across all conversations.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Number of conversation rows held.
    #[must_use]
    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }

    /// Closes a user's message feed, as the platform does when a realtime
    /// connection drops. Live receivers observe the close once the queued
    /// backlog is consumed.
    pub fn close_message_feed(&self, user_id: Uuid) {
        self.message_feeds.remove(&user_id);
    }

    /// Reclaims feed and topic channels with no remaining receivers.
    pub fn perform_gc(&self) {
        self.conversation_feeds.retain(|_, tx| tx.receiver_count() > 0);
        self.message_feeds.retain(|_, tx| tx.receiver_count() > 0);
        self.typing_topics.retain(|_, tx| tx.receiver_count() > 0);
    }

    fn conversation_feed(&self, user_id: Uuid) -> broadcast::Sender<ConversationChange> {
        self.conversation_feeds
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(self.feed_capacity).0)
            .value()
            .clone()
    }

    fn message_feed(&self, user_id: Uuid) -> broadcast::Sender<MessageEvent> {
        self.message_feeds
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(self.feed_capacity).0)
            .value()
            .clone()
    }

    fn notify_conversation(&self, row: &ConversationRow) {
        let change = ConversationChange { conversation_id: row.id };
        for user_id in [row.participant_low, row.participant_high] {
            if let Some(tx) = self.conversation_feeds.get(&user_id) {
                let _ = tx.send(change);
            }
        }
    }

    fn notify_message(&self, user_id: Uuid, event: MessageEvent) {
        if let Some(tx) = self.message_feeds.get(&user_id) {
            let _ = tx.send(event);
        }
    }
}

#[async_trait]
impl DataStore for InMemoryPlatform {
    async fn get_conversation(&self, conversation_id: Uuid) -> Result<Option<Value>> {
        self.conversations
            .get(&conversation_id)
            .map(|row| serde_json::to_value(row.value()).map_err(AppError::from))
            .transpose()
    }

    async fn find_conversation(&self, pair: ParticipantPair) -> Result<Option<Value>> {
        let Some(id) = self.by_pair.get(&pair).map(|entry| *entry.value()) else {
            return Ok(None);
        };
        self.get_conversation(id).await
    }

    async fn insert_conversation(&self, pair: ParticipantPair) -> Result<Value> {
        // The entry guard makes lookup-then-insert atomic, so concurrent
        // creators race exactly like they do against a unique index.
        match self.by_pair.entry(pair) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(AppError::Conflict),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let row = ConversationRow {
                    id: Uuid::new_v4(),
                    participant_low: pair.low(),
                    participant_high: pair.high(),
                    last_message_at: OffsetDateTime::now_utc(),
                    last_message_preview: String::new(),
                    unread_low: 0,
                    unread_high: 0,
                };
                let value = serde_json::to_value(&row)?;
                self.conversations.insert(row.id, row.clone());
                slot.insert(row.id);
                self.notify_conversation(&row);
                Ok(value)
            }
        }
    }

    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<Value>> {
        let mut rows: Vec<ConversationRow> = self
            .conversations
            .iter()
            .filter(|entry| entry.participant_low == user_id || entry.participant_high == user_id)
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        rows.into_iter().map(|row| serde_json::to_value(row).map_err(AppError::from)).collect()
    }

    async fn touch_conversation(
        &self,
        conversation_id: Uuid,
        last_message_at: OffsetDateTime,
        preview: &str,
        recipient_id: Uuid,
    ) -> Result<()> {
        let snapshot = {
            let mut row = self.conversations.get_mut(&conversation_id).ok_or(AppError::NotFound)?;
            row.last_message_at = last_message_at;
            row.last_message_preview = preview.to_owned();
            if row.participant_low == recipient_id {
                row.unread_low += 1;
            } else if row.participant_high == recipient_id {
                row.unread_high += 1;
            } else {
                return Err(AppError::NotFound);
            }
            row.clone()
        };
        self.notify_conversation(&snapshot);
        Ok(())
    }

    async fn clear_unread(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()> {
        let snapshot = {
            let mut row = self.conversations.get_mut(&conversation_id).ok_or(AppError::NotFound)?;
            if row.participant_low == user_id {
                row.unread_low = 0;
            } else if row.participant_high == user_id {
                row.unread_high = 0;
            } else {
                return Err(AppError::NotFound);
            }
            row.clone()
        };
        self.notify_conversation(&snapshot);
        Ok(())
    }

    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Value>> {
        let mut rows: Vec<MessageRow> = self
            .messages
            .iter()
            .filter(|entry| entry.conversation_id == conversation_id)
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        rows.into_iter().map(|row| serde_json::to_value(row).map_err(AppError::from)).collect()
    }

    async fn insert_message(&self, new: NewMessageRow) -> Result<Value> {
        if self.fail_next_message_insert.swap(false, Ordering::SeqCst) {
            return Err(AppError::TransientStore("injected store failure".into()));
        }
        let row = MessageRow {
            id: Uuid::new_v4(),
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            recipient_id: new.recipient_id,
            content: new.content,
            media_url: new.media_url,
            created_at: new.sent_at,
            status: DeliveryStatus::Sent,
        };
        let value = serde_json::to_value(&row)?;
        self.messages.insert(row.id, row.clone());
        self.notify_message(row.recipient_id, MessageEvent::Inserted(value.clone()));
        Ok(value)
    }

    async fn update_message_status(&self, message_id: Uuid, status: DeliveryStatus) -> Result<()> {
        let (sender_id, value) = {
            let mut row = self.messages.get_mut(&message_id).ok_or(AppError::NotFound)?;
            row.status = status;
            (row.sender_id, serde_json::to_value(row.value())?)
        };
        self.notify_message(sender_id, MessageEvent::Updated(value));
        Ok(())
    }

    fn subscribe_conversations(&self, user_id: Uuid) -> broadcast::Receiver<ConversationChange> {
        self.conversation_feed(user_id).subscribe()
    }

    fn subscribe_messages(&self, user_id: Uuid) -> broadcast::Receiver<MessageEvent> {
        self.message_feed(user_id).subscribe()
    }
}

#[async_trait]
impl Broadcast for InMemoryPlatform {
    async fn publish(&self, signal: TypingSignal) -> Result<()> {
        // At-most-once, best-effort: no topic or no listener means the
        // signal is simply gone.
        if let Some(tx) = self.typing_topics.get(&signal.conversation_id) {
            let _ = tx.send(signal);
        }
        Ok(())
    }

    fn subscribe(&self, conversation_id: Uuid) -> broadcast::Receiver<TypingSignal> {
        self.typing_topics
            .entry(conversation_id)
            .or_insert_with(|| broadcast::channel(self.typing_capacity).0)
            .value()
            .subscribe()
    }
}

#[async_trait]
impl BlobStore for InMemoryPlatform {
    async fn put(&self, key: &str, content_type: &str, bytes: Bytes) -> Result<String> {
        self.blob_puts.fetch_add(1, Ordering::SeqCst);
        self.blobs.insert(key.to_owned(), (content_type.to_owned(), bytes));
        Ok(format!("memory://attachments/{key}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_conversation_enforces_pair_uniqueness() {
        let platform = InMemoryPlatform::new(&Config::default());
        let pair = ParticipantPair::new(Uuid::new_v4(), Uuid::new_v4()).unwrap();

        platform.insert_conversation(pair).await.unwrap();
        assert!(matches!(platform.insert_conversation(pair).await, Err(AppError::Conflict)));
        assert_eq!(platform.conversation_count(), 1);
    }

    #[tokio::test]
    async fn gc_reclaims_stale_feeds() {
        let platform = InMemoryPlatform::new(&Config::default());
        let user = Uuid::new_v4();

        let rx = platform.subscribe_messages(user);
        assert_eq!(platform.message_feeds.len(), 1);

        drop(rx);
        platform.perform_gc();
        assert_eq!(platform.message_feeds.len(), 0);
    }
}
