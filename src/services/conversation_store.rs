use crate::domain::conversation::{Conversation, ParticipantPair};
use crate::error::{AppError, Result};
use crate::platform::{DataStore, rows};
use opentelemetry::{
    KeyValue, global,
    metrics::Counter,
};
use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use uuid::Uuid;

#[derive(Clone, Debug)]
struct Metrics {
    created_total: Counter<u64>,
    refetch_signals_total: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("waveline-messaging");
        Self {
            created_total: meter
                .u64_counter("waveline_conversations_created_total")
                .with_description("Conversations created, by race outcome")
                .build(),
            refetch_signals_total: meter
                .u64_counter("waveline_conversation_refetch_signals_total")
                .with_description("Change notifications delivered to list subscribers")
                .build(),
        }
    }
}

/// Owns a user's conversation list: queries, lazy get-or-create, and the
/// live change subscription that drives full-refetch updates.
#[derive(Clone, Debug)]
pub struct ConversationStore {
    store: Arc<dyn DataStore>,
    metrics: Metrics,
}

impl ConversationStore {
    #[must_use]
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store, metrics: Metrics::new() }
    }

    /// Lists the user's conversations, most recently active first.
    ///
    /// # Errors
    /// Returns `AppError::TransientStore` if the query fails and
    /// `AppError::Decode` if a row is malformed.
    #[tracing::instrument(err(level = "warn"), skip(self), fields(user_id = %user_id))]
    pub async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<Conversation>> {
        let raw = self.store.list_conversations(user_id).await?;
        let mut conversations =
            raw.into_iter().map(rows::decode_conversation).collect::<Result<Vec<_>>>()?;
        conversations.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        Ok(conversations)
    }

    /// Returns the id of the unique conversation between two users, creating
    /// the row if this is first contact.
    ///
    /// Idempotent and race-safe: the pair is canonicalized, so argument
    /// order never matters, and losing the insert race to a concurrent
    /// creator just means re-fetching the winner's row.
    ///
    /// # Errors
    /// Returns `AppError::Validation` for a self-pair, otherwise whatever
    /// the store surfaced. Nothing is ever partially created.
    #[tracing::instrument(err(level = "warn"), skip(self), fields(user_a = %user_a, user_b = %user_b))]
    pub async fn create_or_get(&self, user_a: Uuid, user_b: Uuid) -> Result<Uuid> {
        let pair = ParticipantPair::new(user_a, user_b)?;

        if let Some(raw) = self.store.find_conversation(pair).await? {
            return Ok(rows::decode_conversation(raw)?.id);
        }

        match self.store.insert_conversation(pair).await {
            Ok(raw) => {
                self.metrics.created_total.add(1, &[KeyValue::new("outcome", "created")]);
                Ok(rows::decode_conversation(raw)?.id)
            }
            Err(AppError::Conflict) => {
                // Lost the race; the winner's row is durable now.
                tracing::debug!("Concurrent creation detected, re-fetching winner");
                self.metrics.created_total.add(1, &[KeyValue::new("outcome", "lost_race")]);
                let raw = self.store.find_conversation(pair).await?.ok_or_else(|| {
                    AppError::TransientStore("conversation missing after uniqueness conflict".into())
                })?;
                Ok(rows::decode_conversation(raw)?.id)
            }
            Err(e) => Err(e),
        }
    }

    /// Registers for change notifications on any conversation row touching
    /// this user and invokes `on_change` per notification. The callback is
    /// expected to trigger a full refetch; the event payload is not worth
    /// patching from at this scale.
    ///
    /// The returned guard must be closed exactly once when the view using
    /// it goes away.
    pub fn subscribe_changes<F>(&self, user_id: Uuid, mut on_change: F) -> ChangeSubscription
    where
        F: FnMut() + Send + 'static,
    {
        let rx = self.store.subscribe_conversations(user_id);
        let metrics = self.metrics.clone();
        let task = tokio::spawn(async move {
            let mut stream = BroadcastStream::new(rx);
            while let Some(item) = stream.next().await {
                match item {
                    Ok(_) => {
                        metrics.refetch_signals_total.add(1, &[]);
                        on_change();
                    }
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        // Full refetch absorbs any number of missed events.
                        tracing::debug!(missed, "Conversation feed lagged, refetching anyway");
                        on_change();
                    }
                }
            }
            tracing::warn!(%user_id, "Conversation feed closed, list is stale until refreshed");
        });
        ChangeSubscription { task: Some(task) }
    }
}

/// Guard for a live conversation-list subscription. `close` releases it;
/// dropping the guard is the backstop for a view torn down without one.
#[derive(Debug)]
pub struct ChangeSubscription {
    task: Option<JoinHandle<()>>,
}

impl ChangeSubscription {
    pub fn close(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
