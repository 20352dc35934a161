use crate::config::Config;
use crate::domain::attachment::MediaUpload;
use crate::domain::message::{CorrelationKey, DeliveryStatus, MessageId, SendState, ThreadMessage};
use crate::error::{AppError, Result};
use crate::platform::{DataStore, MessageEvent, NewMessageRow, rows};
use crate::services::attachment::AttachmentService;
use crate::services::delivery_status::{self, Advance};
use crate::services::reconcile;
use opentelemetry::{
    KeyValue, global,
    metrics::Counter,
};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Clone, Debug)]
struct Metrics {
    sent_total: Counter<u64>,
    remote_events_total: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("waveline-messaging");
        Self {
            sent_total: meter
                .u64_counter("waveline_messages_sent_total")
                .with_description("Send attempts, by outcome")
                .build(),
            remote_events_total: meter
                .u64_counter("waveline_remote_message_events_total")
                .with_description("Push events applied to open threads, by kind")
                .build(),
        }
    }
}

/// Orchestrates one open two-party conversation: history, optimistic
/// sends reconciled against their confirmations and echoes, seen-marking,
/// and the live message feed.
///
/// Caller-driven: the presentation layer pumps [`drain_remote`] /
/// [`next_remote`] from its event loop, so all state lives on one task and
/// every mutation is an order-independent merge.
///
/// [`drain_remote`]: ThreadController::drain_remote
/// [`next_remote`]: ThreadController::next_remote
#[derive(Debug)]
pub struct ThreadController {
    store: Arc<dyn DataStore>,
    attachments: AttachmentService,
    conversation_id: Uuid,
    current_user: Uuid,
    peer_id: Uuid,
    messages: Vec<ThreadMessage>,
    feed: Option<broadcast::Receiver<MessageEvent>>,
    visible: bool,
    correlation_window: Duration,
    preview_max_chars: usize,
    metrics: Metrics,
}

impl ThreadController {
    /// Opens a conversation for the given user: verifies participation,
    /// acquires the live message feed, loads history ascending, clears the
    /// opener's unread counter, and marks visible history seen. The feed is
    /// subscribed before the history snapshot, so a message landing mid-open
    /// is queued on the feed and merged rather than lost.
    ///
    /// # Errors
    /// Returns `AppError::Authorization` if the user is not one of the two
    /// participants and `AppError::NotFound` for an unknown conversation.
    #[tracing::instrument(
        err(level = "warn"),
        skip(store, attachments, config),
        fields(conversation_id = %conversation_id, user_id = %current_user)
    )]
    pub async fn open(
        store: Arc<dyn DataStore>,
        attachments: AttachmentService,
        config: &Config,
        conversation_id: Uuid,
        current_user: Uuid,
    ) -> Result<Self> {
        let raw = store.get_conversation(conversation_id).await?.ok_or(AppError::NotFound)?;
        let conversation = rows::decode_conversation(raw)?;
        if !conversation.participants.contains(current_user) {
            return Err(AppError::Authorization(conversation_id));
        }
        let peer_id = conversation
            .participants
            .other(current_user)
            .ok_or(AppError::Authorization(conversation_id))?;

        // Subscribe before the snapshot: an insert landing in between is
        // queued on the feed and collapses into the merge below.
        let feed = Some(store.subscribe_messages(current_user));

        let mut messages = store
            .list_messages(conversation_id)
            .await?
            .into_iter()
            .map(rows::decode_message)
            .collect::<Result<Vec<_>>>()?;
        messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at));

        store.clear_unread(conversation_id, current_user).await?;

        let mut controller = Self {
            store,
            attachments,
            conversation_id,
            current_user,
            peer_id,
            messages,
            feed,
            visible: true,
            correlation_window: Duration::seconds(config.messaging.correlation_window_secs),
            preview_max_chars: config.messaging.preview_max_chars,
            metrics: Metrics::new(),
        };
        controller.drain_remote().await?;
        controller.mark_all_seen().await?;

        tracing::debug!(history = controller.messages.len(), "Thread opened");
        Ok(controller)
    }

    #[must_use]
    pub fn messages(&self) -> &[ThreadMessage] {
        &self.messages
    }

    #[must_use]
    pub const fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    #[must_use]
    pub const fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    #[must_use]
    pub const fn is_visible(&self) -> bool {
        self.visible
    }

    /// Tells the controller whether its thread is the one on screen.
    /// Becoming visible marks pending incoming messages seen.
    ///
    /// # Errors
    /// Returns the store error if a seen-update fails.
    pub async fn set_visible(&mut self, visible: bool) -> Result<()> {
        self.visible = visible;
        if visible {
            self.mark_all_seen().await?;
        }
        Ok(())
    }

    /// Sends a message, optimistically: the entry is visible in the local
    /// list before the durable write starts, and is promoted in place (by
    /// correlation key, never by position) once the write confirms.
    ///
    /// # Errors
    /// Returns `AppError::Validation` if the attachment fails local
    /// validation; nothing is appended or uploaded in that case. Returns
    /// the store error if the durable write fails; the entry then stays
    /// visible as failed, awaiting [`retry_send`].
    ///
    /// [`retry_send`]: ThreadController::retry_send
    #[tracing::instrument(
        err(level = "warn"),
        skip(self, content, media),
        fields(conversation_id = %self.conversation_id, has_media = media.is_some())
    )]
    pub async fn send_message(&mut self, content: String, media: Option<MediaUpload>) -> Result<()> {
        // Attachment validation and upload both happen before any message
        // state exists, so a rejection leaves nothing behind.
        let media_url = match media {
            Some(upload) => Some(self.attachments.upload(upload).await?),
            None => None,
        };

        let provisional = ThreadMessage::provisional(
            self.conversation_id,
            self.current_user,
            self.peer_id,
            content,
            media_url,
            OffsetDateTime::now_utc(),
        );
        let MessageId::Provisional(key) = provisional.id.clone() else {
            return Err(AppError::TransientStore("provisional message without correlation key".into()));
        };

        let index = self.messages.partition_point(|m| m.sent_at <= provisional.sent_at);
        self.messages.insert(index, provisional.clone());

        self.write_durable(key, provisional).await
    }

    /// Retries the durable write of a failed send, identified by its
    /// correlation key.
    ///
    /// # Errors
    /// Returns `AppError::NotFound` if no failed entry carries that key;
    /// otherwise behaves like the write phase of [`send_message`].
    ///
    /// [`send_message`]: ThreadController::send_message
    #[tracing::instrument(err(level = "warn"), skip(self, key), fields(conversation_id = %self.conversation_id))]
    pub async fn retry_send(&mut self, key: &CorrelationKey) -> Result<()> {
        let entry = self
            .messages
            .iter_mut()
            .find(|m| matches!(&m.id, MessageId::Provisional(k) if k == key) && m.send_state == SendState::Failed)
            .ok_or(AppError::NotFound)?;
        entry.send_state = SendState::Pending;
        let provisional = entry.clone();

        self.write_durable(key.clone(), provisional).await
    }

    async fn write_durable(&mut self, key: CorrelationKey, provisional: ThreadMessage) -> Result<()> {
        let row = NewMessageRow {
            conversation_id: provisional.conversation_id,
            sender_id: provisional.sender_id,
            recipient_id: provisional.recipient_id,
            content: provisional.content,
            media_url: provisional.media_url,
            sent_at: provisional.sent_at,
        };

        match self.store.insert_message(row).await {
            Ok(raw) => {
                let canonical = rows::decode_message(raw)?;
                let preview: String = canonical.content.chars().take(self.preview_max_chars).collect();
                let (sent_at, recipient_id) = (canonical.sent_at, canonical.recipient_id);

                reconcile::promote(&mut self.messages, &key, canonical, self.correlation_window);
                self.metrics.sent_total.add(1, &[KeyValue::new("outcome", "success")]);

                // The send itself is durable; a failed bump only leaves the
                // list preview behind by one message.
                if let Err(e) = self
                    .store
                    .touch_conversation(self.conversation_id, sent_at, &preview, recipient_id)
                    .await
                {
                    tracing::warn!(error = %e, "Failed to bump conversation after send");
                }
                Ok(())
            }
            Err(e) => {
                reconcile::mark_failed(&mut self.messages, &key);
                self.metrics.sent_total.add(1, &[KeyValue::new("outcome", "failure")]);
                Err(e)
            }
        }
    }

    /// Marks messages addressed to the current user as seen. Idempotent:
    /// already-seen ids and ids the user sent are skipped. Newly seen
    /// messages also clear the viewer's unread counter, so the conversation
    /// list never shows unread for a message on screen.
    ///
    /// # Errors
    /// Returns the first store error encountered; seen-state is monotone
    /// and idempotent, so a partial batch is safe to re-issue.
    pub async fn mark_seen(&mut self, message_ids: &[Uuid]) -> Result<()> {
        let mut newly_seen = false;
        for &id in message_ids {
            let Some((status, sender_id)) = self
                .messages
                .iter()
                .find(|m| m.id.canonical() == Some(id))
                .map(|m| (m.status, m.sender_id))
            else {
                continue;
            };
            if sender_id == self.current_user {
                continue;
            }
            match delivery_status::advance(status, DeliveryStatus::Seen) {
                Advance::Applied(next) => {
                    self.store.update_message_status(id, next).await?;
                    // Relocate after the await: the feed may have merged
                    // meanwhile and moved the entry.
                    if let Some(message) = self.messages.iter_mut().find(|m| m.id.canonical() == Some(id)) {
                        message.status = next;
                    }
                    newly_seen = true;
                }
                Advance::Unchanged | Advance::Regressed => {}
            }
        }
        if newly_seen {
            self.store.clear_unread(self.conversation_id, self.current_user).await?;
        }
        Ok(())
    }

    /// Marks every pending incoming message in the thread as seen.
    ///
    /// # Errors
    /// Propagates the first store error, as in [`mark_seen`].
    ///
    /// [`mark_seen`]: ThreadController::mark_seen
    pub async fn mark_all_seen(&mut self) -> Result<()> {
        let pending: Vec<Uuid> = self
            .messages
            .iter()
            .filter(|m| m.recipient_id == self.current_user && m.status < DeliveryStatus::Seen)
            .filter_map(|m| m.id.canonical())
            .collect();
        self.mark_seen(&pending).await
    }

    /// Applies one push event from the message stream.
    ///
    /// Inserts are reconciled against the local list (the echo of an own
    /// send collapses into its provisional entry); if the thread is the
    /// visible one and the message is addressed to the current user it is
    /// immediately marked seen. Updates apply status by canonical id under
    /// the no-regression rule.
    ///
    /// # Errors
    /// Returns `AppError::Decode` for a malformed row and store errors from
    /// the follow-up seen-marking.
    pub async fn apply_remote(&mut self, event: MessageEvent) -> Result<()> {
        match event {
            MessageEvent::Inserted(raw) => {
                let incoming = rows::decode_message(raw)?;
                if incoming.conversation_id != self.conversation_id {
                    return Ok(());
                }
                self.metrics.remote_events_total.add(1, &[KeyValue::new("kind", "insert")]);

                let id = incoming.id.canonical();
                let addressed_to_me = incoming.recipient_id == self.current_user;
                reconcile::merge_canonical(&mut self.messages, incoming, self.correlation_window);

                if self.visible
                    && addressed_to_me
                    && let Some(id) = id
                {
                    self.mark_seen(&[id]).await?;
                }
            }
            MessageEvent::Updated(raw) => {
                let incoming = rows::decode_message(raw)?;
                if incoming.conversation_id != self.conversation_id {
                    return Ok(());
                }
                self.metrics.remote_events_total.add(1, &[KeyValue::new("kind", "update")]);

                let Some(id) = incoming.id.canonical() else { return Ok(()) };
                if let Some(message) = self.messages.iter_mut().find(|m| m.id.canonical() == Some(id)) {
                    match delivery_status::advance(message.status, incoming.status) {
                        Advance::Applied(next) => message.status = next,
                        Advance::Unchanged => {}
                        Advance::Regressed => {
                            tracing::debug!(message_id = %id, "Discarded regressive status update");
                        }
                    }
                    message.send_state = SendState::Confirmed;
                }
            }
        }
        Ok(())
    }

    /// Applies every event already queued on the feed without waiting.
    /// Returns the number applied. A closed feed degrades to stale: the
    /// controller logs, drops the receiver, and keeps serving local state.
    ///
    /// # Errors
    /// Propagates errors from [`apply_remote`].
    ///
    /// [`apply_remote`]: ThreadController::apply_remote
    pub async fn drain_remote(&mut self) -> Result<usize> {
        let mut applied = 0;
        loop {
            let Some(feed) = self.feed.as_mut() else { return Ok(applied) };
            match feed.try_recv() {
                Ok(event) => {
                    self.apply_remote(event).await?;
                    applied += 1;
                }
                Err(broadcast::error::TryRecvError::Empty) => return Ok(applied),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Message feed lagged, continuing with later events");
                }
                Err(broadcast::error::TryRecvError::Closed) => {
                    tracing::warn!("Message feed closed, thread is stale until reopened");
                    self.feed = None;
                    return Ok(applied);
                }
            }
        }
    }

    /// Waits for the next push event and applies it. Returns false once the
    /// feed is gone (closed or already released).
    ///
    /// # Errors
    /// Propagates errors from [`apply_remote`].
    ///
    /// [`apply_remote`]: ThreadController::apply_remote
    pub async fn next_remote(&mut self) -> Result<bool> {
        loop {
            let Some(feed) = self.feed.as_mut() else { return Ok(false) };
            match feed.recv().await {
                Ok(event) => {
                    self.apply_remote(event).await?;
                    return Ok(true);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Message feed lagged, continuing with later events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::warn!("Message feed closed, thread is stale until reopened");
                    self.feed = None;
                    return Ok(false);
                }
            }
        }
    }

    /// Releases the message feed. Consuming self makes the release happen
    /// exactly once; an in-flight seen-batch elsewhere may still finish,
    /// which is harmless because seen-state is monotone and idempotent.
    pub fn close(mut self) {
        self.feed = None;
        tracing::debug!(conversation_id = %self.conversation_id, "Thread closed, message feed released");
    }
}
