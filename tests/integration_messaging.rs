mod common;

use common::{attachment_service, conversation_store, open_thread, test_platform};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use tokio::sync::broadcast;
use uuid::Uuid;
use waveline_messaging::domain::conversation::ParticipantPair;
use waveline_messaging::domain::message::{CorrelationKey, DeliveryStatus, MessageId, SendState};
use waveline_messaging::error::{AppError, Result as AppResult};
use waveline_messaging::platform::{
    ConversationChange, DataStore, InMemoryPlatform, MessageEvent, NewMessageRow,
};
use waveline_messaging::services::thread::ThreadController;

fn provisional_key(controller: &ThreadController, index: usize) -> CorrelationKey {
    match &controller.messages()[index].id {
        MessageId::Provisional(key) => key.clone(),
        MessageId::Canonical(id) => panic!("expected a provisional message, found canonical {id}"),
    }
}

#[tokio::test]
async fn first_contact_creates_one_conversation_and_reaches_seen() {
    let (platform, config) = test_platform();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    // Bob already has the thread on screen when the first message lands.
    let mut bob_thread = open_thread(&platform, &config, bob, alice).await;
    let mut alice_thread = open_thread(&platform, &config, alice, bob).await;
    assert_eq!(platform.conversation_count(), 1);

    alice_thread.send_message("hello".into(), None).await.unwrap();
    assert_eq!(alice_thread.messages().len(), 1);
    assert_eq!(alice_thread.messages()[0].send_state, SendState::Confirmed);
    assert!(alice_thread.messages()[0].id.canonical().is_some());

    // Bob's open, visible thread receives the insert and marks it seen.
    assert!(bob_thread.next_remote().await.unwrap());
    assert_eq!(bob_thread.messages().len(), 1);
    assert_eq!(bob_thread.messages()[0].status, DeliveryStatus::Seen);

    // The status update flows back to Alice's copy.
    assert!(alice_thread.next_remote().await.unwrap());
    assert_eq!(alice_thread.messages()[0].status, DeliveryStatus::Seen);
}

#[tokio::test]
async fn own_echo_is_not_duplicated() {
    let (platform, config) = test_platform();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    let mut alice_thread = open_thread(&platform, &config, alice, bob).await;
    alice_thread.send_message("hello".into(), None).await.unwrap();

    // Replay the canonical row as if the push echo arrived after the write
    // confirmation.
    let rows = platform.list_messages(alice_thread.conversation_id()).await.unwrap();
    assert_eq!(rows.len(), 1);
    alice_thread.apply_remote(MessageEvent::Inserted(rows[0].clone())).await.unwrap();

    assert_eq!(alice_thread.messages().len(), 1, "the echo must collapse into the existing entry");
}

#[tokio::test]
async fn failed_send_stays_visible_and_can_be_retried() {
    let (platform, config) = test_platform();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    let mut thread = open_thread(&platform, &config, alice, bob).await;
    platform.fail_next_message_insert();

    let result = thread.send_message("did you get this?".into(), None).await;
    assert!(matches!(result, Err(AppError::TransientStore(_))));

    // Never silently dropped: the entry is there, attributably failed.
    assert_eq!(thread.messages().len(), 1);
    assert_eq!(thread.messages()[0].send_state, SendState::Failed);
    assert_eq!(platform.message_count(), 0);

    let key = provisional_key(&thread, 0);
    thread.retry_send(&key).await.unwrap();
    assert_eq!(thread.messages().len(), 1);
    assert_eq!(thread.messages()[0].send_state, SendState::Confirmed);
    assert_eq!(platform.message_count(), 1);
}

#[tokio::test]
async fn retry_of_unknown_key_is_rejected() {
    let (platform, config) = test_platform();
    let alice = Uuid::new_v4();

    let mut thread = open_thread(&platform, &config, alice, Uuid::new_v4()).await;
    let key = CorrelationKey {
        sender_id: alice,
        content: "never sent".into(),
        sent_at: OffsetDateTime::now_utc(),
    };
    assert!(matches!(thread.retry_send(&key).await, Err(AppError::NotFound)));
}

#[tokio::test]
async fn status_never_regresses() {
    let (platform, config) = test_platform();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    let mut bob_thread = open_thread(&platform, &config, bob, alice).await;
    let mut alice_thread = open_thread(&platform, &config, alice, bob).await;

    alice_thread.send_message("hello".into(), None).await.unwrap();
    assert!(bob_thread.next_remote().await.unwrap());
    assert!(alice_thread.next_remote().await.unwrap());
    assert_eq!(alice_thread.messages()[0].status, DeliveryStatus::Seen);

    // A stale update reporting the original status must be discarded.
    let mut rows = platform.list_messages(alice_thread.conversation_id()).await.unwrap();
    let mut stale = rows.remove(0);
    stale["status"] = serde_json::json!("sent");
    alice_thread.apply_remote(MessageEvent::Updated(stale)).await.unwrap();

    assert_eq!(alice_thread.messages()[0].status, DeliveryStatus::Seen);
}

#[tokio::test]
async fn mark_seen_is_idempotent_and_skips_own_messages() {
    let (platform, config) = test_platform();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    let mut alice_thread = open_thread(&platform, &config, alice, bob).await;
    alice_thread.send_message("hello".into(), None).await.unwrap();
    let id = alice_thread.messages()[0].id.canonical().unwrap();

    // Alice cannot see her own message into the seen state.
    alice_thread.mark_seen(&[id]).await.unwrap();
    assert_eq!(alice_thread.messages()[0].status, DeliveryStatus::Sent);

    let mut bob_thread = open_thread(&platform, &config, bob, alice).await;
    assert_eq!(bob_thread.messages()[0].status, DeliveryStatus::Seen, "opening the thread marks history seen");

    // Re-marking is a no-op, not an error.
    bob_thread.mark_seen(&[id]).await.unwrap();
    assert_eq!(bob_thread.messages()[0].status, DeliveryStatus::Seen);
}

#[tokio::test]
async fn hidden_thread_leaves_arrivals_unseen() {
    let (platform, config) = test_platform();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    let mut bob_thread = open_thread(&platform, &config, bob, alice).await;
    bob_thread.set_visible(false).await.unwrap();

    let mut alice_thread = open_thread(&platform, &config, alice, bob).await;
    alice_thread.send_message("hello?".into(), None).await.unwrap();

    assert!(bob_thread.next_remote().await.unwrap());
    assert_eq!(bob_thread.messages()[0].status, DeliveryStatus::Sent);

    // Bringing the thread back on screen marks the backlog seen.
    bob_thread.set_visible(true).await.unwrap();
    assert_eq!(bob_thread.messages()[0].status, DeliveryStatus::Seen);
}

#[tokio::test]
async fn rendered_order_is_non_decreasing() {
    let (platform, config) = test_platform();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    let mut bob_thread = open_thread(&platform, &config, bob, alice).await;
    let mut alice_thread = open_thread(&platform, &config, alice, bob).await;

    alice_thread.send_message("one".into(), None).await.unwrap();
    bob_thread.drain_remote().await.unwrap();
    bob_thread.send_message("two".into(), None).await.unwrap();
    alice_thread.send_message("three".into(), None).await.unwrap();
    alice_thread.drain_remote().await.unwrap();
    bob_thread.drain_remote().await.unwrap();

    for thread in [&alice_thread, &bob_thread] {
        let timestamps: Vec<_> = thread.messages().iter().map(|m| m.sent_at).collect();
        assert!(timestamps.windows(2).all(|w| w[0] <= w[1]), "timestamps must be non-decreasing");
        assert_eq!(thread.messages().len(), 3);
    }
}

#[tokio::test]
async fn opening_a_foreign_thread_is_denied() {
    let (platform, config) = test_platform();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let stranger = Uuid::new_v4();

    let conversation_id = conversation_store(&platform).create_or_get(alice, bob).await.unwrap();
    let store: Arc<dyn DataStore> = Arc::<InMemoryPlatform>::clone(&platform);
    let result = ThreadController::open(
        store,
        attachment_service(&platform, &config),
        &config,
        conversation_id,
        stranger,
    )
    .await;

    assert!(matches!(result, Err(AppError::Authorization(id)) if id == conversation_id));
}

/// Delegating store that inserts a prepared row right after the history
/// snapshot is taken, reproducing a message landing while a thread is
/// being opened.
#[derive(Debug)]
struct SnapshotRacingStore {
    inner: Arc<InMemoryPlatform>,
    pending: Mutex<Option<NewMessageRow>>,
}

#[async_trait::async_trait]
impl DataStore for SnapshotRacingStore {
    async fn get_conversation(&self, conversation_id: Uuid) -> AppResult<Option<Value>> {
        self.inner.get_conversation(conversation_id).await
    }

    async fn find_conversation(&self, pair: ParticipantPair) -> AppResult<Option<Value>> {
        self.inner.find_conversation(pair).await
    }

    async fn insert_conversation(&self, pair: ParticipantPair) -> AppResult<Value> {
        self.inner.insert_conversation(pair).await
    }

    async fn list_conversations(&self, user_id: Uuid) -> AppResult<Vec<Value>> {
        self.inner.list_conversations(user_id).await
    }

    async fn touch_conversation(
        &self,
        conversation_id: Uuid,
        last_message_at: OffsetDateTime,
        preview: &str,
        recipient_id: Uuid,
    ) -> AppResult<()> {
        self.inner.touch_conversation(conversation_id, last_message_at, preview, recipient_id).await
    }

    async fn clear_unread(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<()> {
        self.inner.clear_unread(conversation_id, user_id).await
    }

    async fn list_messages(&self, conversation_id: Uuid) -> AppResult<Vec<Value>> {
        let snapshot = self.inner.list_messages(conversation_id).await?;
        let pending = self.pending.lock().unwrap().take();
        if let Some(row) = pending {
            self.inner.insert_message(row).await?;
        }
        Ok(snapshot)
    }

    async fn insert_message(&self, row: NewMessageRow) -> AppResult<Value> {
        self.inner.insert_message(row).await
    }

    async fn update_message_status(&self, message_id: Uuid, status: DeliveryStatus) -> AppResult<()> {
        self.inner.update_message_status(message_id, status).await
    }

    fn subscribe_conversations(&self, user_id: Uuid) -> broadcast::Receiver<ConversationChange> {
        self.inner.subscribe_conversations(user_id)
    }

    fn subscribe_messages(&self, user_id: Uuid) -> broadcast::Receiver<MessageEvent> {
        self.inner.subscribe_messages(user_id)
    }
}

#[tokio::test]
async fn insert_landing_mid_open_is_not_lost() {
    let (platform, config) = test_platform();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    let conversation_id = conversation_store(&platform).create_or_get(alice, bob).await.unwrap();
    let racing = SnapshotRacingStore {
        inner: Arc::clone(&platform),
        pending: Mutex::new(Some(NewMessageRow {
            conversation_id,
            sender_id: alice,
            recipient_id: bob,
            content: "landed mid-open".into(),
            media_url: None,
            sent_at: OffsetDateTime::now_utc(),
        })),
    };

    let store: Arc<dyn DataStore> = Arc::new(racing);
    let thread = ThreadController::open(
        store,
        attachment_service(&platform, &config),
        &config,
        conversation_id,
        bob,
    )
    .await
    .unwrap();

    // The row missed the snapshot but was queued on the already-held feed.
    assert_eq!(thread.messages().len(), 1);
    assert_eq!(thread.messages()[0].content, "landed mid-open");
    assert_eq!(thread.messages()[0].status, DeliveryStatus::Seen);
}

#[tokio::test]
async fn closed_feed_degrades_to_stale_local_state() {
    let (platform, config) = test_platform();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    let mut bob_thread = open_thread(&platform, &config, bob, alice).await;
    let mut alice_thread = open_thread(&platform, &config, alice, bob).await;

    alice_thread.send_message("hello".into(), None).await.unwrap();
    assert!(bob_thread.next_remote().await.unwrap());

    platform.close_message_feed(bob);
    assert!(!bob_thread.next_remote().await.unwrap(), "a closed feed ends the pump");

    // The thread keeps serving local state; later sends just never arrive.
    alice_thread.send_message("still there?".into(), None).await.unwrap();
    assert_eq!(bob_thread.drain_remote().await.unwrap(), 0);
    assert!(!bob_thread.next_remote().await.unwrap());
    assert_eq!(bob_thread.messages().len(), 1);
    assert_eq!(bob_thread.messages()[0].content, "hello");
}
