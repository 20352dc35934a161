use crate::config::PresenceConfig;
use crate::domain::typing::{TypingEvent, TypingSignal};
use crate::platform::Broadcast;
use opentelemetry::{
    KeyValue, global,
    metrics::Counter,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Clone, Debug)]
struct Metrics {
    published_total: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("waveline-messaging");
        Self {
            published_total: meter
                .u64_counter("waveline_typing_signals_published_total")
                .with_description("Typing signals published, by kind")
                .build(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalTyping {
    Idle,
    Typing,
}

/// What the receiver side just learned about the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingUpdate {
    /// Peer started (or refreshed) typing; show the indicator.
    Started,
    /// Peer said stop; clear the indicator.
    Stopped,
    /// No refresh within the expiry window; clear the indicator. The only
    /// defense against a peer that vanished mid-type.
    Expired,
}

/// The ephemeral typing-presence protocol for one conversation.
///
/// Sender side is edge-triggered: one `TYPING_START` per idle-to-typing
/// transition, one `TYPING_STOP` on clear, send, or teardown, never one
/// per keystroke. Receiver side keeps a single expiry deadline that each
/// `TYPING_START` replaces rather than stacks.
///
/// Acquired when a conversation becomes active and closed when it stops
/// being active; on a conversation switch, close the old channel before
/// acquiring the new one.
#[derive(Debug)]
pub struct TypingChannel {
    broadcast: Arc<dyn Broadcast>,
    conversation_id: Uuid,
    local_user: Uuid,
    rx: Option<broadcast::Receiver<TypingSignal>>,
    local_state: LocalTyping,
    peer_typing: bool,
    deadline: Option<Instant>,
    expiry: Duration,
    metrics: Metrics,
}

enum Step {
    Signal(Result<TypingSignal, broadcast::error::RecvError>),
    Expired,
}

impl TypingChannel {
    #[must_use]
    pub fn acquire(
        broadcast: Arc<dyn Broadcast>,
        config: &PresenceConfig,
        conversation_id: Uuid,
        local_user: Uuid,
    ) -> Self {
        let rx = broadcast.subscribe(conversation_id);
        tracing::debug!(%conversation_id, "Typing channel acquired");
        Self {
            broadcast,
            conversation_id,
            local_user,
            rx: Some(rx),
            local_state: LocalTyping::Idle,
            peer_typing: false,
            deadline: None,
            expiry: Duration::from_millis(config.typing_expiry_ms),
            metrics: Metrics::new(),
        }
    }

    #[must_use]
    pub const fn is_peer_typing(&self) -> bool {
        self.peer_typing
    }

    /// Feeds the current input text. Emits `TYPING_START` once on the first
    /// non-empty keystroke after idle and `TYPING_STOP` once when the input
    /// is cleared; anything in between is silent.
    pub async fn input_changed(&mut self, text: &str) {
        match (self.local_state, text.is_empty()) {
            (LocalTyping::Idle, false) => {
                self.local_state = LocalTyping::Typing;
                self.publish(TypingEvent::TypingStart).await;
            }
            (LocalTyping::Typing, true) => {
                self.local_state = LocalTyping::Idle;
                self.publish(TypingEvent::TypingStop).await;
            }
            _ => {}
        }
    }

    /// A message went out; typing is over.
    pub async fn message_sent(&mut self) {
        if self.local_state == LocalTyping::Typing {
            self.local_state = LocalTyping::Idle;
            self.publish(TypingEvent::TypingStop).await;
        }
    }

    /// Waits for the next indicator change: a peer signal or the expiry of
    /// the current indicator. Returns `None` once the topic is gone; the
    /// indicator then degrades to stale rather than erroring.
    pub async fn next_update(&mut self) -> Option<TypingUpdate> {
        loop {
            let deadline = self.deadline;
            let step = {
                let rx = self.rx.as_mut()?;
                if let Some(deadline) = deadline {
                    tokio::select! {
                        signal = rx.recv() => Step::Signal(signal),
                        () = tokio::time::sleep_until(deadline) => Step::Expired,
                    }
                } else {
                    Step::Signal(rx.recv().await)
                }
            };

            match step {
                Step::Expired => {
                    self.peer_typing = false;
                    self.deadline = None;
                    return Some(TypingUpdate::Expired);
                }
                Step::Signal(Ok(signal)) => {
                    if signal.sender_id == self.local_user {
                        continue;
                    }
                    match signal.event {
                        TypingEvent::TypingStart => {
                            self.peer_typing = true;
                            // Replace, don't stack: one deadline exists at a
                            // time and each START moves it.
                            self.deadline = Some(Instant::now() + self.expiry);
                            return Some(TypingUpdate::Started);
                        }
                        TypingEvent::TypingStop => {
                            self.peer_typing = false;
                            self.deadline = None;
                            return Some(TypingUpdate::Stopped);
                        }
                    }
                }
                Step::Signal(Err(broadcast::error::RecvError::Lagged(missed))) => {
                    tracing::debug!(missed, "Typing topic lagged");
                }
                Step::Signal(Err(broadcast::error::RecvError::Closed)) => {
                    tracing::warn!(conversation_id = %self.conversation_id, "Typing topic closed, indicator is stale");
                    self.rx = None;
                    self.peer_typing = false;
                    self.deadline = None;
                    return None;
                }
            }
        }
    }

    /// Releases the channel. If the local state is still typing, a
    /// best-effort `TYPING_STOP` goes out first, then the subscription is
    /// dropped. Consuming self keeps the release single-shot and lets the
    /// caller sequence close-old-before-acquire-new on conversation switch.
    pub async fn close(mut self) {
        if self.local_state == LocalTyping::Typing {
            self.local_state = LocalTyping::Idle;
            self.publish(TypingEvent::TypingStop).await;
        }
        self.rx = None;
        tracing::debug!(conversation_id = %self.conversation_id, "Typing channel released");
    }

    async fn publish(&self, event: TypingEvent) {
        let signal = TypingSignal { conversation_id: self.conversation_id, sender_id: self.local_user, event };
        let kind = match event {
            TypingEvent::TypingStart => "start",
            TypingEvent::TypingStop => "stop",
        };
        self.metrics.published_total.add(1, &[KeyValue::new("kind", kind)]);
        // Best-effort by contract; a lost signal costs an indicator, not
        // a message.
        if let Err(e) = self.broadcast.publish(signal).await {
            tracing::warn!(error = %e, "Failed to publish typing signal");
        }
    }
}
