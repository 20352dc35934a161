use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Delivery state of a message as tracked by the store. Strictly ordered;
/// a message never moves backward. `Delivered` is a reserved intermediate
/// hop for transport-level acknowledgment; current flows move straight from
/// `Sent` to `Seen` and only ever pass through it if the store reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Seen,
}

/// Local lifecycle of an optimistic send. Deliberately separate from
/// `DeliveryStatus`: `Failed` is a terminal UI-side state with a manual
/// retry affordance, not a step in the delivery machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Pending,
    Confirmed,
    Failed,
}

/// Identity of a provisional message before the store has assigned an id:
/// who sent it, what it said, and roughly when. Reconciliation matches on
/// sender + content within a recent-timestamp window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationKey {
    pub sender_id: Uuid,
    pub content: String,
    pub sent_at: OffsetDateTime,
}

impl CorrelationKey {
    #[must_use]
    pub fn matches(&self, sender_id: Uuid, content: &str, sent_at: OffsetDateTime, window: Duration) -> bool {
        self.sender_id == sender_id && self.content == content && (sent_at - self.sent_at).abs() <= window
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageId {
    /// Store-assigned, authoritative once received.
    Canonical(Uuid),
    /// Local only, valid until the durable write (or its echo) lands.
    Provisional(CorrelationKey),
}

impl MessageId {
    #[must_use]
    pub const fn canonical(&self) -> Option<Uuid> {
        match self {
            Self::Canonical(id) => Some(*id),
            Self::Provisional(_) => None,
        }
    }

    #[must_use]
    pub const fn is_provisional(&self) -> bool {
        matches!(self, Self::Provisional(_))
    }
}

#[derive(Debug, Clone)]
pub struct ThreadMessage {
    pub id: MessageId,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub content: String,
    pub media_url: Option<String>,
    pub sent_at: OffsetDateTime,
    pub status: DeliveryStatus,
    pub send_state: SendState,
}

impl ThreadMessage {
    /// Builds the optimistic local entry appended before the durable write.
    #[must_use]
    pub fn provisional(
        conversation_id: Uuid,
        sender_id: Uuid,
        recipient_id: Uuid,
        content: String,
        media_url: Option<String>,
        sent_at: OffsetDateTime,
    ) -> Self {
        let key = CorrelationKey { sender_id, content: content.clone(), sent_at };
        Self {
            id: MessageId::Provisional(key),
            conversation_id,
            sender_id,
            recipient_id,
            content,
            media_url,
            sent_at,
            status: DeliveryStatus::Sent,
            send_state: SendState::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_ordering_matches_lifecycle() {
        assert!(DeliveryStatus::Sent < DeliveryStatus::Delivered);
        assert!(DeliveryStatus::Delivered < DeliveryStatus::Seen);
    }

    #[test]
    fn correlation_key_window() {
        let sender = Uuid::new_v4();
        let at = OffsetDateTime::now_utc();
        let key = CorrelationKey { sender_id: sender, content: "hello".into(), sent_at: at };

        let window = Duration::seconds(30);
        assert!(key.matches(sender, "hello", at + Duration::seconds(5), window));
        assert!(!key.matches(sender, "hello", at + Duration::seconds(31), window));
        assert!(!key.matches(sender, "other", at, window));
        assert!(!key.matches(Uuid::new_v4(), "hello", at, window));
    }
}
