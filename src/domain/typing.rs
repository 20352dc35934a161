use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ephemeral typing-presence event. Published on the per-conversation
/// broadcast topic, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TypingEvent {
    TypingStart,
    TypingStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingSignal {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub event: TypingEvent,
}
