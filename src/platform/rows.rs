//! Wire-row shapes and their re-validation into domain entities.
//!
//! Remote query results are loosely typed; nothing past this module trusts
//! the wire shape. A row that fails to decode is an `AppError::Decode`,
//! never a panic.

use crate::domain::conversation::{Conversation, ParticipantPair};
use crate::domain::message::{DeliveryStatus, MessageId, SendState, ThreadMessage};
use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: Uuid,
    pub participant_low: Uuid,
    pub participant_high: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub last_message_at: OffsetDateTime,
    #[serde(default)]
    pub last_message_preview: String,
    #[serde(default)]
    pub unread_low: u32,
    #[serde(default)]
    pub unread_high: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub status: DeliveryStatus,
}

/// Re-validates a conversation row into the typed entity.
///
/// # Errors
/// Returns `AppError::Decode` if the row is malformed, including a pair of
/// identical participant ids.
pub fn decode_conversation(value: Value) -> Result<Conversation> {
    let row: ConversationRow = serde_json::from_value(value)?;
    let participants = ParticipantPair::new(row.participant_low, row.participant_high)
        .map_err(|_| AppError::Decode("conversation row has identical participants".into()))?;
    Ok(Conversation {
        id: row.id,
        participants,
        last_message_at: row.last_message_at,
        last_message_preview: row.last_message_preview,
        unread_low: row.unread_low,
        unread_high: row.unread_high,
    })
}

/// Re-validates a message row. Rows from the store are canonical and
/// confirmed by definition.
///
/// # Errors
/// Returns `AppError::Decode` if the row is malformed or carries an unknown
/// status.
pub fn decode_message(value: Value) -> Result<ThreadMessage> {
    let row: MessageRow = serde_json::from_value(value)?;
    Ok(ThreadMessage {
        id: MessageId::Canonical(row.id),
        conversation_id: row.conversation_id,
        sender_id: row.sender_id,
        recipient_id: row.recipient_id,
        content: row.content,
        media_url: row.media_url,
        sent_at: row.created_at,
        status: row.status,
        send_state: SendState::Confirmed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_message_rejects_unknown_status() {
        let value = json!({
            "id": Uuid::new_v4(),
            "conversation_id": Uuid::new_v4(),
            "sender_id": Uuid::new_v4(),
            "recipient_id": Uuid::new_v4(),
            "content": "hi",
            "created_at": "2026-01-10T12:00:00Z",
            "status": "vanished",
        });
        assert!(matches!(decode_message(value), Err(AppError::Decode(_))));
    }

    #[test]
    fn decode_conversation_rejects_identical_participants() {
        let user = Uuid::new_v4();
        let value = json!({
            "id": Uuid::new_v4(),
            "participant_low": user,
            "participant_high": user,
            "last_message_at": "2026-01-10T12:00:00Z",
        });
        assert!(matches!(decode_conversation(value), Err(AppError::Decode(_))));
    }

    #[test]
    fn decode_conversation_defaults_optional_fields() {
        let value = json!({
            "id": Uuid::new_v4(),
            "participant_low": Uuid::new_v4(),
            "participant_high": Uuid::new_v4(),
            "last_message_at": "2026-01-10T12:00:00Z",
        });
        let conversation = decode_conversation(value).expect("row should decode");
        assert!(conversation.last_message_preview.is_empty());
    }
}
