use crate::error::{AppError, Result};
use time::OffsetDateTime;
use uuid::Uuid;

/// The two participants of a conversation, held in canonical sorted order.
/// `new(a, b)` and `new(b, a)` produce the same value, which is what the
/// store's uniqueness constraint hangs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParticipantPair {
    low: Uuid,
    high: Uuid,
}

impl ParticipantPair {
    /// Canonicalizes an unordered pair of user ids.
    ///
    /// # Errors
    /// Returns `AppError::Validation` if both ids are the same user.
    pub fn new(a: Uuid, b: Uuid) -> Result<Self> {
        if a == b {
            return Err(AppError::Validation("A conversation needs two distinct participants".into()));
        }
        if a < b { Ok(Self { low: a, high: b }) } else { Ok(Self { low: b, high: a }) }
    }

    #[must_use]
    pub const fn low(&self) -> Uuid {
        self.low
    }

    #[must_use]
    pub const fn high(&self) -> Uuid {
        self.high
    }

    #[must_use]
    pub fn contains(&self, user_id: Uuid) -> bool {
        self.low == user_id || self.high == user_id
    }

    /// The participant that is not `user_id`, if `user_id` is in the pair.
    #[must_use]
    pub fn other(&self, user_id: Uuid) -> Option<Uuid> {
        if self.low == user_id {
            Some(self.high)
        } else if self.high == user_id {
            Some(self.low)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: Uuid,
    pub participants: ParticipantPair,
    pub last_message_at: OffsetDateTime,
    pub last_message_preview: String,
    pub(crate) unread_low: u32,
    pub(crate) unread_high: u32,
}

impl Conversation {
    /// Unread-message count from the given participant's point of view.
    /// `None` if the user is not a participant.
    #[must_use]
    pub fn unread_for(&self, user_id: Uuid) -> Option<u32> {
        if user_id == self.participants.low() {
            Some(self.unread_low)
        } else if user_id == self.participants.high() {
            Some(self.unread_high)
        } else {
            None
        }
    }
}
