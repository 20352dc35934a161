//! Reconciliation of optimistic local sends against their canonical
//! counterparts.
//!
//! The same merge runs for both asynchronous inputs, the response to our
//! own durable write and the unsolicited push echo, so whichever arrives
//! first claims the provisional entry and the other collapses into a status
//! merge. That order-independence is what keeps a sender from ever seeing
//! their own message twice.

use crate::domain::message::{CorrelationKey, MessageId, SendState, ThreadMessage};
use crate::services::delivery_status::{self, Advance};
use time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A provisional entry matched and was replaced in place.
    ReplacedProvisional,
    /// The canonical id was already present; at most the status moved.
    UpdatedExisting,
    /// New to this thread; inserted in timestamp order.
    Inserted,
}

/// Merges a canonical message into the local ordered list.
///
/// Match order matters: canonical id first (the entry may already have been
/// promoted by the other path), then provisional correlation within the
/// recent-timestamp window. A replaced entry keeps its position; a new one
/// is inserted so the rendered sequence stays non-decreasing in timestamp.
pub fn merge_canonical(list: &mut Vec<ThreadMessage>, incoming: ThreadMessage, window: Duration) -> MergeOutcome {
    if let Some(incoming_id) = incoming.id.canonical() {
        if let Some(existing) = list.iter_mut().find(|m| m.id.canonical() == Some(incoming_id)) {
            if let Advance::Applied(next) = delivery_status::advance(existing.status, incoming.status) {
                existing.status = next;
            }
            existing.send_state = SendState::Confirmed;
            return MergeOutcome::UpdatedExisting;
        }
    }

    let provisional_slot = list.iter().position(|m| match &m.id {
        MessageId::Provisional(key) => {
            m.conversation_id == incoming.conversation_id
                && key.matches(incoming.sender_id, &incoming.content, incoming.sent_at, window)
        }
        MessageId::Canonical(_) => false,
    });

    if let Some(index) = provisional_slot {
        let mut replacement = incoming;
        // The local copy may already be further along than the row we were
        // handed; keep the later status.
        if let Advance::Applied(next) = delivery_status::advance(replacement.status, list[index].status) {
            replacement.status = next;
        }
        list[index] = replacement;
        return MergeOutcome::ReplacedProvisional;
    }

    let index = list.partition_point(|m| m.sent_at <= incoming.sent_at);
    list.insert(index, incoming);
    MergeOutcome::Inserted
}

/// Promotes a provisional entry after its durable write succeeded.
///
/// Matched by correlation key, never by position. Falls back to the general
/// merge when the entry is already gone: that happens when the push echo
/// beat the write confirmation.
pub fn promote(
    list: &mut Vec<ThreadMessage>,
    key: &CorrelationKey,
    canonical: ThreadMessage,
    window: Duration,
) -> MergeOutcome {
    if let Some(index) = list.iter().position(|m| matches!(&m.id, MessageId::Provisional(k) if k == key)) {
        list[index] = canonical;
        return MergeOutcome::ReplacedProvisional;
    }
    merge_canonical(list, canonical, window)
}

/// Marks a provisional entry as failed, keeping it visible for manual
/// retry. Returns false when no such entry exists.
pub fn mark_failed(list: &mut [ThreadMessage], key: &CorrelationKey) -> bool {
    for message in list.iter_mut() {
        if matches!(&message.id, MessageId::Provisional(k) if k == key) {
            message.send_state = SendState::Failed;
            return true;
        }
    }
    false
}
