//! The delivery-status state machine: `sent` -> `delivered` -> `seen`,
//! no regressions. A reported status that would move a message backward is
//! detected here and discarded by every caller.

use crate::domain::message::DeliveryStatus;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// The reported status moves the message forward; adopt it.
    Applied(DeliveryStatus),
    /// Same status again. Re-marking seen is a no-op, not an error.
    Unchanged,
    /// The reported status would regress the message; discard it.
    Regressed,
}

/// Evaluates a reported status against the current one.
#[must_use]
pub fn advance(current: DeliveryStatus, reported: DeliveryStatus) -> Advance {
    match reported.cmp(&current) {
        Ordering::Greater => Advance::Applied(reported),
        Ordering::Equal => Advance::Unchanged,
        Ordering::Less => Advance::Regressed,
    }
}
