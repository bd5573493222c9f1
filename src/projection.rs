//! View projection over a committed snapshot.
//!
//! Pure derivation, no I/O: both the host console and the public display
//! render from the same [`Projection`], they differ only in which commands
//! they may issue (see [`observer`](crate::observer)).

use crate::queue::{QueueEntry, QueueSnapshot, RequestStatus};

/// What a viewer sees: the entry on stage plus the rotation behind it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Projection {
    pub current: Option<QueueEntry>,
    pub upcoming: Vec<QueueEntry>,
}

/// Derive the presentation from a snapshot.
///
/// `current` is the `playing` entry, if any. `upcoming` is every `pending`
/// entry in play-order; `played` and `skipped` entries are history and
/// appear in neither.
pub fn project(snapshot: &QueueSnapshot) -> Projection {
    Projection {
        current: snapshot.current().cloned(),
        upcoming: snapshot
            .entries()
            .iter()
            .filter(|e| e.status == RequestStatus::Pending)
            .cloned()
            .collect(),
    }
}
