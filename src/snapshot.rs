//! Message vocabulary exchanged with the snapshot store.
//!
//! The snapshot store is an external collaborator: a key-value store of
//! entity state snapshots, used to bound replay length during recovery.
//! Snapshot payloads are opaque to this crate; only the metadata that
//! identifies and orders them is modelled here.

use serde::{Deserialize, Serialize};

use crate::envelope::{PersistenceId, ReplyTo};

/// Opaque failure cause reported by the snapshot store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct SnapshotError {
    /// Human-readable description of the failure.
    pub message: String,
}

impl SnapshotError {
    /// Wrap a failure description.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Identifies a stored snapshot: whose state it is and how many events
/// had been folded into it when it was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Entity the snapshot belongs to.
    pub persistence_id: PersistenceId,
    /// Sequence number of the last event covered by the snapshot.
    /// Recovery resumes replay from `sequence_nr + 1`.
    pub sequence_nr: u64,
}

/// Selects which stored snapshot to load during recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSelectionCriteria {
    /// Upper bound on the snapshot's sequence number.
    pub max_sequence_nr: u64,
}

impl SnapshotSelectionCriteria {
    /// Select the most recent snapshot, whatever its sequence number.
    pub fn latest() -> Self {
        Self {
            max_sequence_nr: u64::MAX,
        }
    }

    /// Select no snapshot at all; recovery replays the full stream.
    /// Sequence numbers start at 1, so a bound of 0 matches nothing.
    pub fn none() -> Self {
        Self { max_sequence_nr: 0 }
    }
}

impl Default for SnapshotSelectionCriteria {
    fn default() -> Self {
        Self::latest()
    }
}

/// A snapshot picked by the store in response to `LoadSnapshot`.
#[derive(Debug, Clone)]
pub struct SelectedSnapshot<S> {
    /// Identity and coverage of the snapshot.
    pub metadata: SnapshotMetadata,
    /// Opaque user state payload.
    pub snapshot: S,
}

/// A loaded snapshot offered to the entity's recover handler before
/// replay begins.
#[derive(Debug, Clone)]
pub struct SnapshotOffer<S> {
    /// Identity and coverage of the offered snapshot.
    pub metadata: SnapshotMetadata,
    /// Opaque user state payload.
    pub snapshot: S,
}

/// Outcome of a `SaveSnapshot` request, delivered to the entity's
/// `on_save_snapshot` hook.
#[derive(Debug, Clone)]
pub enum SaveSnapshotResult {
    /// The snapshot was stored.
    Saved(SnapshotMetadata),
    /// The store rejected the snapshot.
    Failed {
        /// Identity of the snapshot that was rejected.
        metadata: SnapshotMetadata,
        /// Why the store rejected it.
        cause: SnapshotError,
    },
}

/// Requests sent from the cell to the snapshot store.
pub enum SnapshotRequest<S> {
    /// Request the latest snapshot matching the criteria, at or below
    /// `to_sequence_nr`.
    LoadSnapshot {
        /// Entity whose snapshot is requested.
        persistence_id: PersistenceId,
        /// Which stored snapshot qualifies.
        criteria: SnapshotSelectionCriteria,
        /// Upper bound from the recovery request.
        to_sequence_nr: u64,
        /// Where the outcome is delivered.
        reply_to: ReplyTo<SnapshotResponse<S>>,
    },

    /// Store a snapshot of the entity's current state.
    SaveSnapshot {
        /// Identity and coverage of the snapshot.
        metadata: SnapshotMetadata,
        /// Opaque user state payload.
        snapshot: S,
        /// Where the outcome is delivered.
        reply_to: ReplyTo<SnapshotResponse<S>>,
    },
}

/// Replies sent from the snapshot store back to the cell.
pub enum SnapshotResponse<S> {
    /// Outcome of `LoadSnapshot`; `None` when no stored snapshot
    /// matched the criteria.
    LoadSnapshotResult {
        /// The selected snapshot, if any.
        snapshot: Option<SelectedSnapshot<S>>,
        /// Echo of the recovery upper bound, used to parameterize the
        /// replay that follows.
        to_sequence_nr: u64,
    },
    /// A `SaveSnapshot` request succeeded.
    SaveSnapshotSuccess(SnapshotMetadata),
    /// A `SaveSnapshot` request failed.
    SaveSnapshotFailure {
        /// Identity of the snapshot that was rejected.
        metadata: SnapshotMetadata,
        /// Why the store rejected it.
        cause: SnapshotError,
    },
}
