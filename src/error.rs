//! Crate-level error types: kill reasons, restartable faults, and
//! handle errors.

use std::fmt;

use crate::entity::PersistentEntity;
use crate::envelope::{PersistenceId, PersistenceIdError};
use crate::journal::JournalError;

/// Why recovery could not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecoveryFailure {
    /// The journal aborted event replay.
    #[error("event replay failed: {0}")]
    Replay(JournalError),

    /// The journal could not report its highest stored sequence number.
    #[error("highest sequence number lookup failed: {0}")]
    HighestSequenceNr(JournalError),
}

/// Terminal failure: the entity is stopped and accepts nothing further.
///
/// Produced by the default-kill policy when a recovery or persistence
/// failure goes unhandled, or when a collaborator channel is gone.
#[derive(Debug, thiserror::Error)]
pub enum EntityKilled {
    /// Recovery failed and the entity did not elect to resume.
    #[error("persistent entity {persistence_id} killed: {cause}")]
    RecoveryFailed {
        /// Which entity died.
        persistence_id: PersistenceId,
        /// What went wrong during recovery.
        cause: RecoveryFailure,
    },

    /// The journal rejected a write and the entity did not elect to
    /// resume.
    #[error(
        "persistent entity {persistence_id} killed: write of event at sequence {sequence_nr} failed: {cause}"
    )]
    PersistenceFailed {
        /// Which entity died.
        persistence_id: PersistenceId,
        /// Sequence number of the rejected event.
        sequence_nr: u64,
        /// The journal's failure cause.
        cause: JournalError,
    },

    /// The journal endpoint is gone; no further persistence is possible.
    #[error("persistent entity {persistence_id} killed: journal is no longer reachable")]
    JournalGone {
        /// Which entity died.
        persistence_id: PersistenceId,
    },

    /// The snapshot store endpoint is gone.
    #[error("persistent entity {persistence_id} killed: snapshot store is no longer reachable")]
    SnapshotStoreGone {
        /// Which entity died.
        persistence_id: PersistenceId,
    },
}

/// Failure surfaced by [`EntityCell::handle`](crate::EntityCell::handle).
///
/// `Killed` stops the entity; the other variants propagate the user
/// handler's error to the supervising host, which restarts the cell
/// under a fresh incarnation.
#[derive(thiserror::Error)]
pub enum Fault<A: PersistentEntity> {
    /// The default-kill policy fired; stop the entity.
    #[error(transparent)]
    Killed(#[from] EntityKilled),

    /// The command handler failed; restart.
    #[error("command handler failed: {0}")]
    Command(#[source] A::Error),

    /// The recover handler failed; restart. Carries the user-level
    /// payload of the replayed event that triggered the failure, when
    /// there was one.
    #[error("recovery handler failed: {cause}")]
    Replay {
        /// The handler's error.
        #[source]
        cause: A::Error,
        /// Payload of the failing replayed event, stripped of its
        /// envelope.
        payload: Option<A::Event>,
    },
}

// By hand: a derive would bound `A` itself rather than the associated
// types that actually appear in the variants.
impl<A: PersistentEntity> fmt::Debug for Fault<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Killed(cause) => f.debug_tuple("Killed").field(cause).finish(),
            Fault::Command(cause) => f.debug_tuple("Command").field(cause).finish(),
            Fault::Replay { cause, payload } => f
                .debug_struct("Replay")
                .field("cause", cause)
                .field("payload", payload)
                .finish(),
        }
    }
}

/// Error constructing a cell before any message flows.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The entity reported an unusable persistence id.
    #[error("invalid persistence id: {0}")]
    InvalidPersistenceId(#[from] PersistenceIdError),
}

/// The entity's host loop has exited; the handle is dead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("persistent entity is no longer running")]
pub struct EntityGone;
