//! PersistentEntity trait: the contract user code implements.

use std::fmt;

use crate::cell::{Effects, Recover};
use crate::error::RecoveryFailure;
use crate::journal::JournalError;
use crate::snapshot::{SaveSnapshotResult, SnapshotOffer};

/// What the entity should do after a failure signal it chose to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDirective {
    /// Kill the entity with a descriptive error (the default policy).
    Stop,
    /// Keep the entity alive. After a recovery failure this leaves the
    /// entity awaiting an explicit new `Recover`; after a persistence
    /// failure, command processing continues.
    Resume,
}

/// Messages dispatched to [`PersistentEntity::receive_recover`] while
/// the entity is being rebuilt from the journal.
pub enum Recovery<A: PersistentEntity> {
    /// One replayed event, in stored order.
    Event(A::Event),
    /// A snapshot loaded before replay; arrives at most once, first.
    SnapshotOffer(SnapshotOffer<A::Snapshot>),
    /// Recovery is done; the next message is a live command.
    Completed,
}

/// A persistent entity whose state is derived from its event history.
///
/// The implementing type itself serves as the entity's state. During
/// recovery the state is rebuilt by folding a snapshot and replayed
/// events through [`receive_recover`](PersistentEntity::receive_recover);
/// afterwards commands arrive at
/// [`receive_command`](PersistentEntity::receive_command), which derives
/// new events and registers them through the [`Effects`] context.
///
/// # Contract
///
/// - `receive_recover` must be a pure state fold: no side effects, no
///   event emission. It sees the same events on every replay.
/// - `receive_command` validates the command against current state and
///   calls `Effects::persist` / `persist_async` / `defer`. State
///   mutation for persisted events belongs in the persist handler, so
///   that replay and live processing fold state identically.
/// - Returning `Err` from either handler fails the entity: during
///   replay this defers a restart until the in-flight replay quiesces;
///   during command processing it propagates to the host untouched.
pub trait PersistentEntity: Sized + Send + 'static {
    /// The set of commands this entity handles.
    type Command: Send + 'static;

    /// The set of events this entity persists and folds.
    type Event: fmt::Debug + Clone + Send + 'static;

    /// Point-in-time state representation offered back during recovery.
    type Snapshot: Send + 'static;

    /// Replies this entity sends to command originators.
    type Reply: Send + 'static;

    /// Command rejection / handler failure type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Stable identity of this entity; routing key for the journal and
    /// the snapshot store. Must be non-empty and must not change for
    /// the lifetime of the logical entity.
    fn persistence_id(&self) -> &str;

    /// Fold one recovery message into state.
    fn receive_recover(&mut self, event: Recovery<Self>) -> Result<(), Self::Error>;

    /// Handle one user command.
    fn receive_command(
        &mut self,
        effects: &mut Effects<Self>,
        command: Self::Command,
    ) -> Result<(), Self::Error>;

    /// Recovery to run when the entity starts.
    ///
    /// Returning `None` leaves the entity dormant until a `Recover` is
    /// delivered explicitly; commands are stashed meanwhile.
    fn pre_start(&mut self) -> Option<Recover> {
        Some(Recover::default())
    }

    /// Called on the failing incarnation before the host restarts the
    /// entity. Pending writes are cancelled by the incarnation bump;
    /// this hook is for user-side cleanup only.
    fn pre_restart(&mut self) {}

    /// Called when the entity stops for good.
    fn post_stop(&mut self) {}

    /// Called when event replay completed, before `Recovery::Completed`
    /// is dispatched.
    fn on_replay_success(&mut self) {}

    /// Called when event replay failed, before the failure is routed
    /// through [`on_recovery_failure`](PersistentEntity::on_recovery_failure).
    fn on_replay_failure(&mut self, _cause: &JournalError) {}

    /// Recovery failed (replay or highest-sequence lookup). The default
    /// kills the entity.
    fn on_recovery_failure(&mut self, _failure: &RecoveryFailure) -> FailureDirective {
        FailureDirective::Stop
    }

    /// The journal rejected a write. The default kills the entity.
    fn on_persistence_failure(
        &mut self,
        _payload: &Self::Event,
        _sequence_nr: u64,
        _cause: &JournalError,
    ) -> FailureDirective {
        FailureDirective::Stop
    }

    /// Outcome of a `save_snapshot` request.
    fn on_save_snapshot(&mut self, _result: SaveSnapshotResult) {}
}
