//! The entity cell: one persistent entity, its lifecycle state machine,
//! and the bookkeeping around it.
//!
//! A cell owns exactly one [`PersistentEntity`] and drives it through
//! recovery (snapshot load, event replay, highest-sequence query) and
//! then command processing. It is plain single-threaded state: the host
//! feeds it one [`Message`] at a time through [`EntityCell::handle`],
//! and the happens-before edge between consecutive messages is the
//! host's obligation (see [`spawn_entity`](crate::spawn_entity) for the
//! tokio host). The journal and snapshot store are reached exclusively
//! through the channels in [`Collaborators`].
//!
//! The cell suspends logically by stashing messages that its current
//! state cannot handle, and resumes by draining the stash when the
//! awaited reply arrives. It never blocks.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::batcher::JournalBatcher;
use crate::entity::{FailureDirective, PersistentEntity, Recovery};
use crate::envelope::{
    Envelope, NonPersistentRepr, PersistenceId, PersistentRepr, ReplyTo, SenderRef,
};
use crate::error::{EntityKilled, Fault, RecoveryFailure, SpawnError};
use crate::journal::{JournalError, JournalRequest, JournalResponse};
use crate::ledger::{Callback, InvocationKind, InvocationLedger};
use crate::snapshot::{
    SaveSnapshotResult, SelectedSnapshot, SnapshotMetadata, SnapshotOffer,
    SnapshotSelectionCriteria, SnapshotRequest, SnapshotResponse,
};
use crate::stash::DualStash;

/// Source of incarnation tags, shared by every cell in the process.
/// Wraparound within one journal round-trip is assumed impossible.
static INSTANCE_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Journal request endpoint for entity type `A`.
pub type JournalTx<A> = mpsc::UnboundedSender<
    JournalRequest<<A as PersistentEntity>::Event, <A as PersistentEntity>::Reply>,
>;

/// Snapshot store request endpoint for entity type `A`.
pub type SnapshotTx<A> =
    mpsc::UnboundedSender<SnapshotRequest<<A as PersistentEntity>::Snapshot>>;

/// Endpoint on which the cell expects journal replies.
pub type JournalReplyTx<A> =
    ReplyTo<JournalResponse<<A as PersistentEntity>::Event, <A as PersistentEntity>::Reply>>;

/// Endpoint on which the cell expects snapshot store replies.
pub type SnapshotReplyTx<A> = ReplyTo<SnapshotResponse<<A as PersistentEntity>::Snapshot>>;

/// The cell's external collaborators: where requests go and where the
/// collaborators are told to send their replies.
///
/// The reply endpoints must feed back into the same mailbox the host
/// drains, wrapped as [`Message::Journal`] / [`Message::Snapshot`].
pub struct Collaborators<A: PersistentEntity> {
    /// Journal request endpoint.
    pub journal: JournalTx<A>,
    /// Snapshot store request endpoint.
    pub snapshot_store: SnapshotTx<A>,
    /// Stamped as `reply_to` on journal requests.
    pub journal_reply_to: JournalReplyTx<A>,
    /// Stamped as `reply_to` on snapshot store requests.
    pub snapshot_reply_to: SnapshotReplyTx<A>,
}

// Senders are `Clone` for any payload; a derive would bound `A`.
impl<A: PersistentEntity> Clone for Collaborators<A> {
    fn clone(&self) -> Self {
        Self {
            journal: self.journal.clone(),
            snapshot_store: self.snapshot_store.clone(),
            journal_reply_to: self.journal_reply_to.clone(),
            snapshot_reply_to: self.snapshot_reply_to.clone(),
        }
    }
}

/// Tuning knobs for a cell.
#[derive(Debug, Clone)]
pub struct CellSettings {
    /// Upper bound on the number of envelopes per `WriteMessages`
    /// round-trip.
    pub max_message_batch_size: usize,
}

impl Default for CellSettings {
    fn default() -> Self {
        Self {
            max_message_batch_size: 200,
        }
    }
}

/// Instruction to run recovery: which snapshot to load and how much of
/// the stream to replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recover {
    /// Which stored snapshot qualifies for the initial offer.
    pub from_snapshot: SnapshotSelectionCriteria,
    /// Upper bound on replayed sequence numbers.
    pub to_sequence_nr: u64,
    /// Upper bound on the number of replayed events.
    pub replay_max: u64,
}

impl Recover {
    /// Recover using the latest snapshot, replaying up to
    /// `to_sequence_nr`.
    pub fn up_to(to_sequence_nr: u64) -> Self {
        Self {
            to_sequence_nr,
            ..Self::default()
        }
    }
}

impl Default for Recover {
    fn default() -> Self {
        Self {
            from_snapshot: SnapshotSelectionCriteria::latest(),
            to_sequence_nr: u64::MAX,
            replay_max: u64::MAX,
        }
    }
}

/// A user command together with the address to answer it on.
pub struct Delivery<A: PersistentEntity> {
    /// The command itself.
    pub command: A::Command,
    /// Who sent it; stamped onto envelopes the command produces.
    pub sender: SenderRef<A::Reply>,
}

impl<A: PersistentEntity> Delivery<A> {
    /// A delivery with no reply address.
    pub fn of(command: A::Command) -> Self {
        Self {
            command,
            sender: SenderRef::none(),
        }
    }
}

/// Everything a cell's mailbox can carry.
pub enum Message<A: PersistentEntity> {
    /// A user command.
    Command(Delivery<A>),
    /// Run (or re-run) recovery.
    Recover(Recover),
    /// A reply from the journal.
    Journal(JournalResponse<A::Event, A::Reply>),
    /// A reply from the snapshot store.
    Snapshot(SnapshotResponse<A::Snapshot>),
}

/// Lifecycle of a cell. Dispatch is a function of `(state, message)`;
/// messages a state has no pattern for are stashed internally and
/// drained on the transition into `ProcessingCommands`.
enum State<A: PersistentEntity> {
    /// Waiting for a `Recover` instruction; everything else stashes.
    RecoveryPending,
    /// Snapshot requested, waiting for the load result. The recovery
    /// upper bound travels with the snapshot request and comes back
    /// echoed in the load result.
    RecoveryStarted { replay_max: u64 },
    /// Replay requested, events streaming in.
    ReplayStarted,
    /// Replay done, waiting for the highest-sequence answer.
    Initializing,
    /// Live: commands are delivered to the entity.
    ProcessingCommands,
    /// A stashing persist is outstanding; commands wait.
    PersistingEvents,
    /// The recover handler failed mid-replay; absorb the remaining
    /// replay traffic, then fail at a safe point.
    ReplayFailed { cause: A::Error, payload: A::Event },
    /// Terminal quiescence before the host restarts the cell.
    PrepareRestart,
}

/// Side effects queued by the command handler, applied by the cell when
/// the handler returns.
///
/// An `Effects` value only ever exists inside
/// [`PersistentEntity::receive_command`]; persistence is unreachable
/// from recovery or from persist callbacks, which is what keeps the
/// callback ledger consistent.
pub struct Effects<A: PersistentEntity> {
    emits: Vec<Emit<A>>,
    /// Whether the ledger will be non-empty by the time this emission
    /// is applied; decides the `defer` fast path.
    ledger_occupied: bool,
    last_sequence_nr: u64,
    sender: SenderRef<A::Reply>,
}

enum Emit<A: PersistentEntity> {
    Persist {
        event: A::Event,
        handler: Callback<A>,
        kind: InvocationKind,
    },
    Defer {
        event: A::Event,
        handler: Callback<A>,
    },
    DeferNow {
        event: A::Event,
        handler: Callback<A>,
    },
    Stash {
        command: A::Command,
    },
    UnstashAll,
    DeleteMessages {
        to_sequence_nr: u64,
        permanent: bool,
    },
    SaveSnapshot {
        snapshot: A::Snapshot,
    },
}

impl<A: PersistentEntity> Effects<A> {
    fn new(ledger_occupied: bool, last_sequence_nr: u64, sender: SenderRef<A::Reply>) -> Self {
        Self {
            emits: Vec::new(),
            ledger_occupied,
            last_sequence_nr,
            sender,
        }
    }

    /// Persist an event and run `handler` once the journal has
    /// acknowledged it. No further command is delivered until then:
    /// everything the entity observes between this call and the
    /// callback is the state it left behind when the command returned.
    ///
    /// All events persisted by one command are written atomically.
    pub fn persist<H>(&mut self, event: A::Event, handler: H)
    where
        H: FnOnce(&mut A, A::Event) + Send + 'static,
    {
        self.ledger_occupied = true;
        self.emits.push(Emit::Persist {
            event,
            handler: Callback::Once(Box::new(handler)),
            kind: InvocationKind::Stashing,
        });
    }

    /// Persist several events atomically, running `handler` once per
    /// event as acknowledgements arrive. Blocks command delivery like
    /// [`persist`](Effects::persist).
    pub fn persist_all<H>(&mut self, events: Vec<A::Event>, handler: H)
    where
        H: Fn(&mut A, A::Event) + Send + Sync + 'static,
    {
        let handler: Arc<dyn Fn(&mut A, A::Event) + Send + Sync> = Arc::new(handler);
        for event in events {
            self.ledger_occupied = true;
            self.emits.push(Emit::Persist {
                event,
                handler: Callback::Shared(handler.clone()),
                kind: InvocationKind::Stashing,
            });
        }
    }

    /// Persist an event without suspending command delivery. New
    /// commands may be processed before `handler` runs; callbacks still
    /// fire in persist order.
    pub fn persist_async<H>(&mut self, event: A::Event, handler: H)
    where
        H: FnOnce(&mut A, A::Event) + Send + 'static,
    {
        self.ledger_occupied = true;
        self.emits.push(Emit::Persist {
            event,
            handler: Callback::Once(Box::new(handler)),
            kind: InvocationKind::NonStashing,
        });
    }

    /// As [`persist_async`](Effects::persist_async), for several events
    /// written atomically with one shared handler.
    pub fn persist_all_async<H>(&mut self, events: Vec<A::Event>, handler: H)
    where
        H: Fn(&mut A, A::Event) + Send + Sync + 'static,
    {
        let handler: Arc<dyn Fn(&mut A, A::Event) + Send + Sync> = Arc::new(handler);
        for event in events {
            self.ledger_occupied = true;
            self.emits.push(Emit::Persist {
                event,
                handler: Callback::Shared(handler.clone()),
                kind: InvocationKind::NonStashing,
            });
        }
    }

    /// Run `handler` after every pending invocation registered so far
    /// has run. The payload is never written to the journal.
    ///
    /// With an empty ledger the handler runs synchronously, within the
    /// same command turn.
    pub fn defer<H>(&mut self, event: A::Event, handler: H)
    where
        H: FnOnce(&mut A, A::Event) + Send + 'static,
    {
        let handler = Callback::Once(Box::new(handler));
        if self.ledger_occupied {
            self.emits.push(Emit::Defer { event, handler });
        } else {
            self.emits.push(Emit::DeferNow { event, handler });
        }
    }

    /// Put the command being processed aside into the user stash. Hand
    /// back the command (or an equivalent) to keep.
    pub fn stash(&mut self, command: A::Command) {
        self.emits.push(Emit::Stash { command });
    }

    /// Feed every user-stashed command back in, ahead of any messages
    /// the cell itself has deferred and ahead of subsequent mailbox
    /// traffic.
    pub fn unstash_all(&mut self) {
        self.emits.push(Emit::UnstashAll);
    }

    /// Delete journaled events up to `to_sequence_nr` (inclusive).
    pub fn delete_messages(&mut self, to_sequence_nr: u64, permanent: bool) {
        self.emits.push(Emit::DeleteMessages {
            to_sequence_nr,
            permanent,
        });
    }

    /// Store a snapshot of the entity's current state, covering
    /// everything up to [`last_sequence_nr`](Effects::last_sequence_nr).
    /// The outcome arrives at [`PersistentEntity::on_save_snapshot`].
    pub fn save_snapshot(&mut self, snapshot: A::Snapshot) {
        self.emits.push(Emit::SaveSnapshot { snapshot });
    }

    /// Highest sequence number observed so far (from replay or from
    /// acknowledged writes).
    pub fn last_sequence_nr(&self) -> u64 {
        self.last_sequence_nr
    }

    /// Reply to the originator of the command being processed. Returns
    /// `false` when there is no sender or it has gone away.
    pub fn reply(&self, reply: A::Reply) -> bool {
        self.sender.reply(reply)
    }

    /// Address of the command's originator.
    pub fn sender(&self) -> &SenderRef<A::Reply> {
        &self.sender
    }
}

/// Carried out of a failed incarnation into the next one.
pub struct RestartState<A: PersistentEntity> {
    /// Stashed messages to process ahead of new mailbox traffic.
    pub requeue: Vec<Message<A>>,
    /// Where the failed incarnation had gotten to; the re-armed
    /// `Recover` replays up to here.
    pub last_sequence_nr: u64,
}

enum BatchEntry<A: PersistentEntity> {
    Persistent(A::Event),
    NonPersistent(A::Event),
}

/// One persistent entity and the state machine driving it.
///
/// See the [module docs](self) for the threading model. The host is
/// expected to call [`start`](EntityCell::start) once, then
/// [`handle`](EntityCell::handle) per mailbox message, stopping on
/// [`Fault::Killed`] and restarting (via
/// [`prepare_restart`](EntityCell::prepare_restart) and a fresh cell)
/// on any other fault.
pub struct EntityCell<A: PersistentEntity> {
    entity: A,
    persistence_id: PersistenceId,
    /// Incarnation tag; replies stamped with another incarnation's tag
    /// are dropped.
    instance_id: u32,
    state: State<A>,
    ledger: InvocationLedger<A>,
    batcher: JournalBatcher<A::Event, A::Reply>,
    stash: DualStash<A>,
    /// Highest sequence number observed, from replay or acked writes.
    last_sequence_nr: u64,
    /// Write cursor; holds the journal's reported highest, advanced at
    /// dispatch time only.
    next_sequence_nr: u64,
    /// Sender of the command currently (or most recently) processed.
    current_sender: SenderRef<A::Reply>,
    collaborators: Collaborators<A>,
}

impl<A: PersistentEntity> EntityCell<A> {
    /// Build a cell around an entity, assigning a fresh incarnation tag.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError::InvalidPersistenceId`] if the entity
    /// reports an empty persistence id.
    pub fn new(
        entity: A,
        collaborators: Collaborators<A>,
        settings: CellSettings,
    ) -> Result<Self, SpawnError> {
        let persistence_id = PersistenceId::new(entity.persistence_id())?;
        Ok(Self {
            entity,
            persistence_id,
            instance_id: INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed),
            state: State::RecoveryPending,
            ledger: InvocationLedger::new(),
            batcher: JournalBatcher::new(settings.max_message_batch_size),
            stash: DualStash::new(),
            last_sequence_nr: 0,
            next_sequence_nr: 0,
            current_sender: SenderRef::none(),
            collaborators,
        })
    }

    /// Run the entity's `pre_start` hook, kicking off recovery unless
    /// the hook opted out.
    pub fn start(&mut self) -> Result<(), Fault<A>> {
        match self.entity.pre_start() {
            Some(recover) => self.handle(Message::Recover(recover)),
            None => Ok(()),
        }
    }

    /// Process one mailbox message.
    ///
    /// # Errors
    ///
    /// [`Fault::Killed`] means the entity is dead: call
    /// [`stop`](EntityCell::stop) and discard the cell. Any other fault
    /// is a restart request: call
    /// [`prepare_restart`](EntityCell::prepare_restart) and build a
    /// fresh cell.
    pub fn handle(&mut self, message: Message<A>) -> Result<(), Fault<A>> {
        match message {
            Message::Recover(recover) => self.on_recover(recover),
            Message::Command(delivery) => self.on_command(delivery),
            Message::Journal(response) => self.on_journal(response),
            Message::Snapshot(response) => self.on_snapshot(response),
        }
    }

    /// Identity of the entity this cell owns.
    pub fn persistence_id(&self) -> &PersistenceId {
        &self.persistence_id
    }

    /// Highest sequence number observed so far.
    pub fn last_sequence_nr(&self) -> u64 {
        self.last_sequence_nr
    }

    /// Whether the cell is still (or again) recovering; no commands are
    /// delivered while this holds.
    pub fn recovery_running(&self) -> bool {
        !self.recovery_finished()
    }

    /// Whether recovery completed and the cell is live.
    pub fn recovery_finished(&self) -> bool {
        matches!(
            self.state,
            State::ProcessingCommands | State::PersistingEvents
        )
    }

    /// This incarnation's tag.
    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    /// The entity's current state.
    pub fn entity(&self) -> &A {
        &self.entity
    }

    /// Tear down a failed incarnation: best-effort flush of the write
    /// batch, `pre_restart` hook, and both stashes drained for
    /// redelivery to the next incarnation.
    pub fn prepare_restart(mut self) -> RestartState<A> {
        let _ = self.dispatch_flush();
        self.entity.pre_restart();
        let requeue = self.stash.drain_all();
        RestartState {
            requeue,
            last_sequence_nr: self.last_sequence_nr,
        }
    }

    /// Tear down for good: stashed messages are dropped and the
    /// entity's `post_stop` hook runs.
    pub fn stop(mut self) {
        let dropped = self.stash.drain_all();
        if !dropped.is_empty() {
            tracing::debug!(
                persistence_id = %self.persistence_id,
                count = dropped.len(),
                "dropping stashed messages on stop"
            );
        }
        self.entity.post_stop();
    }

    fn on_recover(&mut self, recover: Recover) -> Result<(), Fault<A>> {
        match self.state {
            State::RecoveryPending => {
                let Recover {
                    from_snapshot,
                    to_sequence_nr,
                    replay_max,
                } = recover;
                self.send_snapshot_request(SnapshotRequest::LoadSnapshot {
                    persistence_id: self.persistence_id.clone(),
                    criteria: from_snapshot,
                    to_sequence_nr,
                    reply_to: self.collaborators.snapshot_reply_to.clone(),
                })?;
                self.state = State::RecoveryStarted { replay_max };
                Ok(())
            }
            _ => {
                tracing::debug!(
                    persistence_id = %self.persistence_id,
                    "Recover ignored: recovery already running or finished"
                );
                Ok(())
            }
        }
    }

    fn on_command(&mut self, delivery: Delivery<A>) -> Result<(), Fault<A>> {
        match self.state {
            State::ProcessingCommands => self.process_command(delivery),
            State::PrepareRestart => {
                tracing::debug!(
                    persistence_id = %self.persistence_id,
                    "command dropped while preparing restart"
                );
                Ok(())
            }
            _ => {
                self.stash.stash_internal(Message::Command(delivery));
                Ok(())
            }
        }
    }

    fn process_command(&mut self, delivery: Delivery<A>) -> Result<(), Fault<A>> {
        let Delivery { command, sender } = delivery;
        self.current_sender = sender;
        let mut effects = Effects::new(
            !self.ledger.is_empty(),
            self.last_sequence_nr,
            self.current_sender.clone(),
        );
        let span = tracing::info_span!("command", persistence_id = %self.persistence_id);
        span.in_scope(|| self.entity.receive_command(&mut effects, command))
            .map_err(Fault::Command)?;
        self.apply_effects(effects)
    }

    fn apply_effects(&mut self, effects: Effects<A>) -> Result<(), Fault<A>> {
        let mut event_batch: Vec<BatchEntry<A>> = Vec::new();
        let mut contains_stashing = false;

        for emit in effects.emits {
            match emit {
                Emit::Persist {
                    event,
                    handler,
                    kind,
                } => {
                    if kind == InvocationKind::Stashing {
                        contains_stashing = true;
                    }
                    self.ledger.push(handler, kind);
                    event_batch.push(BatchEntry::Persistent(event));
                }
                Emit::Defer { event, handler } => {
                    self.ledger.push(handler, InvocationKind::NonStashing);
                    event_batch.push(BatchEntry::NonPersistent(event));
                }
                Emit::DeferNow { event, handler } => {
                    handler.invoke(&mut self.entity, event);
                }
                Emit::Stash { command } => {
                    self.stash.stash_user(Delivery {
                        command,
                        sender: self.current_sender.clone(),
                    });
                }
                Emit::UnstashAll => self.stash.unstash_all_user(),
                Emit::DeleteMessages {
                    to_sequence_nr,
                    permanent,
                } => {
                    self.send_journal_request(JournalRequest::DeleteMessagesTo {
                        persistence_id: self.persistence_id.clone(),
                        to_sequence_nr,
                        permanent,
                    })?;
                }
                Emit::SaveSnapshot { snapshot } => {
                    let metadata = SnapshotMetadata {
                        persistence_id: self.persistence_id.clone(),
                        sequence_nr: self.last_sequence_nr,
                    };
                    self.send_snapshot_request(SnapshotRequest::SaveSnapshot {
                        metadata,
                        snapshot,
                        reply_to: self.collaborators.snapshot_reply_to.clone(),
                    })?;
                }
            }
        }

        self.flush_event_batch(event_batch, contains_stashing)?;

        if self.ledger.pending_stashing() > 0 {
            self.state = State::PersistingEvents;
            Ok(())
        } else if !self.stash.internal_is_empty() {
            // `unstash_all` may have repopulated the internal stash
            // while the cell stays live; feed those back in now.
            self.drain_internal_stash()
        } else {
            Ok(())
        }
    }

    /// Move one command's emissions into the journal batch, assigning
    /// sequence numbers and stamping identity and sender, then flush
    /// under the flow-control rules.
    fn flush_event_batch(
        &mut self,
        batch: Vec<BatchEntry<A>>,
        contains_stashing: bool,
    ) -> Result<(), Fault<A>> {
        if batch.is_empty() {
            return Ok(());
        }
        // A stashing group must not share a write with envelopes queued
        // by earlier async activity.
        if contains_stashing && !self.batcher.is_empty() {
            self.dispatch_flush()?;
        }
        for entry in batch {
            let envelope = match entry {
                BatchEntry::Persistent(payload) => {
                    self.next_sequence_nr += 1;
                    Envelope::Persistent(PersistentRepr {
                        payload,
                        sequence_nr: self.next_sequence_nr,
                        persistence_id: self.persistence_id.clone(),
                        sender: self.current_sender.clone(),
                    })
                }
                BatchEntry::NonPersistent(payload) => Envelope::NonPersistent(NonPersistentRepr {
                    payload,
                    sender: self.current_sender.clone(),
                }),
            };
            self.batcher.push(envelope);
            // A stashing group is written atomically no matter its
            // size; only non-stashing emissions may be split at the
            // size bound.
            if !contains_stashing && self.batcher.is_full() {
                self.dispatch_flush()?;
            }
        }
        self.dispatch_flush()
    }

    fn dispatch_flush(&mut self) -> Result<(), Fault<A>> {
        if let Some(batch) = self.batcher.flush() {
            self.send_journal_request(JournalRequest::WriteMessages {
                batch,
                reply_to: self.collaborators.journal_reply_to.clone(),
                instance_id: self.instance_id,
            })?;
        }
        Ok(())
    }

    fn on_journal(&mut self, response: JournalResponse<A::Event, A::Reply>) -> Result<(), Fault<A>> {
        match self.state {
            State::ReplayStarted => self.on_journal_replaying(response),
            State::ReplayFailed { .. } => self.on_journal_replay_failed(response),
            State::Initializing => self.on_journal_initializing(response),
            State::ProcessingCommands | State::PersistingEvents => self.on_journal_live(response),
            State::RecoveryPending | State::RecoveryStarted { .. } => {
                self.stash.stash_internal(Message::Journal(response));
                Ok(())
            }
            State::PrepareRestart => {
                tracing::debug!(
                    persistence_id = %self.persistence_id,
                    "journal reply dropped while preparing restart"
                );
                Ok(())
            }
        }
    }

    fn on_journal_replaying(
        &mut self,
        response: JournalResponse<A::Event, A::Reply>,
    ) -> Result<(), Fault<A>> {
        match response {
            JournalResponse::ReplayedMessage(repr) => {
                self.last_sequence_nr = self.last_sequence_nr.max(repr.sequence_nr);
                let sequence_nr = repr.sequence_nr;
                let payload = repr.payload.clone();
                if let Err(cause) = self.entity.receive_recover(Recovery::Event(repr.payload)) {
                    tracing::warn!(
                        persistence_id = %self.persistence_id,
                        sequence_nr,
                        error = %cause,
                        "recover handler failed; absorbing remaining replay"
                    );
                    // The journal's high-water is not to be trusted on
                    // this path; pin so the restart replays fully.
                    self.last_sequence_nr = u64::MAX;
                    self.state = State::ReplayFailed { cause, payload };
                }
                Ok(())
            }
            JournalResponse::ReplayMessagesSuccess => {
                self.entity.on_replay_success();
                self.send_journal_request(JournalRequest::ReadHighestSequenceNr {
                    from_sequence_nr: self.last_sequence_nr,
                    persistence_id: self.persistence_id.clone(),
                    reply_to: self.collaborators.journal_reply_to.clone(),
                })?;
                self.state = State::Initializing;
                Ok(())
            }
            JournalResponse::ReplayMessagesFailure(cause) => {
                self.recovery_failed(RecoveryFailure::Replay(cause))
            }
            other => {
                self.stash.stash_internal(Message::Journal(other));
                Ok(())
            }
        }
    }

    fn on_journal_replay_failed(
        &mut self,
        response: JournalResponse<A::Event, A::Reply>,
    ) -> Result<(), Fault<A>> {
        match response {
            // Absorbed: update bookkeeping, dispatch nothing.
            JournalResponse::ReplayedMessage(repr) => {
                self.last_sequence_nr = self.last_sequence_nr.max(repr.sequence_nr);
                Ok(())
            }
            JournalResponse::ReplayMessagesSuccess | JournalResponse::ReplayMessagesFailure(_) => {
                let state = mem::replace(&mut self.state, State::PrepareRestart);
                let State::ReplayFailed { cause, payload } = state else {
                    unreachable!("state checked by on_journal")
                };
                tracing::error!(
                    persistence_id = %self.persistence_id,
                    error = %cause,
                    "replay quiesced after recover handler failure; restarting"
                );
                Err(Fault::Replay {
                    cause,
                    payload: Some(payload),
                })
            }
            other => {
                self.stash.stash_internal(Message::Journal(other));
                Ok(())
            }
        }
    }

    fn on_journal_initializing(
        &mut self,
        response: JournalResponse<A::Event, A::Reply>,
    ) -> Result<(), Fault<A>> {
        match response {
            JournalResponse::ReadHighestSequenceNrSuccess(highest) => {
                self.next_sequence_nr = highest;
                if let Err(cause) = self.entity.receive_recover(Recovery::Completed) {
                    return Err(Fault::Replay {
                        cause,
                        payload: None,
                    });
                }
                self.state = State::ProcessingCommands;
                tracing::debug!(
                    persistence_id = %self.persistence_id,
                    last_sequence_nr = self.last_sequence_nr,
                    "recovery completed"
                );
                self.drain_internal_stash()
            }
            JournalResponse::ReadHighestSequenceNrFailure(cause) => {
                self.recovery_failed(RecoveryFailure::HighestSequenceNr(cause))
            }
            other => {
                self.stash.stash_internal(Message::Journal(other));
                Ok(())
            }
        }
    }

    fn on_journal_live(
        &mut self,
        response: JournalResponse<A::Event, A::Reply>,
    ) -> Result<(), Fault<A>> {
        match response {
            JournalResponse::WriteMessageSuccess(repr, id) => self.on_write_success(repr, id),
            JournalResponse::WriteMessageFailure(repr, cause, id) => {
                self.on_write_failure(repr, cause, id)
            }
            JournalResponse::LoopMessageSuccess(repr, id) => self.on_loop_success(repr, id),
            JournalResponse::WriteMessagesSuccessful => self.on_batch_write_complete(None),
            JournalResponse::WriteMessagesFailed(cause) => self.on_batch_write_complete(Some(cause)),
            JournalResponse::ReplayedMessage(_)
            | JournalResponse::ReplayMessagesSuccess
            | JournalResponse::ReplayMessagesFailure(_)
            | JournalResponse::ReadHighestSequenceNrSuccess(_)
            | JournalResponse::ReadHighestSequenceNrFailure(_) => {
                tracing::debug!(
                    persistence_id = %self.persistence_id,
                    "stale recovery reply dropped"
                );
                Ok(())
            }
        }
    }

    fn on_write_success(
        &mut self,
        repr: PersistentRepr<A::Event, A::Reply>,
        id: u32,
    ) -> Result<(), Fault<A>> {
        if id != self.instance_id {
            tracing::debug!(
                persistence_id = %self.persistence_id,
                stale_instance = id,
                "write ack for a prior incarnation dropped"
            );
            return Ok(());
        }
        self.last_sequence_nr = self.last_sequence_nr.max(repr.sequence_nr);
        match self.ledger.pop() {
            Some(invocation) => {
                invocation.handler.invoke(&mut self.entity, repr.payload);
                self.after_ledger_pop()
            }
            None => {
                tracing::warn!(
                    persistence_id = %self.persistence_id,
                    sequence_nr = repr.sequence_nr,
                    "write ack with an empty invocation ledger"
                );
                Ok(())
            }
        }
    }

    fn on_write_failure(
        &mut self,
        repr: PersistentRepr<A::Event, A::Reply>,
        cause: JournalError,
        id: u32,
    ) -> Result<(), Fault<A>> {
        if id != self.instance_id {
            tracing::debug!(
                persistence_id = %self.persistence_id,
                stale_instance = id,
                "write failure for a prior incarnation dropped"
            );
            return Ok(());
        }
        tracing::warn!(
            persistence_id = %self.persistence_id,
            sequence_nr = repr.sequence_nr,
            error = %cause,
            "journal rejected write"
        );
        let directive =
            self.entity
                .on_persistence_failure(&repr.payload, repr.sequence_nr, &cause);
        let _ = self.ledger.pop();
        match directive {
            FailureDirective::Stop => Err(Fault::Killed(EntityKilled::PersistenceFailed {
                persistence_id: self.persistence_id.clone(),
                sequence_nr: repr.sequence_nr,
                cause,
            })),
            FailureDirective::Resume => self.after_ledger_pop(),
        }
    }

    fn on_loop_success(
        &mut self,
        repr: NonPersistentRepr<A::Event, A::Reply>,
        id: u32,
    ) -> Result<(), Fault<A>> {
        if id != self.instance_id {
            tracing::debug!(
                persistence_id = %self.persistence_id,
                stale_instance = id,
                "loopback ack for a prior incarnation dropped"
            );
            return Ok(());
        }
        match self.ledger.pop() {
            Some(invocation) => {
                invocation.handler.invoke(&mut self.entity, repr.payload);
                self.after_ledger_pop()
            }
            None => {
                tracing::warn!(
                    persistence_id = %self.persistence_id,
                    "loopback ack with an empty invocation ledger"
                );
                Ok(())
            }
        }
    }

    fn after_ledger_pop(&mut self) -> Result<(), Fault<A>> {
        if matches!(self.state, State::PersistingEvents) && self.ledger.pending_stashing() == 0 {
            self.state = State::ProcessingCommands;
            self.drain_internal_stash()
        } else {
            Ok(())
        }
    }

    fn on_batch_write_complete(&mut self, failure: Option<JournalError>) -> Result<(), Fault<A>> {
        if let Some(cause) = failure {
            tracing::warn!(
                persistence_id = %self.persistence_id,
                error = %cause,
                "journal write round-trip failed"
            );
        }
        if let Some(batch) = self.batcher.write_complete() {
            self.send_journal_request(JournalRequest::WriteMessages {
                batch,
                reply_to: self.collaborators.journal_reply_to.clone(),
                instance_id: self.instance_id,
            })?;
        }
        Ok(())
    }

    fn on_snapshot(&mut self, response: SnapshotResponse<A::Snapshot>) -> Result<(), Fault<A>> {
        match self.state {
            State::RecoveryStarted { .. } => match response {
                SnapshotResponse::LoadSnapshotResult {
                    snapshot,
                    to_sequence_nr,
                } => self.on_snapshot_loaded(snapshot, to_sequence_nr),
                other => {
                    self.stash.stash_internal(Message::Snapshot(other));
                    Ok(())
                }
            },
            State::ProcessingCommands => match response {
                SnapshotResponse::SaveSnapshotSuccess(metadata) => {
                    self.entity
                        .on_save_snapshot(SaveSnapshotResult::Saved(metadata));
                    Ok(())
                }
                SnapshotResponse::SaveSnapshotFailure { metadata, cause } => {
                    self.entity
                        .on_save_snapshot(SaveSnapshotResult::Failed { metadata, cause });
                    Ok(())
                }
                SnapshotResponse::LoadSnapshotResult { .. } => {
                    tracing::debug!(
                        persistence_id = %self.persistence_id,
                        "stale snapshot load result dropped"
                    );
                    Ok(())
                }
            },
            State::PrepareRestart => {
                tracing::debug!(
                    persistence_id = %self.persistence_id,
                    "snapshot reply dropped while preparing restart"
                );
                Ok(())
            }
            _ => {
                self.stash.stash_internal(Message::Snapshot(response));
                Ok(())
            }
        }
    }

    fn on_snapshot_loaded(
        &mut self,
        snapshot: Option<SelectedSnapshot<A::Snapshot>>,
        to_sequence_nr: u64,
    ) -> Result<(), Fault<A>> {
        let State::RecoveryStarted { replay_max, .. } = self.state else {
            unreachable!("state checked by on_snapshot")
        };
        if let Some(SelectedSnapshot { metadata, snapshot }) = snapshot {
            self.last_sequence_nr = metadata.sequence_nr;
            if let Err(cause) = self
                .entity
                .receive_recover(Recovery::SnapshotOffer(SnapshotOffer { metadata, snapshot }))
            {
                // No replay traffic in flight yet; fail directly.
                return Err(Fault::Replay {
                    cause,
                    payload: None,
                });
            }
        }
        self.send_journal_request(JournalRequest::ReplayMessages {
            from_sequence_nr: self.last_sequence_nr.saturating_add(1),
            to_sequence_nr,
            max: replay_max,
            persistence_id: self.persistence_id.clone(),
            reply_to: self.collaborators.journal_reply_to.clone(),
        })?;
        self.state = State::ReplayStarted;
        Ok(())
    }

    fn recovery_failed(&mut self, failure: RecoveryFailure) -> Result<(), Fault<A>> {
        if let RecoveryFailure::Replay(cause) = &failure {
            self.entity.on_replay_failure(cause);
        }
        match self.entity.on_recovery_failure(&failure) {
            FailureDirective::Stop => Err(Fault::Killed(EntityKilled::RecoveryFailed {
                persistence_id: self.persistence_id.clone(),
                cause: failure,
            })),
            FailureDirective::Resume => {
                tracing::warn!(
                    persistence_id = %self.persistence_id,
                    error = %failure,
                    "recovery failed; entity idle until a new Recover arrives"
                );
                self.state = State::RecoveryPending;
                Ok(())
            }
        }
    }

    fn drain_internal_stash(&mut self) -> Result<(), Fault<A>> {
        let mut drained: VecDeque<Message<A>> = self.stash.take_internal();
        while let Some(message) = drained.pop_front() {
            if let Err(fault) = self.handle(message) {
                // Keep the unprocessed remainder for the next
                // incarnation.
                self.stash.restore_internal_front(drained);
                return Err(fault);
            }
        }
        Ok(())
    }

    fn send_journal_request(
        &mut self,
        request: JournalRequest<A::Event, A::Reply>,
    ) -> Result<(), Fault<A>> {
        self.collaborators.journal.send(request).map_err(|_| {
            Fault::Killed(EntityKilled::JournalGone {
                persistence_id: self.persistence_id.clone(),
            })
        })
    }

    fn send_snapshot_request(
        &mut self,
        request: SnapshotRequest<A::Snapshot>,
    ) -> Result<(), Fault<A>> {
        self.collaborators.snapshot_store.send(request).map_err(|_| {
            Fault::Killed(EntityKilled::SnapshotStoreGone {
                persistence_id: self.persistence_id.clone(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::test_fixtures::{Tally, TallyCommand, TallyError, TallyEvent, Trace};
    use crate::journal::test_fixtures::MemoryJournal;
    use crate::snapshot::test_fixtures::MemorySnapshotStore;

    /// Drives a cell against scripted in-memory collaborators, fully
    /// synchronously: requests are routed to the fixtures and their
    /// replies fed back through `handle` until nothing moves.
    struct Harness {
        cell: EntityCell<Tally>,
        trace: Trace,
        collaborators: Collaborators<Tally>,
        settings: CellSettings,
        journal: MemoryJournal<TallyEvent, u64>,
        snapshots: MemorySnapshotStore<u64>,
        journal_rx: mpsc::UnboundedReceiver<JournalRequest<TallyEvent, u64>>,
        snapshot_rx: mpsc::UnboundedReceiver<SnapshotRequest<u64>>,
        journal_reply_rx: mpsc::UnboundedReceiver<JournalResponse<TallyEvent, u64>>,
        snapshot_reply_rx: mpsc::UnboundedReceiver<SnapshotResponse<u64>>,
    }

    fn pid() -> PersistenceId {
        PersistenceId::new("tally-1").expect("valid id")
    }

    /// A journal-resident event, as if written by a prior incarnation.
    fn stored(sequence_nr: u64, payload: TallyEvent) -> PersistentRepr<TallyEvent, u64> {
        PersistentRepr {
            payload,
            sequence_nr,
            persistence_id: pid(),
            sender: SenderRef::none(),
        }
    }

    fn build(
        journal: MemoryJournal<TallyEvent, u64>,
        snapshots: MemorySnapshotStore<u64>,
        settings: CellSettings,
    ) -> Harness {
        let trace = Trace::default();
        let (journal_tx, journal_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();
        let (journal_reply_tx, journal_reply_rx) = mpsc::unbounded_channel();
        let (snapshot_reply_tx, snapshot_reply_rx) = mpsc::unbounded_channel();
        let collaborators = Collaborators {
            journal: journal_tx,
            snapshot_store: snapshot_tx,
            journal_reply_to: journal_reply_tx,
            snapshot_reply_to: snapshot_reply_tx,
        };
        let cell = EntityCell::new(
            Tally::new("tally-1", trace.clone()),
            collaborators.clone(),
            settings.clone(),
        )
        .expect("valid entity");
        Harness {
            cell,
            trace,
            collaborators,
            settings,
            journal,
            snapshots,
            journal_rx,
            snapshot_rx,
            journal_reply_rx,
            snapshot_reply_rx,
        }
    }

    fn harness() -> Harness {
        build(
            MemoryJournal::new(),
            MemorySnapshotStore::new(),
            CellSettings::default(),
        )
    }

    impl Harness {
        /// Route every outstanding request and reply until quiescent.
        fn pump(&mut self) -> Result<(), Fault<Tally>> {
            loop {
                let mut progressed = false;
                while let Ok(request) = self.journal_rx.try_recv() {
                    self.journal.handle(request);
                    progressed = true;
                }
                while let Ok(request) = self.snapshot_rx.try_recv() {
                    self.snapshots.handle(request);
                    progressed = true;
                }
                while let Ok(reply) = self.journal_reply_rx.try_recv() {
                    self.cell.handle(Message::Journal(reply))?;
                    progressed = true;
                }
                while let Ok(reply) = self.snapshot_reply_rx.try_recv() {
                    self.cell.handle(Message::Snapshot(reply))?;
                    progressed = true;
                }
                if !progressed {
                    return Ok(());
                }
            }
        }

        /// Start the entity and run recovery to completion.
        fn recover(&mut self) -> Result<(), Fault<Tally>> {
            self.cell.start()?;
            self.pump()
        }

        /// Deliver a command without touching the collaborators.
        fn command(&mut self, command: TallyCommand) -> Result<(), Fault<Tally>> {
            self.cell.handle(Message::Command(Delivery::of(command)))
        }

        fn command_from(
            &mut self,
            command: TallyCommand,
            reply_to: ReplyTo<u64>,
        ) -> Result<(), Fault<Tally>> {
            self.cell.handle(Message::Command(Delivery {
                command,
                sender: SenderRef::new(reply_to),
            }))
        }

        /// Replace the cell with a fresh incarnation the way the host
        /// does, re-arming recovery with the given instruction.
        fn restart(&mut self, recover: Recover) {
            let new_cell = EntityCell::new(
                Tally::new("tally-1", self.trace.clone()),
                self.collaborators.clone(),
                self.settings.clone(),
            )
            .expect("valid entity");
            let old = mem::replace(&mut self.cell, new_cell);
            let restart_state = old.prepare_restart();
            for message in restart_state.requeue {
                self.cell
                    .handle(message)
                    .expect("requeued messages only stash during recovery");
            }
            self.cell
                .handle(Message::Recover(recover))
                .expect("recovery should start");
        }
    }

    #[test]
    fn empty_recovery_completes_with_zero_sequence() {
        let mut h = harness();
        h.recover().expect("recovery should succeed");

        assert!(h.cell.recovery_finished());
        assert!(!h.cell.recovery_running());
        assert_eq!(h.cell.last_sequence_nr(), 0);
        assert_eq!(h.cell.next_sequence_nr, 0);
        assert_eq!(h.trace.entries(), vec!["recovery_completed".to_string()]);
    }

    #[test]
    fn snapshot_then_replay_rebuilds_state_in_order() {
        let journal = MemoryJournal::with_events(vec![
            stored(11, TallyEvent::Added(1)),
            stored(12, TallyEvent::Added(2)),
            stored(13, TallyEvent::Added(3)),
        ]);
        let snapshots = MemorySnapshotStore::with_snapshot(
            SnapshotMetadata {
                persistence_id: pid(),
                sequence_nr: 10,
            },
            40,
        );
        let mut h = build(journal, snapshots, CellSettings::default());
        h.recover().expect("recovery should succeed");

        assert_eq!(
            h.trace.entries(),
            vec![
                "offer:10:40".to_string(),
                "replay:Added(1)".to_string(),
                "replay:Added(2)".to_string(),
                "replay:Added(3)".to_string(),
                "recovery_completed".to_string(),
            ]
        );
        assert_eq!(h.cell.entity().value, 46);
        assert_eq!(h.cell.last_sequence_nr(), 13);
        assert_eq!(h.cell.next_sequence_nr, 13);
    }

    #[test]
    fn recovery_sets_write_cursor_to_journal_highest() {
        let journal = MemoryJournal::with_events(vec![
            stored(1, TallyEvent::Added(1)),
            stored(2, TallyEvent::Added(1)),
            stored(3, TallyEvent::Added(1)),
        ]);
        let mut h = build(journal, MemorySnapshotStore::new(), CellSettings::default());
        h.recover().expect("recovery should succeed");
        assert_eq!(h.cell.next_sequence_nr, 3);

        // New writes continue the sequence without gaps.
        h.command(TallyCommand::AddMany(vec![1, 1]))
            .expect("command should succeed");
        h.pump().expect("write round-trip should succeed");
        assert_eq!(h.journal.stored_sequence_nrs(), vec![1, 2, 3, 4, 5]);
        assert_eq!(h.cell.last_sequence_nr(), 5);
    }

    #[test]
    fn persist_blocks_commands_until_acknowledged() {
        let mut h = harness();
        h.recover().expect("recovery should succeed");

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        h.command(TallyCommand::AddMany(vec![1, 2]))
            .expect("command should succeed");
        // Arrives between the command and its acks; must wait.
        h.command_from(TallyCommand::Get, reply_tx)
            .expect("stashing a command is not a fault");

        assert!(reply_rx.try_recv().is_err(), "Get must be delayed");
        assert!(h.cell.recovery_finished());

        h.pump().expect("acks should flow");
        assert_eq!(
            h.trace.entries(),
            vec![
                "recovery_completed".to_string(),
                "cmd:add_many:2".to_string(),
                "cb:Added(1)".to_string(),
                "cb:Added(2)".to_string(),
                "cmd:get:3".to_string(),
            ]
        );
        assert_eq!(reply_rx.try_recv().expect("reply after callbacks"), 3);
        // Both events went out in one atomic batch.
        assert_eq!(h.journal.write_batch_sizes, vec![2]);
    }

    #[test]
    fn persist_async_keeps_commands_flowing() {
        let mut h = harness();
        h.recover().expect("recovery should succeed");

        h.command(TallyCommand::AddAsync(5))
            .expect("command should succeed");
        // Processed before the ack arrives: the callback has not run,
        // so the observed value is still 0.
        h.command(TallyCommand::Get).expect("command should succeed");

        h.pump().expect("acks should flow");
        assert_eq!(
            h.trace.entries(),
            vec![
                "recovery_completed".to_string(),
                "cmd:add_async:5".to_string(),
                "cmd:get:0".to_string(),
                "cb:Added(5)".to_string(),
            ]
        );
    }

    #[test]
    fn async_callbacks_fire_in_persist_order() {
        let mut h = harness();
        h.recover().expect("recovery should succeed");

        h.command(TallyCommand::AddAsync(1))
            .expect("command should succeed");
        h.command(TallyCommand::AddAsync(2))
            .expect("command should succeed");
        h.pump().expect("acks should flow");

        assert_eq!(
            h.trace.entries(),
            vec![
                "recovery_completed".to_string(),
                "cmd:add_async:1".to_string(),
                "cmd:add_async:2".to_string(),
                "cb:Added(1)".to_string(),
                "cb:Added(2)".to_string(),
            ]
        );
        // The second write waited for the first ack, then went out on
        // its own.
        assert_eq!(h.journal.write_batch_sizes, vec![1, 1]);
    }

    #[test]
    fn defer_runs_after_pending_async_persist() {
        let mut h = harness();
        h.recover().expect("recovery should succeed");

        h.command(TallyCommand::AddAsyncThenNote(4, "memo".into()))
            .expect("command should succeed");
        h.pump().expect("acks should flow");

        assert_eq!(
            h.trace.entries(),
            vec![
                "recovery_completed".to_string(),
                "cmd:add_then_note:4".to_string(),
                "cb:Added(4)".to_string(),
                "cb:Noted(\"memo\")".to_string(),
            ]
        );
        // The deferred payload travelled with the batch but was never
        // written.
        assert_eq!(h.journal.stored_payloads(), vec![TallyEvent::Added(4)]);
    }

    #[test]
    fn defer_with_empty_ledger_runs_synchronously() {
        let mut h = harness();
        h.recover().expect("recovery should succeed");

        h.command(TallyCommand::Note("now".into()))
            .expect("command should succeed");

        // No journal round-trip involved at all.
        assert_eq!(
            h.trace.entries(),
            vec![
                "recovery_completed".to_string(),
                "cmd:note:now".to_string(),
                "cb:Noted(\"now\")".to_string(),
            ]
        );
        assert!(h.journal.write_batch_sizes.is_empty());
    }

    #[test]
    fn defer_waits_for_persist_pending_from_an_earlier_command() {
        let mut h = harness();
        h.recover().expect("recovery should succeed");

        h.command(TallyCommand::AddAsync(1))
            .expect("command should succeed");
        h.command(TallyCommand::Note("later".into()))
            .expect("command should succeed");
        h.pump().expect("acks should flow");

        assert_eq!(
            h.trace.entries(),
            vec![
                "recovery_completed".to_string(),
                "cmd:add_async:1".to_string(),
                "cmd:note:later".to_string(),
                "cb:Added(1)".to_string(),
                "cb:Noted(\"later\")".to_string(),
            ]
        );
        assert_eq!(h.journal.stored_payloads(), vec![TallyEvent::Added(1)]);
    }

    #[test]
    fn write_failure_kills_by_default() {
        let mut h = harness();
        h.recover().expect("recovery should succeed");
        h.journal.fail_next_write = Some(JournalError::new("disk full"));

        h.command(TallyCommand::Add(5))
            .expect("command itself succeeds");
        let fault = h.pump().expect_err("write failure should kill");

        match fault {
            Fault::Killed(EntityKilled::PersistenceFailed {
                persistence_id,
                sequence_nr,
                cause,
            }) => {
                assert_eq!(persistence_id.as_str(), "tally-1");
                assert_eq!(sequence_nr, 1);
                assert_eq!(cause, JournalError::new("disk full"));
            }
            other => panic!("expected PersistenceFailed, got: {other:?}"),
        }
        assert!(h
            .trace
            .entries()
            .contains(&"persistence_failure:Added(5):1".to_string()));
    }

    #[test]
    fn handled_write_failure_resumes_command_processing() {
        let mut h = harness();
        h.recover().expect("recovery should succeed");
        h.cell.entity.resume_on_persistence_failure = true;
        h.journal.fail_next_write = Some(JournalError::new("disk full"));

        h.command(TallyCommand::Add(5))
            .expect("command should succeed");
        h.pump().expect("handled failure is not fatal");
        assert_eq!(h.cell.entity().value, 0, "failed event must not apply");

        // The entity keeps working; the burnt sequence number is not
        // reused.
        h.command(TallyCommand::Add(3))
            .expect("command should succeed");
        h.pump().expect("write should succeed");
        assert_eq!(h.cell.entity().value, 3);
        assert_eq!(h.journal.stored_sequence_nrs(), vec![2]);
    }

    #[test]
    fn stale_instance_replies_have_no_observable_effect() {
        let mut h = harness();
        h.recover().expect("recovery should succeed");

        let stale_id = h.cell.instance_id().wrapping_add(1);
        h.cell
            .handle(Message::Journal(JournalResponse::WriteMessageSuccess(
                stored(9, TallyEvent::Added(9)),
                stale_id,
            )))
            .expect("stale ack is dropped silently");

        assert_eq!(h.cell.last_sequence_nr(), 0);
        assert_eq!(h.cell.entity().value, 0);
        assert_eq!(h.trace.entries(), vec!["recovery_completed".to_string()]);
    }

    #[test]
    fn restart_during_inflight_write_discards_stale_ack_and_replays() {
        let mut h = harness();
        h.recover().expect("recovery should succeed");

        // Write goes out but the journal has not answered yet.
        h.command(TallyCommand::Add(3))
            .expect("command should succeed");

        // Externally caused restart: full recovery.
        h.restart(Recover::default());
        h.pump().expect("recovery should succeed");

        // The journal processed the old incarnation's write before the
        // replay request, so the event is part of the rebuilt state;
        // its ack went to the dead incarnation and was dropped.
        assert_eq!(h.cell.entity().value, 3);
        let entries = h.trace.entries();
        assert!(entries.contains(&"pre_restart".to_string()));
        assert!(entries.contains(&"replay:Added(3)".to_string()));
        assert!(
            !entries.iter().any(|e| e.starts_with("cb:")),
            "no persist callback may fire across incarnations: {entries:?}"
        );
    }

    #[test]
    fn replay_handler_failure_absorbs_remaining_replay_then_faults() {
        let journal = MemoryJournal::with_events(vec![
            stored(1, TallyEvent::Added(1)),
            stored(2, TallyEvent::Poison),
            stored(3, TallyEvent::Added(2)),
        ]);
        let mut h = build(journal, MemorySnapshotStore::new(), CellSettings::default());

        let fault = h.recover().expect_err("poison event should fault");
        match fault {
            Fault::Replay { cause, payload } => {
                assert!(matches!(cause, TallyError::PoisonEvent));
                assert_eq!(payload, Some(TallyEvent::Poison));
            }
            other => panic!("expected Fault::Replay, got: {other:?}"),
        }

        // Events after the poison were absorbed, not dispatched, and
        // the high-water is pinned so the restart replays fully.
        let entries = h.trace.entries();
        assert!(entries.contains(&"replay:Added(1)".to_string()));
        assert!(!entries.contains(&"replay:Added(2)".to_string()));
        assert_eq!(h.cell.last_sequence_nr(), u64::MAX);
    }

    #[test]
    fn recovery_failure_kills_with_descriptive_error() {
        let mut journal: MemoryJournal<TallyEvent, u64> = MemoryJournal::new();
        journal.fail_replay = Some(JournalError::new("segment torn"));
        let mut h = build(journal, MemorySnapshotStore::new(), CellSettings::default());

        let fault = h.recover().expect_err("replay failure should kill");
        let rendered = fault.to_string();
        assert!(rendered.contains("tally-1"), "got: {rendered}");
        assert!(rendered.contains("segment torn"), "got: {rendered}");

        let entries = h.trace.entries();
        assert!(entries.contains(&"replay_failure:segment torn".to_string()));
        assert!(entries
            .iter()
            .any(|e| e.starts_with("recovery_failure:")));
    }

    #[test]
    fn handled_recovery_failure_waits_for_explicit_recover() {
        let mut journal = MemoryJournal::with_events(vec![stored(1, TallyEvent::Added(2))]);
        journal.fail_replay = Some(JournalError::new("flaky"));
        let mut h = build(journal, MemorySnapshotStore::new(), CellSettings::default());
        h.cell.entity.resume_on_recovery_failure = true;

        h.recover().expect("handled failure is not fatal");
        assert!(h.cell.recovery_running(), "entity must be unavailable");

        // Commands stash until someone re-arms recovery.
        h.command(TallyCommand::Add(1))
            .expect("stashing is not a fault");
        assert!(!h.trace.entries().iter().any(|e| e.starts_with("cmd:")));

        h.journal.fail_replay = None;
        h.cell
            .handle(Message::Recover(Recover::default()))
            .expect("re-recover should start");
        h.pump().expect("second recovery should succeed");

        assert!(h.cell.recovery_finished());
        // Replayed state plus the stashed command.
        assert_eq!(h.cell.entity().value, 3);
    }

    #[test]
    fn unstash_all_feeds_user_stash_ahead_of_mailbox_traffic() {
        let mut h = harness();
        h.recover().expect("recovery should succeed");

        h.command(TallyCommand::Hold(Box::new(TallyCommand::Add(1))))
            .expect("command should succeed");
        h.command(TallyCommand::Hold(Box::new(TallyCommand::Add(2))))
            .expect("command should succeed");
        h.command(TallyCommand::Unstash)
            .expect("command should succeed");
        // Arrives after the unstash; must run after both held commands.
        h.command(TallyCommand::Get).expect("command should succeed");
        h.pump().expect("acks should flow");

        let entries = h.trace.entries();
        let relevant: Vec<&String> = entries
            .iter()
            .filter(|e| e.starts_with("cmd:add:") || e.starts_with("cb:") || e.starts_with("cmd:get"))
            .collect();
        assert_eq!(
            relevant,
            vec![
                "cmd:add:1",
                "cb:Added(1)",
                "cmd:add:2",
                "cb:Added(2)",
                "cmd:get:3",
            ]
        );
    }

    #[test]
    fn async_writes_accumulate_while_one_is_in_flight() {
        let mut h = harness();
        h.recover().expect("recovery should succeed");

        h.command(TallyCommand::AddAsync(1))
            .expect("command should succeed");
        h.command(TallyCommand::AddAsync(2))
            .expect("command should succeed");
        h.command(TallyCommand::AddAsync(3))
            .expect("command should succeed");
        // First write went straight out; the rest accumulated.
        assert_eq!(h.cell.batcher.len(), 2);

        h.pump().expect("acks should flow");
        assert_eq!(h.journal.write_batch_sizes, vec![1, 2]);
        assert_eq!(h.cell.entity().value, 6);
        assert_eq!(h.journal.stored_sequence_nrs(), vec![1, 2, 3]);
    }

    #[test]
    fn full_batch_flushes_at_the_size_bound() {
        let settings = CellSettings {
            max_message_batch_size: 2,
        };
        let mut h = build(MemoryJournal::new(), MemorySnapshotStore::new(), settings);
        h.recover().expect("recovery should succeed");

        h.command(TallyCommand::AddManyAsync(vec![1, 2, 3]))
            .expect("command should succeed");
        h.pump().expect("acks should flow");

        assert_eq!(h.journal.write_batch_sizes, vec![2, 1]);
        assert_eq!(h.cell.entity().value, 6);
    }

    #[test]
    fn oversized_stashing_group_stays_in_one_write() {
        let settings = CellSettings {
            max_message_batch_size: 2,
        };
        let mut h = build(MemoryJournal::new(), MemorySnapshotStore::new(), settings);
        h.recover().expect("recovery should succeed");

        // Three events from one blocking persist group: the size bound
        // must not break the group's atomicity.
        h.command(TallyCommand::AddMany(vec![1, 2, 3]))
            .expect("command should succeed");
        h.pump().expect("acks should flow");

        assert_eq!(h.journal.write_batch_sizes, vec![3]);
        assert_eq!(h.cell.entity().value, 6);
        assert_eq!(h.journal.stored_sequence_nrs(), vec![1, 2, 3]);
    }

    #[test]
    fn save_snapshot_covers_the_last_sequence_nr() {
        let journal = MemoryJournal::with_events(vec![
            stored(1, TallyEvent::Added(1)),
            stored(2, TallyEvent::Added(2)),
            stored(3, TallyEvent::Added(3)),
        ]);
        let mut h = build(journal, MemorySnapshotStore::new(), CellSettings::default());
        h.recover().expect("recovery should succeed");

        h.command(TallyCommand::TakeSnapshot)
            .expect("command should succeed");
        h.pump().expect("save should succeed");

        let (metadata, snapshot) = h.snapshots.stored().expect("snapshot stored");
        assert_eq!(metadata.sequence_nr, 3);
        assert_eq!(*snapshot, 6);
        assert!(h.trace.entries().contains(&"snapshot_saved:3".to_string()));
    }

    #[test]
    fn failed_snapshot_save_reports_the_cause() {
        let mut h = harness();
        h.recover().expect("recovery should succeed");
        h.snapshots.fail_next_save = Some(crate::snapshot::SnapshotError::new("no space"));

        h.command(TallyCommand::TakeSnapshot)
            .expect("command should succeed");
        h.pump().expect("a failed save is not fatal");

        assert!(h
            .trace
            .entries()
            .contains(&"snapshot_failed:no space".to_string()));
    }

    #[test]
    fn delete_messages_forwards_to_the_journal() {
        let journal = MemoryJournal::with_events(vec![
            stored(1, TallyEvent::Added(1)),
            stored(2, TallyEvent::Added(2)),
            stored(3, TallyEvent::Added(3)),
        ]);
        let mut h = build(journal, MemorySnapshotStore::new(), CellSettings::default());
        h.recover().expect("recovery should succeed");

        h.command(TallyCommand::Prune {
            to: 2,
            permanent: true,
        })
        .expect("command should succeed");
        h.pump().expect("delete is fire-and-forget");

        assert_eq!(h.journal.deleted_to, Some((2, true)));
        assert_eq!(h.journal.stored_sequence_nrs(), vec![3]);
    }

    #[test]
    fn command_handler_error_propagates_untouched() {
        let mut h = harness();
        h.recover().expect("recovery should succeed");

        let fault = h
            .command(TallyCommand::Explode)
            .expect_err("handler error should surface");
        assert!(matches!(fault, Fault::Command(TallyError::Boom)));
        // The cell itself is still coherent; the host decides what
        // happens next.
        assert!(h.cell.recovery_finished());
    }

    #[test]
    fn get_replies_to_the_sender() {
        let mut h = harness();
        h.recover().expect("recovery should succeed");

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        h.command_from(TallyCommand::Get, reply_tx)
            .expect("command should succeed");
        assert_eq!(reply_rx.try_recv().expect("immediate reply"), 0);
    }

    #[test]
    fn duplicate_recover_is_ignored() {
        let mut h = harness();
        h.recover().expect("recovery should succeed");

        h.cell
            .handle(Message::Recover(Recover::default()))
            .expect("duplicate Recover is harmless");
        assert!(h.cell.recovery_finished());
        assert!(
            h.snapshot_rx.try_recv().is_err(),
            "no new snapshot load may be requested"
        );
    }

    #[test]
    fn commands_arriving_during_recovery_are_stashed_in_order() {
        let journal = MemoryJournal::with_events(vec![stored(1, TallyEvent::Added(10))]);
        let mut h = build(journal, MemorySnapshotStore::new(), CellSettings::default());

        h.cell.start().expect("start should succeed");
        h.command(TallyCommand::AddAsync(1))
            .expect("stashing is not a fault");
        h.command(TallyCommand::Get).expect("stashing is not a fault");
        h.pump().expect("recovery should succeed");

        let entries = h.trace.entries();
        assert_eq!(
            entries,
            vec![
                "replay:Added(10)".to_string(),
                "recovery_completed".to_string(),
                "cmd:add_async:1".to_string(),
                "cmd:get:10".to_string(),
                "cb:Added(1)".to_string(),
            ]
        );
    }
}
