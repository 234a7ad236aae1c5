//! Per-entity event-sourced actor cells.
//!
//! `eventcell` provides the runtime core for entities whose state is
//! derived from a journaled event history: recovery from snapshot and
//! replay, command processing with `persist` / `persist_async` /
//! `defer` ordering guarantees, write batching toward the journal, and
//! restart-safe correlation of in-flight writes. The journal and
//! snapshot store themselves are external collaborators reached over
//! channels -- this crate defines the message vocabulary, not the
//! storage.
//!
//! # Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`PersistentEntity`] | User contract: recover handler, command handler, hooks |
//! | [`Effects`] | Per-command surface: persist, defer, stash, reply |
//! | [`EntityCell`] | The lifecycle state machine around one entity |
//! | [`spawn_entity`] / [`EntityHandle`] | Tokio host loop and its cloneable handle |
//! | [`JournalRequest`] / [`JournalResponse`] | Contract with the journal |
//! | [`SnapshotRequest`] / [`SnapshotResponse`] | Contract with the snapshot store |
//!
//! # Ordering contract
//!
//! - Events registered by one command are written in one atomic batch.
//! - Callbacks fire in registration order, across commands.
//! - While a `persist` (stashing) callback is outstanding, no new
//!   command is delivered; `persist_async` keeps commands flowing.
//! - `defer` callbacks run after every earlier pending invocation.
//! - Replies addressed to a previous incarnation of the entity are
//!   discarded.
//!
//! # Quick Start
//!
//! ```no_run
//! use eventcell::{
//!     CellSettings, Effects, JournalTx, PersistentEntity, Recovery, SnapshotTx, spawn_entity,
//! };
//! use tokio::sync::mpsc;
//!
//! // 1. Define your entity.
//! struct Counter {
//!     value: u64,
//! }
//!
//! enum CounterCommand {
//!     Increment,
//!     Get,
//! }
//!
//! #[derive(Debug, Clone)]
//! enum CounterEvent {
//!     Incremented,
//! }
//!
//! #[derive(Debug, thiserror::Error)]
//! enum CounterError {}
//!
//! impl PersistentEntity for Counter {
//!     type Command = CounterCommand;
//!     type Event = CounterEvent;
//!     type Snapshot = u64;
//!     type Reply = u64;
//!     type Error = CounterError;
//!
//!     fn persistence_id(&self) -> &str {
//!         "counter-1"
//!     }
//!
//!     fn receive_recover(&mut self, event: Recovery<Self>) -> Result<(), CounterError> {
//!         match event {
//!             Recovery::Event(CounterEvent::Incremented) => self.value += 1,
//!             Recovery::SnapshotOffer(offer) => self.value = offer.snapshot,
//!             Recovery::Completed => {}
//!         }
//!         Ok(())
//!     }
//!
//!     fn receive_command(
//!         &mut self,
//!         effects: &mut Effects<Self>,
//!         command: CounterCommand,
//!     ) -> Result<(), CounterError> {
//!         match command {
//!             CounterCommand::Increment => {
//!                 effects.persist(CounterEvent::Incremented, |counter, _event| {
//!                     counter.value += 1;
//!                 });
//!             }
//!             CounterCommand::Get => {
//!                 effects.reply(self.value);
//!             }
//!         }
//!         Ok(())
//!     }
//! }
//!
//! // 2. Wire a journal and snapshot store (any implementation of the
//! //    message contracts), then spawn and send commands.
//! # fn wire() -> (JournalTx<Counter>, SnapshotTx<Counter>) { unimplemented!() }
//! # async fn run() {
//! let (journal, snapshot_store) = wire();
//! let handle = spawn_entity(
//!     || Counter { value: 0 },
//!     journal,
//!     snapshot_store,
//!     CellSettings::default(),
//! )
//! .expect("valid persistence id");
//!
//! handle.tell(CounterCommand::Increment).expect("running");
//! let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
//! handle
//!     .tell_from(CounterCommand::Get, reply_tx)
//!     .expect("running");
//! assert_eq!(reply_rx.recv().await, Some(1));
//! # }
//! ```

mod actor;
pub use actor::{EntityHandle, spawn_entity};
mod batcher;
mod cell;
pub use cell::{
    CellSettings, Collaborators, Delivery, Effects, EntityCell, JournalReplyTx, JournalTx,
    Message, Recover, RestartState, SnapshotReplyTx, SnapshotTx,
};
mod entity;
pub use entity::{FailureDirective, PersistentEntity, Recovery};
mod envelope;
pub use envelope::{
    Envelope, NonPersistentRepr, PersistenceId, PersistenceIdError, PersistentRepr, ReplyTo,
    SenderRef,
};
mod error;
pub use error::{EntityGone, EntityKilled, Fault, RecoveryFailure, SpawnError};
mod journal;
pub use journal::{JournalError, JournalRequest, JournalResponse};
mod ledger;
mod snapshot;
pub use snapshot::{
    SaveSnapshotResult, SelectedSnapshot, SnapshotError, SnapshotMetadata, SnapshotOffer,
    SnapshotRequest, SnapshotResponse, SnapshotSelectionCriteria,
};
mod stash;
