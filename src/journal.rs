//! Message vocabulary exchanged with the journal.
//!
//! The journal itself is an external collaborator: an append-only log
//! keyed by persistence id that provides atomic multi-event writes,
//! ordered replay, and highest-sequence queries. This crate never talks
//! to storage directly; it sends [`JournalRequest`] values over a
//! channel and receives [`JournalResponse`] values back on the
//! `reply_to` endpoint stamped into each request.
//!
//! # Journal contract
//!
//! - Writes for one entity are applied in request order and answered in
//!   request order.
//! - `WriteMessages` is atomic: either every persistent envelope in the
//!   batch is stored or none is.
//! - Each envelope in a batch is answered individually, in batch order:
//!   `WriteMessageSuccess`/`WriteMessageFailure` for persistent
//!   envelopes, `LoopMessageSuccess` for non-persistent ones (which are
//!   looped back unwritten). The batch-level
//!   `WriteMessagesSuccessful`/`WriteMessagesFailed` outcome follows.
//! - Replies echo the `instance_id` of the originating request so a
//!   restarted entity can discard replies addressed to a prior
//!   incarnation.

use crate::envelope::{Envelope, NonPersistentRepr, PersistenceId, PersistentRepr, ReplyTo};

/// Opaque failure cause reported by the journal.
///
/// Causes cross the collaborator boundary as messages, so they carry a
/// rendered description rather than a live error value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct JournalError {
    /// Human-readable description of the failure.
    pub message: String,
}

impl JournalError {
    /// Wrap a failure description.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Requests sent from the cell to the journal.
pub enum JournalRequest<E, R> {
    /// Replay stored events one by one, ascending by sequence number.
    ///
    /// The journal answers with a `ReplayedMessage` per event in
    /// `from_sequence_nr..=to_sequence_nr` (at most `max` of them),
    /// terminated by `ReplayMessagesSuccess` or
    /// `ReplayMessagesFailure`.
    ReplayMessages {
        /// First sequence number to replay (inclusive).
        from_sequence_nr: u64,
        /// Last sequence number to replay (inclusive).
        to_sequence_nr: u64,
        /// Upper bound on the number of replayed events.
        max: u64,
        /// Entity whose stream is replayed.
        persistence_id: PersistenceId,
        /// Where replay traffic is delivered.
        reply_to: ReplyTo<JournalResponse<E, R>>,
    },

    /// Report the highest stored sequence number for the entity.
    ReadHighestSequenceNr {
        /// Hint: the caller has already seen everything up to here.
        from_sequence_nr: u64,
        /// Entity whose stream is queried.
        persistence_id: PersistenceId,
        /// Where the outcome is delivered.
        reply_to: ReplyTo<JournalResponse<E, R>>,
    },

    /// Atomically write a batch of envelopes.
    WriteMessages {
        /// Envelopes in callback order; non-persistent ones are looped
        /// back unwritten.
        batch: Vec<Envelope<E, R>>,
        /// Where per-envelope and batch-level outcomes are delivered.
        reply_to: ReplyTo<JournalResponse<E, R>>,
        /// Incarnation tag echoed in every reply to this request.
        instance_id: u32,
    },

    /// Delete (logically or physically) all events up to a sequence
    /// number. Fire-and-forget: the journal sends no reply.
    DeleteMessagesTo {
        /// Entity whose stream is pruned.
        persistence_id: PersistenceId,
        /// Last sequence number to delete (inclusive).
        to_sequence_nr: u64,
        /// Physical deletion when `true`, logical otherwise.
        permanent: bool,
    },
}

/// Replies sent from the journal back to the cell.
pub enum JournalResponse<E, R> {
    /// One replayed event.
    ReplayedMessage(PersistentRepr<E, R>),
    /// Replay finished; every requested event was delivered.
    ReplayMessagesSuccess,
    /// Replay aborted.
    ReplayMessagesFailure(JournalError),
    /// Highest stored sequence number.
    ReadHighestSequenceNrSuccess(u64),
    /// Highest-sequence lookup failed.
    ReadHighestSequenceNrFailure(JournalError),
    /// One persistent envelope was written durably.
    WriteMessageSuccess(PersistentRepr<E, R>, u32),
    /// One persistent envelope was rejected.
    WriteMessageFailure(PersistentRepr<E, R>, JournalError, u32),
    /// One non-persistent envelope was looped back in order.
    LoopMessageSuccess(NonPersistentRepr<E, R>, u32),
    /// Batch-level outcome: every envelope succeeded. Flow control
    /// only; carries no instance id.
    WriteMessagesSuccessful,
    /// Batch-level outcome: the write round-trip failed. Flow control
    /// only; carries no instance id.
    WriteMessagesFailed(JournalError),
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    //! Scripted in-memory journal used by the cell and host-loop tests.

    use super::*;

    /// In-memory journal answering requests synchronously through the
    /// `reply_to` endpoint of each request.
    ///
    /// Failure behaviour is scripted per test via the `fail_*` flags.
    /// Reply send errors are ignored throughout: a dropped receiver
    /// means the test has already asserted what it wanted.
    pub(crate) struct MemoryJournal<E, R> {
        events: Vec<PersistentRepr<E, R>>,
        /// High-water mark; survives deletion like a real journal's.
        highest: u64,
        /// Fail the next `WriteMessages` batch with this cause.
        pub(crate) fail_next_write: Option<JournalError>,
        /// Fail any `ReplayMessages` with this cause, after replaying
        /// `replay_before_failure` events.
        pub(crate) fail_replay: Option<JournalError>,
        pub(crate) replay_before_failure: usize,
        /// Fail any `ReadHighestSequenceNr` with this cause.
        pub(crate) fail_read_highest: Option<JournalError>,
        /// Most recent deletion request, for assertions.
        pub(crate) deleted_to: Option<(u64, bool)>,
        /// Size of every `WriteMessages` batch received, in order.
        pub(crate) write_batch_sizes: Vec<usize>,
    }

    impl<E: Clone, R> MemoryJournal<E, R> {
        pub(crate) fn new() -> Self {
            Self {
                events: Vec::new(),
                highest: 0,
                fail_next_write: None,
                fail_replay: None,
                replay_before_failure: 0,
                fail_read_highest: None,
                deleted_to: None,
                write_batch_sizes: Vec::new(),
            }
        }

        /// Seed the stream with pre-existing events, as if written by a
        /// prior incarnation.
        pub(crate) fn with_events(events: Vec<PersistentRepr<E, R>>) -> Self {
            let highest = events.iter().map(|p| p.sequence_nr).max().unwrap_or(0);
            Self {
                events,
                highest,
                ..Self::new()
            }
        }

        pub(crate) fn stored_payloads(&self) -> Vec<E> {
            self.events.iter().map(|p| p.payload.clone()).collect()
        }

        pub(crate) fn stored_sequence_nrs(&self) -> Vec<u64> {
            self.events.iter().map(|p| p.sequence_nr).collect()
        }

        pub(crate) fn highest_sequence_nr(&self) -> u64 {
            self.highest
        }

        /// Answer one request, pushing replies into its `reply_to`.
        pub(crate) fn handle(&mut self, request: JournalRequest<E, R>) {
            match request {
                JournalRequest::ReplayMessages {
                    from_sequence_nr,
                    to_sequence_nr,
                    max,
                    reply_to,
                    ..
                } => self.replay(from_sequence_nr, to_sequence_nr, max, reply_to),
                JournalRequest::ReadHighestSequenceNr { reply_to, .. } => {
                    let reply = match self.fail_read_highest.clone() {
                        Some(cause) => JournalResponse::ReadHighestSequenceNrFailure(cause),
                        None => JournalResponse::ReadHighestSequenceNrSuccess(self.highest),
                    };
                    let _ = reply_to.send(reply);
                }
                JournalRequest::WriteMessages {
                    batch,
                    reply_to,
                    instance_id,
                } => self.write(batch, reply_to, instance_id),
                JournalRequest::DeleteMessagesTo {
                    to_sequence_nr,
                    permanent,
                    ..
                } => {
                    self.events.retain(|p| p.sequence_nr > to_sequence_nr);
                    self.deleted_to = Some((to_sequence_nr, permanent));
                }
            }
        }

        fn replay(
            &mut self,
            from: u64,
            to: u64,
            max: u64,
            reply_to: ReplyTo<JournalResponse<E, R>>,
        ) {
            let selected = self
                .events
                .iter()
                .filter(|p| p.sequence_nr >= from && p.sequence_nr <= to)
                .take(max.min(usize::MAX as u64) as usize);

            if let Some(cause) = self.fail_replay.clone() {
                for repr in selected.take(self.replay_before_failure) {
                    let _ = reply_to.send(JournalResponse::ReplayedMessage(repr.clone()));
                }
                let _ = reply_to.send(JournalResponse::ReplayMessagesFailure(cause));
                return;
            }

            for repr in selected {
                let _ = reply_to.send(JournalResponse::ReplayedMessage(repr.clone()));
            }
            let _ = reply_to.send(JournalResponse::ReplayMessagesSuccess);
        }

        fn write(
            &mut self,
            batch: Vec<Envelope<E, R>>,
            reply_to: ReplyTo<JournalResponse<E, R>>,
            instance_id: u32,
        ) {
            self.write_batch_sizes.push(batch.len());
            if let Some(cause) = self.fail_next_write.take() {
                for envelope in batch {
                    let reply = match envelope {
                        Envelope::Persistent(p) => {
                            JournalResponse::WriteMessageFailure(p, cause.clone(), instance_id)
                        }
                        // Nothing was written, but deferred entries still
                        // consume their ledger slot.
                        Envelope::NonPersistent(n) => {
                            JournalResponse::LoopMessageSuccess(n, instance_id)
                        }
                    };
                    let _ = reply_to.send(reply);
                }
                let _ = reply_to.send(JournalResponse::WriteMessagesFailed(cause));
                return;
            }

            for envelope in batch {
                let reply = match envelope {
                    Envelope::Persistent(p) => {
                        self.highest = self.highest.max(p.sequence_nr);
                        self.events.push(p.clone());
                        JournalResponse::WriteMessageSuccess(p, instance_id)
                    }
                    Envelope::NonPersistent(n) => {
                        JournalResponse::LoopMessageSuccess(n, instance_id)
                    }
                };
                let _ = reply_to.send(reply);
            }
            let _ = reply_to.send(JournalResponse::WriteMessagesSuccessful);
        }
    }
}
