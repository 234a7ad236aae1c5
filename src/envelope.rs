//! Entity identity and the envelope types exchanged with the journal.
//!
//! This module provides the foundational data types that the cell,
//! batcher, and journal-facing modules all depend on. No I/O occurs
//! here; envelopes are plain values that travel over channels.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Channel endpoint over which a collaborator delivers replies.
///
/// Unbounded because the cell must never block the scheduler thread;
/// back-pressure toward the journal is handled by the write batcher,
/// not the reply path.
pub type ReplyTo<M> = mpsc::UnboundedSender<M>;

/// Error returned when constructing a [`PersistenceId`] from an
/// unsuitable string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceIdError {
    /// The id string was empty.
    #[error("persistence id must be a non-empty string")]
    Empty,
}

/// Stable identity of a persistent entity.
///
/// Opaque, non-empty string used as the routing key for both the
/// journal and the snapshot store. Stable for the lifetime of the
/// logical entity: the same id always addresses the same event stream,
/// across process restarts and entity incarnations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PersistenceId(String);

impl PersistenceId {
    /// Validate and wrap an id string.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceIdError::Empty`] if the string is empty.
    pub fn new(id: impl Into<String>) -> Result<Self, PersistenceIdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(PersistenceIdError::Empty);
        }
        Ok(Self(id))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PersistenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PersistenceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PersistenceId {
    type Error = PersistenceIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PersistenceId> for String {
    fn from(value: PersistenceId) -> Self {
        value.0
    }
}

/// Address of the party that sent a command, stamped onto envelopes at
/// dispatch time.
///
/// Wraps an optional reply channel so that envelopes stay cheap to
/// clone and journal implementations can echo the sender back without
/// caring about the reply payload. A `SenderRef` with no channel is the
/// "no sender" case (fire-and-forget commands, replayed envelopes whose
/// original sender is gone).
pub struct SenderRef<R>(Option<ReplyTo<R>>);

impl<R> SenderRef<R> {
    /// A sender reference with no reply channel.
    pub fn none() -> Self {
        Self(None)
    }

    /// Wrap a reply channel.
    pub fn new(reply_to: ReplyTo<R>) -> Self {
        Self(Some(reply_to))
    }

    /// Whether a reply channel is attached.
    pub fn is_some(&self) -> bool {
        self.0.is_some()
    }

    /// Send a reply to the originator.
    ///
    /// Returns `false` when no channel is attached or the originator
    /// has gone away; replies to the departed are silently discarded.
    pub fn reply(&self, message: R) -> bool {
        match &self.0 {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }
}

// Manual impls because `R` itself is neither `Clone` nor `Debug`-bound:
// only the channel handle is cloned or printed, and that is `Clone` and
// `Debug` for any `R`. A derive would demand bounds on `R`.
impl<R> Clone for SenderRef<R> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<R> Default for SenderRef<R> {
    fn default() -> Self {
        Self::none()
    }
}

impl<R> fmt::Debug for SenderRef<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(_) => f.write_str("SenderRef(..)"),
            None => f.write_str("SenderRef(none)"),
        }
    }
}

/// An event headed for (or replayed from) the journal.
///
/// Carries the assigned sequence number and the identity of the owning
/// entity. The sequence number is assigned when the envelope moves from
/// the per-command event batch into the journal batch, not when the
/// user invoked `persist` -- a command that fails before flush must not
/// create sequence gaps.
pub struct PersistentRepr<E, R> {
    /// Opaque user event payload.
    pub payload: E,
    /// Entity-local, strictly increasing sequence number.
    pub sequence_nr: u64,
    /// Identity of the owning entity.
    pub persistence_id: PersistenceId,
    /// Originator of the command that produced this event.
    pub sender: SenderRef<R>,
}

/// A deferred payload travelling through the journal for ordering only.
///
/// Never written. The journal answers it with `LoopMessageSuccess` in
/// batch order, which is what lets `defer` callbacks run after all
/// earlier persisted events have been acknowledged.
pub struct NonPersistentRepr<E, R> {
    /// Opaque user payload handed back to the deferred callback.
    pub payload: E,
    /// Originator of the command that deferred this payload.
    pub sender: SenderRef<R>,
}

/// One slot of a journal write batch.
pub enum Envelope<E, R> {
    /// To be written durably.
    Persistent(PersistentRepr<E, R>),
    /// Looped back unwritten, for callback ordering.
    NonPersistent(NonPersistentRepr<E, R>),
}

impl<E, R> Envelope<E, R> {
    /// Whether this envelope is durably written by the journal.
    pub fn is_persistent(&self) -> bool {
        matches!(self, Envelope::Persistent(_))
    }
}

// Clone/Debug by hand for the same reason as `SenderRef`: only `E`
// carries real bounds.
impl<E: Clone, R> Clone for PersistentRepr<E, R> {
    fn clone(&self) -> Self {
        Self {
            payload: self.payload.clone(),
            sequence_nr: self.sequence_nr,
            persistence_id: self.persistence_id.clone(),
            sender: self.sender.clone(),
        }
    }
}

impl<E: fmt::Debug, R> fmt::Debug for PersistentRepr<E, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentRepr")
            .field("payload", &self.payload)
            .field("sequence_nr", &self.sequence_nr)
            .field("persistence_id", &self.persistence_id)
            .finish_non_exhaustive()
    }
}

impl<E: Clone, R> Clone for NonPersistentRepr<E, R> {
    fn clone(&self) -> Self {
        Self {
            payload: self.payload.clone(),
            sender: self.sender.clone(),
        }
    }
}

impl<E: fmt::Debug, R> fmt::Debug for NonPersistentRepr<E, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonPersistentRepr")
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

impl<E: Clone, R> Clone for Envelope<E, R> {
    fn clone(&self) -> Self {
        match self {
            Envelope::Persistent(p) => Envelope::Persistent(p.clone()),
            Envelope::NonPersistent(n) => Envelope::NonPersistent(n.clone()),
        }
    }
}

impl<E: fmt::Debug, R> fmt::Debug for Envelope<E, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Envelope::Persistent(p) => f.debug_tuple("Persistent").field(p).finish(),
            Envelope::NonPersistent(n) => f.debug_tuple("NonPersistent").field(n).finish(),
        }
    }
}
