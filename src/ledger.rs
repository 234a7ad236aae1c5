//! Pending invocation ledger: outstanding persist/defer callbacks in
//! FIFO order.
//!
//! Every `persist`, `persist_async`, and (non-immediate) `defer` call
//! appends one entry; every per-envelope journal reply consumes the
//! head. The `Stashing` cardinality decides whether new user commands
//! may be delivered (none while it is positive).

use std::collections::VecDeque;
use std::sync::Arc;

use crate::entity::PersistentEntity;

/// A user callback awaiting its journal reply.
///
/// Single callbacks are `FnOnce`; the plural persist forms share one
/// `Fn` across all events of the group.
pub(crate) enum Callback<A: PersistentEntity> {
    Once(Box<dyn FnOnce(&mut A, A::Event) + Send>),
    Shared(Arc<dyn Fn(&mut A, A::Event) + Send + Sync>),
}

impl<A: PersistentEntity> Callback<A> {
    /// Run the callback against the entity with the acknowledged event.
    pub(crate) fn invoke(self, entity: &mut A, event: A::Event) {
        match self {
            Callback::Once(handler) => handler(entity, event),
            Callback::Shared(handler) => handler(entity, event),
        }
    }
}

/// Whether an invocation suspends command delivery until acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InvocationKind {
    /// `persist`: no new command until the callback has run.
    Stashing,
    /// `persist_async` / `defer`: commands keep flowing.
    NonStashing,
}

/// One ledger entry.
pub(crate) struct PendingInvocation<A: PersistentEntity> {
    pub(crate) handler: Callback<A>,
    pub(crate) kind: InvocationKind,
}

/// FIFO queue of pending invocations with an incrementally maintained
/// count of `Stashing` entries.
pub(crate) struct InvocationLedger<A: PersistentEntity> {
    entries: VecDeque<PendingInvocation<A>>,
    pending_stashing: usize,
}

impl<A: PersistentEntity> InvocationLedger<A> {
    pub(crate) fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            pending_stashing: 0,
        }
    }

    /// Append an invocation at the tail.
    pub(crate) fn push(&mut self, handler: Callback<A>, kind: InvocationKind) {
        if kind == InvocationKind::Stashing {
            self.pending_stashing += 1;
        }
        self.entries.push_back(PendingInvocation { handler, kind });
    }

    /// Consume the head invocation, if any.
    pub(crate) fn pop(&mut self) -> Option<PendingInvocation<A>> {
        let invocation = self.entries.pop_front()?;
        if invocation.kind == InvocationKind::Stashing {
            self.pending_stashing -= 1;
        }
        Some(invocation)
    }

    /// Number of `Stashing` entries still outstanding.
    pub(crate) fn pending_stashing(&self) -> usize {
        self.pending_stashing
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
