//! Tokio host loop that owns an entity cell and drives it from a
//! mailbox.
//!
//! The loop runs as a task and sequentially processes messages from an
//! `mpsc` channel, which is what gives the cell its one-message-at-a-time
//! scheduling guarantee. Journal and snapshot replies are folded into
//! the same mailbox so the cell sees a single ordered stream.
//!
//! Public API: [`EntityHandle`] (cloneable handle) and [`spawn_entity`]
//! (factory that builds the first incarnation and starts the loop).
//! Supervision is built in: restartable faults rebuild the cell from
//! the factory under a fresh incarnation tag and re-arm recovery;
//! kill faults stop the loop.

use std::collections::VecDeque;

use tokio::sync::mpsc;

use crate::cell::{
    CellSettings, Collaborators, Delivery, EntityCell, JournalTx, Message, Recover, SnapshotTx,
};
use crate::entity::PersistentEntity;
use crate::envelope::{ReplyTo, SenderRef};
use crate::error::{EntityGone, Fault, SpawnError};

/// Handle to a running persistent entity.
///
/// Lightweight and cloneable. Dropping every handle closes the mailbox
/// and stops the entity after it has drained what it already received.
pub struct EntityHandle<A: PersistentEntity> {
    sender: mpsc::UnboundedSender<Message<A>>,
}

// Manual `Clone` because `A` itself need not be `Clone` -- only the
// channel handle is cloned.
impl<A: PersistentEntity> Clone for EntityHandle<A> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<A: PersistentEntity> EntityHandle<A> {
    /// Send a command with no reply address.
    ///
    /// # Errors
    ///
    /// [`EntityGone`] if the entity's loop has exited.
    pub fn tell(&self, command: A::Command) -> Result<(), EntityGone> {
        self.sender
            .send(Message::Command(Delivery::of(command)))
            .map_err(|_| EntityGone)
    }

    /// Send a command, directing replies to `reply_to`.
    ///
    /// # Errors
    ///
    /// [`EntityGone`] if the entity's loop has exited.
    pub fn tell_from(
        &self,
        command: A::Command,
        reply_to: ReplyTo<A::Reply>,
    ) -> Result<(), EntityGone> {
        self.sender
            .send(Message::Command(Delivery {
                command,
                sender: SenderRef::new(reply_to),
            }))
            .map_err(|_| EntityGone)
    }

    /// Ask the entity to run recovery. Only meaningful while the entity
    /// is awaiting one (a `pre_start` that returned `None`, or a
    /// handled recovery failure).
    ///
    /// # Errors
    ///
    /// [`EntityGone`] if the entity's loop has exited.
    pub fn recover(&self, recover: Recover) -> Result<(), EntityGone> {
        self.sender
            .send(Message::Recover(recover))
            .map_err(|_| EntityGone)
    }

    /// Whether the entity's loop is still running.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Spawn a persistent entity.
///
/// Builds the first incarnation from `factory`, wires its reply
/// channels back into the mailbox, and starts the host loop on a tokio
/// task. The factory is kept for restarts: every restartable fault
/// produces a fresh entity value that is then rebuilt from the journal.
///
/// # Errors
///
/// Returns [`SpawnError::InvalidPersistenceId`] if the entity reports
/// an empty persistence id.
pub fn spawn_entity<A, F>(
    factory: F,
    journal: JournalTx<A>,
    snapshot_store: SnapshotTx<A>,
    settings: CellSettings,
) -> Result<EntityHandle<A>, SpawnError>
where
    A: PersistentEntity,
    F: Fn() -> A + Send + 'static,
{
    let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
    let (journal_reply_tx, mut journal_reply_rx) = mpsc::unbounded_channel();
    let (snapshot_reply_tx, mut snapshot_reply_rx) = mpsc::unbounded_channel();

    // Forwarders hold only weak mailbox senders, so the mailbox closes
    // (and the entity stops) once every user handle is dropped.
    let forward = mailbox_tx.downgrade();
    tokio::spawn(async move {
        while let Some(reply) = journal_reply_rx.recv().await {
            let Some(mailbox) = forward.upgrade() else { break };
            if mailbox.send(Message::Journal(reply)).is_err() {
                break;
            }
        }
    });
    let forward = mailbox_tx.downgrade();
    tokio::spawn(async move {
        while let Some(reply) = snapshot_reply_rx.recv().await {
            let Some(mailbox) = forward.upgrade() else { break };
            if mailbox.send(Message::Snapshot(reply)).is_err() {
                break;
            }
        }
    });

    let collaborators = Collaborators {
        journal,
        snapshot_store,
        journal_reply_to: journal_reply_tx,
        snapshot_reply_to: snapshot_reply_tx,
    };
    let cell = EntityCell::new(factory(), collaborators.clone(), settings.clone())?;
    tokio::spawn(run_entity(cell, factory, collaborators, settings, mailbox_rx));

    Ok(EntityHandle { sender: mailbox_tx })
}

/// The host loop: one message at a time, restart on restartable faults,
/// stop on kill faults or mailbox close.
async fn run_entity<A, F>(
    mut cell: EntityCell<A>,
    factory: F,
    collaborators: Collaborators<A>,
    settings: CellSettings,
    mut mailbox: mpsc::UnboundedReceiver<Message<A>>,
) where
    A: PersistentEntity,
    F: Fn() -> A + Send + 'static,
{
    // Messages to process ahead of the mailbox: stash redelivery and
    // the re-armed `Recover` after a restart.
    let mut requeue: VecDeque<Message<A>> = VecDeque::new();

    if let Err(fault) = cell.start() {
        tracing::error!(error = %fault, "persistent entity failed to start");
        cell.stop();
        return;
    }

    loop {
        let message = match requeue.pop_front() {
            Some(message) => message,
            None => match mailbox.recv().await {
                Some(message) => message,
                // Every handle dropped: orderly stop.
                None => {
                    cell.stop();
                    return;
                }
            },
        };

        if let Err(fault) = cell.handle(message) {
            match fault {
                Fault::Killed(cause) => {
                    tracing::error!(error = %cause, "persistent entity stopped");
                    cell.stop();
                    return;
                }
                restartable => {
                    tracing::warn!(error = %restartable, "restarting persistent entity");
                    let restart = cell.prepare_restart();
                    requeue.extend(restart.requeue);
                    // Message-induced restart: replay up to what this
                    // incarnation had observed.
                    requeue.push_back(Message::Recover(Recover::up_to(
                        restart.last_sequence_nr,
                    )));
                    cell = match EntityCell::new(factory(), collaborators.clone(), settings.clone())
                    {
                        Ok(cell) => cell,
                        Err(error) => {
                            tracing::error!(
                                error = %error,
                                "persistent entity could not be rebuilt"
                            );
                            return;
                        }
                    };
                }
            }
        }
    }
}
