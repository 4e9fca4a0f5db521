//! A small transactional task framework.
//!
//! A [`Transaction`] collects participants (one per service that was touched
//! while the task ran). When the task returns `Ok` the scheduler prepares every
//! participant and, if all agree, commits them; otherwise every participant is
//! told to abort and nothing it buffered becomes visible.

use crate::prelude::*;
use std::any::Any;

mod scheduler;
mod store;

pub use scheduler::TransactionScheduler;
pub use store::DataStore;

/// Per-transaction state a service keeps until the transaction ends.
pub trait Participant: Any + Send {
    /// Last chance to refuse the commit. Runs under the scheduler's commit lock.
    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }
    fn commit(&mut self);
    fn abort(&mut self, retryable: bool);
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

pub struct Transaction {
    id: u64,
    owner: Identity,
    state: TxnState,
    participants: Vec<(&'static str, Box<dyn Participant>)>,
}

impl Transaction {
    pub(crate) fn new(id: u64, owner: Identity) -> Self {
        Self {
            id,
            owner,
            state: TxnState::Active,
            participants: vec![],
        }
    }
    pub fn id(&self) -> u64 {
        self.id
    }
    pub fn owner(&self) -> &Identity {
        &self.owner
    }
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// The participant registered under `name`, created on first use.
    pub fn join<P: Participant>(&mut self, name: &'static str, create: impl FnOnce() -> P) -> Result<&mut P> {
        if self.state != TxnState::Active {
            return Err(Error::TransactionClosed(self.id));
        }
        let idx = match self.participants.iter().position(|(n, _)| *n == name) {
            Some(idx) => idx,
            None => {
                self.participants.push((name, Box::new(create())));
                self.participants.len() - 1
            }
        };
        self.participants[idx]
            .1
            .as_any_mut()
            .downcast_mut::<P>()
            .ok_or_else(|| Error::aborted(format!("participant {name} joined with a different type")))
    }

    pub(crate) fn commit(&mut self) -> Result<()> {
        if self.state != TxnState::Active {
            return Err(Error::TransactionClosed(self.id));
        }
        let mut refused = None;
        for (name, participant) in self.participants.iter_mut() {
            if let Err(e) = participant.prepare() {
                log::debug!("txn {} refused by {name}: {e}", self.id);
                refused = Some(e);
                break;
            }
        }
        if let Some(e) = refused {
            self.abort(e.is_retryable());
            return Err(e);
        }
        for (_, participant) in self.participants.iter_mut() {
            participant.commit();
        }
        self.state = TxnState::Committed;
        Ok(())
    }

    pub(crate) fn abort(&mut self, retryable: bool) {
        if self.state != TxnState::Active {
            return;
        }
        for (_, participant) in self.participants.iter_mut() {
            participant.abort(retryable);
        }
        self.state = TxnState::Aborted;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // a task that panicked never reached commit
        self.abort(false);
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("state", &self.state)
            .field("participants", &self.participants.iter().map(|(n, _)| *n).collect::<Vec<_>>())
            .finish()
    }
}
