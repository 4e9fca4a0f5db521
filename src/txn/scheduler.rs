use super::Transaction;
use crate::prelude::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Runs transactional tasks, retrying the ones that lost a conflict.
///
/// Commits are serialised through one lock, so the order in which
/// transactions commit is a total order every participant agrees on.
#[derive(Debug)]
pub struct TransactionScheduler {
    next_txn: AtomicU64,
    commit_lock: Mutex<()>,
    max_retries: u32,
}

impl TransactionScheduler {
    pub fn new(max_retries: u32) -> Self {
        Self {
            next_txn: AtomicU64::new(1),
            commit_lock: Mutex::new(()),
            max_retries: max_retries.max(1),
        }
    }

    /// Runs `task` inside a fresh transaction owned by `owner`.
    ///
    /// The task may run several times: it is rerun whenever it, or the commit
    /// that follows it, fails with a retryable error. Non-retryable errors
    /// abort the transaction and are returned as is.
    pub fn run_task<T>(
        &self,
        owner: &Identity,
        task_type: &str,
        mut task: impl FnMut(&mut Transaction) -> Result<T>,
    ) -> Result<T> {
        for attempt in 1..=self.max_retries {
            let mut txn = Transaction::new(self.next_txn.fetch_add(1, Ordering::Relaxed), owner.clone());
            let outcome = match task(&mut txn) {
                Ok(value) => {
                    let _commit = self.commit_lock.lock();
                    txn.commit().map(|()| value)
                }
                Err(e) => {
                    txn.abort(e.is_retryable());
                    Err(e)
                }
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    log::debug!("{task_type} attempt {attempt} for {owner} failed, retrying: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        log::warn!("{task_type} for {owner} gave up after {} attempts", self.max_retries);
        Err(Error::RetriesExhausted(self.max_retries))
    }
}
