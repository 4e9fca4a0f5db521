use super::change::Change;
use crate::prelude::*;
use crate::universe::Universe;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;

enum Job {
    /// Everything one transaction scheduled, in the order it was scheduled.
    Batch(Vec<Change>),
    Barrier(mpsc::Sender<()>),
}

/// The thread that owns the [`Universe`] and applies committed changes to it, one batch at a time.
pub(crate) struct ChangeApplication {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
}

impl ChangeApplication {
    pub(crate) fn start(universe: Universe) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_pending = pending.clone();
        let worker = std::thread::Builder::new()
            .name("ChangeApplication".into())
            .spawn(move || run(universe, receiver, worker_pending))?;
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            pending,
        })
    }

    /// Queues a committed batch. Never blocks: the queue is unbounded.
    pub(crate) fn submit(&self, batch: Vec<Change>) {
        if batch.is_empty() {
            return;
        }
        let len = batch.len();
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            log::warn!("dropping {len} changes committed after shutdown");
            return;
        };
        let depth = self.pending.fetch_add(len, Ordering::SeqCst) + len;
        if sender.send(Job::Batch(batch)).is_err() {
            self.pending.fetch_sub(len, Ordering::SeqCst);
            log::error!("change application thread is gone, dropping {len} changes");
            return;
        }
        log::debug!("queued {len} changes, {depth} pending");
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Blocks until every batch submitted before the call has been applied.
    pub(crate) fn wait_for_changes(&self) {
        let (done, wait) = mpsc::channel();
        {
            let sender = self.sender.lock();
            let Some(sender) = sender.as_ref() else { return };
            if sender.send(Job::Barrier(done)).is_err() {
                return;
            }
        }
        // a dead worker drops the barrier, which ends the wait as well
        let _ = wait.recv();
    }

    /// Lets the worker drain its queue, then joins it.
    pub(crate) fn shutdown(&self) {
        drop(self.sender.lock().take());
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                log::error!("change application thread panicked");
            }
        }
    }
}

impl Drop for ChangeApplication {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(mut universe: Universe, receiver: mpsc::Receiver<Job>, pending: Arc<AtomicUsize>) {
    log::info!("change application started");
    while let Ok(job) = receiver.recv() {
        match job {
            Job::Batch(batch) => {
                let len = batch.len();
                for change in batch {
                    apply(&mut universe, change);
                }
                pending.fetch_sub(len, Ordering::SeqCst);
            }
            Job::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    log::info!("change application stopped with {universe:?}");
}

fn apply(universe: &mut Universe, change: Change) {
    log::trace!("applying {change:?}");
    let name = change.name();
    match catch_unwind(AssertUnwindSafe(|| change.apply(universe))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("{name} failed: {e}"),
        Err(_) => log::warn!("{name} panicked, continuing with the next change"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn batches_apply_in_order_and_failures_are_skipped() {
        let universe = Universe::new(10.0);
        let reader = universe.reader();
        let worker = ChangeApplication::start(universe).unwrap();
        let cell = CellId(1);
        worker.submit(vec![
            Change::CreateCell { cell: CellDescriptor::new(cell, CellClass::Basic), identity: Identity::system() },
            Change::RemoveChild { parent: CellId(7), child: cell },
            Change::Run(Box::new(|_: &mut Universe| -> Result<()> { panic!("boom") })),
            Change::AddRoot { cell, identity: Identity::system() },
        ]);
        worker.submit(vec![Change::SetLocalTransform {
            cell,
            transform: CellTransform::from_translation(Vec3::X),
            identity: Identity::system(),
        }]);
        worker.wait_for_changes();
        assert_eq!(worker.pending(), 0);
        assert_eq!(reader.roots(), vec![cell]);
        assert_eq!(reader.world_transform(cell).unwrap().translation, Vec3::X);
    }

    #[test]
    fn shutdown_drains_the_queue() {
        let universe = Universe::new(10.0);
        let reader = universe.reader();
        let worker = ChangeApplication::start(universe).unwrap();
        worker.submit(
            (1..=50)
                .map(|i| Change::CreateCell {
                    cell: CellDescriptor::new(CellId(i), CellClass::Basic),
                    identity: Identity::system(),
                })
                .collect(),
        );
        worker.shutdown();
        assert_eq!(reader.cell_count(), 50);
        worker.submit(vec![Change::RemoveCell { cell: CellId(1) }]);
        worker.wait_for_changes();
        assert_eq!(reader.cell_count(), 50);
    }
}
