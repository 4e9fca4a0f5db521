//! Rebuilds the universe from persisted cells at startup.
//!
//! Roots are reloaded a few at a time, one transaction per batch, with a
//! cursor kept in the data store between batches. The universe lives in memory
//! only, so a new process always starts from a fresh cursor. Within one process
//! a reload that was cut short can continue after the last root it finished.

use crate::persistence::CellPersistence;
use crate::prelude::*;
use crate::service::UniverseService;
use serde::{Deserialize, Serialize};
use std::ops::Bound;

pub const ROOTS_ITERATOR: &str = "spatialsrv.service.ROOTS_ITERATOR";

/// Position of an unfinished reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReloadState {
    /// The last root that was reloaded; the next batch starts after it.
    pub after: Option<CellId>,
    /// How many roots there were when the reload started.
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReloadSummary {
    pub added: usize,
    pub errors: usize,
}

impl std::ops::AddAssign for ReloadSummary {
    fn add_assign(&mut self, other: Self) {
        self.added += other.added;
        self.errors += other.errors;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReloadStep {
    pub summary: ReloadSummary,
    pub finished: bool,
}

pub struct ReloadDriver<'a> {
    service: &'a UniverseService,
    persistence: &'a dyn CellPersistence,
    batch: usize,
}

impl<'a> ReloadDriver<'a> {
    pub fn new(service: &'a UniverseService, persistence: &'a dyn CellPersistence) -> Self {
        Self {
            service,
            persistence,
            batch: service.config().cell_load_count,
        }
    }

    /// Lists the persisted roots and stores a fresh cursor in front of them.
    pub fn start(&self) -> Result<ReloadState> {
        let store = self.service.store();
        self.service.scheduler().run_task(&Identity::system(), "GetRootCells", |txn| {
            let roots = self.persistence.root_cell_ids(txn)?;
            let state = ReloadState { after: None, total: roots.len() };
            store.set_binding(txn, ROOTS_ITERATOR, &state)?;
            Ok(state)
        })
    }

    /// Picks up the stored cursor, or starts a new reload if there is none.
    pub fn resume(&self) -> Result<ReloadState> {
        let store = self.service.store();
        let existing = self.service.scheduler().run_task(&Identity::system(), "ResumeReload", |txn| {
            store.get_binding::<ReloadState>(txn, ROOTS_ITERATOR)
        })?;
        match existing {
            Some(state) => {
                log::info!("resuming reload of {} roots after {:?}", state.total, state.after);
                Ok(state)
            }
            None => self.start(),
        }
    }

    /// Reloads the next batch of roots in one transaction.
    pub fn step(&self) -> Result<ReloadStep> {
        let store = self.service.store();
        self.service.scheduler().run_task(&Identity::system(), "ReloadCells", |txn| {
            let Some(mut state) = store.get_binding::<ReloadState>(txn, ROOTS_ITERATOR)? else {
                return Ok(ReloadStep { finished: true, ..Default::default() });
            };
            let roots = self.persistence.root_cell_ids(txn)?;
            let lower = state.after.map_or(Bound::Unbounded, Bound::Excluded);
            let mut remaining = roots.range((lower, Bound::Unbounded)).copied();
            let batch: Vec<CellId> = remaining.by_ref().take(self.batch).collect();

            let mut summary = ReloadSummary::default();
            for id in &batch {
                match self.persistence.reload_cell(txn, *id, self.service) {
                    Ok(true) => summary.added += 1,
                    Ok(false) => summary.errors += 1,
                    Err(e) if e.is_retryable() => return Err(e),
                    Err(e) => {
                        log::warn!("failed to reload {id}: {e}");
                        summary.errors += 1;
                    }
                }
            }

            let finished = remaining.next().is_none();
            if finished {
                store.remove_binding(txn, ROOTS_ITERATOR)?;
            } else {
                state.after = batch.last().copied().or(state.after);
                store.set_binding(txn, ROOTS_ITERATOR, &state)?;
            }
            Ok(ReloadStep { summary, finished })
        })
    }

    /// Reloads every persisted root, ignoring any cursor left by an earlier process.
    pub fn run(&self) -> Result<ReloadSummary> {
        let state = self.start()?;
        self.drain(state)
    }

    /// Continues the stored cursor until the reload is done.
    pub fn finish(&self) -> Result<ReloadSummary> {
        let state = self.resume()?;
        self.drain(state)
    }

    fn drain(&self, state: ReloadState) -> Result<ReloadSummary> {
        let mut summary = ReloadSummary::default();
        loop {
            let step = self.step()?;
            summary += step.summary;
            if step.finished {
                break;
            }
        }
        log::info!(
            "reloaded {} of {} root cells, {} errors",
            summary.added,
            state.total,
            summary.errors
        );
        Ok(summary)
    }
}
