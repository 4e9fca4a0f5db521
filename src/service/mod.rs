//! Transactional front end of the universe.
//!
//! Mutations never touch the universe directly. They are recorded as
//! [`Change`]s in the calling transaction and handed to the change
//! application thread, as one batch, when that transaction commits. An
//! aborted transaction leaves nothing behind.

use crate::config::Config;
use crate::persistence::CellPersistence;
use crate::prelude::*;
use crate::reload::{ReloadDriver, ReloadSummary};
use crate::txn::{DataStore, Participant, Transaction, TransactionScheduler};
use crate::universe::{TransformChangeListener, Universe, UniverseReader, ViewUpdateListener};
use serde::{Deserialize, Serialize};
use std::any::Any;

mod change;
mod worker;

pub use crate::types::CellDescriptor;
pub use change::Change;
use worker::ChangeApplication;

pub const VERSION_KEY: &str = "spatialsrv.service.version";
const CONTEXT: &str = "spatialsrv.service.UniverseService";

/// Version of what the service keeps in the data store.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceVersion {
    pub major: u32,
    pub minor: u32,
}

impl ServiceVersion {
    pub const CURRENT: Self = Self { major: 1, minor: 0 };
}

impl std::fmt::Display for ServiceVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// What the rest of the server may do to the universe.
///
/// Mutations are deferred until `txn` commits and are applied in the order
/// they were made. The owner of `txn` is the identity listeners get to see.
/// Queries are answered from whatever has been applied so far.
pub trait UniverseManager: Send + Sync {
    fn create_cell(&self, txn: &mut Transaction, cell: &CellDescriptor) -> Result<()>;
    fn remove_cell(&self, txn: &mut Transaction, cell: CellId) -> Result<()>;
    fn add_root_to_universe(&self, txn: &mut Transaction, cell: CellId) -> Result<()>;
    fn remove_root_from_universe(&self, txn: &mut Transaction, cell: CellId) -> Result<()>;
    fn add_child(&self, txn: &mut Transaction, parent: CellId, child: CellId) -> Result<()>;
    fn remove_child(&self, txn: &mut Transaction, parent: CellId, child: CellId) -> Result<()>;
    fn set_local_transform(&self, txn: &mut Transaction, cell: CellId, transform: CellTransform) -> Result<()>;
    fn set_local_bounds(&self, txn: &mut Transaction, cell: CellId, bounds: Bounds) -> Result<()>;
    fn revalidate_cell(&self, txn: &mut Transaction, cell: CellId) -> Result<()>;
    fn view_login(&self, txn: &mut Transaction, view: CellId, cell_cache: PersistentRef) -> Result<()>;
    fn view_revalidate(&self, txn: &mut Transaction, view: CellId) -> Result<()>;
    fn view_logout(&self, txn: &mut Transaction, view: CellId) -> Result<()>;
    fn add_transform_change_listener(
        &self,
        txn: &mut Transaction,
        cell: CellId,
        listener: Arc<dyn TransformChangeListener>,
    ) -> Result<()>;
    fn remove_transform_change_listener(
        &self,
        txn: &mut Transaction,
        cell: CellId,
        listener: Arc<dyn TransformChangeListener>,
    ) -> Result<()>;
    fn add_view_update_listener(&self, txn: &mut Transaction, cell: CellId, listener: Arc<dyn ViewUpdateListener>)
        -> Result<()>;
    fn remove_view_update_listener(
        &self,
        txn: &mut Transaction,
        cell: CellId,
        listener: Arc<dyn ViewUpdateListener>,
    ) -> Result<()>;
    /// Runs `task` on the change application thread once `txn` commits.
    fn schedule_on_transaction(
        &self,
        txn: &mut Transaction,
        task: Box<dyn FnOnce(&mut Universe) -> Result<()> + Send>,
    ) -> Result<()>;

    /// `None` while the cell is unknown or not part of the world yet.
    fn get_world_transform(&self, cell: CellId) -> Option<CellTransform>;
    fn get_world_bounds(&self, cell: CellId) -> Option<Bounds>;
}

pub struct UniverseService {
    config: Config,
    scheduler: Arc<TransactionScheduler>,
    store: DataStore,
    changes: Arc<ChangeApplication>,
    reader: UniverseReader,
}

impl UniverseService {
    /// Checks the stored service version and starts the change application thread.
    pub fn new(config: Config, scheduler: Arc<TransactionScheduler>, store: DataStore) -> Result<Self> {
        let system = Identity::system();
        scheduler.run_task(&system, "VersionCheck", |txn| check_version(&store, txn))?;
        let universe = Universe::new(config.view_radius);
        let reader = universe.reader();
        let changes = Arc::new(ChangeApplication::start(universe)?);
        log::info!("universe service {} started", ServiceVersion::CURRENT);
        Ok(Self { config, scheduler, store, changes, reader })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<TransactionScheduler> {
        &self.scheduler
    }

    pub fn store(&self) -> &DataStore {
        &self.store
    }

    pub fn reader(&self) -> UniverseReader {
        self.reader.clone()
    }

    /// Rebuilds the universe from `persistence`, always from a fresh cursor.
    pub fn ready(&self, persistence: &dyn CellPersistence) -> Result<ReloadSummary> {
        ReloadDriver::new(self, persistence).run()
    }

    /// Blocks until every change committed before the call has been applied.
    pub fn wait_for_changes(&self) {
        self.changes.wait_for_changes();
    }

    pub fn pending_changes(&self) -> usize {
        self.changes.pending()
    }

    /// Applies what is already queued and stops the change application thread.
    pub fn shutdown(&self) {
        log::info!("universe service shutting down with {} pending changes", self.changes.pending());
        self.changes.shutdown();
    }

    /// Adds `change` to the batch `txn` will hand over on commit.
    pub fn schedule_change(&self, txn: &mut Transaction, change: Change) -> Result<()> {
        let changes = self.changes.clone();
        let ctx = txn.join(CONTEXT, move || UniverseContext { changes, batch: vec![] })?;
        ctx.batch.push(change);
        Ok(())
    }

    fn query<T>(&self, op: &str, cell: CellId, value: Option<T>) -> Option<T> {
        if value.is_none() {
            if self.reader.contains(cell) {
                log::warn!("{op}: {cell} is not in the world yet");
            } else {
                log::warn!("{op}: unknown {cell}");
            }
        }
        value
    }
}

impl std::fmt::Debug for UniverseService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniverseService")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("pending", &self.changes.pending())
            .finish()
    }
}

fn check_version(store: &DataStore, txn: &mut Transaction) -> Result<()> {
    match store.get_binding::<ServiceVersion>(txn, VERSION_KEY)? {
        None => store.set_binding(txn, VERSION_KEY, &ServiceVersion::CURRENT),
        Some(stored) if stored == ServiceVersion::CURRENT => Ok(()),
        Some(stored) => {
            log::error!("stored universe version {stored} does not match {}", ServiceVersion::CURRENT);
            Err(Error::VersionMismatch {
                stored: stored.to_string(),
                current: ServiceVersion::CURRENT.to_string(),
            })
        }
    }
}

impl UniverseManager for UniverseService {
    fn create_cell(&self, txn: &mut Transaction, cell: &CellDescriptor) -> Result<()> {
        let identity = txn.owner().clone();
        self.schedule_change(txn, Change::CreateCell { cell: cell.clone(), identity })
    }

    fn remove_cell(&self, txn: &mut Transaction, cell: CellId) -> Result<()> {
        self.schedule_change(txn, Change::RemoveCell { cell })
    }

    fn add_root_to_universe(&self, txn: &mut Transaction, cell: CellId) -> Result<()> {
        let identity = txn.owner().clone();
        self.schedule_change(txn, Change::AddRoot { cell, identity })
    }

    fn remove_root_from_universe(&self, txn: &mut Transaction, cell: CellId) -> Result<()> {
        self.schedule_change(txn, Change::RemoveRoot { cell })
    }

    fn add_child(&self, txn: &mut Transaction, parent: CellId, child: CellId) -> Result<()> {
        let identity = txn.owner().clone();
        self.schedule_change(txn, Change::AddChild { parent, child, identity })
    }

    fn remove_child(&self, txn: &mut Transaction, parent: CellId, child: CellId) -> Result<()> {
        self.schedule_change(txn, Change::RemoveChild { parent, child })
    }

    fn set_local_transform(&self, txn: &mut Transaction, cell: CellId, transform: CellTransform) -> Result<()> {
        let identity = txn.owner().clone();
        self.schedule_change(txn, Change::SetLocalTransform { cell, transform, identity })
    }

    fn set_local_bounds(&self, txn: &mut Transaction, cell: CellId, bounds: Bounds) -> Result<()> {
        self.schedule_change(txn, Change::SetLocalBounds { cell, bounds })
    }

    fn revalidate_cell(&self, txn: &mut Transaction, cell: CellId) -> Result<()> {
        let identity = txn.owner().clone();
        self.schedule_change(txn, Change::Revalidate { cell, identity })
    }

    fn view_login(&self, txn: &mut Transaction, view: CellId, cell_cache: PersistentRef) -> Result<()> {
        let identity = txn.owner().clone();
        self.schedule_change(txn, Change::ViewLogin { view, cell_cache, identity })
    }

    fn view_revalidate(&self, txn: &mut Transaction, view: CellId) -> Result<()> {
        self.schedule_change(txn, Change::ViewRevalidate { view })
    }

    fn view_logout(&self, txn: &mut Transaction, view: CellId) -> Result<()> {
        self.schedule_change(txn, Change::ViewLogout { view })
    }

    fn add_transform_change_listener(
        &self,
        txn: &mut Transaction,
        cell: CellId,
        listener: Arc<dyn TransformChangeListener>,
    ) -> Result<()> {
        self.schedule_change(txn, Change::AddTransformListener { cell, listener })
    }

    fn remove_transform_change_listener(
        &self,
        txn: &mut Transaction,
        cell: CellId,
        listener: Arc<dyn TransformChangeListener>,
    ) -> Result<()> {
        self.schedule_change(txn, Change::RemoveTransformListener { cell, listener })
    }

    fn add_view_update_listener(
        &self,
        txn: &mut Transaction,
        cell: CellId,
        listener: Arc<dyn ViewUpdateListener>,
    ) -> Result<()> {
        self.schedule_change(txn, Change::AddViewListener { cell, listener })
    }

    fn remove_view_update_listener(
        &self,
        txn: &mut Transaction,
        cell: CellId,
        listener: Arc<dyn ViewUpdateListener>,
    ) -> Result<()> {
        self.schedule_change(txn, Change::RemoveViewListener { cell, listener })
    }

    fn schedule_on_transaction(
        &self,
        txn: &mut Transaction,
        task: Box<dyn FnOnce(&mut Universe) -> Result<()> + Send>,
    ) -> Result<()> {
        self.schedule_change(txn, Change::Run(task))
    }

    fn get_world_transform(&self, cell: CellId) -> Option<CellTransform> {
        self.query("getWorldTransform", cell, self.reader.world_transform(cell))
    }

    fn get_world_bounds(&self, cell: CellId) -> Option<Bounds> {
        self.query("getWorldBounds", cell, self.reader.world_bounds(cell))
    }
}

/// The outbox of one transaction.
struct UniverseContext {
    changes: Arc<ChangeApplication>,
    batch: Vec<Change>,
}

impl Participant for UniverseContext {
    fn commit(&mut self) {
        self.changes.submit(std::mem::take(&mut self.batch));
    }

    fn abort(&mut self, retryable: bool) {
        if !self.batch.is_empty() {
            log::debug!("discarding {} changes (retryable: {retryable})", self.batch.len());
        }
        self.batch.clear();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
