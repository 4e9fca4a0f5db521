use crate::prelude::*;
use crate::service::{CellDescriptor, UniverseManager};
use crate::txn::{DataStore, Transaction};
use serde::{Deserialize, Serialize};

pub const CELL_PREFIX: &str = "spatialsrv.cell.";
pub const ROOTS_KEY: &str = "spatialsrv.cells.roots";

/// Where the universe is rebuilt from at startup.
pub trait CellPersistence: Send + Sync {
    /// Every cell that should be a root of the universe.
    fn root_cell_ids(&self, txn: &mut Transaction) -> Result<BTreeSet<CellId>>;

    /// Recreates the cell `id`, and whatever hangs below it, through `manager`.
    /// `Ok(false)` means there was nothing to reload.
    fn reload_cell(&self, txn: &mut Transaction, id: CellId, manager: &dyn UniverseManager) -> Result<bool>;
}

/// A cell as it is kept in the data store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
    pub id: CellId,
    pub persistent: PersistentRef,
    #[serde(default)]
    pub class: CellClass,
    pub transform: CellTransform,
    pub bounds: Bounds,
    #[serde(default)]
    pub children: Vec<CellId>,
}

impl CellRecord {
    pub fn new(id: CellId, transform: CellTransform, bounds: Bounds) -> Self {
        Self {
            id,
            persistent: PersistentRef(id.0),
            class: CellClass::Basic,
            transform,
            bounds,
            children: vec![],
        }
    }

    pub fn descriptor(&self) -> CellDescriptor {
        CellDescriptor {
            id: self.id,
            persistent: self.persistent,
            class: self.class,
            local_transform: self.transform,
            local_bounds: self.bounds,
        }
    }
}

/// [`CellPersistence`] backed by [`CellRecord`]s in the data store.
#[derive(Debug, Clone)]
pub struct StoredCells {
    store: DataStore,
}

fn cell_key(id: CellId) -> String {
    format!("{CELL_PREFIX}{}", id.0)
}

impl StoredCells {
    pub fn new(store: DataStore) -> Self {
        Self { store }
    }

    pub fn save_cell(&self, txn: &mut Transaction, record: &CellRecord) -> Result<()> {
        self.store.set_binding(txn, &cell_key(record.id), record)
    }

    pub fn load_cell(&self, txn: &mut Transaction, id: CellId) -> Result<Option<CellRecord>> {
        self.store.get_binding(txn, &cell_key(id))
    }

    pub fn forget_cell(&self, txn: &mut Transaction, id: CellId) -> Result<bool> {
        self.store.remove_binding(txn, &cell_key(id))
    }

    pub fn save_root(&self, txn: &mut Transaction, id: CellId) -> Result<()> {
        let mut roots = self.root_cell_ids(txn)?;
        if roots.insert(id) {
            self.store.set_binding(txn, ROOTS_KEY, &roots)?;
        }
        Ok(())
    }

    pub fn forget_root(&self, txn: &mut Transaction, id: CellId) -> Result<()> {
        let mut roots = self.root_cell_ids(txn)?;
        if roots.remove(&id) {
            self.store.set_binding(txn, ROOTS_KEY, &roots)?;
        }
        Ok(())
    }

    fn reload_tree(
        &self,
        txn: &mut Transaction,
        record: CellRecord,
        manager: &dyn UniverseManager,
        seen: &mut HashSet<CellId>,
    ) -> Result<()> {
        manager.create_cell(txn, &record.descriptor())?;
        for child in record.children {
            if !seen.insert(child) {
                log::warn!("{child} is stored below {} more than once, skipping it", record.id);
                continue;
            }
            match self.load_cell(txn, child)? {
                Some(child_record) => {
                    self.reload_tree(txn, child_record, manager, seen)?;
                    manager.add_child(txn, record.id, child)?;
                }
                None => log::warn!("{} lists missing child {child}", record.id),
            }
        }
        Ok(())
    }
}

impl CellPersistence for StoredCells {
    fn root_cell_ids(&self, txn: &mut Transaction) -> Result<BTreeSet<CellId>> {
        Ok(self.store.get_binding(txn, ROOTS_KEY)?.unwrap_or_default())
    }

    fn reload_cell(&self, txn: &mut Transaction, id: CellId, manager: &dyn UniverseManager) -> Result<bool> {
        let Some(record) = self.load_cell(txn, id)? else {
            log::warn!("no stored record for root {id}");
            return Ok(false);
        };
        let mut seen = HashSet::from([id]);
        self.reload_tree(txn, record, manager, &mut seen)?;
        manager.add_root_to_universe(txn, id)?;
        log::trace!("reloaded {id} with {} descendants", seen.len() - 1);
        Ok(true)
    }
}
