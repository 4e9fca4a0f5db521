use crate::prelude::*;
use crate::universe::{TransformChangeListener, Universe, ViewUpdateListener};

/// One deferred mutation of the universe, recorded inside a transaction and
/// applied by the change application thread once that transaction committed.
pub enum Change {
    /// Creates the cell with its local transform and bounds, unless the id is taken.
    CreateCell { cell: CellDescriptor, identity: Identity },
    RemoveCell { cell: CellId },
    AddRoot { cell: CellId, identity: Identity },
    RemoveRoot { cell: CellId },
    AddChild { parent: CellId, child: CellId, identity: Identity },
    RemoveChild { parent: CellId, child: CellId },
    SetLocalTransform { cell: CellId, transform: CellTransform, identity: Identity },
    SetLocalBounds { cell: CellId, bounds: Bounds },
    Revalidate { cell: CellId, identity: Identity },
    ViewLogin { view: CellId, cell_cache: PersistentRef, identity: Identity },
    ViewRevalidate { view: CellId },
    ViewLogout { view: CellId },
    AddTransformListener { cell: CellId, listener: Arc<dyn TransformChangeListener> },
    RemoveTransformListener { cell: CellId, listener: Arc<dyn TransformChangeListener> },
    AddViewListener { cell: CellId, listener: Arc<dyn ViewUpdateListener> },
    RemoveViewListener { cell: CellId, listener: Arc<dyn ViewUpdateListener> },
    /// Arbitrary work on the universe, run in order with the other changes.
    Run(Box<dyn FnOnce(&mut Universe) -> Result<()> + Send>),
}

impl Change {
    pub fn name(&self) -> &'static str {
        match self {
            Change::CreateCell { .. } => "createCell",
            Change::RemoveCell { .. } => "removeCell",
            Change::AddRoot { .. } => "addRoot",
            Change::RemoveRoot { .. } => "removeRoot",
            Change::AddChild { .. } => "addChild",
            Change::RemoveChild { .. } => "removeChild",
            Change::SetLocalTransform { .. } => "setLocalTransform",
            Change::SetLocalBounds { .. } => "setLocalBounds",
            Change::Revalidate { .. } => "revalidate",
            Change::ViewLogin { .. } => "viewLogin",
            Change::ViewRevalidate { .. } => "viewRevalidate",
            Change::ViewLogout { .. } => "viewLogout",
            Change::AddTransformListener { .. } => "addTransformChangeListener",
            Change::RemoveTransformListener { .. } => "removeTransformChangeListener",
            Change::AddViewListener { .. } => "addViewUpdateListener",
            Change::RemoveViewListener { .. } => "removeViewUpdateListener",
            Change::Run(_) => "run",
        }
    }

    pub fn apply(self, universe: &mut Universe) -> Result<()> {
        match self {
            Change::CreateCell { cell, identity } => {
                universe.create_spatial_cell(&cell, &identity);
            }
            Change::RemoveCell { cell } => universe.remove_cell(cell)?,
            Change::AddRoot { cell, identity } => universe.add_root_spatial_cell(cell, &identity)?,
            Change::RemoveRoot { cell } => universe.remove_root_spatial_cell(cell)?,
            Change::AddChild { parent, child, identity } => universe.add_child(parent, child, &identity)?,
            Change::RemoveChild { parent, child } => universe.remove_child(parent, child)?,
            Change::SetLocalTransform { cell, transform, identity } => {
                universe.set_local_transform(cell, transform, &identity)?
            }
            Change::SetLocalBounds { cell, bounds } => universe.set_local_bounds(cell, bounds)?,
            Change::Revalidate { cell, identity } => universe.revalidate_cell(cell, &identity),
            Change::ViewLogin { view, cell_cache, identity } => universe.view_login(view, cell_cache, identity)?,
            Change::ViewRevalidate { view } => universe.view_revalidate(view),
            Change::ViewLogout { view } => universe.view_logout(view),
            Change::AddTransformListener { cell, listener } => universe.add_transform_change_listener(cell, listener),
            Change::RemoveTransformListener { cell, listener } => {
                universe.remove_transform_change_listener(cell, &listener)
            }
            Change::AddViewListener { cell, listener } => universe.add_view_update_listener(cell, listener),
            Change::RemoveViewListener { cell, listener } => universe.remove_view_update_listener(cell, &listener),
            Change::Run(task) => task(universe)?,
        }
        Ok(())
    }
}

impl std::fmt::Debug for Change {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Change::CreateCell { cell, identity } => write!(f, "createCell({}, {:?}) by {identity}", cell.id, cell.class),
            Change::RemoveCell { cell } => write!(f, "removeCell({cell})"),
            Change::AddRoot { cell, identity } => write!(f, "addRoot({cell}) by {identity}"),
            Change::RemoveRoot { cell } => write!(f, "removeRoot({cell})"),
            Change::AddChild { parent, child, identity } => write!(f, "addChild({parent}, {child}) by {identity}"),
            Change::RemoveChild { parent, child } => write!(f, "removeChild({parent}, {child})"),
            Change::SetLocalTransform { cell, transform, identity } => {
                write!(f, "setLocalTransform({cell}, {:?}) by {identity}", transform.translation)
            }
            Change::SetLocalBounds { cell, bounds } => write!(f, "setLocalBounds({cell}, {bounds:?})"),
            Change::Revalidate { cell, .. } => write!(f, "revalidate({cell})"),
            Change::ViewLogin { view, identity, .. } => write!(f, "viewLogin({view}) by {identity}"),
            Change::ViewRevalidate { view } => write!(f, "viewRevalidate({view})"),
            Change::ViewLogout { view } => write!(f, "viewLogout({view})"),
            Change::AddTransformListener { cell, .. }
            | Change::RemoveTransformListener { cell, .. }
            | Change::AddViewListener { cell, .. }
            | Change::RemoveViewListener { cell, .. } => write!(f, "{}({cell})", self.name()),
            Change::Run(_) => f.write_str("run(..)"),
        }
    }
}
