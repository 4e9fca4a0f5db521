use super::{TransformChangeListener, ViewUpdateListener};
use crate::prelude::*;
use parking_lot::RwLock;

pub(crate) type GraphRef = Arc<RwLock<Graph>>;

/// A node of the spatial graph.
pub(crate) struct SpatialCell {
    pub(crate) id: CellId,
    pub(crate) persistent: PersistentRef,
    pub(crate) class: CellClass,
    pub(crate) local_transform: CellTransform,
    pub(crate) local_bounds: Bounds,
    /// `None` until the cell is first placed in a live graph.
    pub(crate) world_transform: Option<CellTransform>,
    pub(crate) world_bounds: Option<Bounds>,
    pub(crate) parent: Option<CellId>,
    pub(crate) children: Vec<CellId>,
    pub(crate) transform_listeners: Vec<Arc<dyn TransformChangeListener>>,
    pub(crate) view_listeners: Vec<Arc<dyn ViewUpdateListener>>,
}

impl SpatialCell {
    pub(crate) fn new(id: CellId, persistent: PersistentRef, class: CellClass) -> Self {
        Self {
            id,
            persistent,
            class,
            local_transform: CellTransform::IDENTITY,
            local_bounds: Bounds::sphere(glam::Vec3::ZERO, 0.0),
            world_transform: None,
            world_bounds: None,
            parent: None,
            children: vec![],
            transform_listeners: vec![],
            view_listeners: vec![],
        }
    }
}

/// One tree of cells, guarded by a single lock.
///
/// `top` is the only cell without a parent. While the graph is live `top` is a
/// root of the universe and every cell in it has world values; a graph that is
/// not live holds cells that were created or detached but are not in the world.
pub(crate) struct Graph {
    pub(crate) top: CellId,
    pub(crate) live: bool,
    pub(crate) cells: HashMap<CellId, SpatialCell>,
}

impl Graph {
    pub(crate) fn single(cell: SpatialCell) -> Self {
        let top = cell.id;
        let mut cells = HashMap::new();
        cells.insert(top, cell);
        Self { top, live: false, cells }
    }

    pub(crate) fn into_ref(self) -> GraphRef {
        Arc::new(RwLock::new(self))
    }

    pub(crate) fn get(&self, id: CellId) -> Option<&SpatialCell> {
        self.cells.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: CellId) -> Option<&mut SpatialCell> {
        self.cells.get_mut(&id)
    }

    /// `id` followed by all of its descendants, parents before children.
    pub(crate) fn subtree(&self, id: CellId) -> Vec<CellId> {
        let mut order = vec![];
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(cell) = self.cells.get(&next) {
                order.push(next);
                stack.extend(cell.children.iter().rev());
            }
        }
        order
    }

    /// Recomputes the world values of `id` and everything below it, then
    /// refreshes the merged bounds of its ancestors. Cells whose world
    /// transform changed are appended to `moved`.
    pub(crate) fn recompute(&mut self, id: CellId, moved: &mut Vec<CellId>) {
        if !self.live {
            return;
        }
        let parent = match self.cells.get(&id) {
            Some(cell) => cell.parent,
            None => return,
        };
        let parent_world = parent.and_then(|p| self.cells.get(&p)).and_then(|p| p.world_transform);
        self.update_world(id, parent_world, moved);
        if let Some(parent) = parent {
            self.merge_upwards(parent);
        }
    }

    fn update_world(&mut self, id: CellId, parent_world: Option<CellTransform>, moved: &mut Vec<CellId>) {
        let Some(cell) = self.cells.get_mut(&id) else { return };
        let world = match parent_world {
            Some(parent_world) => parent_world.mul(&cell.local_transform),
            None => cell.local_transform,
        };
        let changed = cell
            .world_transform
            .map_or(true, |old| !old.approx_eq(&world, CellTransform::EPSILON));
        cell.world_transform = Some(world);
        if changed {
            moved.push(id);
        }
        let children = cell.children.clone();
        for child in children {
            self.update_world(child, Some(world), moved);
        }
        self.merge_bounds(id);
    }

    /// World bounds of `id`: its own local bounds in world space, grown to
    /// enclose the world bounds of its children.
    fn merge_bounds(&mut self, id: CellId) {
        let Some(cell) = self.cells.get(&id) else { return };
        let Some(world) = cell.world_transform else { return };
        let mut bounds = cell.local_bounds.transformed(&world);
        for child in &cell.children {
            if let Some(child_bounds) = self.cells.get(child).and_then(|c| c.world_bounds) {
                bounds = bounds.merge(&child_bounds);
            }
        }
        if let Some(cell) = self.cells.get_mut(&id) {
            cell.world_bounds = Some(bounds);
        }
    }

    pub(crate) fn merge_upwards(&mut self, from: CellId) {
        let mut next = Some(from);
        while let Some(id) = next {
            self.merge_bounds(id);
            next = self.cells.get(&id).and_then(|c| c.parent);
        }
    }

    pub(crate) fn clear_world(&mut self, id: CellId) {
        for id in self.subtree(id) {
            if let Some(cell) = self.cells.get_mut(&id) {
                cell.world_transform = None;
                cell.world_bounds = None;
            }
        }
    }

    /// Moves the subtree under `id` out into a graph of its own, which is not live.
    pub(crate) fn split_off(&mut self, id: CellId) -> Graph {
        let members = self.subtree(id);
        let mut cells = HashMap::with_capacity(members.len());
        for member in members {
            if let Some(cell) = self.cells.remove(&member) {
                cells.insert(member, cell);
            }
        }
        if let Some(top) = cells.get_mut(&id) {
            if let Some(parent) = top.parent.take() {
                if let Some(parent) = self.cells.get_mut(&parent) {
                    parent.children.retain(|c| *c != id);
                }
            }
        }
        let mut graph = Graph { top: id, live: false, cells };
        graph.clear_world(id);
        graph
    }

    /// Takes every cell of `other` in, hanging its top under `parent`.
    pub(crate) fn graft(&mut self, parent: CellId, mut other: Graph) {
        let child = other.top;
        if let Some(top) = other.cells.get_mut(&child) {
            top.parent = Some(parent);
        }
        self.cells.extend(other.cells.drain());
        if let Some(parent) = self.cells.get_mut(&parent) {
            parent.children.push(child);
        }
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = CellId> + '_ {
        self.cells.keys().copied()
    }
}
