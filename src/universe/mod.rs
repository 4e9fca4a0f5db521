//! The in-memory forest of spatial cells.
//!
//! Every cell lives in exactly one [`graph::Graph`], and each graph has its own
//! reader/writer lock: the cells of one root share a lock, unrelated roots do
//! not. A cell's lock is found by looking the cell up in the index, never by a
//! reference kept on the node, so it follows the cell when edges move it into
//! another graph.
//!
//! [`Universe`] is the single writer. It is owned by the change application
//! thread and mutates graphs under their write locks. [`UniverseReader`] is the
//! cheap, cloneable handle everyone else uses to query world space.

use crate::prelude::*;
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};

mod graph;
mod view;

use graph::{Graph, GraphRef, SpatialCell};
use view::{Outbox, ViewCache};

pub use view::CacheUpdate;

/// Told whenever the world transform of a cell changes.
///
/// Runs on the change application thread while the cell's graph is write
/// locked: implementations must return quickly and must not call back into the
/// universe or its readers for the same root.
pub trait TransformChangeListener: Send + Sync {
    fn transform_changed(&self, cell: CellId, local: &CellTransform, world: &CellTransform, identity: &Identity);
}

/// Told whenever a view that can see the cell moves.
///
/// Runs on the change application thread under the read lock of the cell's graph.
pub trait ViewUpdateListener: Send + Sync {
    fn view_transform_changed(&self, cell: CellId, view: CellId, view_world: &CellTransform);
}

/// How many times a reader chases a cell that moved to another graph while it waited.
const RESOLVE_ATTEMPTS: usize = 4;

struct Shared {
    index: RwLock<HashMap<CellId, GraphRef>>,
    roots: RwLock<BTreeSet<CellId>>,
    outboxes: Mutex<HashMap<CellId, Outbox>>,
}

impl Shared {
    fn graph(&self, id: CellId) -> Option<GraphRef> {
        self.index.read().get(&id).cloned()
    }

    fn read_cell<T>(&self, id: CellId, f: impl FnOnce(&SpatialCell) -> T) -> Option<T> {
        self.read_graph(id, |graph| graph.get(id).map(f)).flatten()
    }

    /// Runs `f` on the graph holding `id`, under that graph's read lock.
    fn read_graph<T>(&self, id: CellId, f: impl FnOnce(&Graph) -> T) -> Option<T> {
        for _ in 0..RESOLVE_ATTEMPTS {
            let graph = self.graph(id)?;
            let guard = graph.read();
            if guard.get(id).is_some() {
                return Some(f(&guard));
            }
            // the writer regrafted the cell between the lookup and the lock
        }
        None
    }
}

pub struct Universe {
    shared: Arc<Shared>,
    view_radius: f32,
    views: BTreeMap<CellId, ViewCache>,
}

impl Universe {
    pub fn new(view_radius: f32) -> Self {
        Self {
            shared: Arc::new(Shared {
                index: RwLock::new(HashMap::new()),
                roots: RwLock::new(BTreeSet::new()),
                outboxes: Mutex::new(HashMap::new()),
            }),
            view_radius,
            views: BTreeMap::new(),
        }
    }

    pub fn reader(&self) -> UniverseReader {
        UniverseReader { shared: self.shared.clone() }
    }

    fn graph_of(&self, id: CellId) -> Result<GraphRef> {
        self.shared.graph(id).ok_or(Error::CellNotFound(id))
    }

    /// Registers a new cell with its local transform and bounds. It is not
    /// attached to anything and has no world values yet. An id that already
    /// exists is left exactly as it is.
    pub fn create_spatial_cell(&mut self, cell: &CellDescriptor, identity: &Identity) -> bool {
        let mut index = self.shared.index.write();
        if index.contains_key(&cell.id) {
            log::warn!("{} created twice by {identity}, keeping the existing cell", cell.id);
            return false;
        }
        log::debug!("createSpatialCell {} ({:?}, {:?}) by {identity}", cell.id, cell.persistent, cell.class);
        let mut node = SpatialCell::new(cell.id, cell.persistent, cell.class);
        node.local_transform = cell.local_transform;
        node.local_bounds = cell.local_bounds;
        index.insert(cell.id, Graph::single(node).into_ref());
        true
    }

    pub fn set_local_bounds(&mut self, id: CellId, bounds: Bounds) -> Result<()> {
        let graph = self.graph_of(id)?;
        let root = {
            let mut g = graph.write();
            g.get_mut(id).ok_or(Error::CellNotFound(id))?.local_bounds = bounds;
            if g.live {
                g.merge_upwards(id);
                self.push_to_viewers(g.top, CacheUpdate::Revalidated(id));
            }
            g.live.then_some(g.top)
        };
        self.after_cascade(root, &[]);
        Ok(())
    }

    pub fn set_local_transform(&mut self, id: CellId, transform: CellTransform, identity: &Identity) -> Result<()> {
        let graph = self.graph_of(id)?;
        let (root, views) = {
            let mut g = graph.write();
            g.get_mut(id).ok_or(Error::CellNotFound(id))?.local_transform = transform;
            let mut moved = vec![];
            g.recompute(id, &mut moved);
            self.announce_moves(&g, &moved, identity);
            (g.live.then_some(g.top), self.views_among(moved))
        };
        self.after_cascade(root, &views);
        Ok(())
    }

    /// Makes the graph topped by `id` part of the world. A root's world transform is its local transform.
    pub fn add_root_spatial_cell(&mut self, id: CellId, identity: &Identity) -> Result<()> {
        let graph = self.graph_of(id)?;
        let views = {
            let mut g = graph.write();
            if g.top != id {
                let parent = g.get(id).and_then(|c| c.parent).unwrap_or(g.top);
                return Err(Error::MultipleParents { child: id, parent });
            }
            if g.live {
                log::debug!("{id} is already a root");
                return Ok(());
            }
            log::debug!("addRootSpatialCell {id}");
            g.live = true;
            self.shared.roots.write().insert(id);
            let mut moved = vec![];
            g.recompute(id, &mut moved);
            self.announce_moves(&g, &moved, identity);
            self.views_among(g.ids())
        };
        self.after_cascade(Some(id), &views);
        Ok(())
    }

    pub fn remove_root_spatial_cell(&mut self, id: CellId) -> Result<()> {
        let graph = self.graph_of(id)?;
        let views = {
            let mut g = graph.write();
            if g.top != id || !g.live {
                log::warn!("removeRootSpatialCell: {id} is not a root");
                return Ok(());
            }
            log::debug!("removeRootSpatialCell {id}");
            g.live = false;
            g.clear_world(id);
            self.shared.roots.write().remove(&id);
            self.views_among(g.ids())
        };
        for cache in self.views.values_mut() {
            cache.set_root_visible(id, false);
        }
        self.after_cascade(None, &views);
        Ok(())
    }

    pub fn add_child(&mut self, parent: CellId, child: CellId, identity: &Identity) -> Result<()> {
        let parent_graph = self.graph_of(parent)?;
        let child_graph = self.graph_of(child)?;
        if Arc::ptr_eq(&parent_graph, &child_graph) {
            let g = parent_graph.read();
            return Err(match g.get(child).and_then(|c| c.parent) {
                Some(existing) => Error::MultipleParents { child, parent: existing },
                None => Error::Cycle { parent, child },
            });
        }

        let (root, members, was_root) = {
            let mut pg = parent_graph.write();
            let mut cg = child_graph.write();
            if let Some(existing) = cg.get(child).and_then(|c| c.parent) {
                return Err(Error::MultipleParents { child, parent: existing });
            }
            let was_root = cg.live;
            let members: Vec<CellId> = cg.ids().collect();
            let subtree = Graph {
                top: child,
                live: false,
                cells: std::mem::take(&mut cg.cells),
            };
            pg.graft(parent, subtree);
            {
                let mut index = self.shared.index.write();
                for member in &members {
                    index.insert(*member, parent_graph.clone());
                }
            }
            if was_root {
                self.shared.roots.write().remove(&child);
            }
            drop(cg);

            if pg.live {
                self.push_to_viewers(pg.top, CacheUpdate::ChildAdded { parent, child });
                let mut moved = vec![];
                pg.recompute(child, &mut moved);
                self.announce_moves(&pg, &moved, identity);
            } else {
                pg.clear_world(child);
            }
            (pg.live.then_some(pg.top), members, was_root)
        };
        if was_root {
            for cache in self.views.values_mut() {
                cache.set_root_visible(child, false);
            }
        }
        let views = self.views_among(members);
        self.after_cascade(root, &views);
        Ok(())
    }

    /// Detaches `child` and its descendants. They keep existing, outside of the world.
    pub fn remove_child(&mut self, parent: CellId, child: CellId) -> Result<()> {
        let graph = self.graph_of(parent)?;
        let (root, members) = {
            let mut g = graph.write();
            if g.get(child).and_then(|c| c.parent) != Some(parent) {
                return Err(Error::NotAChild { parent, child });
            }
            log::debug!("removeChild {parent} {child}");
            let detached = g.split_off(child);
            g.merge_upwards(parent);
            if g.live {
                self.push_to_viewers(g.top, CacheUpdate::ChildRemoved { parent, child });
            }
            let members: Vec<CellId> = detached.ids().collect();
            let detached = detached.into_ref();
            let mut index = self.shared.index.write();
            for member in &members {
                index.insert(*member, detached.clone());
            }
            (g.live.then_some(g.top), members)
        };
        let views = self.views_among(members);
        self.after_cascade(root, &views);
        Ok(())
    }

    /// Removes the cell from the universe. Its children are detached, not destroyed.
    pub fn remove_cell(&mut self, id: CellId) -> Result<()> {
        let graph = self.graph_of(id)?;
        let (parent, seen_as) = {
            let g = graph.read();
            (g.get(id).and_then(|c| c.parent), g.live.then_some(g.top))
        };
        log::debug!("removeCell {id}");
        if let Some(parent) = parent {
            self.remove_child(parent, id)?;
        }
        if let Some(root) = seen_as {
            for cache in self.views.values().filter(|c| c.sees(root)) {
                cache.push(CacheUpdate::Destroyed(id));
            }
        }
        if self.views.contains_key(&id) {
            self.view_logout(id);
        }

        let graph = self.graph_of(id)?;
        let mut detached_members = vec![];
        {
            let mut g = graph.write();
            let children = g.get(id).map(|c| c.children.clone()).unwrap_or_default();
            let mut index = self.shared.index.write();
            for child in children {
                let detached = g.split_off(child);
                let members: Vec<CellId> = detached.ids().collect();
                let detached = detached.into_ref();
                for member in &members {
                    index.insert(*member, detached.clone());
                }
                detached_members.extend(members);
            }
            g.cells.remove(&id);
            index.remove(&id);
        }
        if self.shared.roots.write().remove(&id) {
            for cache in self.views.values_mut() {
                cache.set_root_visible(id, false);
            }
        }
        let views = self.views_among(detached_members);
        self.after_cascade(None, &views);
        Ok(())
    }

    /// Recomputes the cell's world values and asks viewers to look at it again.
    pub fn revalidate_cell(&mut self, id: CellId, identity: &Identity) {
        let Ok(graph) = self.graph_of(id) else {
            log::warn!("attempt to revalidate non-existent {id}");
            return;
        };
        let (root, views) = {
            let mut g = graph.write();
            let mut moved = vec![];
            g.recompute(id, &mut moved);
            self.announce_moves(&g, &moved, identity);
            if g.live {
                self.push_to_viewers(g.top, CacheUpdate::Revalidated(id));
            }
            (g.live.then_some(g.top), self.views_among(moved))
        };
        self.after_cascade(root, &views);
    }

    /// Starts tracking what the view cell `view` can see, on behalf of the cell cache `cell_cache`.
    pub fn view_login(&mut self, view: CellId, cell_cache: PersistentRef, identity: Identity) -> Result<()> {
        let class = self.shared.read_cell(view, |c| c.class).ok_or(Error::CellNotFound(view))?;
        if class != CellClass::View {
            log::warn!("viewLogin on {view}, which is a {class:?} cell");
        }
        if self.views.contains_key(&view) {
            log::debug!("{view} logged in again, dropping its previous cache");
            self.view_logout(view);
        }
        log::debug!("viewLogin {view} cache {cell_cache:?} for {identity}");
        let outbox = Outbox::default();
        self.shared.outboxes.lock().insert(view, outbox.clone());
        self.views.insert(view, ViewCache::new(view, cell_cache, identity, outbox));
        self.refresh_view(view);
        Ok(())
    }

    pub fn view_revalidate(&mut self, view: CellId) {
        // warm restarts can see views they never saw log in
        if let Some(cache) = self.views.get(&view) {
            cache.push(CacheUpdate::RevalidateAll);
        }
    }

    pub fn view_logout(&mut self, view: CellId) {
        match self.views.remove(&view) {
            Some(mut cache) => {
                log::debug!("viewLogout {view}");
                cache.clear();
                self.shared.outboxes.lock().remove(&view);
            }
            None => log::debug!("viewLogout for unknown view {view}"),
        }
    }

    pub fn add_transform_change_listener(&mut self, id: CellId, listener: Arc<dyn TransformChangeListener>) {
        self.with_cell(id, "addTransformChangeListener", |cell| cell.transform_listeners.push(listener));
    }

    pub fn remove_transform_change_listener(&mut self, id: CellId, listener: &Arc<dyn TransformChangeListener>) {
        self.with_cell(id, "removeTransformChangeListener", |cell| {
            cell.transform_listeners.retain(|l| !same_listener(l, listener))
        });
    }

    pub fn add_view_update_listener(&mut self, id: CellId, listener: Arc<dyn ViewUpdateListener>) {
        self.with_cell(id, "addViewUpdateListener", |cell| cell.view_listeners.push(listener));
    }

    pub fn remove_view_update_listener(&mut self, id: CellId, listener: &Arc<dyn ViewUpdateListener>) {
        self.with_cell(id, "removeViewUpdateListener", |cell| {
            cell.view_listeners.retain(|l| !same_listener(l, listener))
        });
    }

    fn with_cell(&self, id: CellId, op: &str, f: impl FnOnce(&mut SpatialCell)) {
        let Some(graph) = self.shared.graph(id) else {
            log::warn!("{op}: {id} not found");
            return;
        };
        let mut g = graph.write();
        match g.get_mut(id) {
            Some(cell) => f(cell),
            None => log::warn!("{op}: {id} not found"),
        }
    }

    /// Transform listeners and viewers of the graph hear about every cell in `moved`.
    fn announce_moves(&self, g: &Graph, moved: &[CellId], identity: &Identity) {
        for id in moved {
            let Some(cell) = g.get(*id) else { continue };
            let Some(world) = cell.world_transform else { continue };
            for listener in &cell.transform_listeners {
                let call = || listener.transform_changed(*id, &cell.local_transform, &world, identity);
                if catch_unwind(AssertUnwindSafe(call)).is_err() {
                    log::warn!("transform listener of {id} panicked");
                }
            }
            self.push_to_viewers(g.top, CacheUpdate::Moved { cell: *id, world });
        }
    }

    fn push_to_viewers(&self, root: CellId, update: CacheUpdate) {
        for cache in self.views.values().filter(|c| c.sees(root)) {
            cache.push(update.clone());
        }
    }

    fn views_among(&self, ids: impl IntoIterator<Item = CellId>) -> Vec<CellId> {
        ids.into_iter().filter(|id| self.views.contains_key(id)).collect()
    }

    /// Visibility follow-up once no write lock is held: `root` may have grown,
    /// shrunk or moved, and the `views` may have moved.
    fn after_cascade(&mut self, root: Option<CellId>, views: &[CellId]) {
        if let Some(root) = root {
            self.recheck_root(root);
        }
        for view in views {
            self.refresh_view(*view);
        }
    }

    fn recheck_root(&mut self, root: CellId) {
        let views: Vec<CellId> = self.views.keys().copied().collect();
        for view in views {
            let visible = self
                .view_position(view)
                .map_or(false, |center| self.root_visible_from(root, center));
            if let Some(cache) = self.views.get_mut(&view) {
                cache.set_root_visible(root, visible);
            }
        }
    }

    fn refresh_view(&mut self, view: CellId) {
        let visible: BTreeSet<CellId> = match self.view_position(view) {
            Some(center) => {
                let roots: Vec<CellId> = self.shared.roots.read().iter().copied().collect();
                roots.into_iter().filter(|r| self.root_visible_from(*r, center)).collect()
            }
            None => BTreeSet::new(),
        };
        let Some(cache) = self.views.get_mut(&view) else { return };
        cache.set_visible(visible);
        self.notify_view_listeners(view);
    }

    fn notify_view_listeners(&self, view: CellId) {
        let Some(cache) = self.views.get(&view) else { return };
        let Some(view_world) = self.shared.read_cell(view, |c| c.world_transform).flatten() else { return };
        for root in cache.visible() {
            self.shared.read_graph(root, |g| {
                for cell in g.cells.values() {
                    for listener in &cell.view_listeners {
                        let call = || listener.view_transform_changed(cell.id, view, &view_world);
                        if catch_unwind(AssertUnwindSafe(call)).is_err() {
                            log::warn!("view update listener of {} panicked", cell.id);
                        }
                    }
                }
            });
        }
    }

    fn view_position(&self, view: CellId) -> Option<glam::Vec3> {
        self.shared
            .read_cell(view, |c| c.world_transform.map(|t| t.translation))
            .flatten()
    }

    fn root_visible_from(&self, root: CellId, center: glam::Vec3) -> bool {
        let radius = self.view_radius;
        self.shared
            .read_graph(root, |g| {
                g.live && g.top == root && g.get(root).and_then(|c| c.world_bounds).map_or(false, |b| b.intersects_sphere(center, radius))
            })
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for Universe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Universe")
            .field("cells", &self.shared.index.read().len())
            .field("roots", &*self.shared.roots.read())
            .field("views", &self.views)
            .finish()
    }
}

fn same_listener<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Thread-safe, read-only access to the universe.
///
/// Every query takes the read lock of the graph holding the cell, clones what
/// it needs and lets go. Nothing is recomputed on the read path: a cell that
/// is not part of the world yet simply has no world values.
#[derive(Clone)]
pub struct UniverseReader {
    shared: Arc<Shared>,
}

impl UniverseReader {
    pub fn contains(&self, id: CellId) -> bool {
        self.shared.index.read().contains_key(&id)
    }

    pub fn cell_count(&self) -> usize {
        self.shared.index.read().len()
    }

    pub fn roots(&self) -> Vec<CellId> {
        self.shared.roots.read().iter().copied().collect()
    }

    pub fn world_transform(&self, id: CellId) -> Option<CellTransform> {
        self.shared.read_cell(id, |c| c.world_transform).flatten()
    }

    pub fn world_bounds(&self, id: CellId) -> Option<Bounds> {
        self.shared.read_cell(id, |c| c.world_bounds).flatten()
    }

    pub fn local_transform(&self, id: CellId) -> Option<CellTransform> {
        self.shared.read_cell(id, |c| c.local_transform)
    }

    pub fn local_bounds(&self, id: CellId) -> Option<Bounds> {
        self.shared.read_cell(id, |c| c.local_bounds)
    }

    pub fn persistent_ref(&self, id: CellId) -> Option<PersistentRef> {
        self.shared.read_cell(id, |c| c.persistent)
    }

    pub fn parent(&self, id: CellId) -> Option<CellId> {
        self.shared.read_cell(id, |c| c.parent).flatten()
    }

    pub fn children(&self, id: CellId) -> Vec<CellId> {
        self.shared.read_cell(id, |c| c.children.clone()).unwrap_or_default()
    }

    /// The root whose graph holds `id`, if that graph is part of the world.
    pub fn root_of(&self, id: CellId) -> Option<CellId> {
        self.shared.read_graph(id, |g| g.live.then_some(g.top)).flatten()
    }

    /// World transforms of every cell sharing a graph with `id`, read under a
    /// single lock, parents before children.
    pub fn graph_snapshot(&self, id: CellId) -> Vec<(CellId, Option<CellTransform>)> {
        self.shared
            .read_graph(id, |g| {
                g.subtree(g.top)
                    .into_iter()
                    .map(|member| (member, g.get(member).and_then(|c| c.world_transform)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_logged_in(&self, view: CellId) -> bool {
        self.shared.outboxes.lock().contains_key(&view)
    }

    /// Drains what the view's cell cache has not been told yet.
    pub fn take_cache_updates(&self, view: CellId) -> Vec<CacheUpdate> {
        let outbox = self.shared.outboxes.lock().get(&view).cloned();
        outbox.map(|o| o.lock().drain(..).collect()).unwrap_or_default()
    }
}

impl std::fmt::Debug for UniverseReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniverseReader").field("cells", &self.cell_count()).finish()
    }
}
