use crate::prelude::*;
use parking_lot::Mutex;
use std::collections::VecDeque;

pub(crate) type Outbox = Arc<Mutex<VecDeque<CacheUpdate>>>;

/// What a logged in view needs to hear about, in the order it happened.
///
/// The universe only queues these; pushing them on to the client's cell cache
/// is up to whoever drains them.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheUpdate {
    /// A root graph came within range of the view.
    RootAdded(CellId),
    RootRemoved(CellId),
    ChildAdded { parent: CellId, child: CellId },
    ChildRemoved { parent: CellId, child: CellId },
    Moved { cell: CellId, world: CellTransform },
    /// The cell's properties changed and clients may want to look at it again.
    Revalidated(CellId),
    Destroyed(CellId),
    /// The user behind the view changed; everything should be re-evaluated.
    RevalidateAll,
}

/// Server side state of one logged in view.
pub(crate) struct ViewCache {
    pub(crate) view: CellId,
    pub(crate) cell_cache: PersistentRef,
    pub(crate) identity: Identity,
    visible: BTreeSet<CellId>,
    outbox: Outbox,
}

impl ViewCache {
    pub(crate) fn new(view: CellId, cell_cache: PersistentRef, identity: Identity, outbox: Outbox) -> Self {
        Self {
            view,
            cell_cache,
            identity,
            visible: BTreeSet::new(),
            outbox,
        }
    }

    pub(crate) fn sees(&self, root: CellId) -> bool {
        self.visible.contains(&root)
    }

    pub(crate) fn visible(&self) -> impl Iterator<Item = CellId> + '_ {
        self.visible.iter().copied()
    }

    pub(crate) fn push(&self, update: CacheUpdate) {
        self.outbox.lock().push_back(update);
    }

    pub(crate) fn set_visible(&mut self, now: BTreeSet<CellId>) {
        for gone in self.visible.difference(&now) {
            self.push(CacheUpdate::RootRemoved(*gone));
        }
        for new in now.difference(&self.visible) {
            self.push(CacheUpdate::RootAdded(*new));
        }
        self.visible = now;
    }

    pub(crate) fn set_root_visible(&mut self, root: CellId, visible: bool) {
        if visible && self.visible.insert(root) {
            self.push(CacheUpdate::RootAdded(root));
        } else if !visible && self.visible.remove(&root) {
            self.push(CacheUpdate::RootRemoved(root));
        }
    }

    pub(crate) fn clear(&mut self) {
        self.visible.clear();
        self.outbox.lock().clear();
    }
}

impl std::fmt::Debug for ViewCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewCache")
            .field("view", &self.view)
            .field("cell_cache", &self.cell_cache)
            .field("identity", &self.identity)
            .field("visible", &self.visible)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> (ViewCache, Outbox) {
        let outbox = Outbox::default();
        (ViewCache::new(CellId(1), PersistentRef(10), Identity::new("alice"), outbox.clone()), outbox)
    }

    #[test]
    fn visibility_diffs_become_updates() {
        let (mut cache, outbox) = cache();
        cache.set_visible([CellId(2), CellId(3)].into_iter().collect());
        cache.set_visible([CellId(3), CellId(4)].into_iter().collect());
        let updates: Vec<_> = outbox.lock().drain(..).collect();
        assert_eq!(
            updates,
            vec![
                CacheUpdate::RootAdded(CellId(2)),
                CacheUpdate::RootAdded(CellId(3)),
                CacheUpdate::RootRemoved(CellId(2)),
                CacheUpdate::RootAdded(CellId(4)),
            ]
        );
        assert!(cache.sees(CellId(4)));
        assert!(!cache.sees(CellId(2)));
    }

    #[test]
    fn single_root_toggles_only_report_changes() {
        let (mut cache, outbox) = cache();
        cache.set_root_visible(CellId(5), true);
        cache.set_root_visible(CellId(5), true);
        cache.set_root_visible(CellId(5), false);
        cache.set_root_visible(CellId(5), false);
        assert_eq!(outbox.lock().len(), 2);
        cache.clear();
        assert!(outbox.lock().is_empty());
    }
}
