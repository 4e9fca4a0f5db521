pub mod config;
pub mod error;
pub mod persistence;
pub mod reload;
pub mod service;
pub mod txn;
pub mod types;
pub mod universe;

pub use config::Config;
pub use error::{Error, Result};
pub use service::{UniverseManager, UniverseService};
pub use universe::{Universe, UniverseReader};

mod prelude {
    pub(crate) use crate::error::{Error, Result};
    pub(crate) use crate::types::*;
    pub(crate) use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
    pub(crate) use std::sync::Arc;
}

/// How far can a single writer thread go?
///
/// Every structural change funnels through one thread, and a cascade holds the
/// write lock of its root for as long as it takes to walk the subtree. That is
/// fine while roots stay small. A root with tens of thousands of descendants
/// would stall readers of that root for the whole walk.
///
/// Options, roughly in order of effort:
///   - cascade in slices, publishing a new world snapshot per slice
///     (breaks the "all or nothing" view readers rely on)
///   - double buffer each graph's world values and swap under the lock
///   - shard roots across several writers, each owning a disjoint set of graphs
///     (edges between roots owned by different writers need a handoff protocol)
///
/// None of this is needed for the worlds loaded today.
#[allow(dead_code, non_camel_case_types)]
struct single_writer;
