//! Object filtering applied after loading and before attachment

use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

use crate::object::{ObjectId, ObjectKind};
use crate::topology::Topology;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("Objects of type {0} cannot be ignored")]
    NotIgnorable(ObjectKind),
}

/// How caches are filtered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheFilter {
    #[default]
    Keep,
    /// Drop caches without hierarchical impact
    Useless,
    /// Drop every cache
    All,
}

/// Filtering requested on the command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterOptions {
    pub ignore: Vec<ObjectKind>,
    pub caches: CacheFilter,
    /// Drop every object without hierarchical impact
    pub merge: bool,
}

impl FilterOptions {
    pub fn is_empty(&self) -> bool {
        self.ignore.is_empty() && self.caches == CacheFilter::Keep && !self.merge
    }
}

/// An object has no hierarchical impact when it has a single hardware child
/// or spans exactly the same CPUs as its parent.
pub fn has_hierarchical_impact(topology: &Topology, id: ObjectId) -> bool {
    let hardware_children = topology
        .children(id)
        .iter()
        .filter(|&&c| !topology[c].kind.is_attached())
        .count();
    if hardware_children == 1 {
        return false;
    }
    match topology.parent(id) {
        Some(parent) => topology[parent].cpuset != topology[id].cpuset,
        None => true,
    }
}

/// Apply `options` to the topology. Object ids are invalidated.
pub fn apply(topology: &mut Topology, options: &FilterOptions) -> Result<(), FilterError> {
    for &kind in &options.ignore {
        if matches!(kind, ObjectKind::Machine | ObjectKind::Pu) {
            return Err(FilterError::NotIgnorable(kind));
        }
    }
    if options.is_empty() {
        return Ok(());
    }

    let ignored: HashSet<ObjectKind> = options.ignore.iter().copied().collect();
    let mut removed: HashSet<ObjectId> = HashSet::new();

    for id in topology.depth_first() {
        let object = &topology[id];
        if id == topology.root() || object.kind == ObjectKind::Pu || object.kind.is_attached() {
            continue;
        }
        let remove = ignored.contains(&object.kind)
            || (object.kind.is_cache() && options.caches == CacheFilter::All)
            || (object.kind.is_cache()
                && options.caches == CacheFilter::Useless
                && !has_hierarchical_impact(topology, id))
            || (options.merge && !has_hierarchical_impact(topology, id));
        if remove {
            removed.insert(id);
        }
    }

    debug!(count = removed.len(), "Removing filtered objects");
    topology.retain(|id, _| !removed.contains(&id));
    Ok(())
}
