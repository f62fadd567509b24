//! Affinity mapping: placing a cpuset in the topology tree
//!
//! Placement is split in two steps so the containment walk can be tested
//! without any live runtime:
//! - derive a [`PlacementKey`] from whatever was enumerated
//! - [`insert_at`] resolves the key with [`locate_ancestor`] and inserts

use tracing::warn;

use crate::cpuset::CpuSet;
use crate::object::{ObjectId, TopologyObject};
use crate::topology::{Topology, TopologyError};

/// Result of an ancestor lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Located {
    pub object: ObjectId,
    /// Several siblings contained the cpuset during the walk
    pub ambiguous: bool,
}

/// Where a dynamically discovered entity belongs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementKey {
    /// Under the tightest object containing this cpuset
    Affinity(CpuSet),
    /// Locality unknown, directly under the root
    Root,
}

impl PlacementKey {
    /// Unknown or empty cpusets carry no locality
    pub fn from_cpuset(cpuset: Option<&CpuSet>) -> Self {
        match cpuset {
            Some(set) if !set.is_empty() => Self::Affinity(set.clone()),
            _ => Self::Root,
        }
    }
}

/// Find the deepest hardware object whose cpuset contains `cpuset`.
///
/// Attached objects (coprocessors, processes) are never descended into.
/// When an object has the exact same cpuset it is returned rather than its
/// parent. If several children qualify, the exact match is preferred,
/// otherwise the first one in child order, and the result is flagged
/// ambiguous.
pub fn locate_ancestor(topology: &Topology, cpuset: &CpuSet) -> Result<Located, TopologyError> {
    if cpuset.is_empty() {
        return Err(TopologyError::InvalidAffinity);
    }

    let mut current = topology.root();
    let mut ambiguous = false;

    loop {
        let candidates: Vec<ObjectId> = topology
            .children(current)
            .iter()
            .copied()
            .filter(|&child| {
                let object = &topology[child];
                !object.kind.is_attached() && object.cpuset.is_superset(cpuset)
            })
            .collect();

        let next = match candidates.as_slice() {
            [] => break,
            [only] => *only,
            [first, ..] => {
                warn!(
                    parent = %current,
                    candidates = candidates.len(),
                    cpuset = %cpuset,
                    "Several sibling objects contain the cpuset"
                );
                ambiguous = true;
                candidates
                    .iter()
                    .copied()
                    .find(|&c| &topology[c].cpuset == cpuset)
                    .unwrap_or(*first)
            }
        };
        current = next;
    }

    Ok(Located {
        object: current,
        ambiguous,
    })
}

/// Resolve a placement key to a parent object
pub fn resolve(topology: &Topology, key: &PlacementKey) -> Result<Located, TopologyError> {
    match key {
        PlacementKey::Affinity(cpuset) => locate_ancestor(topology, cpuset),
        PlacementKey::Root => Ok(Located {
            object: topology.root(),
            ambiguous: false,
        }),
    }
}

/// Insert `object` as a child of the object the key resolves to
pub fn insert_at(
    topology: &mut Topology,
    key: &PlacementKey,
    object: TopologyObject,
) -> Result<ObjectId, TopologyError> {
    let parent = resolve(topology, key)?.object;
    topology.insert_child(parent, object)
}
