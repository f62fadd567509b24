//! Topology arena
//!
//! The topology is a rooted tree of [`TopologyObject`]s stored in a flat
//! arena and addressed by [`ObjectId`]. The root (always a `Machine`) owns
//! the usable cpuset of the whole machine; every hardware child's cpuset is
//! a subset of its parent's.

use std::collections::HashMap;
use std::ops::Index;
use thiserror::Error;
use tracing::debug;

use crate::cpuset::CpuSet;
use crate::object::{ObjectId, ObjectKind, TopologyObject};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Affinity set is empty")]
    InvalidAffinity,
    #[error("No object {0} in topology")]
    InvalidObject(ObjectId),
    #[error("Failed to allocate topology object")]
    AllocationFailed,
    #[error("Topology invariant violated: {0}")]
    Invariant(String),
    #[error("Restricting to {0} leaves no processing unit")]
    EmptyRestriction(CpuSet),
}

/// Hardware topology tree
#[derive(Debug, Clone)]
pub struct Topology {
    objects: Vec<TopologyObject>,
    /// All CPUs of the machine, including offline or disallowed ones
    complete_cpuset: CpuSet,
    /// Per-tag counters used to name attached objects
    sequences: HashMap<String, usize>,
    /// Maximum number of objects, unbounded when `None`
    object_limit: Option<usize>,
}

impl Topology {
    /// Create a topology containing only `root`
    pub fn new(mut root: TopologyObject) -> Self {
        root.parent = None;
        root.children.clear();
        let complete_cpuset = root.cpuset.clone();
        Self {
            objects: vec![root],
            complete_cpuset,
            sequences: HashMap::new(),
            object_limit: None,
        }
    }

    /// Cap the number of objects; insertions past the cap fail with
    /// `AllocationFailed`
    pub fn set_object_limit(&mut self, limit: Option<usize>) {
        self.object_limit = limit;
    }

    pub fn root(&self) -> ObjectId {
        ObjectId(0)
    }

    /// Usable cpuset of the whole machine
    pub fn cpuset(&self) -> &CpuSet {
        &self.objects[0].cpuset
    }

    pub fn complete_cpuset(&self) -> &CpuSet {
        &self.complete_cpuset
    }

    pub fn set_complete_cpuset(&mut self, cpuset: CpuSet) {
        self.complete_cpuset = cpuset.union(self.cpuset());
    }

    /// True when no CPU was left out of the tree (offline, disallowed, restricted)
    pub fn is_complete(&self) -> bool {
        &self.complete_cpuset == self.cpuset()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn object(&self, id: ObjectId) -> Option<&TopologyObject> {
        self.objects.get(id.0)
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut TopologyObject> {
        self.objects.get_mut(id.0)
    }

    /// Look up an info attribute of an object
    pub fn info(&self, id: ObjectId, key: &str) -> Option<&str> {
        self.object(id).and_then(|o| o.info(key))
    }

    pub fn children(&self, id: ObjectId) -> &[ObjectId] {
        self.object(id).map(|o| o.children.as_slice()).unwrap_or_default()
    }

    pub fn parent(&self, id: ObjectId) -> Option<ObjectId> {
        self.object(id).and_then(|o| o.parent)
    }

    /// Ancestors of `id`, nearest first
    pub fn ancestors(&self, id: ObjectId) -> impl Iterator<Item = ObjectId> + '_ {
        std::iter::successors(self.parent(id), move |&current| self.parent(current))
    }

    pub fn depth(&self, id: ObjectId) -> usize {
        self.ancestors(id).count()
    }

    /// Nearest ancestor describing hardware rather than an attached entity
    pub fn nearest_hardware_ancestor(&self, id: ObjectId) -> Option<ObjectId> {
        self.ancestors(id).find(|&a| !self[a].kind.is_attached())
    }

    /// All objects in depth-first pre-order
    pub fn depth_first(&self) -> Vec<ObjectId> {
        let mut order = Vec::with_capacity(self.objects.len());
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self[id].children.iter().rev().copied());
        }
        order
    }

    pub fn objects_of_kind(&self, kind: ObjectKind) -> Vec<ObjectId> {
        self.depth_first()
            .into_iter()
            .filter(|&id| self[id].kind == kind)
            .collect()
    }

    /// Per-kind logical indices, numbered in depth-first order
    pub fn logical_indices(&self) -> HashMap<ObjectId, usize> {
        let mut counters: HashMap<ObjectKind, usize> = HashMap::new();
        self.depth_first()
            .into_iter()
            .map(|id| {
                let counter = counters.entry(self[id].kind).or_insert(0);
                let index = *counter;
                *counter += 1;
                (id, index)
            })
            .collect()
    }

    /// Append `object` as the last child of `parent`
    pub fn insert_child(
        &mut self,
        parent: ObjectId,
        mut object: TopologyObject,
    ) -> Result<ObjectId, TopologyError> {
        if parent.0 >= self.objects.len() {
            return Err(TopologyError::InvalidObject(parent));
        }
        if self.object_limit.is_some_and(|limit| self.objects.len() >= limit) {
            return Err(TopologyError::AllocationFailed);
        }
        self.objects
            .try_reserve(1)
            .map_err(|_| TopologyError::AllocationFailed)?;

        let id = ObjectId(self.objects.len());
        object.parent = Some(parent);
        object.children.clear();
        self.objects.push(object);
        self.objects[parent.0].children.push(id);
        Ok(id)
    }

    /// Order every child list by first CPU. Ties keep their insertion order.
    pub fn sort_children_by_cpuset(&mut self) {
        for index in 0..self.objects.len() {
            let mut children = std::mem::take(&mut self.objects[index].children);
            children.sort_by_key(|child| self.objects[child.0].cpuset.first());
            self.objects[index].children = children;
        }
    }

    /// Next value of the naming sequence for `tag`, starting at zero
    pub fn next_sequence(&mut self, tag: &str) -> usize {
        let counter = self.sequences.entry(tag.to_string()).or_insert(0);
        let value = *counter;
        *counter += 1;
        value
    }

    /// Remove every non-root object for which `keep` returns false.
    ///
    /// Children of removed objects are reattached to the nearest kept
    /// ancestor, preserving order. Object ids are invalidated.
    pub fn retain<F>(&mut self, keep: F)
    where
        F: Fn(ObjectId, &TopologyObject) -> bool,
    {
        let mut rebuilt: Vec<TopologyObject> = Vec::with_capacity(self.objects.len());
        let mut stack: Vec<(usize, Option<usize>)> = vec![(0, None)];
        let mut removed = 0usize;

        while let Some((old, new_parent)) = stack.pop() {
            let object = &self.objects[old];
            let next_parent = if new_parent.is_none() || keep(ObjectId(old), object) {
                let new_id = rebuilt.len();
                let mut copy = object.clone();
                copy.parent = new_parent.map(ObjectId);
                copy.children.clear();
                rebuilt.push(copy);
                if let Some(p) = new_parent {
                    rebuilt[p].children.push(ObjectId(new_id));
                }
                Some(new_id)
            } else {
                removed += 1;
                new_parent
            };
            for child in object.children.iter().rev() {
                stack.push((child.0, next_parent));
            }
        }

        debug!(removed, remaining = rebuilt.len(), "Filtered topology objects");
        self.objects = rebuilt;
    }

    /// Restrict the topology to `cpuset`: cpusets are intersected and objects
    /// left without any CPU are removed. The complete cpuset is preserved.
    pub fn restrict(&mut self, cpuset: &CpuSet) -> Result<(), TopologyError> {
        let remaining = self.cpuset().intersection(cpuset);
        if remaining.is_empty() {
            return Err(TopologyError::EmptyRestriction(cpuset.clone()));
        }
        for object in &mut self.objects {
            object.cpuset = object.cpuset.intersection(cpuset);
        }
        self.retain(|_, o| !o.cpuset.is_empty());
        Ok(())
    }

    /// Check parent links and cpuset containment for hardware objects
    pub fn validate(&self) -> Result<(), TopologyError> {
        if self.objects[0].kind != ObjectKind::Machine {
            return Err(TopologyError::Invariant(format!(
                "root is a {}, expected Machine",
                self.objects[0].kind
            )));
        }
        for (index, object) in self.objects.iter().enumerate() {
            for &child in &object.children {
                let child_obj = self
                    .object(child)
                    .ok_or(TopologyError::InvalidObject(child))?;
                if child_obj.parent != Some(ObjectId(index)) {
                    return Err(TopologyError::Invariant(format!(
                        "{} lists {} as child but its parent differs",
                        ObjectId(index),
                        child
                    )));
                }
                if !child_obj.kind.is_attached() && !child_obj.cpuset.is_subset(&object.cpuset) {
                    return Err(TopologyError::Invariant(format!(
                        "{} {} cpuset {} is not contained in parent {} {}",
                        child_obj.kind, child, child_obj.cpuset, object.kind, object.cpuset
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Index<ObjectId> for Topology {
    type Output = TopologyObject;

    fn index(&self, id: ObjectId) -> &TopologyObject {
        &self.objects[id.0]
    }
}
