//! Topology discovery from a sysfs tree
//!
//! Reads `sys/devices/system/cpu` and `sys/devices/system/node` below a
//! filesystem root (`/` for the live system). Packages and cores come from
//! the `physical_package_id` and `core_id` of every online CPU, NUMA nodes
//! from `nodeN/cpulist` and caches from `cpuN/cache/indexK`. Objects are
//! nested by cpuset containment.

use arbor_core::{
    locate_ancestor, CpuSet, CpuSetError, ObjectKind, Topology, TopologyError, TopologyObject,
};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, trace};

const CPU_DIR: &str = "sys/devices/system/cpu";
const NODE_DIR: &str = "sys/devices/system/node";

#[derive(Error, Debug)]
pub enum SysfsError {
    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid CPU list in {}: {source}", .path.display())]
    CpuList {
        path: PathBuf,
        #[source]
        source: CpuSetError,
    },
    #[error("No online processing unit under {}", .0.display())]
    NoCpus(PathBuf),
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// Read a sysfs CPU list file such as `online` or `local_cpulist`
pub fn read_cpu_list(path: &Path) -> Result<CpuSet, SysfsError> {
    let content = std::fs::read_to_string(path).map_err(|source| SysfsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    CpuSet::parse_list(content.trim()).map_err(|source| SysfsError::CpuList {
        path: path.to_path_buf(),
        source,
    })
}

/// Read a topology id; absent or negative ids (`-1` on some platforms) are `None`
fn read_id(path: &Path) -> Option<u32> {
    let content = std::fs::read_to_string(path).ok()?;
    content.trim().parse::<i64>().ok().and_then(|v| u32::try_from(v).ok())
}

/// Numeric suffix of a sysfs entry such as `node1` or `index3`
fn entry_index(name: &str, prefix: &str) -> Option<u32> {
    name.strip_prefix(prefix)?.parse().ok()
}

/// Location of one online CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuLocation {
    package: u32,
    core: u32,
}

/// Nesting rank of a kind when two objects span the same CPUs
fn rank(kind: ObjectKind) -> usize {
    ObjectKind::ALL
        .iter()
        .position(|&k| k == kind)
        .unwrap_or(ObjectKind::ALL.len())
}

/// Insert `objects` below the tightest object containing each cpuset.
/// Larger sets go first; equal sets nest in kind order.
fn insert_by_cpuset(topology: &mut Topology, mut objects: Vec<TopologyObject>) -> Result<(), TopologyError> {
    objects.retain(|o| !o.cpuset.is_empty());
    objects.sort_by_key(|o| (Reverse(o.cpuset.weight()), rank(o.kind), o.cpuset.first()));
    for object in objects {
        let parent = locate_ancestor(topology, &object.cpuset)?.object;
        topology.insert_child(parent, object)?;
    }
    topology.sort_children_by_cpuset();
    Ok(())
}

/// Loader for the sysfs topology below `root`
#[derive(Debug, Clone)]
pub struct SysfsLoader {
    root: PathBuf,
}

impl SysfsLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn cpu_dir(&self) -> PathBuf {
        self.root.join(CPU_DIR)
    }

    fn locate(&self, cpu: u32) -> CpuLocation {
        let topology = self.cpu_dir().join(format!("cpu{}", cpu)).join("topology");
        CpuLocation {
            package: read_id(&topology.join("physical_package_id")).unwrap_or(0),
            core: read_id(&topology.join("core_id")).unwrap_or(cpu),
        }
    }

    /// NUMA nodes with at least one online CPU; none when the kernel
    /// exposes no node directory
    fn numa_nodes(&self, online: &CpuSet) -> Vec<TopologyObject> {
        let node_dir = self.root.join(NODE_DIR);
        let entries = match std::fs::read_dir(&node_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(path = %node_dir.display(), error = %e, "No NUMA information");
                return Vec::new();
            }
        };

        let mut nodes = Vec::new();
        for entry in entries.flatten() {
            let Some(node) = entry.file_name().to_str().and_then(|n| entry_index(n, "node")) else {
                continue;
            };
            match read_cpu_list(&entry.path().join("cpulist")) {
                Ok(cpuset) => nodes.push(
                    TopologyObject::new(ObjectKind::NumaNode, cpuset.intersection(online))
                        .with_os_index(node),
                ),
                Err(e) => debug!(node, error = %e, "Skipping NUMA node"),
            }
        }
        nodes
    }

    /// Data and unified caches of levels 1 to 3, one object per distinct
    /// set of sharing CPUs
    fn caches(&self, online: &CpuSet) -> Vec<TopologyObject> {
        let mut seen: HashSet<(ObjectKind, CpuSet)> = HashSet::new();
        let mut caches = Vec::new();

        for cpu in online.iter() {
            let cache_dir = self.cpu_dir().join(format!("cpu{}", cpu)).join("cache");
            let Ok(entries) = std::fs::read_dir(&cache_dir) else {
                continue;
            };
            for entry in entries.flatten() {
                if entry.file_name().to_str().and_then(|n| entry_index(n, "index")).is_none() {
                    continue;
                }
                let index = entry.path();
                let cache_type = std::fs::read_to_string(index.join("type")).unwrap_or_default();
                if cache_type.trim() == "Instruction" {
                    continue;
                }
                let kind = match read_id(&index.join("level")) {
                    Some(1) => ObjectKind::L1Cache,
                    Some(2) => ObjectKind::L2Cache,
                    Some(3) => ObjectKind::L3Cache,
                    level => {
                        trace!(cpu, ?level, "Skipping cache level");
                        continue;
                    }
                };
                let shared = match read_cpu_list(&index.join("shared_cpu_list")) {
                    Ok(shared) => shared.intersection(online),
                    Err(e) => {
                        debug!(cpu, error = %e, "Skipping cache without sharing list");
                        continue;
                    }
                };
                if shared.is_empty() || !seen.insert((kind, shared.clone())) {
                    continue;
                }

                let mut cache = TopologyObject::new(kind, shared);
                if let Ok(size) = std::fs::read_to_string(index.join("size")) {
                    cache.set_info("CacheSize", size.trim());
                }
                caches.push(cache);
            }
        }
        caches
    }

    pub fn load(&self) -> Result<Topology, SysfsError> {
        let cpu_dir = self.cpu_dir();
        let online = read_cpu_list(&cpu_dir.join("online"))?;
        if online.is_empty() {
            return Err(SysfsError::NoCpus(cpu_dir));
        }
        let present = read_cpu_list(&cpu_dir.join("present")).unwrap_or_else(|e| {
            debug!(error = %e, "No present CPU list, assuming all online");
            online.clone()
        });

        let mut packages: BTreeMap<u32, CpuSet> = BTreeMap::new();
        let mut cores: BTreeMap<(u32, u32), CpuSet> = BTreeMap::new();
        for cpu in online.iter() {
            let location = self.locate(cpu);
            packages.entry(location.package).or_default().insert(cpu);
            cores
                .entry((location.package, location.core))
                .or_default()
                .insert(cpu);
        }

        let mut objects: Vec<TopologyObject> = Vec::new();
        objects.extend(packages.iter().map(|(&id, cpuset)| {
            TopologyObject::new(ObjectKind::Package, cpuset.clone()).with_os_index(id)
        }));
        objects.extend(cores.iter().map(|(&(_, id), cpuset)| {
            TopologyObject::new(ObjectKind::Core, cpuset.clone()).with_os_index(id)
        }));
        objects.extend(
            online
                .iter()
                .map(|pu| TopologyObject::new(ObjectKind::Pu, CpuSet::from_range(pu, pu)).with_os_index(pu)),
        );
        let nodes = self.numa_nodes(&online);
        let caches = self.caches(&online);
        let (node_count, cache_count) = (nodes.len(), caches.len());
        objects.extend(nodes);
        objects.extend(caches);

        let mut machine = TopologyObject::new(ObjectKind::Machine, online.clone());
        machine.set_info("Backend", "Linux");
        let mut topology = Topology::new(machine);
        topology.set_complete_cpuset(present);
        insert_by_cpuset(&mut topology, objects)?;

        info!(
            root = %self.root.display(),
            packages = packages.len(),
            numa_nodes = node_count,
            caches = cache_count,
            pus = online.weight(),
            "Loaded sysfs topology"
        );
        Ok(topology)
    }
}
