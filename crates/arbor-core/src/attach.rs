//! Attaching dynamically observed entities to a loaded topology
//!
//! Both attachers are driven by plain records so they can run against
//! fixtures; the enumeration of vendor devices and live processes lives in
//! `arbor-discovery`.

use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::affinity::{insert_at, PlacementKey};
use crate::cpuset::CpuSet;
use crate::object::{ObjectId, ObjectKind, TopologyObject};
use crate::topology::{Topology, TopologyError};

#[derive(Error, Debug)]
pub enum AttachError {
    /// Insertion failed; objects inserted before the failure stay in the tree
    #[error("Attach failed after {inserted} insertions: {source}")]
    AttachFailed {
        inserted: usize,
        #[source]
        source: TopologyError,
    },
}

/// Identity of the runtime a batch of devices was enumerated from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBackend {
    /// Backend name recorded in `Backend` infos (e.g. "DRM")
    pub name: String,
    /// Two-letter prefix of generated device names (e.g. "dr")
    pub tag: String,
}

impl DeviceBackend {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
        }
    }

    pub fn driver_index_key(&self) -> String {
        format!("{}DriverIndex", self.name)
    }

    pub fn device_index_key(&self) -> String {
        format!("{}DriverDeviceIndex", self.name)
    }
}

/// A coprocessor as reported by a vendor runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub driver_index: usize,
    /// Index of the device within its driver
    pub device_index: usize,
    /// Locality of the device, `None` when the runtime could not tell
    pub cpuset: Option<CpuSet>,
    /// Extra attributes copied to the object infos
    pub infos: BTreeMap<String, String>,
}

impl DeviceRecord {
    pub fn new(driver_index: usize, device_index: usize, cpuset: Option<CpuSet>) -> Self {
        Self {
            driver_index,
            device_index,
            cpuset,
            infos: BTreeMap::new(),
        }
    }

    pub fn placement_key(&self) -> PlacementKey {
        PlacementKey::from_cpuset(self.cpuset.as_ref())
    }
}

/// Attach one `Coprocessor` leaf per record, in order.
///
/// Leaves are named `<tag><n>` where `n` counts every device ever attached
/// with that tag on this topology, so names never collide across drivers or
/// across repeated passes. Returns the number of attached devices.
pub fn attach_devices(
    topology: &mut Topology,
    backend: &DeviceBackend,
    records: &[DeviceRecord],
) -> Result<usize, AttachError> {
    let root = topology.root();
    if let Some(root_object) = topology.object_mut(root) {
        root_object.set_info("Backend", backend.name.clone());
    }

    let mut inserted = 0;
    for record in records {
        let sequence = topology.next_sequence(&backend.tag);
        let name = format!("{}{}", backend.tag, sequence);

        let mut leaf = TopologyObject::new(
            ObjectKind::Coprocessor,
            record.cpuset.clone().unwrap_or_default(),
        )
        .with_name(name.clone());
        for (key, value) in &record.infos {
            leaf.set_info(key.clone(), value.clone());
        }
        leaf.set_info("Backend", backend.name.clone());
        leaf.set_info(backend.driver_index_key(), record.driver_index.to_string());
        leaf.set_info(backend.device_index_key(), record.device_index.to_string());

        let id = insert_at(topology, &record.placement_key(), leaf)
            .map_err(|source| AttachError::AttachFailed { inserted, source })?;
        inserted += 1;

        debug!(
            device = %name,
            driver = record.driver_index,
            index = record.device_index,
            parent = ?topology.parent(id),
            "Attached coprocessor"
        );

        if cfg!(debug_assertions) {
            verify_device_placement(topology, id, record.cpuset.as_ref());
        }
    }

    Ok(inserted)
}

/// Check that the hardware ancestor of an attached device has exactly the
/// cpuset the runtime reported. Only meaningful on complete topologies;
/// restricted ones always pass.
pub fn verify_device_placement(topology: &Topology, leaf: ObjectId, cpuset: Option<&CpuSet>) -> bool {
    let Some(cpuset) = cpuset.filter(|c| !c.is_empty()) else {
        return true;
    };
    if !topology.is_complete() {
        return true;
    }
    let Some(ancestor) = topology.nearest_hardware_ancestor(leaf) else {
        return false;
    };
    let matches = &topology[ancestor].cpuset == cpuset;
    if !matches {
        warn!(
            leaf = %leaf,
            device_cpuset = %cpuset,
            ancestor_cpuset = %topology[ancestor].cpuset,
            "Device locality does not match its ancestor exactly"
        );
    }
    matches
}

/// A live process sampled once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: u32,
    /// First token of the command line, when readable
    pub command: Option<String>,
    pub cpuset: CpuSet,
}

impl ProcessRecord {
    /// Display label: `"<pid> <command>"`, or just the pid
    pub fn label(&self) -> String {
        match &self.command {
            Some(command) if !command.is_empty() => format!("{} {}", self.pid, command),
            _ => self.pid.to_string(),
        }
    }
}

/// Outcome of a process attachment pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessAttachReport {
    pub attached: usize,
    /// Processes dropped because their binding carries no locality within
    /// the topology
    pub skipped: usize,
}

/// Attach one `Process` leaf per record bound to a subset of the machine.
///
/// Processes allowed on every CPU of the topology are skipped, and so are
/// processes bound only to CPUs outside it. Bindings that partly leave a
/// restricted topology are placed by the part that remains.
pub fn attach_processes<I>(topology: &mut Topology, records: I) -> Result<ProcessAttachReport, AttachError>
where
    I: IntoIterator<Item = ProcessRecord>,
{
    let mut report = ProcessAttachReport::default();

    for record in records {
        let visible = record.cpuset.intersection(topology.cpuset());
        if visible.is_empty() || &visible == topology.cpuset() {
            trace!(pid = record.pid, cpuset = %record.cpuset, "Process binding adds no locality");
            report.skipped += 1;
            continue;
        }

        let mut leaf = TopologyObject::new(ObjectKind::Process, visible.clone())
            .with_os_index(record.pid)
            .with_name(record.label());
        leaf.set_info("PID", record.pid.to_string());

        let key = PlacementKey::Affinity(visible);
        insert_at(topology, &key, leaf).map_err(|source| AttachError::AttachFailed {
            inserted: report.attached,
            source,
        })?;
        report.attached += 1;
    }

    debug!(
        attached = report.attached,
        skipped = report.skipped,
        "Process attachment finished"
    );
    Ok(report)
}
