//! DRM render nodes as coprocessors
//!
//! Render nodes (`/sys/class/drm/renderD*`) are grouped by the kernel
//! driver bound to their device. Locality comes from the device's
//! `local_cpulist`.

use arbor_core::{CpuSet, DeviceBackend};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::trace;

use crate::runtime::{DeviceRuntime, RuntimeError};
use crate::sysfs::read_cpu_list;

const DRM_CLASS: &str = "sys/class/drm";
const RENDER_PREFIX: &str = "renderD";

/// Driver with the render nodes bound to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrmDriver {
    pub name: String,
    nodes: Vec<DrmDevice>,
}

/// One render node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrmDevice {
    /// Node name, e.g. `renderD128`
    pub node: String,
    pub driver: String,
    path: PathBuf,
}

/// DRM runtime reading sysfs below a configurable root
#[derive(Debug, Clone)]
pub struct DrmRuntime {
    root: PathBuf,
    initialized: bool,
}

impl Default for DrmRuntime {
    fn default() -> Self {
        Self::new("/")
    }
}

impl DrmRuntime {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            initialized: false,
        }
    }

    fn class_dir(&self) -> PathBuf {
        self.root.join(DRM_CLASS)
    }
}

/// Numeric minor of a render node name
fn render_minor(name: &str) -> Option<u32> {
    name.strip_prefix(RENDER_PREFIX)?.parse().ok()
}

/// Key of a `KEY=value` uevent line
fn uevent_value(uevent: &str, key: &str) -> Option<String> {
    uevent.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        (k == key).then(|| v.trim().to_string())
    })
}

/// Driver bound to a render node's device
fn driver_name(node_path: &Path) -> String {
    let device = node_path.join("device");
    if let Ok(uevent) = std::fs::read_to_string(device.join("uevent")) {
        if let Some(driver) = uevent_value(&uevent, "DRIVER") {
            return driver;
        }
    }
    std::fs::read_link(device.join("driver"))
        .ok()
        .and_then(|target| target.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_string())
}

impl DeviceRuntime for DrmRuntime {
    type Driver = DrmDriver;
    type Device = DrmDevice;

    fn backend(&self) -> DeviceBackend {
        DeviceBackend::new("DRM", "dr")
    }

    fn init(&mut self) -> Result<(), RuntimeError> {
        let class = self.class_dir();
        if !class.is_dir() {
            return Err(RuntimeError::Unavailable(format!(
                "{} not found",
                class.display()
            )));
        }
        self.initialized = true;
        Ok(())
    }

    fn drivers(&self) -> Result<Vec<DrmDriver>, RuntimeError> {
        if !self.initialized {
            return Err(RuntimeError::Unavailable("runtime not initialized".to_string()));
        }

        let mut nodes: Vec<(u32, String, PathBuf)> = std::fs::read_dir(self.class_dir())?
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let name = entry.file_name().to_str()?.to_string();
                let minor = render_minor(&name)?;
                Some((minor, name, entry.path()))
            })
            .collect();
        nodes.sort_by_key(|(minor, _, _)| *minor);

        let mut drivers: Vec<DrmDriver> = Vec::new();
        for (_, node, path) in nodes {
            let driver = driver_name(&path);
            trace!(node = %node, driver = %driver, "Found render node");
            let device = DrmDevice {
                node,
                driver: driver.clone(),
                path,
            };
            match drivers.iter_mut().find(|d| d.name == driver) {
                Some(existing) => existing.nodes.push(device),
                None => drivers.push(DrmDriver {
                    name: driver,
                    nodes: vec![device],
                }),
            }
        }
        Ok(drivers)
    }

    fn devices(&self, driver: &DrmDriver) -> Result<Vec<DrmDevice>, RuntimeError> {
        Ok(driver.nodes.clone())
    }

    fn device_cpuset(&self, device: &DrmDevice) -> Result<CpuSet, RuntimeError> {
        let path = device.path.join("device").join("local_cpulist");
        read_cpu_list(&path).map_err(|e| RuntimeError::Query(e.to_string()))
    }

    fn device_infos(&self, device: &DrmDevice) -> BTreeMap<String, String> {
        let mut infos = BTreeMap::new();
        infos.insert("DRMNode".to_string(), device.node.clone());
        infos.insert("DRMDriver".to_string(), device.driver.clone());
        if let Ok(uevent) = std::fs::read_to_string(device.path.join("device").join("uevent")) {
            if let Some(slot) = uevent_value(&uevent, "PCI_SLOT_NAME") {
                infos.insert("PCIBusID".to_string(), slot);
            }
        }
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{attach_runtime_devices, enumerate_devices};
    use arbor_core::{synthetic, ObjectKind};
    use std::fs;

    fn write_node(root: &Path, name: &str, driver: &str, slot: &str, cpulist: Option<&str>) {
        let device = root.join(DRM_CLASS).join(name).join("device");
        fs::create_dir_all(&device).unwrap();
        fs::write(
            device.join("uevent"),
            format!("DRIVER={}\nPCI_SLOT_NAME={}\n", driver, slot),
        )
        .unwrap();
        if let Some(list) = cpulist {
            fs::write(device.join("local_cpulist"), format!("{}\n", list)).unwrap();
        }
    }

    #[test]
    fn test_render_minor() {
        assert_eq!(render_minor("renderD128"), Some(128));
        assert_eq!(render_minor("card0"), None);
        assert_eq!(render_minor("renderDx"), None);
    }

    #[test]
    fn test_uevent_value() {
        let uevent = "DRIVER=i915\nPCI_CLASS=30000\nPCI_SLOT_NAME=0000:00:02.0\n";
        assert_eq!(uevent_value(uevent, "DRIVER").as_deref(), Some("i915"));
        assert_eq!(uevent_value(uevent, "MODALIAS"), None);
    }

    #[test]
    fn test_missing_class_fails_init() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = DrmRuntime::new(dir.path());
        assert!(matches!(runtime.init(), Err(RuntimeError::Unavailable(_))));
        assert!(enumerate_devices(&mut runtime).is_empty());
    }

    #[test]
    fn test_nodes_grouped_by_driver() {
        let dir = tempfile::tempdir().unwrap();
        write_node(dir.path(), "renderD129", "xe", "0000:03:00.0", Some("4-7"));
        write_node(dir.path(), "renderD128", "i915", "0000:00:02.0", Some("0-3"));
        write_node(dir.path(), "renderD130", "xe", "0000:04:00.0", None);
        fs::create_dir_all(dir.path().join(DRM_CLASS).join("card0")).unwrap();

        let mut runtime = DrmRuntime::new(dir.path());
        runtime.init().unwrap();
        let drivers = runtime.drivers().unwrap();
        let names: Vec<_> = drivers.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["i915", "xe"]);
        assert_eq!(runtime.devices(&drivers[1]).unwrap().len(), 2);

        let records = enumerate_devices(&mut runtime);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].cpuset, Some(CpuSet::from_range(0, 3)));
        assert_eq!((records[2].driver_index, records[2].device_index), (1, 1));
        assert_eq!(records[2].cpuset, None);
        assert_eq!(
            records[1].infos.get("PCIBusID").map(String::as_str),
            Some("0000:03:00.0")
        );
    }

    #[test]
    fn test_attach_render_nodes() {
        let dir = tempfile::tempdir().unwrap();
        write_node(dir.path(), "renderD128", "i915", "0000:00:02.0", Some("0-3"));
        write_node(dir.path(), "renderD129", "amdgpu", "0000:03:00.0", Some("0-7"));

        let mut topology = synthetic::build("package:2 core:2 pu:2").unwrap();
        let count = attach_runtime_devices(&mut topology, &mut DrmRuntime::new(dir.path())).unwrap();
        assert_eq!(count, 2);

        let devices = topology.objects_of_kind(ObjectKind::Coprocessor);
        assert_eq!(topology[devices[0]].name.as_deref(), Some("dr0"));
        assert_eq!(topology.info(devices[0], "DRMNode"), Some("renderD128"));
        let parent = topology.parent(devices[0]).unwrap();
        assert_eq!(topology[parent].kind, ObjectKind::Package);
        assert_eq!(topology.parent(devices[1]), Some(topology.root()));
    }
}
