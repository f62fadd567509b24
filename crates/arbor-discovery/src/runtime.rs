//! Vendor device runtimes
//!
//! A runtime exposes drivers, the devices of each driver and the CPU
//! locality of each device. Enumeration is best effort: a runtime that
//! fails to initialize contributes nothing, a driver whose device list
//! cannot be read is skipped and a device with unknown locality is placed
//! at the root.

use arbor_core::{attach_devices, AttachError, CpuSet, DeviceBackend, DeviceRecord, Topology};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Device runtime unavailable: {0}")]
    Unavailable(String),
    #[error("Device runtime query failed: {0}")]
    Query(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Enumeration interface of a vendor device runtime
pub trait DeviceRuntime {
    type Driver;
    type Device;

    /// Name and naming tag of the devices this runtime produces
    fn backend(&self) -> DeviceBackend;

    /// Prepare the runtime. Called once before any query.
    fn init(&mut self) -> Result<(), RuntimeError>;

    fn drivers(&self) -> Result<Vec<Self::Driver>, RuntimeError>;

    fn devices(&self, driver: &Self::Driver) -> Result<Vec<Self::Device>, RuntimeError>;

    /// CPUs close to the device
    fn device_cpuset(&self, device: &Self::Device) -> Result<CpuSet, RuntimeError>;

    /// Extra attributes attached to the device object
    fn device_infos(&self, _device: &Self::Device) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

/// Collect one record per device, in driver then device order
pub fn enumerate_devices<R: DeviceRuntime>(runtime: &mut R) -> Vec<DeviceRecord> {
    let backend = runtime.backend();

    if let Err(e) = runtime.init() {
        debug!(backend = %backend.name, error = %e, "Device runtime not available");
        return Vec::new();
    }

    let drivers = match runtime.drivers() {
        Ok(drivers) => drivers,
        Err(e) => {
            debug!(backend = %backend.name, error = %e, "Failed to list drivers");
            return Vec::new();
        }
    };

    let mut records = Vec::new();
    for (driver_index, driver) in drivers.iter().enumerate() {
        let devices = match runtime.devices(driver) {
            Ok(devices) => devices,
            Err(e) => {
                warn!(
                    backend = %backend.name,
                    driver = driver_index,
                    error = %e,
                    "Skipping driver whose devices cannot be listed"
                );
                continue;
            }
        };

        for (device_index, device) in devices.iter().enumerate() {
            let cpuset = match runtime.device_cpuset(device) {
                Ok(cpuset) if !cpuset.is_empty() => Some(cpuset),
                Ok(_) => None,
                Err(e) => {
                    debug!(
                        backend = %backend.name,
                        driver = driver_index,
                        device = device_index,
                        error = %e,
                        "Device locality unknown"
                    );
                    None
                }
            };
            let mut record = DeviceRecord::new(driver_index, device_index, cpuset);
            record.infos = runtime.device_infos(device);
            records.push(record);
        }
    }

    records
}

/// Enumerate the devices of `runtime` and attach them to the topology
pub fn attach_runtime_devices<R: DeviceRuntime>(
    topology: &mut Topology,
    runtime: &mut R,
) -> Result<usize, AttachError> {
    let backend = runtime.backend();
    let records = enumerate_devices(runtime);
    if records.is_empty() {
        return Ok(0);
    }
    let count = attach_devices(topology, &backend, &records)?;
    info!(backend = %backend.name, count, "Attached coprocessors");
    Ok(count)
}
