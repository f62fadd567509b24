//! Arbor Discovery - Loading topologies and observing the running system
//!
//! This crate connects `arbor-core` to the outside world:
//! - sysfs, XML and synthetic topology inputs
//! - vendor device runtimes, with a DRM render-node implementation
//! - the `/proc` process directory

pub mod drm;
pub mod loader;
pub mod procfs;
pub mod runtime;
pub mod sysfs;

pub use drm::DrmRuntime;
pub use loader::{load_topology, InputFormat, LoadError, LoadOptions};
pub use procfs::{attach_running_processes, ProcFs, ProcessDirectory, ProcessError, ProcessOptions};
pub use runtime::{attach_runtime_devices, enumerate_devices, DeviceRuntime, RuntimeError};
pub use sysfs::{SysfsError, SysfsLoader};
