//! Arbor Core - Topology tree, cpusets and affinity-based attachment
//!
//! This crate provides the foundational pieces of Arbor:
//! - An arena-backed topology tree of hardware objects
//! - CPU sets with mask, taskset and list representations
//! - The affinity mapper placing a cpuset at its tightest ancestor
//! - Attachers for coprocessor devices and running processes
//! - Object filters, XML import/export and synthetic topologies

pub mod affinity;
pub mod attach;
pub mod cpuset;
pub mod filter;
pub mod object;
pub mod synthetic;
pub mod topology;
pub mod xml;

pub use affinity::{insert_at, locate_ancestor, Located, PlacementKey};
pub use attach::{
    attach_devices, attach_processes, AttachError, DeviceBackend, DeviceRecord,
    ProcessAttachReport, ProcessRecord,
};
pub use cpuset::{CpuSet, CpuSetError, MAX_CPU_INDEX};
pub use filter::{CacheFilter, FilterError, FilterOptions};
pub use object::{ObjectId, ObjectKind, TopologyObject, UnknownKind};
pub use topology::{Topology, TopologyError};
pub use xml::XmlError;
