//! Topology object types

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::cpuset::CpuSet;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown object type: {0}")]
pub struct UnknownKind(pub String);

/// Stable index of an object inside a [`crate::Topology`] arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub(crate) usize);

impl ObjectId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of a topology object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Machine,
    NumaNode,
    Package,
    Group,
    L3Cache,
    L2Cache,
    L1Cache,
    Core,
    Pu,
    /// Accelerator enumerated through a vendor runtime
    Coprocessor,
    /// Running operating-system process
    Process,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 11] = [
        ObjectKind::Machine,
        ObjectKind::NumaNode,
        ObjectKind::Package,
        ObjectKind::Group,
        ObjectKind::L3Cache,
        ObjectKind::L2Cache,
        ObjectKind::L1Cache,
        ObjectKind::Core,
        ObjectKind::Pu,
        ObjectKind::Coprocessor,
        ObjectKind::Process,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Machine => "Machine",
            Self::NumaNode => "NUMANode",
            Self::Package => "Package",
            Self::Group => "Group",
            Self::L3Cache => "L3Cache",
            Self::L2Cache => "L2Cache",
            Self::L1Cache => "L1Cache",
            Self::Core => "Core",
            Self::Pu => "PU",
            Self::Coprocessor => "Coproc",
            Self::Process => "Process",
        }
    }

    pub fn is_cache(self) -> bool {
        matches!(self, Self::L3Cache | Self::L2Cache | Self::L1Cache)
    }

    /// Attached kinds are inserted after discovery and do not describe hardware.
    /// The affinity walk never descends into them.
    pub fn is_attached(self) -> bool {
        matches!(self, Self::Coprocessor | Self::Process)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.to_ascii_lowercase().as_str() {
            "machine" => Self::Machine,
            "numanode" | "numa" | "node" => Self::NumaNode,
            "package" | "socket" => Self::Package,
            "group" => Self::Group,
            "l3cache" | "l3" => Self::L3Cache,
            "l2cache" | "l2" => Self::L2Cache,
            "l1cache" | "l1" => Self::L1Cache,
            "core" => Self::Core,
            "pu" => Self::Pu,
            "coproc" | "coprocessor" => Self::Coprocessor,
            "process" | "misc" => Self::Process,
            _ => return Err(UnknownKind(s.to_string())),
        };
        Ok(kind)
    }
}

/// A node of the topology arena
#[derive(Debug, Clone)]
pub struct TopologyObject {
    pub kind: ObjectKind,
    /// Index assigned by the operating system (physical index)
    pub os_index: Option<u32>,
    pub name: Option<String>,
    pub cpuset: CpuSet,
    pub parent: Option<ObjectId>,
    pub children: Vec<ObjectId>,
    pub infos: BTreeMap<String, String>,
}

impl TopologyObject {
    pub fn new(kind: ObjectKind, cpuset: CpuSet) -> Self {
        Self {
            kind,
            os_index: None,
            name: None,
            cpuset,
            parent: None,
            children: Vec::new(),
            infos: BTreeMap::new(),
        }
    }

    pub fn with_os_index(mut self, os_index: u32) -> Self {
        self.os_index = Some(os_index);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn info(&self, key: &str) -> Option<&str> {
        self.infos.get(key).map(String::as_str)
    }

    pub fn set_info(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.infos.insert(key.into(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing() {
        assert_eq!("PU".parse::<ObjectKind>().unwrap(), ObjectKind::Pu);
        assert_eq!("socket".parse::<ObjectKind>().unwrap(), ObjectKind::Package);
        assert_eq!("L2".parse::<ObjectKind>().unwrap(), ObjectKind::L2Cache);
        assert!("widget".parse::<ObjectKind>().is_err());

        for kind in ObjectKind::ALL {
            assert_eq!(kind.as_str().parse::<ObjectKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_attached_kinds() {
        assert!(ObjectKind::Process.is_attached());
        assert!(ObjectKind::Coprocessor.is_attached());
        assert!(!ObjectKind::Core.is_attached());
    }
}
