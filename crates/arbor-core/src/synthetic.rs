//! Synthetic topology descriptions such as `"package:2 core:4 pu:2"`
//!
//! Each whitespace-separated level names an object kind and how many of
//! them each object of the previous level contains. The last level must be
//! `pu`. Processing units receive OS indices `0..n` in order.

use thiserror::Error;

use crate::cpuset::CpuSet;
use crate::object::{ObjectKind, TopologyObject};
use crate::topology::{Topology, TopologyError};

/// Upper bound on generated processing units
const MAX_SYNTHETIC_PUS: usize = 1 << 16;

#[derive(Error, Debug)]
pub enum SyntheticError {
    #[error("Synthetic description is empty")]
    Empty,
    #[error("Invalid synthetic level `{0}`, expected <type>:<count>")]
    InvalidLevel(String),
    #[error("Object type {0} cannot appear in a synthetic description")]
    UnsupportedKind(ObjectKind),
    #[error("Synthetic description must end with a pu level")]
    MissingPu,
    #[error("Synthetic description describes more than 65536 processing units")]
    TooLarge,
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// One parsed level of a synthetic description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticLevel {
    pub kind: ObjectKind,
    pub count: usize,
}

/// Parse a description into its levels
pub fn parse(description: &str) -> Result<Vec<SyntheticLevel>, SyntheticError> {
    let mut levels = Vec::new();
    for token in description.split_whitespace() {
        let (kind, count) = token
            .split_once(':')
            .ok_or_else(|| SyntheticError::InvalidLevel(token.to_string()))?;
        let kind: ObjectKind = kind
            .parse()
            .map_err(|_| SyntheticError::InvalidLevel(token.to_string()))?;
        let count: usize = count
            .parse()
            .ok()
            .filter(|&c| c > 0)
            .ok_or_else(|| SyntheticError::InvalidLevel(token.to_string()))?;
        if kind == ObjectKind::Machine || kind.is_attached() {
            return Err(SyntheticError::UnsupportedKind(kind));
        }
        levels.push(SyntheticLevel { kind, count });
    }

    match levels.last() {
        None => Err(SyntheticError::Empty),
        Some(last) if last.kind != ObjectKind::Pu => Err(SyntheticError::MissingPu),
        Some(_) if levels[..levels.len() - 1].iter().any(|l| l.kind == ObjectKind::Pu) => {
            Err(SyntheticError::MissingPu)
        }
        Some(_) => Ok(levels),
    }
}

/// Build a topology from a synthetic description
pub fn build(description: &str) -> Result<Topology, SyntheticError> {
    let levels = parse(description)?;

    let total = levels
        .iter()
        .try_fold(1usize, |acc, l| acc.checked_mul(l.count))
        .filter(|&t| t <= MAX_SYNTHETIC_PUS)
        .ok_or(SyntheticError::TooLarge)?;

    let mut root = TopologyObject::new(ObjectKind::Machine, CpuSet::from_range(0, total as u32 - 1));
    root.set_info("Backend", "Synthetic");
    root.set_info("SyntheticDescription", description.trim());
    let mut topology = Topology::new(root);

    let mut parents = vec![topology.root()];
    let mut span = total;
    for level in &levels {
        span /= level.count;
        let mut next = Vec::with_capacity(parents.len() * level.count);
        for (parent_index, &parent) in parents.iter().enumerate() {
            for child in 0..level.count {
                let global = parent_index * level.count + child;
                let first = (global * span) as u32;
                let last = ((global + 1) * span - 1) as u32;
                let object = TopologyObject::new(level.kind, CpuSet::from_range(first, last))
                    .with_os_index(global as u32);
                next.push(topology.insert_child(parent, object)?);
            }
        }
        parents = next;
    }

    Ok(topology)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_two_packages() {
        let topology = build("package:2 core:2 pu:2").unwrap();
        assert_eq!(topology.cpuset(), &CpuSet::from_range(0, 7));
        assert_eq!(topology.objects_of_kind(ObjectKind::Package).len(), 2);
        assert_eq!(topology.objects_of_kind(ObjectKind::Core).len(), 4);

        let pus = topology.objects_of_kind(ObjectKind::Pu);
        assert_eq!(pus.len(), 8);
        assert_eq!(topology[pus[5]].os_index, Some(5));
        assert_eq!(topology[pus[5]].cpuset, CpuSet::from_range(5, 5));

        let second_package = topology.objects_of_kind(ObjectKind::Package)[1];
        assert_eq!(topology[second_package].cpuset, CpuSet::from_range(4, 7));
        assert!(topology.validate().is_ok());
        assert!(topology.is_complete());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse(""), Err(SyntheticError::Empty)));
        assert!(matches!(parse("core:2"), Err(SyntheticError::MissingPu)));
        assert!(matches!(parse("pu:2 core:2"), Err(SyntheticError::MissingPu)));
        assert!(matches!(parse("core:x pu:1"), Err(SyntheticError::InvalidLevel(_))));
        assert!(matches!(parse("core:0 pu:1"), Err(SyntheticError::InvalidLevel(_))));
        assert!(matches!(parse("widget:2 pu:1"), Err(SyntheticError::InvalidLevel(_))));
        assert!(matches!(
            parse("process:2 pu:1"),
            Err(SyntheticError::UnsupportedKind(ObjectKind::Process))
        ));
    }

    #[test]
    fn test_too_large() {
        assert!(matches!(
            build("package:1024 core:1024 pu:1024"),
            Err(SyntheticError::TooLarge)
        ));
    }
}
