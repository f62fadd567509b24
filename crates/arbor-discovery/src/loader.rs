//! Input resolution: turn the requested input into a loaded, restricted and
//! filtered topology

use arbor_core::synthetic::{self, SyntheticError};
use arbor_core::{filter, xml, FilterError, FilterOptions, Topology, TopologyError, XmlError};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};

use crate::procfs::{ProcessDirectory, ProcessError};
use crate::sysfs::{SysfsError, SysfsLoader};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Unknown input format `{0}`, expected xml, synthetic or fsroot")]
    UnknownFormat(String),
    #[error("Failed to load sysfs topology: {0}")]
    Sysfs(#[from] SysfsError),
    #[error("Failed to load XML topology: {0}")]
    Xml(#[from] XmlError),
    #[error("Invalid synthetic topology: {0}")]
    Synthetic(#[from] SyntheticError),
    #[error("Failed to restrict topology: {0}")]
    Restrict(#[from] TopologyError),
    #[error("Cannot read CPU binding of process {pid}: {source}")]
    Process {
        pid: u32,
        #[source]
        source: ProcessError,
    },
    #[error(transparent)]
    Filter(#[from] FilterError),
}

/// Kind of topology input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Xml,
    Synthetic,
    FsRoot,
}

impl InputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputFormat::Xml => "xml",
            InputFormat::Synthetic => "synthetic",
            InputFormat::FsRoot => "fsroot",
        }
    }

    /// Guess the format of an input: files are XML, directories are sysfs
    /// roots and anything else is a synthetic description
    pub fn detect(input: &str) -> Self {
        let path = Path::new(input);
        if path.is_file() {
            InputFormat::Xml
        } else if path.is_dir() {
            InputFormat::FsRoot
        } else {
            InputFormat::Synthetic
        }
    }
}

impl fmt::Display for InputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InputFormat {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "xml" => Ok(InputFormat::Xml),
            "synthetic" => Ok(InputFormat::Synthetic),
            "fsroot" => Ok(InputFormat::FsRoot),
            _ => Err(LoadError::UnknownFormat(s.to_string())),
        }
    }
}

/// Everything that decides which topology gets loaded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Input location or description; `None` loads the live system
    pub input: Option<String>,
    /// Explicit input format, detected from `input` otherwise
    pub format: Option<InputFormat>,
    /// Keep CPUs the current process may not use
    pub whole_system: bool,
    /// Restrict to the binding of this process
    pub pid: Option<u32>,
    pub filters: FilterOptions,
}

impl LoadOptions {
    pub fn is_live(&self) -> bool {
        self.input.is_none()
    }
}

fn load_unfiltered(options: &LoadOptions) -> Result<Topology, LoadError> {
    let Some(input) = options.input.as_deref() else {
        return Ok(SysfsLoader::new("/").load()?);
    };

    let format = options.format.unwrap_or_else(|| InputFormat::detect(input));
    debug!(input, format = %format, "Loading topology");
    match format {
        InputFormat::Xml => Ok(xml::from_file(Path::new(input))?),
        InputFormat::Synthetic => Ok(synthetic::build(input)?),
        InputFormat::FsRoot => Ok(SysfsLoader::new(input).load()?),
    }
}

/// Load the topology described by `options`.
///
/// The live topology is restricted to the CPUs this process may use unless
/// `whole_system` is set; `pid` restricts any input to that process's
/// binding. Filters run last.
pub fn load_topology<D>(options: &LoadOptions, processes: &D) -> Result<Topology, LoadError>
where
    D: ProcessDirectory + ?Sized,
{
    let mut topology = load_unfiltered(options)?;

    if let Some(pid) = options.pid {
        let cpuset = processes
            .affinity(pid)
            .map_err(|source| LoadError::Process { pid, source })?;
        info!(pid, cpuset = %cpuset, "Restricting topology to process binding");
        topology.restrict(&cpuset)?;
    } else if options.is_live() && !options.whole_system {
        match processes.affinity(std::process::id()) {
            Ok(allowed) => topology.restrict(&allowed)?,
            Err(e) => debug!(error = %e, "Own CPU binding unavailable, showing whole system"),
        }
    }

    filter::apply(&mut topology, &options.filters)?;
    Ok(topology)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysfs::fixture;
    use arbor_core::{CpuSet, ObjectKind};

    /// Directory reporting the same binding for every process
    struct Bound(Option<CpuSet>);

    impl ProcessDirectory for Bound {
        fn pids(&self) -> Result<Box<dyn Iterator<Item = u32> + '_>, ProcessError> {
            Ok(Box::new(std::iter::empty()))
        }

        fn affinity(&self, pid: u32) -> Result<CpuSet, ProcessError> {
            self.0.clone().ok_or(ProcessError::MissingAffinity(pid))
        }

        fn command_line(&self, _pid: u32) -> Result<String, ProcessError> {
            Ok(String::new())
        }
    }

    #[test]
    fn test_parse_format() {
        assert_eq!("XML".parse::<InputFormat>().unwrap(), InputFormat::Xml);
        assert_eq!("fsroot".parse::<InputFormat>().unwrap(), InputFormat::FsRoot);
        assert!(matches!(
            "json".parse::<InputFormat>(),
            Err(LoadError::UnknownFormat(_))
        ));
    }

    #[test]
    fn test_detect_format() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("topo.xml");
        std::fs::write(&file, "<topology/>").unwrap();

        assert_eq!(InputFormat::detect(file.to_str().unwrap()), InputFormat::Xml);
        assert_eq!(InputFormat::detect(dir.path().to_str().unwrap()), InputFormat::FsRoot);
        assert_eq!(InputFormat::detect("package:2 pu:2"), InputFormat::Synthetic);
    }

    #[test]
    fn test_synthetic_input_is_not_restricted() {
        let options = LoadOptions {
            input: Some("package:2 core:2 pu:2".to_string()),
            ..Default::default()
        };
        let topology = load_topology(&options, &Bound(Some(CpuSet::from_range(0, 1)))).unwrap();
        assert_eq!(topology.objects_of_kind(ObjectKind::Pu).len(), 8);
    }

    #[test]
    fn test_pid_restriction() {
        let options = LoadOptions {
            input: Some("package:2 core:2 pu:2".to_string()),
            pid: Some(42),
            ..Default::default()
        };
        let topology = load_topology(&options, &Bound(Some(CpuSet::from_range(4, 7)))).unwrap();
        assert_eq!(topology.objects_of_kind(ObjectKind::Package).len(), 1);
        assert_eq!(topology.cpuset(), &CpuSet::from_range(4, 7));
        assert_eq!(topology.complete_cpuset(), &CpuSet::from_range(0, 7));
        assert!(!topology.is_complete());

        assert!(matches!(
            load_topology(&options, &Bound(None)),
            Err(LoadError::Process { pid: 42, .. })
        ));
    }

    #[test]
    fn test_fsroot_input_with_filters() {
        let dir = tempfile::tempdir().unwrap();
        fixture::write_cpus(dir.path(), "0-3", "0-3", &[(0, 0, 0), (1, 0, 1), (2, 0, 2), (3, 0, 3)]);

        let options = LoadOptions {
            input: Some(dir.path().to_string_lossy().into_owned()),
            format: Some(InputFormat::FsRoot),
            filters: FilterOptions {
                ignore: vec![ObjectKind::Package],
                ..Default::default()
            },
            ..Default::default()
        };
        let topology = load_topology(&options, &Bound(None)).unwrap();
        assert!(topology.objects_of_kind(ObjectKind::Package).is_empty());
        assert_eq!(topology.children(topology.root()).len(), 4);
    }

    #[test]
    fn test_xml_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topo.xml");
        let original = synthetic::build("core:3 pu:1").unwrap();
        std::fs::write(&path, xml::to_xml(&original).unwrap()).unwrap();

        let options = LoadOptions {
            input: Some(path.to_string_lossy().into_owned()),
            ..Default::default()
        };
        let topology = load_topology(&options, &Bound(None)).unwrap();
        assert_eq!(topology.objects_of_kind(ObjectKind::Core).len(), 3);
    }

    #[test]
    fn test_bad_synthetic_description() {
        let options = LoadOptions {
            input: Some("nonsense here".to_string()),
            format: Some(InputFormat::Synthetic),
            ..Default::default()
        };
        assert!(matches!(
            load_topology(&options, &Bound(None)),
            Err(LoadError::Synthetic(_))
        ));
    }
}
