//! Process enumeration through `/proc`
//!
//! Each process contributes its pid, the first token of its command line
//! and its current CPU binding (`Cpus_allowed_list` in `status`). Processes
//! may exit at any time; every per-process failure is reported to the
//! caller, which skips that process.

use arbor_core::{attach_processes, AttachError, CpuSet, CpuSetError, ProcessAttachReport, ProcessRecord, Topology};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, trace};

/// Longest command name kept in process labels
const MAX_COMMAND_LEN: usize = 63;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Process {0} does not report its CPU binding")]
    MissingAffinity(u32),
    #[error("Invalid CPU binding for process {pid}: {source}")]
    InvalidAffinity {
        pid: u32,
        #[source]
        source: CpuSetError,
    },
    #[error("Process enumeration unavailable: {0}")]
    Unavailable(String),
}

/// Source of live process information
pub trait ProcessDirectory {
    /// Whether per-process CPU bindings can be queried at all
    fn supports_affinity(&self) -> bool {
        true
    }

    /// Identifiers of live processes. The sequence is lazy and may be
    /// requested again for a fresh snapshot.
    fn pids(&self) -> Result<Box<dyn Iterator<Item = u32> + '_>, ProcessError>;

    /// Current CPU binding of a process
    fn affinity(&self, pid: u32) -> Result<CpuSet, ProcessError>;

    /// First token of the command line; empty for kernel threads
    fn command_line(&self, pid: u32) -> Result<String, ProcessError>;
}

/// `/proc` reader rooted at a configurable directory
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn process_file(&self, pid: u32, name: &str) -> PathBuf {
        self.root.join(pid.to_string()).join(name)
    }
}

impl ProcessDirectory for ProcFs {
    fn supports_affinity(&self) -> bool {
        cfg!(target_os = "linux")
    }

    fn pids(&self) -> Result<Box<dyn Iterator<Item = u32> + '_>, ProcessError> {
        let entries = std::fs::read_dir(&self.root)
            .map_err(|e| ProcessError::Unavailable(format!("{}: {}", self.root.display(), e)))?;
        Ok(Box::new(entries.filter_map(|entry| {
            entry.ok()?.file_name().to_str()?.parse::<u32>().ok()
        })))
    }

    fn affinity(&self, pid: u32) -> Result<CpuSet, ProcessError> {
        let status = std::fs::read_to_string(self.process_file(pid, "status"))?;
        parse_allowed_list(&status, pid)
    }

    fn command_line(&self, pid: u32) -> Result<String, ProcessError> {
        let raw = std::fs::read(self.process_file(pid, "cmdline"))?;
        Ok(first_command_token(&raw))
    }
}

/// Extract `Cpus_allowed_list` from the content of a status file
fn parse_allowed_list(status: &str, pid: u32) -> Result<CpuSet, ProcessError> {
    let list = status
        .lines()
        .find_map(|line| line.strip_prefix("Cpus_allowed_list:"))
        .ok_or(ProcessError::MissingAffinity(pid))?;
    CpuSet::parse_list(list).map_err(|source| ProcessError::InvalidAffinity { pid, source })
}

/// First NUL- or whitespace-delimited token of a raw cmdline, bounded in length
fn first_command_token(raw: &[u8]) -> String {
    let first = raw.split(|&b| b == 0).next().unwrap_or_default();
    let text = String::from_utf8_lossy(first);
    let token = text.split_whitespace().next().unwrap_or_default();

    let mut end = token.len().min(MAX_COMMAND_LEN);
    while !token.is_char_boundary(end) {
        end -= 1;
    }
    token[..end].to_string()
}

/// Options of a process attachment pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessOptions {
    /// Keep processes without a command line (kernel threads)
    pub include_kernel_threads: bool,
}

/// Sample one process, or `None` when it should be skipped
fn sample_process<D>(directory: &D, pid: u32, options: &ProcessOptions) -> Option<ProcessRecord>
where
    D: ProcessDirectory + ?Sized,
{
    let command = match directory.command_line(pid) {
        Ok(command) if command.is_empty() && !options.include_kernel_threads => {
            trace!(pid, "Skipping kernel thread");
            return None;
        }
        Ok(command) if command.is_empty() => None,
        Ok(command) => Some(command),
        Err(e) => {
            trace!(pid, error = %e, "Command line unavailable, labelling by pid");
            None
        }
    };

    match directory.affinity(pid) {
        Ok(cpuset) => Some(ProcessRecord { pid, command, cpuset }),
        Err(e) => {
            trace!(pid, error = %e, "Skipping process without readable binding");
            None
        }
    }
}

/// Enumerate live processes and attach those bound to part of the machine.
///
/// Missing capabilities make this a no-op. Processes that vanish or cannot
/// be queried are skipped and counted in the report.
pub fn attach_running_processes<D>(
    topology: &mut Topology,
    directory: &D,
    options: &ProcessOptions,
) -> Result<ProcessAttachReport, AttachError>
where
    D: ProcessDirectory + ?Sized,
{
    if !directory.supports_affinity() {
        debug!("Process binding queries unsupported, not adding processes");
        return Ok(ProcessAttachReport::default());
    }

    let pids = match directory.pids() {
        Ok(pids) => pids,
        Err(e) => {
            debug!(error = %e, "Cannot enumerate processes");
            return Ok(ProcessAttachReport::default());
        }
    };

    let mut records = Vec::new();
    let mut unreadable = 0;
    for pid in pids {
        match sample_process(directory, pid, options) {
            Some(record) => records.push(record),
            None => unreadable += 1,
        }
    }

    let mut report = attach_processes(topology, records)?;
    report.skipped += unreadable;
    debug!(
        attached = report.attached,
        skipped = report.skipped,
        "Added running processes"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::{synthetic, ObjectKind};
    use std::fs;

    fn write_process(root: &Path, pid: u32, cmdline: &[u8], allowed: Option<&str>) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("cmdline"), cmdline).unwrap();
        let mut status = format!("Name:\tproc{}\nPid:\t{}\n", pid, pid);
        if let Some(list) = allowed {
            status.push_str(&format!("Cpus_allowed:\tff\nCpus_allowed_list:\t{}\n", list));
        }
        fs::write(dir.join("status"), status).unwrap();
    }

    #[test]
    fn test_first_command_token() {
        assert_eq!(first_command_token(b"/usr/bin/python3\0-m\0http.server\0"), "/usr/bin/python3");
        assert_eq!(first_command_token(b"nginx: worker process\0"), "nginx:");
        assert_eq!(first_command_token(b""), "");
        assert_eq!(first_command_token(&[b'a'; 100]).len(), MAX_COMMAND_LEN);
    }

    #[test]
    fn test_parse_allowed_list() {
        let status = "Name:\tbash\nCpus_allowed:\t0f\nCpus_allowed_list:\t0-3\n";
        assert_eq!(parse_allowed_list(status, 1).unwrap(), CpuSet::from_range(0, 3));
        assert!(matches!(
            parse_allowed_list("Name:\tbash\n", 1),
            Err(ProcessError::MissingAffinity(1))
        ));
    }

    #[test]
    fn test_procfs_fixture() {
        let dir = tempfile::tempdir().unwrap();
        write_process(dir.path(), 10, b"/bin/bound\0--flag\0", Some("2-3"));
        fs::create_dir_all(dir.path().join("self")).unwrap();
        fs::write(dir.path().join("meminfo"), "MemTotal: 1 kB\n").unwrap();

        let procfs = ProcFs::new(dir.path());
        let pids: Vec<u32> = procfs.pids().unwrap().collect();
        assert_eq!(pids, vec![10]);
        assert_eq!(procfs.affinity(10).unwrap(), CpuSet::from_range(2, 3));
        assert_eq!(procfs.command_line(10).unwrap(), "/bin/bound");
        assert!(procfs.affinity(11).is_err());
    }

    #[test]
    fn test_attach_running_processes() {
        let dir = tempfile::tempdir().unwrap();
        write_process(dir.path(), 1, b"/sbin/init\0", Some("0-7"));
        write_process(dir.path(), 2, b"", Some("0-7"));
        write_process(dir.path(), 300, b"/bin/bound\0", Some("2-3"));
        write_process(dir.path(), 301, b"/bin/broken\0", None);

        let mut topology = synthetic::build("package:2 core:2 pu:2").unwrap();
        let report = attach_running_processes(
            &mut topology,
            &ProcFs::new(dir.path()),
            &ProcessOptions::default(),
        )
        .unwrap();

        assert_eq!(report.attached, 1);
        assert_eq!(report.skipped, 3);

        let process = topology.objects_of_kind(ObjectKind::Process)[0];
        assert_eq!(topology[process].name.as_deref(), Some("300 /bin/bound"));
        let parent = topology.parent(process).unwrap();
        assert_eq!(topology[parent].kind, ObjectKind::Core);
        assert_eq!(topology[parent].cpuset, CpuSet::from_range(2, 3));
    }

    #[test]
    fn test_kernel_threads_can_be_included() {
        let dir = tempfile::tempdir().unwrap();
        write_process(dir.path(), 5, b"", Some("1"));

        let mut topology = synthetic::build("core:2 pu:2").unwrap();
        let report = attach_running_processes(
            &mut topology,
            &ProcFs::new(dir.path()),
            &ProcessOptions {
                include_kernel_threads: true,
            },
        )
        .unwrap();
        assert_eq!(report.attached, 1);
        let process = topology.objects_of_kind(ObjectKind::Process)[0];
        assert_eq!(topology[process].name.as_deref(), Some("5"));
    }

    #[test]
    fn test_missing_directory_is_a_no_op() {
        let mut topology = synthetic::build("core:2 pu:2").unwrap();
        let report = attach_running_processes(
            &mut topology,
            &ProcFs::new("/nonexistent/arbor-proc"),
            &ProcessOptions::default(),
        )
        .unwrap();
        assert_eq!(report, ProcessAttachReport::default());
        assert_eq!(topology.len(), 7);
    }
}
