//! Renderer backends
//!
//! Renderers read the topology and never modify it. Each writes to a file
//! or to standard output.

mod console;
mod xml;

pub use console::{ConsoleRenderer, TextRenderer};
pub use xml::XmlRenderer;

use arbor_core::{ObjectKind, Topology, XmlError};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use crate::format::Backend;

/// Default verbosity of textual output
pub const DEFAULT_VERBOSITY: i32 = 1;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Output format {0} is not supported by this build")]
    Unsupported(Backend),
    #[error("Failed to write output: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Xml(#[from] XmlError),
}

/// How cpusets are shown next to objects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CpusetDisplay {
    #[default]
    Hidden,
    Shown,
    /// Only the cpuset, without the object description
    Only,
}

/// Display settings shared by all renderers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    /// Logical (`L#`) rather than OS (`P#`) indices
    pub logical: bool,
    pub verbosity: i32,
    pub cpuset: CpusetDisplay,
    /// Print cpusets as taskset masks
    pub taskset: bool,
    /// Only list objects of this kind
    pub only: Option<ObjectKind>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            logical: true,
            verbosity: DEFAULT_VERBOSITY,
            cpuset: CpusetDisplay::Hidden,
            taskset: false,
            only: None,
        }
    }
}

impl RenderOptions {
    /// Options that only make sense for textual output
    pub fn implies_textual(&self) -> bool {
        self.cpuset != CpusetDisplay::Hidden || self.only.is_some() || self.verbosity != DEFAULT_VERBOSITY
    }
}

pub trait Renderer {
    fn render(&self, topology: &Topology, options: &RenderOptions, out: &mut dyn Write) -> Result<(), RenderError>;
}

fn renderer_for(backend: Backend) -> Result<Box<dyn Renderer>, RenderError> {
    match backend {
        Backend::Console => Ok(Box::new(ConsoleRenderer)),
        Backend::Text => Ok(Box::new(TextRenderer)),
        Backend::Xml => Ok(Box::new(XmlRenderer)),
        other => Err(RenderError::Unsupported(other)),
    }
}

/// Render with `backend` to `target`, or standard output when `None`
pub fn render(
    backend: Backend,
    topology: &Topology,
    options: &RenderOptions,
    target: Option<&Path>,
) -> Result<(), RenderError> {
    let renderer = renderer_for(backend)?;
    debug!(backend = %backend, target = ?target, "Rendering topology");

    match target {
        Some(path) => {
            let mut out = BufWriter::new(File::create(path)?);
            renderer.render(topology, options, &mut out)?;
            out.flush()?;
        }
        None => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            renderer.render(topology, options, &mut out)?;
            out.flush()?;
        }
    }
    Ok(())
}
