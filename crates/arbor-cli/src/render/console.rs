//! Indented tree output for terminals and text files

use arbor_core::{CpuSet, ObjectId, ObjectKind, Topology};
use std::collections::HashMap;
use std::io::Write;

use super::{CpusetDisplay, RenderError, RenderOptions, Renderer};

/// Plain indented tree
pub struct ConsoleRenderer;

/// Indented tree under a summary header
pub struct TextRenderer;

fn format_cpuset(cpuset: &CpuSet, options: &RenderOptions) -> String {
    if options.taskset {
        cpuset.to_taskset_string()
    } else {
        cpuset.to_string()
    }
}

/// One-line description of an object
fn describe(
    topology: &Topology,
    id: ObjectId,
    indices: &HashMap<ObjectId, usize>,
    options: &RenderOptions,
) -> String {
    let object = &topology[id];
    if options.cpuset == CpusetDisplay::Only {
        return format_cpuset(&object.cpuset, options);
    }

    let mut line = object.kind.as_str().to_string();

    if options.verbosity >= 1 {
        if options.logical {
            if let Some(index) = indices.get(&id) {
                line.push_str(&format!(" L#{}", index));
            }
        } else if let Some(os_index) = object.os_index {
            line.push_str(&format!(" P#{}", os_index));
        }
    }

    if let Some(name) = &object.name {
        line.push_str(&format!(" \"{}\"", name));
    }

    if options.verbosity >= 2 && !object.infos.is_empty() {
        let infos: Vec<String> = object
            .infos
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        line.push_str(&format!(" ({})", infos.join(" ")));
    }

    if options.cpuset == CpusetDisplay::Shown {
        line.push_str(&format!(" cpuset={}", format_cpuset(&object.cpuset, options)));
    }

    line
}

fn write_tree(topology: &Topology, options: &RenderOptions, out: &mut dyn Write) -> Result<(), RenderError> {
    let indices = topology.logical_indices();

    if let Some(kind) = options.only {
        for id in topology.objects_of_kind(kind) {
            writeln!(out, "{}", describe(topology, id, &indices, options))?;
        }
        return Ok(());
    }

    for id in topology.depth_first() {
        let indent = "  ".repeat(topology.depth(id));
        writeln!(out, "{}{}", indent, describe(topology, id, &indices, options))?;
    }
    Ok(())
}

impl Renderer for ConsoleRenderer {
    fn render(&self, topology: &Topology, options: &RenderOptions, out: &mut dyn Write) -> Result<(), RenderError> {
        write_tree(topology, options, out)
    }
}

impl Renderer for TextRenderer {
    fn render(&self, topology: &Topology, options: &RenderOptions, out: &mut dyn Write) -> Result<(), RenderError> {
        let pus = topology.objects_of_kind(ObjectKind::Pu).len();
        let header = format!(
            "Machine topology: {} processing units, {} objects",
            pus,
            topology.len()
        );
        writeln!(out, "{}", header)?;
        writeln!(out, "{}", "=".repeat(header.len()))?;
        write_tree(topology, options, out)
    }
}
