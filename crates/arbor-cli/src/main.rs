//! Arbor - Main entry point
//!
//! Loads a hardware topology, optionally attaches DRM devices and running
//! processes to it, and renders the result.

mod config;
mod format;
mod render;

use anyhow::{Context, Result};
use arbor_core::{CacheFilter, FilterOptions, ObjectKind, Topology};
use arbor_discovery::{
    attach_running_processes, attach_runtime_devices, load_topology, DrmRuntime, InputFormat,
    LoadOptions, ProcFs, ProcessOptions,
};
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::{Config, DisplayConfig};
use format::{Environment, OutputRequest};
use render::{CpusetDisplay, RenderOptions};

#[derive(Parser, Debug)]
#[command(name = "arbor")]
#[command(about = "Show the hardware topology of this machine with its devices and processes")]
#[command(version)]
struct Args {
    /// Output file; its extension selects the format ("-" for standard output)
    filename: Option<String>,

    /// Display logical object indices (default)
    #[arg(short = 'l', long, overrides_with = "physical")]
    logical: bool,

    /// Display OS object indices
    #[arg(short = 'p', long, overrides_with = "logical")]
    physical: bool,

    /// Increase verbosity (repeatable)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Decrease verbosity (repeatable)
    #[arg(short, long, action = ArgAction::Count)]
    silent: u8,

    /// Show the cpuset of each object
    #[arg(short = 'c', long)]
    cpuset: bool,

    /// Only show the cpuset of each object
    #[arg(short = 'C', long)]
    cpuset_only: bool,

    /// Show cpusets as taskset masks
    #[arg(long)]
    taskset: bool,

    /// Only show objects of the given type
    #[arg(long, value_name = "TYPE")]
    only: Option<String>,

    /// Ignore objects of the given type (repeatable)
    #[arg(long, value_name = "TYPE")]
    ignore: Vec<String>,

    /// Do not show caches
    #[arg(long)]
    no_caches: bool,

    /// Do not show caches that do not add hierarchy
    #[arg(long)]
    no_useless_caches: bool,

    /// Do not show levels that do not add hierarchy
    #[arg(long)]
    merge: bool,

    /// Read the topology from an XML file, a sysfs root or a synthetic description
    #[arg(short, long)]
    input: Option<String>,

    /// Input format: xml, synthetic or fsroot
    #[arg(long = "input-format", visible_alias = "if", value_name = "FORMAT")]
    input_format: Option<String>,

    /// Restrict the topology to the binding of this process
    #[arg(long)]
    pid: Option<u32>,

    /// Keep CPUs this process is not allowed to use
    #[arg(long)]
    whole_system: bool,

    /// Show processes bound to part of the machine
    #[arg(long = "ps", visible_alias = "top")]
    processes: bool,

    /// Show DRM render nodes
    #[arg(long)]
    devices: bool,

    /// Output format, overriding the filename extension
    #[arg(long = "output-format", visible_alias = "of", value_name = "FORMAT")]
    output_format: Option<String>,

    /// Path to configuration file
    #[arg(long, default_value = "arbor.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn parse_kind(value: &str, flag: &str) -> Result<ObjectKind> {
    value
        .parse()
        .with_context(|| format!("Invalid object type for --{}", flag))
}

/// Merge command-line flags over the configuration file
fn build_config(args: Args, file: Config) -> Result<DisplayConfig> {
    let logical = if args.physical {
        false
    } else if args.logical {
        true
    } else {
        file.display.logical
    };

    let cpuset = if args.cpuset_only {
        CpusetDisplay::Only
    } else if args.cpuset || args.taskset {
        CpusetDisplay::Shown
    } else {
        CpusetDisplay::Hidden
    };

    let only = args
        .only
        .as_deref()
        .map(|value| parse_kind(value, "only"))
        .transpose()?;

    let render = RenderOptions {
        logical,
        verbosity: file.display.verbosity + i32::from(args.verbose) - i32::from(args.silent),
        cpuset,
        taskset: args.taskset,
        only,
    };

    let ignore = args
        .ignore
        .iter()
        .map(|value| parse_kind(value, "ignore"))
        .collect::<Result<Vec<_>>>()?;
    let caches = if args.no_caches {
        CacheFilter::All
    } else if args.no_useless_caches {
        CacheFilter::Useless
    } else {
        CacheFilter::Keep
    };

    let format = args
        .input_format
        .or(file.input.format)
        .map(|value| value.parse::<InputFormat>())
        .transpose()
        .context("Invalid input format")?;

    let load = LoadOptions {
        input: args.input.or(file.input.path),
        format,
        whole_system: args.whole_system || file.input.whole_system,
        pid: args.pid,
        filters: FilterOptions {
            ignore,
            caches,
            merge: args.merge && only.is_none(),
        },
    };

    let output = OutputRequest {
        format: args.output_format,
        filename: args.filename,
        textual_hint: render.implies_textual(),
    };

    Ok(DisplayConfig {
        load,
        render,
        output,
        attach_processes: args.processes || file.augment.processes,
        process_options: ProcessOptions {
            include_kernel_threads: file.augment.include_kernel_threads,
        },
        attach_devices: args.devices || file.augment.devices,
        drm_root: file.augment.drm_root,
        proc_root: file.augment.proc_root,
    })
}

fn init_logging(level: &str) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(LevelFilter::from_level(level).into()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Load, augment and render according to `config`
fn run(config: &DisplayConfig, env: &Environment) -> Result<()> {
    // Format errors are reported before anything is loaded
    let plan = format::negotiate(&config.output, env)?;
    debug!(backend = %plan.backend, target = ?plan.target, "Output negotiated");

    let procfs = ProcFs::new(&config.proc_root);
    let mut topology = load_topology(&config.load, &procfs).context("Failed to load topology")?;
    info!(objects = topology.len(), "Topology loaded");

    augment(&mut topology, config, &procfs);

    render::render(plan.backend, &topology, &config.render, plan.target.as_deref())
        .context("Failed to render topology")?;
    Ok(())
}

/// Attach devices and processes. Failures stop a pass but keep what it
/// already attached.
fn augment(topology: &mut Topology, config: &DisplayConfig, procfs: &ProcFs) {
    if config.attach_devices {
        let mut runtime = DrmRuntime::new(&config.drm_root);
        if let Err(e) = attach_runtime_devices(topology, &mut runtime) {
            warn!(error = %e, "Device attachment stopped early");
        }
    }

    if config.attach_processes {
        match attach_running_processes(topology, procfs, &config.process_options) {
            Ok(report) => info!(
                attached = report.attached,
                skipped = report.skipped,
                "Processes attached"
            ),
            Err(e) => warn!(error = %e, "Process attachment stopped early"),
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    info!("Arbor v{}", env!("CARGO_PKG_VERSION"));

    let file_config = config::load_config(&args.config)?;
    let config = build_config(args, file_config)?;

    run(&config, &Environment::detect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::xml;
    use std::fs;

    const HEADLESS: Environment = Environment {
        display_available: false,
        graphical_support: false,
    };

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("arbor").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = build_config(parse(&[]), Config::default()).unwrap();
        assert_eq!(config.render, RenderOptions::default());
        assert_eq!(config.load, LoadOptions::default());
        assert!(!config.output.textual_hint);
        assert!(!config.attach_processes);
        assert!(!config.attach_devices);
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = Config::default();
        file.display.logical = true;
        file.input.path = Some("core:2 pu:1".to_string());

        let config = build_config(
            parse(&["-p", "-v", "-v", "-s", "--input", "package:2 pu:2", "--if", "synthetic"]),
            file,
        )
        .unwrap();
        assert!(!config.render.logical);
        assert_eq!(config.render.verbosity, 2);
        assert_eq!(config.load.input.as_deref(), Some("package:2 pu:2"));
        assert_eq!(config.load.format, Some(InputFormat::Synthetic));
        assert!(config.output.textual_hint);
    }

    #[test]
    fn test_last_index_flag_wins() {
        let config = build_config(parse(&["-p", "-l"]), Config::default()).unwrap();
        assert!(config.render.logical);
    }

    #[test]
    fn test_cpuset_flags() {
        let config = build_config(parse(&["--taskset"]), Config::default()).unwrap();
        assert_eq!(config.render.cpuset, CpusetDisplay::Shown);
        assert!(config.render.taskset);
        assert!(config.output.textual_hint);

        let config = build_config(parse(&["-c", "-C"]), Config::default()).unwrap();
        assert_eq!(config.render.cpuset, CpusetDisplay::Only);
    }

    #[test]
    fn test_filters() {
        let config = build_config(
            parse(&["--ignore", "core", "--ignore", "l2", "--no-useless-caches", "--merge"]),
            Config::default(),
        )
        .unwrap();
        assert_eq!(config.load.filters.ignore, vec![ObjectKind::Core, ObjectKind::L2Cache]);
        assert_eq!(config.load.filters.caches, CacheFilter::Useless);
        assert!(config.load.filters.merge);

        let config = build_config(parse(&["--only", "pu", "--merge"]), Config::default()).unwrap();
        assert_eq!(config.render.only, Some(ObjectKind::Pu));
        assert!(!config.load.filters.merge);
    }

    #[test]
    fn test_invalid_values() {
        assert!(build_config(parse(&["--only", "gizmo"]), Config::default()).is_err());
        assert!(build_config(parse(&["--if", "json"]), Config::default()).is_err());
    }

    #[test]
    fn test_aliases() {
        let config = build_config(parse(&["--top", "--of", "xml"]), Config::default()).unwrap();
        assert!(config.attach_processes);
        assert_eq!(config.output.format.as_deref(), Some("xml"));
    }

    #[test]
    fn test_run_writes_xml_with_processes() {
        let dir = tempfile::tempdir().unwrap();
        let proc_root = dir.path().join("proc");
        let process = proc_root.join("4242");
        fs::create_dir_all(&process).unwrap();
        fs::write(process.join("cmdline"), b"/usr/bin/worker\0").unwrap();
        fs::write(process.join("status"), "Name:\tworker\nCpus_allowed_list:\t4-5\n").unwrap();

        let output = dir.path().join("topo.xml");
        let mut file = Config::default();
        file.augment.proc_root = proc_root;
        let config = build_config(
            parse(&["--input", "package:2 core:2 pu:2", "--ps", output.to_str().unwrap()]),
            file,
        )
        .unwrap();

        run(&config, &HEADLESS).unwrap();

        let topology = xml::from_file(&output).unwrap();
        let processes = topology.objects_of_kind(ObjectKind::Process);
        assert_eq!(processes.len(), 1);
        assert_eq!(topology[processes[0]].name.as_deref(), Some("4242 /usr/bin/worker"));
        let core = topology.parent(processes[0]).unwrap();
        assert_eq!(topology[core].kind, ObjectKind::Core);
    }

    #[test]
    fn test_interrupted_attachment_still_renders() {
        let dir = tempfile::tempdir().unwrap();
        let proc_root = dir.path().join("proc");
        for (pid, allowed) in [(100, "4-5"), (200, "6-7")] {
            let process = proc_root.join(pid.to_string());
            fs::create_dir_all(&process).unwrap();
            fs::write(process.join("cmdline"), b"/usr/bin/worker\0").unwrap();
            fs::write(process.join("status"), format!("Cpus_allowed_list:\t{}\n", allowed)).unwrap();
        }

        let mut file = Config::default();
        file.augment.proc_root = proc_root.clone();
        let config = build_config(parse(&["--input", "package:2 core:2 pu:2", "--ps"]), file).unwrap();

        let procfs = ProcFs::new(&proc_root);
        let mut topology = load_topology(&config.load, &procfs).unwrap();
        topology.set_object_limit(Some(topology.len() + 1));
        augment(&mut topology, &config, &procfs);
        assert_eq!(topology.objects_of_kind(ObjectKind::Process).len(), 1);

        let output = dir.path().join("topo.xml");
        render::render(format::Backend::Xml, &topology, &config.render, Some(output.as_path())).unwrap();
        let rendered = xml::from_file(&output).unwrap();
        let processes = rendered.objects_of_kind(ObjectKind::Process);
        assert_eq!(processes.len(), 1);
        let name = rendered[processes[0]].name.clone().unwrap();
        assert!(name == "100 /usr/bin/worker" || name == "200 /usr/bin/worker");
    }

    #[test]
    fn test_run_rejects_bad_extension_before_loading() {
        let config = build_config(
            parse(&["--input", "not a valid description", "out.jpeg"]),
            Config::default(),
        )
        .unwrap();
        let error = run(&config, &HEADLESS).unwrap_err();
        assert!(error.downcast_ref::<format::FormatError>().is_some());
    }

    #[test]
    fn test_run_unsupported_backend() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("topo.png");
        let config = build_config(
            parse(&["--input", "core:2 pu:1", output.to_str().unwrap()]),
            Config::default(),
        )
        .unwrap();
        assert!(run(&config, &HEADLESS).is_err());
        assert!(!output.exists());
    }
}
