//! Output format negotiation
//!
//! The backend is chosen from, in order: an explicit format token, the
//! extension of the output filename, flags that imply textual output, and
//! finally the environment (a display when graphical output is built in).

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// Whether this build can draw graphical output
pub const GRAPHICAL_SUPPORT: bool = false;

/// Filenames that name the standard output stream
const STDOUT_ALIASES: &[&str] = &["-", "/dev/stdout"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("Unrecognized output format `{0}`")]
    UnknownFormat(String),
    #[error("Cannot infer output format from `{filename}`: unsupported extension")]
    UnsupportedExtension { filename: String },
}

/// A format as named on the command line or by a file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Default,
    Console,
    Text,
    Fig,
    Png,
    Pdf,
    Ps,
    Svg,
    Xml,
}

impl FromStr for OutputFormat {
    type Err = FormatError;

    /// `default` and `console` match on their first three letters, the
    /// other tokens exactly. Case is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.to_ascii_lowercase();
        let prefix_of = |full: &str| token.get(..3).is_some_and(|prefix| full.starts_with(prefix));
        if prefix_of("default") {
            return Ok(OutputFormat::Default);
        }
        if prefix_of("console") {
            return Ok(OutputFormat::Console);
        }
        match token.as_str() {
            "txt" => Ok(OutputFormat::Text),
            "fig" => Ok(OutputFormat::Fig),
            "png" => Ok(OutputFormat::Png),
            "pdf" => Ok(OutputFormat::Pdf),
            "ps" => Ok(OutputFormat::Ps),
            "svg" => Ok(OutputFormat::Svg),
            "xml" => Ok(OutputFormat::Xml),
            _ => Err(FormatError::UnknownFormat(s.to_string())),
        }
    }
}

impl OutputFormat {
    /// Concrete backend, `None` for `Default`
    fn backend(self) -> Option<Backend> {
        match self {
            OutputFormat::Default => None,
            OutputFormat::Console => Some(Backend::Console),
            OutputFormat::Text => Some(Backend::Text),
            OutputFormat::Fig => Some(Backend::Fig),
            OutputFormat::Png => Some(Backend::Png),
            OutputFormat::Pdf => Some(Backend::Pdf),
            OutputFormat::Ps => Some(Backend::Ps),
            OutputFormat::Svg => Some(Backend::Svg),
            OutputFormat::Xml => Some(Backend::Xml),
        }
    }
}

/// Renderer selected for one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Interactive window on the current display
    Display,
    Console,
    Text,
    Fig,
    Png,
    Pdf,
    Ps,
    Svg,
    Xml,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Display => "display",
            Backend::Console => "console",
            Backend::Text => "txt",
            Backend::Fig => "fig",
            Backend::Png => "png",
            Backend::Pdf => "pdf",
            Backend::Ps => "ps",
            Backend::Svg => "svg",
            Backend::Xml => "xml",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the user asked for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputRequest {
    /// Explicit format token
    pub format: Option<String>,
    /// Output filename
    pub filename: Option<String>,
    /// Cpuset display, `--only` or a non-default verbosity was requested
    pub textual_hint: bool,
}

/// Signals from the environment the tool runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Environment {
    pub display_available: bool,
    pub graphical_support: bool,
}

impl Environment {
    pub fn detect() -> Self {
        let display_available = ["DISPLAY", "WAYLAND_DISPLAY"]
            .iter()
            .any(|var| std::env::var_os(var).is_some_and(|v| !v.is_empty()));
        Self {
            display_available,
            graphical_support: GRAPHICAL_SUPPORT,
        }
    }
}

/// Negotiated backend and destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPlan {
    pub backend: Backend,
    /// Destination file, `None` for standard output
    pub target: Option<PathBuf>,
}

pub fn is_stdout_alias(filename: &str) -> bool {
    STDOUT_ALIASES.contains(&filename)
}

/// `-` followed by a single extension (`-.xml`) writes to standard output
/// but still selects a format
fn is_stdout_with_extension(filename: &str) -> bool {
    filename
        .strip_prefix("-.")
        .is_some_and(|ext| !ext.is_empty() && !ext.contains('.'))
}

/// Text after the last `.` of the whole filename, dotfiles included
fn extension_of(filename: &str) -> Option<&str> {
    filename.rsplit_once('.').map(|(_, extension)| extension)
}

fn target_of(filename: Option<&str>) -> Option<PathBuf> {
    filename
        .filter(|f| !is_stdout_alias(f) && !is_stdout_with_extension(f))
        .map(PathBuf::from)
}

/// Choose the backend for `request`. Errors are configuration errors.
pub fn negotiate(request: &OutputRequest, env: &Environment) -> Result<OutputPlan, FormatError> {
    let filename = request.filename.as_deref();
    let plan = |backend: Backend| OutputPlan {
        backend,
        target: target_of(filename),
    };

    // 1. explicit token
    if let Some(token) = request.format.as_deref() {
        if let Some(backend) = token.parse::<OutputFormat>()?.backend() {
            debug!(backend = %backend, "Output format given explicitly");
            return Ok(plan(backend));
        }
    }

    // 2. filename extension, when the name has a dot at all
    if let Some((name, extension)) = filename
        .filter(|f| !is_stdout_alias(f))
        .and_then(|f| Some((f, extension_of(f)?)))
    {
        let format: OutputFormat = extension
            .parse()
            .map_err(|_| FormatError::UnsupportedExtension {
                filename: name.to_string(),
            })?;
        if let Some(backend) = format.backend() {
            debug!(backend = %backend, filename = name, "Output format inferred from extension");
            return Ok(plan(backend));
        }
    }

    // 3. flags implying machine-oriented output
    if request.textual_hint {
        return Ok(plan(Backend::Console));
    }

    // 4. richest backend available
    if env.display_available && env.graphical_support {
        return Ok(plan(Backend::Display));
    }
    Ok(plan(Backend::Console))
}
