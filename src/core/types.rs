//! SR-001: Core types — module descriptors, configuration, options, statuses.
//!
//! Defines the YAML schema types for `module.yaml` and `stackrun.yaml`, the
//! resolved module descriptor, command kinds and per-module execution status.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// File name of a module definition inside a module directory.
pub const MODULE_FILE: &str = "module.yaml";

/// File name of the optional run configuration in the working directory.
pub const RUN_CONFIG_FILE: &str = "stackrun.yaml";

// ============================================================================
// module.yaml
// ============================================================================

/// Per-module configuration, as produced by the configuration collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Provisioning source. A module without one has no deployable unit.
    #[serde(default)]
    pub source: Option<String>,

    /// Declared dependency paths, relative to the module directory
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Retry policy for transient failures
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Per-module timeout in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ModuleConfig {
    /// Whether this module declares something to provision.
    pub fn is_deployable(&self) -> bool {
        self.source.is_some()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Retry policy for a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Sleep between attempts, in seconds
    #[serde(default = "default_sleep_interval")]
    pub sleep_interval_secs: u64,

    /// Regular expressions matched against failure output
    #[serde(default)]
    pub retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            sleep_interval_secs: default_sleep_interval(),
            retryable_errors: Vec::new(),
        }
    }
}

impl RetryPolicy {
    pub fn sleep_interval(&self) -> Duration {
        Duration::from_secs(self.sleep_interval_secs)
    }

    /// Compile the retryable error patterns.
    pub fn matcher(&self) -> Result<regex::RegexSet, regex::Error> {
        regex::RegexSet::new(&self.retryable_errors)
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_sleep_interval() -> u64 {
    5
}

// ============================================================================
// Modules
// ============================================================================

/// A resolved module: one unit of provisioning work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    /// Canonical absolute module directory (unique key)
    pub path: PathBuf,

    /// Canonical paths of modules this one depends on
    pub dependencies: Vec<PathBuf>,

    /// Known but never executed
    pub excluded: bool,

    /// Already satisfied externally; ordered but never executed
    pub assume_already_applied: bool,

    /// Configuration read for this module
    pub config: ModuleConfig,
}

impl Module {
    /// A bare module with the given dependencies, used when building stacks by hand.
    pub fn new(path: impl Into<PathBuf>, dependencies: Vec<PathBuf>) -> Self {
        Self {
            path: path.into(),
            dependencies,
            excluded: false,
            assume_already_applied: false,
            config: ModuleConfig {
                source: Some(".".to_string()),
                ..ModuleConfig::default()
            },
        }
    }

    /// Whether the executor may dispatch this module.
    pub fn is_runnable(&self) -> bool {
        !self.excluded && !self.assume_already_applied
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

// ============================================================================
// Resolution options
// ============================================================================

/// What to do when a kept module depends on a module without a deployable unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonDeployablePolicy {
    /// Keep it in the graph, marked already applied.
    #[default]
    AssumeApplied,
    /// Fail resolution.
    Reject,
}

/// Include/exclude and external-dependency policy for resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Working directory; relative locations and patterns are joined to it
    pub working_dir: PathBuf,
    pub include_dirs: Vec<String>,
    pub exclude_dirs: Vec<String>,
    pub exclude_by_default: bool,
    /// Do not re-include dependencies of included modules
    pub strict_include: bool,
    /// Mark every transitively reached module as already applied
    pub ignore_external_dependencies: bool,
    pub non_deployable: NonDeployablePolicy,
}

// ============================================================================
// stackrun.yaml
// ============================================================================

/// Run configuration loaded from `stackrun.yaml` and overridden by CLI flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Maximum modules running at once
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Provisioning binary
    #[serde(default = "default_binary")]
    pub binary: String,

    #[serde(default)]
    pub include_dirs: Vec<String>,

    #[serde(default)]
    pub exclude_dirs: Vec<String>,

    #[serde(default)]
    pub exclude_by_default: bool,

    #[serde(default)]
    pub strict_include: bool,

    #[serde(default)]
    pub ignore_external_dependencies: bool,

    /// Run dependents even when a dependency failed
    #[serde(default)]
    pub ignore_dependency_errors: bool,

    /// Run every module in a single level
    #[serde(default)]
    pub ignore_dependency_order: bool,

    #[serde(default)]
    pub non_deployable_dependencies: NonDeployablePolicy,

    /// Cancel all pending work on the first failure
    #[serde(default)]
    pub fail_fast: bool,

    /// Default per-module timeout in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            binary: default_binary(),
            include_dirs: Vec::new(),
            exclude_dirs: Vec::new(),
            exclude_by_default: false,
            strict_include: false,
            ignore_external_dependencies: false,
            ignore_dependency_errors: false,
            ignore_dependency_order: false,
            non_deployable_dependencies: NonDeployablePolicy::default(),
            fail_fast: false,
            timeout_secs: None,
        }
    }
}

impl RunConfig {
    /// Resolution options rooted at `working_dir`.
    pub fn resolve_options(&self, working_dir: PathBuf) -> ResolveOptions {
        ResolveOptions {
            working_dir,
            include_dirs: self.include_dirs.clone(),
            exclude_dirs: self.exclude_dirs.clone(),
            exclude_by_default: self.exclude_by_default,
            strict_include: self.strict_include,
            ignore_external_dependencies: self.ignore_external_dependencies,
            non_deployable: self.non_deployable_dependencies,
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_binary() -> String {
    "terraform".to_string()
}

// ============================================================================
// Commands
// ============================================================================

/// Ordering class of a provisioning command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Dependencies first (apply, import, refresh ...)
    Apply,
    /// Dependents first
    Destroy,
    /// Anything else; ordered like `Apply`
    Other,
}

impl CommandKind {
    /// Classify a provisioning command line (`["apply", "-destroy"]` etc.).
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Self {
        let Some(command) = args.first().map(AsRef::as_ref) else {
            return Self::Other;
        };
        let destroy_flag = args.iter().any(|a| a.as_ref() == "-destroy");
        match command {
            "destroy" => Self::Destroy,
            "apply" | "plan" if destroy_flag => Self::Destroy,
            "apply" => Self::Apply,
            _ => Self::Other,
        }
    }

    pub fn is_destroy(self) -> bool {
        self == Self::Destroy
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apply => write!(f, "apply"),
            Self::Destroy => write!(f, "destroy"),
            Self::Other => write!(f, "other"),
        }
    }
}

// ============================================================================
// Execution status
// ============================================================================

/// Why a module ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The tool exited non-zero
    ExitCode { code: i32, stderr: String },
    /// The tool could not be started or awaited
    Transport(String),
    /// The per-module timeout elapsed
    Timeout(Duration),
    /// The run was cancelled while the module was in flight
    Cancelled,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExitCode { code, stderr } if stderr.trim().is_empty() => {
                write!(f, "exit code {}", code)
            }
            Self::ExitCode { code, stderr } => write!(f, "exit code {}: {}", code, stderr.trim()),
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::Timeout(d) => write!(f, "timed out after {}s", d.as_secs()),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Why a module ended in `Skipped`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipCause {
    /// A module it is ordered after (directly or not) failed. Dependencies
    /// on apply, dependents on destroy.
    DependencyFailed { origin: PathBuf },
    /// The run was cancelled before it started
    Cancelled,
    /// Flagged excluded during resolution
    Excluded,
    /// Flagged already applied during resolution
    AlreadyApplied,
}

impl SkipCause {
    /// Skips that are part of the plan rather than a consequence of a problem.
    pub fn is_planned(&self) -> bool {
        matches!(self, Self::Excluded | Self::AlreadyApplied)
    }
}

impl fmt::Display for SkipCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DependencyFailed { origin } => {
                write!(f, "blocked by failed module {}", origin.display())
            }
            Self::Cancelled => write!(f, "run cancelled"),
            Self::Excluded => write!(f, "excluded"),
            Self::AlreadyApplied => write!(f, "assumed already applied"),
        }
    }
}

/// Per-module execution state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleStatus {
    Pending,
    Running { attempt: u32 },
    Retrying { attempt: u32 },
    Succeeded,
    Failed(FailureCause),
    Skipped(SkipCause),
}

impl ModuleStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_) | Self::Skipped(_))
    }
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running { attempt } => write!(f, "RUNNING (attempt {})", attempt),
            Self::Retrying { attempt } => write!(f, "RETRYING (after attempt {})", attempt),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed(cause) => write!(f, "FAILED: {}", cause),
            Self::Skipped(cause) => write!(f, "SKIPPED: {}", cause),
        }
    }
}
