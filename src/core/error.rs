//! SR-002: Error types for configuration, resolution, planning and runs.

use super::types::{FailureCause, SkipCause};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// A module configuration could not be read.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in {}: {}", .path.display(), .source)]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml_ng::Error,
    },

    #[error("invalid retryable error pattern in {}: {}", .path.display(), .source)]
    RetryPattern {
        path: PathBuf,
        #[source]
        source: regex::Error,
    },
}

/// Resolution of a stack failed. Resolution is all-or-nothing.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("error processing module {}{}: {}", .path.display(), referenced_from(.referenced_by), .source)]
    ProcessingModule {
        path: PathBuf,
        referenced_by: Option<PathBuf>,
        #[source]
        source: ConfigError,
    },

    #[error("module {} depends on itself", .path.display())]
    SelfDependency { path: PathBuf },

    #[error("module {} depends on {}, which has nothing to deploy", .dependent.display(), .path.display())]
    NonDeployableDependency { path: PathBuf, dependent: PathBuf },

    #[error("invalid {kind} pattern '{pattern}': {source}")]
    Pattern {
        kind: &'static str,
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

fn referenced_from(referenced_by: &Option<PathBuf>) -> String {
    referenced_by
        .as_ref()
        .map(|p| format!(" (dependency of {})", p.display()))
        .unwrap_or_default()
}

impl ResolveError {
    /// The underlying I/O error, when the failure came from the filesystem.
    pub fn io_error(&self) -> Option<&std::io::Error> {
        match self {
            Self::ProcessingModule {
                source: ConfigError::Io { source, .. },
                ..
            } => Some(source),
            _ => None,
        }
    }
}

/// Planning a run graph failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("circular dependency detected: {}", format_cycle(.cycle))]
    CircularDependency { cycle: Vec<PathBuf> },

    #[error("module {} depends on {}, which is not part of the stack", .module.display(), .dependency.display())]
    UnknownDependency { module: PathBuf, dependency: PathBuf },
}

fn format_cycle(cycle: &[PathBuf]) -> String {
    cycle
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// One failed or skipped module in an aggregated run error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunErrorEntry {
    Failed { path: PathBuf, cause: FailureCause },
    Skipped { path: PathBuf, cause: SkipCause },
}

impl RunErrorEntry {
    pub fn path(&self) -> &PathBuf {
        match self {
            Self::Failed { path, .. } | Self::Skipped { path, .. } => path,
        }
    }
}

impl fmt::Display for RunErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { path, cause } => write!(f, "FAILED  {}: {}", path.display(), cause),
            Self::Skipped { path, cause } => write!(f, "SKIPPED {}: {}", path.display(), cause),
        }
    }
}

/// Aggregated outcome of a run that did not fully succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", render_run_error(.entries))]
pub struct RunError {
    pub entries: Vec<RunErrorEntry>,
}

impl RunError {
    pub fn failed(&self) -> impl Iterator<Item = &RunErrorEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e, RunErrorEntry::Failed { .. }))
    }

    pub fn skipped(&self) -> impl Iterator<Item = &RunErrorEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e, RunErrorEntry::Skipped { .. }))
    }
}

fn render_run_error(entries: &[RunErrorEntry]) -> String {
    let failed = entries
        .iter()
        .filter(|e| matches!(e, RunErrorEntry::Failed { .. }))
        .count();
    let skipped = entries.len() - failed;
    let mut out = format!("{} module(s) failed, {} skipped", failed, skipped);
    for entry in entries {
        out.push_str("\n  ");
        out.push_str(&entry.to_string());
    }
    out
}
