//! SR-009: Transport — running the provisioning binary for a module.
//!
//! The executor treats a module run as an opaque, cancellable operation; this
//! layer supplies the process-backed implementation and the shared output sink.

pub mod local;

pub use local::CommandRunner;

use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Output from running the provisioning binary once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Combined stdout and stderr, the text retry patterns are matched against.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Shared line-oriented writer for module output.
///
/// Every line goes out in a single locked `write_all`, so lines of concurrently
/// running modules never interleave mid-line.
#[derive(Clone)]
pub struct OutputSink {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl OutputSink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    /// Discards everything.
    pub fn sink() -> Self {
        Self::new(std::io::sink())
    }

    /// Write one line prefixed with the module it came from.
    pub fn write_line(&self, prefix: &str, line: &str) {
        let record = format!("[{}] {}\n", prefix, line);
        // A poisoned lock only means another writer panicked mid-line.
        let mut writer = match self.writer.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writer.write_all(record.as_bytes()).and_then(|_| writer.flush()) {
            tracing::warn!(error = %e, "failed to write module output");
        }
    }
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSink").finish_non_exhaustive()
    }
}

/// Display prefix for a module: its path relative to the working directory.
pub fn display_prefix(module_path: &Path, working_dir: &Path) -> String {
    match module_path.strip_prefix(working_dir) {
        Ok(rel) if !rel.as_os_str().is_empty() => rel.display().to_string(),
        _ => module_path.display().to_string(),
    }
}
