//! SR-009: Local process transport.

use super::{display_prefix, ExecOutput, OutputSink};
use crate::core::executor::ModuleRunner;
use crate::core::types::Module;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Runs `binary args...` inside each module directory.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    binary: String,
    args: Vec<String>,
    working_dir: PathBuf,
    sink: OutputSink,
}

impl CommandRunner {
    pub fn new(binary: impl Into<String>, args: Vec<String>, sink: OutputSink) -> Self {
        Self {
            binary: binary.into(),
            args,
            working_dir: PathBuf::new(),
            sink,
        }
    }

    /// Output lines are prefixed with module paths relative to `dir`.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }
}

#[async_trait]
impl ModuleRunner for CommandRunner {
    async fn run(&self, module: &Module, cancel: CancellationToken) -> Result<ExecOutput, String> {
        let prefix = display_prefix(&module.path, &self.working_dir);
        exec_command(
            &self.binary,
            &self.args,
            &module.path,
            &prefix,
            &self.sink,
            &cancel,
        )
        .await
    }
}

/// Spawn `program` in `dir`, streaming both output streams line by line to
/// `sink` while capturing them. Cancellation kills the child.
pub async fn exec_command(
    program: &str,
    args: &[String],
    dir: &Path,
    prefix: &str,
    sink: &OutputSink,
    cancel: &CancellationToken,
) -> Result<ExecOutput, String> {
    let mut child = Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn {}: {}", program, e))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "stdout was not captured".to_string())?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| "stderr was not captured".to_string())?;

    let out_task = tokio::spawn(pump_lines(stdout, prefix.to_string(), sink.clone()));
    let err_task = tokio::spawn(pump_lines(stderr, prefix.to_string(), sink.clone()));

    let status = tokio::select! {
        status = child.wait() => status.map_err(|e| format!("wait error: {}", e))?,
        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "failed to kill {}", program);
            }
            out_task.abort();
            err_task.abort();
            return Err(format!("{} cancelled", program));
        }
    };

    let stdout = out_task
        .await
        .map_err(|e| format!("stdout reader failed: {}", e))?;
    let stderr = err_task
        .await
        .map_err(|e| format!("stderr reader failed: {}", e))?;

    Ok(ExecOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout,
        stderr,
    })
}

/// Forward each line to the sink and return everything read.
async fn pump_lines<R>(reader: R, prefix: String, sink: OutputSink) -> String
where
    R: AsyncRead + Unpin,
{
    let mut captured = String::new();
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                sink.write_line(&prefix, &line);
                captured.push_str(&line);
                captured.push('\n');
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(module = %prefix, error = %e, "stopped reading module output");
                break;
            }
        }
    }
    captured
}
