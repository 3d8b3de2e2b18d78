//! SR-008: Executor — parallel dispatch of module runs through the run graph.
//!
//! Levels run in sequence with a barrier between them; the modules of one
//! level run concurrently as `JoinSet` tasks, bounded by a shared semaphore.
//! Pending → Running → {Succeeded | Failed | Skipped}, with
//! Running → Retrying → Running while retry patterns match. Tasks report
//! retry transitions over a channel so the status table records them.

use super::dependents;
use super::error::{RunError, RunErrorEntry};
use super::planner::RunGraph;
use super::stack::Stack;
use super::types::*;
use crate::transport::ExecOutput;
use async_trait::async_trait;
use indexmap::IndexMap;
use regex::RegexSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Runs the provisioning operation for one module.
///
/// Implementations must return promptly once `cancel` fires.
#[async_trait]
pub trait ModuleRunner: Send + Sync {
    async fn run(&self, module: &Module, cancel: CancellationToken) -> Result<ExecOutput, String>;
}

/// Configuration for one execution.
#[derive(Debug, Clone)]
pub struct ExecuteConfig {
    /// Bounds the number of modules running at once
    pub semaphore: Arc<Semaphore>,
    /// Cancel everything still pending on the first failure
    pub fail_fast: bool,
    /// Run dependents of failed modules anyway
    pub ignore_dependency_errors: bool,
    /// Timeout for modules that do not set their own
    pub timeout: Option<Duration>,
}

impl ExecuteConfig {
    pub fn new(parallelism: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(parallelism.max(1))),
            fail_fast: false,
            ignore_dependency_errors: false,
            timeout: None,
        }
    }
}

/// Terminal status of every module in the stack.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    /// Stack order
    pub statuses: IndexMap<PathBuf, ModuleStatus>,
    /// Every status change in the order it was applied, starting with the
    /// initial status of each module
    pub transitions: Vec<(PathBuf, ModuleStatus)>,
    /// Attempts made per dispatched module
    pub attempts: IndexMap<PathBuf, u32>,
    pub duration: Duration,
}

impl ExecutionReport {
    pub fn status(&self, path: &Path) -> Option<&ModuleStatus> {
        self.statuses.get(path)
    }

    /// Statuses `path` passed through, oldest first.
    pub fn history(&self, path: &Path) -> Vec<&ModuleStatus> {
        self.transitions
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, s)| s)
            .collect()
    }

    pub fn succeeded(&self) -> usize {
        self.statuses
            .values()
            .filter(|s| matches!(s, ModuleStatus::Succeeded))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.statuses
            .values()
            .filter(|s| matches!(s, ModuleStatus::Failed(_)))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.statuses
            .values()
            .filter(|s| matches!(s, ModuleStatus::Skipped(_)))
            .count()
    }

    /// No failures and no unplanned skips.
    pub fn is_success(&self) -> bool {
        self.error().is_none()
    }

    /// Aggregate every failed module and every skip caused by a failure or a
    /// cancellation. Excluded and already-applied modules never count.
    pub fn error(&self) -> Option<RunError> {
        let entries: Vec<RunErrorEntry> = self
            .statuses
            .iter()
            .filter_map(|(path, status)| match status {
                ModuleStatus::Failed(cause) => Some(RunErrorEntry::Failed {
                    path: path.clone(),
                    cause: cause.clone(),
                }),
                ModuleStatus::Skipped(cause) if !cause.is_planned() => {
                    Some(RunErrorEntry::Skipped {
                        path: path.clone(),
                        cause: cause.clone(),
                    })
                }
                _ => None,
            })
            .collect();
        if entries.is_empty() {
            None
        } else {
            Some(RunError { entries })
        }
    }
}

/// Everything a module task needs, owned so it can be spawned.
struct Dispatch {
    module: Module,
    runner: Arc<dyn ModuleRunner>,
    semaphore: Arc<Semaphore>,
    timeout: Option<Duration>,
    cancel: CancellationToken,
    progress: Progress,
}

/// Non-terminal transitions reported by running tasks.
type Progress = mpsc::UnboundedSender<(PathBuf, ModuleStatus)>;

/// Current status per module plus every transition in the order applied.
struct StatusTable {
    statuses: IndexMap<PathBuf, ModuleStatus>,
    transitions: Vec<(PathBuf, ModuleStatus)>,
}

impl StatusTable {
    fn get(&self, path: &Path) -> Option<&ModuleStatus> {
        self.statuses.get(path)
    }

    fn set(&mut self, path: &Path, status: ModuleStatus) {
        self.transitions.push((path.to_path_buf(), status.clone()));
        self.statuses.insert(path.to_path_buf(), status);
    }

    /// Modules that have not reached a terminal status.
    fn unfinished(&self) -> Vec<PathBuf> {
        self.statuses
            .iter()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(p, _)| p.clone())
            .collect()
    }
}

/// Execute `graph` over `stack`.
///
/// A failure blocks whatever the graph orders after the failed module:
/// its dependents when applying, its dependencies when destroying.
pub async fn execute(
    stack: &Stack,
    graph: &RunGraph,
    runner: Arc<dyn ModuleRunner>,
    cfg: &ExecuteConfig,
    cancel: CancellationToken,
) -> ExecutionReport {
    let start = Instant::now();
    let blocked_index = if graph.is_destroy() {
        dependents::build_dependency_index(stack)
    } else {
        dependents::build_dependent_index(stack)
    };

    let mut table = StatusTable {
        statuses: IndexMap::with_capacity(stack.len()),
        transitions: Vec::new(),
    };
    for m in stack.modules() {
        let status = if m.excluded {
            ModuleStatus::Skipped(SkipCause::Excluded)
        } else if m.assume_already_applied {
            ModuleStatus::Skipped(SkipCause::AlreadyApplied)
        } else {
            ModuleStatus::Pending
        };
        table.set(&m.path, status);
    }
    let mut attempts: IndexMap<PathBuf, u32> = IndexMap::new();
    let (progress, mut progress_rx) = mpsc::unbounded_channel();

    for (index, level) in graph.levels().iter().enumerate() {
        let mut tasks: JoinSet<(PathBuf, ModuleStatus, u32)> = JoinSet::new();
        let mut dispatched: Vec<PathBuf> = Vec::new();

        for path in level {
            if !matches!(table.get(path), Some(ModuleStatus::Pending)) {
                continue;
            }
            if cancel.is_cancelled() {
                table.set(path, ModuleStatus::Skipped(SkipCause::Cancelled));
                continue;
            }
            let Some(module) = stack.get(path) else {
                tracing::warn!(module = %path.display(), "scheduled module is not in the stack");
                continue;
            };

            table.set(path, ModuleStatus::Running { attempt: 1 });
            dispatched.push(path.clone());
            let dispatch = Dispatch {
                module: module.clone(),
                runner: Arc::clone(&runner),
                semaphore: Arc::clone(&cfg.semaphore),
                timeout: module.config.timeout().or(cfg.timeout),
                cancel: cancel.clone(),
                progress: progress.clone(),
            };
            let span = tracing::info_span!("module", path = %path.display());
            let path = path.clone();
            tasks.spawn(
                async move {
                    let (status, made) = run_module(dispatch).await;
                    (path, status, made)
                }
                .instrument(span),
            );
        }

        if dispatched.is_empty() {
            continue;
        }
        tracing::info!(level = index, modules = dispatched.len(), "starting level");

        loop {
            // A task reports progress before it completes, so draining the
            // channel first keeps transitions in order.
            let joined = tokio::select! {
                biased;
                Some((path, status)) = progress_rx.recv() => {
                    if table.get(&path).is_some_and(|s| !s.is_terminal()) {
                        table.set(&path, status);
                    }
                    continue;
                }
                joined = tasks.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };
            let (path, status, made) = match joined {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(error = %e, "module task did not complete");
                    continue;
                }
            };
            attempts.insert(path.clone(), made);

            match &status {
                ModuleStatus::Succeeded => {
                    tracing::info!(module = %path.display(), attempts = made, "module succeeded");
                }
                ModuleStatus::Failed(cause) => {
                    tracing::error!(module = %path.display(), %cause, "module failed");
                    if cfg.fail_fast && !cancel.is_cancelled() {
                        tracing::warn!("fail-fast: cancelling remaining modules");
                        cancel.cancel();
                    }
                    if !cfg.ignore_dependency_errors && *cause != FailureCause::Cancelled {
                        cascade_skip(&blocked_index, &path, &mut table);
                    }
                }
                ModuleStatus::Skipped(cause) => {
                    tracing::warn!(module = %path.display(), %cause, "module skipped");
                }
                _ => {}
            }
            table.set(&path, status);
        }

        // Tasks that panicked never reported back.
        for path in dispatched {
            if table.get(&path).is_some_and(|s| !s.is_terminal()) {
                table.set(
                    &path,
                    ModuleStatus::Failed(FailureCause::Transport("module task panicked".to_string())),
                );
            }
        }
        tracing::info!(level = index, "finished level");
    }

    for path in table.unfinished() {
        table.set(&path, ModuleStatus::Skipped(SkipCause::Cancelled));
    }

    ExecutionReport {
        statuses: table.statuses,
        transitions: table.transitions,
        attempts,
        duration: start.elapsed(),
    }
}

/// Skip every still-pending module that `blocked_index` lists behind `origin`.
fn cascade_skip(
    blocked_index: &IndexMap<PathBuf, Vec<PathBuf>>,
    origin: &Path,
    table: &mut StatusTable,
) {
    let Some(blocked) = blocked_index.get(origin) else {
        return;
    };
    for path in blocked {
        if matches!(table.get(path), Some(ModuleStatus::Pending)) {
            tracing::warn!(
                module = %path.display(),
                origin = %origin.display(),
                "skipping: blocked by failed module"
            );
            table.set(
                path,
                ModuleStatus::Skipped(SkipCause::DependencyFailed {
                    origin: origin.to_path_buf(),
                }),
            );
        }
    }
}

/// Run one module to a terminal status, retrying matching failures.
/// Returns the status and the number of attempts made.
async fn run_module(dispatch: Dispatch) -> (ModuleStatus, u32) {
    let Dispatch {
        module,
        runner,
        semaphore,
        timeout,
        cancel,
        progress,
    } = dispatch;

    let _permit = tokio::select! {
        permit = semaphore.acquire_owned() => match permit {
            Ok(p) => p,
            Err(_) => {
                return (
                    ModuleStatus::Failed(FailureCause::Transport("semaphore closed".to_string())),
                    0,
                )
            }
        },
        _ = cancel.cancelled() => return (ModuleStatus::Skipped(SkipCause::Cancelled), 0),
    };

    let policy = &module.config.retry;
    let max_attempts = policy.max_attempts.max(1);
    let matcher = match policy.matcher() {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(error = %e, "ignoring invalid retry patterns");
            RegexSet::empty()
        }
    };
    // The receiver lives as long as `execute`, which outlives every task.
    let report = |status: ModuleStatus| {
        let _ = progress.send((module.path.clone(), status));
    };

    let mut attempt = 1;
    loop {
        tracing::debug!(attempt, "running module");
        let (cause, text) = match run_attempt(&module, runner.as_ref(), timeout, &cancel).await {
            Ok(()) => return (ModuleStatus::Succeeded, attempt),
            Err(failure) => failure,
        };

        if cause == FailureCause::Cancelled
            || attempt >= max_attempts
            || !matcher.is_match(&text)
        {
            return (ModuleStatus::Failed(cause), attempt);
        }

        tracing::warn!(
            attempt,
            max_attempts,
            %cause,
            "retryable error, sleeping {}s",
            policy.sleep_interval_secs
        );
        report(ModuleStatus::Retrying { attempt });
        tokio::select! {
            _ = tokio::time::sleep(policy.sleep_interval()) => {}
            _ = cancel.cancelled() => return (ModuleStatus::Failed(FailureCause::Cancelled), attempt),
        }
        attempt += 1;
        report(ModuleStatus::Running { attempt });
    }
}

/// One attempt. On failure, returns the cause and the text retry patterns
/// are matched against.
async fn run_attempt(
    module: &Module,
    runner: &dyn ModuleRunner,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<(), (FailureCause, String)> {
    let child = cancel.child_token();
    let run = runner.run(module, child.clone());

    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, run).await {
            Ok(result) => result,
            Err(_) => {
                child.cancel();
                let cause = FailureCause::Timeout(limit);
                let text = cause.to_string();
                return Err((cause, text));
            }
        },
        None => run.await,
    };

    match result {
        Ok(out) if out.success() => Ok(()),
        _ if cancel.is_cancelled() => Err((FailureCause::Cancelled, String::new())),
        Ok(out) => {
            let text = out.combined();
            Err((
                FailureCause::ExitCode {
                    code: out.exit_code,
                    stderr: out.stderr,
                },
                text,
            ))
        }
        Err(e) => Err((FailureCause::Transport(e.clone()), e)),
    }
}
