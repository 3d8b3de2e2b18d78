//! SR-010: CLI subcommands — validate, graph, dependents, run, completions.

use crate::core::executor::{self, ExecuteConfig};
use crate::core::parser::{self, YamlConfigReader};
use crate::core::planner::{self, RunGraph};
use crate::core::resolver;
use crate::core::stack::Stack;
use crate::core::types::{CommandKind, RunConfig, RUN_CONFIG_FILE};
use crate::transport::{display_prefix, CommandRunner, OutputSink};
use clap::{CommandFactory, Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(
    name = "stackrun",
    version,
    about = "Run infrastructure-as-code modules in dependency order, in parallel"
)]
pub struct Cli {
    /// Log filter (overrides RUST_LOG), e.g. `debug` or `stackrun=trace`
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Discover, resolve and plan the stack without running anything
    Validate {
        /// Stack root directory
        #[arg(short = 'C', long = "dir", default_value = ".")]
        dir: PathBuf,
    },

    /// Show the run graph, one level per line group
    Graph {
        /// Stack root directory
        #[arg(short = 'C', long = "dir", default_value = ".")]
        dir: PathBuf,

        /// Show destroy order (dependents first)
        #[arg(long)]
        destroy: bool,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Show every module's transitive dependents
    Dependents {
        /// Stack root directory
        #[arg(short = 'C', long = "dir", default_value = ".")]
        dir: PathBuf,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Run the provisioning binary in every module
    Run {
        /// Stack root directory
        #[arg(short = 'C', long = "dir", default_value = ".")]
        dir: PathBuf,

        #[command(flatten)]
        overrides: RunOverrides,

        /// Arguments passed to the provisioning binary (after `--`)
        #[arg(last = true, required = true)]
        args: Vec<String>,
    },

    /// Print a shell completion script
    Completions {
        shell: clap_complete::Shell,
    },
}

/// Command-line overrides for `stackrun.yaml` values.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct RunOverrides {
    /// Maximum modules running at once
    #[arg(long)]
    pub parallelism: Option<usize>,

    /// Provisioning binary (default: terraform)
    #[arg(long)]
    pub binary: Option<String>,

    /// Cancel remaining modules on the first failure
    #[arg(long)]
    pub fail_fast: bool,

    /// Only run modules matching this glob (repeatable; implies exclude-by-default)
    #[arg(long = "include-dir")]
    pub include_dirs: Vec<String>,

    /// Never run modules matching this glob (repeatable)
    #[arg(long = "exclude-dir")]
    pub exclude_dirs: Vec<String>,

    /// Do not pull in dependencies of included modules
    #[arg(long)]
    pub strict_include: bool,

    /// Treat modules outside the requested set as already applied
    #[arg(long)]
    pub ignore_external_dependencies: bool,

    /// Run dependents even when a dependency failed
    #[arg(long)]
    pub ignore_dependency_errors: bool,

    /// Run every module at once, ignoring dependencies
    #[arg(long)]
    pub ignore_dependency_order: bool,

    /// Default per-module timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

impl RunOverrides {
    /// Layer the flags that were given over `config`.
    pub fn apply(&self, config: &mut RunConfig) {
        if let Some(n) = self.parallelism {
            config.parallelism = n;
        }
        if let Some(ref binary) = self.binary {
            config.binary.clone_from(binary);
        }
        if !self.include_dirs.is_empty() {
            config.include_dirs.extend(self.include_dirs.iter().cloned());
            config.exclude_by_default = true;
        }
        config.exclude_dirs.extend(self.exclude_dirs.iter().cloned());
        config.fail_fast |= self.fail_fast;
        config.strict_include |= self.strict_include;
        config.ignore_external_dependencies |= self.ignore_external_dependencies;
        config.ignore_dependency_errors |= self.ignore_dependency_errors;
        config.ignore_dependency_order |= self.ignore_dependency_order;
        if self.timeout.is_some() {
            config.timeout_secs = self.timeout;
        }
    }
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Validate { dir } => cmd_validate(&dir),
        Commands::Graph { dir, destroy, json } => cmd_graph(&dir, destroy, json),
        Commands::Dependents { dir, json } => cmd_dependents(&dir, json),
        Commands::Run {
            dir,
            overrides,
            args,
        } => cmd_run(&dir, &overrides, &args),
        Commands::Completions { shell } => cmd_completions(shell, &mut std::io::stdout()),
    }
}

/// Load `stackrun.yaml`, apply overrides, validate, discover and resolve.
fn load_stack(dir: &Path, overrides: &RunOverrides) -> Result<(RunConfig, Stack), String> {
    let working_dir = std::fs::canonicalize(dir)
        .map_err(|e| format!("cannot open stack directory {}: {}", dir.display(), e))?;

    let mut config = parser::parse_run_config_file(&working_dir.join(RUN_CONFIG_FILE))?;
    overrides.apply(&mut config);

    let errors = parser::validate_run_config(&config);
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        return Err(format!("{} validation error(s)", errors.len()));
    }

    let locations = parser::discover_modules(&working_dir)?;
    tracing::debug!(
        dir = %working_dir.display(),
        modules = locations.len(),
        "discovered module definitions"
    );

    let options = config.resolve_options(working_dir);
    let stack = resolver::resolve_modules(&locations, &options, &YamlConfigReader)
        .map_err(|e| e.to_string())?;
    Ok((config, stack))
}

fn plan(stack: &Stack, config: &RunConfig, kind: CommandKind) -> Result<RunGraph, String> {
    if config.ignore_dependency_order {
        Ok(planner::build_unordered_run_graph(stack))
    } else {
        stack.run_graph(kind).map_err(|e| e.to_string())
    }
}

fn cmd_validate(dir: &Path) -> Result<(), String> {
    let (config, stack) = load_stack(dir, &RunOverrides::default())?;
    let graph = plan(&stack, &config, CommandKind::Apply)?;

    let excluded = stack.modules().filter(|m| m.excluded).count();
    let applied = stack.modules().filter(|m| m.assume_already_applied).count();
    println!(
        "OK: {} ({} modules, {} runnable, {} excluded, {} already applied, {} levels)",
        stack.working_dir().display(),
        stack.len(),
        graph.module_count(),
        excluded,
        applied,
        graph.levels().len()
    );
    Ok(())
}

fn cmd_graph(dir: &Path, destroy: bool, json: bool) -> Result<(), String> {
    let (config, stack) = load_stack(dir, &RunOverrides::default())?;
    let kind = if destroy {
        CommandKind::Destroy
    } else {
        CommandKind::Apply
    };
    let graph = plan(&stack, &config, kind)?;
    let wd = stack.working_dir();

    let levels: Vec<Vec<String>> = graph
        .levels()
        .iter()
        .map(|level| level.iter().map(|p| display_prefix(p, wd)).collect())
        .collect();

    if json {
        let doc = serde_json::json!({ "kind": kind.to_string(), "levels": levels });
        let out = serde_json::to_string_pretty(&doc).map_err(|e| format!("JSON error: {}", e))?;
        println!("{}", out);
        return Ok(());
    }

    println!("Run graph ({}): {} modules in {} levels", kind, graph.module_count(), levels.len());
    for (i, level) in levels.iter().enumerate() {
        println!("Level {}:", i + 1);
        for module in level {
            println!("  {}", module);
        }
    }
    Ok(())
}

fn cmd_dependents(dir: &Path, json: bool) -> Result<(), String> {
    let (_, stack) = load_stack(dir, &RunOverrides::default())?;
    let wd = stack.working_dir();
    let index: indexmap::IndexMap<String, Vec<String>> = stack
        .dependent_modules()
        .iter()
        .map(|(module, dependents)| {
            (
                display_prefix(module, wd),
                dependents.iter().map(|d| display_prefix(d, wd)).collect(),
            )
        })
        .collect();

    if json {
        let out = serde_json::to_string_pretty(&index).map_err(|e| format!("JSON error: {}", e))?;
        println!("{}", out);
        return Ok(());
    }

    if index.is_empty() {
        println!("No module has dependents.");
    }
    for (module, dependents) in &index {
        println!("{}: {}", module, dependents.join(", "));
    }
    Ok(())
}

fn cmd_run(dir: &Path, overrides: &RunOverrides, args: &[String]) -> Result<(), String> {
    let (config, stack) = load_stack(dir, overrides)?;
    let kind = CommandKind::from_args(args);
    let graph = plan(&stack, &config, kind)?;

    let runner = CommandRunner::new(config.binary.clone(), args.to_vec(), OutputSink::stdout())
        .with_working_dir(stack.working_dir());
    let cfg = ExecuteConfig {
        semaphore: Arc::new(Semaphore::new(config.parallelism)),
        fail_fast: config.fail_fast,
        ignore_dependency_errors: config.ignore_dependency_errors,
        timeout: config.timeout_secs.map(Duration::from_secs),
    };

    tracing::info!(
        %kind,
        binary = %config.binary,
        modules = graph.module_count(),
        levels = graph.levels().len(),
        parallelism = config.parallelism,
        "starting run"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("cannot start runtime: {}", e))?;

    let report = runtime.block_on(async {
        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted: cancelling run");
                on_interrupt.cancel();
            }
        });
        executor::execute(&stack, &graph, Arc::new(runner), &cfg, cancel).await
    });

    println!();
    println!(
        "Run finished: {} succeeded, {} failed, {} skipped ({:.1}s)",
        report.succeeded(),
        report.failed(),
        report.skipped(),
        report.duration.as_secs_f64()
    );

    match report.error() {
        Some(err) => Err(err.to_string()),
        None => Ok(()),
    }
}

fn cmd_completions(shell: clap_complete::Shell, out: &mut dyn Write) -> Result<(), String> {
    let mut command = Cli::command();
    clap_complete::generate(shell, &mut command, "stackrun", out);
    Ok(())
}
