//! SR-006: Run-graph planning — leveled topological order per command kind.
//!
//! Layered Kahn sort: each pass places every module whose dependencies are
//! all placed. Already-applied modules are pre-placed and never emitted;
//! excluded modules are placed (so they gate their dependents) but filtered
//! from the output. Destroy-like commands run the same levels in reverse.

use super::error::PlanError;
use super::stack::Stack;
use super::types::CommandKind;
use rustc_hash::FxHashSet;
use std::path::{Path, PathBuf};

/// Ordered levels of modules; modules within a level are independent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunGraph {
    levels: Vec<Vec<PathBuf>>,
    /// Dependents run before their dependencies
    destroy: bool,
}

impl RunGraph {
    pub fn from_levels(levels: Vec<Vec<PathBuf>>) -> Self {
        Self {
            levels,
            destroy: false,
        }
    }

    pub fn levels(&self) -> &[Vec<PathBuf>] {
        &self.levels
    }

    /// Whether levels run dependents first.
    pub fn is_destroy(&self) -> bool {
        self.destroy
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Number of modules across all levels.
    pub fn module_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Level index of a module, if it is scheduled.
    pub fn level_of(&self, path: &Path) -> Option<usize> {
        self.levels
            .iter()
            .position(|level| level.iter().any(|p| p == path))
    }

    /// The same levels in reverse sequence, in the opposite direction.
    pub fn reversed(mut self) -> Self {
        self.levels.reverse();
        self.destroy = !self.destroy;
        self
    }
}

/// Build the run graph for `kind`.
pub fn build_run_graph(stack: &Stack, kind: CommandKind) -> Result<RunGraph, PlanError> {
    let levels = compute_levels(stack)?;

    let runnable: Vec<Vec<PathBuf>> = levels
        .into_iter()
        .map(|level| {
            level
                .into_iter()
                .filter(|p| stack.get(p).is_some_and(|m| !m.excluded))
                .collect::<Vec<_>>()
        })
        .filter(|level| !level.is_empty())
        .collect();

    let graph = RunGraph::from_levels(runnable);
    tracing::debug!(
        kind = %kind,
        levels = graph.levels().len(),
        modules = graph.module_count(),
        "planned run graph"
    );

    if kind.is_destroy() {
        Ok(graph.reversed())
    } else {
        Ok(graph)
    }
}

/// A single level holding every runnable module, ignoring dependency order.
pub fn build_unordered_run_graph(stack: &Stack) -> RunGraph {
    let all: Vec<PathBuf> = stack.runnable().map(|m| m.path.clone()).collect();
    if all.is_empty() {
        RunGraph::default()
    } else {
        RunGraph::from_levels(vec![all])
    }
}

/// Kahn levels over every module not assumed already applied, excluded ones
/// included. Levels keep stack order.
fn compute_levels(stack: &Stack) -> Result<Vec<Vec<PathBuf>>, PlanError> {
    for module in stack.modules() {
        for dep in &module.dependencies {
            if !stack.contains(dep) {
                return Err(PlanError::UnknownDependency {
                    module: module.path.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let mut placed: FxHashSet<&Path> = stack
        .modules()
        .filter(|m| m.assume_already_applied)
        .map(|m| m.path.as_path())
        .collect();

    let mut remaining: Vec<&Path> = stack
        .modules()
        .filter(|m| !m.assume_already_applied)
        .map(|m| m.path.as_path())
        .collect();

    let mut levels = Vec::new();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<&Path>, Vec<&Path>) =
            remaining.iter().copied().partition(|path| {
                stack.get(path).is_some_and(|m| {
                    m.dependencies
                        .iter()
                        .all(|dep| placed.contains(dep.as_path()))
                })
            });

        if ready.is_empty() {
            return Err(PlanError::CircularDependency {
                cycle: find_cycle(stack, &placed, &blocked),
            });
        }

        placed.extend(ready.iter().copied());
        levels.push(ready.iter().map(|p| p.to_path_buf()).collect());
        remaining = blocked;
    }

    Ok(levels)
}

/// Walk unplaced dependencies from the first blocked module until a module
/// repeats. Every blocked module has at least one unplaced dependency, so
/// the walk always closes a cycle.
fn find_cycle(stack: &Stack, placed: &FxHashSet<&Path>, blocked: &[&Path]) -> Vec<PathBuf> {
    let mut path: Vec<&Path> = Vec::new();
    let Some(mut current) = blocked.first().copied() else {
        return Vec::new();
    };

    loop {
        if let Some(start) = path.iter().position(|p| *p == current) {
            let mut cycle: Vec<PathBuf> = path[start..].iter().map(|p| p.to_path_buf()).collect();
            cycle.push(current.to_path_buf());
            return cycle;
        }
        path.push(current);

        let next = stack.get(current).and_then(|m| {
            m.dependencies
                .iter()
                .find(|dep| !placed.contains(dep.as_path()))
        });
        match next {
            Some(dep) => current = dep.as_path(),
            None => return path.iter().map(|p| p.to_path_buf()).collect(),
        }
    }
}
