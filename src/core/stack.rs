//! SR-004: The stack — a single path-indexed table of resolved modules.
//!
//! Dependency edges are stored as paths and resolved through this table, so
//! logical cycles can exist (and be detected) without ownership cycles.

use super::dependents;
use super::error::PlanError;
use super::planner::{self, RunGraph};
use super::types::{CommandKind, Module, ResolveOptions};
use indexmap::IndexMap;
use std::path::{Path, PathBuf};

/// The resolved graph of modules for one invocation.
#[derive(Debug, Clone, Default)]
pub struct Stack {
    pub options: ResolveOptions,
    modules: IndexMap<PathBuf, Module>,
}

impl Stack {
    pub fn new(options: ResolveOptions) -> Self {
        Self {
            options,
            modules: IndexMap::new(),
        }
    }

    /// Build a stack from already-resolved modules. Later duplicates of a
    /// path replace earlier ones but keep the first position.
    pub fn from_modules(options: ResolveOptions, modules: Vec<Module>) -> Self {
        let mut stack = Self::new(options);
        for module in modules {
            stack.insert(module);
        }
        stack
    }

    pub fn insert(&mut self, module: Module) {
        self.modules.insert(module.path.clone(), module);
    }

    pub fn working_dir(&self) -> &Path {
        &self.options.working_dir
    }

    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    pub fn get(&self, path: &Path) -> Option<&Module> {
        self.modules.get(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.modules.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Position of a module in stack order.
    pub fn index_of(&self, path: &Path) -> Option<usize> {
        self.modules.get_index_of(path)
    }

    /// Modules the executor may dispatch.
    pub fn runnable(&self) -> impl Iterator<Item = &Module> {
        self.modules.values().filter(|m| m.is_runnable())
    }

    /// Leveled execution order for `kind`.
    pub fn run_graph(&self, kind: CommandKind) -> Result<RunGraph, PlanError> {
        planner::build_run_graph(self, kind)
    }

    /// Every module's transitive dependents, nearest first.
    pub fn dependent_modules(&self) -> IndexMap<PathBuf, Vec<PathBuf>> {
        dependents::build_dependent_index(self)
    }
}
