//! SR-005: Dependent-set index — who depends on each module, transitively.
//!
//! Breadth-first reachability over reverse dependency edges. Each traversal
//! keeps its own visited set, so cyclic graphs terminate and every member of
//! a cycle lists every other member. Unlike the planner, this never rejects
//! cycles.
//!
//! The same traversal over forward edges yields each module's transitive
//! dependencies, which is what a failed destroy must protect.

use super::stack::Stack;
use indexmap::IndexMap;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// Build the reverse adjacency: module path -> modules declaring it as a
/// direct dependency, in stack order.
pub fn reverse_edges(stack: &Stack) -> IndexMap<PathBuf, Vec<PathBuf>> {
    let mut reverse: IndexMap<PathBuf, Vec<PathBuf>> = IndexMap::new();
    for module in stack.modules() {
        for dep in &module.dependencies {
            let dependents = reverse.entry(dep.clone()).or_default();
            if !dependents.contains(&module.path) {
                dependents.push(module.path.clone());
            }
        }
    }
    reverse
}

/// Forward adjacency: module path -> its declared dependencies, deduplicated.
pub fn forward_edges(stack: &Stack) -> IndexMap<PathBuf, Vec<PathBuf>> {
    stack
        .modules()
        .map(|module| {
            let mut deps: Vec<PathBuf> = Vec::with_capacity(module.dependencies.len());
            for dep in &module.dependencies {
                if !deps.contains(dep) {
                    deps.push(dep.clone());
                }
            }
            (module.path.clone(), deps)
        })
        .collect()
}

/// All modules that depend on `root`, directly or through any chain,
/// nearest first.
pub fn dependents_of(reverse: &IndexMap<PathBuf, Vec<PathBuf>>, root: &Path) -> Vec<PathBuf> {
    reachable(reverse, root)
}

/// Breadth-first reachability from `root`, excluding `root` itself.
fn reachable(edges: &IndexMap<PathBuf, Vec<PathBuf>>, root: &Path) -> Vec<PathBuf> {
    let mut visited: FxHashSet<&Path> = FxHashSet::default();
    visited.insert(root);

    let mut order = Vec::new();
    let mut queue: VecDeque<&Path> = VecDeque::new();
    queue.push_back(root);

    while let Some(current) = queue.pop_front() {
        let Some(direct) = edges.get(current) else {
            continue;
        };
        for dependent in direct {
            if visited.insert(dependent.as_path()) {
                order.push(dependent.clone());
                queue.push_back(dependent.as_path());
            }
        }
    }

    order
}

/// Dependent index for the whole stack. Modules nothing depends on have no
/// entry; keys follow stack order.
pub fn build_dependent_index(stack: &Stack) -> IndexMap<PathBuf, Vec<PathBuf>> {
    build_index(stack, &reverse_edges(stack))
}

/// Every module's transitive dependencies, nearest first. Modules without
/// dependencies have no entry.
pub fn build_dependency_index(stack: &Stack) -> IndexMap<PathBuf, Vec<PathBuf>> {
    build_index(stack, &forward_edges(stack))
}

fn build_index(stack: &Stack, edges: &IndexMap<PathBuf, Vec<PathBuf>>) -> IndexMap<PathBuf, Vec<PathBuf>> {
    let mut index = IndexMap::new();
    for module in stack.modules() {
        let reached = reachable(edges, &module.path);
        if !reached.is_empty() {
            index.insert(module.path.clone(), reached);
        }
    }
    index
}
