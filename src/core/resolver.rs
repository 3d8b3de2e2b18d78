//! SR-007: Module resolution — config locations to a validated stack.
//!
//! Reads every requested module, follows declared dependencies transitively
//! (pulling in external modules never listed), drops modules with nothing to
//! deploy that nothing depends on, and applies include/exclude policy.
//! Resolution is all-or-nothing: the first structural problem aborts it.

use super::error::ResolveError;
use super::parser::{self, ConfigReader};
use super::stack::Stack;
use super::types::*;
use indexmap::IndexMap;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// A module as read, before policy is applied.
struct Discovered {
    config: ModuleConfig,
    dependencies: Vec<PathBuf>,
    requested: bool,
}

/// Compiled include or exclude directory patterns, each kept with its
/// literal path for the prefix check.
struct DirMatcher {
    patterns: Vec<(glob::Pattern, PathBuf)>,
}

impl DirMatcher {
    fn compile(
        kind: &'static str,
        patterns: &[String],
        working_dir: &Path,
    ) -> Result<Self, ResolveError> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                let literal = parser::normalize_path(&working_dir.join(pattern));
                let text = if Path::new(pattern).is_absolute() {
                    literal.to_string_lossy().into_owned()
                } else {
                    anchored_pattern(&literal, working_dir)
                };
                glob::Pattern::new(&text)
                    .map(|compiled| (compiled, literal))
                    .map_err(|source| ResolveError::Pattern {
                        kind,
                        pattern: pattern.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Glob match, or the module lives below a literal directory.
    fn matches(&self, path: &Path) -> bool {
        self.patterns
            .iter()
            .any(|(glob, literal)| glob.matches_path(path) || path.starts_with(literal))
    }
}

/// Glob text for a relative pattern joined onto `working_dir`. The part of
/// the path contributed by the working directory is escaped, so only the
/// user's pattern carries glob syntax.
fn anchored_pattern(literal: &Path, working_dir: &Path) -> String {
    let base = parser::normalize_path(working_dir);
    let Some(anchor) = base.ancestors().find(|a| literal.starts_with(a)) else {
        return literal.to_string_lossy().into_owned();
    };
    let escaped = glob::Pattern::escape(&anchor.to_string_lossy());
    match literal.strip_prefix(anchor) {
        Ok(rest) if !rest.as_os_str().is_empty() => {
            PathBuf::from(escaped).join(rest).to_string_lossy().into_owned()
        }
        _ => escaped,
    }
}

/// Resolve config locations (module directories or `module.yaml` paths)
/// into a stack.
pub fn resolve_modules(
    locations: &[PathBuf],
    options: &ResolveOptions,
    reader: &dyn ConfigReader,
) -> Result<Stack, ResolveError> {
    let include = DirMatcher::compile("include", &options.include_dirs, &options.working_dir)?;
    let exclude = DirMatcher::compile("exclude", &options.exclude_dirs, &options.working_dir)?;

    let discovered = discover(locations, &options.working_dir, reader)?;
    let kept = keep_closure(&discovered);

    let mut paths: Vec<&PathBuf> = discovered.keys().filter(|p| kept.contains(p.as_path())).collect();
    paths.sort();

    for path in discovered.keys().filter(|p| !kept.contains(p.as_path())) {
        tracing::debug!(module = %path.display(), "dropping module with nothing to deploy");
    }

    let mut modules = Vec::with_capacity(paths.len());
    for path in paths {
        let found = &discovered[path];
        let deployable = found.config.is_deployable();

        if !deployable && options.non_deployable == NonDeployablePolicy::Reject {
            let dependent = discovered
                .iter()
                .find(|(p, d)| kept.contains(p.as_path()) && d.dependencies.contains(path))
                .map(|(p, _)| p.clone())
                .unwrap_or_else(|| path.clone());
            return Err(ResolveError::NonDeployableDependency {
                path: path.clone(),
                dependent,
            });
        }

        let external = !found.requested;
        let assume_already_applied =
            !deployable || (external && options.ignore_external_dependencies);
        if assume_already_applied {
            tracing::debug!(module = %path.display(), external, deployable, "assuming already applied");
        }

        modules.push(Module {
            path: path.clone(),
            dependencies: found.dependencies.clone(),
            excluded: false,
            assume_already_applied,
            config: found.config.clone(),
        });
    }

    apply_exclusions(&mut modules, options, &include, &exclude);

    let stack = Stack::from_modules(options.clone(), modules);
    tracing::debug!(
        modules = stack.len(),
        runnable = stack.runnable().count(),
        "resolved stack"
    );
    Ok(stack)
}

/// Read every requested module and, breadth-first, every module reachable
/// through declared dependencies.
fn discover(
    locations: &[PathBuf],
    working_dir: &Path,
    reader: &dyn ConfigReader,
) -> Result<IndexMap<PathBuf, Discovered>, ResolveError> {
    let requested: Vec<PathBuf> = locations
        .iter()
        .map(|l| parser::module_dir(l, working_dir))
        .collect();
    let requested_set: FxHashSet<&Path> = requested.iter().map(PathBuf::as_path).collect();

    let mut seen: FxHashSet<PathBuf> = FxHashSet::default();
    let mut queue: VecDeque<(PathBuf, Option<PathBuf>)> = VecDeque::new();
    for dir in &requested {
        if seen.insert(dir.clone()) {
            queue.push_back((dir.clone(), None));
        }
    }

    let mut discovered = IndexMap::new();
    while let Some((dir, referenced_by)) = queue.pop_front() {
        let config_path = dir.join(MODULE_FILE);
        tracing::debug!(module = %dir.display(), "reading module config");
        let config = match reader.read_config(&config_path) {
            Ok(config) => config,
            Err(source) => {
                return Err(ResolveError::ProcessingModule {
                    path: dir,
                    referenced_by,
                    source,
                })
            }
        };

        let mut dependencies: Vec<PathBuf> = Vec::new();
        for declared in &config.dependencies {
            let dep = parser::normalize_path(&dir.join(declared));
            if dep == dir {
                return Err(ResolveError::SelfDependency { path: dir });
            }
            if dependencies.contains(&dep) {
                continue;
            }
            if seen.insert(dep.clone()) {
                tracing::debug!(
                    module = %dir.display(),
                    dependency = %dep.display(),
                    "following external dependency"
                );
                queue.push_back((dep.clone(), Some(dir.clone())));
            }
            dependencies.push(dep);
        }

        let requested = requested_set.contains(dir.as_path());
        discovered.insert(
            dir,
            Discovered {
                config,
                dependencies,
                requested,
            },
        );
    }

    Ok(discovered)
}

/// Modules reachable from requested deployable modules, including themselves.
fn keep_closure(discovered: &IndexMap<PathBuf, Discovered>) -> FxHashSet<&Path> {
    let mut kept: FxHashSet<&Path> = FxHashSet::default();
    let mut stack: Vec<&Path> = discovered
        .iter()
        .filter(|(_, d)| d.requested && d.config.is_deployable())
        .map(|(p, _)| p.as_path())
        .collect();
    kept.extend(stack.iter().copied());

    while let Some(current) = stack.pop() {
        let Some(found) = discovered.get(current) else {
            continue;
        };
        for dep in &found.dependencies {
            if kept.insert(dep.as_path()) {
                stack.push(dep.as_path());
            }
        }
    }

    kept
}

/// Flag excluded modules. Exclude patterns always win; with
/// `exclude_by_default`, only include matches (and, unless `strict_include`,
/// their dependencies) stay in.
fn apply_exclusions(
    modules: &mut [Module],
    options: &ResolveOptions,
    include: &DirMatcher,
    exclude: &DirMatcher,
) {
    let explicitly_excluded: Vec<bool> = modules.iter().map(|m| exclude.matches(&m.path)).collect();

    for (module, &explicit) in modules.iter_mut().zip(&explicitly_excluded) {
        module.excluded = explicit || (options.exclude_by_default && !include.matches(&module.path));
    }

    if !options.exclude_by_default || options.strict_include {
        return;
    }

    let position: IndexMap<PathBuf, usize> = modules
        .iter()
        .enumerate()
        .map(|(i, m)| (m.path.clone(), i))
        .collect();

    let mut pending: Vec<usize> = (0..modules.len()).filter(|&i| !modules[i].excluded).collect();
    while let Some(i) = pending.pop() {
        let deps = modules[i].dependencies.clone();
        for dep in deps {
            let Some(&j) = position.get(&dep) else {
                continue;
            };
            if modules[j].excluded && !explicitly_excluded[j] {
                tracing::debug!(
                    module = %modules[j].path.display(),
                    "including dependency of included module"
                );
                modules[j].excluded = false;
                pending.push(j);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::YamlConfigReader;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            Self::in_dir("modules")
        }

        fn in_dir(name: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().join(name);
            std::fs::create_dir_all(&root).unwrap();
            Self { _dir: dir, root }
        }

        fn module(&self, rel: &str, yaml: &str) -> PathBuf {
            let dir = self.root.join(rel);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(MODULE_FILE), yaml).unwrap();
            dir
        }

        fn options(&self) -> ResolveOptions {
            ResolveOptions {
                working_dir: self.root.clone(),
                ..ResolveOptions::default()
            }
        }

        fn resolve(&self, locations: &[&str]) -> Result<Stack, ResolveError> {
            self.resolve_with(locations, &self.options())
        }

        fn resolve_with(
            &self,
            locations: &[&str],
            options: &ResolveOptions,
        ) -> Result<Stack, ResolveError> {
            let locations: Vec<PathBuf> = locations.iter().map(PathBuf::from).collect();
            resolve_modules(&locations, options, &YamlConfigReader)
        }
    }

    /// module-a (no deps), module-c -> module-a, module-abba (no deps)
    fn basic_fixture() -> Fixture {
        let fx = Fixture::new();
        fx.module("module-a", "source: test\n");
        fx.module("module-abba", "source: test\n");
        fx.module("module-c", "source: temp\ndependencies: [../module-a]\n");
        fx
    }

    fn module_paths(stack: &Stack) -> Vec<PathBuf> {
        stack.modules().map(|m| m.path.clone()).collect()
    }

    #[test]
    fn test_sr007_no_paths() {
        let fx = Fixture::new();
        let stack = fx.resolve(&[]).unwrap();
        assert!(stack.is_empty());
    }

    #[test]
    fn test_sr007_one_module_no_dependencies() {
        let fx = basic_fixture();
        let stack = fx.resolve(&["module-a/module.yaml"]).unwrap();
        assert_eq!(module_paths(&stack), vec![fx.root.join("module-a")]);
        let a = stack.get(&fx.root.join("module-a")).unwrap();
        assert!(a.dependencies.is_empty());
        assert!(a.is_runnable());
        assert_eq!(a.config.source.as_deref(), Some("test"));
    }

    #[test]
    fn test_sr007_two_modules_with_dependencies() {
        let fx = basic_fixture();
        let stack = fx
            .resolve(&["module-a/module.yaml", "module-c/module.yaml"])
            .unwrap();
        assert_eq!(
            module_paths(&stack),
            vec![fx.root.join("module-a"), fx.root.join("module-c")]
        );
        let c = stack.get(&fx.root.join("module-c")).unwrap();
        assert_eq!(c.dependencies, vec![fx.root.join("module-a")]);
        assert!(stack.modules().all(Module::is_runnable));
    }

    #[test]
    fn test_sr007_multiple_modules_nested_paths() {
        let fx = basic_fixture();
        fx.module("module-b/module-b-child", "source: ...\n");
        fx.module(
            "module-d",
            "dependencies: [../module-a, ../module-b/module-b-child, ../module-c]\nsource: x\n",
        );
        fx.module(
            "module-e/module-e-child",
            "source: test\ndependencies: [../../module-a, ../../module-b/module-b-child]\n",
        );
        let stack = fx
            .resolve(&[
                "module-a",
                "module-b/module-b-child",
                "module-c",
                "module-d",
                "module-e/module-e-child",
            ])
            .unwrap();
        assert_eq!(stack.len(), 5);
        let d = stack.get(&fx.root.join("module-d")).unwrap();
        assert_eq!(
            d.dependencies,
            vec![
                fx.root.join("module-a"),
                fx.root.join("module-b/module-b-child"),
                fx.root.join("module-c"),
            ]
        );
        let e = stack.get(&fx.root.join("module-e/module-e-child")).unwrap();
        assert_eq!(
            e.dependencies,
            vec![fx.root.join("module-a"), fx.root.join("module-b/module-b-child")]
        );
    }

    #[test]
    fn test_sr007_duplicate_locations_resolve_once() {
        let fx = basic_fixture();
        let stack = fx
            .resolve(&["module-a", "module-a/module.yaml", "./module-a/"])
            .unwrap();
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn test_sr007_excluded_dir_with_dependency() {
        let fx = basic_fixture();
        let options = ResolveOptions {
            exclude_dirs: vec!["module-a".to_string()],
            ..fx.options()
        };
        let stack = fx
            .resolve_with(&["module-a", "module-c"], &options)
            .unwrap();
        assert_eq!(stack.len(), 2);
        assert!(stack.get(&fx.root.join("module-a")).unwrap().excluded);
        assert!(!stack.get(&fx.root.join("module-c")).unwrap().excluded);
    }

    #[test]
    fn test_sr007_excluded_dir_conflicting_naming() {
        let fx = basic_fixture();
        let options = ResolveOptions {
            exclude_dirs: vec!["module-a".to_string()],
            ..fx.options()
        };
        let stack = fx
            .resolve_with(&["module-a", "module-abba", "module-c"], &options)
            .unwrap();
        assert!(stack.get(&fx.root.join("module-a")).unwrap().excluded);
        assert!(!stack.get(&fx.root.join("module-abba")).unwrap().excluded);
    }

    #[test]
    fn test_sr007_excluded_dir_glob() {
        let fx = basic_fixture();
        let options = ResolveOptions {
            exclude_dirs: vec!["module-a*".to_string()],
            ..fx.options()
        };
        let stack = fx
            .resolve_with(&["module-a", "module-abba", "module-c"], &options)
            .unwrap();
        assert!(stack.get(&fx.root.join("module-a")).unwrap().excluded);
        assert!(stack.get(&fx.root.join("module-abba")).unwrap().excluded);
        assert!(!stack.get(&fx.root.join("module-c")).unwrap().excluded);

        // Excluded modules still gate their dependents.
        let graph = stack.run_graph(CommandKind::Apply).unwrap();
        assert_eq!(graph.levels(), &[vec![fx.root.join("module-c")]]);
    }

    #[test]
    fn test_sr007_glob_characters_in_working_dir_are_literal() {
        let fx = Fixture::in_dir("stack[1]");
        fx.module("module-a", "source: test\n");
        fx.module("module-abba", "source: test\n");
        fx.module("module-c", "source: temp\n");
        let all = ["module-a", "module-abba", "module-c"];

        let options = ResolveOptions {
            exclude_dirs: vec!["module-a".to_string()],
            ..fx.options()
        };
        let stack = fx.resolve_with(&all, &options).unwrap();
        assert!(stack.get(&fx.root.join("module-a")).unwrap().excluded);
        assert!(!stack.get(&fx.root.join("module-abba")).unwrap().excluded);

        let options = ResolveOptions {
            exclude_dirs: vec!["module-a*".to_string()],
            ..fx.options()
        };
        let stack = fx.resolve_with(&all, &options).unwrap();
        assert!(stack.get(&fx.root.join("module-a")).unwrap().excluded);
        assert!(stack.get(&fx.root.join("module-abba")).unwrap().excluded);
        assert!(!stack.get(&fx.root.join("module-c")).unwrap().excluded);
    }

    #[test]
    fn test_sr007_exclude_by_default_with_include() {
        let fx = basic_fixture();
        let options = ResolveOptions {
            include_dirs: vec!["module-a".to_string()],
            exclude_by_default: true,
            ..fx.options()
        };
        let stack = fx.resolve_with(&["module-a", "module-c"], &options).unwrap();
        assert!(!stack.get(&fx.root.join("module-a")).unwrap().excluded);
        assert!(stack.get(&fx.root.join("module-c")).unwrap().excluded);
    }

    #[test]
    fn test_sr007_include_pulls_in_dependencies() {
        let fx = basic_fixture();
        let options = ResolveOptions {
            include_dirs: vec!["module-c".to_string()],
            exclude_by_default: true,
            ..fx.options()
        };
        let stack = fx
            .resolve_with(&["module-a", "module-abba", "module-c"], &options)
            .unwrap();
        assert!(!stack.get(&fx.root.join("module-a")).unwrap().excluded);
        assert!(!stack.get(&fx.root.join("module-c")).unwrap().excluded);
        assert!(stack.get(&fx.root.join("module-abba")).unwrap().excluded);
    }

    #[test]
    fn test_sr007_strict_include_keeps_dependencies_out() {
        let fx = basic_fixture();
        let options = ResolveOptions {
            include_dirs: vec!["module-c".to_string()],
            exclude_by_default: true,
            strict_include: true,
            ..fx.options()
        };
        let stack = fx.resolve_with(&["module-a", "module-c"], &options).unwrap();
        assert!(stack.get(&fx.root.join("module-a")).unwrap().excluded);
        assert!(!stack.get(&fx.root.join("module-c")).unwrap().excluded);
    }

    #[test]
    fn test_sr007_exclude_beats_include_dependency() {
        let fx = basic_fixture();
        let options = ResolveOptions {
            include_dirs: vec!["module-c".to_string()],
            exclude_dirs: vec!["module-a".to_string()],
            exclude_by_default: true,
            ..fx.options()
        };
        let stack = fx.resolve_with(&["module-a", "module-c"], &options).unwrap();
        assert!(stack.get(&fx.root.join("module-a")).unwrap().excluded);
    }

    #[test]
    fn test_sr007_external_non_deployable_dependency() {
        let fx = Fixture::new();
        fx.module("module-f", "");
        fx.module("module-g", "source: test\ndependencies: [../module-f]\n");
        let stack = fx.resolve(&["module-g"]).unwrap();
        assert_eq!(
            module_paths(&stack),
            vec![fx.root.join("module-f"), fx.root.join("module-g")]
        );
        let f = stack.get(&fx.root.join("module-f")).unwrap();
        assert!(f.assume_already_applied);
        assert!(!stack.get(&fx.root.join("module-g")).unwrap().assume_already_applied);
    }

    #[test]
    fn test_sr007_nested_external_dependencies() {
        let fx = Fixture::new();
        fx.module("module-h", "");
        fx.module("module-i", "dependencies: [../module-h]\n");
        fx.module("module-j", "source: temp\ndependencies: [../module-i]\n");
        fx.module("module-k", "source: fire\ndependencies: [../module-h]\n");
        let stack = fx.resolve(&["module-j", "module-k"]).unwrap();
        assert_eq!(stack.len(), 4);
        assert!(stack.get(&fx.root.join("module-h")).unwrap().assume_already_applied);
        assert!(stack.get(&fx.root.join("module-i")).unwrap().assume_already_applied);
        assert!(!stack.get(&fx.root.join("module-j")).unwrap().assume_already_applied);
        assert!(!stack.get(&fx.root.join("module-k")).unwrap().assume_already_applied);

        let graph = stack.run_graph(CommandKind::Apply).unwrap();
        assert_eq!(
            graph.levels(),
            &[vec![fx.root.join("module-j"), fx.root.join("module-k")]]
        );
    }

    #[test]
    fn test_sr007_external_deployable_dependency() {
        let fx = basic_fixture();
        let stack = fx.resolve(&["module-c"]).unwrap();
        let a = stack.get(&fx.root.join("module-a")).unwrap();
        assert!(!a.assume_already_applied);

        let options = ResolveOptions {
            ignore_external_dependencies: true,
            ..fx.options()
        };
        let stack = fx.resolve_with(&["module-c"], &options).unwrap();
        assert!(stack.get(&fx.root.join("module-a")).unwrap().assume_already_applied);
        assert!(!stack.get(&fx.root.join("module-c")).unwrap().assume_already_applied);
    }

    #[test]
    fn test_sr007_missing_dependency_is_not_found() {
        let fx = Fixture::new();
        fx.module(
            "module-missing-dependency",
            "source: test\ndependencies: [../not-a-real-module]\n",
        );
        let err = fx.resolve(&["module-missing-dependency"]).unwrap_err();
        match &err {
            ResolveError::ProcessingModule {
                path,
                referenced_by,
                ..
            } => {
                assert_eq!(path, &fx.root.join("not-a-real-module"));
                assert_eq!(
                    referenced_by.as_deref(),
                    Some(fx.root.join("module-missing-dependency").as_path())
                );
            }
            other => panic!("expected processing error, got {other:?}"),
        }
        assert_eq!(
            err.io_error().map(|e| e.kind()),
            Some(std::io::ErrorKind::NotFound)
        );
    }

    #[test]
    fn test_sr007_requested_module_without_deployable_unit_dropped() {
        let fx = Fixture::new();
        fx.module("module-l", "dependencies: []\n");
        let stack = fx.resolve(&["module-l"]).unwrap();
        assert!(stack.is_empty());
    }

    #[test]
    fn test_sr007_reject_non_deployable_dependency() {
        let fx = Fixture::new();
        fx.module("module-f", "");
        fx.module("module-g", "source: test\ndependencies: [../module-f]\n");
        let options = ResolveOptions {
            non_deployable: NonDeployablePolicy::Reject,
            ..fx.options()
        };
        let err = fx.resolve_with(&["module-g"], &options).unwrap_err();
        match err {
            ResolveError::NonDeployableDependency { path, dependent } => {
                assert_eq!(path, fx.root.join("module-f"));
                assert_eq!(dependent, fx.root.join("module-g"));
            }
            other => panic!("expected non-deployable error, got {other:?}"),
        }
    }

    #[test]
    fn test_sr007_self_dependency() {
        let fx = Fixture::new();
        fx.module("loop", "source: x\ndependencies: [../loop]\n");
        let err = fx.resolve(&["loop"]).unwrap_err();
        assert!(matches!(err, ResolveError::SelfDependency { .. }));
    }

    #[test]
    fn test_sr007_invalid_pattern() {
        let fx = basic_fixture();
        let options = ResolveOptions {
            exclude_dirs: vec!["[".to_string()],
            ..fx.options()
        };
        let err = fx.resolve_with(&["module-a"], &options).unwrap_err();
        assert!(matches!(err, ResolveError::Pattern { kind: "exclude", .. }));
    }

    #[test]
    fn test_sr007_cycle_resolves_but_does_not_plan() {
        let fx = Fixture::new();
        fx.module("a", "source: x\ndependencies: [../b]\n");
        fx.module("b", "source: x\ndependencies: [../a]\n");
        let stack = fx.resolve(&["a"]).unwrap();
        assert_eq!(stack.len(), 2);
        assert!(stack.run_graph(CommandKind::Apply).is_err());
        assert_eq!(stack.dependent_modules().len(), 2);
    }
}
