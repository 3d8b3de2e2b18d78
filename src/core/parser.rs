//! SR-003: Module and run configuration parsing, module discovery.
//!
//! Reads `module.yaml` files into [`ModuleConfig`] and `stackrun.yaml` into
//! [`RunConfig`], and validates run configuration constraints:
//! - parallelism must be at least 1
//! - include/exclude patterns must be valid globs
//! - the provisioning binary must be named

use super::error::ConfigError;
use super::types::*;
use std::path::{Component, Path, PathBuf};

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Source of per-module configuration.
pub trait ConfigReader {
    /// Read the configuration stored at `config_path`.
    fn read_config(&self, config_path: &Path) -> Result<ModuleConfig, ConfigError>;
}

/// Reads `module.yaml` files from disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlConfigReader;

impl ConfigReader for YamlConfigReader {
    fn read_config(&self, config_path: &Path) -> Result<ModuleConfig, ConfigError> {
        let content = std::fs::read_to_string(config_path).map_err(|source| ConfigError::Io {
            path: config_path.to_path_buf(),
            source,
        })?;
        parse_module_config(&content, config_path)
    }
}

/// Parse a module configuration, checking its retry patterns compile.
pub fn parse_module_config(yaml: &str, path: &Path) -> Result<ModuleConfig, ConfigError> {
    // An empty file is a module with nothing declared.
    if yaml.trim().is_empty() {
        return Ok(ModuleConfig::default());
    }
    let config: ModuleConfig = serde_yaml_ng::from_str(yaml).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })?;
    config
        .retry
        .matcher()
        .map_err(|source| ConfigError::RetryPattern {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(config)
}

/// Parse a `stackrun.yaml` file. A missing file yields the defaults.
pub fn parse_run_config_file(path: &Path) -> Result<RunConfig, String> {
    if !path.exists() {
        return Ok(RunConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse_run_config(&content)
}

/// Parse a run configuration from a string.
pub fn parse_run_config(yaml: &str) -> Result<RunConfig, String> {
    if yaml.trim().is_empty() {
        return Ok(RunConfig::default());
    }
    serde_yaml_ng::from_str(yaml).map_err(|e| format!("YAML parse error: {}", e))
}

/// Validate a run configuration. Returns a list of errors (empty = valid).
pub fn validate_run_config(config: &RunConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if config.parallelism == 0 {
        errors.push(ValidationError {
            message: "parallelism must be at least 1".to_string(),
        });
    }

    if config.binary.trim().is_empty() {
        errors.push(ValidationError {
            message: "binary must not be empty".to_string(),
        });
    }

    for (kind, patterns) in [
        ("include_dirs", &config.include_dirs),
        ("exclude_dirs", &config.exclude_dirs),
    ] {
        for pattern in patterns {
            if let Err(e) = glob::Pattern::new(pattern) {
                errors.push(ValidationError {
                    message: format!("{} entry '{}' is not a valid glob: {}", kind, pattern, e),
                });
            }
        }
    }

    if config.strict_include && config.include_dirs.is_empty() && config.exclude_by_default {
        errors.push(ValidationError {
            message: "strict_include with exclude_by_default and no include_dirs excludes every module"
                .to_string(),
        });
    }

    errors
}

/// Find every module definition below `root`, sorted by path.
///
/// Hidden directories (`.terraform`, `.git`, ...) are not descended into,
/// and neither are symlinked directories. Entries that cannot be read are
/// logged and skipped.
pub fn discover_modules(root: &Path) -> Result<Vec<PathBuf>, String> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| format!("cannot read directory {}: {}", dir.display(), e))?;
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping entry of unknown type");
                    continue;
                }
            };
            let name = entry.file_name();
            if name == MODULE_FILE && !file_type.is_dir() {
                found.push(path);
            } else if file_type.is_symlink() {
                tracing::debug!(path = %path.display(), "not following symlink");
            } else if file_type.is_dir() && !name.to_string_lossy().starts_with('.') {
                pending.push(path);
            }
        }
    }

    found.sort();
    Ok(found)
}

/// Lexically normalize a path: drop `.` and fold `..` into its parent.
///
/// Works on paths that do not exist, unlike `fs::canonicalize`.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Turn a config location (a `module.yaml` path or a module directory) into
/// the canonical module directory, joined to `working_dir` when relative.
pub fn module_dir(location: &Path, working_dir: &Path) -> PathBuf {
    let absolute = if location.is_absolute() {
        location.to_path_buf()
    } else {
        working_dir.join(location)
    };
    let normalized = normalize_path(&absolute);
    if normalized.file_name().is_some_and(|n| n == MODULE_FILE) {
        normalized
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or(normalized)
    } else {
        normalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_module(root: &Path, rel: &str, yaml: &str) -> PathBuf {
        let dir = root.join(rel);
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join(MODULE_FILE);
        std::fs::write(&file, yaml).unwrap();
        file
    }

    #[test]
    fn test_sr003_read_config() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_module(
            dir.path(),
            "vpc",
            "source: git::vpc\ndependencies: [../account]\n",
        );
        let config = YamlConfigReader.read_config(&file).unwrap();
        assert_eq!(config.source.as_deref(), Some("git::vpc"));
        assert_eq!(config.dependencies, vec!["../account"]);
    }

    #[test]
    fn test_sr003_read_missing_config() {
        let dir = tempfile::tempdir().unwrap();
        let err = YamlConfigReader
            .read_config(&dir.path().join("nope").join(MODULE_FILE))
            .unwrap_err();
        match err {
            ConfigError::Io { source, .. } => {
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound)
            }
            other => panic!("expected io error, got {other:?}"),
        }
    }

    #[test]
    fn test_sr003_empty_config_is_not_deployable() {
        let config = parse_module_config("", Path::new("module.yaml")).unwrap();
        assert!(!config.is_deployable());
    }

    #[test]
    fn test_sr003_invalid_yaml() {
        let err = parse_module_config("dependencies: {", Path::new("m/module.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Yaml { .. }));
        assert!(err.to_string().contains("m/module.yaml"));
    }

    #[test]
    fn test_sr003_invalid_retry_pattern() {
        let yaml = "source: x\nretry:\n  retryable_errors: ['(oops']\n";
        let err = parse_module_config(yaml, Path::new("module.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::RetryPattern { .. }));
    }

    #[test]
    fn test_sr003_run_config_missing_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = parse_run_config_file(&dir.path().join(RUN_CONFIG_FILE)).unwrap();
        assert_eq!(config, RunConfig::default());
    }

    #[test]
    fn test_sr003_run_config_parse() {
        let config = parse_run_config(
            "parallelism: 2\nexclude_dirs: ['legacy/*']\nignore_dependency_errors: true\n",
        )
        .unwrap();
        assert_eq!(config.parallelism, 2);
        assert_eq!(config.exclude_dirs, vec!["legacy/*"]);
        assert!(config.ignore_dependency_errors);
        assert!(validate_run_config(&config).is_empty());
    }

    #[test]
    fn test_sr003_run_config_unknown_yaml() {
        assert!(parse_run_config("parallelism: [").is_err());
    }

    #[test]
    fn test_sr003_validate_run_config_errors() {
        let config = RunConfig {
            parallelism: 0,
            binary: " ".to_string(),
            exclude_dirs: vec!["[".to_string()],
            ..RunConfig::default()
        };
        let errors = validate_run_config(&config);
        assert_eq!(errors.len(), 3);
        assert!(errors[0].to_string().contains("parallelism"));
        assert!(errors[2].to_string().contains("exclude_dirs"));
    }

    #[test]
    fn test_sr003_discover_modules() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "stage/vpc", "source: x\n");
        write_module(dir.path(), "stage/data/redis", "source: x\n");
        write_module(dir.path(), "stage/.terraform/cached", "source: x\n");
        std::fs::write(dir.path().join("stage/README.md"), "docs").unwrap();

        let found = discover_modules(&dir.path().join("stage")).unwrap();
        assert_eq!(
            found,
            vec![
                dir.path().join("stage/data/redis").join(MODULE_FILE),
                dir.path().join("stage/vpc").join(MODULE_FILE),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_sr003_discover_does_not_follow_symlinked_dirs() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "stage/vpc", "source: x\n");
        write_module(dir.path(), "shared/dns", "source: x\n");
        // A loop back to the root and a link to a tree outside it.
        std::os::unix::fs::symlink(dir.path().join("stage"), dir.path().join("stage/vpc/loop")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("shared"), dir.path().join("stage/shared")).unwrap();

        let found = discover_modules(&dir.path().join("stage")).unwrap();
        assert_eq!(found, vec![dir.path().join("stage/vpc").join(MODULE_FILE)]);
    }

    #[test]
    fn test_sr003_discover_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover_modules(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn test_sr003_normalize_path() {
        assert_eq!(
            normalize_path(Path::new("/stack/app/../vpc/./")),
            PathBuf::from("/stack/vpc")
        );
        assert_eq!(
            normalize_path(Path::new("a/../../b")),
            PathBuf::from("../b")
        );
    }

    #[test]
    fn test_sr003_module_dir() {
        let wd = Path::new("/work");
        assert_eq!(
            module_dir(Path::new("stage/vpc/module.yaml"), wd),
            PathBuf::from("/work/stage/vpc")
        );
        assert_eq!(
            module_dir(Path::new("/abs/app"), wd),
            PathBuf::from("/abs/app")
        );
    }
}
