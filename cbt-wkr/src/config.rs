//! Runner configuration.
//!
//! Values come from an optional TOML file and are overridden by `CBT_*`
//! environment variables:
//!
//! ```toml
//! ledger_url = "https://cbt.example.org/api/"
//! runner_name = "runner-1"
//! build_dir = "~/llvm-project/build"
//! wrapper_build_dir = "~/backend-wrapper/build"
//! cts_build_dir = "~/OpenCL-CTS/build"
//! suite_version = "v2023-05-16"
//! toolchain_version = "1.0.13822"
//! runtime_version = "23.13.26032"
//! ```
//!
//! The runner key is usually supplied through `CBT_RUNNER_KEY` only.

use cbt_common::ErrorCode;
use cbt_common::config::{ConfigFileError, EnvParser, Sourced, expand_path, load_toml_file};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_IDLE_INTERVAL_SECS: u64 = 3 * 60;
pub const DEFAULT_LIT_MAX_TIME_SECS: u64 = 30;
pub const DEFAULT_MAKE_JOBS: u64 = 4;

/// Variables holding the runner credential; never passed to test processes.
pub const CREDENTIAL_ENV_VARS: &[&str] = &["CBT_RUNNER_KEY", "RUNNER_KEY"];

#[derive(Debug, Error)]
pub enum RunnerConfigError {
    #[error(transparent)]
    File(#[from] ConfigFileError),

    #[error("invalid environment: {}", .0.join("; "))]
    Env(Vec<String>),

    #[error("missing required settings: {}", .0.join(", "))]
    Missing(Vec<&'static str>),

    #[error("invalid ledger URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl RunnerConfigError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::File(e) => e.code(),
            Self::Env(_) => ErrorCode::ConfigEnvError,
            Self::Missing(names) if names.iter().any(|n| n.starts_with("runner_")) => {
                ErrorCode::ConfigMissingCredentials
            }
            Self::Missing(_) => ErrorCode::ConfigMissingPath,
            Self::InvalidUrl { .. } => ErrorCode::ConfigValidationError,
        }
    }
}

/// On-disk layout of the runner config file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RunnerFile {
    ledger_url: Option<String>,
    runner_name: Option<String>,
    runner_key: Option<String>,
    build_dir: Option<String>,
    wrapper_build_dir: Option<String>,
    cts_build_dir: Option<String>,
    catalog: Option<String>,
    dump_root: Option<String>,
    lit_test_dir: Option<String>,
    lit_max_time_secs: Option<u64>,
    make_jobs: Option<u64>,
    idle_interval_secs: Option<u64>,
    suite_version: Option<String>,
    toolchain_version: Option<String>,
    runtime_version: Option<String>,
}

/// Fully resolved runner settings, each tagged with where it came from.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Ledger API root, always ending in `/`.
    pub ledger_url: Sourced<String>,
    pub runner_name: Sourced<String>,
    pub runner_key: Sourced<String>,
    /// Toolchain build directory inside the checkout.
    pub build_dir: Sourced<PathBuf>,
    pub wrapper_build_dir: Sourced<PathBuf>,
    pub cts_build_dir: Sourced<PathBuf>,
    pub catalog: Sourced<PathBuf>,
    /// Parent of per-test scratch dump directories.
    pub dump_root: Sourced<PathBuf>,
    pub lit_test_dir: Sourced<PathBuf>,
    pub lit_max_time_secs: Sourced<u64>,
    pub make_jobs: Sourced<u64>,
    pub idle_interval_secs: Sourced<u64>,
    pub suite_version: Sourced<String>,
    pub toolchain_version: Sourced<String>,
    pub runtime_version: Sourced<String>,
}

impl RunnerConfig {
    /// Load the optional file at `path`, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, RunnerConfigError> {
        let file = match path {
            Some(path) => load_toml_file::<RunnerFile>(path)?,
            None => RunnerFile::default(),
        };
        Self::resolve(file, path)
    }

    fn resolve(file: RunnerFile, path: Option<&Path>) -> Result<Self, RunnerConfigError> {
        let mut env = EnvParser::new();
        let mut missing = Vec::new();

        let ledger_url = required_string(&mut env, "LEDGER_URL", file.ledger_url, path)
            .unwrap_or_else(|| {
                missing.push("ledger_url");
                Sourced::default_value(String::new())
            });
        let runner_name = required_string(&mut env, "RUNNER_NAME", file.runner_name, path)
            .unwrap_or_else(|| {
                missing.push("runner_name");
                Sourced::default_value(String::new())
            });
        let runner_key = required_string(&mut env, "RUNNER_KEY", file.runner_key, path)
            .unwrap_or_else(|| {
                missing.push("runner_key");
                Sourced::default_value(String::new())
            });

        let mut required_path = |env: &mut EnvParser, var, value, key| {
            optional_path(env, var, value, path).unwrap_or_else(|| {
                missing.push(key);
                Sourced::default_value(PathBuf::new())
            })
        };
        let build_dir = required_path(&mut env, "BUILD_DIR", file.build_dir, "build_dir");
        let wrapper_build_dir = required_path(
            &mut env,
            "WRAPPER_BUILD_DIR",
            file.wrapper_build_dir,
            "wrapper_build_dir",
        );
        let cts_build_dir =
            required_path(&mut env, "CTS_BUILD_DIR", file.cts_build_dir, "cts_build_dir");

        let catalog = optional_path(&mut env, "CATALOG", file.catalog, path)
            .unwrap_or_else(|| Sourced::default_value(PathBuf::from("cts.json")));
        let dump_root = optional_path(&mut env, "DUMP_ROOT", file.dump_root, path)
            .unwrap_or_else(|| Sourced::default_value(std::env::temp_dir()));
        let lit_test_dir = optional_path(&mut env, "LIT_TEST_DIR", file.lit_test_dir, path)
            .unwrap_or_else(|| {
                Sourced::default_value(build_dir.value.join("../llvm/test/CodeGen/SPIRV/"))
            });

        let lit_max_time_secs = number(
            &mut env,
            "LIT_MAX_TIME",
            file.lit_max_time_secs,
            path,
            DEFAULT_LIT_MAX_TIME_SECS,
            1,
            24 * 60 * 60,
        );
        let make_jobs = number(&mut env, "MAKE_JOBS", file.make_jobs, path, DEFAULT_MAKE_JOBS, 1, 1024);
        let idle_interval_secs = number(
            &mut env,
            "IDLE_INTERVAL",
            file.idle_interval_secs,
            path,
            DEFAULT_IDLE_INTERVAL_SECS,
            1,
            24 * 60 * 60,
        );

        let suite_version = required_string(&mut env, "SUITE_VERSION", file.suite_version, path)
            .unwrap_or_else(|| {
                missing.push("suite_version");
                Sourced::default_value(String::new())
            });
        let toolchain_version =
            required_string(&mut env, "TOOLCHAIN_VERSION", file.toolchain_version, path)
                .unwrap_or_else(|| {
                    missing.push("toolchain_version");
                    Sourced::default_value(String::new())
                });
        let runtime_version =
            required_string(&mut env, "RUNTIME_VERSION", file.runtime_version, path)
                .unwrap_or_else(|| {
                    missing.push("runtime_version");
                    Sourced::default_value(String::new())
                });

        if env.has_errors() {
            return Err(RunnerConfigError::Env(
                env.take_errors().iter().map(ToString::to_string).collect(),
            ));
        }
        if !missing.is_empty() {
            return Err(RunnerConfigError::Missing(missing));
        }

        let ledger_url = ledger_url.map(|url| normalize_url(&url));
        reqwest::Url::parse(&ledger_url.value).map_err(|e| RunnerConfigError::InvalidUrl {
            url: ledger_url.value.clone(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            ledger_url,
            runner_name,
            runner_key,
            build_dir,
            wrapper_build_dir,
            cts_build_dir,
            catalog,
            dump_root,
            lit_test_dir,
            lit_max_time_secs,
            make_jobs,
            idle_interval_secs,
            suite_version,
            toolchain_version,
            runtime_version,
        })
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.idle_interval_secs.value)
    }

    /// Directories that must exist before the runner can build or test.
    pub fn missing_directories(&self) -> Vec<(&'static str, &Path)> {
        [
            ("build_dir", self.build_dir.value.as_path()),
            ("wrapper_build_dir", self.wrapper_build_dir.value.as_path()),
            ("cts_build_dir", self.cts_build_dir.value.as_path()),
        ]
        .into_iter()
        .filter(|(_, dir)| !dir.is_dir())
        .collect()
    }

    /// `(setting, value, origin)` rows for `check-config`. The key is masked.
    pub fn describe(&self) -> Vec<(&'static str, String, String)> {
        fn row<T>(name: &'static str, value: String, s: &Sourced<T>) -> (&'static str, String, String) {
            (name, value, s.describe_source())
        }
        fn path(p: &Sourced<PathBuf>) -> String {
            p.value.display().to_string()
        }

        vec![
            row("ledger_url", self.ledger_url.value.clone(), &self.ledger_url),
            row("runner_name", self.runner_name.value.clone(), &self.runner_name),
            row("runner_key", "********".to_string(), &self.runner_key),
            row("build_dir", path(&self.build_dir), &self.build_dir),
            row("wrapper_build_dir", path(&self.wrapper_build_dir), &self.wrapper_build_dir),
            row("cts_build_dir", path(&self.cts_build_dir), &self.cts_build_dir),
            row("catalog", path(&self.catalog), &self.catalog),
            row("dump_root", path(&self.dump_root), &self.dump_root),
            row("lit_test_dir", path(&self.lit_test_dir), &self.lit_test_dir),
            row(
                "lit_max_time_secs",
                self.lit_max_time_secs.value.to_string(),
                &self.lit_max_time_secs,
            ),
            row("make_jobs", self.make_jobs.value.to_string(), &self.make_jobs),
            row(
                "idle_interval_secs",
                self.idle_interval_secs.value.to_string(),
                &self.idle_interval_secs,
            ),
            row("suite_version", self.suite_version.value.clone(), &self.suite_version),
            row(
                "toolchain_version",
                self.toolchain_version.value.clone(),
                &self.toolchain_version,
            ),
            row("runtime_version", self.runtime_version.value.clone(), &self.runtime_version),
        ]
    }
}

fn normalize_url(url: &str) -> String {
    let trimmed = url.trim();
    if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    }
}

fn from_file<T>(value: Option<T>, path: Option<&Path>) -> Option<Sourced<T>> {
    match (value, path) {
        (Some(value), Some(path)) => Some(Sourced::from_file(value, path)),
        _ => None,
    }
}

fn required_string(
    env: &mut EnvParser,
    var: &str,
    file_value: Option<String>,
    path: Option<&Path>,
) -> Option<Sourced<String>> {
    let from_env = env.get_optional_string(var);
    match from_env.value {
        Some(value) => Some(Sourced::from_env(value, from_env.env_var.unwrap_or_default())),
        None => from_file(file_value.filter(|v| !v.is_empty()), path),
    }
}

fn optional_path(
    env: &mut EnvParser,
    var: &str,
    file_value: Option<String>,
    path: Option<&Path>,
) -> Option<Sourced<PathBuf>> {
    let from_env = env.get_optional_path(var);
    match from_env.value {
        Some(value) => Some(Sourced::from_env(value, from_env.env_var.unwrap_or_default())),
        None => from_file(
            file_value.filter(|v| !v.is_empty()).map(|v| expand_path(&v)),
            path,
        ),
    }
}

fn number(
    env: &mut EnvParser,
    var: &str,
    file_value: Option<u64>,
    path: Option<&Path>,
    default: u64,
    min: u64,
    max: u64,
) -> Sourced<u64> {
    let base = from_file(file_value, path).unwrap_or_else(|| Sourced::default_value(default));
    base.or(env.get_u64_range(var, default, min, max))
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use cbt_common::config::ConfigSource;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "CBT_LEDGER_URL",
        "CBT_RUNNER_NAME",
        "CBT_RUNNER_KEY",
        "CBT_BUILD_DIR",
        "CBT_WRAPPER_BUILD_DIR",
        "CBT_CTS_BUILD_DIR",
        "CBT_CATALOG",
        "CBT_DUMP_ROOT",
        "CBT_LIT_TEST_DIR",
        "CBT_LIT_MAX_TIME",
        "CBT_MAKE_JOBS",
        "CBT_IDLE_INTERVAL",
        "CBT_SUITE_VERSION",
        "CBT_TOOLCHAIN_VERSION",
        "CBT_RUNTIME_VERSION",
    ];

    fn clear_env() {
        for var in VARS {
            // SAFETY: tests touching the environment are #[serial]
            unsafe { std::env::remove_var(var) };
        }
    }

    fn set_env(key: &str, value: &str) {
        // SAFETY: tests touching the environment are #[serial]
        unsafe { std::env::set_var(key, value) };
    }

    fn write_config(dir: &Path) -> PathBuf {
        let path = dir.join("runner.toml");
        std::fs::write(
            &path,
            r#"
ledger_url = "http://ledger.local:8000/api"
runner_name = "runner-1"
runner_key = "from-file"
build_dir = "/opt/llvm/build"
wrapper_build_dir = "/opt/wrapper/build"
cts_build_dir = "/opt/cts/build"
make_jobs = 8
suite_version = "v2023"
toolchain_version = "1.0"
runtime_version = "23.1"
"#,
        )
        .unwrap();
        path
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path());

        let config = RunnerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.ledger_url.value, "http://ledger.local:8000/api/");
        assert_eq!(config.ledger_url.source, ConfigSource::File);
        assert_eq!(config.make_jobs.value, 8);
        assert_eq!(config.idle_interval(), Duration::from_secs(180));
        assert_eq!(config.lit_max_time_secs.value, 30);
        assert_eq!(config.catalog.value, PathBuf::from("cts.json"));
        assert_eq!(
            config.lit_test_dir.value,
            PathBuf::from("/opt/llvm/build/../llvm/test/CodeGen/SPIRV/")
        );
    }

    #[test]
    #[serial]
    fn test_environment_overrides_file() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path());
        set_env("CBT_RUNNER_KEY", "from-env");
        set_env("CBT_IDLE_INTERVAL", "5");

        let config = RunnerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.runner_key.value, "from-env");
        assert_eq!(config.runner_key.source, ConfigSource::Environment);
        assert_eq!(config.idle_interval(), Duration::from_secs(5));
        assert_eq!(
            config.idle_interval_secs.describe_source(),
            "environment (CBT_IDLE_INTERVAL)"
        );
        clear_env();
    }

    #[test]
    #[serial]
    fn test_missing_settings_are_reported_together() {
        clear_env();
        set_env("CBT_LEDGER_URL", "http://ledger.local/");

        let err = RunnerConfig::load(None).unwrap_err();
        match &err {
            RunnerConfigError::Missing(names) => {
                assert!(names.contains(&"runner_name"));
                assert!(names.contains(&"runner_key"));
                assert!(names.contains(&"build_dir"));
                assert!(names.contains(&"runtime_version"));
                assert!(!names.contains(&"ledger_url"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.code(), ErrorCode::ConfigMissingCredentials);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_environment_value() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path());
        set_env("CBT_MAKE_JOBS", "lots");

        let err = RunnerConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, RunnerConfigError::Env(_)));
        assert_eq!(err.code(), ErrorCode::ConfigEnvError);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_url() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path());
        set_env("CBT_LEDGER_URL", "not a url");

        let err = RunnerConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, RunnerConfigError::InvalidUrl { .. }));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_describe_masks_key() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path());
        let config = RunnerConfig::load(Some(&path)).unwrap();

        let rows = config.describe();
        let key = rows.iter().find(|(name, _, _)| *name == "runner_key").unwrap();
        assert_eq!(key.1, "********");
        assert!(!rows.iter().any(|(_, value, _)| value.contains("from-file")));
        assert_eq!(config.missing_directories().len(), 3);
    }

    #[test]
    fn test_unknown_file_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.toml");
        std::fs::write(&path, "ledger_ur = \"typo\"\n").unwrap();
        let err = RunnerConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(
            err,
            RunnerConfigError::File(ConfigFileError::Parse { .. })
        ));
    }
}
