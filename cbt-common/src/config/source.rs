//! Source tracking for configuration values.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// Where a configuration value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    /// Built-in default.
    Default,
    /// Configuration file.
    File,
    /// `CBT_*` environment variable.
    Environment,
    /// Command-line flag.
    CommandLine,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Default => "default",
            Self::File => "file",
            Self::Environment => "environment",
            Self::CommandLine => "command line",
        };
        write!(f, "{name}")
    }
}

/// A value paired with its origin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigSource,
    /// Environment variable that supplied the value.
    pub env_var: Option<String>,
    /// File that supplied the value.
    pub file: Option<PathBuf>,
}

impl<T> Sourced<T> {
    pub fn default_value(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::Default,
            env_var: None,
            file: None,
        }
    }

    pub fn from_env(value: T, var: impl Into<String>) -> Self {
        Self {
            value,
            source: ConfigSource::Environment,
            env_var: Some(var.into()),
            file: None,
        }
    }

    pub fn from_file(value: T, path: &Path) -> Self {
        Self {
            value,
            source: ConfigSource::File,
            env_var: None,
            file: Some(path.to_path_buf()),
        }
    }

    pub fn from_cli(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::CommandLine,
            env_var: None,
            file: None,
        }
    }

    /// Use `other` unless it only carries a default.
    pub fn or(self, other: Sourced<T>) -> Sourced<T> {
        if other.source == ConfigSource::Default {
            self
        } else {
            other
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Sourced<U> {
        Sourced {
            value: f(self.value),
            source: self.source,
            env_var: self.env_var,
            file: self.file,
        }
    }

    /// Human-readable origin, e.g. `environment (CBT_RUNNER_NAME)`.
    pub fn describe_source(&self) -> String {
        match (&self.env_var, &self.file) {
            (Some(var), _) => format!("{} ({})", self.source, var),
            (None, Some(path)) => format!("{} ({})", self.source, path.display()),
            (None, None) => self.source.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_overrides_file() {
        let file = Sourced::from_file(3u64, Path::new("/etc/cbt/runner.toml"));
        let env = Sourced::from_env(5u64, "CBT_X");
        let merged = file.clone().or(env);
        assert_eq!(merged.value, 5);
        assert_eq!(merged.source, ConfigSource::Environment);

        let merged = file.or(Sourced::default_value(9));
        assert_eq!(merged.value, 3);
        assert_eq!(merged.source, ConfigSource::File);
    }

    #[test]
    fn test_describe_source() {
        assert_eq!(
            Sourced::from_env("a", "CBT_RUNNER_NAME").describe_source(),
            "environment (CBT_RUNNER_NAME)"
        );
        assert_eq!(Sourced::default_value(1).describe_source(), "default");
        assert_eq!(
            Sourced::from_file(1, Path::new("r.toml")).describe_source(),
            "file (r.toml)"
        );
    }
}
