//! TOML configuration files.

use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::errors::ErrorCode;

#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigFileError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::ConfigNotFound,
            Self::Read { .. } => ErrorCode::ConfigReadError,
            Self::Parse { .. } => ErrorCode::ConfigParseError,
        }
    }
}

/// Read and deserialize a TOML file.
pub fn load_toml_file<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigFileError> {
    let contents = std::fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ConfigFileError::NotFound(path.to_path_buf())
        } else {
            ConfigFileError::Read {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;

    toml::from_str(&contents).map_err(|source| ConfigFileError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Default per-user configuration directory (`~/.config/cbt`).
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("cbt"))
}
