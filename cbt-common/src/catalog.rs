//! CTS test catalog.
//!
//! The catalog is a JSON array of test definitions:
//!
//! ```json
//! [
//!   {
//!     "test_category": "basic",
//!     "test_name": "test1",
//!     "executable_path": "test_conformance/basic/test_basic",
//!     "arguments": ["arraycopy"],
//!     "environment": ["CL_CONFORMANCE_FORCE_SPIRV"],
//!     "timeout_secs": 14400
//!   }
//! ]
//! ```
//!
//! `arguments` may also be a single string, split on whitespace.

use crate::errors::ErrorCode;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default per-test budget: four hours.
pub const DEFAULT_TEST_TIMEOUT_SECS: u64 = 4 * 60 * 60;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("test catalog not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read test catalog {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed test catalog: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid catalog entry #{index}: {reason}")]
    InvalidEntry { index: usize, reason: String },

    #[error("test {category}/{name} is not in the catalog")]
    UnknownTest { category: String, name: String },
}

impl CatalogError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::CatalogNotFound,
            Self::Read { .. } | Self::Parse(_) => ErrorCode::CatalogParseError,
            Self::InvalidEntry { .. } | Self::UnknownTest { .. } => ErrorCode::CatalogInvalidEntry,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
enum Arguments {
    List(Vec<String>),
    Line(String),
}

impl Default for Arguments {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl From<Arguments> for Vec<String> {
    fn from(args: Arguments) -> Self {
        match args {
            Arguments::List(list) => list,
            Arguments::Line(line) => line.split_whitespace().map(str::to_string).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    test_category: String,
    test_name: String,
    executable_path: PathBuf,
    #[serde(default)]
    arguments: Arguments,
    #[serde(default)]
    environment: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TEST_TIMEOUT_SECS
}

/// One CTS test definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub test_category: String,
    pub test_name: String,
    /// Relative to the CTS build directory.
    pub executable_path: PathBuf,
    pub arguments: Vec<String>,
    /// Variables set to `1` for the run.
    pub environment: Vec<String>,
    pub timeout_secs: u64,
}

impl CatalogEntry {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Absolute executable path under `cts_dir`.
    pub fn resolve_executable(&self, cts_dir: &Path) -> PathBuf {
        cts_dir.join(&self.executable_path)
    }

    /// Argument string as reported to the ledger.
    pub fn argument_string(&self) -> String {
        self.arguments.join(" ")
    }
}

/// Read-only list of CTS tests, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TestCatalog {
    entries: Vec<CatalogEntry>,
}

impl TestCatalog {
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let contents = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                CatalogError::NotFound(path.to_path_buf())
            } else {
                CatalogError::Read {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let raw: Vec<RawEntry> = serde_json::from_str(json)?;
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(raw.len());

        for (index, entry) in raw.into_iter().enumerate() {
            let invalid = |reason: &str| CatalogError::InvalidEntry {
                index,
                reason: reason.to_string(),
            };
            if entry.test_category.trim().is_empty() {
                return Err(invalid("empty test_category"));
            }
            if entry.test_name.trim().is_empty() {
                return Err(invalid("empty test_name"));
            }
            if entry.executable_path.as_os_str().is_empty() {
                return Err(invalid("empty executable_path"));
            }
            if entry.timeout_secs == 0 {
                return Err(invalid("timeout_secs must be positive"));
            }
            if !seen.insert((entry.test_category.clone(), entry.test_name.clone())) {
                return Err(CatalogError::InvalidEntry {
                    index,
                    reason: format!(
                        "duplicate test {}/{}",
                        entry.test_category, entry.test_name
                    ),
                });
            }

            entries.push(CatalogEntry {
                test_category: entry.test_category,
                test_name: entry.test_name,
                executable_path: entry.executable_path,
                arguments: entry.arguments.into(),
                environment: entry.environment,
                timeout_secs: entry.timeout_secs,
            });
        }

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, category: &str, name: &str) -> Result<&CatalogEntry, CatalogError> {
        self.entries
            .iter()
            .find(|e| e.test_category == category && e.test_name == name)
            .ok_or_else(|| CatalogError::UnknownTest {
                category: category.to_string(),
                name: name.to_string(),
            })
    }

    pub fn entries_for_category<'a>(
        &'a self,
        category: &'a str,
    ) -> impl Iterator<Item = &'a CatalogEntry> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.test_category == category)
    }

    /// Distinct categories, in first-seen order.
    pub fn categories(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .filter(|e| seen.insert(e.test_category.as_str()))
            .map(|e| e.test_category.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"[
        {"test_category": "basic", "test_name": "test1",
         "executable_path": "basic/test_basic", "arguments": ["arraycopy", "-w"],
         "environment": ["CL_FORCE_SPIRV"]},
        {"test_category": "api", "test_name": "queries",
         "executable_path": "api/test_api", "arguments": "get_platform_info  retain",
         "timeout_secs": 60},
        {"test_category": "basic", "test_name": "test2",
         "executable_path": "basic/test_basic"}
    ]"#;

    #[test]
    fn test_parse_catalog() {
        let catalog = TestCatalog::from_json(SAMPLE).unwrap();
        assert_eq!(catalog.len(), 3);

        let test1 = catalog.get("basic", "test1").unwrap();
        assert_eq!(test1.arguments, vec!["arraycopy", "-w"]);
        assert_eq!(test1.environment, vec!["CL_FORCE_SPIRV"]);
        assert_eq!(test1.timeout(), Duration::from_secs(DEFAULT_TEST_TIMEOUT_SECS));
        assert_eq!(
            test1.resolve_executable(Path::new("/opt/cts")),
            PathBuf::from("/opt/cts/basic/test_basic")
        );

        let queries = catalog.get("api", "queries").unwrap();
        assert_eq!(queries.arguments, vec!["get_platform_info", "retain"]);
        assert_eq!(queries.argument_string(), "get_platform_info retain");
        assert_eq!(queries.timeout_secs, 60);

        assert!(catalog.get("basic", "test2").unwrap().arguments.is_empty());
    }

    #[test]
    fn test_category_lookup_keeps_file_order() {
        let catalog = TestCatalog::from_json(SAMPLE).unwrap();
        let names: Vec<_> = catalog
            .entries_for_category("basic")
            .map(|e| e.test_name.as_str())
            .collect();
        assert_eq!(names, vec!["test1", "test2"]);
        assert_eq!(catalog.categories(), vec!["basic", "api"]);
        assert_eq!(catalog.entries_for_category("printf").count(), 0);
    }

    #[test]
    fn test_unknown_test() {
        let catalog = TestCatalog::from_json(SAMPLE).unwrap();
        let err = catalog.get("basic", "nope").unwrap_err();
        assert!(matches!(err, CatalogError::UnknownTest { .. }));
    }

    #[test]
    fn test_malformed_catalog_is_rejected() {
        let err = TestCatalog::from_json("{not json").unwrap_err();
        assert_eq!(err.code(), ErrorCode::CatalogParseError);

        let missing_field = r#"[{"test_category": "basic", "test_name": "t"}]"#;
        assert!(matches!(
            TestCatalog::from_json(missing_field),
            Err(CatalogError::Parse(_))
        ));

        let duplicate = r#"[
            {"test_category": "a", "test_name": "t", "executable_path": "x"},
            {"test_category": "a", "test_name": "t", "executable_path": "y"}
        ]"#;
        assert!(matches!(
            TestCatalog::from_json(duplicate),
            Err(CatalogError::InvalidEntry { index: 1, .. })
        ));

        let zero_timeout =
            r#"[{"test_category": "a", "test_name": "t", "executable_path": "x", "timeout_secs": 0}]"#;
        assert!(TestCatalog::from_json(zero_timeout).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cts.json");
        std::fs::write(&path, SAMPLE).unwrap();
        assert_eq!(TestCatalog::load(&path).unwrap().len(), 3);

        let err = TestCatalog::load(&dir.path().join("missing.json")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CatalogNotFound);
    }
}
