//! Daemon configuration.
//!
//! Loaded from an optional TOML file; command-line flags override the file.
//!
//! ```toml
//! bind = "0.0.0.0:8000"
//! state_file = "/var/lib/cbt/ledger.json"
//! media_dir = "/var/lib/cbt/media"
//!
//! [[credentials]]
//! name = "runner-1"
//! key = "secret"
//!
//! [[credentials]]
//! name = "admin"
//! key = "other-secret"
//! operator = true
//! ```

use anyhow::{Context, bail};
use cbt_common::config::load_toml_file;
use cbt_common::{DEFAULT_CTS_CATEGORIES, LIT_ALL_GROUP, TestGroups, cts_group};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Basic-auth identity accepted by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Credential {
    pub name: String,
    pub key: String,
    /// May register revisions, enqueue and cancel jobs.
    #[serde(default)]
    pub operator: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub bind: SocketAddr,
    pub state_file: Option<PathBuf>,
    pub media_dir: PathBuf,
    pub credentials: Vec<Credential>,
    /// Primary-job creation interval.
    pub dispatch_interval_secs: u64,
    /// Dump retention sweep interval.
    pub retention_interval_secs: u64,
    pub dump_retention_days: u64,
    /// CTS categories enabled on primary jobs.
    pub primary_cts_categories: Vec<String>,
    pub primary_lit: bool,
    /// Largest accepted CTS submission, dump included.
    pub max_upload_bytes: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8000)),
            state_file: None,
            media_dir: PathBuf::from("media"),
            credentials: Vec::new(),
            dispatch_interval_secs: 10 * 60,
            retention_interval_secs: 24 * 60 * 60,
            dump_retention_days: 60,
            primary_cts_categories: DEFAULT_CTS_CATEGORIES
                .iter()
                .map(|c| (*c).to_string())
                .collect(),
            primary_lit: true,
            max_upload_bytes: 512 * 1024 * 1024,
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config: Self = load_toml_file(path)
            .with_context(|| format!("failed to load daemon config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.credentials.is_empty() {
            bail!("no credentials configured; every ledger call requires basic auth");
        }
        for credential in &self.credentials {
            if credential.name.is_empty() || credential.key.is_empty() {
                bail!("credential entries need a non-empty name and key");
            }
        }
        if self.dispatch_interval_secs == 0 || self.retention_interval_secs == 0 {
            bail!("dispatcher and retention intervals must be positive");
        }
        Ok(())
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_interval_secs)
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_secs)
    }

    pub fn dump_retention(&self) -> Duration {
        Duration::from_secs(self.dump_retention_days * 24 * 60 * 60)
    }

    /// Test groups enabled on every primary job.
    pub fn primary_groups(&self) -> TestGroups {
        let mut groups = TestGroups::new();
        groups.set(LIT_ALL_GROUP, self.primary_lit);
        for category in &self.primary_cts_categories {
            groups.set(cts_group(category), true);
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.dispatch_interval(), Duration::from_secs(600));
        assert_eq!(config.retention_interval(), Duration::from_secs(86_400));
        assert_eq!(config.dump_retention(), Duration::from_secs(60 * 86_400));
        let groups = config.primary_groups();
        assert!(groups.lit_all());
        for category in DEFAULT_CTS_CATEGORIES {
            assert!(groups.cts_category(category), "{category} disabled");
        }
        assert_eq!(groups.enabled().count(), DEFAULT_CTS_CATEGORIES.len() + 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cbtd.toml");
        std::fs::write(
            &path,
            r#"
bind = "0.0.0.0:9000"
state_file = "/var/lib/cbt/ledger.json"
primary_cts_categories = ["basic", "api"]
primary_lit = false

[[credentials]]
name = "runner-1"
key = "secret"

[[credentials]]
name = "admin"
key = "hunter2"
operator = true
"#,
        )
        .unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.bind.port(), 9000);
        assert_eq!(config.credentials.len(), 2);
        assert!(config.credentials[1].operator);
        assert!(!config.credentials[0].operator);

        let groups = config.primary_groups();
        assert!(!groups.lit_all());
        assert!(groups.cts_category("basic"));
        assert!(!groups.cts_category("printf"));
        assert_eq!(config.media_dir, PathBuf::from("media"));
    }
}
