//! Storage for uploaded dump archives and their retention sweep.

use crate::ledger::Ledger;
use cbt_common::ErrorCode;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

const DUMP_SUBDIR: &str = "dumps";

/// Dump blobs under `<media>/dumps/<uuid>-<name>`.
#[derive(Debug, Clone)]
pub struct DumpStore {
    media_dir: PathBuf,
}

impl DumpStore {
    pub fn new(media_dir: impl Into<PathBuf>) -> Self {
        Self {
            media_dir: media_dir.into(),
        }
    }

    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }

    /// Store an uploaded archive. Returns its name relative to the media
    /// directory.
    pub async fn store(&self, file_name: Option<&str>, bytes: &[u8]) -> std::io::Result<String> {
        let dir = self.media_dir.join(DUMP_SUBDIR);
        tokio::fs::create_dir_all(&dir).await?;

        let name = format!(
            "{}-{}",
            uuid::Uuid::new_v4(),
            sanitize_file_name(file_name.unwrap_or("dump.tar.gz"))
        );
        tokio::fs::write(dir.join(&name), bytes).await?;

        let relative = format!("{DUMP_SUBDIR}/{name}");
        debug!("Stored dump {} ({} bytes)", relative, bytes.len());
        Ok(relative)
    }

    /// Delete a stored blob. A missing file is not an error.
    pub async fn remove(&self, relative: &str) -> std::io::Result<()> {
        match tokio::fs::remove_file(self.media_dir.join(relative)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Keep only the final path component and a conservative character set.
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "dump.tar.gz".to_string()
    } else {
        cleaned
    }
}

/// Periodically deletes dumps older than the retention window.
pub struct DumpRetention {
    ledger: Arc<Ledger>,
    store: DumpStore,
    retention: Duration,
    interval: Duration,
}

impl DumpRetention {
    pub fn new(ledger: Arc<Ledger>, store: DumpStore, retention: Duration, interval: Duration) -> Self {
        Self {
            ledger,
            store,
            retention,
            interval,
        }
    }

    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Dump retention started (keep={}, every={})",
                humantime::format_duration(self.retention),
                humantime::format_duration(self.interval)
            );

            let mut ticker = interval(self.interval);
            loop {
                ticker.tick().await;
                let removed = self.sweep().await;
                if removed > 0 {
                    info!("Dump retention removed {} dumps", removed);
                } else {
                    debug!("Dump retention: nothing expired");
                }
            }
        })
    }

    /// Run one sweep. Returns the number of blobs removed.
    pub async fn sweep(&self) -> usize {
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::days(60));
        let cutoff = Utc::now() - retention;

        let expired = match self.ledger.take_expired_dumps(cutoff) {
            Ok(expired) => expired,
            Err(e) => {
                warn!(error_code = %e.code().code_string(), "Dump retention skipped: {}", e);
                return 0;
            }
        };

        let mut removed = 0;
        for dump in expired {
            match self.store.remove(&dump).await {
                Ok(()) => {
                    debug!("Deleted dump {}", dump);
                    removed += 1;
                }
                Err(e) => warn!(
                    error_code = %ErrorCode::DumpCleanupFailed.code_string(),
                    "Failed to delete dump {}: {}", dump, e
                ),
            }
        }
        removed
    }
}
