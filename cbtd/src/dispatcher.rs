//! Primary job creation.

use crate::ledger::{Ledger, LedgerError};
use cbt_common::{JobId, TestGroups};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Periodically queues a primary job for every new, non-skipped revision.
pub struct Dispatcher {
    ledger: Arc<Ledger>,
    groups: TestGroups,
    interval: Duration,
}

impl Dispatcher {
    pub fn new(ledger: Arc<Ledger>, groups: TestGroups, interval: Duration) -> Self {
        Self {
            ledger,
            groups,
            interval,
        }
    }

    pub fn run_once(&self) -> Result<Vec<JobId>, LedgerError> {
        let created = self.ledger.create_primary_jobs(&self.groups)?;
        if created.is_empty() {
            debug!("Dispatcher: no new revisions");
        } else {
            info!("Dispatcher queued {} primary jobs", created.len());
        }
        Ok(created)
    }

    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Dispatcher started (interval={}, groups={})",
                humantime::format_duration(self.interval),
                self.groups.enabled().count()
            );
            let mut ticker = interval(self.interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once() {
                    warn!(error_code = %e.code().code_string(), "Dispatcher run failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use cbt_common::{JobStatus, RevisionBody};
    use chrono::Utc;

    fn primary_groups() -> TestGroups {
        DaemonConfig::default().primary_groups()
    }

    fn add_revision(ledger: &Ledger, hash: &str) {
        ledger
            .upsert_revision(RevisionBody {
                hash: hash.to_string(),
                title: hash.to_string(),
                branch: "main".to_string(),
                staging: false,
                date: Utc::now(),
                skip: false,
            })
            .unwrap();
    }

    #[test]
    fn test_run_once_queues_primary_jobs() {
        let ledger = Arc::new(Ledger::new());
        add_revision(&ledger, "abc");
        let dispatcher = Dispatcher::new(
            Arc::clone(&ledger),
            primary_groups(),
            Duration::from_secs(600),
        );

        let created = dispatcher.run_once().unwrap();
        assert_eq!(created.len(), 1);
        let job = ledger.job(created[0]).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.groups.lit_all());
        assert!(dispatcher.run_once().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_picks_up_new_revisions() {
        let ledger = Arc::new(Ledger::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&ledger),
            primary_groups(),
            Duration::from_secs(600),
        ));
        let handle = Arc::clone(&dispatcher).start();

        tokio::time::sleep(Duration::from_secs(1)).await;
        add_revision(&ledger, "abc");
        assert_eq!(ledger.stats().queued, 0);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(ledger.stats().queued, 1);
        handle.abort();
    }
}
