//! The runner loop: lease, build, test, report.

use crate::config::RunnerConfig;
use crate::harness::{CtsHarness, LitRunner};
use crate::pipeline::{BuildPipeline, BuildStage};
use crate::transport::{LedgerClient, TransportError};
use cbt_common::{CtsResult, ErrorCode, JobBody, JobId, JobStatus, StatusUpdate, TestCatalog};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Builds the pipeline for a revision hash.
pub type BuildPlan = Arc<dyn Fn(&str) -> BuildPipeline + Send + Sync>;

/// How a leased job ended for this runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    BuildFailed(BuildStage),
    /// The job left TESTING while the runner was working on it.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll {
    /// No queued job.
    Idle,
    Processed(JobId, JobOutcome),
}

pub struct Orchestrator {
    client: LedgerClient,
    catalog: TestCatalog,
    lit: LitRunner,
    cts: CtsHarness,
    plan: BuildPlan,
    idle_interval: Duration,
}

impl Orchestrator {
    pub fn new(config: &RunnerConfig, client: LedgerClient, catalog: TestCatalog) -> Self {
        let plan_config = config.clone();
        Self {
            client,
            catalog,
            lit: LitRunner::from_config(config),
            cts: CtsHarness::from_config(config),
            plan: Arc::new(move |revision: &str| BuildPipeline::standard(&plan_config, revision)),
            idle_interval: config.idle_interval(),
        }
    }

    /// Replace the standard checkout and build steps.
    pub fn with_build_plan(mut self, plan: BuildPlan) -> Self {
        self.plan = plan;
        self
    }

    /// Poll forever. Returns only on a fatal transport error.
    pub async fn run_forever(&self) -> Result<(), TransportError> {
        info!(
            "Runner {} polling for jobs (idle interval {})",
            self.client.runner_name(),
            humantime::format_duration(self.idle_interval)
        );
        loop {
            match self.run_once().await {
                Ok(Poll::Idle) => tokio::time::sleep(self.idle_interval).await,
                Ok(Poll::Processed(..)) => {}
                Err(e) if e.is_not_found() => {
                    warn!(
                        error_code = %e.code().code_string(),
                        "Job vanished from the ledger: {}", e
                    );
                }
                Err(e) => {
                    error!(error_code = %e.code().code_string(), "Giving up: {}", e);
                    return Err(e);
                }
            }
        }
    }

    /// Lease and process at most one job.
    pub async fn run_once(&self) -> Result<Poll, TransportError> {
        let Some(job) = self.client.lease().await? else {
            info!("No queued jobs");
            return Ok(Poll::Idle);
        };
        let id = job.id;
        let outcome = self.process(job).await?;
        Ok(Poll::Processed(id, outcome))
    }

    /// Take a leased job through build and tests.
    pub async fn process(&self, job: JobBody) -> Result<JobOutcome, TransportError> {
        let id = job.id;
        info!(job_id = %id, revision = %job.revision_hash, "Testing job");

        if !self.set_status(id, StatusUpdate::new(JobStatus::Testing)).await? {
            return Ok(JobOutcome::Cancelled);
        }

        let pipeline = (self.plan)(&job.revision_hash);
        if let Err(failure) = pipeline.run().await {
            let update = StatusUpdate::new(JobStatus::BuildFailed).with_details(failure.to_string());
            if !self.set_status(id, update).await? {
                return Ok(JobOutcome::Cancelled);
            }
            info!(job_id = %id, step = %failure.stage, "Build failed");
            return Ok(JobOutcome::BuildFailed(failure.stage));
        }

        if !self.still_testing(id).await? {
            return Ok(JobOutcome::Cancelled);
        }

        if job.groups.lit_all() {
            self.run_lit(id).await?;
        }

        if !self.run_cts(id, &job).await? {
            return Ok(JobOutcome::Cancelled);
        }

        if !self.set_status(id, StatusUpdate::new(JobStatus::Completed)).await? {
            return Ok(JobOutcome::Cancelled);
        }
        info!(job_id = %id, revision = %job.revision_hash, "Finished testing job");
        Ok(JobOutcome::Completed)
    }

    /// Write a status. `false` when the ledger kept another one, which
    /// means the job was taken away from this runner.
    async fn set_status(&self, id: JobId, update: StatusUpdate) -> Result<bool, TransportError> {
        let requested = update.status;
        let current = self.client.update_status(id, &update).await?;
        if current.status != requested {
            info!(
                job_id = %id,
                "Job is {} instead of {}; dropping it",
                current.status,
                requested
            );
            return Ok(false);
        }
        Ok(true)
    }

    async fn still_testing(&self, id: JobId) -> Result<bool, TransportError> {
        let status = self.client.job_status(id).await?;
        if status != JobStatus::Testing {
            info!(job_id = %id, "Job was cancelled (now {})", status);
            return Ok(false);
        }
        Ok(true)
    }

    async fn run_lit(&self, id: JobId) -> Result<(), TransportError> {
        let results = match self.lit.run().await {
            Ok(results) => results,
            Err(e) => {
                error!(job_id = %id, error_code = %e.code().code_string(), "LIT run failed: {}", e);
                return Ok(());
            }
        };
        for result in &results {
            info!(job_id = %id, "{}", result);
            self.client.post_lit_result(id, result).await?;
        }
        Ok(())
    }

    /// Run every catalog test in an enabled category. `false` on cancellation.
    async fn run_cts(&self, id: JobId, job: &JobBody) -> Result<bool, TransportError> {
        let enabled: BTreeSet<&str> = self
            .catalog
            .categories()
            .into_iter()
            .filter(|category| job.groups.cts_category(category))
            .collect();
        self.warn_unknown_categories(job);

        for entry in self.catalog.entries() {
            if !enabled.contains(entry.test_category.as_str()) {
                continue;
            }
            if !self.still_testing(id).await? {
                return Ok(false);
            }

            let result = self.cts.run(entry).await;
            info!(
                job_id = %id,
                test_category = %entry.test_category,
                test_name = %entry.test_name,
                "{}", result
            );
            post_cts_result(&self.client, id, &result).await?;

            if let Some(dump) = &result.dump_path
                && let Err(e) = tokio::fs::remove_file(dump).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(
                    error_code = %ErrorCode::DumpCleanupFailed.code_string(),
                    "Failed to delete {}: {}", dump.display(), e
                );
            }
        }
        Ok(true)
    }

    fn warn_unknown_categories(&self, job: &JobBody) {
        let known = self.catalog.categories();
        for group in job.groups.enabled() {
            if let Some(category) = group.strip_prefix(cbt_common::types::CTS_GROUP_PREFIX)
                && !known.contains(&category)
            {
                warn!(
                    error_code = %ErrorCode::TestCategoryEmpty.code_string(),
                    "Job {} enables CTS category {} but the catalog has no tests for it",
                    job.id,
                    category
                );
            }
        }
    }
}

/// Post a CTS result. When its dump archive cannot be read the result is
/// posted without it.
pub(crate) async fn post_cts_result(
    client: &LedgerClient,
    id: JobId,
    result: &CtsResult,
) -> Result<(), TransportError> {
    match client.post_cts_result(id, result).await {
        Err(TransportError::Attachment { path, source }) => {
            warn!(
                job_id = %id,
                test_category = %result.test_category,
                test_name = %result.test_name,
                error_code = %ErrorCode::DumpAttachFailed.code_string(),
                "Posting result without dump {}: {}", path.display(), source
            );
            let without_dump = CtsResult {
                dump_path: None,
                ..result.clone()
            };
            client.post_cts_result(id, &without_dump).await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbt_common::{RevisionBody, TestGroups, cts_group};
    use cbtd::{AppState, Credential, DaemonConfig, Ledger, create_router, serve};
    use std::path::PathBuf;

    async fn spawn_ledger(ledger: Arc<Ledger>, media: &std::path::Path) -> String {
        let config = DaemonConfig {
            media_dir: media.to_path_buf(),
            credentials: vec![Credential {
                name: "runner-1".to_string(),
                key: "secret".to_string(),
                operator: false,
            }],
            ..DaemonConfig::default()
        };
        let router = create_router(AppState::new(ledger, &config));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/")
    }

    fn failed_result(dump_path: PathBuf) -> CtsResult {
        let now = chrono::Utc::now();
        CtsResult {
            test_category: "basic".to_string(),
            test_name: "test1".to_string(),
            passing: false,
            timedout: false,
            start_time: now,
            end_time: now,
            standard_output: "FAILED test.".to_string(),
            standard_error: String::new(),
            test_executable: "bin/test_basic".to_string(),
            test_arguments: String::new(),
            suite_version: String::new(),
            toolchain_version: String::new(),
            runtime_version: String::new(),
            dump_path: Some(dump_path),
        }
    }

    #[tokio::test]
    async fn test_result_is_kept_when_dump_disappears() {
        let media = tempfile::tempdir().unwrap();
        let ledger = Arc::new(Ledger::new());
        ledger
            .upsert_revision(RevisionBody {
                hash: "abc".to_string(),
                title: "t".to_string(),
                branch: "main".to_string(),
                staging: false,
                date: chrono::Utc::now(),
                skip: false,
            })
            .unwrap();
        let job = ledger
            .enqueue("abc", TestGroups::new().with(cts_group("basic"), true), false)
            .unwrap();
        let url = spawn_ledger(Arc::clone(&ledger), media.path()).await;
        let client = LedgerClient::new(url, "runner-1", "secret").unwrap();

        let dumps = tempfile::tempdir().unwrap();
        let archive = dumps.path().join("basic_test1.tar.gz");
        std::fs::write(&archive, b"archive").unwrap();
        let result = failed_result(archive.clone());
        std::fs::remove_file(&archive).unwrap();

        post_cts_result(&client, job.id, &result).await.unwrap();

        let stored = ledger.cts_results(job.id);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].submission.standard_output, "FAILED test.");
        assert!(stored[0].dump.is_none());
    }
}
