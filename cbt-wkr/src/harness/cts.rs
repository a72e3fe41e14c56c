//! Single CTS test runs.

use crate::config::{CREDENTIAL_ENV_VARS, RunnerConfig};
use crate::harness::dumps::archive_dumps;
use crate::process::{Finished, run_captured};
use cbt_common::{CatalogEntry, CtsResult, ErrorCode, mask_sensitive_command};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Printed by a CTS executable whose checks all passed.
pub const PASS_MARKER: &str = "PASSED test.";

/// Variables that make the toolchain write its dumps into a scratch directory.
const DUMP_ENABLE_VARS: &[&str] = &["IGC_ShaderDumpEnable", "IGC_ShaderDumpPidDisable"];
const DUMP_DIR_VAR: &str = "IGC_DumpToCustomDir";

/// Pass/fail for a test that exited before its timeout.
///
/// A non-zero exit always fails. With exit 0 the pass marker wins;
/// without it any "failed" in stdout, in any case, fails the test.
pub fn classify(exit_success: bool, stdout: &str) -> bool {
    if !exit_success {
        return false;
    }
    if stdout.contains(PASS_MARKER) {
        return true;
    }
    !stdout.to_lowercase().contains("failed")
}

/// Version identifiers reported with every CTS result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuiteVersions {
    pub suite: String,
    pub toolchain: String,
    pub runtime: String,
}

#[derive(Debug, Clone)]
pub struct CtsHarness {
    cts_dir: PathBuf,
    dump_root: PathBuf,
    versions: SuiteVersions,
}

impl CtsHarness {
    pub fn new(cts_dir: impl Into<PathBuf>, dump_root: impl Into<PathBuf>, versions: SuiteVersions) -> Self {
        Self {
            cts_dir: cts_dir.into(),
            dump_root: dump_root.into(),
            versions,
        }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        Self::new(
            config.cts_build_dir.value.clone(),
            config.dump_root.value.clone(),
            SuiteVersions {
                suite: config.suite_version.value.clone(),
                toolchain: config.toolchain_version.value.clone(),
                runtime: config.runtime_version.value.clone(),
            },
        )
    }

    /// Run one catalog entry. Never fails: launch errors and timeouts become
    /// failing results.
    pub async fn run(&self, entry: &CatalogEntry) -> CtsResult {
        let executable = entry.resolve_executable(&self.cts_dir);
        let scratch = self.scratch_dir(entry);

        let mut result = CtsResult {
            test_category: entry.test_category.clone(),
            test_name: entry.test_name.clone(),
            passing: false,
            timedout: false,
            start_time: Utc::now(),
            end_time: Utc::now(),
            standard_output: String::new(),
            standard_error: String::new(),
            test_executable: executable.display().to_string(),
            test_arguments: entry.argument_string(),
            suite_version: self.versions.suite.clone(),
            toolchain_version: self.versions.toolchain.clone(),
            runtime_version: self.versions.runtime.clone(),
            dump_path: None,
        };

        if let Err(e) = tokio::fs::create_dir_all(&scratch).await {
            warn!(
                error_code = %ErrorCode::DumpArchiveFailed.code_string(),
                "Cannot create dump directory {}: {}", scratch.display(), e
            );
        }

        let command = self.command(entry, &executable, &scratch);
        debug!(
            "Running {}",
            mask_sensitive_command(&format!("{} {}", executable.display(), result.test_arguments))
        );

        result.start_time = Utc::now();
        let finished = run_captured(command, entry.timeout()).await;
        result.end_time = Utc::now();

        match finished {
            Ok(Finished::Exited(output)) => {
                result.standard_output = String::from_utf8_lossy(&output.stdout).into_owned();
                result.standard_error = String::from_utf8_lossy(&output.stderr).into_owned();
                result.passing = classify(output.status.success(), &result.standard_output);
            }
            Ok(Finished::TimedOut) => {
                let text = format!("Test timed out after {}", describe_limit(entry.timeout()));
                warn!(
                    error_code = %ErrorCode::TestTimedOut.code_string(),
                    "{}/{}: {}", entry.test_category, entry.test_name, text
                );
                result.timedout = true;
                result.standard_output = text.clone();
                result.standard_error = text;
            }
            Err(e) => {
                warn!(
                    error_code = %ErrorCode::TestLaunchFailed.code_string(),
                    "Failed to launch {}: {}", executable.display(), e
                );
                result.standard_error = format!("failed to launch {}: {}", executable.display(), e);
            }
        }

        result.dump_path = collect_dumps(scratch).await;
        result
    }

    fn scratch_dir(&self, entry: &CatalogEntry) -> PathBuf {
        let name = format!(
            "{}_{}_{}_{}",
            entry.test_category,
            entry.test_name,
            Utc::now().format("%Y%m%d%H%M%S"),
            uuid::Uuid::new_v4().simple()
        );
        self.dump_root.join(name)
    }

    fn command(&self, entry: &CatalogEntry, executable: &Path, scratch: &Path) -> Command {
        let mut command = Command::new(executable);
        command.args(&entry.arguments);
        if let Some(dir) = executable.parent() {
            command.current_dir(dir);
        }
        for var in CREDENTIAL_ENV_VARS {
            command.env_remove(var);
        }
        for var in &entry.environment {
            command.env(var, "1");
        }
        for var in DUMP_ENABLE_VARS {
            command.env(var, "1");
        }
        // The toolchain concatenates file names onto this value.
        command.env(DUMP_DIR_VAR, format!("{}/", scratch.display()));
        command
    }
}

/// Whole hours read as "4 hours"; anything else in humantime notation.
fn describe_limit(limit: Duration) -> String {
    let secs = limit.as_secs();
    match secs {
        3600 => "1 hour".to_string(),
        s if s > 0 && s % 3600 == 0 => format!("{} hours", s / 3600),
        _ => humantime::format_duration(limit).to_string(),
    }
}

async fn collect_dumps(scratch: PathBuf) -> Option<PathBuf> {
    let dir = scratch.clone();
    match tokio::task::spawn_blocking(move || archive_dumps(&dir)).await {
        Ok(Ok(archive)) => archive,
        Ok(Err(e)) => {
            warn!(
                error_code = %ErrorCode::DumpArchiveFailed.code_string(),
                "Failed to archive dumps in {}: {}", scratch.display(), e
            );
            None
        }
        Err(e) => {
            warn!(
                error_code = %ErrorCode::DumpArchiveFailed.code_string(),
                "Dump archiving task failed: {}", e
            );
            None
        }
    }
}
