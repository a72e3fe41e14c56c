//! LIT suite runs.
//!
//! `llvm-lit` prints one line per test, e.g.
//! `PASS: LLVM :: CodeGen/SPIRV/add.ll (12 of 340)`. Lines whose status
//! contains `FAIL` are failures; everything else the driver prints is ignored.

use crate::config::RunnerConfig;
use cbt_common::{ErrorCode, LitResult};
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

const RESULT_LINE: &str = r"^([A-Z]+): .+? :: (\S+) \(\d+ of \d+\)";

#[derive(Debug, Error)]
pub enum LitError {
    #[error("failed to launch {path}: {source}")]
    Launch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LitError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::LitRunFailed
    }
}

/// Parse a LIT report into per-test results, in report order.
pub fn parse_report(report: &str) -> Vec<LitResult> {
    let Ok(line_re) = Regex::new(RESULT_LINE) else {
        return Vec::new();
    };

    report
        .lines()
        .filter_map(|line| line_re.captures(line.trim_end()))
        .map(|caps| {
            let passing = !caps[1].contains("FAIL");
            LitResult::new(&caps[2], passing)
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct LitRunner {
    executable: PathBuf,
    test_dir: PathBuf,
    max_time: Duration,
}

impl LitRunner {
    pub fn new(executable: impl Into<PathBuf>, test_dir: impl Into<PathBuf>, max_time: Duration) -> Self {
        Self {
            executable: executable.into(),
            test_dir: test_dir.into(),
            max_time,
        }
    }

    /// `<build>/bin/llvm-lit` against the configured test directory.
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self::new(
            config.build_dir.value.join("bin/llvm-lit"),
            config.lit_test_dir.value.clone(),
            Duration::from_secs(config.lit_max_time_secs.value),
        )
    }

    /// Run the whole suite. Only `--max-time` bounds it, per test.
    pub async fn run(&self) -> Result<Vec<LitResult>, LitError> {
        info!("Running LIT tests in {}", self.test_dir.display());

        let output = Command::new(&self.executable)
            .arg(&self.test_dir)
            .arg("--max-time")
            .arg(self.max_time.as_secs().to_string())
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| LitError::Launch {
                path: self.executable.clone(),
                source,
            })?;

        // lit exits non-zero whenever a test fails; the report is what counts.
        debug!("llvm-lit exited with {}", output.status);
        let results = parse_report(&String::from_utf8_lossy(&output.stdout));
        info!(
            "LIT finished: {} tests, {} failing",
            results.len(),
            results.iter().filter(|r| !r.passing).count()
        );
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const REPORT: &str = "\
-- Testing: 4 tests, 4 workers --
PASS: LLVM :: CodeGen/SPIRV/add.ll (1 of 4)
FAIL: LLVM :: CodeGen/SPIRV/branch.ll (2 of 4)
XFAIL: LLVM :: CodeGen/SPIRV/expected.ll (3 of 4)
UNSUPPORTED: LLVM :: CodeGen/SPIRV/image.ll (4 of 4)
********************
Failed Tests (1):
  LLVM :: CodeGen/SPIRV/branch.ll

Testing Time: 1.23s
  Passed: 2
  Failed: 1
";

    #[test]
    fn test_parse_report() {
        let results = parse_report(REPORT);
        assert_eq!(
            results,
            vec![
                LitResult::new("CodeGen/SPIRV/add.ll", true),
                LitResult::new("CodeGen/SPIRV/branch.ll", false),
                LitResult::new("CodeGen/SPIRV/expected.ll", false),
                LitResult::new("CodeGen/SPIRV/image.ll", true),
            ]
        );
    }

    #[test]
    fn test_summary_lines_are_ignored() {
        assert!(parse_report("Failed Tests (1):\n  LLVM :: CodeGen/SPIRV/branch.ll\n").is_empty());
        assert!(parse_report("").is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_with_fake_driver() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let driver = dir.path().join("llvm-lit");
        std::fs::write(
            &driver,
            "#!/bin/sh\n\
             echo \"args: $*\" >&2\n\
             echo 'PASS: LLVM :: a.ll (1 of 2)'\n\
             echo 'FAIL: LLVM :: b.ll (2 of 2)'\n\
             exit 1\n",
        )
        .unwrap();
        std::fs::set_permissions(&driver, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = LitRunner::new(&driver, dir.path(), Duration::from_secs(30));
        let results = runner.run().await.unwrap();
        assert_eq!(
            results,
            vec![LitResult::new("a.ll", true), LitResult::new("b.ll", false)]
        );
    }

    #[tokio::test]
    async fn test_missing_driver() {
        let runner = LitRunner::new("/nonexistent/llvm-lit", "/tmp", Duration::from_secs(30));
        let err = runner.run().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::LitRunFailed);
    }

    proptest! {
        #[test]
        fn parse_never_panics(report in ".{0,400}") {
            let _ = parse_report(&report);
        }

        #[test]
        fn well_formed_lines_round_trip(
            path in "[a-zA-Z0-9_/.-]{1,40}",
            failing in any::<bool>(),
            index in 1u32..1000,
        ) {
            let status = if failing { "FAIL" } else { "PASS" };
            let line = format!("{status}: LLVM :: {path} ({index} of 1000)");
            let results = parse_report(&line);
            prop_assert_eq!(results, vec![LitResult::new(path, !failing)]);
        }
    }
}
