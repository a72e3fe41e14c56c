//! Checkout and build of the toolchain and the backend wrapper.
//!
//! Steps run strictly in order, each under its own time limit. The first
//! failing step ends the build and names the stage for the job's
//! `BUILD_FAILED` detail.

use crate::config::RunnerConfig;
use crate::process::run_inherited;
use cbt_common::{ErrorCode, mask_sensitive_command};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStage {
    Fetch,
    Checkout,
    ConfigureToolchain,
    BuildToolchain,
    ConfigureWrapper,
    BuildWrapper,
}

impl BuildStage {
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Checkout => "checkout",
            Self::ConfigureToolchain => "configure-toolchain",
            Self::BuildToolchain => "build-toolchain",
            Self::ConfigureWrapper => "configure-wrapper",
            Self::BuildWrapper => "build-wrapper",
        }
    }
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepFailure {
    #[error("exited with {}", describe_exit(.0))]
    Exit(Option<i32>),

    #[error("timed out after {}", describe_limit(.0))]
    TimedOut(Duration),

    #[error("could not be launched: {0}")]
    Launch(String),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

fn describe_limit(limit: &Duration) -> String {
    humantime::format_duration(*limit).to_string()
}

/// The stage at which a build stopped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{stage} {reason}")]
pub struct BuildFailure {
    pub stage: BuildStage,
    pub reason: StepFailure,
}

impl BuildFailure {
    pub fn code(&self) -> ErrorCode {
        match self.reason {
            StepFailure::Exit(_) => ErrorCode::BuildStepFailed,
            StepFailure::TimedOut(_) => ErrorCode::BuildStepTimedOut,
            StepFailure::Launch(_) => ErrorCode::BuildLaunchFailed,
        }
    }
}

/// One external command of the build.
#[derive(Debug, Clone)]
pub struct BuildStep {
    pub stage: BuildStage,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
}

impl BuildStep {
    pub fn new<I, S>(
        stage: BuildStage,
        program: impl Into<String>,
        args: I,
        cwd: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stage,
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: cwd.into(),
            timeout,
        }
    }

    async fn run(&self) -> Result<(), StepFailure> {
        let mut command = Command::new(&self.program);
        command.args(&self.args).current_dir(&self.cwd);

        match run_inherited(command, self.timeout).await {
            Ok(Some(status)) if status.success() => Ok(()),
            Ok(Some(status)) => Err(StepFailure::Exit(status.code())),
            Ok(None) => Err(StepFailure::TimedOut(self.timeout)),
            Err(e) => Err(StepFailure::Launch(e.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildPipeline {
    steps: Vec<BuildStep>,
}

impl BuildPipeline {
    pub fn new(steps: Vec<BuildStep>) -> Self {
        Self { steps }
    }

    /// Fetch, check out `revision`, build the toolchain, then the wrapper.
    ///
    /// `build_dir` sits inside the checkout, next to the `llvm/` source tree.
    pub fn standard(config: &RunnerConfig, revision: &str) -> Self {
        const MINUTE: u64 = 60;
        const HOUR: u64 = 60 * MINUTE;

        let build_dir = config.build_dir.value.clone();
        let wrapper_dir = config.wrapper_build_dir.value.clone();
        let jobs = format!("-j{}", config.make_jobs.value);
        let llvm_dir = format!("-DLLVM_DIR={}", build_dir.join("lib/cmake/llvm").display());

        Self::new(vec![
            BuildStep::new(
                BuildStage::Fetch,
                "git",
                ["fetch"],
                &build_dir,
                Duration::from_secs(20 * MINUTE),
            ),
            BuildStep::new(
                BuildStage::Checkout,
                "git",
                ["checkout", revision],
                &build_dir,
                Duration::from_secs(5 * MINUTE),
            ),
            BuildStep::new(
                BuildStage::ConfigureToolchain,
                "cmake",
                [
                    "-DCMAKE_BUILD_TYPE=Debug",
                    "-DLLVM_EXPERIMENTAL_TARGETS_TO_BUILD=SPIRV",
                    "../llvm/",
                ],
                &build_dir,
                Duration::from_secs(10 * MINUTE),
            ),
            BuildStep::new(
                BuildStage::BuildToolchain,
                "make",
                [jobs.as_str()],
                &build_dir,
                Duration::from_secs(12 * HOUR),
            ),
            BuildStep::new(
                BuildStage::ConfigureWrapper,
                "cmake",
                [llvm_dir.as_str(), ".."],
                &wrapper_dir,
                Duration::from_secs(10 * MINUTE),
            ),
            BuildStep::new(
                BuildStage::BuildWrapper,
                "make",
                [jobs.as_str()],
                &wrapper_dir,
                Duration::from_secs(HOUR),
            ),
        ])
    }

    pub fn steps(&self) -> &[BuildStep] {
        &self.steps
    }

    pub async fn run(&self) -> Result<(), BuildFailure> {
        for step in &self.steps {
            let command = format!("{} {}", step.program, step.args.join(" "));
            info!(step = %step.stage, "Build step: {}", mask_sensitive_command(&command));
            if let Err(reason) = step.run().await {
                let failure = BuildFailure {
                    stage: step.stage,
                    reason,
                };
                error!(error_code = %failure.code().code_string(), "Build failed: {}", failure);
                return Err(failure);
            }
        }
        Ok(())
    }
}
