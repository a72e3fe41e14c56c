//! Common types used across CBT components.

use chrono::{DateTime, Utc};
use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Test group that runs the whole LIT suite.
pub const LIT_ALL_GROUP: &str = "lit_all";

/// Prefix of every CTS test group (`cts_<category>`).
pub const CTS_GROUP_PREFIX: &str = "cts_";

/// Wire prefix of a test group flag in a job body (`run_<group>`).
pub const GROUP_KEY_PREFIX: &str = "run_";

/// CTS categories scheduled by a primary job unless the daemon is configured
/// otherwise.
pub const DEFAULT_CTS_CATEGORIES: &[&str] = &[
    "api",
    "basic",
    "atomics",
    "buffers",
    "commonfns",
    "compiler",
    "computeinfo",
    "contractions",
    "device_partition",
    "events",
    "geometrics",
    "half",
    "integer_ops",
    "mem_host_flags",
    "multiple_device_context",
    "printf",
    "profiling",
    "relationals",
    "select",
    "thread_dimensions",
    "vectors",
    "c11_atomics",
    "device_execution",
    "non_uniform_work_group",
    "generic_address_space",
    "subgroups",
    "workgroups",
    "pipes",
    "device_timer",
    "spirv_new",
    "math_brute_force",
    "SVM",
    "clCopyImage",
    "clFillImage",
    "clGetInfo",
    "clReadWriteImage",
    "kernel_image_methods",
    "kernel_read_write",
    "samplerlessReads",
];

/// Test group name for a CTS category.
pub fn cts_group(category: &str) -> String {
    format!("{CTS_GROUP_PREFIX}{category}")
}

/// Ledger-assigned job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl JobId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a job.
///
/// Serialized as the single-letter codes used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Set administratively; never tested.
    #[serde(rename = "S")]
    Skipped,
    /// Waiting for a runner.
    #[serde(rename = "Q")]
    Queued,
    /// Leased by a runner that has not started work yet.
    #[serde(rename = "D")]
    Dispatched,
    /// A runner is building and testing the revision.
    #[serde(rename = "T")]
    Testing,
    /// Every scheduled test group finished.
    #[serde(rename = "C")]
    Completed,
    /// A build step failed; no tests were run.
    #[serde(rename = "F")]
    BuildFailed,
}

impl JobStatus {
    /// Single-letter wire code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Skipped => "S",
            Self::Queued => "Q",
            Self::Dispatched => "D",
            Self::Testing => "T",
            Self::Completed => "C",
            Self::BuildFailed => "F",
        }
    }

    pub const fn label(&self) -> &'static str {
        match self {
            Self::Skipped => "Skipped",
            Self::Queued => "Queued",
            Self::Dispatched => "Dispatched",
            Self::Testing => "Testing",
            Self::Completed => "Completed",
            Self::BuildFailed => "Build failed",
        }
    }

    /// Whether a runner status write may move a job from `self` to `next`.
    ///
    /// Only the forward edges a runner drives are accepted. Everything else
    /// (leasing, requeueing, skipping) belongs to the ledger or an operator.
    pub const fn accepts_runner_update(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Dispatched, Self::Testing)
                | (Self::Dispatched, Self::BuildFailed)
                | (Self::Testing, Self::Testing)
                | (Self::Testing, Self::Completed)
                | (Self::Testing, Self::BuildFailed)
                | (Self::Completed, Self::Completed)
                | (Self::BuildFailed, Self::BuildFailed)
        )
    }

    /// Whether an operator may cancel a job in this state.
    pub const fn is_cancellable(&self) -> bool {
        matches!(self, Self::Queued | Self::Dispatched | Self::Testing)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Enabled test groups of a job, keyed by group name (`lit_all`,
/// `cts_<category>`).
///
/// On the wire each entry is a boolean field named `run_<group>` next to the
/// other job fields, so new CTS categories need no schema change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestGroups(BTreeMap<String, bool>);

impl TestGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, group: impl Into<String>, enabled: bool) -> Self {
        self.set(group, enabled);
        self
    }

    pub fn set(&mut self, group: impl Into<String>, enabled: bool) {
        self.0.insert(group.into(), enabled);
    }

    /// Unknown groups count as disabled.
    pub fn is_enabled(&self, group: &str) -> bool {
        self.0.get(group).copied().unwrap_or(false)
    }

    pub fn lit_all(&self) -> bool {
        self.is_enabled(LIT_ALL_GROUP)
    }

    pub fn cts_category(&self, category: &str) -> bool {
        self.is_enabled(&cts_group(category))
    }

    /// Names of the enabled groups, in sorted order.
    pub fn enabled(&self) -> impl Iterator<Item = &str> {
        self.0
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(group, _)| group.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.0.iter().map(|(group, enabled)| (group.as_str(), *enabled))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for TestGroups {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (group, enabled) in &self.0 {
            map.serialize_entry(&format!("{GROUP_KEY_PREFIX}{group}"), enabled)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for TestGroups {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Flattened next to other job fields: keep only `run_*` booleans.
        let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
        let groups = raw
            .into_iter()
            .filter_map(|(key, value)| {
                let group = key.strip_prefix(GROUP_KEY_PREFIX)?;
                value.as_bool().map(|enabled| (group.to_string(), enabled))
            })
            .collect();
        Ok(Self(groups))
    }
}

/// A source-control commit known to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// Commit hash, unique.
    pub hash: String,
    pub title: String,
    pub branch: String,
    /// Candidate/staging branch rather than mainline.
    #[serde(default)]
    pub staging: bool,
    /// Commit timestamp.
    pub date: DateTime<Utc>,
    /// No relevant files changed; never create a primary job.
    #[serde(default)]
    pub skip: bool,
}

/// One line of a LIT report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LitResult {
    pub test_path: String,
    pub passing: bool,
}

impl LitResult {
    pub fn new(test_path: impl Into<String>, passing: bool) -> Self {
        Self {
            test_path: test_path.into(),
            passing,
        }
    }

    pub fn outcome_label(&self) -> &'static str {
        if self.passing { "PASSED" } else { "FAILED" }
    }
}

impl std::fmt::Display for LitResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.test_path, self.outcome_label())
    }
}

/// Outcome of one CTS test executable run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtsResult {
    pub test_category: String,
    pub test_name: String,
    pub passing: bool,
    pub timedout: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub standard_output: String,
    pub standard_error: String,
    pub test_executable: String,
    pub test_arguments: String,
    pub suite_version: String,
    pub toolchain_version: String,
    pub runtime_version: String,
    /// Local dump archive, owned by the runner until it has been posted.
    pub dump_path: Option<PathBuf>,
}

impl CtsResult {
    pub fn outcome_label(&self) -> &'static str {
        if self.passing {
            "PASSED"
        } else if self.timedout {
            "TIMED OUT"
        } else {
            "FAILED"
        }
    }
}

impl std::fmt::Display for CtsResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} ({})",
            self.test_category,
            self.test_name,
            self.outcome_label()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip() {
        for status in [
            JobStatus::Skipped,
            JobStatus::Queued,
            JobStatus::Dispatched,
            JobStatus::Testing,
            JobStatus::Completed,
            JobStatus::BuildFailed,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.code()));
            assert_eq!(serde_json::from_str::<JobStatus>(&json).unwrap(), status);
        }
        assert!(serde_json::from_str::<JobStatus>("\"X\"").is_err());
    }

    #[test]
    fn test_runner_updates_only_move_forward() {
        assert!(JobStatus::Dispatched.accepts_runner_update(JobStatus::Testing));
        assert!(JobStatus::Testing.accepts_runner_update(JobStatus::Completed));
        assert!(JobStatus::Testing.accepts_runner_update(JobStatus::BuildFailed));

        assert!(!JobStatus::Queued.accepts_runner_update(JobStatus::BuildFailed));
        assert!(!JobStatus::Queued.accepts_runner_update(JobStatus::Testing));
        assert!(!JobStatus::Testing.accepts_runner_update(JobStatus::Queued));
        assert!(!JobStatus::Completed.accepts_runner_update(JobStatus::Testing));
        assert!(!JobStatus::Skipped.accepts_runner_update(JobStatus::Completed));
    }

    #[test]
    fn test_groups_serialize_with_run_prefix() {
        let groups = TestGroups::new()
            .with(LIT_ALL_GROUP, true)
            .with(cts_group("basic"), false);
        let json = serde_json::to_value(&groups).unwrap();
        assert_eq!(json["run_lit_all"], true);
        assert_eq!(json["run_cts_basic"], false);
    }

    #[test]
    fn test_groups_ignore_unrelated_fields() {
        let json = r#"{"pk": 3, "status": "Q", "run_lit_all": true, "run_cts_api": false, "run_bogus": "yes"}"#;
        let groups: TestGroups = serde_json::from_str(json).unwrap();
        assert_eq!(groups.len(), 2);
        assert!(groups.lit_all());
        assert!(!groups.cts_category("api"));
        assert!(!groups.is_enabled("bogus"));
    }

    #[test]
    fn test_result_labels() {
        assert_eq!(
            LitResult::new("CodeGen/SPIRV/a.ll", true).to_string(),
            "CodeGen/SPIRV/a.ll (PASSED)"
        );
        assert_eq!(LitResult::new("b.ll", false).outcome_label(), "FAILED");
    }
}
