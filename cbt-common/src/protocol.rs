//! Ledger HTTP protocol definitions.
//!
//! JSON bodies exchanged between runners and the ledger daemon, the field
//! layout of the multipart CTS submission, and the endpoint paths.

use crate::types::{CtsResult, JobId, JobStatus, TestGroups};
use crate::util::{format_timestamp_millis, millis_timestamp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Multipart part carrying the optional dump archive.
pub const DUMP_PART: &str = "dump";

/// Endpoint paths, relative to the ledger API root.
pub mod paths {
    use crate::types::JobId;

    pub const DISPATCH: &str = "dispatch/";

    pub fn job(id: JobId) -> String {
        format!("job/{id}/")
    }

    pub fn lit(id: JobId) -> String {
        format!("job/{id}/lit/")
    }

    pub fn cts(id: JobId) -> String {
        format!("job/{id}/cts/")
    }
}

/// Errors decoding a request that passed HTTP framing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("invalid value for '{field}': {value}")]
    InvalidField { field: &'static str, value: String },
}

/// Job as returned by lease, read and status-update calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobBody {
    #[serde(alias = "pk")]
    pub id: JobId,
    pub revision_hash: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status_details: String,
    #[serde(flatten)]
    pub groups: TestGroups,
}

/// Body of `PUT /job/{id}/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_details: Option<String>,
}

impl StatusUpdate {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            status_details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.status_details = Some(details.into());
        self
    }
}

/// Body of `POST /revision/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionBody {
    pub hash: String,
    pub title: String,
    pub branch: String,
    #[serde(default)]
    pub staging: bool,
    #[serde(with = "millis_timestamp")]
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub skip: bool,
}

/// Body of `POST /job/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueJobRequest {
    pub revision_hash: String,
    #[serde(flatten)]
    pub groups: TestGroups,
}

/// Body of `POST /job/{id}/cancel/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    /// Put the job back in the queue instead of skipping it.
    #[serde(default)]
    pub requeue: bool,
}

/// Text fields of a CTS submission, as decoded by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtsSubmission {
    pub test_category: String,
    pub test_name: String,
    pub passing: bool,
    pub timedout: bool,
    #[serde(with = "millis_timestamp")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "millis_timestamp")]
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub standard_output: String,
    #[serde(default)]
    pub standard_error: String,
    #[serde(default)]
    pub test_executable: String,
    #[serde(default)]
    pub test_arguments: String,
    #[serde(default)]
    pub suite_version: String,
    #[serde(default)]
    pub toolchain_version: String,
    #[serde(default)]
    pub runtime_version: String,
}

impl CtsSubmission {
    /// Multipart text fields for a runner-side result, in submission order.
    pub fn form_fields(result: &CtsResult) -> Vec<(&'static str, String)> {
        vec![
            ("test_category", result.test_category.clone()),
            ("test_name", result.test_name.clone()),
            ("timedout", result.timedout.to_string()),
            ("passing", result.passing.to_string()),
            ("start_time", format_timestamp_millis(&result.start_time)),
            ("end_time", format_timestamp_millis(&result.end_time)),
            ("standard_output", result.standard_output.clone()),
            ("standard_error", result.standard_error.clone()),
            ("test_executable", result.test_executable.clone()),
            ("test_arguments", result.test_arguments.clone()),
            ("suite_version", result.suite_version.clone()),
            ("toolchain_version", result.toolchain_version.clone()),
            ("runtime_version", result.runtime_version.clone()),
        ]
    }

    /// Decode the text fields collected from a multipart body.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, ProtocolError> {
        let text = |name: &'static str| fields.get(name).cloned().unwrap_or_default();

        Ok(Self {
            test_category: required(fields, "test_category")?.to_string(),
            test_name: required(fields, "test_name")?.to_string(),
            passing: parse_flag(fields, "passing")?,
            timedout: parse_flag(fields, "timedout")?,
            start_time: parse_timestamp(fields, "start_time")?,
            end_time: parse_timestamp(fields, "end_time")?,
            standard_output: text("standard_output"),
            standard_error: text("standard_error"),
            test_executable: text("test_executable"),
            test_arguments: text("test_arguments"),
            suite_version: text("suite_version"),
            toolchain_version: text("toolchain_version"),
            runtime_version: text("runtime_version"),
        })
    }
}

fn required<'a>(
    fields: &'a HashMap<String, String>,
    name: &'static str,
) -> Result<&'a str, ProtocolError> {
    match fields.get(name) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ProtocolError::MissingField(name)),
    }
}

fn parse_flag(fields: &HashMap<String, String>, name: &'static str) -> Result<bool, ProtocolError> {
    let Some(value) = fields.get(name) else {
        return Ok(false);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        _ => Err(ProtocolError::InvalidField {
            field: name,
            value: value.clone(),
        }),
    }
}

fn parse_timestamp(
    fields: &HashMap<String, String>,
    name: &'static str,
) -> Result<DateTime<Utc>, ProtocolError> {
    let raw = required(fields, name)?;
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| ProtocolError::InvalidField {
            field: name,
            value: raw.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LIT_ALL_GROUP, cts_group};
    use chrono::TimeZone;

    fn sample_result() -> CtsResult {
        let start = Utc.with_ymd_and_hms(2024, 5, 2, 8, 30, 0).unwrap();
        CtsResult {
            test_category: "basic".to_string(),
            test_name: "test1".to_string(),
            passing: true,
            timedout: false,
            start_time: start,
            end_time: start + chrono::Duration::milliseconds(1500),
            standard_output: "PASSED test.".to_string(),
            standard_error: String::new(),
            test_executable: "/opt/cts/test_basic".to_string(),
            test_arguments: "--quick".to_string(),
            suite_version: "2024.1".to_string(),
            toolchain_version: "1.0.16".to_string(),
            runtime_version: "23.4".to_string(),
            dump_path: None,
        }
    }

    #[test]
    fn test_job_body_wire_layout() {
        let body = JobBody {
            id: JobId(42),
            revision_hash: "deadbeef".to_string(),
            status: JobStatus::Dispatched,
            status_details: String::new(),
            groups: TestGroups::new()
                .with(LIT_ALL_GROUP, true)
                .with(cts_group("basic"), true),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["id"], 42);
        assert_eq!(json["status"], "D");
        assert_eq!(json["run_lit_all"], true);
        assert_eq!(json["run_cts_basic"], true);
        assert!(json.get("status_details").is_none());
    }

    #[test]
    fn test_job_body_accepts_pk_alias() {
        let json = r#"{"pk": 7, "revision_hash": "abc", "status": "T", "run_lit_all": false}"#;
        let body: JobBody = serde_json::from_str(json).unwrap();
        assert_eq!(body.id, JobId(7));
        assert_eq!(body.status, JobStatus::Testing);
        assert!(!body.groups.lit_all());
        assert_eq!(body.groups.len(), 1);
    }

    #[test]
    fn test_cts_fields_decode() {
        let result = sample_result();
        let fields: HashMap<String, String> = CtsSubmission::form_fields(&result)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(fields["start_time"], "2024-05-02T08:30:00.000Z");

        let decoded = CtsSubmission::from_fields(&fields).unwrap();
        assert_eq!(decoded.test_category, "basic");
        assert!(decoded.passing);
        assert!(!decoded.timedout);
        assert_eq!(decoded.end_time, result.end_time);
        assert_eq!(decoded.runtime_version, "23.4");
    }

    #[test]
    fn test_cts_fields_reject_bad_flag_and_missing_name() {
        let mut fields: HashMap<String, String> = CtsSubmission::form_fields(&sample_result())
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        fields.insert("passing".to_string(), "maybe".to_string());
        assert!(matches!(
            CtsSubmission::from_fields(&fields),
            Err(ProtocolError::InvalidField { field: "passing", .. })
        ));

        fields.insert("passing".to_string(), "True".to_string());
        fields.remove("test_name");
        assert_eq!(
            CtsSubmission::from_fields(&fields),
            Err(ProtocolError::MissingField("test_name"))
        );
    }

    #[test]
    fn test_paths() {
        assert_eq!(paths::job(JobId(5)), "job/5/");
        assert_eq!(paths::lit(JobId(5)), "job/5/lit/");
        assert_eq!(paths::cts(JobId(5)), "job/5/cts/");
    }
}
