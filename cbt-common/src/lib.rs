//! Shared types and utilities for the compiler backend tester.
//!
//! Used by both the ledger daemon (`cbtd`) and the runner agent (`cbt-wkr`):
//! job and result types, the HTTP wire protocol, the test catalog,
//! configuration parsing, logging setup and the error catalog.

pub mod catalog;
pub mod config;
pub mod errors;
pub mod logging;
pub mod protocol;
pub mod types;
pub mod util;

pub use catalog::{CatalogEntry, CatalogError, TestCatalog};
pub use errors::{ErrorCategory, ErrorCode, ErrorEntry};
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
pub use protocol::{
    CancelRequest, CtsSubmission, EnqueueJobRequest, JobBody, ProtocolError, RevisionBody,
    StatusUpdate,
};
pub use types::{
    CtsResult, DEFAULT_CTS_CATEGORIES, JobId, JobStatus, LIT_ALL_GROUP, LitResult, Revision,
    TestGroups, cts_group,
};
pub use util::{format_timestamp_millis, mask_sensitive_command};
