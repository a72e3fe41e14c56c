//! Error catalog for the compiler backend tester.
//!
//! Every operator-visible failure carries a stable code in the `CBT-Exxx`
//! format, a message and remediation steps. Codes are attached to log
//! events as the `error_code` field.
//!
//! # Error Code Ranges
//!
//! | Range      | Category    | Description                            |
//! |------------|-------------|----------------------------------------|
//! | E001-E099  | Config      | Configuration, environment and catalog |
//! | E100-E199  | Network     | Ledger connectivity and HTTP errors    |
//! | E200-E299  | Test        | Test harness execution                 |
//! | E300-E399  | Build       | Checkout and build pipeline            |
//! | E400-E499  | Transfer    | Dump archives and attachments          |
//! | E500-E599  | Internal    | Ledger state and process internals     |

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error code enumeration covering all CBT error scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // =========================================================================
    // Config Errors (E001-E099)
    // =========================================================================
    /// Configuration file not found
    ConfigNotFound,
    /// Configuration file could not be read
    ConfigReadError,
    /// Configuration file contains invalid TOML syntax
    ConfigParseError,
    /// Configuration contains invalid values
    ConfigValidationError,
    /// Environment variable has invalid value
    ConfigEnvError,
    /// Runner name or key missing
    ConfigMissingCredentials,
    /// A required checkout or build path is missing
    ConfigMissingPath,
    /// Test catalog file not found
    CatalogNotFound,
    /// Test catalog is not valid JSON
    CatalogParseError,
    /// Test catalog entry is inconsistent
    CatalogInvalidEntry,

    // =========================================================================
    // Network Errors (E100-E199)
    // =========================================================================
    /// Ledger could not be reached
    LedgerUnreachable,
    /// Every retry attempt failed
    LedgerRetriesExhausted,
    /// Ledger answered with an unexpected HTTP status
    LedgerHttpError,
    /// Ledger rejected the runner credentials
    LedgerAuthFailed,
    /// Ledger does not know the requested job
    LedgerJobNotFound,
    /// Ledger response could not be decoded
    LedgerDecodeError,
    /// Ledger does not know the requested revision
    LedgerUnknownRevision,
    /// Job is in a state that cannot be cancelled
    LedgerJobNotCancellable,

    // =========================================================================
    // Test Errors (E200-E299)
    // =========================================================================
    /// Test executable could not be launched
    TestLaunchFailed,
    /// Test exceeded its timeout
    TestTimedOut,
    /// LIT driver could not be run
    LitRunFailed,
    /// CTS category has no catalog entries
    TestCategoryEmpty,

    // =========================================================================
    // Build Errors (E300-E399)
    // =========================================================================
    /// Build step exited with a non-zero status
    BuildStepFailed,
    /// Build step exceeded its timeout
    BuildStepTimedOut,
    /// Build step program could not be launched
    BuildLaunchFailed,

    // =========================================================================
    // Transfer Errors (E400-E499)
    // =========================================================================
    /// Dump directory could not be archived
    DumpArchiveFailed,
    /// Dump directory or archive could not be removed
    DumpCleanupFailed,
    /// Dump archive could not be attached to a submission
    DumpAttachFailed,
    /// Ledger could not store an uploaded dump
    DumpStoreFailed,

    // =========================================================================
    // Internal Errors (E500-E599)
    // =========================================================================
    /// Ledger snapshot could not be written
    InternalStatePersist,
    /// Ledger snapshot could not be loaded
    InternalStateLoad,
    /// Logging could not be initialized
    InternalLoggingError,
    /// HTTP listener could not be bound
    InternalBindFailed,
}

impl ErrorCode {
    /// Returns the numeric error code (without prefix).
    #[must_use]
    pub const fn code_number(&self) -> u16 {
        match self {
            // Config (001-099)
            Self::ConfigNotFound => 1,
            Self::ConfigReadError => 2,
            Self::ConfigParseError => 3,
            Self::ConfigValidationError => 4,
            Self::ConfigEnvError => 5,
            Self::ConfigMissingCredentials => 6,
            Self::ConfigMissingPath => 7,
            Self::CatalogNotFound => 10,
            Self::CatalogParseError => 11,
            Self::CatalogInvalidEntry => 12,

            // Network (100-199)
            Self::LedgerUnreachable => 100,
            Self::LedgerRetriesExhausted => 101,
            Self::LedgerHttpError => 102,
            Self::LedgerAuthFailed => 103,
            Self::LedgerJobNotFound => 104,
            Self::LedgerDecodeError => 105,
            Self::LedgerUnknownRevision => 106,
            Self::LedgerJobNotCancellable => 107,

            // Test (200-299)
            Self::TestLaunchFailed => 200,
            Self::TestTimedOut => 201,
            Self::LitRunFailed => 202,
            Self::TestCategoryEmpty => 203,

            // Build (300-399)
            Self::BuildStepFailed => 300,
            Self::BuildStepTimedOut => 301,
            Self::BuildLaunchFailed => 302,

            // Transfer (400-499)
            Self::DumpArchiveFailed => 400,
            Self::DumpCleanupFailed => 401,
            Self::DumpAttachFailed => 402,
            Self::DumpStoreFailed => 403,

            // Internal (500-599)
            Self::InternalStatePersist => 500,
            Self::InternalStateLoad => 501,
            Self::InternalLoggingError => 502,
            Self::InternalBindFailed => 503,
        }
    }

    /// Returns the formatted error code string (e.g., "CBT-E001").
    #[must_use]
    pub fn code_string(&self) -> String {
        format!("CBT-E{:03}", self.code_number())
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self.code_number() {
            1..=99 => ErrorCategory::Config,
            100..=199 => ErrorCategory::Network,
            200..=299 => ErrorCategory::Test,
            300..=399 => ErrorCategory::Build,
            400..=499 => ErrorCategory::Transfer,
            _ => ErrorCategory::Internal,
        }
    }

    /// Returns the full error entry with all metadata.
    #[must_use]
    pub fn entry(&self) -> ErrorEntry {
        ErrorEntry {
            code: self.code_string(),
            category: self.category(),
            message: self.message().to_string(),
            remediation: self
                .remediation()
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }

    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::ConfigNotFound => "Configuration file not found",
            Self::ConfigReadError => "Failed to read configuration file",
            Self::ConfigParseError => "Configuration file contains invalid TOML syntax",
            Self::ConfigValidationError => "Configuration contains invalid values",
            Self::ConfigEnvError => "Environment variable has an invalid value",
            Self::ConfigMissingCredentials => "Runner name or key is not configured",
            Self::ConfigMissingPath => "Required checkout or build path is not configured",
            Self::CatalogNotFound => "Test catalog file not found",
            Self::CatalogParseError => "Test catalog is not valid JSON",
            Self::CatalogInvalidEntry => "Test catalog contains an invalid entry",

            Self::LedgerUnreachable => "Ledger could not be reached",
            Self::LedgerRetriesExhausted => "Ledger request failed after every retry",
            Self::LedgerHttpError => "Ledger returned an unexpected HTTP status",
            Self::LedgerAuthFailed => "Ledger rejected the runner credentials",
            Self::LedgerJobNotFound => "Ledger does not know this job",
            Self::LedgerDecodeError => "Ledger response could not be decoded",
            Self::LedgerUnknownRevision => "Ledger does not know this revision",
            Self::LedgerJobNotCancellable => "Job can no longer be cancelled",

            Self::TestLaunchFailed => "Test executable could not be launched",
            Self::TestTimedOut => "Test exceeded its timeout",
            Self::LitRunFailed => "LIT driver could not be run",
            Self::TestCategoryEmpty => "Enabled CTS category has no catalog entries",

            Self::BuildStepFailed => "Build step failed",
            Self::BuildStepTimedOut => "Build step timed out",
            Self::BuildLaunchFailed => "Build step program could not be launched",

            Self::DumpArchiveFailed => "Dump directory could not be archived",
            Self::DumpCleanupFailed => "Dump files could not be removed",
            Self::DumpAttachFailed => "Dump archive could not be attached",
            Self::DumpStoreFailed => "Uploaded dump could not be stored",

            Self::InternalStatePersist => "Ledger snapshot could not be written",
            Self::InternalStateLoad => "Ledger snapshot could not be loaded",
            Self::InternalLoggingError => "Logging could not be initialized",
            Self::InternalBindFailed => "HTTP listener could not be bound",
        }
    }

    #[must_use]
    pub const fn remediation(&self) -> &'static [&'static str] {
        match self {
            Self::ConfigNotFound => &[
                "Check the path passed with --config",
                "Omit --config to run from environment variables only",
            ],
            Self::ConfigReadError => &[
                "Check file permissions on the configuration file",
                "Make sure the path is a regular file",
            ],
            Self::ConfigParseError => &[
                "Validate the TOML syntax of the configuration file",
                "Run 'cbt-wkr check-config' to see the parse location",
            ],
            Self::ConfigValidationError => &[
                "Run 'cbt-wkr check-config' to list invalid values",
                "Compare against the documented configuration keys",
            ],
            Self::ConfigEnvError => &[
                "Check the CBT_* environment variables for typos",
                "Run 'cbt-wkr check-config' to see where each value came from",
            ],
            Self::ConfigMissingCredentials => &[
                "Set CBT_RUNNER_NAME and CBT_RUNNER_KEY",
                "Or set runner_name and runner_key in the configuration file",
            ],
            Self::ConfigMissingPath => &[
                "Set CBT_SOURCE_DIR, CBT_BUILD_DIR, CBT_WRAPPER_BUILD_DIR and CBT_CTS_DIR",
                "Make sure every configured path exists",
            ],
            Self::CatalogNotFound => &[
                "Set CBT_CATALOG to the test catalog JSON file",
                "Check that the CTS checkout contains the catalog",
            ],
            Self::CatalogParseError => &[
                "Validate the catalog with 'cbt-wkr catalog'",
                "Fix the JSON syntax at the reported line",
            ],
            Self::CatalogInvalidEntry => &[
                "Every entry needs a category, a name and an executable path",
                "Remove duplicate (category, name) pairs",
            ],

            Self::LedgerUnreachable => &[
                "Check that cbtd is running and reachable",
                "Verify CBT_LEDGER_URL",
            ],
            Self::LedgerRetriesExhausted => &[
                "Check ledger availability, the runner will be restarted by its supervisor",
                "Inspect cbtd logs for the failing endpoint",
            ],
            Self::LedgerHttpError => &[
                "Inspect cbtd logs for the failing request",
                "Check that runner and ledger versions match",
            ],
            Self::LedgerAuthFailed => &[
                "Verify the runner name and key",
                "Check the runners table of the cbtd configuration",
            ],
            Self::LedgerJobNotFound => &[
                "The job may have been removed from the ledger",
                "Check the ledger snapshot for the job id",
            ],
            Self::LedgerDecodeError => &[
                "Check that runner and ledger versions match",
                "Inspect the raw ledger response in debug logs",
            ],
            Self::LedgerUnknownRevision => &[
                "Register the revision with POST /revision/ first",
                "Check the revision hash for typos",
            ],
            Self::LedgerJobNotCancellable => &[
                "Only QUEUED, DISPATCHED and TESTING jobs can be cancelled",
                "Enqueue a new job to rerun a finished revision",
            ],

            Self::TestLaunchFailed => &[
                "Check that the CTS build directory contains the executable",
                "Verify the executable bit on the test binary",
            ],
            Self::TestTimedOut => &[
                "Raise timeout_secs for the test in the catalog",
                "Inspect the dump archive for a hang in the backend",
            ],
            Self::LitRunFailed => &[
                "Check that llvm-lit exists in the toolchain build",
                "Verify CBT_LIT_TEST_DIR",
            ],
            Self::TestCategoryEmpty => &[
                "Add entries for the category to the catalog",
                "Disable the category for new jobs in the cbtd configuration",
            ],

            Self::BuildStepFailed => &[
                "Inspect the runner log for the failing step output",
                "Reproduce the step manually in the checkout",
            ],
            Self::BuildStepTimedOut => &[
                "Raise the step timeout in the runner configuration",
                "Check the build machine for load",
            ],
            Self::BuildLaunchFailed => &[
                "Check that git, cmake and make are installed",
                "Verify the working directory of the step exists",
            ],

            Self::DumpArchiveFailed => &[
                "Check free disk space in the dump directory",
                "Check permissions on CBT_DUMP_DIR",
            ],
            Self::DumpCleanupFailed => &[
                "Remove stale scratch directories under CBT_DUMP_DIR",
                "Check permissions on CBT_DUMP_DIR",
            ],
            Self::DumpAttachFailed => &[
                "Check that the archive still exists",
                "Check free disk space in the dump directory",
            ],
            Self::DumpStoreFailed => &[
                "Check free disk space in the cbtd media directory",
                "Check permissions on the media directory",
            ],

            Self::InternalStatePersist => &[
                "Check free disk space next to the state file",
                "Check permissions on the state file directory",
            ],
            Self::InternalStateLoad => &[
                "Restore the state file from backup",
                "Move the corrupt state file aside to start with an empty ledger",
            ],
            Self::InternalLoggingError => &[
                "Check permissions on CBT_LOG_DIR",
                "Unset CBT_LOG_DIR to log to stderr only",
            ],
            Self::InternalBindFailed => &[
                "Check that no other process uses the bind address",
                "Pass a different address with --bind",
            ],
        }
    }

    /// Returns all error codes.
    #[must_use]
    pub const fn all() -> &'static [ErrorCode] {
        &[
            Self::ConfigNotFound,
            Self::ConfigReadError,
            Self::ConfigParseError,
            Self::ConfigValidationError,
            Self::ConfigEnvError,
            Self::ConfigMissingCredentials,
            Self::ConfigMissingPath,
            Self::CatalogNotFound,
            Self::CatalogParseError,
            Self::CatalogInvalidEntry,
            Self::LedgerUnreachable,
            Self::LedgerRetriesExhausted,
            Self::LedgerHttpError,
            Self::LedgerAuthFailed,
            Self::LedgerJobNotFound,
            Self::LedgerDecodeError,
            Self::LedgerUnknownRevision,
            Self::LedgerJobNotCancellable,
            Self::TestLaunchFailed,
            Self::TestTimedOut,
            Self::LitRunFailed,
            Self::TestCategoryEmpty,
            Self::BuildStepFailed,
            Self::BuildStepTimedOut,
            Self::BuildLaunchFailed,
            Self::DumpArchiveFailed,
            Self::DumpCleanupFailed,
            Self::DumpAttachFailed,
            Self::DumpStoreFailed,
            Self::InternalStatePersist,
            Self::InternalStateLoad,
            Self::InternalLoggingError,
            Self::InternalBindFailed,
        ]
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code_string(), self.message())
    }
}

/// Error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Configuration, environment and catalog errors (E001-E099)
    Config,
    /// Ledger connectivity errors (E100-E199)
    Network,
    /// Test harness errors (E200-E299)
    Test,
    /// Build pipeline errors (E300-E399)
    Build,
    /// Dump transfer errors (E400-E499)
    Transfer,
    /// Internal errors (E500-E599)
    Internal,
}

impl ErrorCategory {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Config => "Configuration",
            Self::Network => "Network",
            Self::Test => "Test",
            Self::Build => "Build",
            Self::Transfer => "Transfer",
            Self::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Complete error entry with all metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Error code string (e.g., "CBT-E001")
    pub code: String,
    pub category: ErrorCategory,
    pub message: String,
    pub remediation: Vec<String>,
}

impl ErrorEntry {
    /// Formats the error for display with full remediation steps.
    #[must_use]
    pub fn format_full(&self) -> String {
        let mut output = format!("[{}] {}\n", self.code, self.message);

        if !self.remediation.is_empty() {
            output.push_str("\nRemediation steps:\n");
            for (i, step) in self.remediation.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, step));
            }
        }

        output
    }

    /// Formats the error as a single line.
    #[must_use]
    pub fn format_brief(&self) -> String {
        format!("[{}] {}", self.code, self.message)
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_brief())
    }
}
