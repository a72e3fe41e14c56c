//! Compiler backend tester - runner agent.
//!
//! Leases jobs from the ledger, builds the requested toolchain revision,
//! runs the LIT suite and CTS executables and reports every result back.

pub mod config;
pub mod harness;
pub mod orchestrator;
pub mod pipeline;
pub mod process;
pub mod transport;

pub use config::{RunnerConfig, RunnerConfigError};
pub use orchestrator::{BuildPlan, JobOutcome, Orchestrator, Poll};
pub use pipeline::{BuildFailure, BuildPipeline, BuildStage, BuildStep};
pub use transport::{LedgerClient, RETRY_SCHEDULE, TransportError};
