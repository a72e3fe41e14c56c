//! Compiler backend tester - job ledger daemon.
//!
//! Owns revisions, jobs and results; hands queued jobs to runners through
//! an atomic lease and accepts their status writes and results over HTTP.

pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod dumps;
pub mod http_api;
pub mod ledger;

pub use config::{Credential, DaemonConfig};
pub use dispatcher::Dispatcher;
pub use dumps::{DumpRetention, DumpStore};
pub use http_api::{AppState, create_router, serve};
pub use ledger::{JobRecord, Ledger, LedgerError, StatusChange};
