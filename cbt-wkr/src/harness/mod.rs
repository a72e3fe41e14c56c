//! Test execution: the LIT suite, individual CTS executables and the dump
//! files they leave behind.

pub mod cts;
pub mod dumps;
pub mod lit;

pub use cts::{CtsHarness, SuiteVersions, classify};
pub use dumps::{archive_dumps, is_kept_dump};
pub use lit::{LitError, LitRunner, parse_report};
