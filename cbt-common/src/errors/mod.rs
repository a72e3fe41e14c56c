//! Error catalog and definitions for the compiler backend tester.
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

pub mod catalog;

pub use catalog::{ErrorCategory, ErrorCode, ErrorEntry};
