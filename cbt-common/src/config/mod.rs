//! Configuration support shared by the daemon and the runner.
//!
//! - Environment variable parsing with type safety
//! - TOML configuration files
//! - Source tracking for debugging

pub mod env;
pub mod file;
pub mod source;

pub use env::{EnvError, EnvParser, expand_path};
pub use file::{ConfigFileError, config_dir, load_toml_file};
pub use source::{ConfigSource, Sourced};

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}
