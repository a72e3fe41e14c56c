#![allow(dead_code)]

use cbt_common::config::Sourced;
use cbt_common::{RevisionBody, TestCatalog};
use cbt_wkr::RunnerConfig;
use cbtd::{AppState, Credential, DaemonConfig, Ledger, create_router, serve};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

pub const RUNNER_NAME: &str = "runner-1";
pub const RUNNER_KEY: &str = "secret";

pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .with(filter)
            .init();
    });
}

/// A ledger daemon on an ephemeral port. Returns its API base URL.
pub async fn spawn_ledger(ledger: Arc<Ledger>, media_dir: &Path) -> String {
    let config = DaemonConfig {
        media_dir: media_dir.to_path_buf(),
        credentials: vec![Credential {
            name: RUNNER_NAME.to_string(),
            key: RUNNER_KEY.to_string(),
            operator: false,
        }],
        ..DaemonConfig::default()
    };
    let router = create_router(AppState::new(ledger, &config));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        serve(listener, router).await.unwrap();
    });
    format!("http://{addr}/")
}

pub fn add_revision(ledger: &Ledger, hash: &str) {
    ledger
        .upsert_revision(RevisionBody {
            hash: hash.to_string(),
            title: format!("Revision {hash}"),
            branch: "main".to_string(),
            staging: false,
            date: chrono::Utc::now(),
            skip: false,
        })
        .unwrap();
}

/// Directory layout of a fake runner host.
pub struct RunnerHost {
    pub root: tempfile::TempDir,
}

impl RunnerHost {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        for dir in ["llvm/build/bin", "llvm/llvm/test", "wrapper/build", "cts/bin", "dumps"] {
            std::fs::create_dir_all(root.path().join(dir)).unwrap();
        }
        Self { root }
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.root.path().join(relative)
    }

    pub fn config(&self, ledger_url: &str) -> RunnerConfig {
        let value = |s: &str| Sourced::default_value(s.to_string());
        let path = |p: &str| Sourced::default_value(self.path(p));
        RunnerConfig {
            ledger_url: value(ledger_url),
            runner_name: value(RUNNER_NAME),
            runner_key: value(RUNNER_KEY),
            build_dir: path("llvm/build"),
            wrapper_build_dir: path("wrapper/build"),
            cts_build_dir: path("cts"),
            catalog: path("cts.json"),
            dump_root: path("dumps"),
            lit_test_dir: path("llvm/llvm/test"),
            lit_max_time_secs: Sourced::default_value(30),
            make_jobs: Sourced::default_value(4),
            idle_interval_secs: Sourced::default_value(1),
            suite_version: value("v2023"),
            toolchain_version: value("1.0.0"),
            runtime_version: value("23.1"),
        }
    }

    #[cfg(unix)]
    pub fn script(&self, relative: &str, body: &str) {
        use std::os::unix::fs::PermissionsExt;

        let path = self.path(relative);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    pub fn catalog(&self, json: &str) -> TestCatalog {
        std::fs::write(self.path("cts.json"), json).unwrap();
        TestCatalog::load(&self.path("cts.json")).unwrap()
    }
}
