//! Compiler backend tester - runner agent.

#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use cbt_common::config::{Sourced, config_dir};
use cbt_common::{CatalogEntry, ErrorCode, LogConfig, TestCatalog, init_logging};
use cbt_wkr::harness::CtsHarness;
use cbt_wkr::{LedgerClient, Orchestrator, Poll, RunnerConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "cbt-wkr")]
#[command(author, version, about = "CBT runner - builds revisions and runs the test suites")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Runner configuration file (TOML); defaults to ~/.config/cbt/runner.toml
    #[arg(short, long, global = true, env = "CBT_CONFIG")]
    config: Option<PathBuf>,

    /// Runner name, overriding the file and CBT_RUNNER_NAME
    #[arg(long = "name", global = true)]
    runner_name: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Process queued jobs until a fatal error
    Run,

    /// Process at most one queued job and exit
    Once,

    /// Validate and print the CTS test catalog
    Catalog {
        /// Only list tests in this category
        #[arg(long)]
        category: Option<String>,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run one CTS test locally without contacting the ledger
    Test {
        category: String,
        name: String,

        /// Keep the dump archive instead of deleting it
        #[arg(long)]
        keep_dump: bool,
    },

    /// Describe an error code, e.g. CBT-E301
    Explain { code: String },

    /// Validate the configuration and show where each value came from
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries command output; logs go to stderr.
    let mut log_config = LogConfig::from_env("cbt-wkr").with_stderr(true);
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _log_guards = init_logging(&log_config)?;

    if let Commands::Explain { code } = &cli.command {
        return explain(code);
    }

    let config_path = cli.config.clone().or_else(|| {
        config_dir()
            .map(|dir| dir.join("runner.toml"))
            .filter(|path| path.exists())
    });
    let mut config = RunnerConfig::load(config_path.as_deref()).map_err(|e| {
        error!(error_code = %e.code().code_string(), "{}", e);
        e
    })?;
    if let Some(name) = cli.runner_name {
        config.runner_name = Sourced::from_cli(name);
    }

    match cli.command {
        Commands::CheckConfig => {
            for (name, value, source) in config.describe() {
                println!("{name:<20} {value:<50} [{source}]");
            }
            let missing = config.missing_directories();
            for (name, dir) in &missing {
                println!("warning: {name} {} is not a directory", dir.display());
            }
            load_catalog(&config)?;
            println!("configuration OK");
        }
        Commands::Catalog { category, json } => {
            let catalog = load_catalog(&config)?;
            let entries: Vec<&CatalogEntry> = match &category {
                Some(category) => catalog.entries_for_category(category).collect(),
                None => catalog.entries().iter().collect(),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in entries {
                    println!(
                        "{}/{}: {} {} (timeout {}s)",
                        entry.test_category,
                        entry.test_name,
                        entry.resolve_executable(&config.cts_build_dir.value).display(),
                        entry.argument_string(),
                        entry.timeout_secs
                    );
                }
            }
        }
        Commands::Test {
            category,
            name,
            keep_dump,
        } => {
            let catalog = load_catalog(&config)?;
            let entry = catalog.get(&category, &name).map_err(|e| {
                error!(error_code = %e.code().code_string(), "{}", e);
                e
            })?;
            let result = CtsHarness::from_config(&config).run(entry).await;
            print!("{}", result.standard_output);
            eprint!("{}", result.standard_error);
            println!("{result}");
            if let Some(dump) = &result.dump_path {
                if keep_dump {
                    println!("dump archive: {}", dump.display());
                } else {
                    std::fs::remove_file(dump)
                        .with_context(|| format!("failed to delete {}", dump.display()))?;
                }
            }
        }
        Commands::Explain { .. } => {}
        Commands::Once => {
            let orchestrator = build_orchestrator(&config)?;
            match orchestrator.run_once().await? {
                Poll::Idle => info!("No queued job"),
                Poll::Processed(id, outcome) => info!("Job {} ended: {:?}", id, outcome),
            }
        }
        Commands::Run => {
            for (name, dir) in config.missing_directories() {
                warn!("{} {} is not a directory", name, dir.display());
            }
            let orchestrator = build_orchestrator(&config)?;
            orchestrator
                .run_forever()
                .await
                .context("runner stopped on a ledger error")?;
        }
    }

    Ok(())
}

fn explain(code: &str) -> Result<()> {
    let wanted = code.trim().to_uppercase();
    let Some(found) = ErrorCode::all()
        .iter()
        .find(|c| c.code_string() == wanted || c.code_number().to_string() == wanted)
    else {
        bail!("unknown error code {code}");
    };
    let entry = found.entry();
    print!("{}", entry.format_full());
    println!("Category: {}", entry.category);
    Ok(())
}

fn load_catalog(config: &RunnerConfig) -> Result<TestCatalog> {
    let path = &config.catalog.value;
    let catalog = TestCatalog::load(path).map_err(|e| {
        error!(error_code = %e.code().code_string(), "{}", e);
        e
    })?;
    info!(
        "Loaded {} CTS tests in {} categories from {}",
        catalog.len(),
        catalog.categories().len(),
        path.display()
    );
    Ok(catalog)
}

fn build_orchestrator(config: &RunnerConfig) -> Result<Orchestrator> {
    let catalog = load_catalog(config)?;
    let client = LedgerClient::from_config(config)?;
    info!(
        "Runner {} using ledger {}",
        config.runner_name.value, config.ledger_url.value
    );
    Ok(Orchestrator::new(config, client, catalog))
}
