//! The tracedb binary: one executable, one role per process selected by
//! `--target`.

use clap::Parser;
use observability_deps::tracing::error;
use std::{path::PathBuf, process::ExitCode};
use tracing_subscriber::EnvFilter;

mod config;
mod http;
mod run;
mod service;

use config::Config;
use run::{RunError, Target};

#[derive(Debug, Parser)]
#[clap(
    name = "tracedb",
    about = "A horizontally scalable, multi-tenant trace store",
    long_about = "Runs one tracedb role (or all of them in a single process).\n\n\
    Configuration comes from an optional YAML file; every option has a \
    default, so `tracedb --target=all` starts a complete single-node \
    instance."
)]
struct Cli {
    /// Which role this process runs.
    #[clap(long = "target", arg_enum, default_value = "all", env = "TRACEDB_TARGET")]
    target: Target,

    /// Path to the YAML configuration file.
    #[clap(long = "config.file", env = "TRACEDB_CONFIG_FILE")]
    config_file: Option<PathBuf>,

    /// Expand ${VAR} references in the configuration file from the
    /// environment.
    #[clap(long = "config.expand-env")]
    config_expand_env: bool,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let config = match Config::load(cli.config_file.as_deref(), cli.config_expand_env) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::from(1);
        }
    };

    match run::run(cli.target, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::ServiceFailed(reason)) => {
            error!(reason = %reason, "unrecoverable service failure");
            ExitCode::from(2)
        }
        Err(e) => {
            error!(error = %e, "initialization failed");
            ExitCode::from(1)
        }
    }
}
