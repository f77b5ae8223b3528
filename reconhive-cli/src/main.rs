//! `reconhive` binary entry point.

mod cli;
mod commands;
mod error;
mod logging;
mod output;

use std::path::{Path, PathBuf};

use clap::Parser;
use colored::Colorize;
use tracing::{info, warn};

use reconhive_core::config::ReconConfig;

use crate::cli::{Cli, Commands};
use crate::commands::scan::ActiveScan;
use crate::error::CliError;
use crate::output::OutputWriter;

/// Preset picked up from the working directory when `--config` is absent.
const DEFAULT_PRESET: &str = "reconhive.toml";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            report_error(&e);
            e.exit_code()
        }
    };
    // exit without waiting on a stdin read left behind by the prompt
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let active = ActiveScan::default();
    spawn_interrupt_handler(active.clone());

    let mut config = load_config(cli.config.as_deref()).await?;
    if let Some(level) = cli.log_level {
        config.general.log_level = level;
    }
    if let Some(format) = cli.log_format {
        config.general.log_format = format;
    }
    logging::init_tracing(&config.general.log_level, &config.general.log_format)
        .map_err(|e| CliError::Config(e.to_string()))?;
    reconhive_core::metrics::describe_metrics();

    let writer = OutputWriter::new(cli.output);
    match cli.command {
        Commands::Scan(args) => commands::scan::execute(args, config, &active, &writer).await,
        Commands::Modules(args) => commands::modules::execute(args, &writer),
        Commands::Deps(args) => commands::deps::execute(args, &config, &writer).await,
    }
}

/// Explicit path, else `./reconhive.toml` if present, else defaults.
async fn load_config(path: Option<&Path>) -> Result<ReconConfig, CliError> {
    let path = match path {
        Some(p) => Some(p.to_path_buf()),
        None => Some(PathBuf::from(DEFAULT_PRESET)).filter(|p| p.is_file()),
    };
    match path {
        Some(p) => Ok(ReconConfig::load(&p).await?),
        None => {
            let mut config = ReconConfig::default();
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }
}

/// First interrupt cancels the running scan; before a scan exists it exits.
fn spawn_interrupt_handler(active: ActiveScan) {
    tokio::spawn(async move {
        loop {
            let signal = match wait_for_interrupt().await {
                Ok(signal) => signal,
                Err(e) => {
                    warn!(error = %e, "cannot listen for interrupts");
                    return;
                }
            };
            match active.current() {
                Some(handle) if !handle.is_cancelled() => {
                    info!(signal, scan = %handle.name(), "interrupt received");
                    handle.cancel();
                }
                Some(handle) => {
                    info!(signal, scan = %handle.name(), "already cancelling, waiting for tools to exit");
                }
                None => {
                    report_error(&CliError::Interrupted);
                    std::process::exit(CliError::Interrupted.exit_code());
                }
            }
        }
    });
}

#[cfg(unix)]
async fn wait_for_interrupt() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

#[cfg(not(unix))]
async fn wait_for_interrupt() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

fn report_error(e: &CliError) {
    match e {
        CliError::Aborted { .. } | CliError::Interrupted => eprintln!("{}", e.to_string().yellow()),
        _ => eprintln!("{} {}", "error:".red().bold(), e),
    }
}
