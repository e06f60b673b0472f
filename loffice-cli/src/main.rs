mod app;
mod logging;
mod output;
mod program;

use anyhow::{bail, Result};
use chrono::Local;
use clap::Parser;
use loffice::{FailurePolicy, OfficeVersion, Report, SessionConfig};
use tracing::{error, info};

use crate::app::Cli;

fn main() {
    let cli = Cli::parse();
    let code = match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("loffice: {e:#}");
            2
        }
    };
    std::process::exit(code);
}

/// Returns the process exit code. `Err` is a usage or setup problem found
/// before anything was started.
fn run(cli: &Cli) -> Result<i32> {
    let office_dir = cli.path.clone().unwrap_or_else(program::default_office_dir);
    if !office_dir.is_dir() {
        bail!("Specified Office path does not exist: \"{}\"",
              office_dir.display());
    }
    if !cli.filename.is_file() {
        bail!("Specified file to analyse does not exist: \"{}\"",
              cli.filename.display());
    }

    let log_file = (!cli.no_log_file)
        .then(|| logging::log_file_path(&cli.filename, Local::now()));
    logging::init(cli.verbose, log_file.as_deref())?;

    let target = program::select(cli.program, &cli.filename, &office_dir)?;
    info!("Using office path: \"{}\"", target.display());

    let config = SessionConfig {
        target,
        document: cli.filename.clone(),
        exit_policy: cli.exit_on.into(),
        verbose: cli.verbose,
        writes_only: cli.writes_only,
        failure_policy: if cli.skip_unresolved {
            FailurePolicy::SkipOnFailure
        } else {
            FailurePolicy::AbortOnFailure
        },
        office_version: OfficeVersion::from_install_dir(&office_dir),
    };
    info!("Invocation command: \"{}\"", config.command_line().join(" "));

    let show_progress = !cli.verbose && !cli.json;
    let report = match launch(config, show_progress) {
        Ok(report) => report,
        Err(e) => {
            error!("{e:#}");
            return Ok(3);
        }
    };

    output::print(&report, cli.json)?;
    Ok(report.outcome.exit_code())
}

#[cfg(windows)]
fn launch(config: SessionConfig, show_progress: bool) -> Result<Report> {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use anyhow::Context;

    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = interrupt.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("failed to set Ctrl+C handler")?;

    info!("Launching...");
    let report = loffice::trace::trace(config, interrupt, |stats| {
        if show_progress {
            let _ = output::progress(&mut std::io::stdout(), stats);
        }
    })?;
    Ok(report)
}

#[cfg(not(windows))]
fn launch(_config: SessionConfig, _show_progress: bool) -> Result<Report> {
    bail!("tracing requires a Windows host")
}
