use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use uberbackup::config::{AppConfig, DEFAULT_BASE_DIR, Overrides};
use uberbackup::context::AppContext;
use uberbackup::daemon::{self, lock};
use uberbackup::error::DaemonError;
use uberbackup::{logging, status};

const EXIT_USAGE: u8 = 1;
const EXIT_UNKNOWN_COMMAND: u8 = 2;
const EXIT_CONFIG: u8 = 255;

#[derive(Parser)]
#[command(name = "uberbackup", version)]
#[command(about = "Rotating rsync snapshot backups of remote hosts", long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Root holding conf/, data/ and run/
    #[arg(long, global = true, env = "UBERBACKUP_BASE_DIR", default_value = DEFAULT_BASE_DIR)]
    base_dir: PathBuf,

    /// Config file (default: <base-dir>/conf/uberbackup.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    verbose: bool,

    #[arg(long, global = true)]
    json_logs: bool,

    /// Use the simulated transfer engine and skip host probes
    #[arg(long, global = true)]
    simulation: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon in the foreground
    Debug,
    /// Detach and run the daemon in the background
    Service,
    /// Show the last backup of every job
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Ask the running daemon to shut down
    Stop,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                ErrorKind::InvalidSubcommand => EXIT_UNKNOWN_COMMAND,
                _ => EXIT_USAGE,
            };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let overrides = Overrides {
        simulation: cli.simulation.then_some(true),
        verbose: cli.verbose.then_some(true),
        json_logs: cli.json_logs.then_some(true),
    };
    let config = match AppConfig::load(&cli.base_dir, cli.config.as_deref(), &overrides) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("uberbackup: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let result = match cli.command {
        Command::Debug => serve(config, false),
        Command::Service => serve(config, true),
        Command::Status { json } => show_status(&config, json),
        Command::Stop => stop(&config),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("uberbackup: {e:#}");
            error!(error = %format!("{e:#}"), "Fatal error");
            ExitCode::from(EXIT_USAGE)
        }
    }
}

fn serve(config: AppConfig, background: bool) -> Result<ExitCode> {
    if background {
        // Report a second instance on the terminal, before stdio is detached.
        if let Err(e) = lock::ensure_not_running(&config.pid_file()) {
            eprintln!("uberbackup: {e}");
            return Ok(ExitCode::from(EXIT_USAGE));
        }
        if config.global.log_file.is_none() {
            eprintln!("uberbackup: no global.log_file configured, service output is discarded");
        }
        daemon::daemonize()?;
    }

    logging::init(logging::LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
        file: config.global.log_file.clone(),
    })?;
    for skipped in &config.skipped {
        warn!(job = %skipped.name, reason = %skipped.reason, "Skipping job");
    }
    if config.simulation {
        info!("Simulation mode: no remote transfers will run");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    match runtime.block_on(daemon::run(AppContext::new(config))) {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e @ DaemonError::AlreadyRunning { .. }) => {
            error!(error = %e, "Refusing to start");
            if !background {
                eprintln!("uberbackup: {e}");
            }
            Ok(ExitCode::from(EXIT_USAGE))
        }
        Err(e) => Err(e).context("Daemon failed"),
    }
}

fn show_status(config: &AppConfig, json: bool) -> Result<ExitCode> {
    let report = status::collect(config, chrono::Local::now().date_naive());
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", status::render(&report, std::io::stdout().is_terminal()));
    }
    Ok(ExitCode::SUCCESS)
}

fn stop(config: &AppConfig) -> Result<ExitCode> {
    match lock::stop(&config.pid_file()) {
        Ok(pid) => {
            println!("Sent SIGTERM to uberbackup (pid {pid})");
            Ok(ExitCode::SUCCESS)
        }
        Err(
            e @ (DaemonError::NotRunning { .. }
            | DaemonError::StaleLock { .. }
            | DaemonError::InvalidLock { .. }),
        ) => {
            eprintln!("uberbackup: {e}");
            Ok(ExitCode::from(EXIT_USAGE))
        }
        Err(e) => Err(e).context("Failed to stop daemon"),
    }
}
