//! `stallwatch` – blocking-detector command line
//!
//! - `stallwatch selftest` spawns a task that spins and a task that sleeps
//!   under a blocking detector and reports whether the first was interrupted
//!   and the second left alone.
//! - `stallwatch config` prints the effective configuration (file, then
//!   `STALLWATCH_*` environment overrides, then flags) as TOML.

mod config;
mod selftest;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use stallwatch_types::{InterruptMode, StallError};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "stallwatch", version, about = "Detect tasks that block a cooperative runtime")]
struct Cli {
    /// Config file (default: ~/.stallwatch/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Confirm that blocking is detected and cooperation is not.
    Selftest(Overrides),
    /// Print the effective configuration.
    Config {
        #[command(flatten)]
        overrides: Overrides,
        /// Also write it to the config file.
        #[arg(long)]
        write: bool,
    },
}

#[derive(Args, Debug, Default)]
struct Overrides {
    /// Detection threshold in seconds.
    #[arg(long)]
    timeout: Option<f64>,
    /// `none` to only log, `alarm` to interrupt.
    #[arg(long)]
    interrupt: Option<InterruptMode>,
    /// Re-arm immediately after a report (`true`/`false`).
    #[arg(long)]
    aggressive: Option<bool>,
}

impl Overrides {
    fn apply(&self, cfg: &mut config::Config) {
        if let Some(timeout) = self.timeout {
            cfg.watchdog.timeout_secs = timeout;
        }
        if let Some(mode) = self.interrupt {
            cfg.watchdog.interrupt = mode;
        }
        if let Some(aggressive) = self.aggressive {
            cfg.watchdog.aggressive = aggressive;
        }
    }
}

/// Timeout used by `selftest` when neither the file, `STALLWATCH_TIMEOUT`
/// nor `--timeout` sets one.
const SELFTEST_TIMEOUT_SECS: f64 = 0.25;

/// Effective config for `selftest`.
fn selftest_config(loaded: config::LoadedConfig, overrides: &Overrides) -> config::Config {
    let mut cfg = loaded.config;
    if !loaded.timeout_set {
        cfg.watchdog.timeout_secs = SELFTEST_TIMEOUT_SECS;
    }
    overrides.apply(&mut cfg);
    cfg
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _telemetry = match stallwatch_runtime::init_tracing("stallwatch") {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("{}: {e}", "warning".yellow());
            None
        }
    };

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "stallwatch failed");
            eprintln!("{}: {e}", "error".red().bold());
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, StallError> {
    let path = cli.config.unwrap_or_else(config::config_path);
    let loaded = config::load_or_default(&path)?;

    match cli.command.unwrap_or(Command::Selftest(Overrides::default())) {
        Command::Selftest(overrides) => run_selftest(&selftest_config(loaded, &overrides)),
        Command::Config { overrides, write } => {
            let mut cfg = loaded.config;
            overrides.apply(&mut cfg);
            cfg.watchdog.timeout()?;
            print!("{}", config::to_toml(&cfg)?);
            if write {
                config::save_to(&cfg, &path)?;
                println!("{} saved to {}", "✓".green().bold(), path.display().to_string().bold());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_selftest(cfg: &config::Config) -> Result<ExitCode, StallError> {
    println!(
        "  {} {} (timeout={}s, aggressive={})",
        "stallwatch".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed(),
        cfg.watchdog.timeout_secs,
        cfg.watchdog.aggressive,
    );

    let checks = selftest::run(&cfg.watchdog)?;
    for check in &checks {
        let verdict = if check.passed { "ok.".green().bold() } else { "FAILED".red().bold() };
        println!("  Testing that {}... {verdict}", check.name);
        println!("    {}", check.detail.dimmed());
    }

    if checks.iter().all(|c| c.passed) {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
