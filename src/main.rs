//! whalecopy: Polymarket whale copy-trading paper-trading engine.
//!
//! Thin CLI entry point. All orchestration lives in `whalecopy_core`; this
//! binary only resolves configuration, wires up logging, drives a
//! `Supervisor` run to completion, and maps the outcome onto a process exit
//! code.

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use whalecopy_core::config::RunMode;
use whalecopy_core::{Config, CoreError, Supervisor};

const EXIT_OK: u8 = 0;
const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_PERSISTENCE_ERROR: u8 = 2;
const EXIT_PROMOTION_GATE_FAILED: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "whalecopy", version, about = "Polymarket whale copy-trading engine")]
struct Cli {
    /// Path to a TOML config file. Defaults to `WHALECOPY_CONFIG_PATH` or
    /// `whalecopy.toml`, falling back to built-in defaults if unreadable.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the engine until the duration elapses or it is cancelled.
    Run {
        /// `paper` or `live`. `live` is only accepted after a passing
        /// promotion-gate history in the paper run's persisted state.
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        /// Validity window in hours; overrides config/env if set.
        #[arg(long = "duration-hours")]
        duration_hours: Option<u64>,
    },
    /// Accelerated simulation: same wiring as `run`, with a short duration
    /// suitable for smoke-testing the whole pipeline end-to-end.
    Demo,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum ModeArg {
    Paper,
    Live,
}

#[tokio::main]
async fn main() -> ExitCode {
    load_env();
    init_tracing();

    let cli = Cli::parse();

    let mut config = match load_config(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    match cli.command {
        Command::Run { mode, duration_hours } => {
            if let Some(mode) = mode {
                config.supervisor.mode = match mode {
                    ModeArg::Paper => RunMode::Paper,
                    ModeArg::Live => RunMode::Live,
                };
            }
            if let Some(hours) = duration_hours {
                config.supervisor.duration_hours = Some(hours);
            }
        }
        Command::Demo => {
            config.supervisor.mode = RunMode::Paper;
            config.supervisor.duration_hours = Some(1);
        }
    }

    match resolve_data_path(&config.database_path) {
        Ok(resolved) => config.database_path = resolved,
        Err(e) => {
            error!("failed to resolve database path: {e:#}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    }

    if let Err(e) = config.validate_for_run() {
        error!("configuration error: {e}");
        return ExitCode::from(EXIT_CONFIG_ERROR);
    }

    run(config).await
}

async fn run(config: Config) -> ExitCode {
    let requested_live = matches!(config.supervisor.mode, RunMode::Live);

    info!(mode = ?config.supervisor.mode, "booting whalecopy supervisor");

    let supervisor = match Supervisor::boot(config).await {
        Ok(s) => s,
        Err(e) => {
            error!("failed to boot supervisor: {e}");
            return ExitCode::from(exit_code_for(&e));
        }
    };

    let shutdown = supervisor.shutdown_handle();
    tokio::spawn(await_ctrl_c(shutdown));

    let verdict = match supervisor.run().await {
        Ok(v) => v,
        Err(e) => {
            error!("supervisor run failed: {e}");
            return ExitCode::from(exit_code_for(&e));
        }
    };

    info!(
        eligible = verdict.eligible,
        runtime_hours = verdict.runtime_hours,
        roi_pct = %verdict.roi_pct,
        max_drawdown_pct = %verdict.max_drawdown_pct,
        kill_switch_active = verdict.kill_switch_active,
        "promotion gate evaluated"
    );
    for reason in &verdict.reasons_blocked {
        warn!("promotion gate blocked: {reason}");
    }

    if requested_live && !verdict.eligible {
        error!("live mode requested without a qualifying paper-trading history");
        return ExitCode::from(EXIT_PROMOTION_GATE_FAILED);
    }

    ExitCode::from(EXIT_OK)
}

async fn await_ctrl_c(shutdown: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received, draining in-flight work");
        shutdown.cancel();
    }
}

fn exit_code_for(e: &CoreError) -> u8 {
    match e {
        CoreError::Config(_) => EXIT_CONFIG_ERROR,
        CoreError::Persistence(_) => EXIT_PERSISTENCE_ERROR,
        _ => EXIT_PERSISTENCE_ERROR,
    }
}

fn load_config(explicit: Option<&std::path::Path>) -> Result<Config, CoreError> {
    if let Some(path) = explicit {
        return Config::load(path);
    }
    if let Ok(path) = std::env::var("WHALECOPY_CONFIG_PATH") {
        return Config::load(path);
    }
    Ok(Config::from_env_or_default())
}

/// Resolves the data directory a relative database path is written under.
/// Anchored to the binary's manifest directory so running the binary from a
/// different working directory doesn't silently create a second database.
/// Glue-level concern only, so it uses `anyhow` rather than `CoreError`.
fn resolve_data_path(raw: &str) -> anyhow::Result<String> {
    use anyhow::Context;
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        return Ok(raw.to_string());
    }
    let manifest_dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR"));
    let resolved = manifest_dir.join(&path);
    if let Some(parent) = resolved.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data directory {}", parent.display()))?;
    }
    Ok(resolved.to_string_lossy().into_owned())
}

fn load_env() {
    let _ = dotenv();
    let manifest_dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR"));
    for candidate in [manifest_dir.join(".env"), manifest_dir.join("../.env")] {
        if candidate.exists() {
            let _ = dotenv::from_path(&candidate);
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "whalecopy_core=info,whalecopy=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
