//! Console runner: open the store, run one sync cycle, print the outcome.
//!
//! Exit codes: 0 on success, 1 on startup or sync failure, 2 when the
//! store is incompatible and `--discard-store` was not given.

use reading_list_core::{AppContext, CoreConfig, StartupError};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

const DISCARD_FLAG: &str = "--discard-store";
const LOG_FILTER_VAR: &str = "RUST_LOG";

/// Load `.env` (or `dotenv_file`) first, so a log filter set there applies
fn logger_from_env(dotenv_file: Option<&Path>, filter_var: &str) -> (env_logger::Builder, Option<PathBuf>) {
    let loaded = match dotenv_file {
        Some(path) => dotenvy::from_path(path).ok().map(|_| path.to_path_buf()),
        None => dotenvy::dotenv().ok(),
    };
    let env = env_logger::Env::default().filter_or(filter_var, "info");
    (env_logger::Builder::from_env(env), loaded)
}

#[tokio::main]
async fn main() -> ExitCode {
    let (mut logger, dotenv) = logger_from_env(None, LOG_FILTER_VAR);
    logger.init();
    if let Some(path) = dotenv {
        log::debug!("Loaded environment from {:?}", path);
    }

    let discard = std::env::args().skip(1).any(|arg| arg == DISCARD_FLAG);

    let config = match CoreConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {}", e);
            eprintln!("FATAL: {}", e);
            return ExitCode::from(1);
        }
    };
    log::info!("Store path: {:?}", config.store_path);

    let ctx = match AppContext::open(config.clone()) {
        Ok(ctx) => ctx,
        Err(StartupError::IncompatibleStore { path, signature }) if discard => {
            log::warn!("Discarding incompatible store {:?} (signature {})", path, signature);
            if let Err(e) = AppContext::discard_store(&path) {
                eprintln!("FATAL: could not discard store: {}", e);
                return ExitCode::from(1);
            }
            match AppContext::open(config) {
                Ok(ctx) => ctx,
                Err(e) => {
                    eprintln!("FATAL: {}", e);
                    return ExitCode::from(1);
                }
            }
        }
        Err(StartupError::IncompatibleStore { path, .. }) => {
            eprintln!(
                "The book store at {:?} was written by an unknown version and cannot be opened.",
                path
            );
            eprintln!("Run again with {} to delete it and start fresh.", DISCARD_FLAG);
            return ExitCode::from(2);
        }
        Err(e) => {
            // A failed migration leaves the store untouched; never continue past it
            log::error!("Startup failed: {}", e);
            eprintln!("FATAL: {}", e);
            return ExitCode::from(1);
        }
    };

    let code = match ctx.run_single_cycle().await {
        Ok(outcome) => {
            match serde_json::to_string_pretty(&outcome) {
                Ok(json) => println!("{}", json),
                Err(_) => println!("{:?}", outcome),
            }
            match ctx.coordinator().queue().stats() {
                Ok(stats) => println!(
                    "pending: {}, conflicts: {}",
                    stats.pending_count, stats.conflict_count
                ),
                Err(e) => log::warn!("Could not read queue stats: {}", e),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("Sync failed: {}", e);
            eprintln!("Sync failed: {}", e);
            ExitCode::from(1)
        }
    };

    ctx.shutdown().await;
    code
}
