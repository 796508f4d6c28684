use std::{fs, path::Path, sync::OnceLock};

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

// Keeps the non-blocking writer's worker thread alive for the process
// lifetime.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the tracing subscriber: env-filtered stdout, plus a daily
/// rolling file under `log_dir` when one is given. Safe to call more
/// than once.
pub fn init(log_dir: Option<&Path>) -> Result<()> {
    if FILE_GUARD.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_target(false);
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer);

    match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "pulsedb.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false);
            match registry.with(file_layer).try_init() {
                Ok(_) => {
                    let _ = FILE_GUARD.set(guard);
                }
                // Subscriber already installed elsewhere; drop the guard
                // so the worker thread exits.
                Err(_) => drop(guard),
            }
        }
        None => {
            let _ = registry.try_init();
        }
    }

    Ok(())
}
