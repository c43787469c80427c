use std::{path::PathBuf, sync::OnceLock};

use anyhow::{Context, Result};
use tracing_appender::non_blocking::{self, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const LOG_DIR_ENV: &str = "TRACEDX_LOG_DIR";
const LOG_FILE_NAME: &str = "tracedx.log";

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static PANIC_HOOK: OnceLock<()> = OnceLock::new();

/// Install the tracing subscriber: env-filtered stdout layer, plus a
/// non-blocking file layer when `TRACEDX_LOG_DIR` is set. Idempotent.
pub fn init() -> Result<()> {
    if FILE_GUARD.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_target(false);

    let file_layer = match resolve_log_dir()? {
        Some(log_dir) => {
            std::fs::create_dir_all(&log_dir)
                .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_dir.join(LOG_FILE_NAME))
                .with_context(|| format!("failed to open log file in {}", log_dir.display()))?;
            let (writer, guard) = non_blocking::NonBlockingBuilder::default()
                .lossy(false)
                .finish(file);
            let _ = FILE_GUARD.set(guard);
            Some(fmt::layer().with_writer(writer).with_ansi(false))
        }
        None => None,
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer);

    if subscriber.try_init().is_ok() {
        install_panic_hook();
    }

    Ok(())
}

fn resolve_log_dir() -> Result<Option<PathBuf>> {
    match std::env::var(LOG_DIR_ENV) {
        Ok(dir) if !dir.trim().is_empty() => {
            let path = PathBuf::from(dir);
            if path.is_absolute() {
                Ok(Some(path))
            } else {
                let base = std::env::current_dir()
                    .context("failed to resolve current working directory")?;
                Ok(Some(base.join(path)))
            }
        }
        _ => Ok(None),
    }
}

fn install_panic_hook() {
    PANIC_HOOK.get_or_init(|| {
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if let Some(location) = info.location() {
                tracing::error!(
                    target: "panic",
                    file = location.file(),
                    line = location.line(),
                    message = %info
                );
            } else {
                tracing::error!(target: "panic", message = %info);
            }
            default_hook(info);
        }));
    });
}
