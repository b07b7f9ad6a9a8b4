//! Usage: Process-wide tracing setup (stderr + daily rolling file under `<data>/logs/`) and panic hook.

use crate::infra::app_paths::ensure_dir;
use std::path::Path;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_FILE_PREFIX: &str = "kiro-vault.log";

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn env_filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Installs the global subscriber once; later calls are no-ops.
pub fn init(logs_dir: &Path, verbose: bool) {
    if FILE_GUARD.get().is_some() {
        return;
    }

    let file_layer = match ensure_dir(logs_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            Some(fmt::layer().with_writer(writer).with_ansi(false).with_target(true))
        }
        Err(err) => {
            eprintln!("file logging disabled: {err}");
            None
        }
    };

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    let installed = tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
    if installed.is_err() {
        return;
    }

    if let Err(err) = tracing_log::LogTracer::init() {
        tracing::debug!("log bridge not installed: {err}");
    }
    install_panic_hook();
}

/// The payload may carry account data, so only the location is logged.
fn install_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        tracing::error!(location = %location, "PANIC: kiro-vault panicked at {location}");
        previous(panic_info);
    }));
}
