use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::core::config::AppPaths;

pub const LOG_FILE_PREFIX: &str = "server.log";

/// Used when `RUST_LOG` is unset or unparsable. HTTP client internals are
/// held at `warn` so provider streaming does not flood the log.
const DEFAULT_DIRECTIVES: &str = "info,hyper=warn,hyper_util=warn,h2=warn,reqwest=warn";

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

fn file_writer(log_dir: &Path) -> Option<NonBlocking> {
    if let Err(err) = std::fs::create_dir_all(log_dir) {
        eprintln!("Cannot create log dir {}: {}", log_dir.display(), err);
        return None;
    }
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX));
    FILE_GUARD.set(guard).ok().map(|_| writer)
}

/// Installs stdout logging plus a daily-rolling file under `paths.log_dir`.
///
/// Only the first call has any effect. If the log dir cannot be created the
/// server still logs to stdout.
pub fn init(paths: &AppPaths) {
    if FILE_GUARD.get().is_some() {
        return;
    }
    let file_layer = file_writer(&paths.log_dir).map(|writer| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .with_writer(writer)
    });

    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .try_init();
}
