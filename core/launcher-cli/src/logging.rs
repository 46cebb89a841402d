//! Logging setup: stderr plus a daily rolling file in `~/.launcher/logs/`.
//!
//! `LAUNCHER_DEBUG_LOG=1` forces debug output; otherwise `RUST_LOG` applies,
//! defaulting to `info`.

use std::env;
use std::path::PathBuf;

use fs_err as fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

fn env_filter() -> EnvFilter {
    let debug_enabled = env::var("LAUNCHER_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn log_dir() -> Option<PathBuf> {
    let dir = launcher_core::launcher_home().ok()?.join("logs");
    fs::create_dir_all(&dir).ok()?;
    Some(dir)
}

/// Installs the global subscriber. Keep the returned guard alive for the
/// whole process, or buffered file output is lost.
pub fn init() -> Option<WorkerGuard> {
    let appender = log_dir().and_then(|dir| {
        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("launcherctl")
            .filename_suffix("log")
            .build(dir)
            .ok()
    });
    let (file_layer, guard) = match appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .try_init();
    guard
}
