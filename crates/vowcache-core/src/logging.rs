//! Tracing subscriber setup.

use std::io;

use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{Config, DEFAULT_LOG_FILTER};

/// Log file name prefix; the daily appender adds the date.
const LOG_FILE_PREFIX: &str = "vowcache.log";

/// Install the global subscriber: stderr plus, when the log directory can be
/// created, a daily rolling file. `RUST_LOG` overrides `config.log_filter`.
///
/// Keep the returned guard alive for as long as file logging should flush.
/// Returns `None` if a subscriber is already installed or there is no file
/// layer.
pub fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let log_dir = config
        .log_dir()
        .and_then(|dir| std::fs::create_dir_all(&dir).map(|_| dir).map_err(Into::into));

    let (file_layer, guard) = match &log_dir {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        Err(_) => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .try_init()
        .is_ok();

    if !installed {
        return None;
    }
    if let Err(e) = log_dir {
        warn!(error = %e, "File logging disabled");
    }
    guard
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_twice_is_harmless() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            log_dir: Some(dir.path().join("logs")),
            ..Config::default()
        };

        let _first = init_tracing(&config);
        let second = init_tracing(&config);
        assert!(second.is_none());
    }
}
