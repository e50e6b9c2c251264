//! Process-wide logger bootstrap.
//!
//! Logs go to stderr, or to size-rotated files when a directory is given.
//! The first successful call wins; later calls with the same arguments are
//! no-ops and calls with different ones are refused.

use anyhow::{anyhow, bail, Context, Result};
use flexi_logger::{Cleanup, Criterion, FileSpec, Logger, LoggerHandle, Naming, WriteMode};
use log::info;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

const LOG_FILE_BASENAME: &str = "web-notes-bridge";
const MAX_LOG_FILE_SIZE_BYTES: u64 = 5 * 1024 * 1024;
const MAX_LOG_FILES: usize = 3;

static LOGGING: Mutex<Option<LoggingState>> = Mutex::new(None);

struct LoggingState {
    level: &'static str,
    log_dir: Option<PathBuf>,
    _handle: LoggerHandle,
}

pub fn init_logging(level: &str, log_dir: Option<&Path>) -> Result<()> {
    let level = normalize_level(level)?;
    let log_dir = log_dir.map(Path::to_path_buf);

    let mut state = LOGGING.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(active) = state.as_ref() {
        if active.log_dir != log_dir {
            bail!(
                "logging already initialized for {}",
                describe(active.log_dir.as_deref())
            );
        }
        if active.level != level {
            bail!("logging already initialized at level '{}'", active.level);
        }
        return Ok(());
    }

    let logger = Logger::try_with_str(level)
        .with_context(|| format!("invalid log level '{}'", level))?;
    let logger = match &log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            logger
                .log_to_file(FileSpec::default().directory(dir).basename(LOG_FILE_BASENAME))
                .rotate(
                    Criterion::Size(MAX_LOG_FILE_SIZE_BYTES),
                    Naming::Numbers,
                    Cleanup::KeepLogFiles(MAX_LOG_FILES),
                )
                .write_mode(WriteMode::BufferAndFlush)
                .append()
                .format_for_files(flexi_logger::detailed_format)
        }
        None => logger.format_for_stderr(flexi_logger::default_format),
    };
    let handle = logger
        .start()
        .map_err(|e| anyhow!("failed to start logger: {}", e))?;

    info!(
        "web-notes-bridge {} logging at {} to {}",
        env!("CARGO_PKG_VERSION"),
        level,
        describe(log_dir.as_deref())
    );
    *state = Some(LoggingState {
        level,
        log_dir,
        _handle: handle,
    });
    Ok(())
}

pub fn default_log_level() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    }
}

fn normalize_level(level: &str) -> Result<&'static str> {
    Ok(match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" | "warning" => "warn",
        "error" => "error",
        other => bail!("unsupported log level '{}'", other),
    })
}

fn describe(log_dir: Option<&Path>) -> String {
    match log_dir {
        Some(dir) => dir.display().to_string(),
        None => "stderr".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_level() {
        assert_eq!(normalize_level(" WARNING ").unwrap(), "warn");
        assert_eq!(normalize_level("debug").unwrap(), "debug");
        assert!(normalize_level("loud").is_err());
    }

    #[test]
    fn test_init_is_idempotent_and_refuses_changes() {
        let dir = tempfile::tempdir().unwrap();
        init_logging("info", Some(dir.path())).unwrap();
        init_logging("INFO", Some(dir.path())).unwrap();

        assert!(init_logging("debug", Some(dir.path())).is_err());
        assert!(init_logging("info", None).is_err());
        assert!(dir.path().exists());
    }
}
