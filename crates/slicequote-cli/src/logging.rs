//! Log output: human-readable lines on stderr plus a per-job `debug.log`.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Context;
use tracing::Level;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry};

/// Name of the log file kept inside a job's work directory.
pub const DEBUG_LOG_FILE: &str = "debug.log";

/// Appends to `<dir>/debug.log` once `dir` exists; discards until then.
///
/// The directory is never created here, so logging cannot get ahead of the
/// stale sweep or outlive teardown.
#[derive(Debug, Clone)]
pub struct DebugLog {
    dir: Option<PathBuf>,
}

impl DebugLog {
    /// Log into `dir` when it exists.
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }
}

/// Writer handed out per event by [`DebugLog`].
#[derive(Debug)]
pub struct DebugLogWriter(Option<File>);

impl Write for DebugLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.0 {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.0 {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DebugLog {
    type Writer = DebugLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        let file = self
            .dir
            .as_ref()
            .filter(|dir| dir.is_dir())
            .and_then(|dir| {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join(DEBUG_LOG_FILE))
                    .ok()
            });
        DebugLogWriter(file)
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` selects what is logged, `info` when unset or invalid.
pub fn init(debug_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(Level::INFO.into()));

    let stderr_layer = fmt::layer().with_target(false).with_writer(io::stderr);
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(DebugLog::new(debug_dir));

    let subscriber = Registry::default()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer);
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global default subscriber")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discards_until_directory_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("job");
        let log = DebugLog::new(Some(dir.clone()));

        log.make_writer().write_all(b"early\n").unwrap();
        assert!(!dir.exists());

        std::fs::create_dir(&dir).unwrap();
        log.make_writer().write_all(b"first\n").unwrap();
        log.make_writer().write_all(b"second\n").unwrap();
        let text = std::fs::read_to_string(dir.join(DEBUG_LOG_FILE)).unwrap();
        assert_eq!(text, "first\nsecond\n");

        std::fs::remove_dir_all(&dir).unwrap();
        log.make_writer().write_all(b"late\n").unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn test_without_directory() {
        let mut writer = DebugLog::new(None).make_writer();
        assert_eq!(writer.write(b"dropped").unwrap(), 7);
        writer.flush().unwrap();
    }
}
