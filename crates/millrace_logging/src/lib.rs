//! Shared logging utilities for Millrace binaries.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str =
    "millrace=info,millrace_engine=info,millrace_detectors=info,millrace_upstream=info";
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Logging configuration shared by Millrace binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
}

/// Initialize tracing with a size-capped file writer and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file_writer = SharedLogWriter::new(log_dir, config.app_name)
        .context("Failed to initialize log writer")?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let console_filter = if config.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// Millrace home directory: ~/.millrace (overridable via MILLRACE_HOME).
pub fn millrace_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("MILLRACE_HOME") {
        return PathBuf::from(override_path);
    }
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(".millrace")
}

/// Logs directory: ~/.millrace/logs
pub fn logs_dir() -> PathBuf {
    millrace_home().join("logs")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

struct LogFileState {
    path: PathBuf,
    file: File,
    current_size: u64,
}

impl LogFileState {
    fn open(dir: &PathBuf, base_name: &str) -> io::Result<Self> {
        let path = dir.join(format!("{base_name}.log"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_size = file.metadata()?.len();
        Ok(Self {
            path,
            file,
            current_size,
        })
    }

    /// Rotate when the file exceeds the cap: keep one `.old`, start fresh.
    fn rotate_if_needed(&mut self) -> io::Result<()> {
        if self.current_size < MAX_LOG_FILE_SIZE {
            return Ok(());
        }
        let old = self.path.with_extension("log.old");
        let _ = fs::remove_file(&old);
        fs::rename(&self.path, &old)?;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.current_size = 0;
        Ok(())
    }
}

/// Clonable writer handle for the tracing file layer.
#[derive(Clone)]
struct SharedLogWriter {
    state: Arc<Mutex<LogFileState>>,
}

impl SharedLogWriter {
    fn new(dir: PathBuf, base_name: &str) -> io::Result<Self> {
        let state = LogFileState::open(&dir, base_name)?;
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }
}

impl Write for SharedLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().expect("log writer poisoned");
        state.rotate_if_needed()?;
        let written = state.file.write(buf)?;
        state.current_size += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self.state.lock().expect("log writer poisoned");
        state.file.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedLogWriter {
    type Writer = SharedLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
