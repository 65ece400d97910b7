//! Shared logging bootstrap for Crucible binaries.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "crucible=info,crucible_worker=info,crucible_registry=info";
const MAX_LOG_FILES: usize = 5;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Initialize tracing with a size-rotated log file plus stderr output.
///
/// `RUST_LOG` overrides the default filter for both sinks. `verbose` lifts
/// the stderr filter to match the file filter.
pub fn init_logging(app_name: &str, verbose: bool) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file_writer = RotatingWriter::open(log_dir, app_name)
        .context("Failed to open rotating log writer")?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if verbose {
        file_filter.clone()
    } else {
        EnvFilter::new("warn")
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

/// Crucible home directory: `$CRUCIBLE_HOME` or `~/.crucible`.
pub fn crucible_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("CRUCIBLE_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .expect("Could not determine home directory")
        .join(".crucible")
}

/// Logs directory: `<home>/logs`.
pub fn logs_dir() -> PathBuf {
    crucible_home().join("logs")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// Size-rotated append-only log file: `<name>.log`, `<name>.log.1`, ...
struct Rotator {
    dir: PathBuf,
    base: String,
    file: File,
    written: u64,
}

impl Rotator {
    fn open(dir: PathBuf, base: &str) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let base = sanitize(base);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{base}.log")))?;
        let written = file.metadata()?.len();
        Ok(Self { dir, base, file, written })
    }

    fn path(&self, index: usize) -> PathBuf {
        if index == 0 {
            self.dir.join(format!("{}.log", self.base))
        } else {
            self.dir.join(format!("{}.log.{}", self.base, index))
        }
    }

    fn rotate(&mut self) -> io::Result<()> {
        let _ = self.file.flush();
        let oldest = self.path(MAX_LOG_FILES - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for idx in (0..MAX_LOG_FILES - 1).rev() {
            let src = self.path(idx);
            if src.exists() {
                fs::rename(&src, self.path(idx + 1))?;
            }
        }
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(0))?;
        self.written = 0;
        Ok(())
    }
}

impl Write for Rotator {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > MAX_LOG_FILE_SIZE {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[derive(Clone)]
struct RotatingWriter {
    inner: Arc<Mutex<Rotator>>,
}

impl RotatingWriter {
    fn open(dir: PathBuf, base: &str) -> Result<Self> {
        let rotator = Rotator::open(dir, base)
            .with_context(|| format!("Failed to open log file for {base}"))?;
        Ok(Self { inner: Arc::new(Mutex::new(rotator)) })
    }
}

struct RotatingWriterGuard {
    inner: Arc<Mutex<Rotator>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RotatingWriter {
    type Writer = RotatingWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        RotatingWriterGuard { inner: Arc::clone(&self.inner) }
    }
}

impl Write for RotatingWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?
            .flush()
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}
