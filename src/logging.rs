use std::{
    ffi::OsStr,
    fs,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use flate2::{Compression, write::GzEncoder};
use parking_lot::Mutex;
use tracing::warn;
use tracing_appender::non_blocking::{self, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const LOG_DIR_ENV: &str = "FLEETLINK_LOG_DIR";
const LOG_PREFIX: &str = "fleetlink";
const MAX_RETAINED_LOGS: usize = 14;

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static PANIC_HOOK: OnceLock<()> = OnceLock::new();

/// Writes to a date-stamped log file (`fleetlink-YYYY-MM-DD.log`). When the
/// local date changes the previous file is gzipped and old archives pruned.
#[derive(Clone)]
struct RollingLogWriter {
    inner: Arc<Mutex<RollingState>>,
    log_dir: Arc<PathBuf>,
}

struct RollingState {
    file: Option<BufWriter<fs::File>>,
    day: NaiveDate,
}

pub fn init() -> Result<()> {
    if FILE_GUARD.get().is_some() {
        return Ok(());
    }

    let log_dir = resolve_log_dir()?;
    let writer = RollingLogWriter::new(log_dir)?;
    let (file_writer, guard) = non_blocking::NonBlockingBuilder::default()
        .lossy(false)
        .finish(writer);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = fmt::layer().with_target(false);
    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_target(true)
        .with_ansi(false);

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer);

    match subscriber.try_init() {
        Ok(_) => {
            let _ = FILE_GUARD.set(guard);
            install_panic_hook();
        }
        Err(_) => {
            // Subscriber already installed elsewhere; drop guard so the
            // worker thread exits.
            drop(guard);
        }
    }

    Ok(())
}

impl RollingLogWriter {
    fn new<P: Into<PathBuf>>(dir: P) -> Result<Self> {
        let log_dir = dir.into();
        fs::create_dir_all(&log_dir)
            .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

        let day = Local::now().date_naive();
        let file = open_day_file(&log_dir, day)?;

        Ok(Self {
            inner: Arc::new(Mutex::new(RollingState {
                file: Some(file),
                day,
            })),
            log_dir: Arc::new(log_dir),
        })
    }

    fn roll(&self, state: &mut RollingState, today: NaiveDate) {
        if let Some(mut writer) = state.file.take() {
            if let Err(err) = writer.flush() {
                eprintln!("failed to flush log file before rollover: {err}");
            }
        }

        let previous = day_file_path(&self.log_dir, state.day);
        if previous.exists() {
            if let Err(err) = compress_file(&previous) {
                warn!("failed to compress rotated log {}: {}", previous.display(), err);
            }
        }
        if let Err(err) = prune_archives(&self.log_dir) {
            warn!(
                "failed to enforce log retention in {}: {}",
                self.log_dir.display(),
                err
            );
        }

        state.day = today;
    }
}

impl Write for RollingLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let today = Local::now().date_naive();
        let mut state = self.inner.lock();

        if today != state.day {
            self.roll(&mut state, today);
        }

        if state.file.is_none() {
            state.file = Some(
                open_day_file(&self.log_dir, state.day).map_err(io::Error::other)?,
            );
        }

        match state.file.as_mut() {
            Some(writer) => {
                writer.write_all(buf)?;
                Ok(buf.len())
            }
            None => Err(io::Error::other("log file unavailable")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self.inner.lock();
        if let Some(writer) = state.file.as_mut() {
            writer.flush()
        } else {
            Ok(())
        }
    }
}

fn day_file_path(dir: &Path, day: NaiveDate) -> PathBuf {
    dir.join(format!("{}-{}.log", LOG_PREFIX, day.format("%Y-%m-%d")))
}

fn open_day_file(dir: &Path, day: NaiveDate) -> Result<BufWriter<fs::File>> {
    let path = day_file_path(dir, day);
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    Ok(BufWriter::new(file))
}

fn compress_file(path: &Path) -> Result<()> {
    let gz_path = path.with_extension("log.gz");

    let mut input = fs::File::open(path)
        .with_context(|| format!("failed to open {} for compression", path.display()))?;
    let output = fs::File::create(&gz_path)
        .with_context(|| format!("failed to create compressed log {}", gz_path.display()))?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    io::copy(&mut input, &mut encoder)
        .with_context(|| format!("failed to compress {}", path.display()))?;
    encoder
        .finish()
        .with_context(|| format!("failed to finish compression for {}", gz_path.display()))?;
    drop(input);
    fs::remove_file(path)
        .with_context(|| format!("failed to remove uncompressed log {}", path.display()))?;

    Ok(())
}

fn prune_archives(log_dir: &Path) -> Result<()> {
    let mut archives: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(log_dir)
        .with_context(|| format!("failed to inspect log directory {}", log_dir.display()))?
    {
        let path = entry?.path();
        let name = match path.file_name().and_then(OsStr::to_str) {
            Some(name) => name,
            None => continue,
        };
        if path.is_file() && name.starts_with(LOG_PREFIX) && name.ends_with(".gz") {
            archives.push(path);
        }
    }

    // Date-stamped names sort chronologically.
    archives.sort();
    while archives.len() > MAX_RETAINED_LOGS {
        let oldest = archives.remove(0);
        if let Err(err) = fs::remove_file(&oldest) {
            warn!("failed to remove expired log {}: {}", oldest.display(), err);
        }
    }

    Ok(())
}

fn resolve_log_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(LOG_DIR_ENV) {
        let path = PathBuf::from(dir);
        if path.is_absolute() {
            return Ok(path);
        }
        let base = std::env::current_dir().context("failed to resolve current working directory")?;
        return Ok(base.join(path));
    }

    let home = dirs::home_dir().context("unable to locate user home directory")?;
    Ok(home.join(".fleetlink").join("logs"))
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Days;
    use tempfile::tempdir;

    #[test]
    fn rolls_to_a_new_file_on_date_change() {
        let temp = tempdir().unwrap();
        let dir = temp.path().to_path_buf();
        let mut writer = RollingLogWriter::new(dir.clone()).unwrap();

        writer.write_all(b"first line\n").unwrap();
        writer.flush().unwrap();

        {
            let mut state = writer.inner.lock();
            state.day = state.day - Days::new(1);
            state.file = None;
        }

        writer.write_all(b"second line\n").unwrap();
        writer.flush().unwrap();

        let names: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(
            names.iter().any(|name| name.ends_with(".log")),
            "expected an active log file, got {names:?}"
        );
    }

    #[test]
    fn prune_keeps_newest_archives() {
        let temp = tempdir().unwrap();
        for day in 1..=(MAX_RETAINED_LOGS + 3) {
            let path = temp
                .path()
                .join(format!("{}-2026-01-{:02}.log.gz", LOG_PREFIX, day));
            fs::write(&path, b"x").unwrap();
        }
        prune_archives(temp.path()).unwrap();
        let remaining = fs::read_dir(temp.path()).unwrap().count();
        assert_eq!(remaining, MAX_RETAINED_LOGS);
    }
}
