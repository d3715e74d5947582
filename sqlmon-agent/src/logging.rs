use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, SystemTime};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

pub const RELOAD_POLL_INTERVAL: Duration = Duration::from_secs(2);

type FilterHandle = reload::Handle<EnvFilter, Registry>;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LogSettings {
  #[serde(default = "default_level")]
  pub level: String,

  #[serde(default = "default_true")]
  pub console: bool,

  #[serde(default)]
  pub directory: Option<PathBuf>,

  #[serde(default = "default_file_prefix")]
  pub file_prefix: String,

  #[serde(default = "default_retention_days")]
  pub retention_days: u64,
}

fn default_level() -> String {
  "info".to_string()
}

fn default_true() -> bool {
  true
}

fn default_file_prefix() -> String {
  "sqlmon-agent.log".to_string()
}

fn default_retention_days() -> u64 {
  14
}

impl Default for LogSettings {
  fn default() -> Self {
    Self {
      level: default_level(),
      console: true,
      directory: None,
      file_prefix: default_file_prefix(),
      retention_days: default_retention_days(),
    }
  }
}

impl LogSettings {
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let raw = fs::read_to_string(path)
      .with_context(|| format!("read logging config {}", path.display()))?;
    let mut settings: LogSettings =
      toml::from_str(&raw).with_context(|| format!("parse logging config {}", path.display()))?;

    if let Some(dir) = settings.directory.take() {
      let parent = path.parent().unwrap_or_else(|| Path::new("."));
      settings.directory = Some(if dir.is_relative() { parent.join(dir) } else { dir });
    }
    Ok(settings)
  }

  fn same_outputs(&self, other: &LogSettings) -> bool {
    self.console == other.console
      && self.directory == other.directory
      && self.file_prefix == other.file_prefix
  }
}

/// Process-lifetime logging state. Dropping it stops the config watcher and
/// flushes the file writer, in that order.
pub struct LoggingContext {
  config_path: PathBuf,
  fallback_reason: Option<String>,
  raw_console: RawConsole,
  _watcher: Option<ConfigWatcher>,
  _file_guard: Option<WorkerGuard>,
}

impl LoggingContext {
  pub fn config_path(&self) -> &Path {
    &self.config_path
  }

  /// Why the bootstrap fell back to defaults, if it did.
  pub fn fallback_reason(&self) -> Option<&str> {
    self.fallback_reason.as_deref()
  }

  /// Switch the console reader flips while the terminal is in raw mode.
  pub fn raw_console(&self) -> &RawConsole {
    &self.raw_console
  }
}

/// Shared flag telling the console layer that the terminal is in raw mode.
/// Raw mode turns off output post-processing, so bare `\n` no longer returns
/// the cursor to column 0.
#[derive(Debug, Clone, Default)]
pub struct RawConsole(Arc<AtomicBool>);

impl RawConsole {
  pub fn set_active(&self, active: bool) {
    self.0.store(active, Ordering::SeqCst);
  }

  pub fn is_active(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

/// `MakeWriter` for the console layer: stderr, with CRLF line endings while
/// raw mode is active.
#[derive(Debug, Clone)]
pub struct ConsoleWriter {
  raw: RawConsole,
}

impl ConsoleWriter {
  pub fn new(raw: RawConsole) -> Self {
    Self { raw }
  }
}

impl<'a> MakeWriter<'a> for ConsoleWriter {
  type Writer = LineEndingWriter<io::Stderr>;

  fn make_writer(&'a self) -> Self::Writer {
    LineEndingWriter::new(io::stderr(), self.raw.is_active())
  }
}

pub struct LineEndingWriter<W> {
  inner: W,
  crlf: bool,
}

impl<W: Write> LineEndingWriter<W> {
  pub fn new(inner: W, crlf: bool) -> Self {
    Self { inner, crlf }
  }
}

impl<W: Write> Write for LineEndingWriter<W> {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    if !self.crlf {
      return self.inner.write(buf);
    }
    for chunk in buf.split_inclusive(|b| *b == b'\n') {
      match chunk.strip_suffix(b"\n") {
        Some(line) => {
          self.inner.write_all(line)?;
          self.inner.write_all(b"\r\n")?;
        }
        None => self.inner.write_all(chunk)?,
      }
    }
    Ok(buf.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    self.inner.flush()
  }
}

pub fn initialize(config_path: &Path) -> LoggingContext {
  let (settings, mut fallback_reason) = match LogSettings::load(config_path) {
    Ok(s) => (s, None),
    Err(e) => (LogSettings::default(), Some(format!("{e:#}"))),
  };

  let (filter, filter_handle) = reload::Layer::new(parse_filter(&settings.level));

  let mut file_guard = None;
  let file_layer = match settings.directory.as_deref() {
    Some(dir) => match open_file_writer(dir, &settings) {
      Ok((writer, guard)) => {
        file_guard = Some(guard);
        Some(
          tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .with_target(true),
        )
      }
      Err(e) => {
        fallback_reason = Some(format!("{e:#}"));
        None
      }
    },
    None => None,
  };

  let raw_console = RawConsole::default();
  // Never end up with no output at all.
  let console_layer = (settings.console || file_layer.is_none()).then(|| {
    tracing_subscriber::fmt::layer()
      .with_ansi(false)
      .with_writer(ConsoleWriter::new(raw_console.clone()))
      .with_target(true)
  });

  if let Err(e) = tracing_subscriber::registry()
    .with(filter)
    .with(file_layer)
    .with(console_layer)
    .try_init()
  {
    eprintln!("sqlmon-agent: logging already initialized: {e}");
  }

  if let Some(reason) = fallback_reason.as_deref() {
    tracing::warn!(
      path = %config_path.display(),
      reason = %reason,
      "logging config unavailable; using console defaults"
    );
  }

  let watcher = {
    let mut active = settings.clone();
    ConfigWatcher::spawn(
      config_path.to_path_buf(),
      RELOAD_POLL_INTERVAL,
      move |path| apply_reload(path, &filter_handle, &mut active),
    )
  };
  let watcher = match watcher {
    Ok(w) => Some(w),
    Err(e) => {
      tracing::warn!(error = %e, "logging config watcher not started; hot reload disabled");
      None
    }
  };

  tracing::debug!(
    path = %config_path.display(),
    level = %settings.level,
    file = file_guard.is_some(),
    "logging initialized"
  );

  LoggingContext {
    config_path: config_path.to_path_buf(),
    fallback_reason,
    raw_console,
    _watcher: watcher,
    _file_guard: file_guard,
  }
}

fn parse_filter(level: &str) -> EnvFilter {
  EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn open_file_writer(
  dir: &Path,
  settings: &LogSettings,
) -> anyhow::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
  fs::create_dir_all(dir).with_context(|| format!("create log directory {}", dir.display()))?;
  cleanup_old_logs(dir, &settings.file_prefix, settings.retention_days)?;

  let appender = tracing_appender::rolling::daily(dir, &settings.file_prefix);
  Ok(tracing_appender::non_blocking(appender))
}

fn apply_reload(path: &Path, handle: &FilterHandle, active: &mut LogSettings) {
  let next = match LogSettings::load(path) {
    Ok(s) => s,
    Err(e) => {
      tracing::warn!(
        error = %format!("{e:#}"),
        "logging config reload failed; keeping current settings"
      );
      return;
    }
  };

  if next.level != active.level {
    match EnvFilter::try_new(&next.level) {
      Ok(filter) => match handle.reload(filter) {
        Ok(()) => {
          tracing::info!(from = %active.level, to = %next.level, "log level reloaded");
          active.level = next.level.clone();
        }
        Err(e) => tracing::warn!(error = %e, "failed to apply reloaded log level"),
      },
      Err(e) => tracing::warn!(
        level = %next.level,
        error = %e,
        "invalid log level in logging config; keeping current level"
      ),
    }
  }

  if !next.same_outputs(active) {
    tracing::warn!("logging output changes take effect after restart");
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp(Option<(SystemTime, u64)>);

impl FileStamp {
  fn read(path: &Path) -> Self {
    FileStamp(fs::metadata(path).ok().map(|md| {
      (
        md.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        md.len(),
      )
    }))
  }
}

/// Polls a file's modification stamp on a background thread and calls
/// `on_change` whenever it differs from the last observed one, including the
/// file appearing or disappearing.
pub struct ConfigWatcher {
  stop_tx: Option<mpsc::Sender<()>>,
  handle: Option<thread::JoinHandle<()>>,
}

impl ConfigWatcher {
  pub fn spawn<F>(path: PathBuf, interval: Duration, mut on_change: F) -> std::io::Result<Self>
  where
    F: FnMut(&Path) + Send + 'static,
  {
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let handle = thread::Builder::new()
      .name("logging-config-watch".to_string())
      .spawn(move || {
        let mut last = FileStamp::read(&path);
        loop {
          match stop_rx.recv_timeout(interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
          }

          let current = FileStamp::read(&path);
          if current != last {
            last = current;
            on_change(&path);
          }
        }
      })?;

    Ok(Self {
      stop_tx: Some(stop_tx),
      handle: Some(handle),
    })
  }
}

impl Drop for ConfigWatcher {
  fn drop(&mut self) {
    drop(self.stop_tx.take());
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}

fn cleanup_old_logs(log_dir: &Path, prefix: &str, retention_days: u64) -> anyhow::Result<()> {
  if retention_days == 0 {
    return Ok(());
  }

  let cutoff = SystemTime::now()
    .checked_sub(Duration::from_secs(retention_days.saturating_mul(24 * 60 * 60)))
    .unwrap_or(SystemTime::UNIX_EPOCH);

  let entries = match fs::read_dir(log_dir) {
    Ok(e) => e,
    Err(_) => return Ok(()),
  };

  for entry in entries.flatten() {
    let path = entry.path();
    if !is_agent_log_file(&path, prefix) {
      continue;
    }

    let modified = match entry.metadata().and_then(|md| md.modified()) {
      Ok(t) => t,
      Err(_) => continue,
    };

    if modified < cutoff {
      if let Err(e) = fs::remove_file(&path) {
        tracing::debug!(path = %path.display(), error = %e, "failed to remove old log file");
      }
    }
  }

  Ok(())
}

fn is_agent_log_file(path: &Path, prefix: &str) -> bool {
  let name = match path.file_name().and_then(|n| n.to_str()) {
    Some(n) => n,
    None => return false,
  };

  name == prefix || name.starts_with(&format!("{prefix}."))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn missing_file_fails_to_load() {
    let dir = tempfile::tempdir().unwrap();
    assert!(LogSettings::load(&dir.path().join("logging.toml")).is_err());
  }

  #[test]
  fn relative_directory_resolves_against_config_dir() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logging.toml");
    fs::write(&path, "level = \"debug\"\ndirectory = \"logs\"\n").unwrap();

    let settings = LogSettings::load(&path).unwrap();
    assert_eq!(settings.level, "debug");
    assert_eq!(settings.directory, Some(dir.path().join("logs")));
    assert!(settings.console);
    assert_eq!(settings.retention_days, 14);
  }

  #[test]
  fn reload_swaps_filter_level() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logging.toml");
    fs::write(&path, "level = \"debug\"\n").unwrap();

    let (_layer, handle) = reload::Layer::<EnvFilter, Registry>::new(EnvFilter::new("info"));
    let mut active = LogSettings::default();
    apply_reload(&path, &handle, &mut active);

    assert_eq!(active.level, "debug");
    let current = handle.with_current(|f| f.to_string()).unwrap();
    assert!(current.contains("debug"), "filter is {current}");
  }

  #[test]
  fn reload_keeps_level_when_file_is_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logging.toml");
    fs::write(&path, "level = [").unwrap();

    let (_layer, handle) = reload::Layer::<EnvFilter, Registry>::new(EnvFilter::new("info"));
    let mut active = LogSettings::default();
    apply_reload(&path, &handle, &mut active);

    assert_eq!(active.level, "info");
  }

  #[test]
  fn watcher_reports_file_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logging.toml");
    fs::write(&path, "level = \"info\"\n").unwrap();

    let (tx, rx) = mpsc::channel();
    let _watcher = ConfigWatcher::spawn(path.clone(), Duration::from_millis(20), move |p| {
      let _ = tx.send(p.to_path_buf());
    })
    .unwrap();

    thread::sleep(Duration::from_millis(50));
    fs::write(&path, "level = \"trace,hyper=info\"\n").unwrap();

    let changed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(changed, path);
  }

  #[test]
  fn cleanup_removes_only_expired_agent_logs() {
    let dir = tempfile::tempdir().unwrap();
    let old_log = dir.path().join("sqlmon-agent.log.2020-01-01");
    let fresh_log = dir.path().join("sqlmon-agent.log.2099-01-01");
    let unrelated = dir.path().join("other.log");
    for p in [&old_log, &fresh_log, &unrelated] {
      fs::write(p, "x").unwrap();
    }

    let long_ago = SystemTime::now() - Duration::from_secs(30 * 24 * 60 * 60);
    for p in [&old_log, &unrelated] {
      fs::File::options()
        .write(true)
        .open(p)
        .unwrap()
        .set_modified(long_ago)
        .unwrap();
    }

    cleanup_old_logs(dir.path(), "sqlmon-agent.log", 14).unwrap();

    assert!(!old_log.exists());
    assert!(fresh_log.exists());
    assert!(unrelated.exists());
  }

  #[test]
  fn raw_mode_writer_returns_carriage_before_each_newline() {
    let mut out: Vec<u8> = Vec::new();
    let mut writer = LineEndingWriter::new(&mut out, true);
    writer.write_all(b"cycle=2 servers=1\nsubmission skipped\npartial").unwrap();
    assert_eq!(out, b"cycle=2 servers=1\r\nsubmission skipped\r\npartial");
  }

  #[test]
  fn cooked_mode_writer_passes_bytes_through() {
    let mut out: Vec<u8> = Vec::new();
    LineEndingWriter::new(&mut out, false)
      .write_all(b"one\ntwo\n")
      .unwrap();
    assert_eq!(out, b"one\ntwo\n");
  }

  #[test]
  fn console_writer_follows_raw_mode_switch() {
    let raw = RawConsole::default();
    let make = ConsoleWriter::new(raw.clone());
    assert!(!make.make_writer().crlf);

    raw.set_active(true);
    assert!(make.make_writer().crlf);
  }

  #[test]
  fn missing_config_falls_back_to_console_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logging.toml");

    let context = initialize(&path);

    assert_eq!(context.config_path(), path.as_path());
    let reason = context.fallback_reason().unwrap();
    assert!(reason.contains("read logging config"), "reason was {reason}");
    assert!(!context.raw_console().is_active());
  }
}
