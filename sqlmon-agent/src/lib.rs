pub mod background;
pub mod cli;
pub mod console;
pub mod logging;
pub mod paths;
pub mod service;

use anyhow::Context;
use cli::{Intent, RunOptions};
use logging::RawConsole;
use service::{ServiceAdminError, ServiceController, ServiceDefinition, ServiceManager};
use sqlmon_monitor::{Engine, Monitor, Settings};
use std::ffi::OsString;
use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;

/// Exit status for any failure that reaches the top level.
pub const FAILURE_EXIT_CODE: u8 = 255;

pub fn run(args: Vec<OsString>) -> ExitCode {
  let base = paths::base_dir();
  let logging = logging::initialize(&paths::logging_config_path(&base));

  let intent = match cli::resolve_or_report(args) {
    Ok(intent) => intent,
    Err(code) => {
      drop(logging);
      return ExitCode::from(code);
    }
  };
  let interactive = console::is_interactive();
  tracing::info!(
    version = env!("CARGO_PKG_VERSION"),
    intent = intent.flag(),
    interactive,
    logging_config = %logging.config_path().display(),
    "sqlmon-agent starting"
  );

  let manager = service::host_manager();
  let raw = logging.raw_console().clone();
  let result = dispatch(intent, &base, interactive, manager.as_ref(), &raw);
  let code = exit_status(result, interactive, &raw);

  drop(logging);
  ExitCode::from(code)
}

fn dispatch(
  intent: Intent,
  base: &Path,
  interactive: bool,
  manager: &dyn ServiceManager,
  raw: &RawConsole,
) -> anyhow::Result<()> {
  match intent {
    Intent::Install => administer(manager, |c| c.install()),
    Intent::Uninstall => administer(manager, |c| c.uninstall()),
    Intent::Start => administer(manager, |c| c.start()),
    Intent::Stop => administer(manager, |c| c.stop()),
    Intent::InstallOrStart => administer(manager, |c| c.install_or_start()),
    Intent::Run(options) => {
      if interactive {
        println!("Starting Interactive mode");
        let stop = console::install_interrupt_guard()?;
        run_foreground(
          &options,
          base,
          Monitor::new,
          &mut console::TerminalKeys::new(stop, raw.clone()),
          &mut io::stdout(),
        )
      } else {
        let settings = resolve_settings(&options, base)?;
        background::run(settings)
      }
    }
  }
}

fn administer(
  manager: &dyn ServiceManager,
  operation: impl FnOnce(&ServiceController<'_>) -> Result<(), ServiceAdminError>,
) -> anyhow::Result<()> {
  let definition = ServiceDefinition::for_current_exe()?;
  let controller = ServiceController::new(manager, definition);
  operation(&controller)?;
  Ok(())
}

/// Loads the settings named by `options` and applies the command-line
/// overrides.
pub fn resolve_settings(options: &RunOptions, base: &Path) -> anyhow::Result<Settings> {
  let path = options.settings_path(base);
  let mut settings = sqlmon_monitor::load_settings(&path).context("load settings")?;
  settings.collect_only = options.collect_only;
  Ok(settings)
}

pub fn run_foreground<E, F, K, W>(
  options: &RunOptions,
  base: &Path,
  build: F,
  keys: &mut K,
  out: &mut W,
) -> anyhow::Result<()>
where
  E: Engine,
  F: FnOnce(Settings) -> E,
  K: console::KeySource + ?Sized,
  W: Write + ?Sized,
{
  let settings = resolve_settings(options, base)?;
  console::run_interactive(build(settings), keys, out)
}

fn exit_status(result: anyhow::Result<()>, interactive: bool, raw: &RawConsole) -> u8 {
  match result {
    Ok(()) => 0,
    Err(e) => {
      report_failure(&e, interactive, raw);
      FAILURE_EXIT_CODE
    }
  }
}

fn report_failure(err: &anyhow::Error, interactive: bool, raw: &RawConsole) {
  tracing::error!(error = %format!("{err:#}"), "sqlmon-agent failed");
  println!("{err:#}");

  if interactive {
    let mut keys = console::TerminalKeys::new(console::StopRequest::default(), raw.clone());
    console::pause_for_acknowledgment(&mut keys, &mut io::stdout());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::console::fake::{EngineCall, FakeEngine, ScriptedKeys};
  use crate::console::ConsoleInput;
  use std::cell::Cell;
  use std::fs;

  const VALID_SETTINGS: &str = r#"
[[servers]]
name = "primary"
connection_string = "Server=.;Database=master;Trusted_Connection=True;"
"#;

  #[test]
  fn missing_config_never_starts_engine() {
    let dir = tempfile::tempdir().unwrap();
    let options = RunOptions {
      config: Some(dir.path().join("missing.cfg")),
      collect_only: false,
    };
    let built = Cell::new(false);
    let mut keys = ScriptedKeys::new([ConsoleInput::Key('q')]);

    let err = run_foreground(
      &options,
      dir.path(),
      |_| {
        built.set(true);
        FakeEngine::default()
      },
      &mut keys,
      &mut Vec::<u8>::new(),
    )
    .unwrap_err();

    assert!(matches!(
      err.downcast_ref::<sqlmon_monitor::ConfigError>(),
      Some(sqlmon_monitor::ConfigError::NotFound { .. })
    ));
    assert!(!built.get());
    assert_eq!(keys.reads, 0);
  }

  #[test]
  fn collect_only_run_flags_settings_and_stops_on_q() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sqlmonitor.toml");
    fs::write(&path, VALID_SETTINGS).unwrap();

    let options = RunOptions {
      config: None,
      collect_only: true,
    };
    let engine = FakeEngine::default();
    let collect_only = Cell::new(false);
    let mut keys = ScriptedKeys::new([ConsoleInput::Key('z'), ConsoleInput::Key('q')]);

    run_foreground(
      &options,
      dir.path(),
      |settings| {
        collect_only.set(settings.collect_only);
        engine.clone()
      },
      &mut keys,
      &mut Vec::<u8>::new(),
    )
    .unwrap();

    assert!(collect_only.get());
    assert_eq!(engine.calls(), vec![EngineCall::Start, EngineCall::Stop]);
  }

  #[test]
  fn real_monitor_runs_and_stops_in_foreground() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("custom.toml");
    fs::write(&path, VALID_SETTINGS).unwrap();

    let options = RunOptions {
      config: Some(path),
      collect_only: true,
    };
    let mut keys = ScriptedKeys::new([ConsoleInput::Key('Q')]);
    let mut out: Vec<u8> = Vec::new();

    run_foreground(&options, dir.path(), Monitor::new, &mut keys, &mut out).unwrap();
    let printed = String::from_utf8(out).unwrap();
    assert!(printed.contains("Starting Server"));
    assert!(printed.contains("Stopping..."));
  }

  #[test]
  fn uninstall_without_service_exits_with_failure_status() {
    let dir = tempfile::tempdir().unwrap();
    let manager = service::fake::FakeManager::default();
    let raw = RawConsole::default();

    let result = dispatch(Intent::Uninstall, dir.path(), false, &manager, &raw);
    assert!(matches!(
      result.as_ref().unwrap_err().downcast_ref::<ServiceAdminError>(),
      Some(ServiceAdminError::NotFound { .. })
    ));
    assert_eq!(exit_status(result, false, &raw), FAILURE_EXIT_CODE);
  }

  #[test]
  fn install_through_dispatch_exits_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let manager = service::fake::FakeManager::default();
    let raw = RawConsole::default();

    let result = dispatch(Intent::InstallOrStart, dir.path(), false, &manager, &raw);
    assert_eq!(exit_status(result, false, &raw), 0);
    assert_eq!(
      manager.calls(),
      vec![service::fake::Call::Register, service::fake::Call::Start]
    );
  }
}
