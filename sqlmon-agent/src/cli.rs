use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const USAGE_EXIT_CODE: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "sqlmon-agent", version, about = "SQL Server monitor agent")]
pub struct Args {
  /// Register the agent as a background service
  #[arg(long)]
  pub install: bool,

  /// Remove the background service registration
  #[arg(long)]
  pub uninstall: bool,

  /// Start the registered background service
  #[arg(long)]
  pub start: bool,

  /// Stop the running background service
  #[arg(long)]
  pub stop: bool,

  /// Install the service, or start it if it is already installed
  #[arg(long = "install-or-start")]
  pub install_or_start: bool,

  /// Collect metrics without submitting them
  #[arg(long = "collect-only")]
  pub collect_only: bool,

  /// Path to the settings file (defaults to sqlmonitor.toml next to the executable)
  #[arg(long, value_name = "PATH")]
  pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
  Install,
  Uninstall,
  Start,
  Stop,
  InstallOrStart,
  Run(RunOptions),
}

impl Intent {
  pub fn flag(&self) -> &'static str {
    match self {
      Intent::Install => "--install",
      Intent::Uninstall => "--uninstall",
      Intent::Start => "--start",
      Intent::Stop => "--stop",
      Intent::InstallOrStart => "--install-or-start",
      Intent::Run(_) => "run",
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
  pub config: Option<PathBuf>,
  pub collect_only: bool,
}

impl RunOptions {
  pub fn settings_path(&self, base: &Path) -> PathBuf {
    self
      .config
      .clone()
      .unwrap_or_else(|| crate::paths::settings_path(base))
  }
}

impl Args {
  /// Mode flags in resolution priority order. When several are given the
  /// first one wins; the rest are reported and ignored.
  fn requested_modes(&self) -> Vec<Intent> {
    [
      (self.uninstall, Intent::Uninstall),
      (self.install, Intent::Install),
      (self.start, Intent::Start),
      (self.stop, Intent::Stop),
      (self.install_or_start, Intent::InstallOrStart),
    ]
    .into_iter()
    .filter_map(|(set, intent)| set.then_some(intent))
    .collect()
  }

  pub fn into_intent(self) -> Intent {
    let mut modes = self.requested_modes();
    if modes.len() > 1 {
      let ignored: Vec<&str> = modes[1..].iter().map(Intent::flag).collect();
      tracing::warn!(
        selected = modes[0].flag(),
        ignored = ?ignored,
        "multiple mode flags given; only the highest-priority one is used"
      );
    }

    if modes.is_empty() {
      return Intent::Run(RunOptions {
        config: self.config,
        collect_only: self.collect_only,
      });
    }
    modes.swap_remove(0)
  }
}

pub fn resolve<I, T>(args: I) -> Result<Intent, clap::Error>
where
  I: IntoIterator<Item = T>,
  T: Into<OsString> + Clone,
{
  Args::try_parse_from(args).map(Args::into_intent)
}

/// Resolves the invocation, or prints help, version or usage and returns the
/// exit status the process should end with. Usage problems never reach the
/// top-level failure handler.
pub fn resolve_or_report(args: Vec<OsString>) -> Result<Intent, u8> {
  resolve(args).map_err(|e| match e.kind() {
    ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
      print!("{}", e.render());
      0
    }
    _ => {
      tracing::warn!(kind = ?e.kind(), "invalid command line");
      println!("{}", e.render());
      println!("{}", Args::command().render_help());
      USAGE_EXIT_CODE
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse(args: &[&str]) -> Result<Intent, clap::Error> {
    resolve(std::iter::once("sqlmon-agent").chain(args.iter().copied()))
  }

  #[test]
  fn no_flags_defaults_to_run() {
    assert_eq!(parse(&[]).unwrap(), Intent::Run(RunOptions::default()));
  }

  #[test]
  fn single_mode_flags_map_to_intents() {
    let cases = [
      ("--install", Intent::Install),
      ("--uninstall", Intent::Uninstall),
      ("--start", Intent::Start),
      ("--stop", Intent::Stop),
      ("--install-or-start", Intent::InstallOrStart),
    ];
    for (flag, expected) in cases {
      assert_eq!(parse(&[flag]).unwrap(), expected, "flag {flag}");
    }
  }

  #[test]
  fn run_options_carry_config_and_collect_only() {
    let intent = parse(&["--collect-only", "--config", "custom.toml"]).unwrap();
    assert_eq!(
      intent,
      Intent::Run(RunOptions {
        config: Some(PathBuf::from("custom.toml")),
        collect_only: true,
      })
    );
  }

  #[test]
  fn default_settings_path_is_next_to_base() {
    let base = Path::new("/opt/sqlmon");
    assert_eq!(
      RunOptions::default().settings_path(base),
      base.join("sqlmonitor.toml")
    );
  }

  #[test]
  fn unknown_flag_is_usage_error() {
    let err = parse(&["--bogus"]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownArgument);
  }

  #[test]
  fn config_without_value_is_usage_error() {
    assert!(parse(&["--config"]).is_err());
  }

  // Ambiguous legacy behaviour: conflicting mode flags are not a usage error,
  // the first one in priority order wins and the rest are only logged.
  #[test]
  fn multiple_mode_flags_resolve_by_legacy_priority() {
    assert_eq!(
      parse(&["--install", "--uninstall"]).unwrap(),
      Intent::Uninstall
    );
    assert_eq!(
      parse(&["--install-or-start", "--stop", "--start"]).unwrap(),
      Intent::Start
    );
    assert_eq!(
      parse(&["--install-or-start", "--collect-only"]).unwrap(),
      Intent::InstallOrStart
    );
  }

  #[test]
  fn usage_problems_return_exit_status_instead_of_exiting() {
    let args = |a: &[&str]| a.iter().map(OsString::from).collect::<Vec<_>>();

    assert_eq!(
      resolve_or_report(args(&["sqlmon-agent", "--bogus"])),
      Err(USAGE_EXIT_CODE)
    );
    assert_eq!(resolve_or_report(args(&["sqlmon-agent", "--help"])), Err(0));
    assert_eq!(
      resolve_or_report(args(&["sqlmon-agent", "--stop"])),
      Ok(Intent::Stop)
    );
  }
}
