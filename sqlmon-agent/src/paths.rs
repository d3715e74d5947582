use std::path::{Path, PathBuf};

pub const SETTINGS_FILE_NAME: &str = "sqlmonitor.toml";
pub const LOGGING_CONFIG_FILE_NAME: &str = "logging.toml";

/// Directory holding the executable. Services start with an unrelated working
/// directory, so default files live next to the binary.
pub fn base_dir() -> PathBuf {
  std::env::current_exe()
    .ok()
    .and_then(|exe| exe.parent().map(Path::to_path_buf))
    .unwrap_or_else(|| PathBuf::from("."))
}

pub fn settings_path(base: &Path) -> PathBuf {
  base.join(SETTINGS_FILE_NAME)
}

pub fn logging_config_path(base: &Path) -> PathBuf {
  base.join(LOGGING_CONFIG_FILE_NAME)
}
