use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("settings file not found: {}", path.display())]
  NotFound { path: PathBuf },

  #[error("failed to read settings file {}", path.display())]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("settings file {} is not valid TOML", path.display())]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },

  #[error("invalid settings in {}: {reason}", path.display())]
  Invalid { path: PathBuf, reason: String },
}

#[derive(Debug, Clone)]
pub struct Settings {
  pub license_key: Option<String>,
  pub poll_interval_seconds: u64,
  pub servers: Vec<SqlServerEndpoint>,

  /// Set by the caller after loading; never read from the file.
  pub collect_only: bool,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      license_key: None,
      poll_interval_seconds: default_poll_interval_seconds(),
      servers: Vec::new(),
      collect_only: false,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlServerEndpoint {
  pub name: String,
  pub connection_string: String,

  #[serde(default)]
  pub include_system_databases: bool,
}

fn default_poll_interval_seconds() -> u64 {
  60
}

#[derive(Debug, Clone, Deserialize)]
struct SettingsFile {
  #[serde(default)]
  license_key: Option<String>,

  #[serde(default)]
  poll_interval_seconds: Option<u64>,

  #[serde(default)]
  servers: Vec<SqlServerEndpoint>,
}

impl SettingsFile {
  fn normalize(self) -> Result<Settings, String> {
    let mut settings = Settings::default();

    settings.license_key = self
      .license_key
      .map(|k| k.trim().to_string())
      .filter(|k| !k.is_empty());

    if let Some(interval) = self.poll_interval_seconds {
      if interval == 0 {
        return Err("poll_interval_seconds must be > 0".to_string());
      }
      settings.poll_interval_seconds = interval;
    }

    let mut seen = HashSet::new();
    for server in &self.servers {
      if server.name.trim().is_empty() {
        return Err("server name must not be empty".to_string());
      }
      if !seen.insert(server.name.as_str()) {
        return Err(format!("duplicate server name: {}", server.name));
      }
    }
    settings.servers = self.servers;

    Ok(settings)
  }
}

pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
  let raw = match fs::read_to_string(path) {
    Ok(raw) => raw,
    Err(e) if e.kind() == io::ErrorKind::NotFound => {
      return Err(ConfigError::NotFound {
        path: path.to_path_buf(),
      })
    }
    Err(source) => {
      return Err(ConfigError::Read {
        path: path.to_path_buf(),
        source,
      })
    }
  };

  let file = toml::from_str::<SettingsFile>(&raw).map_err(|source| ConfigError::Parse {
    path: path.to_path_buf(),
    source,
  })?;

  let settings = file.normalize().map_err(|reason| ConfigError::Invalid {
    path: path.to_path_buf(),
    reason,
  })?;

  tracing::debug!(
    path = %path.display(),
    servers = settings.servers.len(),
    poll_interval_seconds = settings.poll_interval_seconds,
    "settings loaded"
  );
  Ok(settings)
}
