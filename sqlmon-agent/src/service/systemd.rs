use super::{ServiceAdminError, ServiceDefinition, ServiceManager};
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

pub const SYSTEM_UNIT_DIR: &str = "/etc/systemd/system";

#[derive(Debug, thiserror::Error)]
#[error("systemctl {args} failed: {detail}")]
pub struct SystemctlError {
  args: String,
  detail: String,
}

pub trait Systemctl {
  fn run(&self, args: &[&str]) -> Result<(), SystemctlError>;
}

pub struct SystemctlCommand;

impl Systemctl for SystemctlCommand {
  fn run(&self, args: &[&str]) -> Result<(), SystemctlError> {
    let joined = args.join(" ");
    let output = Command::new("systemctl")
      .args(args)
      .output()
      .map_err(|e| SystemctlError {
        args: joined.clone(),
        detail: e.to_string(),
      })?;

    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr);
      return Err(SystemctlError {
        args: joined,
        detail: format!("{} ({})", stderr.trim(), output.status),
      });
    }
    Ok(())
  }
}

pub struct SystemdManager<C = SystemctlCommand> {
  unit_dir: PathBuf,
  systemctl: C,
}

impl SystemdManager<SystemctlCommand> {
  pub fn system() -> Self {
    Self::new(PathBuf::from(SYSTEM_UNIT_DIR), SystemctlCommand)
  }
}

impl<C: Systemctl> SystemdManager<C> {
  pub fn new(unit_dir: PathBuf, systemctl: C) -> Self {
    Self {
      unit_dir,
      systemctl,
    }
  }

  fn unit_name(name: &str) -> String {
    format!("{name}.service")
  }

  fn unit_path(&self, name: &str) -> PathBuf {
    self.unit_dir.join(Self::unit_name(name))
  }

  fn systemctl(
    &self,
    operation: &'static str,
    name: &str,
    args: &[&str],
  ) -> Result<(), ServiceAdminError> {
    self
      .systemctl
      .run(args)
      .map_err(|e| platform(operation, name, e))
  }
}

fn platform(
  operation: &'static str,
  name: &str,
  source: impl std::error::Error + Send + Sync + 'static,
) -> ServiceAdminError {
  ServiceAdminError::Platform {
    operation,
    name: name.to_string(),
    source: Box::new(source),
  }
}

impl<C: Systemctl> ServiceManager for SystemdManager<C> {
  fn register(&self, definition: &ServiceDefinition) -> Result<(), ServiceAdminError> {
    let name = definition.name.as_str();
    let path = self.unit_path(name);
    if path.exists() {
      return Err(ServiceAdminError::AlreadyRegistered {
        name: name.to_string(),
      });
    }

    fs::create_dir_all(&self.unit_dir).map_err(|e| platform("register", name, e))?;
    fs::write(&path, unit_file(definition)).map_err(|e| platform("register", name, e))?;
    tracing::debug!(unit = %path.display(), "unit file written");

    let unit = Self::unit_name(name);
    self.systemctl("register", name, &["daemon-reload"])?;
    self.systemctl("register", name, &["enable", &unit])
  }

  fn unregister(&self, name: &str) -> Result<(), ServiceAdminError> {
    let path = self.unit_path(name);
    if !path.exists() {
      return Err(ServiceAdminError::NotFound {
        name: name.to_string(),
      });
    }

    let unit = Self::unit_name(name);
    self.systemctl("unregister", name, &["stop", &unit])?;
    self.systemctl("unregister", name, &["disable", &unit])?;
    remove_unit(&path).map_err(|e| platform("unregister", name, e))?;
    self.systemctl("unregister", name, &["daemon-reload"])
  }

  fn start_registered(&self, name: &str) -> Result<(), ServiceAdminError> {
    if !self.unit_path(name).exists() {
      return Err(ServiceAdminError::NotInstalled {
        name: name.to_string(),
      });
    }
    // `systemctl start` blocks until the unit is up and is a no-op when it
    // already is.
    self.systemctl("start", name, &["start", &Self::unit_name(name)])
  }

  fn stop_registered(&self, name: &str) -> Result<(), ServiceAdminError> {
    if !self.unit_path(name).exists() {
      return Err(ServiceAdminError::NotInstalled {
        name: name.to_string(),
      });
    }
    self.systemctl("stop", name, &["stop", &Self::unit_name(name)])
  }
}

fn remove_unit(path: &Path) -> io::Result<()> {
  match fs::remove_file(path) {
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    other => other,
  }
}

pub fn unit_file(definition: &ServiceDefinition) -> String {
  let mut exec = quote_arg(definition.executable.as_os_str());
  for arg in &definition.arguments {
    exec.push(' ');
    exec.push_str(&quote_arg(arg));
  }

  format!(
    "[Unit]\n\
     Description={description}\n\
     After=network-online.target\n\
     Wants=network-online.target\n\
     \n\
     [Service]\n\
     Type=simple\n\
     ExecStart={exec}\n\
     Restart=on-failure\n\
     RestartSec=10\n\
     \n\
     [Install]\n\
     WantedBy=multi-user.target\n",
    description = definition.display_name,
  )
}

fn quote_arg(arg: &OsStr) -> String {
  let arg = arg.to_string_lossy();
  if !arg.is_empty() && !arg.contains(|c: char| c.is_whitespace() || c == '"' || c == '\\') {
    return arg.into_owned();
  }
  let escaped = arg.replace('\\', "\\\\").replace('"', "\\\"");
  format!("\"{escaped}\"")
}
