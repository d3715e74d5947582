//! Registration and start/stop of the agent as an OS-managed service.
//!
//! The controller only manages registration and running state with the host
//! service manager; it never runs the monitor itself.

#[cfg(target_os = "linux")]
pub mod systemd;
#[cfg(windows)]
pub mod windows;

use anyhow::Context;
use std::ffi::OsString;
use std::path::PathBuf;

pub const SERVICE_NAME: &str = "SqlMonitorAgent";
pub const SERVICE_DISPLAY_NAME: &str = "SQL Server Monitor Agent";
pub const SERVICE_DESCRIPTION: &str =
  "Collects SQL Server metrics and reports them to the telemetry backend.";

#[derive(Debug, thiserror::Error)]
pub enum ServiceAdminError {
  #[error("service {name} is already registered")]
  AlreadyRegistered { name: String },

  #[error("service {name} is not registered")]
  NotFound { name: String },

  #[error("service {name} is not installed; run with --install first")]
  NotInstalled { name: String },

  #[error("timed out waiting for service {name} to become {state}")]
  Timeout { name: String, state: &'static str },

  #[error("service management is not supported on this platform")]
  Unsupported,

  #[error("{operation} failed for service {name}")]
  Platform {
    operation: &'static str,
    name: String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
  pub name: String,
  pub display_name: String,
  pub description: String,
  pub executable: PathBuf,
  pub arguments: Vec<OsString>,
}

impl ServiceDefinition {
  pub fn for_current_exe() -> anyhow::Result<Self> {
    let executable = std::env::current_exe().context("resolve current executable")?;
    Ok(Self {
      name: SERVICE_NAME.to_string(),
      display_name: SERVICE_DISPLAY_NAME.to_string(),
      description: SERVICE_DESCRIPTION.to_string(),
      executable,
      arguments: Vec::new(),
    })
  }
}

/// Host service-manager operations. Each call returns once the change is
/// recorded by the host or has failed.
pub trait ServiceManager {
  fn register(&self, definition: &ServiceDefinition) -> Result<(), ServiceAdminError>;
  fn unregister(&self, name: &str) -> Result<(), ServiceAdminError>;
  fn start_registered(&self, name: &str) -> Result<(), ServiceAdminError>;

  /// Stopping a service that is not running succeeds.
  fn stop_registered(&self, name: &str) -> Result<(), ServiceAdminError>;
}

pub struct UnsupportedManager;

impl ServiceManager for UnsupportedManager {
  fn register(&self, _definition: &ServiceDefinition) -> Result<(), ServiceAdminError> {
    Err(ServiceAdminError::Unsupported)
  }

  fn unregister(&self, _name: &str) -> Result<(), ServiceAdminError> {
    Err(ServiceAdminError::Unsupported)
  }

  fn start_registered(&self, _name: &str) -> Result<(), ServiceAdminError> {
    Err(ServiceAdminError::Unsupported)
  }

  fn stop_registered(&self, _name: &str) -> Result<(), ServiceAdminError> {
    Err(ServiceAdminError::Unsupported)
  }
}

#[cfg(windows)]
pub fn host_manager() -> Box<dyn ServiceManager> {
  Box::new(windows::ScmManager::new())
}

#[cfg(target_os = "linux")]
pub fn host_manager() -> Box<dyn ServiceManager> {
  Box::new(systemd::SystemdManager::system())
}

#[cfg(not(any(windows, target_os = "linux")))]
pub fn host_manager() -> Box<dyn ServiceManager> {
  Box::new(UnsupportedManager)
}

pub struct ServiceController<'a> {
  manager: &'a dyn ServiceManager,
  definition: ServiceDefinition,
}

impl<'a> ServiceController<'a> {
  pub fn new(manager: &'a dyn ServiceManager, definition: ServiceDefinition) -> Self {
    Self {
      manager,
      definition,
    }
  }

  fn name(&self) -> &str {
    &self.definition.name
  }

  pub fn install(&self) -> Result<(), ServiceAdminError> {
    self.manager.register(&self.definition)?;
    tracing::info!(
      service = self.name(),
      executable = %self.definition.executable.display(),
      "service installed"
    );
    println!("Service {} installed.", self.name());
    Ok(())
  }

  pub fn uninstall(&self) -> Result<(), ServiceAdminError> {
    self.manager.unregister(self.name())?;
    tracing::info!(service = self.name(), "service uninstalled");
    println!("Service {} uninstalled.", self.name());
    Ok(())
  }

  pub fn start(&self) -> Result<(), ServiceAdminError> {
    self.manager.start_registered(self.name())?;
    tracing::info!(service = self.name(), "service started");
    println!("Service {} started.", self.name());
    Ok(())
  }

  pub fn stop(&self) -> Result<(), ServiceAdminError> {
    self.manager.stop_registered(self.name())?;
    tracing::info!(service = self.name(), "service stopped");
    println!("Service {} stopped.", self.name());
    Ok(())
  }

  /// Installs the service and starts it. An existing registration is not an
  /// error here: the existing service is started instead. Any other install
  /// failure is returned without attempting a start.
  pub fn install_or_start(&self) -> Result<(), ServiceAdminError> {
    match self.install() {
      Ok(()) => {}
      Err(ServiceAdminError::AlreadyRegistered { .. }) => {
        tracing::info!(service = self.name(), "service already installed; starting it");
      }
      Err(e) => return Err(e),
    }
    self.start()
  }
}
