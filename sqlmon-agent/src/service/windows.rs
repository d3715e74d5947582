use super::{ServiceAdminError, ServiceDefinition, ServiceManager};
use std::ffi::{OsStr, OsString};
use std::thread;
use std::time::{Duration, Instant};
use windows_service::service::{
  Service, ServiceAccess, ServiceErrorControl, ServiceInfo, ServiceStartType, ServiceState,
  ServiceType,
};
use windows_service::service_manager::{ServiceManager as Scm, ServiceManagerAccess};

const ERROR_SERVICE_ALREADY_RUNNING: i32 = 1056;
const ERROR_SERVICE_DOES_NOT_EXIST: i32 = 1060;
const ERROR_SERVICE_NOT_ACTIVE: i32 = 1062;
const ERROR_SERVICE_EXISTS: i32 = 1073;

const STATE_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
const STATE_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct ScmManager;

impl ScmManager {
  pub fn new() -> Self {
    Self
  }

  fn connect(
    &self,
    operation: &'static str,
    name: &str,
    access: ServiceManagerAccess,
  ) -> Result<Scm, ServiceAdminError> {
    Scm::local_computer(None::<&str>, access).map_err(|e| platform(operation, name, e))
  }

  fn open(
    &self,
    operation: &'static str,
    name: &str,
    access: ServiceAccess,
    missing: impl FnOnce() -> ServiceAdminError,
  ) -> Result<Service, ServiceAdminError> {
    let manager = self.connect(operation, name, ServiceManagerAccess::CONNECT)?;
    manager.open_service(name, access).map_err(|e| {
      if win32_code(&e) == Some(ERROR_SERVICE_DOES_NOT_EXIST) {
        missing()
      } else {
        platform(operation, name, e)
      }
    })
  }
}

impl Default for ScmManager {
  fn default() -> Self {
    Self::new()
  }
}

fn win32_code(e: &windows_service::Error) -> Option<i32> {
  match e {
    windows_service::Error::Winapi(io) => io.raw_os_error(),
    _ => None,
  }
}

fn platform(operation: &'static str, name: &str, e: windows_service::Error) -> ServiceAdminError {
  ServiceAdminError::Platform {
    operation,
    name: name.to_string(),
    source: Box::new(e),
  }
}

fn state_name(state: ServiceState) -> &'static str {
  match state {
    ServiceState::Running => "running",
    ServiceState::Stopped => "stopped",
    _ => "pending",
  }
}

fn wait_for_state(
  service: &Service,
  name: &str,
  target: ServiceState,
) -> Result<(), ServiceAdminError> {
  let deadline = Instant::now() + STATE_WAIT_TIMEOUT;
  loop {
    let status = service
      .query_status()
      .map_err(|e| platform("query status", name, e))?;
    if status.current_state == target {
      return Ok(());
    }
    if Instant::now() >= deadline {
      return Err(ServiceAdminError::Timeout {
        name: name.to_string(),
        state: state_name(target),
      });
    }
    thread::sleep(STATE_POLL_INTERVAL);
  }
}

fn request_stop(service: &Service, name: &str) -> Result<(), ServiceAdminError> {
  let status = service
    .query_status()
    .map_err(|e| platform("query status", name, e))?;
  if status.current_state == ServiceState::Stopped {
    tracing::debug!(service = name, "service already stopped");
    return Ok(());
  }

  match service.stop() {
    Ok(_) => {}
    Err(e) if win32_code(&e) == Some(ERROR_SERVICE_NOT_ACTIVE) => return Ok(()),
    Err(e) => return Err(platform("stop", name, e)),
  }
  wait_for_state(service, name, ServiceState::Stopped)
}

impl ServiceManager for ScmManager {
  fn register(&self, definition: &ServiceDefinition) -> Result<(), ServiceAdminError> {
    let name = definition.name.as_str();
    let manager = self.connect(
      "register",
      name,
      ServiceManagerAccess::CONNECT | ServiceManagerAccess::CREATE_SERVICE,
    )?;

    let info = ServiceInfo {
      name: OsString::from(&definition.name),
      display_name: OsString::from(&definition.display_name),
      service_type: ServiceType::OWN_PROCESS,
      start_type: ServiceStartType::AutoStart,
      error_control: ServiceErrorControl::Normal,
      executable_path: definition.executable.clone(),
      launch_arguments: definition.arguments.clone(),
      dependencies: vec![],
      account_name: None,
      account_password: None,
    };

    let service = manager
      .create_service(&info, ServiceAccess::CHANGE_CONFIG)
      .map_err(|e| {
        if win32_code(&e) == Some(ERROR_SERVICE_EXISTS) {
          ServiceAdminError::AlreadyRegistered {
            name: name.to_string(),
          }
        } else {
          platform("register", name, e)
        }
      })?;

    if let Err(e) = service.set_description(&definition.description) {
      tracing::warn!(service = name, error = %e, "failed to set service description");
    }
    Ok(())
  }

  fn unregister(&self, name: &str) -> Result<(), ServiceAdminError> {
    let service = self.open(
      "unregister",
      name,
      ServiceAccess::QUERY_STATUS | ServiceAccess::STOP | ServiceAccess::DELETE,
      || ServiceAdminError::NotFound {
        name: name.to_string(),
      },
    )?;

    request_stop(&service, name)?;
    service.delete().map_err(|e| platform("unregister", name, e))
  }

  fn start_registered(&self, name: &str) -> Result<(), ServiceAdminError> {
    let service = self.open(
      "start",
      name,
      ServiceAccess::QUERY_STATUS | ServiceAccess::START,
      || ServiceAdminError::NotInstalled {
        name: name.to_string(),
      },
    )?;

    match service.start::<&OsStr>(&[]) {
      Ok(()) => {}
      Err(e) if win32_code(&e) == Some(ERROR_SERVICE_ALREADY_RUNNING) => {
        tracing::debug!(service = name, "service already running");
        return Ok(());
      }
      Err(e) => return Err(platform("start", name, e)),
    }
    wait_for_state(&service, name, ServiceState::Running)
  }

  fn stop_registered(&self, name: &str) -> Result<(), ServiceAdminError> {
    let service = self.open(
      "stop",
      name,
      ServiceAccess::QUERY_STATUS | ServiceAccess::STOP,
      || ServiceAdminError::NotInstalled {
        name: name.to_string(),
      },
    )?;
    request_stop(&service, name)
  }
}
