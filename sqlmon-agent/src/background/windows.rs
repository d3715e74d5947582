use super::{serve, ServicePhase, StatusSink};
use crate::service::SERVICE_NAME;
use anyhow::Context;
use sqlmon_monitor::{Monitor, Settings};
use std::ffi::OsString;
use std::sync::{mpsc, Mutex};
use std::time::Duration;
use windows_service::define_windows_service;
use windows_service::service::{
  ServiceControl, ServiceControlAccept, ServiceExitCode, ServiceState, ServiceStatus, ServiceType,
};
use windows_service::service_control_handler::{
  self, ServiceControlHandlerResult, ServiceStatusHandle,
};
use windows_service::service_dispatcher;

const PENDING_WAIT_HINT: Duration = Duration::from_secs(10);

// The dispatcher callback has a fixed signature; settings reach it through
// this one-shot slot.
static PENDING_SETTINGS: Mutex<Option<Settings>> = Mutex::new(None);

define_windows_service!(ffi_service_main, service_main);

pub fn run(settings: Settings) -> anyhow::Result<()> {
  *PENDING_SETTINGS
    .lock()
    .map_err(|_| anyhow::anyhow!("service settings slot poisoned"))? = Some(settings);

  // Blocks until the service manager tells the service to stop.
  service_dispatcher::start(SERVICE_NAME, ffi_service_main)
    .context("start Windows service dispatcher")?;
  Ok(())
}

fn service_main(_arguments: Vec<OsString>) {
  if let Err(e) = run_service_inner() {
    tracing::error!(error = %format!("{e:#}"), "service exited with error");
  }
}

fn run_service_inner() -> anyhow::Result<()> {
  let settings = PENDING_SETTINGS
    .lock()
    .ok()
    .and_then(|mut slot| slot.take())
    .ok_or_else(|| anyhow::anyhow!("service started without settings"))?;

  let (stop_tx, stop_rx) = mpsc::channel::<()>();
  let status_handle = service_control_handler::register(SERVICE_NAME, move |control_event| {
    match control_event {
      ServiceControl::Stop | ServiceControl::Shutdown => {
        let _ = stop_tx.send(());
        ServiceControlHandlerResult::NoError
      }
      ServiceControl::Interrogate => ServiceControlHandlerResult::NoError,
      _ => ServiceControlHandlerResult::NotImplemented,
    }
  })
  .context("register service control handler")?;

  let mut status = ScmStatus {
    handle: status_handle,
    checkpoint: 0,
  };
  serve(Monitor::new(settings), stop_rx, &mut status)
}

struct ScmStatus {
  handle: ServiceStatusHandle,
  checkpoint: u32,
}

impl StatusSink for ScmStatus {
  fn report(&mut self, phase: ServicePhase, exit_code: u32) -> anyhow::Result<()> {
    let (state, pending) = match phase {
      ServicePhase::StartPending => (ServiceState::StartPending, true),
      ServicePhase::Running => (ServiceState::Running, false),
      ServicePhase::StopPending => (ServiceState::StopPending, true),
      ServicePhase::Stopped => (ServiceState::Stopped, false),
    };

    self.checkpoint = if pending { self.checkpoint + 1 } else { 0 };

    let status = ServiceStatus {
      service_type: ServiceType::OWN_PROCESS,
      current_state: state,
      controls_accepted: match state {
        ServiceState::Running => ServiceControlAccept::STOP | ServiceControlAccept::SHUTDOWN,
        _ => ServiceControlAccept::empty(),
      },
      exit_code: match exit_code {
        0 => ServiceExitCode::Win32(0),
        code => ServiceExitCode::ServiceSpecific(code),
      },
      checkpoint: self.checkpoint,
      wait_hint: if pending {
        PENDING_WAIT_HINT
      } else {
        Duration::default()
      },
      process_id: None,
    };
    self
      .handle
      .set_service_status(status)
      .with_context(|| format!("report service state {state:?}"))?;
    Ok(())
  }
}
