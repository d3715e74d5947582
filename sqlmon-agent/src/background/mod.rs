#[cfg(windows)]
mod windows;

#[cfg(not(windows))]
use anyhow::Context;
use sqlmon_monitor::Engine;
use std::sync::mpsc;

/// Service-specific exit code reported when the monitor fails to start.
pub const ENGINE_START_FAILED_EXIT_CODE: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePhase {
  StartPending,
  Running,
  StopPending,
  Stopped,
}

/// Where lifecycle phases are reported: the host service manager, or the log.
pub trait StatusSink {
  fn report(&mut self, phase: ServicePhase, exit_code: u32) -> anyhow::Result<()>;
}

/// Runs `engine` as a service body: starts it, blocks until a stop request
/// arrives on `stop_rx` (or every sender is gone), then stops it.
pub fn serve<E, S>(mut engine: E, stop_rx: mpsc::Receiver<()>, status: &mut S) -> anyhow::Result<()>
where
  E: Engine,
  S: StatusSink + ?Sized,
{
  status.report(ServicePhase::StartPending, 0)?;

  if let Err(e) = engine.start() {
    tracing::error!(error = %e, "monitor failed to start");
    if let Err(report_err) = status.report(ServicePhase::Stopped, ENGINE_START_FAILED_EXIT_CODE) {
      tracing::warn!(error = %report_err, "failed to report stopped status");
    }
    return Err(anyhow::Error::new(e).context("start monitor"));
  }

  if let Err(e) = status.report(ServicePhase::Running, 0) {
    engine.stop();
    let _ = status.report(ServicePhase::Stopped, 0);
    return Err(e);
  }
  tracing::info!("service running");

  // A dropped sender means nobody can ask us to stop anymore; treat it as a
  // stop request.
  let _ = stop_rx.recv();
  tracing::info!("service stop requested");

  let pending = status.report(ServicePhase::StopPending, 0);
  engine.stop();
  let stopped = status.report(ServicePhase::Stopped, 0);
  tracing::info!("service stopped");
  pending.and(stopped)
}

#[cfg(windows)]
pub fn run(settings: sqlmon_monitor::Settings) -> anyhow::Result<()> {
  windows::run(settings)
}

/// Without a Windows service dispatcher the host (e.g. systemd) controls the
/// process through signals.
#[cfg(not(windows))]
pub fn run(settings: sqlmon_monitor::Settings) -> anyhow::Result<()> {
  let (stop_tx, stop_rx) = mpsc::channel::<()>();
  ctrlc::set_handler(move || {
    let _ = stop_tx.send(());
  })
  .context("install termination handler")?;

  serve(
    sqlmon_monitor::Monitor::new(settings),
    stop_rx,
    &mut LoggedStatus,
  )
}

#[cfg(not(windows))]
struct LoggedStatus;

#[cfg(not(windows))]
impl StatusSink for LoggedStatus {
  fn report(&mut self, phase: ServicePhase, exit_code: u32) -> anyhow::Result<()> {
    tracing::info!(phase = ?phase, exit_code, "service status");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::console::fake::{EngineCall, FakeEngine};
  use std::thread;
  use std::time::Duration;

  #[derive(Default)]
  struct RecordingSink {
    phases: Vec<(ServicePhase, u32)>,
  }

  impl StatusSink for RecordingSink {
    fn report(&mut self, phase: ServicePhase, exit_code: u32) -> anyhow::Result<()> {
      self.phases.push((phase, exit_code));
      Ok(())
    }
  }

  #[test]
  fn stop_request_stops_engine_after_running() {
    let engine = FakeEngine::default();
    let (stop_tx, stop_rx) = mpsc::channel();
    let mut sink = RecordingSink::default();

    let sender = thread::spawn(move || {
      thread::sleep(Duration::from_millis(20));
      stop_tx.send(()).unwrap();
    });
    serve(engine.clone(), stop_rx, &mut sink).unwrap();
    sender.join().unwrap();

    assert_eq!(engine.calls(), vec![EngineCall::Start, EngineCall::Stop]);
    assert_eq!(
      sink.phases,
      vec![
        (ServicePhase::StartPending, 0),
        (ServicePhase::Running, 0),
        (ServicePhase::StopPending, 0),
        (ServicePhase::Stopped, 0),
      ]
    );
  }

  #[test]
  fn dropped_sender_counts_as_stop() {
    let engine = FakeEngine::default();
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    drop(stop_tx);

    serve(engine.clone(), stop_rx, &mut RecordingSink::default()).unwrap();
    assert_eq!(engine.calls(), vec![EngineCall::Start, EngineCall::Stop]);
  }

  #[test]
  fn start_failure_reports_stopped_with_exit_code() {
    let engine = FakeEngine {
      fail_start: true,
      ..FakeEngine::default()
    };
    let (_stop_tx, stop_rx) = mpsc::channel();
    let mut sink = RecordingSink::default();

    assert!(serve(engine.clone(), stop_rx, &mut sink).is_err());
    assert_eq!(engine.calls(), vec![EngineCall::Start]);
    assert_eq!(
      sink.phases,
      vec![
        (ServicePhase::StartPending, 0),
        (ServicePhase::Stopped, ENGINE_START_FAILED_EXIT_CODE),
      ]
    );
  }
}
