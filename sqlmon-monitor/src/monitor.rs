use crate::config::Settings;
use crate::Engine;
use std::io;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum EngineStartError {
  #[error("monitor is already running")]
  AlreadyRunning,

  #[error("no SQL Server instances are configured")]
  NoServers,

  #[error("a license key is required unless running with --collect-only")]
  MissingLicenseKey,

  #[error("failed to spawn poller thread")]
  Spawn(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
  pub cycle: u64,
  pub servers_polled: usize,
  pub submitted: bool,
}

struct Worker {
  stop_tx: mpsc::Sender<()>,
  handle: thread::JoinHandle<()>,
}

pub struct Monitor {
  settings: Settings,
  worker: Option<Worker>,
}

impl Monitor {
  pub fn new(settings: Settings) -> Self {
    Self {
      settings,
      worker: None,
    }
  }

  pub fn is_running(&self) -> bool {
    self.worker.is_some()
  }
}

impl Engine for Monitor {
  fn start(&mut self) -> Result<(), EngineStartError> {
    if self.worker.is_some() {
      return Err(EngineStartError::AlreadyRunning);
    }
    if self.settings.servers.is_empty() {
      return Err(EngineStartError::NoServers);
    }
    if !self.settings.collect_only && self.settings.license_key.is_none() {
      return Err(EngineStartError::MissingLicenseKey);
    }

    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let settings = self.settings.clone();
    let handle = thread::Builder::new()
      .name("sqlmon-poller".to_string())
      .spawn(move || poll_loop(&settings, stop_rx))
      .map_err(EngineStartError::Spawn)?;

    tracing::info!(
      servers = self.settings.servers.len(),
      poll_interval_seconds = self.settings.poll_interval_seconds,
      collect_only = self.settings.collect_only,
      "monitor started"
    );
    self.worker = Some(Worker { stop_tx, handle });
    Ok(())
  }

  fn stop(&mut self) {
    let Some(worker) = self.worker.take() else {
      tracing::debug!("monitor stop requested while not running");
      return;
    };

    // The poller may already have exited; a closed channel is fine.
    let _ = worker.stop_tx.send(());
    if worker.handle.join().is_err() {
      tracing::error!("poller thread panicked");
    }
    tracing::info!("monitor stopped");
  }
}

impl Drop for Monitor {
  fn drop(&mut self) {
    self.stop();
  }
}

fn poll_loop(settings: &Settings, stop_rx: mpsc::Receiver<()>) {
  let tick = Duration::from_secs(settings.poll_interval_seconds);
  let mut cycle = 0u64;

  tracing::info!("poller loop started");
  loop {
    cycle += 1;
    run_cycle(settings, cycle);

    match stop_rx.recv_timeout(tick) {
      Err(mpsc::RecvTimeoutError::Timeout) => continue,
      Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
    }
  }
  tracing::info!(cycles = cycle, "poller loop exiting");
}

pub fn run_cycle(settings: &Settings, cycle: u64) -> CycleReport {
  for server in &settings.servers {
    tracing::debug!(
      cycle,
      server = %server.name,
      include_system_databases = server.include_system_databases,
      "polling server"
    );
  }

  let submitted = !settings.collect_only;
  if submitted {
    tracing::info!(cycle, servers = settings.servers.len(), "submitting metrics");
  } else {
    tracing::info!(
      cycle,
      servers = settings.servers.len(),
      "collect-only mode; submission skipped"
    );
  }

  CycleReport {
    cycle,
    servers_polled: settings.servers.len(),
    submitted,
  }
}
