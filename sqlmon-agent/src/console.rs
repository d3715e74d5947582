//! Foreground ("interactive") execution of the monitor.
//!
//! The runner moves through `Starting -> Running -> StoppingRequested ->
//! Stopped`. The monitor is always stopped before [`run_interactive`] returns
//! once it has started, whatever ended the read loop: the quit key, a closed
//! console, or a termination request from the OS.

use crate::logging::RawConsole;
use anyhow::Context;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use sqlmon_monitor::Engine;
use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How often a blocked key read checks for a termination request.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleInput {
  Key(char),
  /// A key with no character, e.g. an arrow key.
  Other,
  /// Ctrl-C, delivered as input instead of terminating the process.
  Interrupt,
  /// The console went away; no further input will arrive.
  Closed,
  /// The OS asked the process to terminate (SIGTERM, SIGHUP, console close).
  Terminate,
}

pub trait KeySource {
  /// Blocks until one keystroke (or console close) is available.
  fn read_input(&mut self) -> anyhow::Result<ConsoleInput>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
  Starting,
  Running,
  StoppingRequested,
  Stopped,
}

pub fn is_interactive() -> bool {
  io::stdin().is_terminal()
}

fn enter(state: RunnerState) {
  tracing::debug!(state = ?state, "interactive runner");
}

pub fn run_interactive<E, K, W>(mut engine: E, keys: &mut K, out: &mut W) -> anyhow::Result<()>
where
  E: Engine,
  K: KeySource + ?Sized,
  W: Write + ?Sized,
{
  enter(RunnerState::Starting);
  writeln!(out, "Starting Server")?;
  engine.start().context("start monitor")?;

  enter(RunnerState::Running);
  let outcome = wait_for_quit(keys, out);

  enter(RunnerState::StoppingRequested);
  let _ = writeln!(out, "Stopping...");
  engine.stop();
  enter(RunnerState::Stopped);

  outcome
}

fn is_quit(input: ConsoleInput) -> bool {
  matches!(
    input,
    ConsoleInput::Key('q') | ConsoleInput::Key('Q') | ConsoleInput::Closed | ConsoleInput::Terminate
  )
}

fn wait_for_quit<K, W>(keys: &mut K, out: &mut W) -> anyhow::Result<()>
where
  K: KeySource + ?Sized,
  W: Write + ?Sized,
{
  loop {
    let _ = writeln!(out, "Press Q to quit...");
    let _ = out.flush();

    let input = keys.read_input().context("read console input")?;
    let _ = writeln!(out);

    match input {
      ConsoleInput::Interrupt => tracing::info!("interrupt ignored; press Q to quit"),
      ConsoleInput::Closed => tracing::warn!("console input closed; stopping"),
      ConsoleInput::Terminate => tracing::info!("termination requested; stopping"),
      _ => {}
    }
    if is_quit(input) {
      return Ok(());
    }
  }
}

/// Lets the operator read a failure before the console closes.
pub fn pause_for_acknowledgment<K, W>(keys: &mut K, out: &mut W)
where
  K: KeySource + ?Sized,
  W: Write + ?Sized,
{
  let _ = writeln!(out);
  let _ = writeln!(out, "Press any key to exit...");
  let _ = out.flush();
  if let Err(e) = keys.read_input() {
    tracing::debug!(error = %e, "failed to read acknowledgment key");
  }
}

/// Set from a signal handler when the OS asks the interactive agent to
/// terminate. The key reader turns it into [`ConsoleInput::Terminate`].
#[derive(Debug, Clone, Default)]
pub struct StopRequest(Arc<AtomicBool>);

impl StopRequest {
  pub fn request(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_requested(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

/// Keeps SIGINT from killing the process between key reads (during a read the
/// terminal is in raw mode and Ctrl-C arrives as a key event instead), and
/// routes SIGTERM and SIGHUP into the returned [`StopRequest`].
#[cfg(unix)]
pub fn install_interrupt_guard() -> anyhow::Result<StopRequest> {
  use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};

  let stop = StopRequest::default();
  for signal in [SIGTERM, SIGHUP] {
    signal_hook::flag::register(signal, Arc::clone(&stop.0))
      .with_context(|| format!("register handler for signal {signal}"))?;
  }
  // Replaces the default action; nothing reads this flag.
  signal_hook::flag::register(SIGINT, Arc::new(AtomicBool::new(false)))
    .context("register SIGINT handler")?;
  Ok(stop)
}

/// With raw mode on, Ctrl-C is read as a key, so a console control event
/// reaching this handler is a close, logoff or shutdown.
#[cfg(not(unix))]
pub fn install_interrupt_guard() -> anyhow::Result<StopRequest> {
  let stop = StopRequest::default();
  let flag = stop.clone();
  match ctrlc::set_handler(move || flag.request()) {
    Ok(()) | Err(ctrlc::Error::MultipleHandlers) => Ok(stop),
    Err(e) => Err(e).context("install console control handler"),
  }
}

struct RawModeGuard {
  raw: RawConsole,
}

impl RawModeGuard {
  fn enable(raw: &RawConsole) -> io::Result<Self> {
    terminal::enable_raw_mode()?;
    raw.set_active(true);
    Ok(Self { raw: raw.clone() })
  }
}

impl Drop for RawModeGuard {
  fn drop(&mut self) {
    self.raw.set_active(false);
    let _ = terminal::disable_raw_mode();
  }
}

/// Reads single keystrokes from the attached terminal.
#[derive(Debug, Clone, Default)]
pub struct TerminalKeys {
  stop: StopRequest,
  raw: RawConsole,
}

impl TerminalKeys {
  pub fn new(stop: StopRequest, raw: RawConsole) -> Self {
    Self { stop, raw }
  }
}

impl KeySource for TerminalKeys {
  fn read_input(&mut self) -> anyhow::Result<ConsoleInput> {
    let _raw = RawModeGuard::enable(&self.raw).context("enable raw terminal mode")?;
    next_input(&self.stop, poll_event)
  }
}

fn poll_event() -> io::Result<Option<Event>> {
  if event::poll(STOP_POLL_INTERVAL)? {
    event::read().map(Some)
  } else {
    Ok(None)
  }
}

fn next_input<P>(stop: &StopRequest, mut poll: P) -> anyhow::Result<ConsoleInput>
where
  P: FnMut() -> io::Result<Option<Event>>,
{
  loop {
    if stop.is_requested() {
      return Ok(ConsoleInput::Terminate);
    }

    let ev = match poll() {
      Ok(Some(ev)) => ev,
      Ok(None) => continue,
      Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
      Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(ConsoleInput::Closed),
      Err(e) => return Err(e).context("read terminal event"),
    };

    if let Some(input) = key_input(&ev) {
      return Ok(input);
    }
  }
}

fn key_input(ev: &Event) -> Option<ConsoleInput> {
  let Event::Key(key) = ev else {
    return None;
  };
  if key.kind != KeyEventKind::Press {
    return None;
  }

  if key.modifiers.contains(KeyModifiers::CONTROL) {
    if let KeyCode::Char('c' | 'C') = key.code {
      return Some(ConsoleInput::Interrupt);
    }
  }

  Some(match key.code {
    KeyCode::Char(c) => ConsoleInput::Key(c),
    _ => ConsoleInput::Other,
  })
}

#[cfg(test)]
pub(crate) mod fake {
  use super::*;
  use sqlmon_monitor::EngineStartError;
  use std::cell::RefCell;
  use std::collections::VecDeque;
  use std::rc::Rc;

  pub struct ScriptedKeys {
    inputs: VecDeque<ConsoleInput>,
    pub reads: usize,
  }

  impl ScriptedKeys {
    pub fn new(inputs: impl IntoIterator<Item = ConsoleInput>) -> Self {
      Self {
        inputs: inputs.into_iter().collect(),
        reads: 0,
      }
    }
  }

  impl KeySource for ScriptedKeys {
    fn read_input(&mut self) -> anyhow::Result<ConsoleInput> {
      self.reads += 1;
      self
        .inputs
        .pop_front()
        .ok_or_else(|| anyhow::anyhow!("console read failed"))
    }
  }

  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub enum EngineCall {
    Start,
    Stop,
  }

  /// Engine double sharing its call log with the test.
  #[derive(Clone, Default)]
  pub struct FakeEngine {
    pub calls: Rc<RefCell<Vec<EngineCall>>>,
    pub fail_start: bool,
  }

  impl FakeEngine {
    pub fn calls(&self) -> Vec<EngineCall> {
      self.calls.borrow().clone()
    }
  }

  impl Engine for FakeEngine {
    fn start(&mut self) -> Result<(), EngineStartError> {
      self.calls.borrow_mut().push(EngineCall::Start);
      if self.fail_start {
        return Err(EngineStartError::NoServers);
      }
      Ok(())
    }

    fn stop(&mut self) {
      self.calls.borrow_mut().push(EngineCall::Stop);
    }
  }
}
