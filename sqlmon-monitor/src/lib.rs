pub mod config;
pub mod monitor;

pub use config::{load_settings, ConfigError, Settings, SqlServerEndpoint};
pub use monitor::{EngineStartError, Monitor};

/// Start/stop surface the host process drives. `stop` must be safe to call
/// on an engine that never started or has already stopped.
pub trait Engine {
  fn start(&mut self) -> Result<(), EngineStartError>;
  fn stop(&mut self);
}
