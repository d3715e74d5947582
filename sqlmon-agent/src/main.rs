use std::process::ExitCode;

fn main() -> ExitCode {
  sqlmon_agent::run(std::env::args_os().collect())
}
