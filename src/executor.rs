//! Booking executor seam.
//!
//! The actual court reservation (site automation) lives outside this crate;
//! the poller only needs something that accepts a [`BookingCommand`] and
//! reports success or failure.

use std::process::Command;

use tracing::info;

use crate::command::BookingCommand;
use crate::error::DispatchError;

/// External collaborator that carries out a reservation.
///
/// Implementations run inside the blocking poll cycle, so they may block.
pub trait BookingExecutor: Send + Sync {
    fn execute(&self, command: &BookingCommand) -> Result<(), DispatchError>;
}

/// Executor that only logs the command and reports success.
///
/// Useful for dry runs and as the default when no external program is
/// configured.
#[derive(Debug, Default)]
pub struct LogExecutor;

impl BookingExecutor for LogExecutor {
    fn execute(&self, command: &BookingCommand) -> Result<(), DispatchError> {
        info!(%command, "Executing booking (log only)");
        Ok(())
    }
}

/// Executor that spawns an external booking program with
/// `--day <d> --time <start>-<end>` and treats a zero exit status as success.
pub struct ProcessExecutor {
    program: String,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl BookingExecutor for ProcessExecutor {
    fn execute(&self, command: &BookingCommand) -> Result<(), DispatchError> {
        let time_arg = format!("{}-{}", command.start_hour, command.end_hour);
        info!(program = %self.program, %command, "Launching booking executor");

        let output = Command::new(&self.program)
            .arg("--day")
            .arg(command.day.to_string())
            .arg("--time")
            .arg(&time_arg)
            .output()
            .map_err(|e| DispatchError::Spawn(e.to_string()))?;

        if output.status.success() {
            info!(%command, "Booking executor succeeded");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.lines().rev().take(3).collect::<Vec<_>>().join(" | ");
            Err(DispatchError::Failed {
                reason: format!("exit {}: {tail}", output.status),
            })
        }
    }
}
