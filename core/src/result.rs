use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;

/// Outcome of a completed (and validated) execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Exit code reported by the native process, verbatim.
    pub exit_code: i32,
    /// When the wrapper spawned the process, per its own clock.
    pub started_at: DateTime<Utc>,
    /// When the exit notification fired.
    pub exited_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// True when the process exited with code zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn run_time(&self) -> Duration {
        (self.exited_at - self.started_at).to_std().unwrap_or_default()
    }
}

/// An `ExecutionResult` with the standard output and error streams fully
/// materialized as text.
#[derive(Debug, Clone)]
pub struct BufferedExecutionResult {
    pub result: ExecutionResult,
    pub stdout: String,
    pub stderr: String,
}

impl BufferedExecutionResult {
    pub fn exit_code(&self) -> i32 {
        self.result.exit_code
    }

    pub fn success(&self) -> bool {
        self.result.success()
    }

    pub fn run_time(&self) -> Duration {
        self.result.run_time()
    }
}
