use core::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use cmdwrap_utils_pty::PtyError;

/// Which cancellation signal terminated an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationKind {
    /// Cooperative termination request the child may ignore.
    Graceful,
    /// Unconditional termination of the child and its descendants.
    Forceful,
}

impl fmt::Display for CancellationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graceful => f.write_str("graceful"),
            Self::Forceful => f.write_str("forceful"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    /// The target could not be started at all (missing executable, no execute
    /// permission, invalid working directory). Surfaced before any I/O work
    /// begins.
    #[error("failed to start process {program:?}: {source}")]
    SpawnFailed {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Execution was cancelled by one of the caller's signals. The process
    /// was terminated (or had already exited) before this error is returned.
    #[error("process {program} (pid {pid}) was terminated by the {kind} cancellation signal")]
    Cancelled {
        kind: CancellationKind,
        program: String,
        pid: u32,
        exit_code: i32,
    },

    /// The process exited with a non-zero code while zero-exit validation was
    /// enabled.
    #[error("process {program} exited with code {exit_code}; arguments: {args:?}")]
    NonZeroExitCode {
        program: String,
        args: Vec<String>,
        exit_code: i32,
    },

    #[error(transparent)]
    Pty(#[from] PtyError),

    /// An underlying pipe read or write failed.
    #[error("pipe I/O failed: {source}")]
    Pipe {
        #[source]
        source: io::Error,
    },
}

impl From<io::Error> for CommandError {
    fn from(source: io::Error) -> Self {
        Self::Pipe { source }
    }
}
