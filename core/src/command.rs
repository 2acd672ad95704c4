use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use crate::pipes::PipeSource;
use crate::pipes::PipeTarget;

/// How long `kill` waits for the exit notification before force-resolving the
/// exit wait.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(3);

/// Result-validation policy applied after the process exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitCodeValidation {
    /// Any exit code other than zero fails the execution.
    #[default]
    ZeroExit,
    /// Exit codes are passed through without validation.
    None,
}

/// Pseudo-terminal dimensions for a command that runs under a PTY.
///
/// When a PTY is active, everything the child writes — including its standard
/// error stream — arrives through the single output stream, and the error
/// pipe target receives an empty stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtyOptions {
    pub columns: u16,
    pub rows: u16,
}

impl Default for PtyOptions {
    fn default() -> Self {
        Self {
            columns: 80,
            rows: 24,
        }
    }
}

/// An immutable description of one external command execution.
///
/// Every builder method consumes the value and returns a new one, so a
/// configured `Command` can be cloned and varied freely; executions never
/// mutate it.
#[derive(Debug, Clone)]
pub struct Command {
    pub(crate) program: String,
    pub(crate) args: Vec<String>,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) env: HashMap<String, Option<String>>,
    pub(crate) validation: ExitCodeValidation,
    pub(crate) stdin: PipeSource,
    pub(crate) stdout: PipeTarget,
    pub(crate) stderr: PipeTarget,
    pub(crate) pty: Option<PtyOptions>,
    pub(crate) kill_timeout: Duration,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            validation: ExitCodeValidation::default(),
            stdin: PipeSource::null(),
            stdout: PipeTarget::null(),
            stderr: PipeTarget::null(),
            pty: None,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), Some(value.into()));
        self
    }

    /// Mark an environment variable as unset: the child will not observe the
    /// inherited value (as opposed to observing an empty string).
    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        self.env.insert(key.into(), None);
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), Some(v.into()))));
        self
    }

    pub fn validation(mut self, validation: ExitCodeValidation) -> Self {
        self.validation = validation;
        self
    }

    pub fn stdin(mut self, source: PipeSource) -> Self {
        self.stdin = source;
        self
    }

    pub fn stdout(mut self, target: PipeTarget) -> Self {
        self.stdout = target;
        self
    }

    pub fn stderr(mut self, target: PipeTarget) -> Self {
        self.stderr = target;
        self
    }

    /// Run the command under a pseudo-terminal.
    pub fn pty(mut self, options: PtyOptions) -> Self {
        self.pty = Some(options);
        self
    }

    /// Bound on how long a `kill` waits for exit confirmation before the
    /// exit wait is force-resolved.
    pub fn kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    pub fn get_program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_current_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn get_pty(&self) -> Option<PtyOptions> {
        self.pty
    }
}
