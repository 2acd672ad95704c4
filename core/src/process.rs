use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use chrono::DateTime;
use chrono::Utc;
use futures::SinkExt;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::sync::Notify;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::CopyToBytes;
use tokio_util::io::SinkWriter;
use tokio_util::io::StreamReader;
use tokio_util::sync::PollSender;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use cmdwrap_utils_pty::PseudoTerminal;
use cmdwrap_utils_pty::PtyError;
use cmdwrap_utils_pty::PtySpawnSpec;

use crate::command::Command;
use crate::command::PtyOptions;
use crate::error::CommandError;
use crate::process_group;

pub(crate) type ChildInput = Box<dyn AsyncWrite + Send + Sync + Unpin>;
pub(crate) type ChildOutput = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// Exit code recorded when a kill could not be confirmed in time.
const UNCONFIRMED_KILL_EXIT_CODE: i32 = -1;

/// Exit information recorded by the exit-notification task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: i32,
    pub exited_at: DateTime<Utc>,
}

/// One-shot completion cell for the exit notification.
///
/// Resolved exactly once — either by the exit-notification task or, when a
/// kill cannot be confirmed in time, force-resolved so no waiter hangs.
pub(crate) struct ExitGate {
    done: AtomicBool,
    notify: Notify,
    info: Mutex<Option<ProcessExit>>,
}

impl ExitGate {
    fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            notify: Notify::new(),
            info: Mutex::new(None),
        }
    }

    pub(crate) fn resolve(&self, code: i32) {
        {
            let mut info = self.info.lock().unwrap_or_else(PoisonError::into_inner);
            if info.is_none() {
                *info = Some(ProcessExit {
                    code,
                    exited_at: Utc::now(),
                });
                self.done.store(true, Ordering::Release);
            }
        }
        self.notify.notify_waiters();
    }

    pub(crate) async fn wait(&self) -> ProcessExit {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.done.load(Ordering::Acquire) {
                let info = self.info.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(exit) = *info {
                    return exit;
                }
            }
            notified.await;
        }
    }
}

/// Terminates a spawned process and its descendants. Taken at most once.
trait ProcessTerminator: Send {
    fn kill(&mut self) -> io::Result<()>;
}

struct PipeTreeTerminator {
    pid: u32,
}

impl ProcessTerminator for PipeTreeTerminator {
    fn kill(&mut self) -> io::Result<()> {
        process_group::kill_process_tree(self.pid)
    }
}

struct PtyTreeTerminator {
    pid: u32,
    session: cmdwrap_utils_pty::PtySession,
}

impl ProcessTerminator for PtyTreeTerminator {
    fn kill(&mut self) -> io::Result<()> {
        // The PTY child leads its own group; take out descendants first, then
        // the child itself through the terminal's own killer.
        let group = process_group::kill_process_tree(self.pid);
        let child = self.session.kill();
        group.and(child)
    }
}

/// Wrapper around one native process: its standard stream handles, exit
/// notification, and termination. Under a PTY the error handle is a no-op
/// stream and all output arrives through the single output handle.
pub struct ProcessHandle {
    pid: u32,
    program: String,
    started_at: DateTime<Utc>,
    kill_timeout: Duration,
    stdin: Option<ChildInput>,
    stdout: Option<ChildOutput>,
    stderr: Option<ChildOutput>,
    exit: Arc<ExitGate>,
    terminator: Mutex<Option<Box<dyn ProcessTerminator>>>,
    pty: Option<Arc<PseudoTerminal>>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("program", &self.program)
            .finish()
    }
}

impl ProcessHandle {
    /// Launch the process described by `command`, with `program` already
    /// resolved to its optimally qualified path. Spawn failures surface here,
    /// before any asynchronous pump starts.
    pub(crate) fn spawn(command: &Command, program: PathBuf) -> Result<Self, CommandError> {
        match command.pty {
            Some(options) => Self::spawn_pty(command, program, options),
            None => Self::spawn_piped(command, program),
        }
    }

    fn spawn_piped(command: &Command, program: PathBuf) -> Result<Self, CommandError> {
        let mut cmd = tokio::process::Command::new(&program);
        cmd.args(command.get_args());
        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &command.env {
            match value {
                Some(value) => {
                    cmd.env(key, value);
                }
                None => {
                    cmd.env_remove(key);
                }
            }
        }
        cmd.stdin(if command.stdin.is_null() {
            Stdio::null()
        } else {
            Stdio::piped()
        });
        cmd.stdout(if command.stdout.is_null() {
            Stdio::null()
        } else {
            Stdio::piped()
        });
        cmd.stderr(if command.stderr.is_null() {
            Stdio::null()
        } else {
            Stdio::piped()
        });
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                process_group::set_process_group()?;
                Ok(())
            });
        }
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| CommandError::SpawnFailed {
            program: program.clone(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| CommandError::SpawnFailed {
            program: program.clone(),
            source: io::Error::other("missing child pid"),
        })?;
        let started_at = Utc::now();
        trace!(pid, program = %program.display(), "spawned process");

        let stdin = child.stdin.take().map(|s| Box::new(s) as ChildInput);
        let stdout = child.stdout.take().map(|s| Box::new(s) as ChildOutput);
        let stderr = child.stderr.take().map(|s| Box::new(s) as ChildOutput);

        let exit = Arc::new(ExitGate::new());
        let wait_gate = Arc::clone(&exit);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(_) => -1,
            };
            debug!(pid, code, "process exited");
            wait_gate.resolve(code);
        });

        Ok(Self {
            pid,
            program: command.get_program().to_string(),
            started_at,
            kill_timeout: command.kill_timeout,
            stdin,
            stdout,
            stderr,
            exit,
            terminator: Mutex::new(Some(Box::new(PipeTreeTerminator { pid }))),
            pty: None,
        })
    }

    fn spawn_pty(
        command: &Command,
        program: PathBuf,
        options: PtyOptions,
    ) -> Result<Self, CommandError> {
        let pty = Arc::new(PseudoTerminal::create(options.columns, options.rows)?);
        let spec = PtySpawnSpec {
            program: program.to_string_lossy().into_owned(),
            args: command.args.clone(),
            cwd: command.cwd.clone(),
            env: command.env.clone(),
        };
        let mut session = pty.spawn(&spec).map_err(|err| match err {
            PtyError::Spawn { message, .. } => CommandError::SpawnFailed {
                program: program.clone(),
                source: io::Error::other(message),
            },
            other => CommandError::Pty(other),
        })?;
        let pid = session.pid().ok_or_else(|| CommandError::SpawnFailed {
            program: program.clone(),
            source: io::Error::other("missing child pid"),
        })?;
        let started_at = Utc::now();
        trace!(pid, program = %program.display(), "spawned process under pty");

        let output_rx = session.take_output().ok_or_else(|| CommandError::SpawnFailed {
            program: program.clone(),
            source: io::Error::other("pty output stream unavailable"),
        })?;
        let exit_rx = session.take_exit().ok_or_else(|| CommandError::SpawnFailed {
            program: program.clone(),
            source: io::Error::other("pty exit notification unavailable"),
        })?;

        let stdout: ChildOutput = Box::new(StreamReader::new(
            ReceiverStream::new(output_rx).map(Ok::<Bytes, io::Error>),
        ));
        // The merged-stream invariant: everything, including what the child
        // writes to stderr, arrives via stdout.
        let stderr: ChildOutput = Box::new(tokio::io::empty());
        let writer_sink = PollSender::new(session.writer_sender())
            .sink_map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pty input closed"));
        let stdin: ChildInput = Box::new(SinkWriter::new(CopyToBytes::new(writer_sink)));

        let exit = Arc::new(ExitGate::new());
        let wait_gate = Arc::clone(&exit);
        let wait_pty = Arc::clone(&pty);
        tokio::spawn(async move {
            let code = exit_rx.await.unwrap_or(-1);
            debug!(pid, code, "pty process exited");
            wait_gate.resolve(code);
            // Unblock any console read still pending so the pumps can finish.
            wait_pty.close_console();
        });

        Ok(Self {
            pid,
            program: command.get_program().to_string(),
            started_at,
            kill_timeout: command.kill_timeout,
            stdin: Some(stdin),
            stdout: Some(stdout),
            stderr: Some(stderr),
            exit,
            terminator: Mutex::new(Some(Box::new(PtyTreeTerminator { pid, session }))),
            pty: Some(pty),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub(crate) fn take_stdin(&mut self) -> Option<ChildInput> {
        self.stdin.take()
    }

    pub(crate) fn take_stdout(&mut self) -> Option<ChildOutput> {
        self.stdout.take()
    }

    pub(crate) fn take_stderr(&mut self) -> Option<ChildOutput> {
        self.stderr.take()
    }

    pub(crate) fn exit_gate(&self) -> Arc<ExitGate> {
        Arc::clone(&self.exit)
    }

    /// Suspend until the exit notification fires.
    pub async fn wait(&self) -> ProcessExit {
        self.exit.wait().await
    }

    /// Send a cooperative termination signal to the exact PID.
    ///
    /// On Windows a targeted console interrupt cannot be delivered without
    /// affecting sibling processes, so this is a best-effort no-op there.
    pub fn interrupt(&self) -> io::Result<()> {
        if cfg!(unix) {
            debug!(pid = self.pid, "sending interrupt");
        } else {
            debug!(pid = self.pid, "interrupt unsupported on this platform; ignoring");
        }
        process_group::send_interrupt(self.pid)
    }

    /// Terminate the process and its descendants, then wait for the exit
    /// notification. A kill that cannot be confirmed within the configured
    /// timeout force-resolves the exit wait so the caller is never left
    /// hanging; a process that already exited is not an error.
    pub async fn kill(&self) -> ProcessExit {
        let kill_result = self
            .terminator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(|mut terminator| terminator.kill());
        if let Some(Err(err)) = kill_result {
            warn!(pid = self.pid, error = %err, "kill failed; process may have already exited");
        }

        match tokio::time::timeout(self.kill_timeout, self.exit.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                warn!(
                    pid = self.pid,
                    timeout = ?self.kill_timeout,
                    "kill not confirmed in time; force-resolving exit wait"
                );
                self.exit.resolve(UNCONFIRMED_KILL_EXIT_CODE);
                self.exit.wait().await
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let Some(pty) = &self.pty {
            pty.dispose();
        }
    }
}
