use std::io;

use encoding_rs::Encoding;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;

use crate::command::Command;
use crate::command::ExitCodeValidation;
use crate::error::CancellationKind;
use crate::error::CommandError;
use crate::lines::default_output_encoding;
use crate::pipes::MemoryBuffer;
use crate::pipes::PipeTarget;
use crate::process::ProcessHandle;
use crate::resolve;
use crate::result::BufferedExecutionResult;
use crate::result::ExecutionResult;

/// The two independent cancellation signals for one execution.
///
/// Graceful requests cooperative termination (the child may ignore it);
/// forceful mandates termination of the child and its descendants. Either,
/// both, or neither may be armed; forceful takes precedence when both fire.
#[derive(Debug, Clone, Default)]
pub struct CancellationPolicy {
    pub graceful: Option<CancellationToken>,
    pub forceful: Option<CancellationToken>,
}

impl CancellationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_graceful(mut self, token: CancellationToken) -> Self {
        self.graceful = Some(token);
        self
    }

    pub fn with_forceful(mut self, token: CancellationToken) -> Self {
        self.forceful = Some(token);
        self
    }
}

impl Command {
    /// Run the command end-to-end: spawn, pump the configured pipes, apply
    /// the cancellation policy, and validate the exit code.
    pub async fn execute(&self, policy: CancellationPolicy) -> Result<ExecutionResult, CommandError> {
        execute_inner(self, &policy, None).await
    }

    /// Run the command with stdout and stderr additionally captured into
    /// memory and decoded as UTF-8.
    pub async fn execute_buffered(
        &self,
        policy: CancellationPolicy,
    ) -> Result<BufferedExecutionResult, CommandError> {
        self.execute_buffered_with_encodings(
            policy,
            default_output_encoding(),
            default_output_encoding(),
        )
        .await
    }

    /// Buffered execution with explicit per-stream output encodings.
    pub async fn execute_buffered_with_encodings(
        &self,
        policy: CancellationPolicy,
        stdout_encoding: &'static Encoding,
        stderr_encoding: &'static Encoding,
    ) -> Result<BufferedExecutionResult, CommandError> {
        let stdout_buffer = MemoryBuffer::new();
        let stderr_buffer = MemoryBuffer::new();
        let command = self
            .clone()
            .stdout(PipeTarget::merge([
                self.stdout.clone(),
                PipeTarget::to_buffer(&stdout_buffer),
            ]))
            .stderr(PipeTarget::merge([
                self.stderr.clone(),
                PipeTarget::to_buffer(&stderr_buffer),
            ]));
        let result = command.execute(policy).await?;
        Ok(BufferedExecutionResult {
            result,
            stdout: stdout_buffer.text(stdout_encoding),
            stderr: stderr_buffer.text(stderr_encoding),
        })
    }
}

/// Rendezvous between the orchestrator and the event adapters: the pid is
/// reported as soon as the spawn succeeds, and the pumps are held back until
/// the adapter has announced the start, so no output event can precede it.
pub(crate) struct SpawnBarrier {
    pub(crate) pid_tx: oneshot::Sender<u32>,
    pub(crate) resume_rx: oneshot::Receiver<()>,
}

/// Shared execution path. The barrier, when present, fires with the process
/// id immediately after the spawn succeeds, before any pump runs.
pub(crate) async fn execute_inner(
    command: &Command,
    policy: &CancellationPolicy,
    barrier: Option<SpawnBarrier>,
) -> Result<ExecutionResult, CommandError> {
    let program =
        resolve::optimally_qualified_program(command.get_program(), command.get_current_dir());
    let mut handle = ProcessHandle::spawn(command, program)?;
    // Captured before anything can dispose the handle; continuations must
    // never need to reach back into it for the pid.
    let pid = handle.pid();
    if let Some(barrier) = barrier {
        let _ = barrier.pid_tx.send(pid);
        // A dropped sender resumes immediately; only the event adapters hold
        // the pumps back, and only until `Started` is out.
        let _ = barrier.resume_rx.await;
    }

    let graceful = policy.graceful.clone().unwrap_or_default();
    let forceful = policy.forceful.clone().unwrap_or_default();
    // The input pump gets its own token, derived from the forceful signal and
    // additionally fired on process exit: an infinite or oversized stdin
    // source must not block forever once its consumer is gone. This internal
    // cancellation is never surfaced to the caller.
    let input_cancel = forceful.child_token();
    let output_cancel = forceful.child_token();

    let stdin = handle.take_stdin();
    let mut stdout = handle.take_stdout();
    let mut stderr = handle.take_stderr();
    let exit_gate = handle.exit_gate();

    let input_pump = async {
        if let Some(mut writer) = stdin {
            match command.stdin.copy_into(&mut *writer, &input_cancel).await {
                Ok(()) => {}
                Err(CommandError::Pipe { source }) if source.kind() == io::ErrorKind::BrokenPipe => {
                    // Expected when the process exits before reading all of
                    // its input.
                    trace!(pid, "stdin closed early by the process");
                }
                Err(err) => return Err(err),
            }
            let _ = writer.shutdown().await;
        }
        Ok(())
    };
    let output_pump = async {
        match stdout.as_mut() {
            Some(reader) => command.stdout.consume(&mut **reader, &output_cancel).await,
            None => Ok(()),
        }
    };
    let error_pump = async {
        match stderr.as_mut() {
            Some(reader) => command.stderr.consume(&mut **reader, &output_cancel).await,
            None => Ok(()),
        }
    };
    let exit_watch = async {
        let exit = exit_gate.wait().await;
        input_cancel.cancel();
        exit
    };
    // Signal registrations live only for the duration of this execution;
    // process exit disarms them.
    let graceful_guard = async {
        tokio::select! {
            _ = graceful.cancelled() => {
                debug!(pid, "graceful cancellation requested; interrupting");
                let _ = handle.interrupt();
            }
            _ = exit_gate.wait() => {}
        }
    };
    let forceful_guard = async {
        tokio::select! {
            _ = forceful.cancelled() => {
                debug!(pid, "forceful cancellation requested; killing process tree");
                handle.kill().await;
            }
            _ = exit_gate.wait() => {}
        }
    };

    let (input_result, output_result, error_result, exit, (), ()) = tokio::join!(
        input_pump,
        output_pump,
        error_pump,
        exit_watch,
        graceful_guard,
        forceful_guard
    );
    input_result?;
    output_result?;
    error_result?;

    // Forceful first: it is the unambiguous outcome when both signals fired.
    if policy
        .forceful
        .as_ref()
        .is_some_and(|token| token.is_cancelled())
    {
        return Err(cancelled(CancellationKind::Forceful, command, pid, exit.code));
    }
    if policy
        .graceful
        .as_ref()
        .is_some_and(|token| token.is_cancelled())
    {
        return Err(cancelled(CancellationKind::Graceful, command, pid, exit.code));
    }

    match command.validation {
        ExitCodeValidation::ZeroExit if exit.code != 0 => Err(CommandError::NonZeroExitCode {
            program: command.get_program().to_string(),
            args: command.get_args().to_vec(),
            exit_code: exit.code,
        }),
        _ => Ok(ExecutionResult {
            exit_code: exit.code,
            started_at: handle.started_at(),
            exited_at: exit.exited_at,
        }),
    }
}

fn cancelled(kind: CancellationKind, command: &Command, pid: u32, exit_code: i32) -> CommandError {
    CommandError::Cancelled {
        kind,
        program: command.get_program().to_string(),
        pid,
        exit_code,
    }
}
