use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use async_trait::async_trait;
use encoding_rs::Encoding;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::command::Command;
use crate::error::CommandError;
use crate::exec::CancellationPolicy;
use crate::exec::SpawnBarrier;
use crate::exec::execute_inner;
use crate::handoff;
use crate::handoff::HandoffReceiver;
use crate::handoff::HandoffSender;
use crate::lines::default_output_encoding;
use crate::pipes::LineHandler;
use crate::pipes::PipeTarget;
use crate::result::ExecutionResult;

/// One event in the lifecycle of a streamed execution.
///
/// `Started` is always first and unique; `Exited` is always last and unique.
/// Line events preserve arrival order within each stream; no order is
/// guaranteed across the two streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandEvent {
    Started { pid: u32 },
    StdoutLine { line: String },
    StderrLine { line: String },
    Exited { exit_code: i32 },
}

/// Per-stream output encodings for event decoding.
#[derive(Debug, Clone, Copy)]
pub struct EventStreamOptions {
    pub stdout_encoding: &'static Encoding,
    pub stderr_encoding: &'static Encoding,
}

impl Default for EventStreamOptions {
    fn default() -> Self {
        Self {
            stdout_encoding: default_output_encoding(),
            stderr_encoding: default_output_encoding(),
        }
    }
}

#[async_trait]
trait EventSink: Send + Sync {
    async fn emit(&self, event: CommandEvent);
}

struct HandoffSink {
    tx: HandoffSender<CommandEvent>,
}

#[async_trait]
impl EventSink for HandoffSink {
    async fn emit(&self, event: CommandEvent) {
        // A dropped consumer just ends the relay; the run itself continues.
        let _ = self.tx.send(event).await;
    }
}

struct CallbackSink<F> {
    callback: Mutex<F>,
}

#[async_trait]
impl<F> EventSink for CallbackSink<F>
where
    F: FnMut(CommandEvent) + Send,
{
    async fn emit(&self, event: CommandEvent) {
        let mut callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        (*callback)(event);
    }
}

#[derive(Clone, Copy)]
enum TappedStream {
    Stdout,
    Stderr,
}

struct LineTap {
    sink: Arc<dyn EventSink>,
    stream: TappedStream,
}

#[async_trait]
impl LineHandler for LineTap {
    async fn on_line(&self, line: String) {
        let event = match self.stream {
            TappedStream::Stdout => CommandEvent::StdoutLine { line },
            TappedStream::Stderr => CommandEvent::StderrLine { line },
        };
        self.sink.emit(event).await;
    }
}

/// One streaming run shared by the pull and push adapters, so their behavior
/// cannot diverge. The caller's configured targets keep receiving bytes; the
/// taps additionally forward each decoded line to the sink.
async fn run_streaming(
    command: &Command,
    policy: &CancellationPolicy,
    options: EventStreamOptions,
    sink: Arc<dyn EventSink>,
) -> Result<ExecutionResult, CommandError> {
    let stdout_tap = PipeTarget::line_handler(
        Arc::new(LineTap {
            sink: Arc::clone(&sink),
            stream: TappedStream::Stdout,
        }),
        options.stdout_encoding,
    );
    let stderr_tap = PipeTarget::line_handler(
        Arc::new(LineTap {
            sink: Arc::clone(&sink),
            stream: TappedStream::Stderr,
        }),
        options.stderr_encoding,
    );
    let tapped = command
        .clone()
        .stdout(PipeTarget::merge([command.stdout.clone(), stdout_tap]))
        .stderr(PipeTarget::merge([command.stderr.clone(), stderr_tap]));

    let (pid_tx, mut pid_rx) = oneshot::channel();
    let (resume_tx, resume_rx) = oneshot::channel();
    let run = execute_inner(
        &tapped,
        policy,
        Some(SpawnBarrier {
            pid_tx,
            resume_rx,
        }),
    );
    tokio::pin!(run);

    // Drive the run just far enough to learn the pid; the barrier holds the
    // pumps until `Started` is out, so no line event can precede it.
    let pid = tokio::select! {
        biased;
        pid = &mut pid_rx => pid.ok(),
        result = &mut run => return finish(result, sink.as_ref()).await,
    };
    match pid {
        Some(pid) => {
            sink.emit(CommandEvent::Started { pid }).await;
            let _ = resume_tx.send(());
        }
        None => {
            // The spawn failed before a pid was reported.
            let result = run.await;
            return finish(result, sink.as_ref()).await;
        }
    }

    let result = run.await;
    finish(result, sink.as_ref()).await
}

/// Emit the final `Exited` event (the observed exit code is known even for
/// cancellation and validation failures) and pass the result through.
async fn finish(
    result: Result<ExecutionResult, CommandError>,
    sink: &dyn EventSink,
) -> Result<ExecutionResult, CommandError> {
    let exit_code = match &result {
        Ok(result) => Some(result.exit_code),
        Err(CommandError::Cancelled { exit_code, .. })
        | Err(CommandError::NonZeroExitCode { exit_code, .. }) => Some(*exit_code),
        Err(_) => None,
    };
    if let Some(exit_code) = exit_code {
        sink.emit(CommandEvent::Exited { exit_code }).await;
    }
    result
}

/// Lazily pulled sequence of `CommandEvent`s for one execution.
///
/// The sequence is finite and non-restartable; a failed run surfaces its
/// error to the consumer after the last event.
pub struct CommandEventStream {
    rx: HandoffReceiver<CommandEvent>,
    driver: Option<JoinHandle<Result<ExecutionResult, CommandError>>>,
    done: bool,
}

impl CommandEventStream {
    /// Next event, or the run's terminal error, or `None` once exhausted.
    pub async fn next(&mut self) -> Option<Result<CommandEvent, CommandError>> {
        if self.done {
            return None;
        }
        if let Some(event) = self.rx.recv().await {
            return Some(Ok(event));
        }
        self.done = true;
        let driver = self.driver.take()?;
        match driver.await {
            Ok(Ok(_)) => None,
            Ok(Err(err)) => Some(Err(err)),
            Err(err) => Some(Err(CommandError::Pipe {
                source: io::Error::other(err),
            })),
        }
    }

    /// Adapt into a `futures::Stream`.
    pub fn into_stream(
        mut self,
    ) -> impl futures::Stream<Item = Result<CommandEvent, CommandError>> {
        async_stream::stream! {
            while let Some(item) = self.next().await {
                yield item;
            }
        }
    }
}

impl Command {
    /// Run the command as a lazily pulled event sequence.
    pub fn events(&self, policy: CancellationPolicy) -> CommandEventStream {
        self.events_with_options(policy, EventStreamOptions::default())
    }

    /// Event sequence with explicit per-stream encodings.
    pub fn events_with_options(
        &self,
        policy: CancellationPolicy,
        options: EventStreamOptions,
    ) -> CommandEventStream {
        let (tx, rx) = handoff::channel();
        let command = self.clone();
        let driver = tokio::spawn(async move {
            let sink: Arc<dyn EventSink> = Arc::new(HandoffSink { tx: tx.clone() });
            let result = run_streaming(&command, &policy, options, sink).await;
            tx.close();
            result
        });
        CommandEventStream {
            rx,
            driver: Some(driver),
            done: false,
        }
    }

    /// Run the command, pushing every event to `on_event` as it occurs.
    ///
    /// Callback dispatch is synchronized; a failed run returns the error
    /// after the final `Exited` notification.
    pub async fn observe<F>(
        &self,
        policy: CancellationPolicy,
        on_event: F,
    ) -> Result<ExecutionResult, CommandError>
    where
        F: FnMut(CommandEvent) + Send + 'static,
    {
        self.observe_with_options(policy, EventStreamOptions::default(), on_event)
            .await
    }

    /// Push-mode observation with explicit per-stream encodings.
    pub async fn observe_with_options<F>(
        &self,
        policy: CancellationPolicy,
        options: EventStreamOptions,
        on_event: F,
    ) -> Result<ExecutionResult, CommandError>
    where
        F: FnMut(CommandEvent) + Send + 'static,
    {
        let sink: Arc<dyn EventSink> = Arc::new(CallbackSink {
            callback: Mutex::new(on_event),
        });
        run_streaming(self, &policy, options, sink).await
    }
}
