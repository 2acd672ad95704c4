//! Run external processes with piped I/O orchestration, dual cancellation
//! (cooperative interrupt vs. unconditional kill), buffered and event-stream
//! result surfaces, and optional pseudo-terminal attachment.

mod command;
mod error;
mod events;
mod exec;
pub mod handoff;
mod lines;
mod pipes;
mod process;
mod process_group;
mod resolve;
mod result;

pub use command::Command;
pub use command::DEFAULT_KILL_TIMEOUT;
pub use command::ExitCodeValidation;
pub use command::PtyOptions;
pub use error::CancellationKind;
pub use error::CommandError;
pub use events::CommandEvent;
pub use events::CommandEventStream;
pub use events::EventStreamOptions;
pub use exec::CancellationPolicy;
pub use lines::LineDecoder;
pub use lines::default_output_encoding;
pub use pipes::LineHandler;
pub use pipes::MemoryBuffer;
pub use pipes::PipeSource;
pub use pipes::PipeTarget;
pub use process::ProcessExit;
pub use process::ProcessHandle;
pub use result::BufferedExecutionResult;
pub use result::ExecutionResult;

pub use cmdwrap_utils_pty::PtyError;
