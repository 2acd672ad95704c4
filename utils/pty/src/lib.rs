mod error;
mod pty;
mod session;

pub use error::PtyError;
/// Cross-platform pseudo-terminal allocation with explicit close/dispose.
pub use pty::PseudoTerminal;
/// Report whether ConPTY is available on this platform (always true off Windows).
pub use pty::conpty_supported;
/// Parameters for spawning a child attached to a pseudo-terminal.
pub use session::PtySpawnSpec;
/// Handle for a child process running under a pseudo-terminal.
pub use session::PtySession;
