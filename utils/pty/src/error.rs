use thiserror::Error;

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("pseudo-terminal support is unavailable on this platform: {reason}")]
    Unsupported { reason: String },

    #[error("pseudo-terminal dimensions must be positive, got {columns}x{rows}")]
    InvalidDimensions { columns: u16, rows: u16 },

    #[error("failed to allocate pseudo-terminal: {message}")]
    Allocate { message: String },

    #[error("failed to resize pseudo-terminal: {message}")]
    Resize { message: String },

    #[error("failed to spawn {program} under pseudo-terminal: {message}")]
    Spawn { program: String, message: String },

    #[error("pseudo-terminal has already been disposed")]
    Disposed,
}
