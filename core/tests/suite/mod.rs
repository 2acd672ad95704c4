#![allow(clippy::unwrap_used, clippy::expect_used)]

mod buffered;
mod cancel;
mod events;
mod pty;

use cmdwrap_core::Command;

/// A command that runs `script` through the platform shell.
pub fn shell(script: &str) -> Command {
    if cfg!(windows) {
        let cmd = std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string());
        Command::new(cmd).args(["/C", script])
    } else {
        Command::new("/bin/sh").args(["-c", script])
    }
}

/// Locate a Python interpreter, or `None` to skip interpreter-based tests.
pub fn find_python() -> Option<String> {
    for candidate in ["python3", "python"] {
        if let Ok(output) = std::process::Command::new(candidate)
            .arg("--version")
            .output()
        {
            if output.status.success() {
                return Some(candidate.to_string());
            }
        }
    }
    None
}
