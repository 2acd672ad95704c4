//! OS-specific helpers for signalling and cleaning up spawned commands.
//!
//! - `set_process_group` runs in `pre_exec` so the child starts its own
//!   process group, which lets `kill_process_tree` take out descendants too.
//! - `send_interrupt` targets the exact PID with SIGINT on Unix; Windows has
//!   no reliable way to deliver a targeted console interrupt, so it is a
//!   no-op there.
//! - `kill_process_tree` terminates the process and its descendants: the
//!   process group on Unix, `taskkill /T /F` on Windows.

use std::io;

#[cfg(unix)]
/// Put the calling process into its own process group.
///
/// Intended for use in `pre_exec` so the child becomes the group leader.
pub(crate) fn set_process_group() -> io::Result<()> {
    let result = unsafe { libc::setpgid(0, 0) };
    if result == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(not(unix))]
/// No-op on non-Unix platforms.
pub(crate) fn set_process_group() -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
/// Send SIGINT to exactly this PID (not its group).
pub(crate) fn send_interrupt(pid: u32) -> io::Result<()> {
    let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
    if result == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(not(unix))]
/// No targeted interrupt exists on this platform.
pub(crate) fn send_interrupt(_pid: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
/// Kill the process group for the given PID (best-effort).
///
/// This resolves the PGID for `pid` and sends SIGKILL to the whole group. A
/// group that is already gone is not an error.
pub(crate) fn kill_process_tree(pid: u32) -> io::Result<()> {
    use std::io::ErrorKind;

    let pid = pid as libc::pid_t;
    let pgid = unsafe { libc::getpgid(pid) };
    if pgid == -1 {
        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::NotFound {
            return Err(err);
        }
        return Ok(());
    }

    let result = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if result == -1 {
        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::NotFound {
            return Err(err);
        }
    }

    Ok(())
}

#[cfg(windows)]
/// Kill the process and its descendants via `taskkill /T /F`.
pub(crate) fn kill_process_tree(pid: u32) -> io::Result<()> {
    use std::process::Stdio;

    let status = std::process::Command::new("taskkill")
        .args(["/pid", &pid.to_string(), "/T", "/F"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    // taskkill reports failure for an already-exited tree; treat as done.
    let _ = status;
    Ok(())
}

#[cfg(not(any(unix, windows)))]
/// No-op on unsupported platforms.
pub(crate) fn kill_process_tree(_pid: u32) -> io::Result<()> {
    Ok(())
}
