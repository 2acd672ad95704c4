use core::fmt;
use std::sync::Mutex;
use std::sync::PoisonError;

use portable_pty::MasterPty;
use portable_pty::PtySize;
use portable_pty::SlavePty;
use portable_pty::native_pty_system;
use tracing::debug;

use crate::error::PtyError;
use crate::session::PtySession;
use crate::session::PtySpawnSpec;

/// Returns true when ConPTY support is available (Windows only).
///
/// ConPTY shipped with Windows 10 1809 (build 17763); on older builds the
/// entry point is absent from kernel32.
#[cfg(windows)]
pub fn conpty_supported() -> bool {
    use winapi::um::libloaderapi::GetModuleHandleA;
    use winapi::um::libloaderapi::GetProcAddress;

    unsafe {
        let kernel32 = GetModuleHandleA(c"kernel32.dll".as_ptr().cast());
        if kernel32.is_null() {
            return false;
        }
        !GetProcAddress(kernel32, c"CreatePseudoConsole".as_ptr().cast()).is_null()
    }
}

/// Returns true when ConPTY support is available (non-Windows always true).
#[cfg(not(windows))]
pub fn conpty_supported() -> bool {
    true
}

/// One allocated pseudo-terminal pair.
///
/// `close_console` and `dispose` are distinct operations: closing the console
/// releases the slave/console side so a blocked master read observes
/// end-of-file, while `dispose` additionally releases the master. Both are
/// idempotent and safe to race against each other; each native handle is
/// released exactly once.
pub struct PseudoTerminal {
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    slave: Mutex<Option<Box<dyn SlavePty + Send>>>,
}

impl fmt::Debug for PseudoTerminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PseudoTerminal").finish()
    }
}

fn pty_size(columns: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols: columns,
        pixel_width: 0,
        pixel_height: 0,
    }
}

impl PseudoTerminal {
    /// Allocate a pseudo-terminal of the given dimensions.
    pub fn create(columns: u16, rows: u16) -> Result<Self, PtyError> {
        if columns == 0 || rows == 0 {
            return Err(PtyError::InvalidDimensions { columns, rows });
        }
        if !conpty_supported() {
            return Err(PtyError::Unsupported {
                reason: "ConPTY requires Windows 10 1809 (build 17763) or newer".to_string(),
            });
        }

        let pair = native_pty_system()
            .openpty(pty_size(columns, rows))
            .map_err(|err| PtyError::Allocate {
                message: err.to_string(),
            })?;
        debug!(columns, rows, "allocated pseudo-terminal");

        Ok(Self {
            master: Mutex::new(Some(pair.master)),
            slave: Mutex::new(Some(pair.slave)),
        })
    }

    /// Change the terminal dimensions. Valid any time before disposal.
    pub fn resize(&self, columns: u16, rows: u16) -> Result<(), PtyError> {
        if columns == 0 || rows == 0 {
            return Err(PtyError::InvalidDimensions { columns, rows });
        }

        let master = lock(&self.master);
        let Some(master) = master.as_ref() else {
            return Err(PtyError::Disposed);
        };
        master
            .resize(pty_size(columns, rows))
            .map_err(|err| PtyError::Resize {
                message: err.to_string(),
            })?;
        debug!(columns, rows, "resized pseudo-terminal");
        Ok(())
    }

    /// Spawn a child attached to the slave/console side of this terminal.
    ///
    /// The child's stdin, stdout, and stderr all refer to the terminal, so
    /// everything it writes — including stderr — arrives through the single
    /// master output stream.
    pub fn spawn(&self, spec: &PtySpawnSpec) -> Result<PtySession, PtyError> {
        let spawn_err = |message: String| PtyError::Spawn {
            program: spec.program.clone(),
            message,
        };

        let mut builder = portable_pty::CommandBuilder::new(&spec.program);
        for arg in &spec.args {
            builder.arg(arg);
        }
        if let Some(cwd) = &spec.cwd {
            builder.cwd(cwd);
        }
        for (key, value) in &spec.env {
            match value {
                Some(value) => builder.env(key, value),
                None => builder.env_remove(key),
            }
        }

        let child = {
            let slave = lock(&self.slave);
            let Some(slave) = slave.as_ref() else {
                return Err(PtyError::Disposed);
            };
            slave
                .spawn_command(builder)
                .map_err(|err| spawn_err(err.to_string()))?
        };

        let (reader, writer) = {
            let master = lock(&self.master);
            let Some(master) = master.as_ref() else {
                return Err(PtyError::Disposed);
            };
            let reader = master
                .try_clone_reader()
                .map_err(|err| spawn_err(err.to_string()))?;
            let writer = master
                .take_writer()
                .map_err(|err| spawn_err(err.to_string()))?;
            (reader, writer)
        };

        // Off Windows the slave can be released as soon as the child holds its
        // own copy; the master reader then observes EOF at child exit. On
        // Windows closing the console tears the child down, so it stays open
        // until after exit.
        if !cfg!(windows) {
            self.close_console();
        }

        debug!(program = %spec.program, "spawned process under pseudo-terminal");
        Ok(PtySession::launch(child, reader, writer))
    }

    /// Release the slave/console side, signalling end-of-file to any blocked
    /// master read. Idempotent.
    pub fn close_console(&self) {
        if let Some(slave) = lock(&self.slave).take() {
            drop(slave);
            debug!("pseudo-terminal console closed");
        }
    }

    /// Release all native resources. Idempotent; implies `close_console`.
    pub fn dispose(&self) {
        self.close_console();
        if let Some(master) = lock(&self.master).take() {
            drop(master);
            debug!("pseudo-terminal disposed");
        }
    }
}

impl Drop for PseudoTerminal {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
