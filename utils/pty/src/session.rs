use core::fmt;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use portable_pty::Child;
use portable_pty::ChildKiller;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;

/// Parameters for spawning a child attached to a pseudo-terminal.
///
/// The environment map is applied on top of the inherited environment: a
/// `Some` value sets the variable, a `None` value removes an inherited one.
#[derive(Debug, Clone, Default)]
pub struct PtySpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, Option<String>>,
}

/// A child process running under a pseudo-terminal.
///
/// Bytes written to the child go through `writer_sender`; everything the
/// child emits (stdout and stderr merged by the terminal) arrives on the
/// output channel. The exit receiver resolves once with the exit code.
pub struct PtySession {
    pid: Option<u32>,
    writer_tx: mpsc::Sender<Bytes>,
    output_rx: Option<mpsc::Receiver<Bytes>>,
    exit_rx: Option<oneshot::Receiver<i32>>,
    killer: Mutex<Option<Box<dyn ChildKiller + Send + Sync>>>,
    exited: Arc<AtomicBool>,
    exit_code: Arc<Mutex<Option<i32>>>,
}

impl fmt::Debug for PtySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtySession").field("pid", &self.pid).finish()
    }
}

impl PtySession {
    pub(crate) fn launch(
        mut child: Box<dyn Child + Send + Sync>,
        mut reader: Box<dyn Read + Send>,
        mut writer: Box<dyn Write + Send>,
    ) -> Self {
        let pid = child.process_id();
        let killer = child.clone_killer();

        let (writer_tx, mut writer_rx) = mpsc::channel::<Bytes>(128);
        let (output_tx, output_rx) = mpsc::channel::<Bytes>(64);

        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 8_192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            break;
                        }
                    }
                    Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(ref err) if err.kind() == ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(5));
                        continue;
                    }
                    Err(_) => break,
                }
            }
        });

        tokio::spawn(async move {
            while let Some(bytes) = writer_rx.recv().await {
                if writer.write_all(&bytes).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        let (exit_tx, exit_rx) = oneshot::channel::<i32>();
        let exited = Arc::new(AtomicBool::new(false));
        let exit_code = Arc::new(Mutex::new(None));
        let wait_exited = Arc::clone(&exited);
        let wait_exit_code = Arc::clone(&exit_code);
        tokio::task::spawn_blocking(move || {
            let code = match child.wait() {
                Ok(status) => status.exit_code() as i32,
                Err(_) => -1,
            };
            wait_exited.store(true, Ordering::SeqCst);
            *wait_exit_code.lock().unwrap_or_else(PoisonError::into_inner) = Some(code);
            debug!(code, "pseudo-terminal child exited");
            let _ = exit_tx.send(code);
        });

        Self {
            pid,
            writer_tx,
            output_rx: Some(output_rx),
            exit_rx: Some(exit_rx),
            killer: Mutex::new(Some(killer)),
            exited,
            exit_code,
        }
    }

    /// OS process id of the child, when the platform reports one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Channel sender for writing raw bytes to the child's terminal input.
    pub fn writer_sender(&self) -> mpsc::Sender<Bytes> {
        self.writer_tx.clone()
    }

    /// Take the merged output channel. Yields `None` after first call.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<Bytes>> {
        self.output_rx.take()
    }

    /// Take the exit-code receiver. Yields `None` after first call.
    pub fn take_exit(&mut self) -> Option<oneshot::Receiver<i32>> {
        self.exit_rx.take()
    }

    /// True once the child has exited.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Exit code, once known.
    pub fn exit_code(&self) -> Option<i32> {
        *self
            .exit_code
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Terminate the child. Idempotent; tolerates an already-exited child.
    pub fn kill(&self) -> std::io::Result<()> {
        let killer = self
            .killer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match killer {
            Some(mut killer) => killer.kill(),
            None => Ok(()),
        }
    }
}
