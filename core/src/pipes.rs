use core::fmt;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use async_trait::async_trait;
use bytes::Bytes;
use encoding_rs::Encoding;
use futures::StreamExt;
use futures::future::join_all;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::command::Command;
use crate::error::CommandError;
use crate::exec::CancellationPolicy;
use crate::lines::LineDecoder;
use crate::lines::default_output_encoding;
use crate::result::ExecutionResult;

const COPY_BUF_SIZE: usize = 8_192;

type SharedReader = Arc<Mutex<Option<Box<dyn AsyncRead + Send + Unpin>>>>;
type SharedWriter = Arc<Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>>;

/// Receives every decoded line of one output stream.
#[async_trait]
pub trait LineHandler: Send + Sync {
    async fn on_line(&self, line: String);
}

struct FnLineHandler<F>(F);

#[async_trait]
impl<F> LineHandler for FnLineHandler<F>
where
    F: Fn(String) + Send + Sync,
{
    async fn on_line(&self, line: String) {
        (self.0)(line);
    }
}

/// Shared, clonable byte accumulator for in-memory pipe targets.
#[derive(Clone, Default)]
pub struct MemoryBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl MemoryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the accumulated bytes.
    pub fn contents(&self) -> Vec<u8> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Decode the accumulated bytes with the given encoding.
    pub fn text(&self, encoding: &'static Encoding) -> String {
        let bytes = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        encoding.decode(&bytes).0.into_owned()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, chunk: &[u8]) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(chunk);
    }
}

impl fmt::Debug for MemoryBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBuffer").field("len", &self.len()).finish()
    }
}

/// Where a process's standard input comes from.
#[derive(Clone, Default)]
pub struct PipeSource {
    kind: SourceKind,
}

#[derive(Clone, Default)]
enum SourceKind {
    #[default]
    Null,
    Memory(Bytes),
    File(PathBuf),
    /// One-shot: the reader is taken by the first run that uses it.
    Reader(SharedReader),
    /// Output of another command, executed and validated as part of the copy.
    Command(Box<Command>),
}

impl fmt::Debug for PipeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            SourceKind::Null => "null",
            SourceKind::Memory(_) => "memory",
            SourceKind::File(_) => "file",
            SourceKind::Reader(_) => "reader",
            SourceKind::Command(_) => "command",
        };
        f.debug_struct("PipeSource").field("kind", &kind).finish()
    }
}

/// Where a process's standard output or error goes.
#[derive(Clone, Default)]
pub struct PipeTarget {
    kind: TargetKind,
}

#[derive(Clone, Default)]
enum TargetKind {
    #[default]
    Null,
    Buffer(MemoryBuffer),
    /// The file is created when the copy for a run starts, never at
    /// configuration time.
    File(PathBuf),
    /// One-shot: the writer is taken by the first run, then shut down and
    /// released when the copy completes.
    Writer(SharedWriter),
    LineDelegate {
        handler: Arc<dyn LineHandler>,
        encoding: &'static Encoding,
    },
    /// Flattened fan-out; never nested, never contains null members.
    Merge(Vec<PipeTarget>),
}

impl fmt::Debug for PipeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            TargetKind::Null => "null",
            TargetKind::Buffer(_) => "buffer",
            TargetKind::File(_) => "file",
            TargetKind::Writer(_) => "writer",
            TargetKind::LineDelegate { .. } => "line-delegate",
            TargetKind::Merge(children) => {
                return f
                    .debug_struct("PipeTarget")
                    .field("kind", &"merge")
                    .field("members", &children.len())
                    .finish();
            }
        };
        f.debug_struct("PipeTarget").field("kind", &kind).finish()
    }
}

impl PipeSource {
    /// Discard: provides no input.
    pub fn null() -> Self {
        Self {
            kind: SourceKind::Null,
        }
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            kind: SourceKind::Memory(bytes.into()),
        }
    }

    pub fn from_text(text: impl AsRef<str>) -> Self {
        Self::from_text_with_encoding(text, default_output_encoding())
    }

    pub fn from_text_with_encoding(text: impl AsRef<str>, encoding: &'static Encoding) -> Self {
        let (encoded, _, _) = encoding.encode(text.as_ref());
        Self::from_bytes(encoded.into_owned())
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: SourceKind::File(path.into()),
        }
    }

    /// A one-shot stream source; consumed by a single run.
    pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            kind: SourceKind::Reader(Arc::new(Mutex::new(Some(Box::new(reader))))),
        }
    }

    /// The standard output of another command. The upstream command is
    /// spawned when the copy runs, awaited for completion, and validated by
    /// its own rules before the copy is considered done.
    pub fn from_command(command: Command) -> Self {
        Self {
            kind: SourceKind::Command(Box::new(command)),
        }
    }

    pub(crate) fn is_null(&self) -> bool {
        matches!(self.kind, SourceKind::Null)
    }

    /// Copy this source's content into `dest`. A fired cancellation token
    /// ends the copy cleanly; the caller decides whether that is an error.
    pub(crate) fn copy_into<'a>(
        &'a self,
        dest: &'a mut (dyn AsyncWrite + Send + Unpin),
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), CommandError>> + Send + 'a>> {
        Box::pin(async move {
        match &self.kind {
            SourceKind::Null => Ok(()),
            SourceKind::Memory(bytes) => copy_bytes(bytes, dest, cancel).await,
            SourceKind::File(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                copy_reader(&mut file, dest, cancel).await
            }
            SourceKind::Reader(slot) => {
                let reader = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                match reader {
                    Some(mut reader) => copy_reader(&mut *reader, dest, cancel).await,
                    None => Err(CommandError::Pipe {
                        source: io::Error::other("stream pipe source was already consumed"),
                    }),
                }
            }
            SourceKind::Command(command) => {
                let (mut reader, writer) = tokio::io::duplex(COPY_BUF_SIZE);
                let upstream = (**command).clone().stdout(PipeTarget::from_writer(writer));
                let policy = CancellationPolicy::default().with_forceful(cancel.child_token());
                let upstream_run: Pin<
                    Box<dyn Future<Output = Result<ExecutionResult, CommandError>> + Send>,
                > = Box::pin(async move { upstream.execute(policy).await });
                let pump = copy_reader(&mut reader, dest, cancel);
                let (upstream_result, pump_result) = tokio::join!(upstream_run, pump);
                upstream_result?;
                pump_result
            }
        }
        })
    }
}

impl PipeTarget {
    /// Discard: consumes and drops all bytes.
    pub fn null() -> Self {
        Self {
            kind: TargetKind::Null,
        }
    }

    pub fn to_buffer(buffer: &MemoryBuffer) -> Self {
        Self {
            kind: TargetKind::Buffer(buffer.clone()),
        }
    }

    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: TargetKind::File(path.into()),
        }
    }

    /// A one-shot stream target; the writer is shut down when the run's copy
    /// completes.
    pub fn from_writer(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            kind: TargetKind::Writer(Arc::new(Mutex::new(Some(Box::new(writer))))),
        }
    }

    /// Invoke a callback for every decoded line, using the default encoding.
    pub fn on_line<F>(callback: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        Self::line_handler(Arc::new(FnLineHandler(callback)), default_output_encoding())
    }

    pub fn line_handler(handler: Arc<dyn LineHandler>, encoding: &'static Encoding) -> Self {
        Self {
            kind: TargetKind::LineDelegate { handler, encoding },
        }
    }

    /// Fan out to several targets. The aggregate is flattened and no-op
    /// members are dropped before use; an empty aggregate collapses to null
    /// and a single member is used directly.
    pub fn merge(targets: impl IntoIterator<Item = PipeTarget>) -> Self {
        fn flatten(target: PipeTarget, flat: &mut Vec<PipeTarget>) {
            match target.kind {
                TargetKind::Null => {}
                TargetKind::Merge(children) => {
                    for child in children {
                        flatten(child, flat);
                    }
                }
                _ => flat.push(target),
            }
        }

        let mut flat = Vec::new();
        for target in targets {
            flatten(target, &mut flat);
        }
        if flat.is_empty() {
            return Self::null();
        }
        if flat.len() == 1 {
            return flat.remove(0);
        }
        Self {
            kind: TargetKind::Merge(flat),
        }
    }

    pub(crate) fn is_null(&self) -> bool {
        matches!(self.kind, TargetKind::Null)
    }

    /// Copy everything from `reader` into this target. A fired cancellation
    /// token ends the copy cleanly.
    pub(crate) fn consume<'a>(
        &'a self,
        reader: &'a mut (dyn AsyncRead + Send + Unpin),
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), CommandError>> + Send + 'a>> {
        Box::pin(async move {
        match &self.kind {
            TargetKind::Null => drain(reader, cancel).await,
            TargetKind::Buffer(buffer) => {
                let mut buf = [0u8; COPY_BUF_SIZE];
                loop {
                    let n = read_or_cancel(reader, &mut buf, cancel).await?;
                    if n == 0 {
                        return Ok(());
                    }
                    buffer.push(&buf[..n]);
                }
            }
            TargetKind::File(path) => {
                // Created now, when the run's copy begins — not when the
                // target was configured.
                let mut file = tokio::fs::File::create(path).await?;
                copy_reader(reader, &mut file, cancel).await?;
                file.flush().await?;
                Ok(())
            }
            TargetKind::Writer(slot) => {
                let writer = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                match writer {
                    Some(mut writer) => {
                        copy_reader(reader, &mut *writer, cancel).await?;
                        let _ = writer.shutdown().await;
                        Ok(())
                    }
                    None => Err(CommandError::Pipe {
                        source: io::Error::other("stream pipe target was already consumed"),
                    }),
                }
            }
            TargetKind::LineDelegate { handler, encoding } => {
                let mut decoder = LineDecoder::new(encoding);
                let mut buf = [0u8; COPY_BUF_SIZE];
                loop {
                    let n = read_or_cancel(reader, &mut buf, cancel).await?;
                    if n == 0 {
                        break;
                    }
                    for line in decoder.feed(&buf[..n]) {
                        handler.on_line(line).await;
                    }
                }
                for line in decoder.finish() {
                    handler.on_line(line).await;
                }
                Ok(())
            }
            TargetKind::Merge(children) => fan_out(children, reader, cancel).await,
        }
        })
    }
}

/// Replicate every chunk from `reader` to all children.
///
/// Each child gets an independent single-slot relay; the shared read loop
/// fills one chunk and hands it to each relay in turn, so the slowest child
/// back-pressures the read. End-of-stream is signalled explicitly by dropping
/// the relay senders, and the fan-out completes only once every child's copy
/// has completed — not merely when the read loop ends.
async fn fan_out(
    children: &[PipeTarget],
    reader: &mut (dyn AsyncRead + Send + Unpin),
    cancel: &CancellationToken,
) -> Result<(), CommandError> {
    let mut senders = Vec::with_capacity(children.len());
    let mut consumers = Vec::with_capacity(children.len());
    for child in children {
        let (tx, rx) = mpsc::channel::<Bytes>(1);
        senders.push(tx);
        consumers.push(async move {
            let mut relay = StreamReader::new(ReceiverStream::new(rx).map(Ok::<Bytes, io::Error>));
            child.consume(&mut relay, cancel).await
        });
    }

    let pump = async move {
        let mut buf = [0u8; COPY_BUF_SIZE];
        loop {
            let n = read_or_cancel(reader, &mut buf, cancel).await?;
            if n == 0 {
                break;
            }
            let chunk = Bytes::copy_from_slice(&buf[..n]);
            for tx in &senders {
                // A child that failed has dropped its receiver; the rest
                // still get the chunk.
                let _ = tx.send(chunk.clone()).await;
            }
        }
        drop(senders);
        Ok::<(), CommandError>(())
    };

    let (pump_result, child_results) = tokio::join!(pump, join_all(consumers));
    pump_result?;
    for result in child_results {
        result?;
    }
    Ok(())
}

async fn read_or_cancel(
    reader: &mut (dyn AsyncRead + Send + Unpin),
    buf: &mut [u8],
    cancel: &CancellationToken,
) -> Result<usize, CommandError> {
    tokio::select! {
        _ = cancel.cancelled() => Ok(0),
        read = reader.read(buf) => Ok(read?),
    }
}

async fn copy_reader(
    reader: &mut (dyn AsyncRead + Send + Unpin),
    dest: &mut (dyn AsyncWrite + Send + Unpin),
    cancel: &CancellationToken,
) -> Result<(), CommandError> {
    let mut buf = [0u8; COPY_BUF_SIZE];
    loop {
        let n = read_or_cancel(reader, &mut buf, cancel).await?;
        if n == 0 {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            written = dest.write_all(&buf[..n]) => written?,
        }
    }
    if cancel.is_cancelled() {
        return Ok(());
    }
    dest.flush().await?;
    Ok(())
}

async fn copy_bytes(
    bytes: &Bytes,
    dest: &mut (dyn AsyncWrite + Send + Unpin),
    cancel: &CancellationToken,
) -> Result<(), CommandError> {
    for chunk in bytes.chunks(COPY_BUF_SIZE) {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            written = dest.write_all(chunk) => written?,
        }
    }
    dest.flush().await?;
    Ok(())
}

async fn drain(
    reader: &mut (dyn AsyncRead + Send + Unpin),
    cancel: &CancellationToken,
) -> Result<(), CommandError> {
    let mut buf = [0u8; COPY_BUF_SIZE];
    loop {
        let n = read_or_cancel(reader, &mut buf, cancel).await?;
        if n == 0 {
            return Ok(());
        }
    }
}
