// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stream bindings for spawned processes.
//!
//! Binding resolution happens in two steps: before spawn, each binding is
//! turned into a [`Stdio`] for the command; after spawn, piped streams get a
//! reader (or writer) task attached. Reader tasks own their descriptor and
//! close it exactly once, when the stream reaches EOF or the child exits.

use crate::{
    errors::{CompanionError, CompanionResult},
    operation::{Operation, Resolver},
};
use bytes::{Bytes, BytesMut};
use camino::Utf8PathBuf;
use std::{
    fmt,
    process::Stdio,
    sync::{Arc, Mutex},
};
use tokio::{
    io::AsyncReadExt,
    process::{Child, ChildStdin, Command},
    sync::oneshot,
};

/// The size of each read chunk. This is the (normal) page size on most
/// systems the companion runs on.
const CHUNK_SIZE: usize = 4 * 1024;

/// A consumer of bytes pushed from a process stream as they arrive.
pub trait DataConsumer: Send + Sync {
    /// Called with each chunk of data, in order.
    fn consume(&self, data: Bytes);

    /// Called exactly once, after the final chunk.
    fn end_of_input(&self) {}
}

/// A [`DataConsumer`] that accumulates everything in memory.
#[derive(Clone, Default)]
pub struct MemoryConsumer {
    buffer: Arc<Mutex<BytesMut>>,
}

impl MemoryConsumer {
    /// Creates an empty consumer.
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of the bytes consumed so far.
    pub fn contents(&self) -> Bytes {
        self.buffer
            .lock()
            .expect("memory consumer lock poisoned")
            .clone()
            .freeze()
    }
}

impl DataConsumer for MemoryConsumer {
    fn consume(&self, data: Bytes) {
        self.buffer
            .lock()
            .expect("memory consumer lock poisoned")
            .extend_from_slice(&data);
    }
}

/// Where a child's stdin comes from.
#[derive(Clone)]
pub enum StdinSource {
    /// No input; the child sees EOF immediately.
    Null,
    /// A fixed buffer fed to the child, then EOF.
    Data(Bytes),
    /// Input redirected from a file on the host.
    File(Utf8PathBuf),
    /// A pipe whose writing end is handed to the caller via
    /// [`Process::take_stdin_writer`](super::Process::take_stdin_writer).
    Stream,
}

impl fmt::Debug for StdinSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StdinSource::Null => "Null",
            StdinSource::Data(_) => "Data",
            StdinSource::File(_) => "File",
            StdinSource::Stream => "Stream",
        };
        f.write_str(s)
    }
}

/// Where a child's stdout or stderr goes.
#[derive(Clone)]
pub enum OutputSink {
    /// Discard.
    Null,
    /// Redirect to a file, created if absent.
    File(Utf8PathBuf),
    /// Accumulate in memory; delivered as a byte buffer when the stream
    /// closes.
    Bytes,
    /// As [`Bytes`](OutputSink::Bytes); callers read it as UTF-8 text.
    Text,
    /// Push chunks to a consumer as they arrive.
    Consumer(Arc<dyn DataConsumer>),
    /// As [`Consumer`](OutputSink::Consumer), framed on `\n`. Lines are
    /// delivered without their terminator; an unterminated remainder is
    /// flushed at EOF.
    LineConsumer(Arc<dyn Fn(Bytes) + Send + Sync>),
    /// Line-framed forwarding to the structured logger at the given level.
    Logger(tracing::Level),
}

impl OutputSink {
    /// Convenience constructor for [`OutputSink::Consumer`].
    pub fn consumer(consumer: impl DataConsumer + 'static) -> Self {
        OutputSink::Consumer(Arc::new(consumer))
    }

    /// Convenience constructor for [`OutputSink::LineConsumer`].
    pub fn line_consumer(f: impl Fn(Bytes) + Send + Sync + 'static) -> Self {
        OutputSink::LineConsumer(Arc::new(f))
    }
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutputSink::Null => "Null",
            OutputSink::File(_) => "File",
            OutputSink::Bytes => "Bytes",
            OutputSink::Text => "Text",
            OutputSink::Consumer(_) => "Consumer",
            OutputSink::LineConsumer(_) => "LineConsumer",
            OutputSink::Logger(_) => "Logger",
        };
        f.write_str(s)
    }
}

/// Splits a byte stream into `\n`-framed lines.
#[derive(Default)]
pub struct LineBuffer {
    pending: BytesMut,
}

impl LineBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk, invoking `emit` once per completed line.
    pub fn push(&mut self, chunk: &[u8], mut emit: impl FnMut(Bytes)) {
        use bstr::ByteSlice;

        self.pending.extend_from_slice(chunk);
        while let Some(pos) = self.pending.find_byte(b'\n') {
            let mut line = self.pending.split_to(pos + 1);
            line.truncate(line.len() - 1);
            emit(line.freeze());
        }
    }

    /// Flushes the unterminated remainder, if any.
    pub fn flush(&mut self, mut emit: impl FnMut(Bytes)) {
        if !self.pending.is_empty() {
            emit(self.pending.split().freeze());
        }
    }
}

pub(super) enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn name(&self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

pub(super) enum StdinAttach {
    Inert,
    FeedData(Bytes),
    HandOff,
}

/// Resolves a stdin binding into the command's `Stdio`, returning what is
/// left to do after spawn.
pub(super) fn attach_stdin(
    source: &StdinSource,
    command: &mut Command,
) -> CompanionResult<StdinAttach> {
    match source {
        StdinSource::Null => {
            command.stdin(Stdio::null());
            Ok(StdinAttach::Inert)
        }
        StdinSource::File(path) => {
            let file = std::fs::File::open(path)
                .map_err(|error| CompanionError::io_path("opening stdin file", path, error))?;
            command.stdin(Stdio::from(file));
            Ok(StdinAttach::Inert)
        }
        StdinSource::Data(bytes) => {
            command.stdin(Stdio::piped());
            Ok(StdinAttach::FeedData(bytes.clone()))
        }
        StdinSource::Stream => {
            command.stdin(Stdio::piped());
            Ok(StdinAttach::HandOff)
        }
    }
}

/// Completes stdin attachment after spawn. Returns the writer to hand to the
/// caller when the binding was [`StdinSource::Stream`].
pub(super) fn finish_stdin(attach: StdinAttach, child: &mut Child) -> Option<ChildStdin> {
    match attach {
        StdinAttach::Inert => None,
        StdinAttach::HandOff => child.stdin.take(),
        StdinAttach::FeedData(bytes) => {
            if let Some(mut stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    use tokio::io::AsyncWriteExt;
                    // A child that closes stdin early produces a broken pipe;
                    // that is the child's business, not ours.
                    let _ = stdin.write_all(&bytes).await;
                    let _ = stdin.shutdown().await;
                });
            }
            None
        }
    }
}

pub(super) enum OutputAttach {
    Inert,
    Read(ReadMode),
}

pub(super) enum ReadMode {
    Accumulate,
    Consumer(Arc<dyn DataConsumer>),
    Lines(Arc<dyn Fn(Bytes) + Send + Sync>),
    Logger(tracing::Level),
}

/// Resolves an output binding into the command's `Stdio`.
pub(super) fn attach_output(
    sink: &OutputSink,
    command: &mut Command,
    stream: Stream,
) -> CompanionResult<OutputAttach> {
    let stdio = |command: &mut Command, stdio: Stdio| match stream {
        Stream::Stdout => {
            command.stdout(stdio);
        }
        Stream::Stderr => {
            command.stderr(stdio);
        }
    };
    match sink {
        OutputSink::Null => {
            stdio(command, Stdio::null());
            Ok(OutputAttach::Inert)
        }
        OutputSink::File(path) => {
            let file = std::fs::File::create(path).map_err(|error| {
                CompanionError::io_path("creating output file", path, error)
            })?;
            stdio(command, Stdio::from(file));
            Ok(OutputAttach::Inert)
        }
        OutputSink::Bytes | OutputSink::Text => {
            stdio(command, Stdio::piped());
            Ok(OutputAttach::Read(ReadMode::Accumulate))
        }
        OutputSink::Consumer(consumer) => {
            stdio(command, Stdio::piped());
            Ok(OutputAttach::Read(ReadMode::Consumer(Arc::clone(consumer))))
        }
        OutputSink::LineConsumer(f) => {
            stdio(command, Stdio::piped());
            Ok(OutputAttach::Read(ReadMode::Lines(Arc::clone(f))))
        }
        OutputSink::Logger(level) => {
            stdio(command, Stdio::piped());
            Ok(OutputAttach::Read(ReadMode::Logger(*level)))
        }
    }
}

/// A supervised output stream.
#[derive(Clone)]
pub(super) struct AttachedOutput {
    captured: Option<Operation<Bytes>>,
    closed: Arc<Mutex<Option<oneshot::Receiver<()>>>>,
    closed_flag: Arc<Mutex<bool>>,
}

impl AttachedOutput {
    pub(super) fn inert() -> Self {
        Self {
            captured: None,
            closed: Arc::new(Mutex::new(None)),
            closed_flag: Arc::new(Mutex::new(true)),
        }
    }

    pub(super) fn captured(&self) -> Option<Operation<Bytes>> {
        self.captured.clone()
    }

    /// Waits until the reader task has observed EOF and flushed its sink.
    pub(super) async fn closed(&self) {
        let receiver = {
            let mut slot = self.closed.lock().expect("closed lock poisoned");
            slot.take()
        };
        match receiver {
            Some(receiver) => {
                let _ = receiver.await;
                *self.closed_flag.lock().expect("closed flag poisoned") = true;
            }
            None => {
                // Either never attached, or another waiter drained the
                // receiver; poll the flag.
                while !*self.closed_flag.lock().expect("closed flag poisoned") {
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
            }
        }
    }
}

pub(super) enum PipeReader {
    Stdout(tokio::process::ChildStdout),
    Stderr(tokio::process::ChildStderr),
}

impl PipeReader {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            PipeReader::Stdout(pipe) => pipe.read(buf).await,
            PipeReader::Stderr(pipe) => pipe.read(buf).await,
        }
    }
}

/// Spawns the reader task for a piped output stream.
pub(super) fn finish_output(
    attach: OutputAttach,
    pipe: Option<PipeReader>,
    command: &str,
) -> AttachedOutput {
    let mode = match attach {
        OutputAttach::Inert => return AttachedOutput::inert(),
        OutputAttach::Read(mode) => mode,
    };
    let Some(mut pipe) = pipe else {
        return AttachedOutput::inert();
    };
    let (captured_resolver, captured): (Option<Resolver<Bytes>>, Option<Operation<Bytes>>) =
        match mode {
            ReadMode::Accumulate => {
                let (resolver, operation) = Operation::resolver("captured-output");
                (Some(resolver), Some(operation))
            }
            _ => (None, None),
        };
    let (closed_tx, closed_rx) = oneshot::channel();
    let command = command.to_owned();
    tokio::spawn(async move {
        let mut accumulated = BytesMut::new();
        let mut lines = LineBuffer::new();
        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            match pipe.read_chunk(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&chunk[..n]);
                    match &mode {
                        ReadMode::Accumulate => accumulated.extend_from_slice(&data),
                        ReadMode::Consumer(consumer) => consumer.consume(data),
                        ReadMode::Lines(f) => lines.push(&data, |line| f(line)),
                        ReadMode::Logger(level) => {
                            lines.push(&data, |line| log_line(*level, &command, &line));
                        }
                    }
                }
                Err(error) => {
                    tracing::debug!(command = %command, %error, "output stream read failed");
                    break;
                }
            }
        }
        match &mode {
            ReadMode::Accumulate => {
                if let Some(resolver) = captured_resolver {
                    resolver.resolve(accumulated.freeze());
                }
            }
            ReadMode::Consumer(consumer) => consumer.end_of_input(),
            ReadMode::Lines(f) => lines.flush(|line| f(line)),
            ReadMode::Logger(level) => lines.flush(|line| log_line(*level, &command, &line)),
        }
        let _ = closed_tx.send(());
    });
    AttachedOutput {
        captured,
        closed: Arc::new(Mutex::new(Some(closed_rx))),
        closed_flag: Arc::new(Mutex::new(false)),
    }
}

fn log_line(level: tracing::Level, command: &str, line: &[u8]) {
    let text = String::from_utf8_lossy(line);
    match level {
        tracing::Level::ERROR => tracing::error!(command, "{text}"),
        tracing::Level::WARN => tracing::warn!(command, "{text}"),
        tracing::Level::INFO => tracing::info!(command, "{text}"),
        tracing::Level::DEBUG => tracing::debug!(command, "{text}"),
        tracing::Level::TRACE => tracing::trace!(command, "{text}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_frames_and_flushes() {
        let mut buffer = LineBuffer::new();
        let mut lines = Vec::new();
        buffer.push(b"alpha\nbra", |line| lines.push(line));
        buffer.push(b"vo\ncharlie", |line| lines.push(line));
        buffer.flush(|line| lines.push(line));
        let lines: Vec<&[u8]> = lines.iter().map(|l| l.as_ref()).collect();
        assert_eq!(lines, vec![&b"alpha"[..], b"bravo", b"charlie"]);
    }

    #[test]
    fn line_buffer_handles_empty_lines() {
        let mut buffer = LineBuffer::new();
        let mut count = 0;
        buffer.push(b"\n\n", |_| count += 1);
        buffer.flush(|_| count += 1);
        assert_eq!(count, 2);
    }

    #[test]
    fn memory_consumer_accumulates() {
        let consumer = MemoryConsumer::new();
        consumer.consume(Bytes::from_static(b"ab"));
        consumer.consume(Bytes::from_static(b"cd"));
        assert_eq!(&consumer.contents()[..], b"abcd");
    }
}
