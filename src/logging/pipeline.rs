//! Asynchronous log pipeline: many producers, one writer.
//!
//! Producers format a [`LogRecord`] and `put` it into a shared
//! [`BoundedBuffer`]; a single consumer thread `take`s records in slot order
//! and appends them to the sink. A full buffer blocks producers (no record is
//! dropped); stopping the pipeline closes the buffer, the writer drains
//! whatever was already accepted, then exits.

use std::io::{self, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use super::record::LogRecord;
use super::sink::LogSink;
use crate::core::BoundedBuffer;

/// Name of the writer thread.
pub const WRITER_THREAD_NAME: &str = "turnstile-log";

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("log buffer capacity must be at least 1")]
    ZeroCapacity,
    #[error("failed to start log writer thread")]
    Spawn(#[source] io::Error),
    #[error("cannot write to log sink {sink}")]
    Write {
        sink: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot flush log sink {sink}")]
    Flush {
        sink: String,
        #[source]
        source: io::Error,
    },
    #[error("log writer thread panicked")]
    WriterPanicked,
    #[error("cannot forward record to the parent's log pipeline")]
    Relay(#[source] io::Error),
    #[error("log pipeline is closed")]
    Closed,
    #[error("log pipeline already failed: {0}")]
    Failed(String),
}

type FatalHook = Box<dyn Fn(&LogError) + Send + 'static>;

/// Cloneable producer handle.
#[derive(Clone)]
pub struct Logger {
    target: Target,
}

#[derive(Clone)]
enum Target {
    Buffered(Arc<BoundedBuffer<LogRecord>>),
    Direct(Arc<dyn LogSink>),
    Relay(Arc<UnixStream>),
    Disabled,
}

impl Logger {
    /// Logger writing synchronously to `sink`, bypassing any buffer.
    /// For embedding sessions without a pipeline.
    pub fn direct(sink: Arc<dyn LogSink>) -> Self {
        Self {
            target: Target::Direct(sink),
        }
    }

    /// Logger sending each record as one line over `stream`, to be fed into
    /// a pipeline by a [`Relay`](super::Relay) on the other end.
    ///
    /// Used by forked workers. Takes no lock, so it is safe to use in a
    /// child forked from a multi-threaded parent.
    pub fn relay(stream: UnixStream) -> Self {
        Self {
            target: Target::Relay(Arc::new(stream)),
        }
    }

    /// Logger that discards everything.
    pub fn disabled() -> Self {
        Self {
            target: Target::Disabled,
        }
    }

    /// Stamp `message` and submit it. Blocks while the buffer is full.
    pub fn log(&self, message: impl AsRef<str>) -> Result<(), LogError> {
        if matches!(self.target, Target::Disabled) {
            return Ok(());
        }
        self.submit(LogRecord::new(message))
    }

    /// Submit a prebuilt record.
    pub fn submit(&self, record: LogRecord) -> Result<(), LogError> {
        match &self.target {
            Target::Buffered(buffer) => buffer.put(record).map_err(|_| LogError::Closed),
            Target::Direct(sink) => sink.append(record.as_bytes()).map_err(|source| {
                LogError::Write {
                    sink: sink.describe(),
                    source,
                }
            }),
            Target::Relay(stream) => (&**stream)
                .write_all(record.as_bytes())
                .map_err(LogError::Relay),
            Target::Disabled => Ok(()),
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self.target, Target::Disabled)
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.target {
            Target::Buffered(_) => "buffered",
            Target::Direct(_) => "direct",
            Target::Relay(_) => "relay",
            Target::Disabled => "disabled",
        };
        f.debug_struct("Logger").field("target", &kind).finish()
    }
}

enum WriterState {
    Running(JoinHandle<Result<u64, LogError>>),
    Stopped(Result<u64, String>),
}

/// Owner of the log buffer and its writer thread.
pub struct LogPipeline {
    buffer: Arc<BoundedBuffer<LogRecord>>,
    sink: Arc<dyn LogSink>,
    written: Arc<AtomicU64>,
    writer: Mutex<WriterState>,
}

impl LogPipeline {
    /// Start the writer thread over a buffer of `capacity` records.
    pub fn start(sink: Arc<dyn LogSink>, capacity: usize) -> Result<Self, LogError> {
        Self::spawn(sink, capacity, None)
    }

    /// Like [`start`](Self::start), calling `on_fatal` from the writer thread
    /// if the sink fails persistently.
    pub fn start_with_fatal_hook<F>(
        sink: Arc<dyn LogSink>,
        capacity: usize,
        on_fatal: F,
    ) -> Result<Self, LogError>
    where
        F: Fn(&LogError) + Send + 'static,
    {
        Self::spawn(sink, capacity, Some(Box::new(on_fatal)))
    }

    fn spawn(
        sink: Arc<dyn LogSink>,
        capacity: usize,
        on_fatal: Option<FatalHook>,
    ) -> Result<Self, LogError> {
        if capacity == 0 {
            return Err(LogError::ZeroCapacity);
        }

        let buffer = Arc::new(BoundedBuffer::new(capacity));
        let written = Arc::new(AtomicU64::new(0));

        let handle = thread::Builder::new()
            .name(WRITER_THREAD_NAME.to_string())
            .spawn({
                let buffer = Arc::clone(&buffer);
                let sink = Arc::clone(&sink);
                let written = Arc::clone(&written);
                move || run_writer(&buffer, sink.as_ref(), &written, on_fatal)
            })
            .map_err(LogError::Spawn)?;

        Ok(Self {
            buffer,
            sink,
            written,
            writer: Mutex::new(WriterState::Running(handle)),
        })
    }

    /// Producer handle feeding this pipeline.
    pub fn logger(&self) -> Logger {
        Logger {
            target: Target::Buffered(Arc::clone(&self.buffer)),
        }
    }

    /// The sink the writer appends to.
    pub fn sink(&self) -> Arc<dyn LogSink> {
        Arc::clone(&self.sink)
    }

    pub fn records_written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    /// Records accepted but not yet written.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Stop accepting records, wait for the writer to drain everything
    /// already accepted, and return the total number written.
    ///
    /// Idempotent: later calls return the first outcome.
    pub fn shutdown(&self) -> Result<u64, LogError> {
        self.buffer.close();

        let mut writer = self.writer.lock();
        let handle = match std::mem::replace(&mut *writer, WriterState::Stopped(Ok(0))) {
            WriterState::Running(handle) => handle,
            WriterState::Stopped(outcome) => {
                *writer = WriterState::Stopped(outcome.clone());
                return outcome.map_err(LogError::Failed);
            }
        };

        let outcome = handle.join().unwrap_or(Err(LogError::WriterPanicked));
        *writer = WriterState::Stopped(match &outcome {
            Ok(count) => Ok(*count),
            Err(err) => Err(err.to_string()),
        });
        outcome
    }
}

impl Drop for LogPipeline {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::error!(error = %err, "log pipeline stopped with an error");
        }
    }
}

fn run_writer(
    buffer: &BoundedBuffer<LogRecord>,
    sink: &dyn LogSink,
    written: &AtomicU64,
    on_fatal: Option<FatalHook>,
) -> Result<u64, LogError> {
    tracing::debug!(sink = %sink.describe(), "log writer started");

    let fail = |err: LogError| {
        // Producers must not block forever on a writer that is gone.
        buffer.close();
        tracing::error!(error = %err, "log writer failed");
        if let Some(hook) = &on_fatal {
            hook(&err);
        }
        Err(err)
    };

    while let Some(record) = buffer.take() {
        if let Err(source) = sink.append(record.as_bytes()) {
            return fail(LogError::Write {
                sink: sink.describe(),
                source,
            });
        }
        written.fetch_add(1, Ordering::AcqRel);
    }

    if let Err(source) = sink.flush() {
        return fail(LogError::Flush {
            sink: sink.describe(),
            source,
        });
    }

    let total = written.load(Ordering::Acquire);
    tracing::debug!(records = total, "log writer drained and stopped");
    Ok(total)
}
