//! Logging module: durable, ordered records from many concurrent producers
//!
//! Records are written by a single writer thread draining a bounded buffer,
//! so the log never interleaves partial lines and never drops a record.
//! Forked workers reach the same buffer through a [`Relay`].

mod pipeline;
mod record;
mod relay;
mod sink;

pub use pipeline::{LogError, LogPipeline, Logger, WRITER_THREAD_NAME};
pub use record::LogRecord;
pub use relay::Relay;
pub use sink::{FileSink, LogSink, MemorySink};
