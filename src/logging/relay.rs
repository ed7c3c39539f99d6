//! Records from forked workers, back into the parent's pipeline
//!
//! A child has no writer thread of its own. It writes each record as one
//! line to its end of a socket pair ([`Logger::relay`]); a relay thread in
//! the parent reads those lines and `put`s them into the pipeline's buffer,
//! so the pipeline's writer stays the only thread appending to the sink.

use std::io::{self, BufRead, BufReader};
use std::os::unix::net::UnixStream;
use std::thread::{self, JoinHandle};

use super::pipeline::Logger;
use super::record::LogRecord;

/// Parent end of one child's record stream.
pub struct Relay {
    handle: JoinHandle<u64>,
}

impl Relay {
    /// Forward every line read from `source` into `logger` until the child
    /// closes its end (by exiting, whichever way).
    pub fn spawn(name: String, source: UnixStream, logger: Logger) -> io::Result<Self> {
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || forward(source, &logger))?;
        Ok(Self { handle })
    }

    /// Wait for end-of-stream; returns how many records were forwarded.
    pub fn join(self) -> u64 {
        self.handle.join().unwrap_or_else(|_| {
            tracing::error!("log relay panicked");
            0
        })
    }
}

fn forward(source: UnixStream, logger: &Logger) -> u64 {
    let mut reader = BufReader::new(source);
    let mut line = Vec::new();
    let mut forwarded = 0;

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {
                let record = LogRecord::raw(String::from_utf8_lossy(&line));
                if let Err(err) = logger.submit(record) {
                    tracing::warn!(error = %err, "relayed record dropped");
                    break;
                }
                forwarded += 1;
            }
            Err(err) => {
                tracing::warn!(error = %err, "cannot read relayed records");
                break;
            }
        }
    }
    forwarded
}
