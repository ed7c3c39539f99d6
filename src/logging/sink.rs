//! Durable append-only sinks for the log pipeline.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::core::MmapJournal;

/// Append-only byte sink.
///
/// `append` takes `&self`: the pipeline's single writer and, in process
/// mode, forked workers may append through the same sink.
pub trait LogSink: Send + Sync {
    /// Durably append `bytes` in full. Interrupted writes are retried;
    /// any error returned is persistent.
    fn append(&self, bytes: &[u8]) -> io::Result<()>;

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    /// Human-readable location, used in diagnostics.
    fn describe(&self) -> String;
}

/// Plain log file opened in append mode. Created if missing, never truncated.
pub struct FileSink {
    file: File,
    path: PathBuf,
}

impl FileSink {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for FileSink {
    fn append(&self, bytes: &[u8]) -> io::Result<()> {
        let mut file = &self.file;
        let mut written = 0;
        while written < bytes.len() {
            match file.write(&bytes[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "log file accepted no bytes",
                    ));
                }
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

impl LogSink for MmapJournal {
    fn append(&self, bytes: &[u8]) -> io::Result<()> {
        MmapJournal::append(self, bytes).map(|_| ())
    }

    fn flush(&self) -> io::Result<()> {
        MmapJournal::flush(self)
    }

    fn describe(&self) -> String {
        format!("mmap journal ({} bytes)", self.capacity())
    }
}

/// In-memory sink, handy for tests and for embedding without a file.
#[derive(Default)]
pub struct MemorySink {
    bytes: Mutex<Vec<u8>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Contents split into lines (without the trailing `\n`).
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.bytes.lock())
            .lines()
            .map(str::to_owned)
            .collect()
    }
}

impl LogSink for MemorySink {
    fn append(&self, bytes: &[u8]) -> io::Result<()> {
        self.bytes.lock().extend_from_slice(bytes);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
