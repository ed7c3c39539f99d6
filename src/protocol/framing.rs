//! Message framing over a blocking byte stream
//!
//! Reads into one pre-allocated buffer of `max_frame` bytes; frames are
//! handed out as borrowed slices, no per-message allocation.

use std::fmt;
use std::io::{self, Read};
use std::str::FromStr;

/// How application messages are delimited on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// One message per `\n`-terminated line.
    #[default]
    Line,
    /// Every successful read is one message.
    Raw,
}

impl Framing {
    /// Whether `frame` is exactly the terminator token.
    ///
    /// Line frames are compared without their `\n` / `\r\n` ending; raw
    /// frames must match byte for byte.
    pub fn is_terminator(self, frame: &[u8], token: &[u8]) -> bool {
        match self {
            Framing::Line => strip_line_ending(frame) == token,
            Framing::Raw => frame == token,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Framing::Line => "line",
            Framing::Raw => "raw",
        }
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "line" => Ok(Framing::Line),
            "raw" => Ok(Framing::Raw),
            other => Err(format!("unknown framing '{other}' (expected 'line' or 'raw')")),
        }
    }
}

/// Drop one trailing `\n` and then one trailing `\r`.
#[inline]
pub fn strip_line_ending(frame: &[u8]) -> &[u8] {
    let frame = frame.strip_suffix(b"\n").unwrap_or(frame);
    frame.strip_suffix(b"\r").unwrap_or(frame)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame exceeds {limit} bytes without a line ending")]
    TooLong { limit: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Pulls frames off a blocking reader.
pub struct FrameReader {
    framing: Framing,
    buffer: Box<[u8]>,
    start: usize,
    end: usize,
    eof: bool,
}

impl FrameReader {
    /// # Panics
    ///
    /// Panics if `max_frame` is 0.
    pub fn new(framing: Framing, max_frame: usize) -> Self {
        assert!(max_frame > 0, "max_frame must be at least 1");
        Self {
            framing,
            buffer: vec![0u8; max_frame].into_boxed_slice(),
            start: 0,
            end: 0,
            eof: false,
        }
    }

    #[inline]
    pub fn framing(&self) -> Framing {
        self.framing
    }

    #[inline]
    pub fn max_frame(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete frame, or `None` once the peer has closed its side.
    ///
    /// In line mode a final unterminated line before end-of-stream is
    /// delivered as a frame of its own. `Interrupted` reads are retried.
    pub fn next_frame<R: Read + ?Sized>(
        &mut self,
        reader: &mut R,
    ) -> Result<Option<&[u8]>, FrameError> {
        match self.framing {
            Framing::Raw => self.next_raw(reader),
            Framing::Line => self.next_line(reader),
        }
    }

    fn next_raw<R: Read + ?Sized>(&mut self, reader: &mut R) -> Result<Option<&[u8]>, FrameError> {
        if self.eof {
            return Ok(None);
        }
        let n = read_retrying(reader, &mut self.buffer)?;
        if n == 0 {
            self.eof = true;
            return Ok(None);
        }
        Ok(Some(&self.buffer[..n]))
    }

    fn next_line<R: Read + ?Sized>(
        &mut self,
        reader: &mut R,
    ) -> Result<Option<&[u8]>, FrameError> {
        loop {
            if let Some(pos) = self.buffer[self.start..self.end]
                .iter()
                .position(|&b| b == b'\n')
            {
                let frame = self.start..self.start + pos + 1;
                self.start = frame.end;
                return Ok(Some(&self.buffer[frame]));
            }

            if self.eof {
                if self.start == self.end {
                    return Ok(None);
                }
                let frame = self.start..self.end;
                self.start = self.end;
                return Ok(Some(&self.buffer[frame]));
            }

            let pending = self.end - self.start;
            if pending == self.buffer.len() {
                return Err(FrameError::TooLong {
                    limit: self.buffer.len(),
                });
            }

            if self.start > 0 {
                self.buffer.copy_within(self.start..self.end, 0);
                self.start = 0;
                self.end = pending;
            }

            let n = read_retrying(reader, &mut self.buffer[self.end..])?;
            if n == 0 {
                self.eof = true;
            } else {
                self.end += n;
            }
        }
    }
}

fn read_retrying<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(buf) {
            Ok(n) => return Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
