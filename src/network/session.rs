//! Per-connection echo protocol
//!
//! `Greeting → EchoLoop → Closing → Closed`. Every failure ends only the
//! connection it happened on; the caller's permit is released regardless.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::logging::Logger;
use crate::protocol::{welcome_message, FrameError, FrameReader, Framing};

/// Bidirectional byte stream a session runs over.
pub trait Duplex: Read + Write + Send {
    /// Shut both directions down. Called once, when the session ends.
    fn close(&mut self) -> io::Result<()>;
}

impl Duplex for TcpStream {
    fn close(&mut self) -> io::Result<()> {
        match TcpStream::shutdown(self, Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Greeting,
    EchoLoop,
    Closing,
    Closed,
}

/// Protocol parameters shared by every session of a service.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub terminator: String,
    pub framing: Framing,
    pub max_frame: usize,
    /// Emit one log record per echoed message.
    pub log_messages: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            terminator: crate::protocol::DEFAULT_TERMINATOR.to_string(),
            framing: Framing::Line,
            max_frame: 1024,
            log_messages: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("peer disconnected before sending the terminator")]
    PeerDisconnected,
    #[error("message exceeds {limit} bytes")]
    FrameTooLong { limit: usize },
    #[error("transport failed while {stage}")]
    Transport {
        stage: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("session panicked")]
    Panicked,
}

/// What a finished session did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub peer: SocketAddr,
    pub messages: u64,
    pub bytes_echoed: u64,
    pub duration: Duration,
}

pub struct Session<S: Duplex> {
    stream: S,
    peer: SocketAddr,
    config: Arc<SessionConfig>,
    logger: Logger,
    reader: FrameReader,
    state: SessionState,
    messages: u64,
    bytes_echoed: u64,
    started: Instant,
    traced: bool,
}

impl<S: Duplex> Session<S> {
    pub fn new(stream: S, peer: SocketAddr, config: Arc<SessionConfig>, logger: Logger) -> Self {
        let reader = FrameReader::new(config.framing, config.max_frame);
        Self {
            stream,
            peer,
            config,
            logger,
            reader,
            state: SessionState::Greeting,
            messages: 0,
            bytes_echoed: 0,
            started: Instant::now(),
            traced: true,
        }
    }

    /// Emit no `tracing` diagnostics. Forked workers run sessions this way:
    /// the subscriber's output lock may have been held by another parent
    /// thread at fork time.
    pub fn untraced(mut self) -> Self {
        self.traced = false;
        self
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[inline]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Drive the session to `Closed`.
    ///
    /// On error the transport is still shut down and a termination record is
    /// written before the error is returned.
    pub fn run(mut self) -> Result<SessionSummary, SessionError> {
        self.record(format!(
            "Handling connection from {} on port {}",
            self.peer.ip(),
            self.peer.port()
        ));

        loop {
            match self.step() {
                Ok(SessionState::Closed) => return Ok(self.summary()),
                Ok(_) => {}
                Err(err) => {
                    self.abort(&err);
                    return Err(err);
                }
            }
        }
    }

    /// Perform one transition and return the new state.
    pub fn step(&mut self) -> Result<SessionState, SessionError> {
        self.state = match self.state {
            SessionState::Greeting => {
                self.greet()?;
                SessionState::EchoLoop
            }
            SessionState::EchoLoop => self.echo_one()?,
            SessionState::Closing => {
                self.close_transport();
                self.record(format!(
                    "Connection from {} terminated after {} messages",
                    self.peer, self.messages
                ));
                SessionState::Closed
            }
            SessionState::Closed => SessionState::Closed,
        };
        Ok(self.state)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            peer: self.peer,
            messages: self.messages,
            bytes_echoed: self.bytes_echoed,
            duration: self.started.elapsed(),
        }
    }

    fn greet(&mut self) -> Result<(), SessionError> {
        let banner = welcome_message(self.peer, &self.config.terminator);
        self.send(banner.as_bytes(), "sending the welcome message")
    }

    fn echo_one(&mut self) -> Result<SessionState, SessionError> {
        let frame = match self.reader.next_frame(&mut self.stream) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Err(SessionError::PeerDisconnected),
            Err(FrameError::TooLong { limit }) => {
                return Err(SessionError::FrameTooLong { limit })
            }
            Err(FrameError::Io(source)) => {
                return Err(SessionError::Transport {
                    stage: "reading",
                    source,
                })
            }
        };

        if self
            .config
            .framing
            .is_terminator(frame, self.config.terminator.as_bytes())
        {
            return Ok(SessionState::Closing);
        }

        let len = frame.len();
        write_frame(&mut self.stream, frame).map_err(|source| SessionError::Transport {
            stage: "echoing",
            source,
        })?;

        self.messages += 1;
        self.bytes_echoed += len as u64;
        if self.config.log_messages {
            self.record(format!("Echoed {} bytes to {}", len, self.peer));
        }
        Ok(SessionState::EchoLoop)
    }

    fn send(&mut self, bytes: &[u8], stage: &'static str) -> Result<(), SessionError> {
        write_frame(&mut self.stream, bytes)
            .map_err(|source| SessionError::Transport { stage, source })
    }

    fn abort(&mut self, err: &SessionError) {
        self.close_transport();
        self.state = SessionState::Closed;
        self.record(format!(
            "Connection from {} terminated: {}",
            self.peer, err
        ));
    }

    fn close_transport(&mut self) {
        if let Err(err) = self.stream.close() {
            if self.traced {
                tracing::debug!(peer = %self.peer, error = %err, "transport shutdown failed");
            }
        }
    }

    fn record(&self, message: String) {
        if let Err(err) = self.logger.log(message) {
            if self.traced {
                tracing::warn!(peer = %self.peer, error = %err, "session record dropped");
            }
        }
    }
}

/// `write_all` retries `Interrupted` and partial writes until done.
fn write_frame<W: Write + ?Sized>(stream: &mut W, bytes: &[u8]) -> io::Result<()> {
    stream.write_all(bytes)?;
    stream.flush()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::logging::MemorySink;
    use std::collections::VecDeque;

    /// In-memory duplex: scripted reads, captured writes.
    ///
    /// Every read and write is preceded by one `Interrupted` error, and
    /// writes accept at most 5 bytes at a time.
    pub(crate) struct MockStream {
        input: VecDeque<Vec<u8>>,
        pub output: Vec<u8>,
        pub closed: bool,
        interrupt_read: bool,
        interrupt_write: bool,
    }

    impl MockStream {
        pub(crate) fn new(chunks: &[&[u8]]) -> Self {
            Self {
                input: chunks.iter().map(|c| c.to_vec()).collect(),
                output: Vec::new(),
                closed: false,
                interrupt_read: true,
                interrupt_write: true,
            }
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.interrupt_read = !self.interrupt_read;
            if !self.interrupt_read {
                return Err(io::ErrorKind::Interrupted.into());
            }
            let Some(mut chunk) = self.input.pop_front() else {
                return Ok(0);
            };
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                self.input.push_front(chunk.split_off(n));
            }
            Ok(n)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.interrupt_write = !self.interrupt_write;
            if !self.interrupt_write {
                return Err(io::ErrorKind::Interrupted.into());
            }
            let n = buf.len().min(5);
            self.output.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Duplex for MockStream {
        fn close(&mut self) -> io::Result<()> {
            self.closed = true;
            Ok(())
        }
    }

    fn peer() -> SocketAddr {
        "10.0.0.7:51000".parse().unwrap()
    }

    fn session(stream: MockStream, framing: Framing) -> Session<MockStream> {
        let config = SessionConfig {
            framing,
            log_messages: true,
            ..SessionConfig::default()
        };
        Session::new(stream, peer(), Arc::new(config), Logger::disabled())
    }

    /// Run to completion, handing the stream back for inspection.
    fn drive(mut session: Session<MockStream>) -> (Result<SessionState, SessionError>, MockStream) {
        let outcome = loop {
            match session.step() {
                Ok(SessionState::Closed) => break Ok(SessionState::Closed),
                Ok(_) => {}
                Err(err) => break Err(err),
            }
        };
        (outcome, session.stream)
    }

    fn banner() -> String {
        welcome_message(peer(), "QUIT")
    }

    #[test]
    fn test_hello_then_quit() {
        let (outcome, stream) = drive(session(
            MockStream::new(&[b"hello\n", b"QUIT\n"]),
            Framing::Line,
        ));

        assert_eq!(outcome.unwrap(), SessionState::Closed);
        assert_eq!(
            String::from_utf8(stream.output).unwrap(),
            format!("{}hello\n", banner())
        );
        assert!(stream.closed);
    }

    #[test]
    fn test_prefix_or_substring_does_not_close() {
        let (outcome, stream) = drive(session(
            MockStream::new(&[b"QUI\n", b"QUITTING\nsay QUIT\n", b"QUIT\r\n"]),
            Framing::Line,
        ));

        assert_eq!(outcome.unwrap(), SessionState::Closed);
        assert_eq!(
            String::from_utf8(stream.output).unwrap(),
            format!("{}QUI\nQUITTING\nsay QUIT\n", banner())
        );
    }

    #[test]
    fn test_echo_is_byte_exact() {
        let payload: Vec<u8> = (0u8..=255).filter(|&b| b != b'\n').chain([b'\n']).collect();
        let (outcome, stream) = drive(session(
            MockStream::new(&[&payload, b"QUIT\n"]),
            Framing::Line,
        ));

        assert!(outcome.is_ok());
        assert_eq!(&stream.output[banner().len()..], &payload[..]);
    }

    #[test]
    fn test_disconnect_without_terminator() {
        let mut session = session(MockStream::new(&[b"hello\n"]), Framing::Line);
        assert_eq!(session.step().unwrap(), SessionState::EchoLoop);
        assert_eq!(session.step().unwrap(), SessionState::EchoLoop);
        assert!(matches!(
            session.step(),
            Err(SessionError::PeerDisconnected)
        ));
        assert_eq!(session.summary().messages, 1);
    }

    #[test]
    fn test_oversized_line_ends_session() {
        let config = SessionConfig {
            max_frame: 16,
            ..SessionConfig::default()
        };
        let long = vec![b'x'; 64];
        let session = Session::new(
            MockStream::new(&[&long]),
            peer(),
            Arc::new(config),
            Logger::disabled(),
        );
        assert!(matches!(
            session.run(),
            Err(SessionError::FrameTooLong { limit: 16 })
        ));
    }

    #[test]
    fn test_raw_mode_matches_whole_read() {
        let (outcome, stream) = drive(session(
            MockStream::new(&[b"hello", b"QUIT\n", b"QUIT"]),
            Framing::Raw,
        ));

        assert!(outcome.is_ok());
        assert_eq!(
            String::from_utf8(stream.output).unwrap(),
            format!("{}helloQUIT\n", banner())
        );
    }

    #[test]
    fn test_run_logs_lifecycle_records() {
        let sink = Arc::new(MemorySink::new());
        let config = SessionConfig {
            log_messages: true,
            ..SessionConfig::default()
        };
        let session = Session::new(
            MockStream::new(&[b"one\n", b"two\n", b"QUIT\n"]),
            peer(),
            Arc::new(config),
            Logger::direct(sink.clone()),
        );

        let summary = session.run().unwrap();
        assert_eq!(summary.messages, 2);
        assert_eq!(summary.bytes_echoed, 8);

        let lines = sink.lines();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].ends_with("Handling connection from 10.0.0.7 on port 51000"));
        assert!(lines[1].ends_with("Echoed 4 bytes to 10.0.0.7:51000"));
        assert!(lines[3].ends_with("Connection from 10.0.0.7:51000 terminated after 2 messages"));
    }
}
