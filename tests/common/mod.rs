//! Shared harness: a real service on an ephemeral loopback port

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use turnstile::config::{ServerConfig, SinkKind};
use turnstile::{Service, Shutdown, ShutdownReport, StopReason};

pub struct Running {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub log_path: PathBuf,
    handle: Option<JoinHandle<ShutdownReport>>,
}

impl Running {
    /// Request a stop and wait for the teardown report.
    pub fn stop(&mut self) -> ShutdownReport {
        self.shutdown.trigger(StopReason::Requested);
        self.handle
            .take()
            .expect("service thread")
            .join()
            .expect("service thread panicked")
    }

    pub fn log_lines(&self) -> Vec<String> {
        std::fs::read_to_string(&self.log_path)
            .unwrap_or_default()
            .lines()
            .map(str::to_owned)
            .collect()
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.shutdown.trigger(StopReason::Requested);
            let _ = handle.join();
        }
        let _ = std::fs::remove_file(&self.log_path);
    }
}

/// Unique per test binary, per test name.
pub fn temp_log(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "turnstile-it-{}-{}.log",
        std::process::id(),
        name
    ));
    let _ = std::fs::remove_file(&path);
    path
}

pub fn base_config(name: &str) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.bind_addr = "127.0.0.1:0".parse().unwrap();
    config.log.sink = SinkKind::File;
    config.log.path = temp_log(name);
    config.log.capacity = 8;
    config.grace = Duration::from_secs(2);
    config.tick = Duration::from_millis(20);
    config
}

pub fn start(config: ServerConfig) -> Running {
    let log_path = config.log.path.clone();
    let service = Service::bind(config).expect("bind service");
    let addr = service.local_addr();
    let shutdown = service.shutdown_handle();
    let handle = thread::spawn(move || service.run());
    Running {
        addr,
        shutdown,
        log_path,
        handle: Some(handle),
    }
}

/// Blocking line client.
pub struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Client {
    /// Connect without waiting for the welcome message.
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        Self {
            reader: BufReader::new(stream.try_clone().unwrap()),
            writer: stream,
        }
    }

    /// Read the two-line welcome.
    pub fn welcome(&mut self) -> String {
        let mut text = self.line();
        text.push_str(&self.line());
        text
    }

    pub fn send(&mut self, text: &str) {
        self.writer.write_all(text.as_bytes()).unwrap();
    }

    pub fn line(&mut self) -> String {
        self.try_line().unwrap()
    }

    pub fn try_line(&mut self) -> std::io::Result<String> {
        let mut line = String::new();
        self.reader.read_line(&mut line)?;
        Ok(line)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.writer.local_addr().unwrap()
    }

    pub fn echo(&mut self, text: &str) -> String {
        self.send(text);
        self.line()
    }

    /// Whether the server has closed the connection.
    ///
    /// A reset counts as closed: the server may close with unread input.
    pub fn closed(&mut self) -> bool {
        match self.try_line() {
            Ok(line) => line.is_empty(),
            Err(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
            ),
        }
    }

    pub fn set_read_timeout(&self, timeout: Duration) {
        self.writer.set_read_timeout(Some(timeout)).unwrap();
    }
}
