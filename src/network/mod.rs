//! Network Layer: accept loop and per-connection sessions
//!
//! - Dispatcher: `mio` readiness for the listener plus a waker for stop
//!   requests; accepted streams go back to blocking mode for their worker
//! - Session: blocking echo protocol on one stream

mod acceptor;
mod session;

use std::net::{SocketAddr, TcpStream};

pub use acceptor::{DispatchError, Dispatcher};
pub use session::{Duplex, Session, SessionConfig, SessionError, SessionState, SessionSummary};

/// An accepted connection, owned by exactly one worker.
#[derive(Debug)]
pub struct Connection {
    /// Dispatch sequence number, also the worker id.
    pub id: u64,
    pub stream: TcpStream,
    pub peer: SocketAddr,
}
