//! Accept loop with admission backpressure
//!
//! Connections are accepted serially. Each one waits for a permit before a
//! worker is spawned for it; while every slot is busy, new peers queue in
//! the OS backlog.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};

use super::Connection;
use crate::core::{Admission, AdmissionError, Permit};
use crate::logging::Logger;
use crate::shutdown::StopToken;
use crate::stats::ServiceStats;
use crate::worker::{Spawner, WorkerContext, WorkerRegistry};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const EVENTS_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("event poll failed")]
    Poll(#[source] io::Error),
    #[error("accept failed")]
    Accept(#[source] io::Error),
    #[error("admission failed")]
    Admission(#[from] AdmissionError),
}

/// Errors `accept` may return for a single peer, which leave the listener
/// usable.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

pub struct Dispatcher {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    admission: Arc<dyn Admission>,
    spawner: Box<dyn Spawner>,
    ctx: WorkerContext,
    registry: WorkerRegistry,
    logger: Logger,
    stats: Arc<ServiceStats>,
    stop: StopToken,
    tick: Duration,
    next_id: u64,
}

impl Dispatcher {
    /// Register `listener` for readiness. The returned waker interrupts
    /// [`run`](Self::run) so it can observe a stop request.
    pub fn new(
        listener: std::net::TcpListener,
        admission: Arc<dyn Admission>,
        spawner: Box<dyn Spawner>,
        ctx: WorkerContext,
        stop: StopToken,
        tick: Duration,
    ) -> io::Result<(Self, Arc<Waker>)> {
        listener.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let logger = ctx.logger.clone();
        let stats = Arc::clone(&ctx.stats);
        let registry = WorkerRegistry::new(Arc::clone(&stats));

        Ok((
            Self {
                poll,
                events: Events::with_capacity(EVENTS_CAPACITY),
                listener,
                admission,
                spawner,
                ctx,
                registry,
                logger,
                stats,
                stop,
                tick,
                next_id: 0,
            },
            waker,
        ))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry_mut(&mut self) -> &mut WorkerRegistry {
        &mut self.registry
    }

    /// Accept and dispatch until a stop is requested. Returns `Err` only
    /// for fatal failures.
    pub fn run(&mut self) -> Result<(), DispatchError> {
        tracing::info!(mode = %self.spawner.mode(), limit = self.admission.limit(), "dispatcher running");

        while !self.stop.is_stopped() {
            match self.poll.poll(&mut self.events, Some(self.tick)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(DispatchError::Poll(e)),
            }

            self.registry.reap();

            let readable = self
                .events
                .iter()
                .any(|event| event.token() == LISTENER_TOKEN);
            if readable {
                self.accept_pending()?;
            }
        }

        tracing::info!(in_flight = self.registry.len(), "dispatcher stopped");
        Ok(())
    }

    /// Readiness is edge-triggered: accept until `WouldBlock`.
    fn accept_pending(&mut self) -> Result<(), DispatchError> {
        while !self.stop.is_stopped() {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    // SAFETY: ownership of the descriptor moves to the std stream.
                    let stream = unsafe { TcpStream::from_raw_fd(stream.into_raw_fd()) };
                    self.dispatch(stream, peer)?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if is_transient(&e) => {
                    tracing::debug!(error = %e, "transient accept error");
                }
                Err(e) => return Err(DispatchError::Accept(e)),
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, stream: TcpStream, peer: SocketAddr) -> Result<(), DispatchError> {
        if let Err(err) = stream.set_nonblocking(false) {
            tracing::warn!(%peer, error = %err, "cannot switch connection to blocking mode");
            self.stats.connection_dropped();
            return Ok(());
        }

        self.stats.connection_accepted();
        self.record(format!("Incoming connection accepted from {peer}"));

        let Some(permit) = self.wait_for_permit()? else {
            tracing::info!(%peer, "stop requested while waiting for a slot, dropping connection");
            // A forked worker may hold a copy of the descriptor.
            let _ = stream.shutdown(std::net::Shutdown::Both);
            self.stats.connection_dropped();
            return Ok(());
        };

        let id = self.next_id;
        self.next_id += 1;

        match self
            .spawner
            .spawn(Connection { id, stream, peer }, permit, &self.ctx)
        {
            Ok(handle) => {
                tracing::debug!(worker = id, %peer, "worker started");
                self.registry.insert(handle);
            }
            Err(err) => {
                // The permit and the connection went down with the failed spawn.
                tracing::error!(worker = id, %peer, error = %err, "cannot start worker");
                self.stats.connection_dropped();
            }
        }
        Ok(())
    }

    /// Block for a free slot, checking for a stop request every tick.
    fn wait_for_permit(&mut self) -> Result<Option<Permit>, DispatchError> {
        loop {
            if let Some(permit) = Permit::acquire_timeout(&self.admission, self.tick)? {
                return Ok(Some(permit));
            }
            if self.stop.is_stopped() {
                return Ok(None);
            }
            self.registry.reap();
        }
    }

    fn record(&self, message: String) {
        if let Err(err) = self.logger.log(message) {
            tracing::warn!(error = %err, "dispatcher record dropped");
        }
    }
}
