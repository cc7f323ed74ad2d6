//! Connection Handler
//!
//! Per-socket state owned by exactly one worker.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use crate::error::SparkledError;
use crate::storage::{Backend, Outcome};

/// An accepted client connection
pub struct Connection {
    /// Registration token in the owning worker's poll
    token: Token,

    /// Non-blocking TCP stream
    stream: TcpStream,

    /// Peer address for logging
    peer_addr: SocketAddr,

    /// Last time the connection was serviced
    last_activity: Instant,
}

impl Connection {
    /// Wrap an accepted stream
    ///
    /// Disables Nagle's algorithm; the stream is already non-blocking.
    pub fn new(token: Token, stream: TcpStream, peer_addr: SocketAddr) -> io::Result<Self> {
        stream.set_nodelay(true)?;

        Ok(Self {
            token,
            stream,
            peer_addr,
            last_activity: Instant::now(),
        })
    }

    /// Watch the connection for readability
    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.stream, self.token, Interest::READABLE)
    }

    /// Re-arm the readable registration
    pub fn reregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.reregister(&mut self.stream, self.token, Interest::READABLE)
    }

    /// Run one service call
    ///
    /// I/O errors never leave the connection: they are logged and turned
    /// into `Outcome::Close`.
    pub fn serve(&mut self, backend: &Backend) -> Outcome {
        self.last_activity = Instant::now();

        match backend.service(&mut self.stream) {
            Ok(outcome) => outcome,
            Err(source) => {
                let quiet = matches!(
                    source.kind(),
                    io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::BrokenPipe
                );
                let err = SparkledError::ConnectionIo {
                    peer: self.peer_addr,
                    source,
                };
                if quiet {
                    tracing::debug!("{}", err);
                } else {
                    tracing::warn!("{}", err);
                }
                Outcome::Close
            }
        }
    }

    /// Whether the connection has been idle for longer than `timeout`
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }

    /// Deregister and close the socket
    pub fn close(mut self, registry: &Registry) {
        if let Err(e) = registry.deregister(&mut self.stream) {
            tracing::trace!("Deregister failed for {}: {}", self.peer_addr, e);
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Get the peer address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}
