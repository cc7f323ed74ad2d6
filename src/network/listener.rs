//! Listening Socket
//!
//! One bound, non-blocking socket shared by every worker. Workers only ever
//! register its descriptor and call `accept`; the supervisor drops the last
//! reference during teardown, which closes it.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Socket, Type};

use crate::config::ListenAddr;
use crate::error::BindError;

/// Shared listening socket
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

/// Backlog passed to `listen`: the platform maximum
pub fn backlog() -> i32 {
    libc::SOMAXCONN
}

/// Resolve `addr` and listen on the first candidate that yields a socket
///
/// Candidates are only skipped while socket creation fails. Once a socket
/// exists for a candidate, a failure to configure, bind or listen is final.
pub fn bind_and_listen(addr: &ListenAddr) -> Result<Listener, BindError> {
    let candidates = (addr.resolvable_host(), addr.port)
        .to_socket_addrs()
        .map_err(|source| BindError::Resolve {
            addr: addr.to_string(),
            source,
        })?;

    for candidate in candidates {
        let socket = match Socket::new(Domain::for_address(candidate), Type::STREAM, None) {
            Ok(socket) => socket,
            Err(e) => {
                tracing::debug!("Socket creation failed for {}: {}", candidate, e);
                continue;
            }
        };

        let bind_err = |source| BindError::Bind {
            addr: candidate,
            source,
        };
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;
        socket.bind(&candidate.into()).map_err(bind_err)?;

        let listen_err = |source| BindError::Listen {
            addr: candidate,
            source,
        };
        socket.listen(backlog()).map_err(listen_err)?;

        let inner = TcpListener::from_std(socket.into());
        let local_addr = inner.local_addr().map_err(listen_err)?;

        tracing::info!("Listening on {} (backlog {})", local_addr, backlog());
        return Ok(Listener { inner, local_addr });
    }

    Err(BindError::NoCandidate {
        addr: addr.to_string(),
    })
}

impl Listener {
    /// Address the socket is bound to (with the real port when bound to 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept one pending connection
    ///
    /// The returned stream is already non-blocking.
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept()
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
