//! Connection Services
//!
//! The per-connection protocol body. A service performs one unit of work
//! each time a connection becomes readable and tells the worker whether to
//! keep the connection registered.

use std::io::{self, Read, Write};

use super::Environment;

/// Result of one service call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Keep the connection registered for the next readiness event
    Continue,

    /// Deregister and close the connection
    Close,
}

/// Byte stream handed to a service
pub trait Stream: Read + Write {}

impl<T: Read + Write + ?Sized> Stream for T {}

/// Protocol handler invoked by workers on readable connections
///
/// One instance is shared by every worker, so implementations must be safe
/// to call concurrently. Calls for the same connection are never concurrent.
pub trait Service: Send + Sync + 'static {
    /// Read from (and optionally write to) `stream` once
    ///
    /// An `Err` closes the connection and is logged by the caller.
    fn serve(&self, env: &Environment, stream: &mut dyn Stream) -> io::Result<Outcome>;
}

/// Baseline service: echo one bounded read back, then close
///
/// The echo is a single write to a non-blocking stream, so `bucket_size`
/// must fit in an empty send buffer (see `config::MAX_BUCKET_SIZE`).
#[derive(Debug, Clone)]
pub struct EchoService {
    bucket_size: usize,
}

impl EchoService {
    pub fn new(bucket_size: usize) -> Self {
        Self { bucket_size }
    }
}

impl Service for EchoService {
    fn serve(&self, _env: &Environment, stream: &mut dyn Stream) -> io::Result<Outcome> {
        let mut buf = vec![0u8; self.bucket_size];

        let len = match stream.read(&mut buf) {
            // closed by peer
            Ok(0) => return Ok(Outcome::Close),
            Ok(n) => n,
            // spurious readiness, nothing consumed yet
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                return Ok(Outcome::Continue)
            }
            Err(e) => return Err(e),
        };

        stream.write_all(&buf[..len])?;
        stream.flush()?;
        Ok(Outcome::Close)
    }
}
