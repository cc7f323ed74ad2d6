//! Error types for sparkled
//!
//! Everything that can go wrong before all workers are ready is fatal and
//! surfaces as a `SparkledError`. Per-connection failures are contained
//! inside the worker that owns the connection and only ever get logged.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using SparkledError
pub type Result<T> = std::result::Result<T, SparkledError>;

/// Unified error type for sparkled operations
#[derive(Debug, Error)]
pub enum SparkledError {
    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("invalid configuration: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Startup Errors
    // -------------------------------------------------------------------------
    #[error("failed to initialize storage: {0}")]
    StorageInit(#[from] StorageInitError),

    #[error("failed to bind listener: {0}")]
    Bind(#[from] BindError),

    #[error("worker {worker} failed to initialize: {reason}")]
    WorkerInit { worker: usize, reason: String },

    // -------------------------------------------------------------------------
    // Steady-State Errors
    // -------------------------------------------------------------------------
    #[error("connection I/O error on {peer}: {source}")]
    ConnectionIo {
        peer: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("signal handling failed: {0}")]
    Signal(#[source] io::Error),

    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Why the storage environment could not be opened
///
/// Each variant names the step that failed, mirroring the
/// create → size → open sequence of `EnvironmentBuilder`.
#[derive(Debug, Error)]
pub enum StorageInitError {
    #[error("failed to create environment: {0}")]
    Create(#[source] io::Error),

    #[error("invalid map size {size} (must be at least {min} bytes)")]
    MapSize { size: u64, min: u64 },

    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("environment {path} is locked by another handle")]
    Locked { path: PathBuf },

    #[error("environment {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// Why the listening socket could not be established
#[derive(Debug, Error)]
pub enum BindError {
    #[error("failed to resolve {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("no usable socket for {addr}")]
    NoCandidate { addr: String },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl SparkledError {
    /// Whether this error aborts startup rather than a single connection
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SparkledError::ConnectionIo { .. })
    }
}
