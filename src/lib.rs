//! # sparkled
//!
//! A resident TCP daemon serving connections from a shared, memory-mapped
//! key-value environment:
//! - One listening socket shared by N worker threads
//! - One mio event loop per worker, no cross-worker locking
//! - Rendezvous-synchronized startup, signal-driven ordered shutdown
//! - Pluggable per-connection service (echo by default)
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Supervisor                            │
//! │        (open storage → bind → spawn → sigwait → teardown)    │
//! └───────┬──────────────────────┬──────────────────────┬───────┘
//!         │                      │                      │
//!         ▼                      ▼                      ▼
//!   ┌───────────┐          ┌───────────┐          ┌───────────┐
//!   │ Worker 0  │          │ Worker 1  │   ...    │ Worker N  │
//!   │ mio Poll  │          │ mio Poll  │          │ mio Poll  │
//!   └─────┬─────┘          └─────┬─────┘          └─────┬─────┘
//!         │   shared listener fd (kernel-arbitrated)    │
//!         └──────────────────────┬──────────────────────┘
//!                                ▼
//!                        ┌───────────────┐
//!                        │    Backend    │
//!                        │ (Environment) │
//!                        └───────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod storage;
pub mod network;
pub mod signal;
pub mod supervisor;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{BindError, Result, SparkledError, StorageInitError};
pub use config::{Config, ListenAddr};
pub use storage::{Backend, EchoService, EnvFlags, Environment, Outcome, Service};
pub use supervisor::{LifecycleEvent, Supervisor};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of sparkled
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
