//! Storage Module
//!
//! The embedded storage backend shared by all workers.
//!
//! ## Responsibilities
//! - Open the memory-mapped environment exactly once, before workers start
//! - Run the pluggable per-connection service against it
//! - Close it exactly once, after every worker has stopped

mod env;
mod backend;
mod service;

pub use env::{
    page_size, EnvFlags, EnvInfo, Environment, EnvironmentBuilder, DATA_FILENAME,
    DEFAULT_MAP_SIZE, LOCK_FILENAME, LOCK_SUFFIX,
};
pub use backend::Backend;
pub use service::{EchoService, Outcome, Service, Stream};
