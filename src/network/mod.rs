//! Network Module
//!
//! Listening socket, per-connection state and worker event loops.
//!
//! ## Architecture
//! - One listening socket, shared by every worker
//! - N worker threads, each with a private mio poll
//! - Connections never leave the worker that accepted them

mod listener;
mod connection;
mod worker;

pub use listener::{backlog, bind_and_listen, Listener};
pub use connection::Connection;
pub use worker::{default_poll_factory, PollFactory, WorkerContext, WorkerHandle, WorkerState};
