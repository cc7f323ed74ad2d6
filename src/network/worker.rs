//! Worker Threads
//!
//! Each worker is one OS thread driving its own mio `Poll`. All workers
//! register the same listening descriptor, so the kernel decides which one
//! gets each connection; everything a worker accepts stays with it.
//!
//! ## Lifecycle
//! ```text
//! Created ──spawn──▶ Initializing ──poll + waker + listener──▶ Ready
//!                          │                                     │
//!                          └──failure reported──▶ Stopped        ▼
//!                                                             Running
//!                                                                │ waker
//!                                                                ▼
//!                                               Stopped ◀──── Draining
//! ```
//!
//! The spawning thread blocks on a rendezvous channel until the worker has
//! reported `Ready` (handing back its `Waker`) or failed.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::error::{Result, SparkledError};
use crate::storage::{Backend, Outcome};
use crate::supervisor::{LifecycleEvent, Observer};

use super::{Connection, Listener};

/// Token for the shared listening socket
const LISTENER: Token = Token(0);

/// Token for the termination waker
const WAKER: Token = Token(1);

/// First token handed to an accepted connection
const FIRST_CONNECTION: usize = 2;

/// Maximum events to process per poll iteration
const MAX_EVENTS: usize = 1024;

/// Builds a worker's readiness loop; receives the worker index
pub type PollFactory = Arc<dyn Fn(usize) -> io::Result<Poll> + Send + Sync>;

/// Factory used unless one is injected
pub fn default_poll_factory() -> PollFactory {
    Arc::new(|_| Poll::new())
}

// =============================================================================
// State
// =============================================================================

/// Where a worker is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Created = 0,
    Initializing = 1,
    Ready = 2,
    Running = 3,
    Draining = 4,
    Stopped = 5,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Created,
            1 => WorkerState::Initializing,
            2 => WorkerState::Ready,
            3 => WorkerState::Running,
            4 => WorkerState::Draining,
            _ => WorkerState::Stopped,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// State shared between a worker thread and its handle
#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        StateCell(AtomicU8::new(WorkerState::Created as u8))
    }

    fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, id: usize, state: WorkerState) {
        self.0.store(state as u8, Ordering::Release);
        tracing::trace!("Worker {} -> {}", id, state);
    }
}

// =============================================================================
// Context
// =============================================================================

/// Everything a worker needs, passed explicitly into its thread
#[derive(Clone)]
pub struct WorkerContext {
    /// Worker index, in spawn order
    pub id: usize,

    /// Shared listening socket
    pub listener: Arc<Listener>,

    /// Shared storage backend
    pub backend: Arc<Backend>,

    /// Close connections idle for longer than this
    pub idle_timeout: Option<Duration>,

    /// Builds the worker's poll
    pub poll_factory: PollFactory,

    /// Receives `WorkerStopped`
    pub observer: Option<Observer>,
}

// =============================================================================
// Handle
// =============================================================================

/// Supervisor-side handle on a running worker
pub struct WorkerHandle {
    id: usize,
    waker: Waker,
    thread: Option<JoinHandle<()>>,
    state: Arc<StateCell>,
}

type ReadyReport = std::result::Result<Waker, String>;

impl WorkerHandle {
    /// Spawn a worker and block until it is `Ready` or has failed
    pub fn spawn(ctx: WorkerContext) -> Result<Self> {
        let id = ctx.id;
        let (ready_tx, ready_rx) = channel::bounded::<ReadyReport>(1);
        let state = Arc::new(StateCell::new());
        let thread_state = Arc::clone(&state);

        let thread = thread::Builder::new()
            .name(format!("sparkled-worker-{}", id))
            .spawn(move || run(ctx, thread_state, ready_tx))
            .map_err(|e| SparkledError::WorkerInit {
                worker: id,
                reason: format!("failed to spawn thread: {}", e),
            })?;

        // Rendezvous: the worker reports exactly once before doing anything else
        let report = ready_rx.recv();
        match report {
            Ok(Ok(waker)) => Ok(Self {
                id,
                waker,
                thread: Some(thread),
                state,
            }),
            Ok(Err(reason)) => {
                let _ = thread.join();
                Err(SparkledError::WorkerInit { worker: id, reason })
            }
            Err(_) => {
                let _ = thread.join();
                Err(SparkledError::WorkerInit {
                    worker: id,
                    reason: "exited before reporting readiness".to_string(),
                })
            }
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    /// Ask the worker to stop; returns immediately
    pub fn notify(&self) -> io::Result<()> {
        self.waker.wake()
    }

    /// Block until the worker thread has exited
    ///
    /// Returns `false` if the thread panicked.
    pub fn join(&mut self) -> bool {
        match self.thread.take() {
            Some(thread) => match thread.join() {
                Ok(()) => true,
                Err(_) => {
                    tracing::error!("Worker {} panicked", self.id);
                    self.state.set(self.id, WorkerState::Stopped);
                    false
                }
            },
            None => true,
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.notify();
            self.join();
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

struct Worker {
    id: usize,
    poll: Poll,
    listener: Arc<Listener>,
    backend: Arc<Backend>,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    idle_timeout: Option<Duration>,
    state: Arc<StateCell>,
}

/// Thread body
fn run(ctx: WorkerContext, state: Arc<StateCell>, ready: Sender<ReadyReport>) {
    let id = ctx.id;
    let observer = ctx.observer.clone();
    state.set(id, WorkerState::Initializing);

    let (mut worker, waker) = match Worker::init(ctx, Arc::clone(&state)) {
        Ok(parts) => parts,
        Err(e) => {
            tracing::error!("Worker {} failed to initialize: {}", id, e);
            state.set(id, WorkerState::Stopped);
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };

    state.set(id, WorkerState::Ready);
    if ready.send(Ok(waker)).is_err() {
        // Nobody is waiting for us; the loop would be unreachable
        state.set(id, WorkerState::Stopped);
        return;
    }
    drop(ready);

    worker.run_loop();
    worker.drain();

    state.set(id, WorkerState::Stopped);
    if let Some(observer) = observer {
        observer(LifecycleEvent::WorkerStopped(id));
    }
}

impl Worker {
    /// Build the poll, the waker, and register the shared listener
    fn init(ctx: WorkerContext, state: Arc<StateCell>) -> io::Result<(Self, Waker)> {
        let poll = (ctx.poll_factory)(ctx.id)?;
        let waker = Waker::new(poll.registry(), WAKER)?;

        let fd = ctx.listener.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), LISTENER, Interest::READABLE)?;

        let worker = Self {
            id: ctx.id,
            poll,
            listener: ctx.listener,
            backend: ctx.backend,
            connections: HashMap::new(),
            next_token: FIRST_CONNECTION,
            idle_timeout: ctx.idle_timeout,
            state,
        };
        Ok((worker, waker))
    }

    /// Wait for readiness until the waker fires
    fn run_loop(&mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);
        self.state.set(self.id, WorkerState::Running);
        tracing::debug!("Worker {} event loop started", self.id);

        loop {
            if let Err(e) = self.poll.poll(&mut events, self.idle_timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!("Worker {} poll failed: {}", self.id, e);
                return;
            }

            for event in events.iter() {
                match event.token() {
                    WAKER => {
                        tracing::debug!("Worker {} received termination", self.id);
                        return;
                    }
                    LISTENER => self.accept_connections(),
                    token => self.handle_readable(token),
                }
            }

            if let Some(timeout) = self.idle_timeout {
                self.close_idle(timeout);
            }
        }
    }

    /// Accept until the listener would block
    ///
    /// Readiness is edge-triggered, so the backlog has to be drained here;
    /// other workers woken by the same edge simply see `WouldBlock`.
    fn accept_connections(&mut self) {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e)
                    if e.kind() == io::ErrorKind::Interrupted
                        || e.kind() == io::ErrorKind::ConnectionAborted =>
                {
                    continue
                }
                Err(e) => {
                    tracing::warn!("Worker {} accept failed: {}", self.id, e);
                    self.rearm_listener();
                    break;
                }
            };

            let token = Token(self.next_token);
            self.next_token += 1;

            let mut conn = match Connection::new(token, stream, peer) {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("Failed to configure connection from {}: {}", peer, e);
                    continue;
                }
            };
            if let Err(e) = conn.register(self.poll.registry()) {
                tracing::warn!("Failed to register connection from {}: {}", peer, e);
                continue;
            }

            tracing::debug!(
                "Worker {} accepted connection from {} ({:?})",
                self.id,
                peer,
                token
            );
            self.connections.insert(token, conn);
        }
    }

    /// Re-register the listener so a backlog left behind by a failed accept
    /// (`EMFILE`, `ENOBUFS`, ...) is reported again on the next poll
    fn rearm_listener(&mut self) {
        let fd = self.listener.as_raw_fd();
        if let Err(e) =
            self.poll
                .registry()
                .reregister(&mut SourceFd(&fd), LISTENER, Interest::READABLE)
        {
            tracing::error!("Worker {} failed to re-arm listener: {}", self.id, e);
        }
    }

    /// Service a readable connection
    fn handle_readable(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            tracing::trace!("Readable event for unknown token {:?}", token);
            return;
        };

        match conn.serve(&self.backend) {
            Outcome::Continue => {
                if let Err(e) = conn.reregister(self.poll.registry()) {
                    tracing::warn!("Failed to re-arm {}: {}", conn.peer_addr(), e);
                    self.close_connection(token);
                }
            }
            Outcome::Close => self.close_connection(token),
        }
    }

    fn close_connection(&mut self, token: Token) {
        if let Some(conn) = self.connections.remove(&token) {
            tracing::debug!("Closing connection {} ({:?})", conn.peer_addr(), token);
            conn.close(self.poll.registry());
        }
    }

    fn close_idle(&mut self, timeout: Duration) {
        let idle: Vec<Token> = self
            .connections
            .values()
            .filter(|c| c.is_idle(timeout))
            .map(Connection::token)
            .collect();

        for token in idle {
            tracing::debug!("Worker {} closing idle connection {:?}", self.id, token);
            self.close_connection(token);
        }
    }

    /// Stop watching the listener and close every owned connection
    fn drain(&mut self) {
        self.state.set(self.id, WorkerState::Draining);

        let fd = self.listener.as_raw_fd();
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            tracing::trace!("Worker {} listener deregister failed: {}", self.id, e);
        }

        let open = self.connections.len();
        for (_, conn) in self.connections.drain() {
            conn.close(self.poll.registry());
        }

        tracing::info!("Worker {} stopped ({} connections closed)", self.id, open);
    }
}
