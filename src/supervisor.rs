//! Supervisor
//!
//! Owns startup and shutdown ordering for the whole daemon.
//!
//! ## Startup
//! 1. Validate the config
//! 2. Open the storage backend
//! 3. Bind the listening socket
//! 4. Spawn workers one at a time, each behind a rendezvous
//!
//! ## Shutdown
//! 1. Wake every worker
//! 2. Join them in spawn order
//! 3. Close the listening socket
//! 4. Close the storage backend
//!
//! The same teardown runs on every failed startup step and from `Drop`, so
//! whatever was already acquired is released in order.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use mio::Poll;

use crate::config::Config;
use crate::error::{Result, SparkledError};
use crate::network::{
    bind_and_listen, default_poll_factory, Listener, PollFactory, WorkerContext, WorkerHandle,
    WorkerState,
};
use crate::signal::{signal_name, SignalSet};
use crate::storage::{Backend, EnvInfo, Service};

/// Lifecycle milestones, reported to an optional observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Worker reported ready at the rendezvous
    WorkerReady(usize),

    /// Worker left its loop and released its connections
    WorkerStopped(usize),

    /// Listening socket closed
    ListenerClosed,

    /// Storage environment closed
    BackendClosed,
}

/// Callback receiving lifecycle events from the supervisor and workers
pub type Observer = Arc<dyn Fn(LifecycleEvent) + Send + Sync>;

/// Builder for a supervisor with non-default collaborators
pub struct SupervisorBuilder {
    config: Config,
    service: Option<Box<dyn Service>>,
    poll_factory: PollFactory,
    observer: Option<Observer>,
}

impl SupervisorBuilder {
    /// Replace the echo service
    pub fn service(mut self, service: impl Service) -> Self {
        self.service = Some(Box::new(service));
        self
    }

    /// Override how workers construct their readiness loop
    pub fn poll_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(usize) -> io::Result<Poll> + Send + Sync + 'static,
    {
        self.poll_factory = Arc::new(factory);
        self
    }

    /// Receive lifecycle events
    pub fn observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(LifecycleEvent) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Open storage, bind, and spawn every worker
    pub fn start(self) -> Result<Supervisor> {
        let SupervisorBuilder {
            config,
            service,
            poll_factory,
            observer,
        } = self;
        config.validate()?;

        // Step 1: Storage
        let backend = match service {
            Some(service) => Backend::open_with(&config, service),
            None => Backend::open(&config),
        };
        let backend = match backend {
            Ok(backend) => Arc::new(backend),
            Err(e) => {
                tracing::error!("Failed to open storage: {}", e);
                return Err(e);
            }
        };

        // Step 2: Listener
        let listener = match bind_and_listen(&config.listen) {
            Ok(listener) => Arc::new(listener),
            Err(e) => {
                tracing::error!("Failed to bind {}: {}", config.listen, e);
                if let Err(close_err) = backend.close() {
                    tracing::warn!("Failed to close storage: {}", close_err);
                }
                emit(&observer, LifecycleEvent::BackendClosed);
                return Err(e.into());
            }
        };

        let mut supervisor = Supervisor {
            local_addr: listener.local_addr(),
            workers: Vec::with_capacity(config.workers),
            listener: Some(listener),
            backend: Some(backend),
            observer,
            config,
        };

        // Step 3: Workers
        if let Err(e) = supervisor.spawn_workers(poll_factory) {
            tracing::error!("Startup aborted: {}", e);
            if let Err(teardown_err) = supervisor.teardown() {
                tracing::warn!("Teardown after failed startup: {}", teardown_err);
            }
            return Err(e);
        }

        Ok(supervisor)
    }
}

/// Running daemon: storage, listener and a full set of workers
pub struct Supervisor {
    config: Config,
    local_addr: SocketAddr,
    backend: Option<Arc<Backend>>,
    listener: Option<Arc<Listener>>,
    workers: Vec<WorkerHandle>,
    observer: Option<Observer>,
}

impl Supervisor {
    /// Create a builder for `config`
    pub fn builder(config: Config) -> SupervisorBuilder {
        SupervisorBuilder {
            config,
            service: None,
            poll_factory: default_poll_factory(),
            observer: None,
        }
    }

    /// Start with the echo service and default collaborators
    pub fn start(config: Config) -> Result<Self> {
        Self::builder(config).start()
    }

    /// Spawn `config.workers` workers, strictly one after another
    ///
    /// Worker `i + 1` is not created until worker `i` has reported ready.
    /// The first failure stops the sequence.
    fn spawn_workers(&mut self, poll_factory: PollFactory) -> Result<()> {
        let (Some(listener), Some(backend)) = (&self.listener, &self.backend) else {
            return Err(SparkledError::WorkerInit {
                worker: self.workers.len(),
                reason: "supervisor already torn down".to_string(),
            });
        };

        for id in 0..self.config.workers {
            let ctx = WorkerContext {
                id,
                listener: Arc::clone(listener),
                backend: Arc::clone(backend),
                idle_timeout: self.config.idle_timeout,
                poll_factory: Arc::clone(&poll_factory),
                observer: self.observer.clone(),
            };

            let handle = WorkerHandle::spawn(ctx)?;
            tracing::debug!("Worker {} ready", id);
            emit(&self.observer, LifecycleEvent::WorkerReady(id));
            self.workers.push(handle);
        }

        tracing::info!("{} worker(s) running", self.workers.len());
        Ok(())
    }

    /// Block until a signal from `signals` arrives
    ///
    /// `signals` must have been blocked before the workers were spawned.
    pub fn await_termination(&self, signals: &SignalSet) -> Result<i32> {
        let signo = signals.wait().map_err(SparkledError::Signal)?;
        tracing::info!("catch signal: {} ({})", signo, signal_name(signo));
        Ok(signo)
    }

    /// Stop every worker, then close the listener, then the storage
    pub fn shutdown(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        // Notify all first so workers drain in parallel
        for worker in &self.workers {
            if let Err(e) = worker.notify() {
                tracing::warn!("Failed to notify worker {}: {}", worker.id(), e);
            }
        }
        for mut worker in self.workers.drain(..) {
            worker.join();
        }

        if let Some(listener) = self.listener.take() {
            match Arc::try_unwrap(listener) {
                Ok(listener) => drop(listener),
                Err(_) => tracing::warn!("Listener still referenced at teardown"),
            }
            tracing::debug!("Listener closed");
            emit(&self.observer, LifecycleEvent::ListenerClosed);
        }

        if let Some(backend) = self.backend.take() {
            backend.close()?;
            tracing::debug!("Storage closed");
            emit(&self.observer, LifecycleEvent::BackendClosed);
        }

        Ok(())
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Current state of each worker, in spawn order
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.workers.iter().map(WorkerHandle::state).collect()
    }

    /// Storage environment parameters
    pub fn storage_info(&self) -> Option<EnvInfo> {
        self.backend.as_ref().and_then(|b| b.info())
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            tracing::error!("Teardown failed: {}", e);
        }
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("local_addr", &self.local_addr)
            .field("workers", &self.workers.len())
            .finish()
    }
}

fn emit(observer: &Option<Observer>, event: LifecycleEvent) {
    if let Some(observer) = observer {
        observer(event);
    }
}
