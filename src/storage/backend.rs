//! Storage Backend
//!
//! Owns the one environment opened per process and the service that runs
//! against it. Workers share the backend through an `Arc`.
//!
//! ## Concurrency
//! - `env`: `RwLock<Option<Environment>>` guards only the environment's
//!   lifetime. Service calls hold shared guards and run in parallel; `close`
//!   takes the exclusive guard and leaves `None` behind.
//! - The service itself is responsible for any finer-grained locking.

use std::io;

use parking_lot::RwLock;

use crate::config::Config;
use crate::error::Result;

use super::{EchoService, EnvInfo, Environment, Outcome, Service, Stream};

/// Shared handle to the storage environment and its service
pub struct Backend {
    /// `None` once closed
    env: RwLock<Option<Environment>>,

    /// Protocol body run on readable connections
    service: Box<dyn Service>,
}

impl Backend {
    /// Open the environment described by `config` with the echo service
    pub fn open(config: &Config) -> Result<Self> {
        Self::open_with(config, Box::new(EchoService::new(config.bucket_size)))
    }

    /// Open the environment described by `config` with a custom service
    pub fn open_with(config: &Config, service: Box<dyn Service>) -> Result<Self> {
        let env = Environment::builder()
            .map_size(config.map_size)
            .flags(config.env_flags)
            .open(&config.data_dir, config.permissions)?;

        tracing::info!(
            "Storage opened at {} (map_size={}, flags={})",
            config.data_dir.display(),
            env.map_size(),
            env.flags()
        );

        Ok(Self::from_environment(env, service))
    }

    /// Wrap an already opened environment
    pub fn from_environment(env: Environment, service: Box<dyn Service>) -> Self {
        Self {
            env: RwLock::new(Some(env)),
            service,
        }
    }

    /// Run one service call against `stream`
    ///
    /// After `close` every call returns `Close` without touching the stream.
    pub fn service(&self, stream: &mut dyn Stream) -> io::Result<Outcome> {
        let env = self.env.read();
        match env.as_ref() {
            Some(env) => self.service.serve(env, stream),
            None => Ok(Outcome::Close),
        }
    }

    /// Release the environment
    ///
    /// Returns `Ok(false)` when there was nothing left to close.
    pub fn close(&self) -> io::Result<bool> {
        let env = self.env.write().take();
        match env {
            Some(env) => {
                env.close()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn is_open(&self) -> bool {
        self.env.read().is_some()
    }

    /// Environment parameters, if still open
    pub fn info(&self) -> Option<EnvInfo> {
        self.env.read().as_ref().map(Environment::info)
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        if let Some(env) = self.env.get_mut().take() {
            if let Err(e) = env.close() {
                tracing::warn!("Failed to flush storage on drop: {}", e);
            }
        }
    }
}
