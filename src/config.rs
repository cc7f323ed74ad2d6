//! Configuration for sparkled
//!
//! Centralized configuration with sensible defaults. A `Config` is immutable
//! once built; `ConfigBuilder::build` is the only place invariants are
//! checked.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SparkledError};
use crate::storage::{page_size, EnvFlags, DEFAULT_MAP_SIZE};

/// Default listen port
pub const DEFAULT_PORT: u16 = 1977;

/// Default listen host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default number of workers
pub const DEFAULT_WORKERS: usize = 1;

/// Upper bound on the number of workers
pub const MAX_WORKERS: usize = 255;

/// Upper bound on the per-call read size
///
/// Echoes are written once to a non-blocking socket whose send buffer is
/// empty; the kernel's default send buffer (`tcp_wmem`) holds 16 KiB, so a
/// reply up to this size is never cut short by `WouldBlock`.
pub const MAX_BUCKET_SIZE: usize = 16 * 1024;

/// Default file permission bits for storage files
pub const DEFAULT_PERMISSIONS: u32 = 0o644;

const WILDCARD_HOST: &str = "*";
const SCHEME_PREFIX: &str = "tcp://";

// =============================================================================
// Listen Address
// =============================================================================

/// Address the daemon listens on, before resolution
///
/// Accepts `host:port`, `tcp://host:port`, or a bare `host` (default port).
/// A host of `*` binds every interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddr {
    pub host: String,
    pub port: u16,
}

impl ListenAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.host == WILDCARD_HOST
    }

    /// Host string suitable for address resolution
    pub fn resolvable_host(&self) -> &str {
        if self.is_wildcard() {
            "0.0.0.0"
        } else {
            &self.host
        }
    }
}

impl Default for ListenAddr {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ListenAddr {
    type Err = SparkledError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.strip_prefix(SCHEME_PREFIX).unwrap_or(s);
        if s.is_empty() {
            return Err(SparkledError::Config("empty listen address".to_string()));
        }

        // [v6]:port
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| {
                SparkledError::Config(format!("unterminated IPv6 address: {}", s))
            })?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(port)?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => {
                    return Err(SparkledError::Config(format!("invalid address: {}", s)))
                }
            };
            return Ok(Self::new(host, port));
        }

        match s.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                let host = if host.is_empty() { WILDCARD_HOST } else { host };
                Ok(Self::new(host, parse_port(port)?))
            }
            // bare host, or an unbracketed IPv6 address
            _ => Ok(Self::new(s, DEFAULT_PORT)),
        }
    }
}

fn parse_port(s: &str) -> Result<u16> {
    s.parse::<u16>()
        .map_err(|e| SparkledError::Config(format!("invalid port number: {} -- {}", s, e)))
}

/// Parse permission bits written in octal (`644`, `0644`, `0o644`)
pub fn parse_permissions(s: &str) -> Result<u32> {
    let digits = s.strip_prefix("0o").unwrap_or(s);
    let mode = u32::from_str_radix(digits, 8)
        .map_err(|e| SparkledError::Config(format!("invalid permissions: {} -- {}", s, e)))?;
    if mode == 0 || mode > 0o7777 {
        return Err(SparkledError::Config(format!(
            "permissions out of range: 0 < {:o} <= 7777",
            mode
        )));
    }
    Ok(mode)
}

// =============================================================================
// Config
// =============================================================================

/// Main configuration for a sparkled instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Network Configuration
    // -------------------------------------------------------------------------
    /// TCP listen address
    pub listen: ListenAddr,

    /// Number of worker threads, each with its own event loop
    pub workers: usize,

    /// Maximum bytes read per service call
    pub bucket_size: usize,

    /// Close connections idle for longer than this (never when `None`)
    pub idle_timeout: Option<Duration>,

    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Environment directory (or data file with `EnvFlags::NO_SUBDIR`)
    pub data_dir: PathBuf,

    /// Size bound of the memory-mapped environment (bytes)
    pub map_size: u64,

    /// Environment open flags
    pub env_flags: EnvFlags,

    /// Permission bits for created storage files
    pub permissions: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenAddr::default(),
            workers: DEFAULT_WORKERS,
            bucket_size: default_bucket_size(),
            idle_timeout: None,
            data_dir: default_data_dir(),
            map_size: DEFAULT_MAP_SIZE,
            env_flags: EnvFlags::EMPTY,
            permissions: DEFAULT_PERMISSIONS,
        }
    }
}

/// One page, bounded by `MAX_BUCKET_SIZE`
pub fn default_bucket_size() -> usize {
    (page_size() as usize).min(MAX_BUCKET_SIZE)
}

/// Directory holding the running executable, or the current directory
fn default_data_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check every invariant
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(SparkledError::Config(format!(
                "worker count must be within 1..={}, got {}",
                MAX_WORKERS, self.workers
            )));
        }
        if self.bucket_size == 0 || self.bucket_size > MAX_BUCKET_SIZE {
            return Err(SparkledError::Config(format!(
                "bucket size must be within 1..={}, got {}",
                MAX_BUCKET_SIZE, self.bucket_size
            )));
        }
        if self.map_size == 0 {
            return Err(SparkledError::Config(
                "map size must be greater than zero".to_string(),
            ));
        }
        if self.permissions == 0 || self.permissions > 0o7777 {
            return Err(SparkledError::Config(format!(
                "permissions out of range: {:o}",
                self.permissions
            )));
        }
        if self.idle_timeout == Some(Duration::ZERO) {
            return Err(SparkledError::Config(
                "idle timeout must be greater than zero".to_string(),
            ));
        }
        if self.listen.host.is_empty() {
            return Err(SparkledError::Config("empty listen host".to_string()));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the TCP listen address
    pub fn listen(mut self, addr: ListenAddr) -> Self {
        self.config.listen = addr;
        self
    }

    /// Parse and set the TCP listen address
    pub fn listen_addr(mut self, addr: &str) -> Result<Self> {
        self.config.listen = addr.parse()?;
        Ok(self)
    }

    /// Set the number of workers
    pub fn workers(mut self, count: usize) -> Self {
        self.config.workers = count;
        self
    }

    /// Set the per-call read size (in bytes)
    pub fn bucket_size(mut self, size: usize) -> Self {
        self.config.bucket_size = size;
        self
    }

    /// Set the idle connection timeout
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set the storage directory
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the storage size bound (in bytes)
    pub fn map_size(mut self, size: u64) -> Self {
        self.config.map_size = size;
        self
    }

    /// Set the environment open flags
    pub fn env_flags(mut self, flags: EnvFlags) -> Self {
        self.config.env_flags = flags;
        self
    }

    /// Set the storage file permission bits
    pub fn permissions(mut self, mode: u32) -> Self {
        self.config.permissions = mode;
        self
    }

    /// Validate and return the config
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_and_port() {
        let addr: ListenAddr = "127.0.0.1:8080".parse().unwrap();
        assert_eq!(addr, ListenAddr::new("127.0.0.1", 8080));
    }

    #[test]
    fn test_parse_scheme_and_wildcard() {
        let addr: ListenAddr = "tcp://*:1977".parse().unwrap();
        assert!(addr.is_wildcard());
        assert_eq!(addr.resolvable_host(), "0.0.0.0");
        assert_eq!(addr.port, 1977);
    }

    #[test]
    fn test_parse_without_port_uses_default() {
        let addr: ListenAddr = "localhost".parse().unwrap();
        assert_eq!(addr, ListenAddr::new("localhost", DEFAULT_PORT));
    }

    #[test]
    fn test_parse_ipv6() {
        let addr: ListenAddr = "[::1]:9000".parse().unwrap();
        assert_eq!(addr, ListenAddr::new("::1", 9000));
        assert_eq!(addr.to_string(), "[::1]:9000");
    }

    #[test]
    fn test_parse_rejects_bad_port() {
        assert!("127.0.0.1:99999".parse::<ListenAddr>().is_err());
        assert!("127.0.0.1:http".parse::<ListenAddr>().is_err());
        assert!("".parse::<ListenAddr>().is_err());
    }

    #[test]
    fn test_parse_permissions() {
        assert_eq!(parse_permissions("644").unwrap(), 0o644);
        assert_eq!(parse_permissions("0o600").unwrap(), 0o600);
        assert!(parse_permissions("0").is_err());
        assert!(parse_permissions("10000").is_err());
        assert!(parse_permissions("9").is_err());
    }

    #[test]
    fn test_build_rejects_invalid_values() {
        assert!(Config::builder().workers(0).build().is_err());
        assert!(Config::builder().workers(256).build().is_err());
        assert!(Config::builder().bucket_size(0).build().is_err());
        assert!(Config::builder()
            .bucket_size(MAX_BUCKET_SIZE + 1)
            .build()
            .is_err());
        assert!(Config::builder()
            .bucket_size(MAX_BUCKET_SIZE)
            .build()
            .is_ok());
        assert!(Config::builder().map_size(0).build().is_err());
        assert!(Config::builder()
            .idle_timeout(Some(Duration::ZERO))
            .build()
            .is_err());
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::builder().build().unwrap();
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert_eq!(config.listen.port, DEFAULT_PORT);
        assert_eq!(config.permissions, 0o644);
        assert!(config.bucket_size > 0);
        assert!(config.bucket_size <= MAX_BUCKET_SIZE);
    }
}
