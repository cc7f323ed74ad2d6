//! sparkled Server Binary
//!
//! Parses the command line, then hands over to the supervisor until a
//! termination signal arrives.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use sparkled::config::{default_bucket_size, parse_permissions, DEFAULT_WORKERS};
use sparkled::signal::SignalSet;
use sparkled::{Config, EnvFlags, Result, Supervisor};
use tracing_subscriber::{fmt, EnvFilter};

/// sparkled Server
#[derive(Parser, Debug)]
#[command(name = "sparkled")]
#[command(about = "Multi-threaded TCP daemon over a memory-mapped key-value environment")]
#[command(version)]
struct Args {
    /// Number of worker threads (0 selects the default)
    #[arg(short = 't', long = "threads", default_value_t = DEFAULT_WORKERS)]
    threads: usize,

    /// Bytes read per service call (0 selects the page size, at most 16 KiB)
    #[arg(short = 'b', long = "bucket-size", default_value_t = 0)]
    bucket_size: usize,

    /// Storage size bound in MiB (0 selects 1 MiB)
    #[arg(short = 'm', long = "map-size", default_value_t = 10)]
    map_size_mb: u64,

    /// Storage directory (defaults to the executable's directory)
    #[arg(short = 'd', long = "dir")]
    dir: Option<PathBuf>,

    /// Storage file permissions, in octal
    #[arg(short = 'p', long = "perm", default_value = "644")]
    perm: String,

    /// Storage open flag (repeatable)
    #[arg(short = 'f', long = "flag", value_enum)]
    flags: Vec<FlagArg>,

    /// Close connections idle for this many seconds
    #[arg(long = "idle-timeout")]
    idle_timeout: Option<u64>,

    /// Listen address (host:port, `*` for every interface)
    #[arg(default_value = "127.0.0.1:1977")]
    listen: String,
}

/// Storage open flags accepted on the command line
#[derive(ValueEnum, Clone, Copy, Debug)]
enum FlagArg {
    ReadOnly,
    NoSubdir,
    WriteMap,
    NoSync,
    MapAsync,
    NoLock,
}

impl From<FlagArg> for EnvFlags {
    fn from(flag: FlagArg) -> Self {
        match flag {
            FlagArg::ReadOnly => EnvFlags::READ_ONLY,
            FlagArg::NoSubdir => EnvFlags::NO_SUBDIR,
            FlagArg::WriteMap => EnvFlags::WRITE_MAP,
            FlagArg::NoSync => EnvFlags::NO_SYNC,
            FlagArg::MapAsync => EnvFlags::MAP_ASYNC,
            FlagArg::NoLock => EnvFlags::NO_LOCK,
        }
    }
}

/// Build config from args
fn build_config(args: &Args) -> Result<Config> {
    const MIB: u64 = 1024 * 1024;

    let threads = if args.threads == 0 { DEFAULT_WORKERS } else { args.threads };
    let bucket_size = if args.bucket_size == 0 {
        default_bucket_size()
    } else {
        args.bucket_size
    };
    let map_size = args.map_size_mb.max(1).saturating_mul(MIB);
    let flags = args
        .flags
        .iter()
        .fold(EnvFlags::EMPTY, |acc, flag| acc | EnvFlags::from(*flag));

    let mut builder = Config::builder()
        .listen_addr(&args.listen)?
        .workers(threads)
        .bucket_size(bucket_size)
        .map_size(map_size)
        .env_flags(flags)
        .permissions(parse_permissions(&args.perm)?)
        .idle_timeout(args.idle_timeout.map(Duration::from_secs));
    if let Some(dir) = &args.dir {
        builder = builder.data_dir(dir);
    }
    builder.build()
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sparkled=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .init();

    let args = Args::parse();

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            process::exit(1);
        }
    };

    tracing::info!("sparkled v{}", sparkled::VERSION);
    tracing::info!("Storage directory: {}", config.data_dir.display());
    tracing::info!("Listen address: {}", config.listen);

    // Block termination signals before any worker thread exists
    let signals = match SignalSet::termination().and_then(|set| set.block().map(|()| set)) {
        Ok(set) => set,
        Err(e) => {
            tracing::error!("Failed to block signals: {}", e);
            process::exit(1);
        }
    };

    tracing::info!("starting");
    let supervisor = match Supervisor::start(config) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            tracing::error!("Startup failed: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = supervisor.await_termination(&signals) {
        tracing::error!("{}", e);
    }

    if let Err(e) = supervisor.shutdown() {
        tracing::error!("Shutdown failed: {}", e);
        process::exit(1);
    }

    tracing::info!("byebye!");
}
