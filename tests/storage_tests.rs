//! Tests for the storage environment and backend
//!
//! These tests verify:
//! - Directory and file layout on open
//! - Map size validation and rounding
//! - Lock exclusivity and release on close
//! - Read-only and no-subdir modes
//! - Meta page corruption detection
//! - Backend close idempotence

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use sparkled::storage::{
    page_size, Backend, EchoService, EnvFlags, Environment, Outcome, DATA_FILENAME,
    LOCK_FILENAME,
};
use sparkled::{Config, SparkledError, StorageInitError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const MAP_SIZE: u64 = 1024 * 1024;

fn setup_temp_env_dir() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("env");
    (temp_dir, path)
}

fn open_env(path: &PathBuf, flags: EnvFlags) -> Result<Environment, StorageInitError> {
    Environment::builder()
        .map_size(MAP_SIZE)
        .flags(flags)
        .open(path, 0o644)
}

// =============================================================================
// Open/Create Tests
// =============================================================================

#[test]
fn test_open_creates_directory_and_files() {
    let (_temp, path) = setup_temp_env_dir();
    assert!(!path.exists());

    let env = open_env(&path, EnvFlags::EMPTY).unwrap();

    assert!(path.is_dir());
    assert!(path.join(DATA_FILENAME).is_file());
    assert!(path.join(LOCK_FILENAME).is_file());
    assert_eq!(env.path(), path);
    assert_eq!(env.data_path(), path.join(DATA_FILENAME));
    env.close().unwrap();
}

#[test]
fn test_data_file_sized_to_map() {
    let (_temp, path) = setup_temp_env_dir();

    let env = open_env(&path, EnvFlags::EMPTY).unwrap();

    assert_eq!(env.map_size(), MAP_SIZE);
    assert_eq!(env.as_bytes().len() as u64, MAP_SIZE);
    let len = fs::metadata(path.join(DATA_FILENAME)).unwrap().len();
    assert_eq!(len, MAP_SIZE);
}

#[test]
fn test_map_size_rounded_up_to_page() {
    let (_temp, path) = setup_temp_env_dir();
    let page = page_size();

    let env = Environment::builder()
        .map_size(page + 1)
        .open(&path, 0o644)
        .unwrap();

    assert_eq!(env.map_size(), page * 2);
}

#[test]
fn test_map_size_below_page_rejected() {
    let (_temp, path) = setup_temp_env_dir();

    let err = Environment::builder()
        .map_size(16)
        .open(&path, 0o644)
        .unwrap_err();

    assert!(matches!(err, StorageInitError::MapSize { size: 16, .. }));
    assert!(!path.exists(), "nothing should be created on a size failure");
}

#[test]
fn test_reopen_keeps_meta() {
    let (_temp, path) = setup_temp_env_dir();

    let created_at = {
        let env = open_env(&path, EnvFlags::EMPTY).unwrap();
        let info = env.info();
        env.close().unwrap();
        info.created_at
    };

    let env = open_env(&path, EnvFlags::EMPTY).unwrap();
    assert_eq!(env.info().created_at, created_at);
    assert_eq!(env.info().page_size, page_size());
}

#[test]
fn test_reopen_with_larger_map_grows_file() {
    let (_temp, path) = setup_temp_env_dir();
    open_env(&path, EnvFlags::EMPTY).unwrap().close().unwrap();

    let env = Environment::builder()
        .map_size(MAP_SIZE * 2)
        .open(&path, 0o644)
        .unwrap();

    assert_eq!(env.map_size(), MAP_SIZE * 2);
}

#[test]
fn test_path_is_a_file_rejected() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("plain");
    fs::write(&path, b"not a directory").unwrap();

    let err = open_env(&path, EnvFlags::EMPTY).unwrap_err();
    assert!(matches!(err, StorageInitError::Open { .. }));
}

// =============================================================================
// Lock Tests
// =============================================================================

#[test]
fn test_second_open_is_locked() {
    let (_temp, path) = setup_temp_env_dir();

    let _first = open_env(&path, EnvFlags::EMPTY).unwrap();
    let err = open_env(&path, EnvFlags::EMPTY).unwrap_err();

    assert!(matches!(err, StorageInitError::Locked { .. }));
}

#[test]
fn test_lock_released_on_close() {
    let (_temp, path) = setup_temp_env_dir();

    open_env(&path, EnvFlags::EMPTY).unwrap().close().unwrap();
    let again = open_env(&path, EnvFlags::EMPTY);

    assert!(again.is_ok());
}

#[test]
fn test_no_lock_allows_second_open() {
    let (_temp, path) = setup_temp_env_dir();

    let _first = open_env(&path, EnvFlags::NO_LOCK).unwrap();
    let second = open_env(&path, EnvFlags::NO_LOCK);

    assert!(second.is_ok());
    assert!(!path.join(LOCK_FILENAME).exists());
}

// =============================================================================
// Flag Tests
// =============================================================================

#[test]
fn test_no_subdir_layout() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("store.mdb");

    let env = open_env(&path, EnvFlags::NO_SUBDIR).unwrap();

    assert!(path.is_file());
    assert!(temp.path().join("store.mdb-lock").is_file());
    assert_eq!(env.data_path(), path);
}

#[test]
fn test_read_only_requires_existing_environment() {
    let (_temp, path) = setup_temp_env_dir();

    let err = open_env(&path, EnvFlags::READ_ONLY).unwrap_err();

    assert!(matches!(err, StorageInitError::Open { .. }));
    assert!(!path.exists());
}

#[test]
fn test_read_only_opens_existing_environment() {
    let (_temp, path) = setup_temp_env_dir();
    open_env(&path, EnvFlags::EMPTY).unwrap().close().unwrap();

    let env = open_env(&path, EnvFlags::READ_ONLY).unwrap();

    assert_eq!(env.map_size(), MAP_SIZE);
    assert!(env.flags().contains(EnvFlags::READ_ONLY));
    env.close().unwrap();
}

#[test]
fn test_write_map_and_sync_flags_close_cleanly() {
    for flags in [
        EnvFlags::WRITE_MAP,
        EnvFlags::WRITE_MAP | EnvFlags::MAP_ASYNC,
        EnvFlags::WRITE_MAP | EnvFlags::NO_SYNC,
        EnvFlags::NO_SYNC,
    ] {
        let (_temp, path) = setup_temp_env_dir();
        let env = open_env(&path, flags).unwrap();
        env.sync().unwrap();
        env.close().unwrap();
    }
}

// =============================================================================
// Corruption Tests
// =============================================================================

#[test]
fn test_corrupt_meta_detected() {
    let (_temp, path) = setup_temp_env_dir();
    open_env(&path, EnvFlags::EMPTY).unwrap().close().unwrap();

    let mut file = OpenOptions::new()
        .write(true)
        .open(path.join(DATA_FILENAME))
        .unwrap();
    file.seek(SeekFrom::Start(10)).unwrap();
    file.write_all(&[0xFF; 4]).unwrap();
    drop(file);

    let err = open_env(&path, EnvFlags::EMPTY).unwrap_err();
    assert!(matches!(err, StorageInitError::Corrupt { .. }));

    // The failed open must not keep the lock
    assert!(!matches!(
        open_env(&path, EnvFlags::EMPTY).unwrap_err(),
        StorageInitError::Locked { .. }
    ));
}

// =============================================================================
// Backend Tests
// =============================================================================

fn setup_backend() -> (TempDir, Backend) {
    let temp = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp.path().join("db"))
        .map_size(MAP_SIZE)
        .build()
        .unwrap();
    let backend = Backend::open(&config).unwrap();
    (temp, backend)
}

#[test]
fn test_backend_open_reports_info() {
    let (temp, backend) = setup_backend();

    let info = backend.info().unwrap();
    assert!(backend.is_open());
    assert_eq!(info.path, temp.path().join("db"));
    assert_eq!(info.map_size, MAP_SIZE);
}

#[test]
fn test_backend_close_is_idempotent() {
    let (_temp, backend) = setup_backend();

    assert!(backend.close().unwrap());
    assert!(!backend.close().unwrap());
    assert!(!backend.is_open());
    assert!(backend.info().is_none());
}

#[test]
fn test_backend_service_after_close_closes_without_io() {
    let (_temp, backend) = setup_backend();
    backend.close().unwrap();

    let mut stream = std::io::Cursor::new(b"hello".to_vec());
    let outcome = backend.service(&mut stream).unwrap();

    assert_eq!(outcome, Outcome::Close);
    assert_eq!(stream.position(), 0);
}

#[test]
fn test_backend_releases_environment_on_drop() {
    let temp = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp.path().join("db"))
        .map_size(MAP_SIZE)
        .build()
        .unwrap();

    drop(Backend::open(&config).unwrap());

    assert!(Backend::open(&config).is_ok());
}

#[test]
fn test_backend_open_failure_is_storage_init_error() {
    let temp = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp.path().join("missing"))
        .env_flags(EnvFlags::READ_ONLY)
        .map_size(MAP_SIZE)
        .build()
        .unwrap();

    let err = Backend::open_with(&config, Box::new(EchoService::new(16))).err().unwrap();

    assert!(matches!(err, SparkledError::StorageInit(_)));
    assert!(err.is_fatal());
}
