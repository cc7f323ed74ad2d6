//! Tests for the `sparkled` binary
//!
//! These tests verify:
//! - The daemon serves echo on the configured address
//! - A termination signal shuts it down with exit status 0
//! - Invalid command lines fail before anything is bound

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn spawn_daemon(dir: &Path, port: u16, threads: usize) -> Child {
    Command::new(env!("CARGO_BIN_EXE_sparkled"))
        .arg("-d")
        .arg(dir)
        .arg("-t")
        .arg(threads.to_string())
        .arg(format!("127.0.0.1:{}", port))
        .env("RUST_LOG", "warn")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap()
}

fn connect_with_retry(port: u16) -> TcpStream {
    let deadline = Instant::now() + STARTUP_TIMEOUT;
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => {
                stream
                    .set_read_timeout(Some(Duration::from_secs(5)))
                    .unwrap();
                return stream;
            }
            Err(_) if Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(20));
            }
            Err(e) => panic!("daemon never accepted on port {}: {}", port, e),
        }
    }
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().unwrap() {
            return Some(status);
        }
        thread::sleep(Duration::from_millis(20));
    }
    let _ = child.kill();
    None
}

fn send_signal(child: &Child, signo: libc::c_int) {
    let rc = unsafe { libc::kill(child.id() as libc::pid_t, signo) };
    assert_eq!(rc, 0);
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_daemon_echoes_and_stops_on_sigterm() {
    let temp = TempDir::new().unwrap();
    let port = free_port();
    let mut child = spawn_daemon(temp.path(), port, 2);

    let mut stream = connect_with_retry(port);
    stream.write_all(b"hello").unwrap();
    stream.shutdown(Shutdown::Write).unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).unwrap();
    assert_eq!(reply, b"hello");

    // Connections still open at shutdown must not hold it up
    let _held: Vec<TcpStream> = (0..2).map(|_| connect_with_retry(port)).collect();

    send_signal(&child, libc::SIGTERM);
    let status = wait_with_timeout(&mut child, Duration::from_secs(10));

    assert_eq!(status.and_then(|s| s.code()), Some(0));
    assert!(temp.path().join("data.mdb").is_file());
}

#[test]
fn test_daemon_stops_on_sigint() {
    let temp = TempDir::new().unwrap();
    let port = free_port();
    let mut child = spawn_daemon(temp.path(), port, 1);

    drop(connect_with_retry(port));
    send_signal(&child, libc::SIGINT);
    let status = wait_with_timeout(&mut child, Duration::from_secs(10));

    assert_eq!(status.and_then(|s| s.code()), Some(0));
}

// =============================================================================
// Command Line Tests
// =============================================================================

fn run_to_completion(args: &[&str], dir: &Path) -> ExitStatus {
    let mut child = Command::new(env!("CARGO_BIN_EXE_sparkled"))
        .arg("-d")
        .arg(dir)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    wait_with_timeout(&mut child, STARTUP_TIMEOUT).expect("daemon should exit on its own")
}

#[test]
fn test_invalid_permissions_exit_nonzero() {
    let temp = TempDir::new().unwrap();

    let status = run_to_completion(&["-p", "999", "127.0.0.1:0"], temp.path());

    assert!(!status.success());
}

#[test]
fn test_too_many_threads_exit_nonzero() {
    let temp = TempDir::new().unwrap();

    let status = run_to_completion(&["-t", "1000", "127.0.0.1:0"], temp.path());

    assert!(!status.success());
}

#[test]
fn test_oversized_bucket_exit_nonzero() {
    let temp = TempDir::new().unwrap();

    let status = run_to_completion(&["-b", "1048576", "127.0.0.1:0"], temp.path());

    assert!(!status.success());
}

#[test]
fn test_occupied_port_exit_nonzero() {
    let temp = TempDir::new().unwrap();
    let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = occupied.local_addr().unwrap().to_string();

    let status = run_to_completion(&[&addr], temp.path());

    assert!(!status.success());
}
