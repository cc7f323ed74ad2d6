//! sparkled CLI Client
//!
//! Sends one payload to a running daemon and prints whatever comes back.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::process;
use std::time::Duration;

use clap::Parser;

/// sparkled CLI
#[derive(Parser, Debug)]
#[command(name = "sparkled-cli")]
#[command(about = "Send a payload to a sparkled daemon")]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:1977")]
    server: String,

    /// Read timeout in milliseconds
    #[arg(short, long, default_value = "5000")]
    timeout_ms: u64,

    /// Payload to send (nothing is sent when omitted)
    payload: Option<String>,
}

fn exchange(args: &Args) -> io::Result<Vec<u8>> {
    let mut stream = TcpStream::connect(&args.server)?;
    stream.set_read_timeout(Some(Duration::from_millis(args.timeout_ms)))?;

    if let Some(payload) = &args.payload {
        stream.write_all(payload.as_bytes())?;
    }
    stream.shutdown(Shutdown::Write)?;

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply)?;
    Ok(reply)
}

fn main() {
    let args = Args::parse();

    match exchange(&args) {
        Ok(reply) => {
            let mut stdout = io::stdout();
            let _ = stdout.write_all(&reply);
            if !reply.is_empty() {
                let _ = stdout.write_all(b"\n");
            }
        }
        Err(e) => {
            eprintln!("{}: {}", args.server, e);
            process::exit(1);
        }
    }
}
