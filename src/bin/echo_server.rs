//! Echo server di atas worker pool.
//!
//! Setiap koneksi: baca satu chunk, kirim balik apa adanya, tutup.
//!
//! Usage:
//!   cargo run --release --bin echo_server -- [OPTIONS]

use std::io::{Read, Write};
use std::net::IpAddr;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use netkit::server::{DEFAULT_ADDRESS, DEFAULT_PORT};
use netkit::{Connection, DispatchStrategy, Server, ServerConfig};

const CHUNK_SIZE: usize = 4096;

/// Echo server configuration
struct EchoConfig {
    address: IpAddr,
    port: u16,
    workers: Option<usize>,
    unbounded: bool,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS,
            port: DEFAULT_PORT,
            workers: None,
            unbounded: false,
        }
    }
}

fn parse_args() -> EchoConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = EchoConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--address" | "-a" => {
                if i + 1 < args.len() {
                    config.address = args[i + 1].parse().unwrap_or(DEFAULT_ADDRESS);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    config.port = args[i + 1].parse().unwrap_or(DEFAULT_PORT);
                    i += 1;
                }
            }
            "--workers" | "-w" => {
                if i + 1 < args.len() {
                    config.workers = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            "--unbounded" => {
                config.unbounded = true;
            }
            "--help" | "-h" => {
                println!("Netkit echo server\n");
                println!("Usage: echo_server [OPTIONS]\n");
                println!("Options:");
                println!("  -a, --address <IP>    Bind address (default: 127.0.0.1)");
                println!("  -p, --port <PORT>     Bind port (default: 42069)");
                println!("  -w, --workers <N>     Worker pool size (default: CPU count)");
                println!("      --unbounded       One thread per connection instead of a pool");
                println!("  -h, --help            Show this help");
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

fn echo(conn: &Connection) {
    let mut stream = conn.stream();
    let mut buf = [0u8; CHUNK_SIZE];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => {
            if let Err(e) = stream.write_all(&buf[..n]) {
                warn!(peer = %conn.peer_addr(), error = %e, "echo write failed");
            }
        }
        Err(e) => warn!(peer = %conn.peer_addr(), error = %e, "echo read failed"),
    }
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = parse_args();
    let strategy = match (config.unbounded, config.workers) {
        (true, _) => DispatchStrategy::Unbounded,
        (false, Some(max_workers)) => DispatchStrategy::Bounded { max_workers },
        (false, None) => DispatchStrategy::bounded_default(),
    };

    let server_config = ServerConfig::new(config.address, config.port).with_strategy(strategy);
    let mut server = match Server::new(server_config) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("❌ Server error: {}", e);
            std::process::exit(1);
        }
    };
    server.handle_client().subscribe(|conn| {
        echo(conn);
        if let Some(n) = conn.in_flight() {
            info!(peer = %conn.peer_addr(), in_flight = n, "echo done");
        }
    });

    if let Err(e) = server.start() {
        eprintln!("❌ Server error: {}", e);
        std::process::exit(1);
    }

    // Jalan sampai accept loop berhenti sendiri
    while server.is_running() {
        std::thread::sleep(Duration::from_millis(250));
    }
    server.close();
}
