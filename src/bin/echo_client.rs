//! Echo client: kirim satu pesan, tunggu balasan dengan panjang yang sama.
//!
//! Usage:
//!   cargo run --release --bin echo_client -- --host 127.0.0.1 --port 42069 --message hello

use std::sync::mpsc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use netkit::client::DEFAULT_CAPACITY;
use netkit::{AsyncClient, ClientConfig, Encoding};

/// Client configuration
struct EchoConfig {
    host: String,
    port: u16,
    message: String,
    timeout_secs: u64,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: netkit::server::DEFAULT_PORT,
            message: "hello".to_string(),
            timeout_secs: 5,
        }
    }
}

fn parse_args() -> EchoConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = EchoConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                if i + 1 < args.len() {
                    config.host = args[i + 1].clone();
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    config.port = args[i + 1].parse().unwrap_or(config.port);
                    i += 1;
                }
            }
            "--message" | "-m" => {
                if i + 1 < args.len() {
                    config.message = args[i + 1].clone();
                    i += 1;
                }
            }
            "--timeout" => {
                if i + 1 < args.len() {
                    config.timeout_secs = args[i + 1].parse().unwrap_or(5);
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    config
}

/// Bytes the server echoes back: one per character after ASCII encoding.
fn echo_len(message: &str) -> usize {
    Encoding::Ascii.encode(message).len()
}

enum Outcome {
    Echo(String),
    Failed(String),
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = parse_args();
    let expected = echo_len(&config.message);
    let client_config = ClientConfig::new(config.host.clone(), config.port)
        .with_receive_buffer_capacity(expected.max(DEFAULT_CAPACITY));
    let client = AsyncClient::with_config(client_config);

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    {
        let tx = Mutex::new(tx.lock().clone());
        client.events().received.subscribe(move |text: &String| {
            let _ = tx.lock().send(Outcome::Echo(text.clone()));
        });
    }
    client.events().error.subscribe(move |err| {
        let _ = tx.lock().send(Outcome::Failed(err.to_string()));
    });
    client
        .events()
        .sent
        .subscribe(|n| tracing::info!(bytes = *n, "sent"));

    client.connect();
    if !client.is_connected() {
        if let Ok(Outcome::Failed(e)) = rx.recv_timeout(Duration::from_millis(100)) {
            eprintln!("❌ Connect failed: {}", e);
        }
        std::process::exit(1);
    }

    client.receive(expected);
    client.send(&config.message, Encoding::Ascii);

    match rx.recv_timeout(Duration::from_secs(config.timeout_secs)) {
        Ok(Outcome::Echo(text)) => println!("{}", text),
        Ok(Outcome::Failed(e)) => {
            eprintln!("❌ {}", e);
            std::process::exit(1);
        }
        Err(_) => {
            eprintln!("❌ No echo within {}s", config.timeout_secs);
            std::process::exit(1);
        }
    }
    client.close();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_len_counts_characters() {
        assert_eq!(echo_len("hello"), 5);
        // "héllo" = 6 byte UTF-8, tapi 5 byte setelah encode ASCII
        assert_eq!(echo_len("h\u{e9}llo"), 5);
    }
}
