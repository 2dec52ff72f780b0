//! tempo-client — one blocking round trip against a tempo server.
//!
//! Connects, sends a payload, reads the same number of bytes back, and
//! exits non-zero on mismatch or timeout. Startup-only blocking I/O; the
//! non-blocking machinery lives server-side.
//!
//! Usage:
//!     tempo-client [--host <ip>] [--port <1-65535>] [--timeout-ms <n>]
//!                  [--message <text>] [--version] [--help]

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::process::ExitCode;
use std::time::Duration;

fn print_help() {
    println!("tempo-client — usage:");
    println!("  tempo-client [--host <ip>] [--port <1-65535>] [--timeout-ms <n>]");
    println!("               [--message <text>] [--version] [--help]");
    println!();
    println!("Options:");
    println!("  --host <ip>                Server address (default: 127.0.0.1)");
    println!("  --port <n>                 TCP port (default: 7070)");
    println!("  --timeout-ms <n>           Connect/read timeout in ms (default: 2000)");
    println!("  --message <text>           Payload to send (default: \"ping\")");
    println!("  --version                  Print version and exit");
    println!("  --help                     Show this help and exit");
}

struct ClientConfig {
    host: IpAddr,
    port: u16,
    timeout: Duration,
    message: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 7070,
            timeout: Duration::from_millis(2000),
            message: "ping".to_string(),
        }
    }
}

fn parse_cli(mut argv: impl Iterator<Item = String>) -> Result<Option<ClientConfig>, String> {
    let mut config = ClientConfig::default();

    while let Some(tok) = argv.next() {
        let mut take = |name: &str| -> Result<String, String> {
            argv.next().ok_or_else(|| format!("--{} needs a value", name))
        };
        match tok.as_str() {
            "--help" => {
                print_help();
                return Ok(None);
            }
            "--version" => {
                println!("tempo-client {}", env!("CARGO_PKG_VERSION"));
                return Ok(None);
            }
            "--host" => {
                let raw = take("host")?;
                config.host = raw.parse().map_err(|e| format!("invalid --host: {}", e))?;
            }
            "--port" => {
                let raw = take("port")?;
                config.port = raw.parse().map_err(|e| format!("invalid --port: {}", e))?;
            }
            "--timeout-ms" => {
                let raw = take("timeout-ms")?;
                let ms: u64 = raw.parse().map_err(|e| format!("invalid --timeout-ms: {}", e))?;
                config.timeout = Duration::from_millis(ms);
            }
            "--message" => {
                config.message = take("message")?;
            }
            other => return Err(format!("unexpected argument: {:?}", other)),
        }
    }

    if config.port == 0 {
        return Err("invalid --port: 0".to_string());
    }
    Ok(Some(config))
}

fn round_trip(config: &ClientConfig) -> Result<(), String> {
    let addr = SocketAddr::new(config.host, config.port);
    let mut stream = TcpStream::connect_timeout(&addr, config.timeout)
        .map_err(|e| format!("connect {}: {}", addr, e))?;
    stream
        .set_read_timeout(Some(config.timeout))
        .and_then(|_| stream.set_write_timeout(Some(config.timeout)))
        .map_err(|e| format!("set timeouts: {}", e))?;

    let payload = config.message.as_bytes();
    stream
        .write_all(payload)
        .map_err(|e| format!("send: {}", e))?;

    let mut echoed = vec![0u8; payload.len()];
    stream
        .read_exact(&mut echoed)
        .map_err(|e| format!("recv: {}", e))?;

    if echoed != payload {
        return Err(format!(
            "echo mismatch: sent {:?}, got {:?}",
            String::from_utf8_lossy(payload),
            String::from_utf8_lossy(&echoed)
        ));
    }

    println!("{}", String::from_utf8_lossy(&echoed));
    Ok(())
}

fn main() -> ExitCode {
    let config = match parse_cli(std::env::args().skip(1)) {
        Ok(Some(config)) => config,
        Ok(None) => return ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("tempo-client ERR :: {}", msg);
            return ExitCode::FAILURE;
        }
    };

    match round_trip(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("tempo-client ERR :: {}", msg);
            ExitCode::FAILURE
        }
    }
}
