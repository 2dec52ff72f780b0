//! tempod — the tempo server daemon.
//!
//! The storage engine does not exist yet; the daemon brings up the
//! non-blocking TCP core and serves the echo protocol so the I/O path can
//! be exercised end to end. Storage-related options are parsed and
//! validated now so deployments settle their config early.
//!
//! Usage:
//!     tempod [--host <ip>] [--port <1-65535>] [--data-dir <path>]
//!            [--wal-sync <append|fdatasync>] [--memtable-bytes <n>]
//!            [--max-connections <n>] [--dry-run] [--version] [--help]

mod args;

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use tempo_core::{metrics, tinfo, tlog};
use tempo_net::signalfd::block_shutdown_signals;
use tempo_net::socket::bind_listener;
use tempo_net::{Echo, Reactor};

use args::Args;

const LISTEN_BACKLOG: i32 = 1024;

fn print_help() {
    println!("tempod — usage:");
    println!("  tempod [--host <ip>] [--port <1-65535>] [--data-dir <path>]");
    println!("         [--wal-sync <append|fdatasync>] [--memtable-bytes <n>]");
    println!("         [--max-connections <n>] [--version] [--help] [--dry-run]");
    println!();
    println!("Options:");
    println!("  --host <ip>                Bind address (default: 0.0.0.0)");
    println!("  --port <n>                 TCP port (default: 7070)");
    println!("  --data-dir <path>          Data directory (default: ./data)");
    println!("  --wal-sync <mode>          WAL durability: append | fdatasync (default: append)");
    println!("  --memtable-bytes <n>       Target memtable size in bytes (default: 67108864)");
    println!("  --max-connections <n>      Max concurrent connections (default: 1024)");
    println!("  --dry-run                  Print the resolved config and exit");
    println!("  --version                  Print version and exit");
    println!("  --help                     Show this help and exit");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalSyncPolicy {
    Append,
    Fdatasync,
}

impl WalSyncPolicy {
    fn as_str(self) -> &'static str {
        match self {
            Self::Append => "append",
            Self::Fdatasync => "fdatasync",
        }
    }
}

impl FromStr for WalSyncPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "append" => Ok(Self::Append),
            "fdatasync" => Ok(Self::Fdatasync),
            other => Err(format!("expected append|fdatasync (got {:?})", other)),
        }
    }
}

#[derive(Debug)]
struct ServerConfig {
    host: Ipv4Addr,
    port: u16,
    data_dir: PathBuf,
    wal_sync_policy: WalSyncPolicy,
    memtable_bytes: u64,
    max_connections: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::UNSPECIFIED,
            port: 7070,
            data_dir: PathBuf::from("./data"),
            wal_sync_policy: WalSyncPolicy::Append,
            memtable_bytes: 67_108_864,
            max_connections: 1024,
        }
    }
}

impl ServerConfig {
    fn from_cli(args: &mut Args) -> Result<Self, String> {
        let mut config = Self::default();

        // 1) Parse
        if let Some(v) = args.pop_kv("host")? {
            config.host = v;
        }
        if let Some(v) = args.pop_kv("port")? {
            config.port = v;
        }
        if let Some(v) = args.pop_kv::<PathBuf>("data-dir")? {
            config.data_dir = v;
        }
        if let Some(v) = args.pop_kv("wal-sync")? {
            config.wal_sync_policy = v;
        }
        if let Some(v) = args.pop_kv("memtable-bytes")? {
            config.memtable_bytes = v;
        }
        if let Some(v) = args.pop_kv("max-connections")? {
            config.max_connections = v;
        }

        // 2) Validate
        if config.port == 0 {
            return Err("invalid_port: expected 1..65535 (got 0)".to_string());
        }

        let exists = config.data_dir.exists();
        if exists && !config.data_dir.is_dir() {
            return Err(format!(
                "invalid_data_dir: not a directory: {}",
                config.data_dir.display()
            ));
        }
        if !exists {
            let parent = match config.data_dir.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => PathBuf::from("."),
            };
            if !parent.is_dir() {
                return Err(format!(
                    "write-access unavailable for data-dir: {}",
                    config.data_dir.display()
                ));
            }
        }

        Ok(config)
    }

    fn print(&self) {
        println!(
            "tempod CFG host={} port={} data-dir={} wal-sync={} memtable-bytes={} max-connections={}",
            self.host,
            self.port,
            self.data_dir.display(),
            self.wal_sync_policy.as_str(),
            self.memtable_bytes,
            self.max_connections,
        );
    }
}

fn print_error(msg: &str) {
    eprintln!("tempod ERR :: {}", msg);
}

fn run(config: &ServerConfig) -> Result<(), String> {
    block_shutdown_signals().map_err(|e| e.to_string())?;

    let listener = bind_listener(config.host, config.port, LISTEN_BACKLOG)
        .map_err(|e| format!("cannot listen on {}:{}: {}", config.host, config.port, e))?;

    let mut reactor: Reactor<Echo> = Reactor::new();
    reactor.add_listener(listener).map_err(|e| e.to_string())?;

    tinfo!("tempod listening on {}:{}", config.host, config.port);
    reactor.run();

    // Final totals on clean shutdown.
    for (name, total) in metrics::counter_totals() {
        if total > 0 {
            tinfo!("{} = {}", name, total);
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    tlog::init();

    let mut args = match Args::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(msg) => {
            print_error(&msg);
            return ExitCode::FAILURE;
        }
    };

    if args.pop_flag("help") {
        print_help();
        return ExitCode::SUCCESS;
    }

    if args.pop_flag("version") {
        println!("tempod {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let dry_run = args.pop_flag("dry-run");

    let config = match ServerConfig::from_cli(&mut args) {
        Ok(config) => config,
        Err(msg) => {
            print_error(&msg);
            return ExitCode::FAILURE;
        }
    };

    if let Err(msg) = args.finish() {
        print_error(&msg);
        return ExitCode::FAILURE;
    }

    if dry_run {
        config.print();
        return ExitCode::SUCCESS;
    }

    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            print_error(&msg);
            ExitCode::FAILURE
        }
    }
}
