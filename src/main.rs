// A TFTP server (RFC 1350) that multiplexes every transfer over one UDP socket.
//
// Clients ask to read (RRQ) or write (WRQ) a file. The file then travels in DATA blocks of 512
// bytes, each of which has to be acknowledged (ACK) before the next one is sent. A block shorter
// than 512 bytes, possibly empty, ends the transfer.
//
// Packets, each led by a 2-byte big-endian opcode:
//
// opcode   operation   layout
// 1        RRQ         filename | 0x00 | mode | 0x00
// 2        WRQ         filename | 0x00 | mode | 0x00
// 3        DATA        block # (2 bytes) | data (0-512 bytes)
// 4        ACK         block # (2 bytes)
// 5        ERROR       error code (2 bytes) | message | 0x00
//
// A write request is granted with ACK 0; a read request is answered directly with DATA 1.
// Block numbers wrap from 65535 back to 0.
//
// Lost packets are recovered by the server's timer: an unacknowledged DATA block is sent again
// after the timeout, a limited number of times. Error packets are a courtesy; they are never
// acknowledged or retransmitted.
//
// Error codes
//
// 0    Not defined, see msg
// 1    File not found
// 2    Access violation
// 3    Disk full / alloc exceeded
// 4    Illegal TFTP op
// 5    Unknown TID
// 6    File already exists
// 7    No such user
//
// Transfers are told apart by the client's (address, port) pair.

pub mod config;
pub mod error;
pub mod segment;
pub mod server;
pub mod session;
pub mod storage;
pub mod table;
pub mod tftp;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use clap::Parser;

use config::ServerConfig;
use server::Server;
use storage::DiskStore;

/// TFTP server (RFC 1350).
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// UDP port to listen on.
    #[arg(short, long, default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// Address to bind.
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,

    /// Directory files are served from and uploaded into.
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    /// Retransmission timeout in milliseconds.
    #[arg(short, long = "timeout-ms", default_value_t = 2000)]
    timeout_ms: u64,

    /// Retransmissions before a silent client is given up on.
    #[arg(long, default_value_t = 5)]
    retries: u32,

    /// Maximum number of concurrent transfers.
    #[arg(long, default_value_t = 256)]
    max_sessions: usize,

    /// Refuse write requests.
    #[arg(long)]
    read_only: bool,

    /// Log every packet.
    #[arg(short, long)]
    verbose: bool,
}

impl From<Cli> for ServerConfig {
    fn from(cli: Cli) -> ServerConfig {
        ServerConfig {
            bind: SocketAddr::new(cli.bind, cli.port),
            root: cli.root,
            timeout: Duration::from_millis(cli.timeout_ms),
            max_retries: cli.retries,
            max_sessions: cli.max_sessions,
            read_only: cli.read_only,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose when both are given.
    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    let config = ServerConfig::from(cli);
    ensure!(config.root.is_dir(), "{} is not a directory", config.root.display());

    let store = DiskStore::new(config.root.clone(), config.read_only);
    let mut server = Server::bind(config.clone(), store)
        .with_context(|| format!("Couldn't bind socket to {}", config.bind))?;

    log::info!(
        "Server listening on {} for requests, serving {}",
        server.local_addr()?,
        config.root.display()
    );
    server.run().await;
    Ok(())
}
