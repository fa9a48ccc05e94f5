use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Well-known TFTP port.
pub const DEFAULT_PORT: u16 = 69;

/// Settings the server runs with.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listening socket binds to.
    pub bind: SocketAddr,

    /// Directory files are served from and written into.
    pub root: PathBuf,

    /// How long an outstanding message may go unanswered before it is retransmitted.
    pub timeout: Duration,

    /// Retransmissions attempted before a silent peer is given up on.
    pub max_retries: u32,

    /// Upper bound on concurrently active transfers.
    pub max_sessions: usize,

    /// Refuse all write requests.
    pub read_only: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: (Ipv4Addr::UNSPECIFIED, DEFAULT_PORT).into(),
            root: PathBuf::from("."),
            timeout: Duration::from_millis(2000),
            max_retries: 5,
            max_sessions: 256,
            read_only: false,
        }
    }
}
