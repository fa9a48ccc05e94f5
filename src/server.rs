// This module contains the dispatch loop.
//
// Every transfer shares the one listening socket. Each turn of the loop:
//
// 1. Waits for a datagram, but never past the earliest retransmission deadline.
// 2. Applies the retransmission timeout to every session whose deadline has passed.
// 3. Decodes the datagram (if any) and routes it. Requests create or replace the sender's session;
//    DATA, ACK and ERROR go to the sender's existing session, or are dropped when it has none.
// 4. Removes sessions that reached Complete or Failed, storing uploaded files on the way out.
//
// The Dispatcher below does steps 2-4 without touching the network, so it can be driven directly.
// The Server owns the socket and feeds the Dispatcher.

use crate::config::ServerConfig;
use crate::error::TransferError;
use crate::session::{Direction, Session, SessionState};
use crate::storage::FileStore;
use crate::table::SessionTable;
use crate::tftp::{ErrorCode, FileMode, Packet, SocketError, TftpSocket};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

/// Shortest receive budget, so an overdue deadline doesn't turn into a busy loop.
const MIN_RECV_BUDGET: Duration = Duration::from_millis(1);

/// A packet and where it has to go.
pub type Outgoing = (Packet, SocketAddr);

/// Summary of a transfer that ran to completion.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRecord {
    pub peer: SocketAddr,
    pub filename: String,
    pub direction: Direction,
    pub bytes: usize,
    pub blocks: usize,
}

impl fmt::Display for TransferRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.direction {
            Direction::Send => write!(
                f,
                "File {} with {} bytes sent to {} in {} blocks",
                self.filename, self.bytes, self.peer, self.blocks
            ),
            Direction::Receive => write!(
                f,
                "File {} with {} bytes received from {} in {} blocks",
                self.filename, self.bytes, self.peer, self.blocks
            ),
        }
    }
}

/// Routes decoded packets to sessions and keeps the session table tidy.
pub struct Dispatcher<S> {
    store: S,
    config: ServerConfig,
    table: SessionTable,
    completions: Vec<TransferRecord>,
}

impl<S: FileStore> Dispatcher<S> {
    pub fn new(store: S, config: ServerConfig) -> Dispatcher<S> {
        Dispatcher {
            store,
            config,
            table: SessionTable::new(),
            completions: Vec::new(),
        }
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.table
    }

    /// Hands over the records of transfers finished since the last call.
    pub fn take_completions(&mut self) -> Vec<TransferRecord> {
        std::mem::take(&mut self.completions)
    }

    /// How long the loop may block in receive before a session needs attention.
    pub fn recv_budget(&self, now: Instant) -> Duration {
        match self.table.next_deadline() {
            Some(deadline) => deadline
                .saturating_duration_since(now)
                .clamp(MIN_RECV_BUDGET, self.config.timeout.max(MIN_RECV_BUDGET)),
            None => self.config.timeout,
        }
    }

    /// Decodes one datagram from `src` and processes it.
    pub async fn handle_datagram(&mut self, buf: &[u8], src: SocketAddr, now: Instant) -> Vec<Outgoing> {
        let packet = match Packet::parse_from_buf(buf) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("Dropping datagram from {}: {}", src, TransferError::MalformedMessage(e.0));
                return Vec::new();
            }
        };
        log::debug!("Got {:?} from {}", packet.op_code(), src);

        let mut outgoing = Vec::new();
        match packet {
            Packet::ReadReq { path, mode } => outgoing.push((self.start_read(src, &path, mode, now).await, src)),
            Packet::WriteReq { path, mode } => outgoing.push((self.start_write(src, &path, mode, now).await, src)),
            other => match self.table.resolve_mut(&src) {
                Some(session) => outgoing.extend(session.handle(&other, now).map(|p| (p, src))),
                None => log::debug!("Dropping {:?} from {}: {}", other.op_code(), src, TransferError::UnknownPeer),
            },
        }

        outgoing.extend(self.finish_sessions().await);
        outgoing
    }

    /// Applies the retransmission timeout to every overdue session.
    pub async fn sweep_timeouts(&mut self, now: Instant) -> Vec<Outgoing> {
        let mut outgoing = Vec::new();
        for session in self.table.iter_mut().filter(|s| s.is_due(now)) {
            if let Some(packet) = session.on_timeout(now) {
                log::info!(
                    "Timed out waiting for {}, resending (attempt {})",
                    session.peer(),
                    session.retry_count()
                );
                outgoing.push((packet, session.peer()));
            }
        }

        outgoing.extend(self.finish_sessions().await);
        outgoing
    }

    /// Checks whether a new request from `src` can be taken on at all.
    fn refuse(&self, src: SocketAddr, mode: FileMode) -> Option<Packet> {
        if mode == FileMode::Mail {
            log::warn!("Peer {} requested mail mode, which is unsupported", src);
            return Some(Packet::Error {
                code: ErrorCode::Undefined,
                message: "mail mode is not supported".into(),
            });
        }

        // A peer restarting its own transfer frees its slot, so it's never turned away.
        if self.table.resolve(&src).is_none() && self.table.len() >= self.config.max_sessions {
            log::warn!("Refusing request from {}: {} transfers already active", src, self.table.len());
            return Some(Packet::Error {
                code: ErrorCode::DiskFull,
                message: "too many concurrent transfers".into(),
            });
        }
        None
    }

    async fn start_read(&mut self, src: SocketAddr, path: &str, mode: FileMode, now: Instant) -> Packet {
        if let Some(refusal) = self.refuse(src, mode) {
            return refusal;
        }

        match self.store.read_whole_file(path).await {
            Ok(contents) => {
                log::info!("Got RRQ for {} ({} bytes) from {}", path, contents.len(), src);
                let (session, first) = Session::new_send(src, path, &contents, &self.config, now);
                self.install(session);
                first
            }
            Err(e) => {
                let code = ErrorCode::from(e.kind());
                log::warn!("Refusing RRQ for {} from {}: {}", path, src, e);
                log::debug!("{}: {}", src, TransferError::FileUnavailable(code));
                Packet::error(code)
            }
        }
    }

    async fn start_write(&mut self, src: SocketAddr, path: &str, mode: FileMode, now: Instant) -> Packet {
        if let Some(refusal) = self.refuse(src, mode) {
            return refusal;
        }

        match self.store.check_writable(path).await {
            Ok(()) => {
                log::info!("Got WRQ for {} from {}", path, src);
                let (session, grant) = Session::new_receive(src, path, &self.config, now);
                self.install(session);
                grant
            }
            Err(e) => {
                let code = ErrorCode::from(e.kind());
                log::warn!("Refusing WRQ for {} from {}: {}", path, src, e);
                log::debug!("{}: {}", src, TransferError::FileUnavailable(code));
                Packet::error(code)
            }
        }
    }

    fn install(&mut self, session: Session) {
        let direction = session.direction();
        if let Some(old) = self.table.create_or_replace(session) {
            if old.direction() != direction {
                log::warn!(
                    "{}: {}",
                    old.peer(),
                    TransferError::ProtocolViolation(format!(
                        "new {:?} request while a {:?} transfer of {} was in flight",
                        direction,
                        old.direction(),
                        old.filename()
                    ))
                );
            } else {
                log::info!("{} restarted its transfer, dropping the one for {}", old.peer(), old.filename());
            }
        }
    }

    /// Removes finished sessions. Completed uploads are written out here; if that fails the peer
    /// gets a courtesy error.
    async fn finish_sessions(&mut self) -> Vec<Outgoing> {
        let mut outgoing = Vec::new();
        for mut session in self.table.drain_finished() {
            if session.state() == &SessionState::Complete && session.direction() == Direction::Receive {
                if let Err(e) = self.store.write_whole_file(session.filename(), &session.received_blob()).await {
                    log::error!("Failed to store {} from {}: {}", session.filename(), session.peer(), e);
                    let code = ErrorCode::from(e.kind());
                    session.fail(TransferError::FileUnavailable(code));
                    outgoing.push((
                        Packet::Error { code, message: format!("Error writing to file: {}", e).into() },
                        session.peer(),
                    ));
                }
            }

            match session.state() {
                SessionState::Complete => self.completions.push(TransferRecord {
                    peer: session.peer(),
                    filename: session.filename().to_string(),
                    direction: session.direction(),
                    bytes: session.byte_count(),
                    blocks: session.block_count(),
                }),
                SessionState::Failed(reason) => log::warn!(
                    "Transfer of {} with {} failed: {}",
                    session.filename(),
                    session.peer(),
                    reason
                ),
                SessionState::AwaitingAck | SessionState::AwaitingData => {}
            }
        }
        outgoing
    }
}

/// The listening socket plus the dispatcher it feeds.
pub struct Server<S> {
    sock: TftpSocket,
    dispatcher: Dispatcher<S>,
}

impl<S: FileStore> Server<S> {
    pub fn bind(config: ServerConfig, store: S) -> Result<Server<S>, SocketError> {
        let sock = TftpSocket::bind(config.bind)?;
        Ok(Server { sock, dispatcher: Dispatcher::new(store, config) })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        self.sock.local_addr()
    }

    /// Serves requests forever.
    pub async fn run(&mut self) {
        loop {
            self.step().await;
        }
    }

    /// One turn of the loop: receive at most one datagram, sweep timeouts, route, send.
    pub async fn step(&mut self) {
        let budget = self.dispatcher.recv_budget(Instant::now());
        let received = match self.sock.recv_with_timeout(budget).await {
            Ok(datagram) => Some(datagram),
            Err(SocketError::Timeout(_)) => None,
            Err(SocketError::IO(e)) => {
                log::warn!("Unable to receive packet: {e}");
                None
            }
        };

        let now = Instant::now();
        let mut outgoing = self.dispatcher.sweep_timeouts(now).await;
        if let Some((buf, src)) = received {
            outgoing.extend(self.dispatcher.handle_datagram(&buf, src, now).await);
        }

        for (packet, dst) in outgoing {
            log::debug!("Sending {:?} to {}", packet.op_code(), dst);
            if let Err(e) = self.sock.send(&packet, dst).await {
                log::warn!("Unable to send packet to {dst}: {e}");
            }
        }

        for record in self.dispatcher.take_completions() {
            log::info!("{}", record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DiskStore, MemoryStore};
    use crate::tftp::DATA_BUFFER_SIZE;
    use tempdir::TempDir;

    fn client() -> SocketAddr {
        "192.168.1.20:40000".parse().unwrap()
    }

    fn config() -> ServerConfig {
        ServerConfig {
            timeout: Duration::from_secs(1),
            max_retries: 3,
            ..ServerConfig::default()
        }
    }

    fn dispatcher(store: MemoryStore) -> Dispatcher<MemoryStore> {
        Dispatcher::new(store, config())
    }

    fn rrq(path: &str) -> Vec<u8> {
        Packet::ReadReq { path: path.into(), mode: FileMode::Octet }.to_bytes()
    }

    fn wrq(path: &str) -> Vec<u8> {
        Packet::WriteReq { path: path.into(), mode: FileMode::Octet }.to_bytes()
    }

    async fn recv_from(sock: &TftpSocket, server: SocketAddr) -> Packet {
        let (buf, src) = sock.recv_with_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(src, server);
        Packet::parse_from_buf(&buf).unwrap()
    }

    #[tokio::test]
    async fn test_read_two_blocks() {
        let mut d = dispatcher(MemoryStore::default().with_file("a.txt", vec![0x61; 1000]));
        let now = Instant::now();

        assert_eq!(
            d.handle_datagram(&rrq("a.txt"), client(), now).await,
            vec![(Packet::Data { block: 1, data: vec![0x61; 512] }, client())]
        );
        assert_eq!(
            d.handle_datagram(&Packet::Ack { block: 1 }.to_bytes(), client(), now).await,
            vec![(Packet::Data { block: 2, data: vec![0x61; 488] }, client())]
        );
        assert_eq!(d.handle_datagram(&Packet::Ack { block: 2 }.to_bytes(), client(), now).await, vec![]);

        assert!(d.sessions().is_empty());
        assert_eq!(
            d.take_completions(),
            vec![TransferRecord {
                peer: client(),
                filename: "a.txt".to_string(),
                direction: Direction::Send,
                bytes: 1000,
                blocks: 2,
            }]
        );
        assert!(d.take_completions().is_empty());
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let mut d = dispatcher(MemoryStore::default());

        assert_eq!(
            d.handle_datagram(&rrq("missing.txt"), client(), Instant::now()).await,
            vec![(
                Packet::Error { code: ErrorCode::FileNotFound, message: "file not found".into() },
                client()
            )]
        );
        assert!(d.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_write_single_block() {
        let mut d = dispatcher(MemoryStore::default());
        let now = Instant::now();

        assert_eq!(
            d.handle_datagram(&wrq("b.txt"), client(), now).await,
            vec![(Packet::Ack { block: 0 }, client())]
        );
        let data = Packet::Data { block: 1, data: vec![0x62; 300] }.to_bytes();
        assert_eq!(
            d.handle_datagram(&data, client(), now).await,
            vec![(Packet::Ack { block: 1 }, client())]
        );

        assert!(d.sessions().is_empty());
        assert_eq!(d.store.contents("b.txt"), Some(vec![0x62; 300]));
        assert_eq!(d.take_completions()[0].direction, Direction::Receive);
    }

    #[tokio::test]
    async fn test_failed_write_reports_error() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let mut d = Dispatcher::new(DiskStore::new(tmpdir.path(), false), config());
        let now = Instant::now();

        assert_eq!(
            d.handle_datagram(&wrq("b.txt"), client(), now).await,
            vec![(Packet::Ack { block: 0 }, client())]
        );
        // Someone else claims the name while the upload is in flight.
        std::fs::write(tmpdir.path().join("b.txt"), b"first").unwrap();

        let data = Packet::Data { block: 1, data: vec![0x62; 300] }.to_bytes();
        let outgoing = d.handle_datagram(&data, client(), now).await;
        assert_eq!(outgoing.len(), 2);
        assert_eq!(outgoing[0], (Packet::Ack { block: 1 }, client()));
        assert!(matches!(
            &outgoing[1],
            (Packet::Error { code: ErrorCode::FileAlreadyExists, .. }, peer) if *peer == client()
        ));

        assert!(d.sessions().is_empty());
        assert!(d.take_completions().is_empty());
        assert_eq!(std::fs::read(tmpdir.path().join("b.txt")).unwrap(), b"first".to_vec());
    }

    #[tokio::test]
    async fn test_write_existing_file_is_refused() {
        let mut d = dispatcher(MemoryStore::default().with_file("b.txt", vec![]));

        assert_eq!(
            d.handle_datagram(&wrq("b.txt"), client(), Instant::now()).await,
            vec![(Packet::error(ErrorCode::FileAlreadyExists), client())]
        );
        assert!(d.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_unanswered_data_is_resent_then_dropped() {
        let mut d = dispatcher(MemoryStore::default().with_file("a.txt", vec![0x61; 1000]));
        let start = Instant::now();
        let first = Packet::Data { block: 1, data: vec![0x61; 512] };
        d.handle_datagram(&rrq("a.txt"), client(), start).await;

        assert_eq!(d.sweep_timeouts(start).await, vec![]);
        for attempt in 1..=3u32 {
            let now = start + Duration::from_secs(u64::from(attempt));
            assert_eq!(d.sweep_timeouts(now).await, vec![(first.clone(), client())]);
            assert_eq!(d.sessions().resolve(&client()).unwrap().retry_count(), attempt);
        }

        assert_eq!(d.sweep_timeouts(start + Duration::from_secs(4)).await, vec![]);
        assert!(d.sessions().is_empty());
        assert!(d.take_completions().is_empty());
        assert_eq!(d.sweep_timeouts(start + Duration::from_secs(10)).await, vec![]);
    }

    #[tokio::test]
    async fn test_stale_ack_changes_nothing() {
        let mut d = dispatcher(MemoryStore::default().with_file("a.txt", vec![0x61; 1000]));
        let now = Instant::now();
        d.handle_datagram(&rrq("a.txt"), client(), now).await;

        assert_eq!(d.handle_datagram(&Packet::Ack { block: 0 }.to_bytes(), client(), now).await, vec![]);

        let session = d.sessions().resolve(&client()).unwrap();
        assert_eq!(session.cursor(), 1);
        assert_eq!(session.state(), &SessionState::AwaitingAck);
        assert_eq!(session.last_sent(), &Packet::Data { block: 1, data: vec![0x61; 512] });
    }

    #[tokio::test]
    async fn test_traffic_without_session_is_dropped() {
        let mut d = dispatcher(MemoryStore::default());
        let now = Instant::now();

        assert_eq!(d.handle_datagram(&Packet::Ack { block: 1 }.to_bytes(), client(), now).await, vec![]);
        assert_eq!(
            d.handle_datagram(&Packet::Data { block: 1, data: vec![1] }.to_bytes(), client(), now).await,
            vec![]
        );
        assert_eq!(d.handle_datagram(&Packet::error(ErrorCode::Undefined).to_bytes(), client(), now).await, vec![]);
        assert!(d.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_datagram_is_dropped() {
        let mut d = dispatcher(MemoryStore::default().with_file("a.txt", vec![0x61; 10]));
        let now = Instant::now();

        assert_eq!(d.handle_datagram(&[0x00, 0x09, 0x00, 0x00], client(), now).await, vec![]);
        assert_eq!(d.handle_datagram(&[0x00, 0x01, 0x61, 0x00], client(), now).await, vec![]);
        assert!(d.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_error_from_peer_ends_session() {
        let mut d = dispatcher(MemoryStore::default().with_file("a.txt", vec![0x61; 1000]));
        let now = Instant::now();
        d.handle_datagram(&rrq("a.txt"), client(), now).await;

        let abort = Packet::Error { code: ErrorCode::DiskFull, message: "no room".into() };
        assert_eq!(d.handle_datagram(&abort.to_bytes(), client(), now).await, vec![]);
        assert!(d.sessions().is_empty());
        assert!(d.take_completions().is_empty());
    }

    #[tokio::test]
    async fn test_new_request_replaces_session() {
        let store = MemoryStore::default()
            .with_file("a.txt", vec![0x61; 1000])
            .with_file("c.txt", vec![0x63; 10]);
        let mut d = dispatcher(store);
        let now = Instant::now();

        d.handle_datagram(&rrq("a.txt"), client(), now).await;
        assert_eq!(
            d.handle_datagram(&rrq("c.txt"), client(), now).await,
            vec![(Packet::Data { block: 1, data: vec![0x63; 10] }, client())]
        );
        assert_eq!(d.sessions().len(), 1);
        assert_eq!(d.sessions().resolve(&client()).unwrap().filename(), "c.txt");

        assert_eq!(
            d.handle_datagram(&wrq("d.txt"), client(), now).await,
            vec![(Packet::Ack { block: 0 }, client())]
        );
        assert_eq!(d.sessions().len(), 1);
        assert_eq!(d.sessions().resolve(&client()).unwrap().direction(), Direction::Receive);
    }

    #[tokio::test]
    async fn test_peers_on_same_host_are_independent() {
        let mut d = dispatcher(MemoryStore::default().with_file("a.txt", vec![0x61; 1000]));
        let now = Instant::now();
        let other: SocketAddr = "192.168.1.20:40001".parse().unwrap();

        d.handle_datagram(&rrq("a.txt"), client(), now).await;
        d.handle_datagram(&rrq("a.txt"), other, now).await;
        assert_eq!(d.sessions().len(), 2);

        assert_eq!(
            d.handle_datagram(&Packet::Ack { block: 1 }.to_bytes(), other, now).await,
            vec![(Packet::Data { block: 2, data: vec![0x61; 488] }, other)]
        );
        assert_eq!(d.sessions().resolve(&client()).unwrap().cursor(), 1);
        assert_eq!(d.sessions().resolve(&other).unwrap().cursor(), 2);
    }

    #[tokio::test]
    async fn test_mail_mode_is_refused() {
        let mut d = dispatcher(MemoryStore::default().with_file("a.txt", vec![0x61; 10]));
        let request = Packet::ReadReq { path: "a.txt".into(), mode: FileMode::Mail }.to_bytes();

        assert_eq!(
            d.handle_datagram(&request, client(), Instant::now()).await,
            vec![(
                Packet::Error { code: ErrorCode::Undefined, message: "mail mode is not supported".into() },
                client()
            )]
        );
        assert!(d.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_session_cap() {
        let store = MemoryStore::default().with_file("a.txt", vec![0x61; 1000]);
        let mut d = Dispatcher::new(store, ServerConfig { max_sessions: 1, ..config() });
        let now = Instant::now();
        let other: SocketAddr = "192.168.1.21:40000".parse().unwrap();

        d.handle_datagram(&rrq("a.txt"), client(), now).await;
        assert_eq!(
            d.handle_datagram(&rrq("a.txt"), other, now).await,
            vec![(
                Packet::Error { code: ErrorCode::DiskFull, message: "too many concurrent transfers".into() },
                other
            )]
        );

        // The peer already holding the slot may still restart.
        assert_eq!(d.handle_datagram(&rrq("a.txt"), client(), now).await.len(), 1);
        assert_eq!(d.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_silent_writer_is_dropped() {
        let mut d = dispatcher(MemoryStore::default());
        let start = Instant::now();
        d.handle_datagram(&wrq("b.txt"), client(), start).await;

        for step in 1..=3u64 {
            assert_eq!(d.sweep_timeouts(start + Duration::from_secs(step)).await, vec![]);
        }
        assert!(d.sessions().is_empty());
        assert_eq!(d.store.contents("b.txt"), None);
    }

    #[tokio::test]
    async fn test_recv_budget_tracks_earliest_deadline() {
        let mut d = dispatcher(MemoryStore::default());
        let now = Instant::now();
        assert_eq!(d.recv_budget(now), Duration::from_secs(1));

        d.handle_datagram(&wrq("b.txt"), client(), now).await;
        assert_eq!(d.recv_budget(now + Duration::from_millis(400)), Duration::from_millis(600));
        assert_eq!(d.recv_budget(now + Duration::from_secs(5)), MIN_RECV_BUDGET);
    }

    #[tokio::test]
    async fn test_end_to_end_over_loopback() {
        let tmpdir = TempDir::new("served").unwrap();
        let mut contents = vec![0x78; 1024];
        contents.extend_from_slice(b"testing");
        std::fs::write(tmpdir.path().join("a.txt"), &contents).unwrap();

        let config = ServerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            timeout: Duration::from_millis(200),
            ..ServerConfig::default()
        };
        let mut server = Server::bind(config, DiskStore::new(tmpdir.path(), false)).unwrap();
        let server_addr = server.local_addr().unwrap();
        let sock = TftpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        let client = async {
            // Download
            sock.send(&Packet::ReadReq { path: "a.txt".into(), mode: FileMode::Octet }, server_addr)
                .await
                .unwrap();
            let mut downloaded = Vec::new();
            loop {
                let Packet::Data { block, data } = recv_from(&sock, server_addr).await else {
                    panic!("expected a data packet");
                };
                let done = data.len() < DATA_BUFFER_SIZE;
                downloaded.extend_from_slice(&data);
                sock.send(&Packet::Ack { block }, server_addr).await.unwrap();
                if done {
                    break;
                }
            }
            assert_eq!(downloaded, contents);

            // Upload
            sock.send(&Packet::WriteReq { path: "b.txt".into(), mode: FileMode::Octet }, server_addr)
                .await
                .unwrap();
            assert_eq!(recv_from(&sock, server_addr).await, Packet::Ack { block: 0 });
            sock.send(&Packet::Data { block: 1, data: vec![0x62; 512] }, server_addr).await.unwrap();
            assert_eq!(recv_from(&sock, server_addr).await, Packet::Ack { block: 1 });
            sock.send(&Packet::Data { block: 2, data: vec![0x62; 10] }, server_addr).await.unwrap();
            assert_eq!(recv_from(&sock, server_addr).await, Packet::Ack { block: 2 });

            // Missing file
            sock.send(&Packet::ReadReq { path: "nope".into(), mode: FileMode::Octet }, server_addr)
                .await
                .unwrap();
            assert_eq!(recv_from(&sock, server_addr).await, Packet::error(ErrorCode::FileNotFound));

            // Lost ack: the server repeats the block on its own.
            std::fs::write(tmpdir.path().join("c.txt"), b"short").unwrap();
            sock.send(&Packet::ReadReq { path: "c.txt".into(), mode: FileMode::Octet }, server_addr)
                .await
                .unwrap();
            let first = recv_from(&sock, server_addr).await;
            assert_eq!(first, Packet::Data { block: 1, data: b"short".to_vec() });
            assert_eq!(recv_from(&sock, server_addr).await, first);
        };

        tokio::select! {
            _ = server.run() => unreachable!("the server loop never returns"),
            _ = client => {}
        }
        assert_eq!(std::fs::read(tmpdir.path().join("b.txt")).unwrap(), vec![0x62; 522]);
    }
}
