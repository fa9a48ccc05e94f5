// This module contains the per-peer transfer state machine.
//
// A session is created when a ReadReq or WriteReq is accepted. Read requests produce a Send
// session: the whole file is segmented up front, block 1 goes out immediately, and every matching
// ACK releases the next block until the terminal (short) block has been acknowledged. Write
// requests produce a Receive session: ACK 0 goes out immediately, and every in-sequence DATA block
// is appended and acknowledged until a short block arrives.
//
// Exactly one message is outstanding per session. Block and ack numbers that do not match the
// expected one are filtered here, so the caller never needs to reason about ordering. Sessions
// never touch the network or the filesystem themselves; they hand back the packet to send and the
// caller decides what to do with terminal states.

use crate::config::ServerConfig;
use crate::error::TransferError;
use crate::segment;
use crate::tftp::{self, Packet};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

/// Which way the file travels, seen from the server.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Direction {
    /// Serving a read request.
    Send,
    /// Serving a write request.
    Receive,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// Block `cursor` was sent and its ACK hasn't arrived yet.
    AwaitingAck,
    /// Waiting for DATA block `cursor`.
    AwaitingData,
    Complete,
    Failed(TransferError),
}

/// Block numbers are 16 bits on the wire and wrap from 65535 back to 0.
fn block_number(index: usize) -> u16 {
    (index % (usize::from(u16::MAX) + 1)) as u16
}

#[derive(Debug)]
pub struct Session {
    peer: SocketAddr,
    direction: Direction,
    filename: String,

    /// Send: every block of the file. Receive: the blocks accepted so far.
    blocks: Vec<Vec<u8>>,

    /// Send: 1-based index of the outstanding block. Receive: 1-based index of the block we expect
    /// next.
    cursor: usize,

    last_sent: Packet,
    retry_count: u32,
    max_retries: u32,
    timeout: Duration,
    deadline: Instant,
    state: SessionState,
}

impl Session {
    /// Starts serving a read request. Returns the session together with DATA block 1.
    pub fn new_send(
        peer: SocketAddr,
        filename: &str,
        contents: &[u8],
        config: &ServerConfig,
        now: Instant,
    ) -> (Session, Packet) {
        let blocks = segment::segment(contents, tftp::DATA_BUFFER_SIZE);
        let first = Packet::Data { block: 1, data: blocks[0].clone() };
        let session = Session {
            peer,
            direction: Direction::Send,
            filename: filename.to_string(),
            blocks,
            cursor: 1,
            last_sent: first.clone(),
            retry_count: 0,
            max_retries: config.max_retries,
            timeout: config.timeout,
            deadline: now + config.timeout,
            state: SessionState::AwaitingAck,
        };
        (session, first)
    }

    /// Starts serving a write request. Returns the session together with ACK 0.
    pub fn new_receive(peer: SocketAddr, filename: &str, config: &ServerConfig, now: Instant) -> (Session, Packet) {
        let grant = Packet::Ack { block: 0 };
        let session = Session {
            peer,
            direction: Direction::Receive,
            filename: filename.to_string(),
            blocks: Vec::new(),
            cursor: 1,
            last_sent: grant.clone(),
            retry_count: 0,
            max_retries: config.max_retries,
            timeout: config.timeout,
            deadline: now + config.timeout,
            state: SessionState::AwaitingData,
        };
        (session, grant)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn last_sent(&self) -> &Packet {
        &self.last_sent
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, SessionState::Complete | SessionState::Failed(_))
    }

    /// Whether the outstanding message has been waiting longer than the timeout.
    pub fn is_due(&self, now: Instant) -> bool {
        !self.is_finished() && now >= self.deadline
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Total payload bytes held by the session.
    pub fn byte_count(&self) -> usize {
        self.blocks.iter().map(Vec::len).sum()
    }

    /// Everything received so far, in order.
    pub fn received_blob(&self) -> Vec<u8> {
        segment::reassemble(&self.blocks)
    }

    /// Moves the session to `Failed` from outside the state machine, e.g. when storing the
    /// received file did not work out.
    pub fn fail(&mut self, reason: TransferError) {
        self.state = SessionState::Failed(reason);
    }

    /// Feeds one packet from the peer into the state machine. Returns the packet to send back, if
    /// any.
    pub fn handle(&mut self, packet: &Packet, now: Instant) -> Option<Packet> {
        if self.is_finished() {
            return None;
        }

        match packet {
            Packet::Error { code, message } => {
                self.state = SessionState::Failed(TransferError::ProtocolViolation(format!(
                    "Client sent error packet: code: {:#?}, message: '{}'",
                    code, message
                )));
                None
            }
            &Packet::Ack { block } if self.state == SessionState::AwaitingAck => self.process_ack(block, now),
            Packet::Data { block, data } if self.state == SessionState::AwaitingData => {
                self.process_data(*block, data, now)
            }
            other => {
                log::warn!(
                    "Ignoring {:?} from {} while {:?}",
                    other.op_code(),
                    self.peer,
                    self.state
                );
                None
            }
        }
    }

    fn process_ack(&mut self, block: u16, now: Instant) -> Option<Packet> {
        let expected = block_number(self.cursor);
        if block != expected {
            // Stale or duplicated acks are not a reason to resend, only the timer is.
            log::debug!(
                "{}: {}",
                self.peer,
                TransferError::StaleSequence { expected, received: block }
            );
            return None;
        }

        if segment::is_terminal(self.blocks[self.cursor - 1].len(), tftp::DATA_BUFFER_SIZE) {
            self.state = SessionState::Complete;
            return None;
        }

        self.cursor += 1;
        let packet = Packet::Data {
            block: block_number(self.cursor),
            data: self.blocks[self.cursor - 1].clone(),
        };
        Some(self.transmit(packet, now))
    }

    fn process_data(&mut self, block: u16, data: &[u8], now: Instant) -> Option<Packet> {
        let expected = block_number(self.cursor);
        if block != expected {
            log::debug!(
                "{}: {}",
                self.peer,
                TransferError::StaleSequence { expected, received: block }
            );
            // Re-ack the last block we kept so a sender whose DATA got lost starts over from there.
            return Some(self.transmit(Packet::Ack { block: expected.wrapping_sub(1) }, now));
        }

        self.blocks.push(data.to_vec());
        if segment::is_terminal(data.len(), tftp::DATA_BUFFER_SIZE) {
            self.state = SessionState::Complete;
        } else {
            self.cursor += 1;
        }
        Some(self.transmit(Packet::Ack { block }, now))
    }

    /// Records `packet` as the outstanding message and restarts the retry budget.
    fn transmit(&mut self, packet: Packet, now: Instant) -> Packet {
        self.retry_count = 0;
        self.deadline = now + self.timeout;
        self.last_sent = packet.clone();
        packet
    }

    /// Applies a retransmission timeout. Returns the packet to resend, if any.
    pub fn on_timeout(&mut self, now: Instant) -> Option<Packet> {
        match self.state {
            SessionState::AwaitingAck => {
                if self.retry_count < self.max_retries {
                    self.retry_count += 1;
                    self.deadline = now + self.timeout;
                    Some(self.last_sent.clone())
                } else {
                    self.state = SessionState::Failed(TransferError::PeerTimeout);
                    None
                }
            }
            // The receiving side never retransmits; it only counts how long the sender has been
            // quiet.
            SessionState::AwaitingData => {
                self.retry_count += 1;
                if self.retry_count >= self.max_retries {
                    self.state = SessionState::Failed(TransferError::PeerTimeout);
                } else {
                    self.deadline = now + self.timeout;
                }
                None
            }
            SessionState::Complete | SessionState::Failed(_) => None,
        }
    }
}
