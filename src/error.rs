use crate::tftp::ErrorCode;
use std::error;
use std::fmt;

/// Everything that can go wrong with a single transfer. None of these bring the server down; the
/// worst outcome is that one session is dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferError {
    /// A datagram that could not be decoded.
    MalformedMessage(String),

    /// DATA, ACK or ERROR from a peer we have no session with.
    UnknownPeer,

    /// A block or ack number other than the one the session expects.
    StaleSequence { expected: u16, received: u16 },

    /// The requested file could not be read, or could not be written.
    FileUnavailable(ErrorCode),

    /// The peer stayed silent for the whole retry budget.
    PeerTimeout,

    /// The peer aborted the transfer, or broke the protocol in a way that ends it.
    ProtocolViolation(String),
}

impl error::Error for TransferError {}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::MalformedMessage(msg) => write!(f, "Malformed message: {}", msg),
            Self::UnknownPeer => write!(f, "Message from a peer without an active transfer"),
            Self::StaleSequence { expected, received } => {
                write!(f, "Stale sequence number: expected {expected}, received {received}")
            }
            Self::FileUnavailable(code) => write!(f, "File unavailable: {}", code.default_message()),
            Self::PeerTimeout => write!(f, "Peer timed out"),
            Self::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
        }
    }
}
