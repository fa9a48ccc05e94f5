use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::ops::Deref;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Payload size of a full DATA packet. Anything shorter terminates a transfer.
pub const DATA_BUFFER_SIZE: usize = 512;

/// Opcode plus block number (or error code).
const HEADER_SIZE: usize = 4;

/// The largest datagram a well-formed peer will ever send us.
pub const MAX_PACKET_SIZE: usize = HEADER_SIZE + DATA_BUFFER_SIZE;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {:#?}", e),
            SocketError::Timeout(e) => write!(f, "Socket IO timeout: {:#?}", e),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

/// Returned when a datagram cannot be decoded into a [`Packet`].
#[derive(Debug, PartialEq)]
pub struct MalformedPacket(pub String);

impl error::Error for MalformedPacket {}

impl fmt::Display for MalformedPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Packet parsing error: {}", self.0)
    }
}

type ParseResult<T> = Result<T, MalformedPacket>;

fn malformed<T>(msg: impl Into<String>) -> ParseResult<T> {
    Err(MalformedPacket(msg.into()))
}

///////////////////////////////////////////////////////////////
// Packet model

/// Represents the mode for a file the client wishes to read or write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FileMode {
    NetAscii,
    Octet,
    Mail,
}

impl FileMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
            FileMode::Mail => "mail",
        }
    }
}

impl FromStr for FileMode {
    type Err = MalformedPacket;

    fn from_str(raw: &str) -> ParseResult<FileMode> {
        match raw.to_lowercase().as_str() {
            "netascii" => Ok(FileMode::NetAscii),
            "octet" => Ok(FileMode::Octet),
            "mail" => Ok(FileMode::Mail),
            _ => malformed(format!("Unknown file mode: '{raw}'")),
        }
    }
}

/// Text carried by RRQ, WRQ and ERROR packets. A 0 byte terminates these strings on the wire, so
/// a `NetString` never contains one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetString(String);

impl NetString {
    /// Fails if `s` contains a 0 byte.
    pub fn new(s: impl Into<String>) -> ParseResult<NetString> {
        let s = s.into();
        if s.contains('\0') {
            return malformed(format!("String {:?} contains a null byte", s));
        }
        Ok(NetString(s))
    }

    /// Keeps everything before the first 0 byte, which is all a peer would read anyway.
    pub fn truncated(s: &str) -> NetString {
        NetString(s.split('\0').next().unwrap_or_default().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for NetString {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NetString {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NetString {
    fn from(s: &str) -> NetString {
        NetString::truncated(s)
    }
}

impl From<String> for NetString {
    fn from(s: String) -> NetString {
        NetString::truncated(&s)
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    Illegal,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
    /// A code outside the range RFC 1350 defines (8 and up).
    Unknown(u16),
}

impl ErrorCode {
    pub fn raw(&self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
            ErrorCode::Unknown(raw) => *raw,
        }
    }

    /// Human readable text sent alongside the code when we have nothing better to say.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::FileNotFound => "file not found",
            ErrorCode::AccessViolation => "access violation",
            ErrorCode::DiskFull => "disk full or allocation exceeded",
            ErrorCode::Illegal => "illegal TFTP operation",
            ErrorCode::UnknownTid => "unknown transfer ID",
            ErrorCode::FileAlreadyExists => "file already exists",
            ErrorCode::NoSuchUser => "no such user",
            ErrorCode::Undefined | ErrorCode::Unknown(_) => "undefined error",
        }
    }
}

impl From<u16> for ErrorCode {
    fn from(raw: u16) -> ErrorCode {
        match raw {
            0 => ErrorCode::Undefined,
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            other => ErrorCode::Unknown(other),
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> ErrorCode {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            _ => ErrorCode::Undefined,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: NetString,

        /// The file mode.
        mode: FileMode,
    },

    /// A write request packet
    WriteReq { path: NetString, mode: FileMode },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error { code: ErrorCode, message: NetString },
}

/// The 2-byte opcode leading every TFTP packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    Rrq,
    Wrq,
    Data,
    Ack,
    Error,
}

impl OpCode {
    pub fn raw(&self) -> u16 {
        match self {
            OpCode::Rrq => 1,
            OpCode::Wrq => 2,
            OpCode::Data => 3,
            OpCode::Ack => 4,
            OpCode::Error => 5,
        }
    }
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and runs until the
/// first 0 byte.
///
/// Returns the string and the position of the 0 byte, or None when the buffer holds no 0 byte.
fn string_from_buffer(buf: &[u8]) -> Option<(NetString, usize)> {
    let end = buf.iter().position(|&c| c == 0x00)?;
    Some((NetString(String::from_utf8_lossy(&buf[..end]).into_owned()), end))
}

fn retrieve_op_code(buf: &[u8]) -> ParseResult<OpCode> {
    let rawcode = u16_from_buffer(&buf[..2]);
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        _ => malformed(format!("Unknown opcode retrieved: {rawcode}")),
    }
}

fn parse_path_and_mode(buf: &[u8]) -> ParseResult<(NetString, FileMode)> {
    let Some((path, path_end)) = string_from_buffer(buf) else {
        return malformed("Filename must be terminated with a null byte!");
    };

    // Anything after the mode terminator would be RFC 2347 options, which we don't negotiate.
    let Some((raw_mode, _)) = string_from_buffer(&buf[path_end + 1..]) else {
        return malformed("Mode must be terminated with a null byte!");
    };

    Ok((path, raw_mode.parse()?))
}

fn parse_read_req(buf: &[u8]) -> ParseResult<Packet> {
    let (path, mode) = parse_path_and_mode(&buf[2..])?;
    Ok(Packet::ReadReq { path, mode })
}

fn parse_write_req(buf: &[u8]) -> ParseResult<Packet> {
    let (path, mode) = parse_path_and_mode(&buf[2..])?;
    Ok(Packet::WriteReq { path, mode })
}

fn parse_data(buf: &[u8]) -> ParseResult<Packet> {
    let block = u16_from_buffer(&buf[2..4]);
    let data = &buf[HEADER_SIZE..];
    if data.len() > DATA_BUFFER_SIZE {
        return malformed(format!(
            "Data block {block} carries {} bytes, at most {DATA_BUFFER_SIZE} are allowed",
            data.len()
        ));
    }
    Ok(Packet::Data { block, data: data.to_vec() })
}

fn parse_ack(buf: &[u8]) -> ParseResult<Packet> {
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Ack { block })
}

fn parse_error(buf: &[u8]) -> ParseResult<Packet> {
    let code = ErrorCode::from(u16_from_buffer(&buf[2..4]));

    // Error packets are a courtesy, so a missing terminator is tolerated.
    let message = match string_from_buffer(&buf[HEADER_SIZE..]) {
        Some((message, _)) => message,
        None => NetString(String::from_utf8_lossy(&buf[HEADER_SIZE..]).into_owned()),
    };
    Ok(Packet::Error { code, message })
}

impl Packet {
    /// Decodes one datagram.
    pub fn parse_from_buf(buf: &[u8]) -> ParseResult<Packet> {
        if buf.len() < HEADER_SIZE {
            return malformed("Packet too short!");
        }

        match retrieve_op_code(&buf[..2])? {
            OpCode::Rrq => parse_read_req(buf),
            OpCode::Wrq => parse_write_req(buf),
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => parse_error(buf),
        }
    }

    /// Encodes the packet into its wire form. Never fails.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAX_PACKET_SIZE);
        buf.extend_from_slice(&self.op_code().raw().to_be_bytes());
        match self {
            Packet::ReadReq { path, mode } | Packet::WriteReq { path, mode } => {
                buf.extend_from_slice(path.as_bytes());
                buf.push(0x00);
                buf.extend_from_slice(mode.as_str().as_bytes());
                buf.push(0x00);
            }
            Packet::Data { block, data } => {
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack { block } => buf.extend_from_slice(&block.to_be_bytes()),
            Packet::Error { code, message } => {
                buf.extend_from_slice(&code.raw().to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0x00);
            }
        }
        buf
    }

    pub fn op_code(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
        }
    }

    /// Builds an error packet carrying the code's stock message.
    pub fn error(code: ErrorCode) -> Packet {
        Packet::Error { code, message: code.default_message().into() }
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that sends TFTP packets and hands back the raw datagrams it
/// receives, together with the address that sent them.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> Result<TftpSocket, SocketError> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    pub async fn recv_with_timeout(&self, ttl: Duration) -> Result<(Vec<u8>, SocketAddr), SocketError> {
        // One spare byte so an oversized datagram is noticed rather than silently truncated.
        let mut buf = [0; MAX_PACKET_SIZE + 1];
        let (total_written, src) = timeout(ttl, self.sock.recv_from(&mut buf)).await??;
        Ok((buf[..total_written].to_vec(), src))
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> Result<(), SocketError> {
        self.sock.send_to(&packet.to_bytes(), dst).await?;
        Ok(())
    }
}
