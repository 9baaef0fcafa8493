use std::fmt;
use thiserror::Error;

/// ADB protocol version sent in the host CNXN frame.
pub const ADB_VERSION: u32 = 0x0100_0001;

/// Maximum payload the host advertises before the device negotiates
/// its own limit.
pub const DEFAULT_MAX_PAYLOAD: u32 = 1024 * 1024;

/// Wire size of a packet header.
pub const HEADER_LEN: usize = 24;

/// ADB command tags, stored as the four ASCII bytes of the tag in
/// little-endian order (`CNXN` -> 0x4e584e43).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    /// Connect / banner exchange
    Cnxn = 0x4e58_4e43,
    /// Authentication
    Auth = 0x4854_5541,
    /// Open stream
    Open = 0x4e45_504f,
    /// OK / ready / flow-control credit
    Okay = 0x5941_4b4f,
    /// Write data on a stream
    Wrte = 0x4554_5257,
    /// Close stream
    Clse = 0x4553_4c43,
}

impl Command {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x4e58_4e43 => Some(Command::Cnxn),
            0x4854_5541 => Some(Command::Auth),
            0x4e45_504f => Some(Command::Open),
            0x5941_4b4f => Some(Command::Okay),
            0x4554_5257 => Some(Command::Wrte),
            0x4553_4c43 => Some(Command::Clse),
            _ => None,
        }
    }

    /// The four-character tag, e.g. `"CNXN"`.
    pub fn tag(&self) -> &'static str {
        match self {
            Command::Cnxn => "CNXN",
            Command::Auth => "AUTH",
            Command::Open => "OPEN",
            Command::Okay => "OKAY",
            Command::Wrte => "WRTE",
            Command::Clse => "CLSE",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Convert a four-byte ASCII tag to its 32-bit little-endian integer form.
pub fn tag_to_u32(tag: [u8; 4]) -> u32 {
    u32::from_le_bytes(tag)
}

/// Convert the 32-bit integer form back to the four tag bytes.
pub fn u32_to_tag(value: u32) -> [u8; 4] {
    value.to_le_bytes()
}

/// AUTH frame subtypes carried in `arg0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AuthType {
    /// Challenge token from the device
    Token = 1,
    /// Signed token from the host
    Signature = 2,
    /// Host RSA public key
    RsaPublicKey = 3,
}

/// Unsigned 32-bit sum of the payload bytes.
pub fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
}

/// Decoded 24-byte packet header. The magic field is validated during
/// decode and recomputed during encode, so it is not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: Command,
    pub arg0: u32,
    pub arg1: u32,
    pub payload_len: u32,
    pub checksum: u32,
}

impl Header {
    /// Decode a header, returning `None` for anything that is not a
    /// valid frame: short input, unknown command tag, or a magic field
    /// that does not match `command XOR 0xFFFFFFFF`. Receivers drop
    /// such frames silently and resynchronise.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);

        let raw_command = word(0);
        let magic = word(20);
        if magic != raw_command ^ 0xffff_ffff {
            return None;
        }
        let command = Command::from_u32(raw_command)?;

        Some(Self {
            command,
            arg0: word(4),
            arg1: word(8),
            payload_len: word(12),
            checksum: word(16),
        })
    }
}

/// An outbound or inbound frame: header fields plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command: Command,
    pub arg0: u32,
    pub arg1: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(command: Command, arg0: u32, arg1: u32, payload: Vec<u8>) -> Self {
        Self {
            command,
            arg0,
            arg1,
            payload,
        }
    }

    /// Encode the 24-byte header for this packet, computing the payload
    /// length, the additive checksum, and the magic word. Fails with
    /// [`AdbError::PayloadTooLarge`] when the payload exceeds the
    /// negotiated maximum.
    pub fn encode_header(&self, max_payload: usize) -> Result<[u8; HEADER_LEN], AdbError> {
        if self.payload.len() > max_payload {
            return Err(AdbError::PayloadTooLarge {
                len: self.payload.len(),
                max: max_payload,
            });
        }

        let mut bytes = [0u8; HEADER_LEN];
        let command = self.command as u32;
        bytes[0..4].copy_from_slice(&command.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.arg0.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.arg1.to_le_bytes());
        bytes[12..16].copy_from_slice(&(self.payload.len() as u32).to_le_bytes());
        bytes[16..20].copy_from_slice(&checksum(&self.payload).to_le_bytes());
        bytes[20..24].copy_from_slice(&(command ^ 0xffff_ffff).to_le_bytes());
        Ok(bytes)
    }
}

/// ADB client errors.
///
/// `InvalidFrame` and `TransportTransient` are recovered internally
/// (drop-and-resync, retry budget) and never reach callers; the rest
/// surface through [`crate::client::ErrorReport`].
#[derive(Debug, Error)]
pub enum AdbError {
    #[error("no ADB interface on this device")]
    NoAdbInterface,

    #[error("ADB interface is claimed by another process (is a local adb server running?)")]
    Busy,

    #[error("device disconnected")]
    Disconnected,

    #[error("operation timed out")]
    Timeout,

    #[error("device rejected authentication")]
    AuthRejected,

    #[error("stream rejected by device")]
    Rejected,

    #[error("payload of {len} bytes exceeds negotiated maximum of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("stream is closed")]
    Closed,

    #[error("invalid frame")]
    InvalidFrame,

    #[error("transient transport failure: {0}")]
    TransportTransient(String),

    #[error("internal error: {0}")]
    Internal(String),
}
