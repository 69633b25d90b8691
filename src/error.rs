//! Error types for the decoding engine.
//!
//! Every variant renders a stable diagnostic string. [`Error::kind`] maps a
//! variant onto the engine's failure taxonomy so callers can decide whether
//! to keep feeding packets for the same flow.

use std::net::IpAddr;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed headers, bad lengths, unsupported protocol features.
    Structural,
    /// Configuration or key availability problems.
    Policy,
    /// Memory budget or allocation problems.
    Resource,
    /// Packet loss that the repair paths could not absorb.
    Recoverable,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("server not registered: {addr}:{port}")]
    ServerNotRegistered { addr: IpAddr, port: u16 },

    #[error("no session for mid-stream packet")]
    NoSession,

    #[error("session was terminated by an earlier fatal error: {0}")]
    SessionFatal(String),

    #[error("invalid private key: {0}")]
    InvalidKey(String),

    #[error("unsupported private key type: {0}")]
    UnsupportedKey(String),

    #[error("no private key available for key exchange")]
    MissingPrivateKey,

    #[error("pre-master secret decryption failed")]
    PreMasterDecrypt,

    #[error("reassembly limit exceeded ({limit} bytes)")]
    ReassemblyLimit { limit: usize },

    #[error("ack fault: peer acknowledged {missing} bytes never observed")]
    AckFault { missing: u32 },

    #[error("record length {len} exceeds maximum {max}")]
    RecordTooLarge { len: usize, max: usize },

    #[error("invalid record header (type 0x{content_type:02x}, version 0x{version:04x})")]
    BadRecordHeader { content_type: u8, version: u16 },

    #[error("handshake message length {len} exceeds maximum {max}")]
    HandshakeTooLarge { len: usize, max: usize },

    #[error("malformed handshake message: {0}")]
    MalformedHandshake(&'static str),

    #[error("unsupported handshake message type {0}")]
    UnsupportedHandshake(u8),

    #[error("unexpected {0}")]
    UnexpectedMessage(&'static str),

    #[error("ephemeral key exchange cannot be decrypted passively (suite 0x{0:04x})")]
    EphemeralKeyExchange(u16),

    #[error("unsupported cipher suite 0x{0:04x}")]
    UnsupportedCipherSuite(u16),

    #[error("unsupported protocol version 0x{0:04x}")]
    UnsupportedVersion(u16),

    #[error("compression method {0} is not supported")]
    CompressionNotSupported(u8),

    #[error("resumed session not found in cache")]
    SessionNotCached,

    #[error("cipher keys not derived before ChangeCipherSpec")]
    KeysNotDerived,

    #[error("record authentication failed")]
    BadRecordMac,

    #[error("bad record padding")]
    BadPadding,

    #[error("Finished verify data mismatch")]
    BadFinished,

    #[error("record after resync could not be decoded")]
    ResyncPending,

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ServerNotRegistered { .. }
            | Error::NoSession
            | Error::InvalidKey(_)
            | Error::UnsupportedKey(_)
            | Error::MissingPrivateKey
            | Error::SessionNotCached
            | Error::EphemeralKeyExchange(_)
            | Error::Config(_) => ErrorKind::Policy,
            Error::ReassemblyLimit { .. } => ErrorKind::Resource,
            Error::AckFault { .. } | Error::ResyncPending => ErrorKind::Recoverable,
            Error::SessionFatal(_) => ErrorKind::Policy,
            _ => ErrorKind::Structural,
        }
    }

    /// Whether this error terminates the session it was raised for.
    ///
    /// `ResyncPending` only drops one record; `ServerNotRegistered`,
    /// `NoSession` and `MalformedPacket` never get as far as a session.
    pub fn is_session_fatal(&self) -> bool {
        !matches!(
            self,
            Error::ResyncPending
                | Error::ServerNotRegistered { .. }
                | Error::NoSession
                | Error::MalformedPacket(_)
                | Error::InvalidKey(_)
                | Error::UnsupportedKey(_)
                | Error::Config(_)
        )
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Error::Crypto(e.to_string())
    }
}
