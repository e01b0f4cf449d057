//! Error types for the Perforce RPC client
//!
//! Each layer owns a thiserror enum; the umbrella [`P4Error`] converts from all
//! of them at the public boundary.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use super::message::{AuthFailure, ServerMessage};

/// Top-level client error
#[derive(Debug, Error)]
pub enum P4Error {
    /// Wire codec errors
    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    /// Trust/ticket persistence errors
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Server trust errors
    #[error("Trust error: {0}")]
    Trust(#[from] TrustError),

    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Command errors
    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Convenience result alias for the public API
pub type P4Result<T> = std::result::Result<T, P4Error>;

/// Wire framing and charset errors. Always fatal for the current connection.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Preamble checksum byte did not match the length bytes
    #[error("Bad packet preamble checksum (expected {expected:#04x}, got {actual:#04x})")]
    BadChecksum {
        /// Checksum computed from the length bytes
        expected: u8,
        /// Checksum byte received
        actual: u8,
    },

    /// Packet length exceeds the configured maximum
    #[error("Packet of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    /// Field framing was truncated or missing its terminator
    #[error("Malformed packet field at offset {offset}: {detail}")]
    MalformedField {
        /// Byte offset within the payload
        offset: usize,
        /// Description of the problem
        detail: String,
    },

    /// Packet has no function name
    #[error("Packet is missing its function name")]
    MissingFunction,

    /// Charset is not supported by this client
    #[error("Unsupported charset: {0}")]
    UnsupportedCharset(String),

    /// Text could not be represented in the negotiated charset
    #[error("Value cannot be encoded as {charset}: {detail}")]
    Unencodable {
        /// Charset name
        charset: String,
        /// Offending value or reason
        detail: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience result alias for codec operations
pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// Local persistence failures for the trust and ticket files.
///
/// These mean the credential could not be cached locally, independent of
/// whatever the server did.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Lock was not acquired within the retry budget
    #[error("Could not persist credential: lock {path} not acquired after {tries} tries")]
    LockTimeout {
        /// Lock file path
        path: PathBuf,
        /// Number of attempts made
        tries: u32,
    },

    /// The credential file could not be rewritten
    #[error("Could not persist credential: {path} could not be overwritten: {source}")]
    RewriteFailed {
        /// Target file
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },

    /// Several saves were attempted and at least one failed
    #[error("Could not persist credential: {} of {attempted} writes failed", .failures.len())]
    Aggregate {
        /// Number of writes attempted
        attempted: usize,
        /// Failures, in attempt order
        failures: Vec<StoreError>,
    },

    /// IO error
    #[error("Could not persist credential: {0}")]
    Io(#[from] io::Error),
}

/// Convenience result alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Reason a server is not yet trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustKind {
    /// No fingerprint recorded for the server
    NewConnection,
    /// A different fingerprint is recorded for the server
    NewKey,
}

impl std::fmt::Display for TrustKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrustKind::NewConnection => f.write_str("NEW_CONNECTION"),
            TrustKind::NewKey => f.write_str("NEW_KEY"),
        }
    }
}

/// Trust decision failures
#[derive(Debug, Error)]
pub enum TrustError {
    /// Server requires an explicit trust decision
    #[error("{kind}: the authenticity of '{server}' can't be established, fingerprint {fingerprint}")]
    NotEstablished {
        /// Classification
        kind: TrustKind,
        /// Server ip:port
        server: String,
        /// Fingerprint observed on the wire
        fingerprint: String,
    },

    /// Fingerprint value is not colon-separated hex
    #[error("Malformed fingerprint: {0}")]
    MalformedFingerprint(String),

    /// Connection has no fingerprint (not a TLS connection)
    #[error("Connection to '{0}' is not secured; no fingerprint available")]
    NotSecure(String),

    /// Underlying store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Convenience result alias for trust operations
pub type TrustResult<T> = std::result::Result<T, TrustError>;

/// Transport and session errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// IO error on the socket
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// TLS setup or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Framing error
    #[error("{0}")]
    Codec(#[from] CodecError),

    /// Trust check failed
    #[error("{0}")]
    Trust(#[from] TrustError),

    /// Operation not valid in the current state
    #[error("Connection is {0}")]
    InvalidState(&'static str),

    /// Server URI could not be parsed
    #[error("Invalid server URI '{uri}': {detail}")]
    InvalidUri {
        /// URI text
        uri: String,
        /// Reason
        detail: String,
    },

    /// Server closed the connection mid-command
    #[error("Server closed the connection")]
    Closed,
}

/// Convenience result alias for connection operations
pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

/// Command execution failures
#[derive(Debug, Error)]
pub enum CommandError {
    /// Authentication is required or was rejected
    #[error("Access denied ({kind:?}): {message}")]
    Access {
        /// Failure classification
        kind: AuthFailure,
        /// Server message
        message: ServerMessage,
    },

    /// Server rejected the command
    #[error("Request failed: {0}")]
    Request(ServerMessage),

    /// Command name is not acceptable
    #[error("Invalid command name '{0}'")]
    InvalidCommand(String),

    /// Transport failure during the command
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl From<CodecError> for CommandError {
    fn from(err: CodecError) -> Self {
        CommandError::Connection(ConnectionError::Codec(err))
    }
}

impl From<io::Error> for CommandError {
    fn from(err: io::Error) -> Self {
        CommandError::Connection(ConnectionError::Io(err))
    }
}

/// Convenience result alias for command operations
pub type CommandResult<T> = std::result::Result<T, CommandError>;
