//! Perforce RPC client
//!
//! Layered leaf-first: the wire codec frames records, the trust and ticket
//! stores persist credentials, the connection owns a transport and checks
//! trust, the dispatcher runs commands over a connection, and the file-spec
//! decoder turns results into typed records.

// Submodules
pub mod auth_file;
pub mod codec;
pub mod config;
pub mod connection;
pub mod decode;
pub mod dispatch;
pub mod env;
pub mod error;
pub mod filespec;
pub mod message;
pub mod stats;
pub mod tickets;
pub mod transport;
pub mod trust;
pub mod uri;

pub use auth_file::{AuthStore, LockPolicy};
pub use codec::{Charset, FieldValue, WireRecord};
pub use config::RpcConfig;
pub use connection::{ConnectOutcome, ConnectTarget, Connection, ConnectionState};
pub use decode::{ChangelistId, Revision};
pub use dispatch::{CommandCallback, CommandOutput, CommandRecord, CommandStatus, ResultSink};
pub use error::{CommandError, ConnectionError, P4Error, P4Result, StoreError, TrustError, TrustKind};
pub use filespec::{ExtendedAttributes, FileFields, FileSpec};
pub use message::{AuthFailure, ServerMessage, Severity};
pub use tickets::{AuthTicket, TicketStore};
pub use transport::{Connector, TcpConnector, Transport};
pub use trust::{Fingerprint, FingerprintRole, TrustDecision, TrustOptions, TrustOutcome, TrustStore};
pub use uri::ServerUri;
