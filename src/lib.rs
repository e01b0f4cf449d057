//! p4rpc – a client for the Perforce Helix Core RPC protocol
//!
//! This crate provides:
//! - Packet framing for the flat key/value wire protocol
//! - Plain and TLS connections with fingerprint-based server trust
//! - Ticket and trust files shared safely between processes
//! - Command dispatch with streamed, severity-classified results
//! - Lenient decoding of results into typed file records

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Protocol client modules
pub mod rpc;

// Re-export key types for convenience
pub use rpc::{Connection, ConnectTarget, P4Error, P4Result, RpcConfig};

/// Current version of the p4rpc crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
