//! Per-connection traffic counters

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters updated on the connection's I/O path.
#[derive(Debug, Default)]
pub struct ServerStats {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    commands: AtomicU64,
    messages: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Packets written
    pub packets_sent: u64,
    /// Packets read
    pub packets_received: u64,
    /// Bytes written, including preambles
    pub bytes_sent: u64,
    /// Bytes read, including preambles
    pub bytes_received: u64,
    /// Commands issued
    pub commands: u64,
    /// Server messages received
    pub messages: u64,
}

impl ServerStats {
    /// Fresh counters
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_send(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_receive(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_command(&self) {
        self.commands.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            commands: self.commands.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
        }
    }

    /// Reset every counter to zero
    pub fn clear(&self) {
        for counter in [
            &self.packets_sent,
            &self.packets_received,
            &self.bytes_sent,
            &self.bytes_received,
            &self.commands,
            &self.messages,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "commands={} packets sent={} recv={} bytes sent={} recv={} messages={}",
            self.commands,
            self.packets_sent,
            self.packets_received,
            self.bytes_sent,
            self.bytes_received,
            self.messages
        )
    }
}
