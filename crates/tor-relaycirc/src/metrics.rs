//! Counters for relayed traffic.
//!
//! These are plain atomics: how they are exported is up to the embedding
//! relay, which typically shares one [`RelayMetrics`] across every
//! circuit it carries.

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregate counters for the circuits a relay is carrying.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Number of transverse circuits currently alive.
    circuits_live: AtomicU64,
    /// Total bytes forwarded away from clients.
    relay_forward_bytes: AtomicU64,
    /// Total bytes forwarded toward clients.
    relay_backward_bytes: AtomicU64,
}

impl RelayMetrics {
    /// Create a new set of counters, all zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that a circuit has been created.
    pub(crate) fn circuit_alloc(&self) {
        self.circuits_live.fetch_add(1, Ordering::Relaxed);
    }

    /// Note that a circuit has been torn down.
    pub(crate) fn circuit_free(&self) {
        self.circuits_live.fetch_sub(1, Ordering::Relaxed);
    }

    /// Note `n` bytes relayed away from the client.
    pub(crate) fn note_relay_forward(&self, n: usize) {
        self.relay_forward_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Note `n` bytes relayed toward the client.
    pub(crate) fn note_relay_backward(&self, n: usize) {
        self.relay_backward_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Return the number of circuits currently alive.
    pub fn circuits_live(&self) -> u64 {
        self.circuits_live.load(Ordering::Relaxed)
    }

    /// Return the total number of bytes relayed away from clients.
    pub fn relay_forward_bytes(&self) -> u64 {
        self.relay_forward_bytes.load(Ordering::Relaxed)
    }

    /// Return the total number of bytes relayed toward clients.
    pub fn relay_backward_bytes(&self) -> u64 {
        self.relay_backward_bytes.load(Ordering::Relaxed)
    }
}
