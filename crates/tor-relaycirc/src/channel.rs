//! Traits through which a circuit reaches the channel layer.
//!
//! This crate never opens a socket.  The embedding relay provides a
//! [`Channel`] for each live OR connection, and a [`ChannelProvider`]
//! that can produce (or reuse) an outgoing channel to a named relay
//! when a circuit needs to extend.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tor_llcrypto::pk::rsa::RsaIdentity;

use crate::cell::{Cell, CircId};
use crate::link::CellSender;
use crate::Result;

/// Instructions for reaching the relay that an extend request names.
#[derive(Clone, Debug)]
pub struct ChanTarget {
    /// TCP addresses the relay may be reached at.  Possibly empty, if
    /// the provider can find the relay by identity alone.
    addrs: Vec<SocketAddr>,
    /// The RSA identity the relay must prove.
    rsa_id: RsaIdentity,
}

impl ChanTarget {
    /// Construct a new target from a list of addresses and an identity.
    pub fn new(addrs: Vec<SocketAddr>, rsa_id: RsaIdentity) -> Self {
        ChanTarget { addrs, rsa_id }
    }

    /// Return the TCP addresses for this target.
    pub fn addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    /// Return the RSA identity for this target.
    pub fn rsa_identity(&self) -> &RsaIdentity {
        &self.rsa_id
    }
}

/// One live OR connection, as a circuit sees it.
///
/// Implementations own the cell framing and the TLS stream; they
/// demultiplex inbound cells by circuit ID into the [`CellSender`]s
/// registered with [`Channel::add_circuit`].
#[async_trait]
pub trait Channel: Send + Sync {
    /// Queue `cell` for transmission on this channel.
    ///
    /// May block when the channel's writer is saturated.  Fails if the
    /// channel has closed.
    async fn send_cell(&self, cell: Cell) -> Result<()>;

    /// Register a circuit on this channel, returning the circuit ID
    /// allocated for it.
    ///
    /// Inbound cells bearing that ID must be delivered into `sender`.
    /// The implementation picks the ID (see [`CircId::random`]) and
    /// must never hand out an ID that is already live on this channel.
    fn add_circuit(&self, sender: CellSender) -> Result<CircId>;
}

/// An object that can fulfill outbound channel requests issued by a
/// circuit that is extending.
///
/// The implementor is responsible for reusing existing channels where
/// possible, for verifying that the relay it reaches proves the
/// identity in the target, and for imposing its own connect timeout
/// and retry policy.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Get a channel corresponding to the identity of `target`,
    /// launching one if needed.
    async fn get_or_launch(&self, target: &ChanTarget) -> Result<Arc<dyn Channel>>;
}
