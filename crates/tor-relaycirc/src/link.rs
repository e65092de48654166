//! One leg of a transverse circuit, and the queues that feed it.
//!
//! A circuit has a previous-hop leg from birth and gains a next-hop leg
//! when it is extended.  Each leg pairs a channel with the circuit ID
//! the circuit uses *on that channel* (the IDs differ between the two
//! legs of the same circuit).  Inbound cells reach the circuit's
//! reactor through a bounded queue per leg; the reactor owns the
//! receiving ends, so that when it stops, producers see a closed queue
//! instead of blocking.

use std::sync::Arc;

use futures::channel::mpsc;
use futures::SinkExt;

use crate::cell::{BoxedCellBody, Cell, ChanCmd, CircId, DestroyReason};
use crate::channel::Channel;
use crate::{Error, Result};

/// Create the inbound cell queue for one leg of a circuit.
pub(crate) fn cell_queue(depth: usize) -> (CellSender, CellReceiver) {
    let (tx, rx) = mpsc::channel(depth);
    (CellSender(tx), rx)
}

/// The reactor's end of an inbound cell queue.
pub(crate) type CellReceiver = mpsc::Receiver<Cell>;

/// A handle used to deliver inbound cells to a circuit.
///
/// The channel layer holds one of these per (channel, circuit ID) pair,
/// and feeds it every cell it demultiplexes for that circuit.
#[derive(Clone, Debug)]
pub struct CellSender(mpsc::Sender<Cell>);

impl CellSender {
    /// Deliver a cell to the circuit.
    ///
    /// Waits while the circuit's queue is full; fails with
    /// [`Error::CircuitClosed`] once the circuit has stopped.
    pub async fn send(&mut self, cell: Cell) -> Result<()> {
        self.0.send(cell).await.map_err(|_| Error::CircuitClosed)
    }

    /// Close the queue.
    ///
    /// Called by the channel layer when its connection dies: the
    /// circuit's reactor observes end-of-input and tears the circuit
    /// down.
    pub fn close(&mut self) {
        self.0.close_channel();
    }
}

/// One leg of a transverse circuit: a channel, plus the circuit ID this
/// circuit carries on it.
///
/// The inbound queue for the leg is owned by the reactor, not by the
/// link; a `CircuitLink` is only ever used to transmit.
#[derive(Clone)]
pub(crate) struct CircuitLink {
    /// The channel this leg runs over.
    channel: Arc<dyn Channel>,
    /// The circuit ID assigned to this circuit on `channel`.
    circ_id: CircId,
}

impl CircuitLink {
    /// Construct a link from a channel and the circuit ID on it.
    pub(crate) fn new(channel: Arc<dyn Channel>, circ_id: CircId) -> Self {
        CircuitLink { channel, circ_id }
    }

    /// Return the circuit ID this circuit uses on this leg.
    pub(crate) fn circ_id(&self) -> CircId {
        self.circ_id
    }

    /// Send a cell on this leg, stamping it with the leg's circuit ID.
    pub(crate) async fn send_cell(&self, cmd: ChanCmd, body: BoxedCellBody) -> Result<()> {
        self.channel.send_cell(Cell::new(self.circ_id, cmd, body)).await
    }

    /// Send a DESTROY cell on this leg.
    pub(crate) async fn destroy(&self, reason: DestroyReason) -> Result<()> {
        self.channel
            .send_cell(Cell::destroy(self.circ_id, reason))
            .await
    }
}

impl std::fmt::Debug for CircuitLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitLink")
            .field("circ_id", &self.circ_id)
            .finish_non_exhaustive()
    }
}
