//! The externally-visible handle on a transverse circuit.
//!
//! Creating a circuit yields two values: a [`TransverseCircuit`] handle
//! that the channel layer keeps, and a [`Reactor`] that must be spawned
//! to do the actual work.  The handle outlives nothing: once the
//! reactor stops, cells delivered through the handle's senders are
//! rejected, and [`TransverseCircuit::close`] returns.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use oneshot_fused_workaround as oneshot;
use tor_rtcompat::SleepProvider;
use tracing::trace;

use crate::cell::CircId;
use crate::channel::{Channel, ChannelProvider};
use crate::crypto::CryptoState;
use crate::link::{cell_queue, CellSender, CircuitLink};
use crate::metrics::RelayMetrics;
use crate::reactor::Reactor;

/// Default size of the inbound cell queue on each leg of a circuit.
const DEFAULT_CELL_QUEUE_DEPTH: usize = 16;

/// Default time to wait for the next relay to answer a CREATE cell.
const DEFAULT_EXTEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunable parameters for a transverse circuit.
#[derive(Clone, Debug)]
pub struct CircuitParams {
    /// How long to wait for a CREATED or CREATED2 answer while
    /// extending, before giving up on the circuit.
    extend_timeout: Duration,
    /// Capacity of the inbound cell queue on each leg.
    cell_queue_depth: usize,
}

impl Default for CircuitParams {
    fn default() -> Self {
        CircuitParams {
            extend_timeout: DEFAULT_EXTEND_TIMEOUT,
            cell_queue_depth: DEFAULT_CELL_QUEUE_DEPTH,
        }
    }
}

impl CircuitParams {
    /// Return a new `CircuitParams` with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the extend timeout.
    pub fn with_extend_timeout(mut self, timeout: Duration) -> Self {
        self.extend_timeout = timeout;
        self
    }

    /// Replace the inbound queue depth.
    pub fn with_cell_queue_depth(mut self, depth: usize) -> Self {
        self.cell_queue_depth = depth;
        self
    }

    /// Return the configured extend timeout.
    pub(crate) fn extend_timeout(&self) -> Duration {
        self.extend_timeout
    }

    /// Return the configured queue depth.
    pub(crate) fn cell_queue_depth(&self) -> usize {
        self.cell_queue_depth
    }
}

/// An identifier for a circuit within this process, for logging.
///
/// No two circuits within a process share a `UniqId`, even if they end
/// up reusing the same circuit IDs on their channels.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct UniqId(u64);

impl UniqId {
    /// Return the next unused `UniqId`.
    pub(crate) fn next() -> Self {
        /// The `UniqId` of the next circuit to be created.
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for UniqId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Circ {}", self.0)
    }
}

/// An instruction from the circuit handle to its reactor.
#[derive(Debug)]
pub(crate) enum CtrlMsg {
    /// Shut the circuit down.
    Shutdown,
}

/// A handle on a circuit transiting through this relay.
///
/// The handle is how the channel layer talks to the circuit: it hands
/// inbound cells to the senders, and closes the circuit when its own
/// connection dies.
pub struct TransverseCircuit {
    /// An identifier for logging about this circuit.
    unique_id: UniqId,
    /// Sender for control messages to the reactor.
    control: mpsc::UnboundedSender<CtrlMsg>,
    /// Resolves (with `Canceled`) once the reactor has been dropped;
    /// this is how [`TransverseCircuit::close`] joins the worker.
    reactor_closed_rx: oneshot::Receiver<void::Void>,
    /// Sender feeding the previous-hop inbound queue.
    pch_tx: CellSender,
    /// Sender feeding the next-hop inbound queue.
    nch_tx: CellSender,
}

impl TransverseCircuit {
    /// Create a new transverse circuit terminating one leg on
    /// `channel`, where it is known as `circ_id`.
    ///
    /// `forward` and `backward` are the two directions of cryptographic
    /// state derived from the circuit handshake.  `provider` is
    /// consulted if the circuit is later asked to extend.
    ///
    /// Returns the circuit handle and a [`Reactor`].  The caller must
    /// spawn [`Reactor::run`], or the circuit will never move a cell.
    pub fn new<R: SleepProvider>(
        runtime: R,
        channel: Arc<dyn Channel>,
        circ_id: CircId,
        forward: CryptoState,
        backward: CryptoState,
        provider: Box<dyn ChannelProvider>,
        params: &CircuitParams,
        metrics: Arc<RelayMetrics>,
    ) -> (Self, Reactor<R>) {
        let unique_id = UniqId::next();
        let (control_tx, control_rx) = mpsc::unbounded();
        let (pch_tx, pch_rx) = cell_queue(params.cell_queue_depth());
        let (nch_tx, nch_rx) = cell_queue(params.cell_queue_depth());
        let (reactor_closed_tx, reactor_closed_rx) = oneshot::channel();

        metrics.circuit_alloc();
        trace!(circ_id = %unique_id, "New transverse circuit");

        let reactor = Reactor::new(
            runtime,
            unique_id,
            control_rx,
            pch_rx,
            nch_rx,
            nch_tx.clone(),
            CircuitLink::new(channel, circ_id),
            forward,
            backward,
            provider,
            params.extend_timeout(),
            metrics,
            reactor_closed_tx,
        );

        let circuit = TransverseCircuit {
            unique_id,
            control: control_tx,
            reactor_closed_rx,
            pch_tx,
            nch_tx,
        };

        (circuit, reactor)
    }

    /// Return the process-local identifier for this circuit.
    pub fn unique_id(&self) -> UniqId {
        self.unique_id
    }

    /// Return a sender for cells arriving on the previous-hop leg.
    ///
    /// The channel layer registers this against the circuit's ID on the
    /// incoming connection.
    pub fn forward_sender(&self) -> CellSender {
        self.pch_tx.clone()
    }

    /// Return a sender for cells arriving on the next-hop leg.
    ///
    /// This is registered on the outgoing connection when the circuit
    /// extends.
    pub fn backward_sender(&self) -> CellSender {
        self.nch_tx.clone()
    }

    /// Shut this circuit down, and wait for its reactor to finish.
    ///
    /// The circuit is torn down as if its channel had closed: a DESTROY
    /// with reason CHANNEL_CLOSED goes out on every live leg.  Closing
    /// an already-stopped circuit is a no-op.
    pub async fn close(mut self) {
        let _ = self.control.unbounded_send(CtrlMsg::Shutdown);
        // The error case here is Canceled: the reactor is gone, which is
        // exactly what we are waiting for.
        let _ = (&mut self.reactor_closed_rx).await;
    }
}
