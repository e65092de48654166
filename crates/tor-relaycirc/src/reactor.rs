//! The transverse circuit reactor.
//!
//! One reactor task drives each circuit.  A single task services both
//! legs on purpose: the extension sub-protocol needs exclusive access
//! to the next-hop inbound queue for exactly one receive (the
//! CREATED/CREATED2 answer), and with one consumer that exclusivity
//! holds by construction.  A circuit has at most one outstanding
//! extension, and cells from a next hop that does not exist yet cannot
//! arrive, so stalling the pumps for the duration is harmless.

use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use futures::{select_biased, StreamExt};
use oneshot_fused_workaround as oneshot;
use retry_error::RetryError;
use tor_error::{internal, trace_report, warn_report};
use tor_rtcompat::{SleepProvider, SleepProviderExt};
use tracing::{debug, trace, warn};

use crate::cell::{BoxedCellBody, Cell, ChanCmd, DestroyReason, CELL_DATA_LEN};
use crate::channel::{ChanTarget, ChannelProvider};
use crate::circuit::{CtrlMsg, UniqId};
use crate::crypto::CryptoState;
use crate::err::{ExtendError, ReactorError};
use crate::extend::{Created, Created2, Extend2Payload, ExtendPayload, ExtendRequest};
use crate::link::{CellReceiver, CellSender, CircuitLink};
use crate::metrics::RelayMetrics;
use crate::relaycell::{RelayCellBody, RelayCmd};
use crate::{Error, Result};

use std::result::Result as StdResult;

/// Which flavor of the extension sub-protocol a request selected.
///
/// The two flavors differ only in their wire formats; the sequence of
/// steps is identical, so the handler takes one of these instead of
/// being written twice.
#[derive(Copy, Clone, Debug)]
enum ExtendVariant {
    /// EXTEND / CREATE / CREATED / EXTENDED (TAP only)
    Extend,
    /// EXTEND2 / CREATE2 / CREATED2 / EXTENDED2
    Extend2,
}

impl ExtendVariant {
    /// The cell command used to pass the handshake to the next relay.
    fn create_cmd(self) -> ChanCmd {
        match self {
            ExtendVariant::Extend => ChanCmd::CREATE,
            ExtendVariant::Extend2 => ChanCmd::CREATE2,
        }
    }
    /// The cell command the next relay answers with.
    fn created_cmd(self) -> ChanCmd {
        match self {
            ExtendVariant::Extend => ChanCmd::CREATED,
            ExtendVariant::Extend2 => ChanCmd::CREATED2,
        }
    }
    /// The relay command used to answer the client.
    fn extended_cmd(self) -> RelayCmd {
        match self {
            ExtendVariant::Extend => RelayCmd::EXTENDED,
            ExtendVariant::Extend2 => RelayCmd::EXTENDED2,
        }
    }
    /// Parse the data of a relay cell as this variant's request format.
    fn parse_request(self, data: &[u8]) -> StdResult<Box<dyn ExtendRequest + Send>, ExtendError> {
        Ok(match self {
            ExtendVariant::Extend => Box::new(ExtendPayload::decode(data)?),
            ExtendVariant::Extend2 => Box::new(Extend2Payload::decode(data)?),
        })
    }
    /// Extract the server handshake from the next relay's answer.
    fn parse_created(self, cell: &Cell) -> Result<Vec<u8>> {
        if cell.cmd() != self.created_cmd() {
            return Err(Error::CircProto(format!(
                "Got a {} cell while waiting for {}",
                cell.cmd(),
                self.created_cmd()
            )));
        }
        match self {
            ExtendVariant::Extend => {
                Created::decode_from_cell_body(cell.body()).map(Created::into_handshake)
            }
            ExtendVariant::Extend2 => {
                Created2::decode_from_cell_body(cell.body()).map(Created2::into_handshake)
            }
        }
    }
}

/// The reactor of a transverse circuit.
///
/// Pumps cells between the two legs of the circuit, answers extension
/// requests, and propagates teardown.  Stops when either leg closes,
/// when a peer sends DESTROY, when the handle asks it to, or on a
/// protocol violation.
#[must_use = "a reactor must be spawned, or its circuit will never carry a cell"]
pub struct Reactor<R: SleepProvider> {
    /// The runtime, used for the extension timeout.
    runtime: R,
    /// An identifier for logging about this reactor's circuit.
    unique_id: UniqId,
    /// Receiver for control messages, sent by the circuit handle.
    control: mpsc::UnboundedReceiver<CtrlMsg>,
    /// Inbound cells from the previous hop (toward the exit).
    pch: CellReceiver,
    /// Inbound cells from the next hop (toward the client).
    nch: CellReceiver,
    /// A sender for `nch`, registered on the outgoing channel when the
    /// circuit extends.
    nch_tx: CellSender,
    /// The leg toward the client.
    ///
    /// Present from birth; taken only during teardown.
    prev: Option<CircuitLink>,
    /// The leg toward the exit, once the circuit has been extended.
    next: Option<CircuitLink>,
    /// Crypto state for cells moving away from the client.
    fwd: CryptoState,
    /// Crypto state for cells moving toward the client.
    back: CryptoState,
    /// Where to get an outgoing channel when a client asks us to
    /// extend.
    chan_provider: Box<dyn ChannelProvider>,
    /// How long to wait for a CREATED or CREATED2 answer.
    extend_timeout: Duration,
    /// Whether this circuit has begun shutting down.
    destroyed: bool,
    /// The reason that will go out in DESTROY cells at teardown.
    ///
    /// Only the first cause of destruction is recorded.
    reason: DestroyReason,
    /// Counters shared with the rest of the relay.
    metrics: Arc<RelayMetrics>,
    /// The handle's half of the join protocol.
    ///
    /// Nothing is ever sent on this (hence `Void`): dropping it with the
    /// rest of the reactor is what wakes a handle blocked in
    /// [`TransverseCircuit::close`](crate::TransverseCircuit::close).
    #[allow(dead_code)] // held only so that its drop is observable.
    reactor_closed_tx: oneshot::Sender<void::Void>,
}

impl<R: SleepProvider> Reactor<R> {
    /// Create a new circuit reactor.  See
    /// [`TransverseCircuit::new`](crate::TransverseCircuit::new), which
    /// is the only caller.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        runtime: R,
        unique_id: UniqId,
        control: mpsc::UnboundedReceiver<CtrlMsg>,
        pch: CellReceiver,
        nch: CellReceiver,
        nch_tx: CellSender,
        prev: CircuitLink,
        fwd: CryptoState,
        back: CryptoState,
        chan_provider: Box<dyn ChannelProvider>,
        extend_timeout: Duration,
        metrics: Arc<RelayMetrics>,
        reactor_closed_tx: oneshot::Sender<void::Void>,
    ) -> Self {
        Reactor {
            runtime,
            unique_id,
            control,
            pch,
            nch,
            nch_tx,
            prev: Some(prev),
            // No next hop until an extend request makes one.
            next: None,
            fwd,
            back,
            chan_provider,
            extend_timeout,
            destroyed: false,
            reason: DestroyReason::NONE,
            metrics,
            reactor_closed_tx,
        }
    }

    /// Drive this circuit until it tears down, then tear it down
    /// cleanly.
    ///
    /// Consumes the reactor.  By the time this returns, DESTROY cells
    /// have gone out on every leg that still had a peer, the inbound
    /// queues are closed, and an `Err` is given back only if the
    /// teardown was caused by an actual failure rather than by the
    /// protocol or the handle.
    pub async fn run(mut self) -> Result<()> {
        trace!(circ_id = %self.unique_id, "Transverse circuit reactor starting");

        let result: Result<()> = loop {
            match self.run_once().await {
                Ok(()) => (),
                Err(ReactorError::Shutdown) => break Ok(()),
                Err(ReactorError::Err(e)) => break Err(e),
            }
        };

        match &result {
            Ok(()) => trace!(circ_id = %self.unique_id, "Transverse circuit reactor exiting"),
            Err(e) => {
                // A failure tears the circuit down like anything else;
                // make sure a matching wire reason is on record.
                let _ = self.destroy(e.destroy_reason());
                trace_report!(e, "{}: Transverse circuit reactor exiting", self.unique_id);
            }
        }

        self.cleanup().await;

        result
    }

    /// One turn of the loop: wait for work on any input and deal with
    /// it.
    async fn run_once(&mut self) -> StdResult<(), ReactorError> {
        let () = select_biased! {
            msg = self.control.next() => match msg {
                // The handle is gone, or asked us to stop: either way
                // the circuit's own channel is as good as closed.
                None | Some(CtrlMsg::Shutdown) => {
                    trace!(
                        circ_id = %self.unique_id,
                        "Circuit handle closed; shutting down",
                    );
                    return Err(self.destroy(DestroyReason::CHANNEL_CLOSED));
                }
            },
            cell = self.pch.next() => {
                let Some(cell) = cell else {
                    debug!(
                        circ_id = %self.unique_id,
                        "Previous-hop queue closed; shutting down",
                    );
                    return Err(self.destroy(DestroyReason::CHANNEL_CLOSED));
                };
                self.handle_prev_cell(cell).await?
            },
            cell = self.nch.next() => {
                // We hold a sender for nch ourselves, so the stream
                // cannot end while we are alive.
                let cell = cell.ok_or_else(|| internal!("next-hop queue closed under us?!"))?;
                self.handle_next_cell(cell).await?
            },
        };

        Ok(())
    }

    /// Mark this circuit for destruction with `reason`.
    ///
    /// Only the first call records a reason; later calls (and the
    /// DESTROY cells sent during teardown) reuse it.
    fn destroy(&mut self, reason: DestroyReason) -> ReactorError {
        if !self.destroyed {
            debug!(
                circ_id = %self.unique_id,
                reason = %reason,
                "Marking circuit for destruction",
            );
            self.destroyed = true;
            self.reason = reason;
        }
        ReactorError::Shutdown
    }

    /// Handle one cell that arrived from the previous hop.
    async fn handle_prev_cell(&mut self, cell: Cell) -> StdResult<(), ReactorError> {
        match cell.cmd() {
            ChanCmd::RELAY | ChanCmd::RELAY_EARLY => self.handle_forward_relay(cell).await,
            ChanCmd::DESTROY => self.handle_destroy(&cell, false),
            cmd => {
                warn!(
                    circ_id = %self.unique_id,
                    "Unexpected {cmd} cell from previous hop",
                );
                Err(self.destroy(DestroyReason::PROTOCOL))
            }
        }
    }

    /// Handle one cell that arrived from the next hop.
    async fn handle_next_cell(&mut self, cell: Cell) -> StdResult<(), ReactorError> {
        match cell.cmd() {
            ChanCmd::RELAY => self.handle_backward_relay(cell).await,
            ChanCmd::DESTROY => self.handle_destroy(&cell, true),
            cmd => {
                warn!(
                    circ_id = %self.unique_id,
                    "Unexpected {cmd} cell from next hop",
                );
                Err(self.destroy(DestroyReason::PROTOCOL))
            }
        }
    }

    /// Handle a DESTROY cell from either leg.
    ///
    /// The peer that sent it has already forgotten the circuit, so no
    /// DESTROY is echoed back on that leg: dropping the link here keeps
    /// cleanup from doing so.
    fn handle_destroy(&mut self, cell: &Cell, from_next: bool) -> StdResult<(), ReactorError> {
        let reason = DestroyReason::from_payload(cell.body());
        debug!(
            circ_id = %self.unique_id,
            reason = %reason,
            "Received DESTROY cell",
        );
        if from_next {
            self.next = None;
        } else {
            self.prev = None;
        }
        Err(self.destroy(reason))
    }

    /// Handle a RELAY or RELAY_EARLY cell moving away from the client.
    async fn handle_forward_relay(&mut self, cell: Cell) -> StdResult<(), ReactorError> {
        let cmd = cell.cmd();
        let mut body = RelayCellBody::from(cell.into_body());
        self.fwd.decrypt_inbound(&mut body);

        // An OR checks whether it recognizes the relay cell by looking at
        // the payload it just decrypted.  If it does, the cell is for us;
        // otherwise it belongs further along, and gets passed on if the
        // circuit continues.
        if !self.fwd.recognized(&body) {
            return self.handle_unrecognized_cell(cmd, body).await;
        }

        trace!(
            circ_id = %self.unique_id,
            cmd = %body.cmd(),
            stream_id = body.stream_id(),
            "Received relay cell",
        );

        match body.cmd() {
            RelayCmd::EXTEND => self.extend_circuit(&body, ExtendVariant::Extend).await,
            RelayCmd::EXTEND2 => self.extend_circuit(&body, ExtendVariant::Extend2).await,
            cmd => {
                // Not a command this hop acts on.  Tearing the circuit
                // down would be worse than ignoring it.
                debug!(
                    circ_id = %self.unique_id,
                    "No handler registered for relay command {cmd}",
                );
                Ok(())
            }
        }
    }

    /// Pass an unrecognized cell on to the next hop.
    async fn handle_unrecognized_cell(
        &mut self,
        cmd: ChanCmd,
        body: RelayCellBody,
    ) -> StdResult<(), ReactorError> {
        let Some(next) = self.next.clone() else {
            // We are the last hop, and the cell is addressed to nobody.
            warn!(
                circ_id = %self.unique_id,
                "Unrecognized relay cell at the end of the circuit",
            );
            return Err(self.destroy(DestroyReason::PROTOCOL));
        };

        trace!(circ_id = %self.unique_id, "Forwarding unrecognized cell");
        let n = body.as_ref().len();
        if let Err(e) = next.send_cell(cmd, body.into()).await {
            warn_report!(e, "{}: Could not forward cell to next hop", self.unique_id);
            return Err(self.destroy(DestroyReason::CONNECTFAILED));
        }
        self.metrics.note_relay_forward(n);

        Ok(())
    }

    /// Handle a RELAY cell moving toward the client.
    ///
    /// This hop only adds its layer of encryption; the digest is not
    /// involved, because the cell is not ours.
    async fn handle_backward_relay(&mut self, cell: Cell) -> StdResult<(), ReactorError> {
        let cmd = cell.cmd();
        let mut body = RelayCellBody::from(cell.into_body());
        self.back.encrypt(&mut body);

        let Some(prev) = self.prev.clone() else {
            return Err(internal!("backward relay cell with no previous hop?!").into());
        };

        let n = body.as_ref().len();
        if let Err(e) = prev.send_cell(cmd, body.into()).await {
            warn_report!(e, "{}: Could not forward cell to previous hop", self.unique_id);
            return Err(self.destroy(DestroyReason::CONNECTFAILED));
        }
        self.metrics.note_relay_backward(n);

        Ok(())
    }

    /// Grow the circuit by one hop, as directed by a recognized EXTEND
    /// or EXTEND2 cell.
    ///
    /// This runs to completion on the reactor: until the new hop has
    /// answered (or the attempt has failed), no other cell on this
    /// circuit is processed.
    async fn extend_circuit(
        &mut self,
        body: &RelayCellBody,
        variant: ExtendVariant,
    ) -> StdResult<(), ReactorError> {
        if self.next.is_some() {
            warn!(
                circ_id = %self.unique_id,
                "Extend request on a circuit that already has a next hop",
            );
            return Err(self.destroy(DestroyReason::PROTOCOL));
        }

        let req = match variant.parse_request(body.data()) {
            Ok(req) => req,
            Err(e) => {
                warn_report!(e, "{}: Could not parse extend request", self.unique_id);
                return Err(self.destroy(DestroyReason::PROTOCOL));
            }
        };
        let handshake = req.handshake();
        if handshake.len() > CELL_DATA_LEN {
            warn!(
                circ_id = %self.unique_id,
                "Extend handshake of {} bytes won't fit in a cell",
                handshake.len(),
            );
            return Err(self.destroy(DestroyReason::PROTOCOL));
        }
        let target = match req.rsa_identity() {
            Ok(id) => ChanTarget::new(req.addresses(), *id),
            Err(e) => {
                warn_report!(e, "{}: Extend request names no relay", self.unique_id);
                return Err(self.destroy(DestroyReason::PROTOCOL));
            }
        };

        // Obtain a channel to the requested relay.
        let chan = match self.chan_provider.get_or_launch(&target).await {
            Ok(chan) => chan,
            Err(e) => {
                warn_report!(e, "{}: Could not reach the relay to extend to", self.unique_id);
                return Err(self.destroy(DestroyReason::CONNECTFAILED));
            }
        };

        // Register this circuit on the new channel, so that inbound
        // cells there land on our next-hop queue.
        let next_id = match chan.add_circuit(self.nch_tx.clone()) {
            Ok(id) => id,
            Err(e) => {
                warn_report!(
                    e,
                    "{}: Could not register circuit on outgoing channel",
                    self.unique_id,
                );
                return Err(self.destroy(DestroyReason::CHANNEL_CLOSED));
            }
        };
        let next = CircuitLink::new(chan, next_id);
        self.next = Some(next.clone());

        // Pass the client's handshake along.
        let mut create_body: BoxedCellBody = Box::new([0_u8; CELL_DATA_LEN]);
        create_body[..handshake.len()].copy_from_slice(handshake);
        if let Err(e) = next.send_cell(variant.create_cmd(), create_body).await {
            warn_report!(e, "{}: Failed to send create cell", self.unique_id);
            return Err(self.destroy(DestroyReason::CONNECTFAILED));
        }

        // Wait for the answer.  Nothing else can arrive on this queue:
        // the next hop knows about no other traffic on this circuit.
        trace!(circ_id = %self.unique_id, "Waiting for {}", variant.created_cmd());
        let created = match self
            .runtime
            .timeout(self.extend_timeout, self.nch.next())
            .await
        {
            Ok(Some(cell)) => cell,
            Ok(None) => {
                warn!(
                    circ_id = %self.unique_id,
                    "Next-hop queue closed while extending",
                );
                return Err(self.destroy(DestroyReason::CONNECTFAILED));
            }
            Err(_) => {
                let e = Error::ExtendTimeout;
                warn_report!(e, "{}: No answer from the next relay", self.unique_id);
                return Err(self.destroy(DestroyReason::CONNECTFAILED));
            }
        };

        let data = match variant.parse_created(&created) {
            Ok(data) => data,
            Err(e) => {
                warn_report!(e, "{}: Failed to parse created cell", self.unique_id);
                return Err(self.destroy(DestroyReason::PROTOCOL));
            }
        };

        // Tell the client its circuit got longer.
        let mut extended = match RelayCellBody::new(variant.extended_cmd(), 0, &data) {
            Ok(body) => body,
            Err(e) => {
                warn_report!(e, "{}: Created handshake too large to relay", self.unique_id);
                return Err(self.destroy(DestroyReason::PROTOCOL));
            }
        };
        self.back.encrypt_origin(&mut extended);

        let Some(prev) = self.prev.clone() else {
            return Err(internal!("extending a circuit with no previous hop?!").into());
        };
        if let Err(e) = prev.send_cell(ChanCmd::RELAY, extended.into()).await {
            warn_report!(e, "{}: Failed to send extended cell", self.unique_id);
            return Err(self.destroy(DestroyReason::CONNECTFAILED));
        }

        debug!(circ_id = %self.unique_id, "Circuit extended");

        Ok(())
    }

    /// Final teardown: send DESTROY on every leg that still has a peer,
    /// and close the inbound queues.
    ///
    /// Every step is attempted even if earlier ones fail; the failures
    /// are reported together.
    async fn cleanup(&mut self) {
        let mut errs = RetryError::<Error>::in_attempt_to("tear down a transverse circuit");

        for link in [self.prev.take(), self.next.take()].into_iter().flatten() {
            if let Err(e) = link.destroy(self.reason).await {
                errs.push(e);
            }
        }
        if !errs.is_empty() {
            debug!(
                circ_id = %self.unique_id,
                errors = ?errs,
                "Circuit cleanup errors",
            );
        }

        self.pch.close();
        self.nch.close();
        self.metrics.circuit_free();

        debug!(
            circ_id = %self.unique_id,
            reason = %self.reason,
            "Circuit closed",
        );
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;
    use crate::cell::CircId;
    use crate::channel::Channel;
    use crate::circuit::{CircuitParams, TransverseCircuit};
    use crate::extend::LinkSpec;
    use async_trait::async_trait;
    use rand::RngCore;
    use std::sync::Mutex;
    use tor_basic_utils::test_rng::testing_rng;
    use tor_llcrypto::pk::rsa::RsaIdentity;

    const DF: &[u8] = b"not-so-secret forward digest seed";
    const DB: &[u8] = b"not-so-secret backward digest seed";
    const KF: &[u8; 16] = b"such forward key";
    const KB: &[u8; 16] = b"very backwardkey";

    /// Circuit ID used on the previous-hop leg.
    const PREV_ID: u32 = 5;
    /// Circuit ID that the fake outgoing channel hands out.
    const NEXT_ID: u32 = 0x8000_0001;

    /// A fake channel that records every cell sent on it.
    struct FakeChan {
        /// Cells sent on this channel, in order.
        sent: Mutex<Vec<Cell>>,
        /// The sender registered with add_circuit, if any.
        registered: Mutex<Option<CellSender>>,
        /// The circuit ID that add_circuit hands out.
        id: u32,
        /// If set, the cell to feed back into the registered sender
        /// when a CREATE or CREATE2 cell is sent.
        created_reply: Mutex<Option<Cell>>,
    }

    impl FakeChan {
        fn new(id: u32) -> Arc<Self> {
            Arc::new(FakeChan {
                sent: Mutex::new(Vec::new()),
                registered: Mutex::new(None),
                id,
                created_reply: Mutex::new(None),
            })
        }
        fn sent(&self) -> Vec<Cell> {
            self.sent.lock().unwrap().clone()
        }
        fn set_created_reply(&self, cell: Cell) {
            *self.created_reply.lock().unwrap() = Some(cell);
        }
    }

    #[async_trait]
    impl Channel for FakeChan {
        async fn send_cell(&self, cell: Cell) -> Result<()> {
            let reply = match cell.cmd() {
                ChanCmd::CREATE | ChanCmd::CREATE2 => self.created_reply.lock().unwrap().take(),
                _ => None,
            };
            self.sent.lock().unwrap().push(cell);
            if let Some(reply) = reply {
                let sender = self.registered.lock().unwrap().clone();
                if let Some(mut tx) = sender {
                    tx.send(reply).await.unwrap();
                }
            }
            Ok(())
        }
        fn add_circuit(&self, sender: CellSender) -> Result<CircId> {
            *self.registered.lock().unwrap() = Some(sender);
            Ok(CircId::new(self.id).expect("zero test circid"))
        }
    }

    /// A provider that always returns the same fake channel.
    struct FakeProvider {
        chan: Arc<FakeChan>,
        targets: Arc<Mutex<Vec<ChanTarget>>>,
    }

    #[async_trait]
    impl ChannelProvider for FakeProvider {
        async fn get_or_launch(&self, target: &ChanTarget) -> Result<Arc<dyn Channel>> {
            self.targets.lock().unwrap().push(target.clone());
            Ok(self.chan.clone())
        }
    }

    /// Everything a scenario needs: the circuit, its reactor, both fake
    /// channels, and client-side crypto mirroring the relay's.
    struct Scenario<R: SleepProvider> {
        circ: TransverseCircuit,
        reactor: Reactor<R>,
        prev_chan: Arc<FakeChan>,
        next_chan: Arc<FakeChan>,
        targets: Arc<Mutex<Vec<ChanTarget>>>,
        metrics: Arc<RelayMetrics>,
        client_fwd: CryptoState,
        client_back: CryptoState,
    }

    fn new_scenario<R: SleepProvider>(rt: R) -> Scenario<R> {
        let prev_chan = FakeChan::new(PREV_ID);
        let next_chan = FakeChan::new(NEXT_ID);
        let targets = Arc::new(Mutex::new(Vec::new()));
        let provider = FakeProvider {
            chan: next_chan.clone(),
            targets: targets.clone(),
        };
        let metrics = Arc::new(RelayMetrics::new());
        let (circ, reactor) = TransverseCircuit::new(
            rt,
            prev_chan.clone(),
            CircId::new(PREV_ID).unwrap(),
            CryptoState::new(DF, KF).unwrap(),
            CryptoState::new(DB, KB).unwrap(),
            Box::new(provider),
            &CircuitParams::default(),
            metrics.clone(),
        );
        Scenario {
            circ,
            reactor,
            prev_chan,
            next_chan,
            targets,
            metrics,
            client_fwd: CryptoState::new(DF, KF).unwrap(),
            client_back: CryptoState::new(DB, KB).unwrap(),
        }
    }

    impl<R: SleepProvider> Scenario<R> {
        /// Pretend the circuit was extended some time ago.
        fn with_next_hop(&mut self) {
            self.reactor.next = Some(CircuitLink::new(
                self.next_chan.clone(),
                CircId::new(NEXT_ID).unwrap(),
            ));
        }

        /// Deliver a cell as if it had arrived from the previous hop.
        async fn from_prev(&self, cell: Cell) {
            self.circ.forward_sender().send(cell).await.unwrap();
        }

        /// Deliver a cell as if it had arrived from the next hop.
        async fn from_next(&self, cell: Cell) {
            self.circ.backward_sender().send(cell).await.unwrap();
        }
    }

    /// Build a CREATED2 cell whose handshake is `n` bytes of `fill`.
    fn created2_cell(n: usize, fill: u8) -> Cell {
        let mut body = Box::new([0_u8; CELL_DATA_LEN]);
        body[0..2].copy_from_slice(&(n as u16).to_be_bytes());
        body[2..2 + n].fill(fill);
        Cell::new(CircId::new(NEXT_ID).unwrap(), ChanCmd::CREATED2, body)
    }

    /// A valid EXTEND2 body: one IPv4 OR Port, one RSA identity, and
    /// 84 bytes of handshake.
    fn extend2_request() -> Vec<u8> {
        Extend2Payload::new(
            vec![
                LinkSpec::from("127.0.0.1:9001".parse::<std::net::SocketAddr>().unwrap()),
                LinkSpec::from(RsaIdentity::from_bytes(&[0xAB; 20]).unwrap()),
            ],
            vec![0x77; 84],
        )
        .encode()
        .unwrap()
    }

    /// Wrap a relay cell body in a RELAY cell on the previous leg.
    fn relay_cell(body: RelayCellBody) -> Cell {
        Cell::new(CircId::new(PREV_ID).unwrap(), ChanCmd::RELAY, body.into())
    }

    #[test]
    fn forward_passthrough() {
        tor_rtcompat::test_with_all_runtimes!(|rt| async move {
            let mut s = new_scenario(rt);
            s.with_next_hop();
            let digest_before = s.reactor.fwd.digest_val();

            // A cell for a further hop: its decrypted image has a
            // nonzero recognized field.
            let mut body = RelayCellBody::new(RelayCmd::DATA, 9, b"for the exit").unwrap();
            body.as_mut()[1..3].copy_from_slice(&[0xFF, 0xFF]);
            let expected = body.as_ref().to_vec();
            s.client_fwd.encrypt(&mut body);

            s.from_prev(relay_cell(body)).await;
            s.reactor.run_once().await.unwrap();

            // Passed through, with the circuit ID rewritten and the
            // payload bit-identical to the decrypted inbound payload.
            let sent = s.next_chan.sent();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].cmd(), ChanCmd::RELAY);
            assert_eq!(sent[0].circid(), CircId::new(NEXT_ID).unwrap());
            assert_eq!(&sent[0].body()[..], &expected[..]);
            assert!(s.prev_chan.sent().is_empty());

            // And the forward digest is exactly where it started.
            assert_eq!(s.reactor.fwd.digest_val(), digest_before);
            assert_eq!(s.metrics.relay_forward_bytes(), 509);
        });
    }

    #[test]
    fn relay_early_passthrough_keeps_command() {
        tor_rtcompat::test_with_all_runtimes!(|rt| async move {
            let mut s = new_scenario(rt);
            s.with_next_hop();

            let mut body = RelayCellBody::new(RelayCmd::DATA, 1, b"early").unwrap();
            body.as_mut()[1] = 0x01; // won't be recognized
            s.client_fwd.encrypt(&mut body);
            s.from_prev(Cell::new(
                CircId::new(PREV_ID).unwrap(),
                ChanCmd::RELAY_EARLY,
                body.into(),
            ))
            .await;
            s.reactor.run_once().await.unwrap();

            let sent = s.next_chan.sent();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].cmd(), ChanCmd::RELAY_EARLY);
        });
    }

    #[test]
    fn backward_relay() {
        tor_rtcompat::test_with_all_runtimes!(|rt| async move {
            let mut s = new_scenario(rt);
            s.with_next_hop();

            let body = RelayCellBody::new(RelayCmd::DATA, 4, b"toward the client").unwrap();
            // What our layer of encryption should look like.
            let mut expected = body.clone();
            CryptoState::new(DB, KB).unwrap().encrypt(&mut expected);

            s.from_next(Cell::new(
                CircId::new(NEXT_ID).unwrap(),
                ChanCmd::RELAY,
                body.into(),
            ))
            .await;
            s.reactor.run_once().await.unwrap();

            let sent = s.prev_chan.sent();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].cmd(), ChanCmd::RELAY);
            assert_eq!(sent[0].circid(), CircId::new(PREV_ID).unwrap());
            assert_eq!(&sent[0].body()[..], expected.as_ref());
            assert!(s.next_chan.sent().is_empty());
            assert_eq!(s.metrics.relay_backward_bytes(), 509);
        });
    }

    #[test]
    fn extend2_success() {
        tor_rtcompat::test_with_all_runtimes!(|rt| async move {
            let mut s = new_scenario(rt);
            s.next_chan.set_created_reply(created2_cell(64, 0x44));

            let mut body = RelayCellBody::new(RelayCmd::EXTEND2, 0, &extend2_request()).unwrap();
            s.client_fwd.encrypt_origin(&mut body);
            s.from_prev(relay_cell(body)).await;
            s.reactor.run_once().await.unwrap();

            // The provider was asked for the relay the request named.
            {
                let addr: std::net::SocketAddr = "127.0.0.1:9001".parse().unwrap();
                let targets = s.targets.lock().unwrap();
                assert_eq!(targets.len(), 1);
                assert_eq!(targets[0].rsa_identity().as_bytes(), &[0xAB; 20]);
                assert_eq!(targets[0].addrs(), &[addr][..]);
            }

            // Exactly one CREATE2, carrying the handshake verbatim.
            let sent = s.next_chan.sent();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].cmd(), ChanCmd::CREATE2);
            assert_eq!(sent[0].circid(), CircId::new(NEXT_ID).unwrap());
            assert_eq!(&sent[0].body()[..84], &[0x77; 84][..]);
            assert!(sent[0].body()[84..].iter().all(|b| *b == 0));

            // Exactly one RELAY back toward the client: a recognized
            // EXTENDED2 with the CREATED2 handshake as data.
            let sent = s.prev_chan.sent();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].cmd(), ChanCmd::RELAY);
            assert_eq!(sent[0].circid(), CircId::new(PREV_ID).unwrap());
            let mut reply = RelayCellBody::from(sent[0].clone().into_body());
            s.client_back.decrypt_inbound(&mut reply);
            assert!(s.client_back.recognized(&reply));
            assert_eq!(reply.cmd(), RelayCmd::EXTENDED2);
            assert_eq!(reply.recognized(), 0);
            assert_eq!(reply.data(), &[0x44; 64][..]);

            // The circuit now has a next hop.
            assert!(s.reactor.next.is_some());
            assert_eq!(
                s.reactor.next.as_ref().unwrap().circ_id(),
                CircId::new(NEXT_ID).unwrap()
            );
        });
    }

    #[test]
    fn extend_on_extended_circuit() {
        tor_rtcompat::test_with_all_runtimes!(|rt| async move {
            let mut s = new_scenario(rt);
            s.with_next_hop();

            let mut body = RelayCellBody::new(RelayCmd::EXTEND2, 0, &extend2_request()).unwrap();
            s.client_fwd.encrypt_origin(&mut body);
            s.from_prev(relay_cell(body)).await;
            s.reactor.run().await.unwrap();

            // Both legs were destroyed with reason PROTOCOL, and no
            // CREATE2 was ever sent.
            let prev_sent = s.prev_chan.sent();
            assert_eq!(prev_sent.len(), 1);
            assert_eq!(prev_sent[0].cmd(), ChanCmd::DESTROY);
            assert_eq!(prev_sent[0].circid(), CircId::new(PREV_ID).unwrap());
            assert_eq!(prev_sent[0].body()[0], u8::from(DestroyReason::PROTOCOL));

            let next_sent = s.next_chan.sent();
            assert_eq!(next_sent.len(), 1);
            assert_eq!(next_sent[0].cmd(), ChanCmd::DESTROY);
            assert_eq!(next_sent[0].circid(), CircId::new(NEXT_ID).unwrap());
            assert_eq!(next_sent[0].body()[0], u8::from(DestroyReason::PROTOCOL));

            assert_eq!(s.metrics.circuits_live(), 0);
        });
    }

    #[test]
    fn peer_destroy_propagates() {
        tor_rtcompat::test_with_all_runtimes!(|rt| async move {
            let mut s = new_scenario(rt);
            s.with_next_hop();

            s.from_prev(Cell::destroy(
                CircId::new(PREV_ID).unwrap(),
                DestroyReason::CONNECTFAILED,
            ))
            .await;
            s.reactor.run().await.unwrap();

            // Propagated onward with the peer's reason...
            let next_sent = s.next_chan.sent();
            assert_eq!(next_sent.len(), 1);
            assert_eq!(next_sent[0].cmd(), ChanCmd::DESTROY);
            assert_eq!(next_sent[0].body()[0], 6);
            // ...but never echoed to the leg that sent it.
            assert!(s.prev_chan.sent().is_empty());
            assert_eq!(s.metrics.circuits_live(), 0);
        });
    }

    #[test]
    fn unrecognized_without_next_hop() {
        tor_rtcompat::test_with_all_runtimes!(|rt| async move {
            let mut s = new_scenario(rt);
            let digest_before = s.reactor.fwd.digest_val();

            let mut rng = testing_rng();
            let mut raw = Box::new([0_u8; CELL_DATA_LEN]);
            rng.fill_bytes(&mut raw[..]);
            s.from_prev(Cell::new(
                CircId::new(PREV_ID).unwrap(),
                ChanCmd::RELAY,
                raw,
            ))
            .await;

            let res = s.reactor.run_once().await;
            assert!(matches!(res, Err(ReactorError::Shutdown)));
            assert_eq!(s.reactor.reason, DestroyReason::PROTOCOL);
            // Digest rewound before the teardown.
            assert_eq!(s.reactor.fwd.digest_val(), digest_before);

            s.reactor.cleanup().await;
            let prev_sent = s.prev_chan.sent();
            assert_eq!(prev_sent.len(), 1);
            assert_eq!(prev_sent[0].cmd(), ChanCmd::DESTROY);
            assert_eq!(prev_sent[0].body()[0], u8::from(DestroyReason::PROTOCOL));
            assert_eq!(s.metrics.circuits_live(), 0);
        });
    }

    #[test]
    fn recognized_unhandled_command_is_ignored() {
        tor_rtcompat::test_with_all_runtimes!(|rt| async move {
            let mut s = new_scenario(rt);

            let mut body = RelayCellBody::new(RelayCmd::DROP, 0, &[]).unwrap();
            s.client_fwd.encrypt_origin(&mut body);
            s.from_prev(relay_cell(body)).await;
            s.reactor.run_once().await.unwrap();

            // Nothing sent, nothing torn down; the digest kept the cell.
            assert!(s.prev_chan.sent().is_empty());
            assert!(s.next_chan.sent().is_empty());
            assert!(!s.reactor.destroyed);
            assert_eq!(s.reactor.fwd.digest_val(), s.client_fwd.digest_val());
        });
    }

    #[test]
    fn unexpected_chan_cmd_is_protocol_violation() {
        tor_rtcompat::test_with_all_runtimes!(|rt| async move {
            let s = new_scenario(rt);

            s.from_prev(Cell::new_fixed(
                CircId::new(PREV_ID).unwrap(),
                ChanCmd::CREATE,
            ))
            .await;
            s.reactor.run().await.unwrap();

            let prev_sent = s.prev_chan.sent();
            assert_eq!(prev_sent.len(), 1);
            assert_eq!(prev_sent[0].cmd(), ChanCmd::DESTROY);
            assert_eq!(prev_sent[0].body()[0], u8::from(DestroyReason::PROTOCOL));
        });
    }

    #[test]
    fn close_joins_and_destroys() {
        tor_rtcompat::test_with_all_runtimes!(|rt| async move {
            let mut s = new_scenario(rt);
            s.with_next_hop();
            let prev_chan = s.prev_chan.clone();
            let next_chan = s.next_chan.clone();
            let metrics = s.metrics.clone();

            let Scenario { circ, reactor, .. } = s;
            let (run_res, ()) = futures::join!(reactor.run(), circ.close());
            run_res.unwrap();

            // An external close tears down as if the channel had died.
            let prev_sent = prev_chan.sent();
            assert_eq!(prev_sent.len(), 1);
            assert_eq!(prev_sent[0].cmd(), ChanCmd::DESTROY);
            assert_eq!(
                prev_sent[0].body()[0],
                u8::from(DestroyReason::CHANNEL_CLOSED)
            );
            let next_sent = next_chan.sent();
            assert_eq!(next_sent.len(), 1);
            assert_eq!(next_sent[0].cmd(), ChanCmd::DESTROY);
            assert_eq!(
                next_sent[0].body()[0],
                u8::from(DestroyReason::CHANNEL_CLOSED)
            );
            assert_eq!(metrics.circuits_live(), 0);
        });
    }
}
