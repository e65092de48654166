//! Fixed-length channel cells, as a relay circuit sees them.
//!
//! A 'channel' is a direct connection between a tor client and a
//! relay, or between two relays.  The framing and negotiation of a
//! channel are not handled here: this module only defines the
//! fixed-length cells that travel along established circuits, keyed by
//! a channel-local circuit ID.
//!
//! Relay circuits deliberately keep cell bodies *unparsed*: most cells
//! passing through a relay belong to a further hop, and the relay's job
//! is to re-encrypt and forward them without interpretation.

use std::num::NonZeroU32;

use caret::caret_int;
use rand::RngCore;

/// Number of body bytes in a fixed-length cell.
///
/// With the 4-byte circuit IDs of link protocol 4 and later, a cell on
/// the wire is 514 bytes: the circuit ID, one command byte, and this
/// much body.
pub const CELL_DATA_LEN: usize = 509;

/// The body of a fixed-length cell, as a plain byte array.
pub type RawCellBody = [u8; CELL_DATA_LEN];

/// A [`RawCellBody`] on the heap.
///
/// Bodies are passed around boxed so that moving a cell between queues
/// never copies 509 bytes.
pub type BoxedCellBody = Box<RawCellBody>;

/// The ID a circuit travels under on one particular channel.
///
/// The same circuit has a different `CircId` on each of its channels.
/// Zero is reserved on the wire for cells that concern the channel
/// itself, so this type is never zero; where the protocol genuinely
/// allows "no circuit", use `Option<CircId>`.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct CircId(NonZeroU32);

impl From<NonZeroU32> for CircId {
    fn from(item: NonZeroU32) -> Self {
        Self(item)
    }
}
impl From<CircId> for u32 {
    fn from(id: CircId) -> u32 {
        id.0.get()
    }
}
impl std::fmt::Display for CircId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        self.0.fmt(f)
    }
}
impl CircId {
    /// Wrap `val` as a `CircId`, or return `None` if it is the reserved
    /// zero value.
    pub fn new(val: u32) -> Option<Self> {
        NonZeroU32::new(val).map(Self)
    }

    /// Pick a random circuit ID for a new circuit on a channel.
    ///
    /// The low 31 bits are random; the most significant bit is `msb`.
    /// Per the Tor protocol, the party that initiated the channel
    /// allocates IDs with the MSB set, and the responder allocates IDs
    /// with the MSB clear, so the two sides can never collide.
    ///
    /// (The caller is still responsible for not re-using an ID that is
    /// already live on the channel.)
    pub fn random<R: RngCore + ?Sized>(rng: &mut R, msb: bool) -> CircId {
        loop {
            let x = rng.next_u32() >> 1;
            let x = if msb { x | 0x8000_0000 } else { x };
            if let Some(id) = CircId::new(x) {
                return id;
            }
        }
    }
}

caret_int! {
    /// The command byte of a channel cell, which says what the cell is
    /// for and how its body is to be read.
    ///
    /// Only the fixed-length commands are listed here: variable-length
    /// cells (VERSIONS, CERTS, and so on) belong to channel negotiation,
    /// which happens before any circuit exists.
    pub struct ChanCmd(u8) {
        /// Ignored on receipt; exists to disguise traffic patterns.
        PADDING = 0,
        /// Open a circuit with a TAP handshake (obsolete).
        CREATE = 1,
        /// Answer to a CREATE (obsolete).
        CREATED = 2,
        /// An onion-encrypted relay message for some hop of a circuit.
        RELAY = 3,
        /// Tear a circuit down.
        DESTROY = 4,
        /// Open a circuit relying on the channel's own encryption
        /// (obsolete).
        CREATE_FAST = 5,
        /// Answer to a CREATE_FAST (obsolete).
        CREATED_FAST = 6,
        /// Timestamp and address exchange that ends channel negotiation.
        NETINFO = 8,
        /// Like RELAY, but rationed: only a few may be sent per circuit,
        /// and extend requests must use it.
        RELAY_EARLY = 9,
        /// Open a circuit (current handshake format).
        CREATE2 = 10,
        /// Answer to a CREATE2.
        CREATED2 = 11,
        /// Ask the peer to adjust its channel padding.
        PADDING_NEGOTIATE = 12,
    }
}

caret_int! {
    /// Why a circuit was torn down.
    ///
    /// Travels as the first byte of a DESTROY cell's body.  A relay
    /// passes codes it does not recognize along unchanged.
    pub struct DestroyReason(u8) {
        /// No particular reason given.
        ///
        /// Clients send nothing else, so as not to leak why they are
        /// closing circuits.
        NONE = 0,
        /// The peer broke the protocol.
        PROTOCOL = 1,
        /// Something went wrong inside the relay itself.
        INTERNAL = 2,
        /// A TRUNCATE from the client asked for this.
        REQUESTED = 3,
        /// The relay is winding down and taking no new circuits.
        HIBERNATING = 4,
        /// Out of memory, sockets, or circuit IDs.
        RESOURCELIMIT = 5,
        /// The next relay could not be reached.
        CONNECTFAILED = 6,
        /// The next relay was reached, but proved the wrong identity.
        OR_IDENTITY = 7,
        /// A channel carrying this circuit went away.
        CHANNEL_CLOSED = 8,
        /// The circuit reached the end of its useful life.
        FINISHED = 9,
        /// Building the circuit took too long.
        TIMEOUT = 10,
        /// Torn down along with a connected circuit.
        DESTROYED = 11,
        /// The onion service asked for does not exist.
        NOSUCHSERVICE = 12,
    }
}

impl DestroyReason {
    /// Extract the reason code from the body of a DESTROY cell.
    ///
    /// A body too short to hold a reason yields [`DestroyReason::NONE`]:
    /// an unparseable DESTROY still has to tear the circuit down.
    pub fn from_payload(body: &[u8]) -> DestroyReason {
        match body.first() {
            Some(b) => (*b).into(),
            None => DestroyReason::NONE,
        }
    }
}

/// A fixed-length cell to be sent or received on a channel, with its
/// body kept as raw bytes.
#[derive(Clone)]
pub struct Cell {
    /// Circuit ID associated with this cell.
    circid: CircId,
    /// The command for this cell.
    cmd: ChanCmd,
    /// The un-interpreted body of this cell.
    body: BoxedCellBody,
}

impl Cell {
    /// Construct a new cell from its parts.
    pub fn new(circid: CircId, cmd: ChanCmd, body: BoxedCellBody) -> Self {
        Cell { circid, cmd, body }
    }

    /// Construct a new cell with an all-zero body.
    pub fn new_fixed(circid: CircId, cmd: ChanCmd) -> Self {
        Cell {
            circid,
            cmd,
            body: Box::new([0_u8; CELL_DATA_LEN]),
        }
    }

    /// Construct a DESTROY cell carrying `reason`.
    pub fn destroy(circid: CircId, reason: DestroyReason) -> Self {
        let mut cell = Cell::new_fixed(circid, ChanCmd::DESTROY);
        cell.body[0] = reason.into();
        cell
    }

    /// Return the circuit ID for this cell.
    pub fn circid(&self) -> CircId {
        self.circid
    }

    /// Return this cell's command.
    pub fn cmd(&self) -> ChanCmd {
        self.cmd
    }

    /// Return a reference to this cell's body.
    pub fn body(&self) -> &RawCellBody {
        &self.body
    }

    /// Consume this cell and return its body.
    pub fn into_body(self) -> BoxedCellBody {
        self.body
    }
}

impl std::fmt::Debug for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The body is 509 bytes of possibly-sensitive ciphertext; skip it.
        f.debug_struct("Cell")
            .field("circid", &self.circid)
            .field("cmd", &self.cmd)
            .finish_non_exhaustive()
    }
}
