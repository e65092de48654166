//! A view over the body of a RELAY or RELAY_EARLY cell.
//!
//! A relay cell's body is an onion-encrypted relay header followed by
//! data.  A hop in the middle of a circuit mostly treats these bodies
//! as opaque: it only looks at the header fields after removing its own
//! layer of encryption, to decide whether the cell is addressed to it.
//! Because of that, this module gives *accessors over a fixed buffer*
//! rather than a parsed message type: the buffer is what gets
//! encrypted, digested, and forwarded.

use derive_more::{From, Into};

use crate::cell::{BoxedCellBody, CELL_DATA_LEN};
use crate::{Error, Result};

use caret::caret_int;

caret_int! {
    /// The command inside a relay cell: what its sender wants done.
    ///
    /// A middle relay acts on only a few of these (the extend family);
    /// the rest matter to it just enough to be logged.
    pub struct RelayCmd(u8) {
        /// Open a stream through the circuit.
        BEGIN = 1,
        /// Bytes flowing on an open stream.
        DATA = 2,
        /// Shut a stream down.
        END = 3,
        /// The stream asked for by a BEGIN is ready.
        CONNECTED = 4,
        /// Flow-control credit.
        SENDME = 5,
        /// Ask this relay to add a hop, TAP style (deprecated).
        EXTEND = 6,
        /// The hop asked for by an EXTEND is ready (deprecated).
        EXTENDED = 7,
        /// Cut the circuit back to this hop.
        TRUNCATE = 8,
        /// The circuit was cut back short of its old end.
        TRUNCATED = 9,
        /// Long-range padding; discarded on receipt.
        DROP = 10,
        /// Ask the exit to resolve a hostname.
        RESOLVE = 11,
        /// The answer to a RESOLVE.
        RESOLVED = 12,
        /// Open a stream to this relay's own directory port.
        BEGIN_DIR = 13,
        /// Ask this relay to add a hop (current format).
        EXTEND2 = 14,
        /// The hop asked for by an EXTEND2 is ready.
        EXTENDED2 = 15,
    }
}

/// Position of the "recognized" field within a relay cell body.
const RECOGNIZED_OFFSET: usize = 1;
/// Position of the stream ID within a relay cell body.
const STREAM_ID_OFFSET: usize = 3;
/// Position of the digest field within a relay cell body.
const DIGEST_OFFSET: usize = 5;
/// Position of the data length within a relay cell body.
const LEN_OFFSET: usize = 9; // command, recognized, stream_id, digest.
/// Position of the data within a relay cell body.
const DATA_OFFSET: usize = 11; // (everything before length), length.

/// The most data that fits in a single relay cell.
pub const MAX_RELAY_DATA_LEN: usize = CELL_DATA_LEN - DATA_OFFSET; // 498

/// The body of a RELAY or RELAY_EARLY cell, with field accessors.
#[derive(Clone, From, Into)]
pub struct RelayCellBody(BoxedCellBody);

impl AsRef<[u8]> for RelayCellBody {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}
impl AsMut<[u8]> for RelayCellBody {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0[..]
    }
}

/// Helper: read a big-endian u16 at a fixed position.
fn get_u16(body: &[u8], pos: usize) -> u16 {
    u16::from_be_bytes(
        body[pos..pos + 2]
            .try_into()
            .expect("two-byte slice was not two bytes long!?"),
    )
}

impl RelayCellBody {
    /// Construct a relay cell body from its parts, zero-padding the tail.
    ///
    /// The Recognized and Digest fields are left zero, ready for
    /// [`CryptoState::encrypt_origin`](crate::CryptoState::encrypt_origin).
    ///
    /// Gives an error if `data` cannot fit in a single cell.
    pub fn new(cmd: RelayCmd, stream_id: u16, data: &[u8]) -> Result<Self> {
        if data.len() > MAX_RELAY_DATA_LEN {
            return Err(Error::CircProto(format!(
                "Relay message of {} bytes won't fit in a cell",
                data.len()
            )));
        }
        let mut body = Box::new([0_u8; CELL_DATA_LEN]);
        body[0] = cmd.into();
        // recognized: already 0.
        body[STREAM_ID_OFFSET..STREAM_ID_OFFSET + 2].copy_from_slice(&stream_id.to_be_bytes());
        // digest: already 0.
        body[LEN_OFFSET..LEN_OFFSET + 2].copy_from_slice(&(data.len() as u16).to_be_bytes());
        body[DATA_OFFSET..DATA_OFFSET + data.len()].copy_from_slice(data);
        Ok(Self(body))
    }

    /// Return the relay command for this cell.
    pub fn cmd(&self) -> RelayCmd {
        self.0[0].into()
    }

    /// Return the value of the "recognized" field.
    ///
    /// This is zero on every relay cell as it reaches the hop it is
    /// addressed to.
    pub fn recognized(&self) -> u16 {
        get_u16(&self.0[..], RECOGNIZED_OFFSET)
    }

    /// Return the stream ID field.
    pub fn stream_id(&self) -> u16 {
        get_u16(&self.0[..], STREAM_ID_OFFSET)
    }

    /// Return the digest field: the leading 4 bytes of the sender's
    /// running digest at the time the cell was made.
    pub fn digest(&self) -> u32 {
        u32::from_be_bytes(
            self.0[DIGEST_OFFSET..DIGEST_OFFSET + 4]
                .try_into()
                .expect("four-byte slice was not four bytes long!?"),
        )
    }

    /// Set the digest field to zero, as required before hashing the body.
    pub fn clear_digest(&mut self) {
        self.0[DIGEST_OFFSET..DIGEST_OFFSET + 4].fill(0);
    }

    /// Write `digest` (big-endian) into the digest field.
    pub fn set_digest(&mut self, digest: u32) {
        self.0[DIGEST_OFFSET..DIGEST_OFFSET + 4].copy_from_slice(&digest.to_be_bytes());
    }

    /// Return the value of the length field.
    pub fn data_len(&self) -> u16 {
        get_u16(&self.0[..], LEN_OFFSET)
    }

    /// Return the data carried in this cell.
    ///
    /// The returned slice is bounded by the cell: a corrupt or hostile
    /// length field cannot make it reach beyond the body.
    pub fn data(&self) -> &[u8] {
        let len = usize::from(self.data_len()).min(MAX_RELAY_DATA_LEN);
        &self.0[DATA_OFFSET..DATA_OFFSET + len]
    }
}

impl std::fmt::Debug for RelayCellBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayCellBody")
            .field("cmd", &self.cmd())
            .field("stream_id", &self.stream_id())
            .field("len", &self.data_len())
            .finish_non_exhaustive()
    }
}
