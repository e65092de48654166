//! Relay cell cryptography, as performed by one hop of a circuit.
//!
//! Each direction of a circuit shares a layer of state between the
//! client and this relay: a keyed AES-CTR cipher (`Kf`/`Kb` in the
//! spec) and a running SHA-1 digest seeded with `Df`/`Db`.  The digest
//! covers every relay cell that was *destined for* or *originated by*
//! this hop, each hashed with its digest field set to zero; cells that
//! merely pass through do not touch it.
//!
//! Whether a cell is addressed to this hop can't be known until after
//! it has been decrypted and hashed, so the digest is advanced
//! speculatively on every inbound cell and rewound from a snapshot when
//! the recognition check fails.

use cipher::{KeyIvInit, StreamCipher};
use digest::Digest;
use tor_error::internal;
use tor_llcrypto::cipher::aes::Aes128Ctr;
use tor_llcrypto::d::Sha1;

use crate::relaycell::RelayCellBody;
use crate::Result;

/// One direction of a hop's shared cryptographic state.
///
/// A transverse circuit holds two of these: a *forward* state for cells
/// moving away from the client, and a *backward* state for cells moving
/// toward it.
pub struct CryptoState {
    /// Stream cipher for en/decrypting cell bodies.
    ///
    /// This cipher is the one keyed with Kf or Kb in the spec.
    cipher: Aes128Ctr,
    /// Running digest for cells to/from this hop.
    ///
    /// This digest is the one seeded with Df or Db in the spec.
    digest: Sha1,
    /// Snapshot of `digest` from just before its last update, used to
    /// rewind when a cell turns out to belong to a further hop.
    prev_digest: Sha1,
}

impl CryptoState {
    /// Construct a new state from a digest seed (Df or Db) and a
    /// 16-byte AES-128 key (Kf or Kb).
    ///
    /// The CTR IV starts at zero, per the spec.
    pub fn new(digest_seed: &[u8], key: &[u8]) -> Result<Self> {
        if key.len() != 16 {
            return Err(internal!("AES-128 key of {} bytes", key.len()).into());
        }
        let digest = Sha1::new().chain_update(digest_seed);
        Ok(CryptoState {
            cipher: Aes128Ctr::new(key.into(), &Default::default()),
            prev_digest: digest.clone(),
            digest,
        })
    }

    /// Return the leading 4 bytes of the running digest, big-endian.
    ///
    /// This is the value that the digest field of a recognized cell
    /// must carry.
    pub fn digest_val(&self) -> u32 {
        let d = self.digest.clone().finalize();
        u32::from_be_bytes(d[0..4].try_into().expect("SHA-1 output under 4 bytes!?"))
    }

    /// Decrypt an inbound cell body in place, and speculatively advance
    /// the running digest over it.
    ///
    /// The caller decides afterwards whether the cell was addressed to
    /// this hop (see [`CryptoState::recognized`]); the digest update is
    /// undone there if it was not.
    pub fn decrypt_inbound(&mut self, cell: &mut RelayCellBody) {
        self.cipher.apply_keystream(cell.as_mut());

        self.prev_digest = self.digest.clone();

        // Update the digest over the body with the digest field cleared.
        let d = cell.digest();
        cell.clear_digest();
        self.digest.update(cell.as_ref());
        cell.set_digest(d);
    }

    /// Prepare a cell body that this hop originates: advance the
    /// running digest over it, write the digest prefix into its digest
    /// field, then encrypt it.
    pub fn encrypt_origin(&mut self, cell: &mut RelayCellBody) {
        self.prev_digest = self.digest.clone();

        cell.clear_digest();
        self.digest.update(cell.as_ref());
        cell.set_digest(self.digest_val());

        self.encrypt(cell);
    }

    /// Encrypt a cell body in place without touching the digest.
    ///
    /// Used when forwarding a cell this hop did not originate.  (CTR
    /// encryption and decryption are the same XOR; what matters is that
    /// each keystream position is used exactly once.)
    pub fn encrypt(&mut self, cell: &mut RelayCellBody) {
        self.cipher.apply_keystream(cell.as_mut());
    }

    /// Restore the running digest to its value before the last
    /// update.
    pub fn rewind_digest(&mut self) {
        self.digest = self.prev_digest.clone();
    }

    /// Return true if a just-decrypted cell is addressed to this hop:
    /// its recognized field is zero and its digest field matches the
    /// running digest.
    ///
    /// On a miss, the speculative digest update from
    /// [`CryptoState::decrypt_inbound`] is rewound, so that a cell
    /// belonging to a further hop leaves no trace in this hop's digest.
    pub fn recognized(&mut self, cell: &RelayCellBody) -> bool {
        if cell.recognized() != 0 {
            self.rewind_digest();
            return false;
        }
        if cell.digest() != self.digest_val() {
            self.rewind_digest();
            return false;
        }
        true
    }
}

impl std::fmt::Debug for CryptoState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Neither the keystream nor the digest state is printable.
        f.debug_struct("CryptoState").finish_non_exhaustive()
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
    use crate::relaycell::RelayCmd;
    use rand::RngCore;
    use tor_basic_utils::test_rng::testing_rng;

    const DF: &[u8] = b"forward digest seed, 20 bytes long..";
    const KF: &[u8; 16] = b"forward aes key!";

    /// A pair of states sharing seeds: what the client holds, and what
    /// the relay holds.
    fn state_pair() -> (CryptoState, CryptoState) {
        (
            CryptoState::new(DF, KF).unwrap(),
            CryptoState::new(DF, KF).unwrap(),
        )
    }

    fn random_body<R: RngCore>(rng: &mut R) -> RelayCellBody {
        let mut raw = Box::new([0_u8; 509]);
        rng.fill_bytes(&mut raw[..]);
        RelayCellBody::from(raw)
    }

    #[test]
    fn bad_key_length() {
        assert!(CryptoState::new(DF, &[0; 15]).is_err());
        assert!(CryptoState::new(DF, &[0; 32]).is_err());
    }

    #[test]
    fn originate_then_recognize() {
        let (mut client, mut relay) = state_pair();

        let mut cell = RelayCellBody::new(RelayCmd::EXTEND2, 0, b"some handshake").unwrap();
        let cleartext = cell.as_ref().to_vec();
        client.encrypt_origin(&mut cell);
        assert_ne!(&cell.as_ref()[11..], &cleartext[11..]);

        relay.decrypt_inbound(&mut cell);
        assert!(relay.recognized(&cell));
        assert_eq!(cell.recognized(), 0);
        assert_eq!(cell.data(), b"some handshake");
        // Both running digests advanced to the same value.
        assert_eq!(client.digest_val(), relay.digest_val());
        assert_eq!(cell.digest(), relay.digest_val());
    }

    #[test]
    fn unrecognized_rewinds_digest() {
        let (_, mut relay) = state_pair();
        let mut rng = testing_rng();

        let before = relay.digest_val();
        // A cell encrypted for some further hop decrypts to noise here.
        let mut cell = random_body(&mut rng);
        relay.decrypt_inbound(&mut cell);
        assert!(!relay.recognized(&cell));
        assert_eq!(relay.digest_val(), before);
    }

    #[test]
    fn rewind_then_recognize() {
        // An unrecognized cell must leave no trace: a recognized cell
        // arriving after it hashes exactly as if it had come first.
        let (mut client, mut relay) = state_pair();
        let mut rng = testing_rng();

        let mut junk = random_body(&mut rng);
        relay.decrypt_inbound(&mut junk);
        assert!(!relay.recognized(&junk));

        // The relay's cipher has consumed one cell of keystream that the
        // client's has not: burn the same amount on the client side so the
        // streams line up again, as a further hop's traffic would.
        let mut filler = random_body(&mut rng);
        client.encrypt(&mut filler);

        // What the relay digest must become, computed from the cleartext
        // alone: seed, then this one body with a zero digest field.  The
        // junk cell contributes nothing.
        let expected = {
            let image = RelayCellBody::new(RelayCmd::DATA, 3, b"after the junk").unwrap();
            let d = Sha1::new()
                .chain_update(DF)
                .chain_update(image.as_ref())
                .finalize();
            u32::from_be_bytes(d[0..4].try_into().unwrap())
        };

        let mut cell = RelayCellBody::new(RelayCmd::DATA, 3, b"after the junk").unwrap();
        client.encrypt_origin(&mut cell);
        relay.decrypt_inbound(&mut cell);
        assert!(relay.recognized(&cell));
        assert_eq!(relay.digest_val(), expected);
        assert_eq!(cell.digest(), expected);
    }

    #[test]
    fn recognized_field_nonzero_is_never_dispatched() {
        // Even with a digest field that matches the running digest, a
        // nonzero recognized field keeps the cell unrecognized, and the
        // digest is rewound.
        let (mut client, mut relay) = state_pair();

        // Build the cleartext image and compute the digest the relay
        // *would* see for it, using a throwaway copy of the digest state.
        let mut cell = RelayCellBody::new(RelayCmd::DATA, 1, b"mismatch").unwrap();
        cell.as_mut()[1] = 0xFF; // recognized != 0
        let matching_digest = {
            let mut d = Sha1::new().chain_update(DF);
            let mut image = cell.clone();
            image.clear_digest();
            d.update(image.as_ref());
            let d = d.finalize();
            u32::from_be_bytes(d[0..4].try_into().unwrap())
        };
        cell.set_digest(matching_digest);

        client.encrypt(&mut cell);
        let before = relay.digest_val();
        relay.decrypt_inbound(&mut cell);
        assert_eq!(cell.digest(), matching_digest);
        assert!(!relay.recognized(&cell));
        assert_eq!(relay.digest_val(), before);
    }

    #[test]
    fn keystream_order() {
        // Each keystream position is used once: two cells decrypt
        // correctly only in the order they were encrypted.
        let (mut client, _) = state_pair();
        let mut first = RelayCellBody::new(RelayCmd::DATA, 1, b"first").unwrap();
        let mut second = RelayCellBody::new(RelayCmd::DATA, 1, b"second").unwrap();
        client.encrypt(&mut first);
        client.encrypt(&mut second);

        let mut in_order = CryptoState::new(DF, KF).unwrap();
        let mut a = first.clone();
        let mut b = second.clone();
        in_order.encrypt(&mut a);
        in_order.encrypt(&mut b);
        assert_eq!(a.data(), b"first");
        assert_eq!(b.data(), b"second");

        let mut out_of_order = CryptoState::new(DF, KF).unwrap();
        let mut b = second.clone();
        out_of_order.encrypt(&mut b);
        assert_ne!(b.data(), b"second");
    }
}
