//! Parsing for the circuit-extension sub-protocol.
//!
//! An EXTEND or EXTEND2 relay message asks this relay to grow the
//! circuit by one hop.  Either way we learn the same three things: how
//! the next relay may be reached, which relay it must be, and an opaque
//! handshake blob to hand over in a CREATE or CREATE2 cell.  The
//! replies to those cells (CREATED, CREATED2) are decoded here too.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use caret::caret_int;
use tor_bytes::{EncodeResult, Reader, Writeable, Writer};
use tor_llcrypto::pk::ed25519::Ed25519Identity;
use tor_llcrypto::pk::rsa::RsaIdentity;

use crate::err::ExtendError;
use crate::{Error, Result};

/// The number of bytes in the client part of a TAP handshake.
pub const TAP_C_HANDSHAKE_LEN: usize = 186;
/// The number of bytes in the relay's reply to a TAP handshake.
pub const TAP_S_HANDSHAKE_LEN: usize = 148;

caret_int! {
    /// A type of link specifier, as used in an EXTEND2 message.
    pub struct LsType(u8) {
        /// The TCP address of an OR Port for a relay (IPv4).
        TLS_TCP_IPV4 = 0,
        /// The TCP address of an OR Port for a relay (IPv6).
        TLS_TCP_IPV6 = 1,
        /// The RSA identity fingerprint of a relay.
        LEGACY_ID = 2,
        /// The Ed25519 identity of a relay.
        ED25519_ID = 3,
    }
}

/// One decoded link specifier: a single fact about the relay an EXTEND2
/// message points at.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSpec {
    /// A TCP address where the relay listens for OR connections.
    OrPort(IpAddr, u16),
    /// The relay's legacy (RSA) identity fingerprint.
    RsaId(RsaIdentity),
    /// The relay's Ed25519 identity key.
    Ed25519Id(Ed25519Identity),
}

impl From<SocketAddr> for LinkSpec {
    fn from(sa: SocketAddr) -> Self {
        LinkSpec::OrPort(sa.ip(), sa.port())
    }
}
impl From<RsaIdentity> for LinkSpec {
    fn from(id: RsaIdentity) -> Self {
        LinkSpec::RsaId(id)
    }
}
impl From<Ed25519Identity> for LinkSpec {
    fn from(id: Ed25519Identity) -> Self {
        LinkSpec::Ed25519Id(id)
    }
}

/// Take one link specifier body of exactly `expected` bytes from `r`.
///
/// `lslen` is the length the specifier declared for itself; a mismatch
/// with what its type requires is treated as truncation.
fn take_spec_body<'a>(
    r: &mut Reader<'a>,
    lslen: usize,
    expected: usize,
) -> std::result::Result<&'a [u8], ExtendError> {
    if lslen != expected {
        return Err(ExtendError::ShortPayload);
    }
    r.take(lslen).map_err(|_| ExtendError::ShortPayload)
}

impl LinkSpec {
    /// Decode one (type, length, body) link specifier from `r`.
    ///
    /// Unlike the client side, a relay must reject specifiers it cannot
    /// interpret: it is about to open a connection on their authority.
    fn take_from_reader(r: &mut Reader<'_>) -> std::result::Result<Self, ExtendError> {
        let lstype: LsType = r.take_u8().map_err(|_| ExtendError::ShortPayload)?.into();
        let lslen = r.take_u8().map_err(|_| ExtendError::ShortPayload)? as usize;
        match lstype {
            LsType::TLS_TCP_IPV4 => {
                let body = take_spec_body(r, lslen, 6)?;
                let octets: [u8; 4] = body[0..4].try_into().expect("6-byte take too short!?");
                let port = u16::from_be_bytes([body[4], body[5]]);
                Ok(LinkSpec::OrPort(IpAddr::V4(octets.into()), port))
            }
            LsType::TLS_TCP_IPV6 => {
                let body = take_spec_body(r, lslen, 18)?;
                let octets: [u8; 16] = body[0..16].try_into().expect("18-byte take too short!?");
                let port = u16::from_be_bytes([body[16], body[17]]);
                Ok(LinkSpec::OrPort(IpAddr::V6(octets.into()), port))
            }
            LsType::LEGACY_ID => {
                let body = take_spec_body(r, lslen, 20)?;
                RsaIdentity::from_bytes(body)
                    .map(LinkSpec::RsaId)
                    .ok_or(ExtendError::ShortPayload)
            }
            LsType::ED25519_ID => {
                let body = take_spec_body(r, lslen, 32)?;
                Ed25519Identity::from_bytes(body)
                    .map(LinkSpec::Ed25519Id)
                    .ok_or(ExtendError::ShortPayload)
            }
            _ => Err(ExtendError::UnrecognizedLinkSpec(lstype.into())),
        }
    }

    /// Return the TCP address in this specifier, if it has one.
    fn address(&self) -> Option<SocketAddr> {
        match self {
            LinkSpec::OrPort(ip, port) => Some(SocketAddr::new(*ip, *port)),
            _ => None,
        }
    }
}

impl Writeable for LinkSpec {
    fn write_onto<B: Writer + ?Sized>(&self, w: &mut B) -> EncodeResult<()> {
        use LinkSpec::*;
        match self {
            OrPort(IpAddr::V4(v4), port) => {
                w.write_u8(LsType::TLS_TCP_IPV4.into());
                w.write_u8(6); // Length
                w.write_all(&v4.octets());
                w.write_u16(*port);
            }
            OrPort(IpAddr::V6(v6), port) => {
                w.write_u8(LsType::TLS_TCP_IPV6.into());
                w.write_u8(18); // Length
                w.write_all(&v6.octets());
                w.write_u16(*port);
            }
            RsaId(r) => {
                w.write_u8(LsType::LEGACY_ID.into());
                w.write_u8(20); // Length
                w.write_all(r.as_bytes());
            }
            Ed25519Id(e) => {
                w.write_u8(LsType::ED25519_ID.into());
                w.write_u8(32); // Length
                w.write_all(e.as_bytes());
            }
        }
        Ok(())
    }
}

/// A request to extend a circuit, however it was encoded.
///
/// Both EXTEND variants answer the same three questions; the circuit
/// reactor doesn't care which wire format carried them.
pub trait ExtendRequest {
    /// TCP addresses at which the next relay may be reached.
    ///
    /// May be empty (an EXTEND2 message need not include an OR Port
    /// specifier).
    fn addresses(&self) -> Vec<SocketAddr>;
    /// The RSA identity the next relay must prove.
    fn rsa_identity(&self) -> std::result::Result<&RsaIdentity, ExtendError>;
    /// The handshake blob to forward, verbatim, in a CREATE or CREATE2
    /// cell.
    fn handshake(&self) -> &[u8];
}

/// The body of an EXTEND (v1, TAP-only) relay message.
///
/// ```text
///     Address                       [4 bytes]
///     Port                          [2 bytes]
///     Onion skin                    [TAP_C_HANDSHAKE_LEN bytes]
///     Identity fingerprint          [HASH_LEN bytes]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendPayload {
    /// IPv4 address of the next relay.
    ip: Ipv4Addr,
    /// OR Port of the next relay.
    port: u16,
    /// The TAP client handshake.
    onion_skin: Vec<u8>,
    /// RSA identity of the next relay.
    rsa_id: RsaIdentity,
}

impl ExtendPayload {
    /// Construct an EXTEND body from its parts.
    pub fn new(
        ip: Ipv4Addr,
        port: u16,
        onion_skin: [u8; TAP_C_HANDSHAKE_LEN],
        rsa_id: RsaIdentity,
    ) -> Self {
        ExtendPayload {
            ip,
            port,
            onion_skin: onion_skin.into(),
            rsa_id,
        }
    }

    /// Decode an EXTEND body from the data of a relay cell.
    pub fn decode(data: &[u8]) -> std::result::Result<Self, ExtendError> {
        let mut r = Reader::from_slice(data);
        let ip: [u8; 4] = r
            .take(4)
            .map_err(|_| ExtendError::ShortPayload)?
            .try_into()
            .expect("4-byte take was not 4 bytes!?");
        let port = r.take_u16().map_err(|_| ExtendError::ShortPayload)?;
        let onion_skin = r
            .take(TAP_C_HANDSHAKE_LEN)
            .map_err(|_| ExtendError::ShortPayload)?
            .to_vec();
        let rsa_id = RsaIdentity::from_bytes(
            r.take(20).map_err(|_| ExtendError::ShortPayload)?,
        )
        .ok_or(ExtendError::ShortPayload)?;
        Ok(ExtendPayload {
            ip: ip.into(),
            port,
            onion_skin,
            rsa_id,
        })
    }

    /// Encode this body as it would appear in a relay cell.
    pub fn encode(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(4 + 2 + TAP_C_HANDSHAKE_LEN + 20);
        v.write_all(&self.ip.octets());
        v.write_u16(self.port);
        v.write_all(&self.onion_skin);
        v.write_all(self.rsa_id.as_bytes());
        v
    }
}

impl ExtendRequest for ExtendPayload {
    fn addresses(&self) -> Vec<SocketAddr> {
        vec![SocketAddr::new(IpAddr::V4(self.ip), self.port)]
    }
    fn rsa_identity(&self) -> std::result::Result<&RsaIdentity, ExtendError> {
        Ok(&self.rsa_id)
    }
    fn handshake(&self) -> &[u8] {
        &self.onion_skin
    }
}

/// The body of an EXTEND2 relay message.
///
/// ```text
///     NSPEC      (Number of link specifiers)     [1 byte]
///       NSPEC times:
///         LSTYPE (Link specifier type)           [1 byte]
///         LSLEN  (Link specifier length)         [1 byte]
///         LSPEC  (Link specifier)                [LSLEN bytes]
///     Handshake data                             [the rest]
/// ```
///
/// The handshake data is kept un-interpreted, HTYPE and HLEN included:
/// a relay's only job is to copy it into a CREATE2 cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extend2Payload {
    /// The link specifiers in the order they appeared.
    specs: Vec<LinkSpec>,
    /// Everything after the link specifiers.
    handshake: Vec<u8>,
}

impl Extend2Payload {
    /// Construct an EXTEND2 body from its parts.
    pub fn new(specs: Vec<LinkSpec>, handshake: Vec<u8>) -> Self {
        Extend2Payload { specs, handshake }
    }

    /// Decode an EXTEND2 body from the data of a relay cell.
    pub fn decode(data: &[u8]) -> std::result::Result<Self, ExtendError> {
        let mut r = Reader::from_slice(data);
        let nspec = r.take_u8().map_err(|_| ExtendError::ShortPayload)?;
        let mut specs = Vec::with_capacity(nspec as usize);
        for _ in 0..nspec {
            specs.push(LinkSpec::take_from_reader(&mut r)?);
        }
        let handshake = r.take_rest().to_vec();
        Ok(Extend2Payload { specs, handshake })
    }

    /// Encode this body as it would appear in a relay cell.
    pub fn encode(&self) -> EncodeResult<Vec<u8>> {
        let mut v = Vec::new();
        let nspec = u8::try_from(self.specs.len())
            .map_err(|_| tor_bytes::EncodeError::BadLengthValue)?;
        v.write_u8(nspec);
        for spec in &self.specs {
            v.write(spec)?;
        }
        v.write_all(&self.handshake);
        Ok(v)
    }
}

impl ExtendRequest for Extend2Payload {
    fn addresses(&self) -> Vec<SocketAddr> {
        self.specs.iter().filter_map(LinkSpec::address).collect()
    }
    fn rsa_identity(&self) -> std::result::Result<&RsaIdentity, ExtendError> {
        self.specs
            .iter()
            .find_map(|ls| match ls {
                LinkSpec::RsaId(id) => Some(id),
                _ => None,
            })
            .ok_or(ExtendError::NoFingerprint)
    }
    fn handshake(&self) -> &[u8] {
        &self.handshake
    }
}

/// The body of a CREATED cell: a TAP server handshake.
#[derive(Debug, Clone)]
pub struct Created {
    /// The TAP reply, to be echoed in an EXTENDED message.
    handshake: Vec<u8>,
}

impl Created {
    /// Decode a CREATED message from a cell body.
    pub fn decode_from_cell_body(body: &[u8]) -> Result<Self> {
        let mut r = Reader::from_slice(body);
        let handshake = r
            .take(TAP_S_HANDSHAKE_LEN)
            .map_err(|e| Error::from_bytes_err(e, "CREATED cell"))?
            .to_vec();
        Ok(Created { handshake })
    }

    /// Consume this message and return the server handshake.
    pub fn into_handshake(self) -> Vec<u8> {
        self.handshake
    }
}

/// The body of a CREATED2 cell.
///
/// ```text
///     HLEN       (Server Handshake Data Len)     [2 bytes]
///     HDATA      (Server Handshake Data)         [HLEN bytes]
/// ```
#[derive(Debug, Clone)]
pub struct Created2 {
    /// The server handshake, to be echoed in an EXTENDED2 message.
    handshake: Vec<u8>,
}

impl Created2 {
    /// Decode a CREATED2 message from a cell body.
    pub fn decode_from_cell_body(body: &[u8]) -> Result<Self> {
        let mut r = Reader::from_slice(body);
        let hlen = r
            .take_u16()
            .map_err(|e| Error::from_bytes_err(e, "CREATED2 cell"))?;
        let handshake = r
            .take(hlen as usize)
            .map_err(|e| Error::from_bytes_err(e, "CREATED2 cell"))?
            .to_vec();
        Ok(Created2 { handshake })
    }

    /// Consume this message and return the server handshake.
    pub fn into_handshake(self) -> Vec<u8> {
        self.handshake
    }
}
