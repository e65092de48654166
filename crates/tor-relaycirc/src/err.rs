//! Error types for the tor-relaycirc crate.

use std::sync::Arc;
use thiserror::Error;
use tor_error::{ErrorKind, HasKind};

use crate::cell::DestroyReason;

/// Anything that can go wrong while carrying a circuit through this
/// relay.
///
/// Some of these variants are never produced by this crate itself: they
/// exist so that [`Channel`](crate::channel::Channel) and
/// [`ChannelProvider`](crate::channel::ChannelProvider) implementations
/// have a shared vocabulary for their own failures.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A wire object would not decode.
    #[error("Couldn't decode {object}")]
    BytesErr {
        /// The kind of object being decoded when the error hit.
        object: &'static str,
        /// The underlying decoding error.
        #[source]
        err: tor_bytes::Error,
    },
    /// The transport under a channel reported an IO failure.
    #[error("Channel IO failed")]
    ChanIoErr(#[source] Arc<std::io::Error>),
    /// A peer did something the channel protocol forbids.
    #[error("Channel protocol violation: {0}")]
    ChanProto(String),
    /// A peer did something the circuit protocol forbids.
    #[error("Circuit protocol violation: {0}")]
    CircProto(String),
    /// The channel is gone, so nothing more can be sent on it.
    #[error("Channel closed")]
    ChannelClosed(#[from] ChannelClosed),
    /// The circuit stopped before (or while) we used it.
    #[error("Circuit closed")]
    CircuitClosed,
    /// A malformed EXTEND or EXTEND2 request.
    #[error("Invalid extend request")]
    Extend(#[from] ExtendError),
    /// The next relay didn't answer our CREATE cell in time.
    #[error("Timed out while waiting for the next relay to answer")]
    ExtendTimeout,
    /// Every usable circuit ID on the channel is already taken.
    #[error("No free circuit ID on this channel")]
    IdRangeFull,
    /// A bug in this crate or in its caller.
    #[error("Programming error")]
    Bug(#[from] tor_error::Bug),
}

/// The channel under a circuit has shut down.
///
/// Kept as its own type (rather than only an [`Error`] variant) so that
/// channel internals can return it without knowing about the rest of
/// the error taxonomy.
#[derive(Error, Debug, Clone)]
#[error("Channel closed")]
#[non_exhaustive]
pub struct ChannelClosed;

impl HasKind for ChannelClosed {
    fn kind(&self) -> ErrorKind {
        ErrorKind::CircuitCollapse
    }
}

/// A problem found while parsing the body of an EXTEND or EXTEND2 request.
///
/// At the circuit level, every one of these is a protocol violation by the
/// client: the circuit is torn down with [`DestroyReason::PROTOCOL`].
#[derive(Error, Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum ExtendError {
    /// The payload ended before the structure it should contain.
    #[error("Extend payload too short")]
    ShortPayload,
    /// A link specifier had a type we don't know how to handle.
    #[error("Unrecognized link specifier type {0}")]
    UnrecognizedLinkSpec(u8),
    /// The request named no relay we could identify: it carried no legacy
    /// identity fingerprint.
    #[error("Extend request contains no identity fingerprint")]
    NoFingerprint,
}

impl HasKind for ExtendError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::TorProtocolViolation
    }
}

impl Error {
    /// Wrap a [`tor_bytes::Error`] hit while decoding `object`.
    pub(crate) fn from_bytes_err(err: tor_bytes::Error, object: &'static str) -> Error {
        Error::BytesErr { err, object }
    }

    /// Return the DESTROY reason code to use when this error tears a
    /// circuit down.
    pub(crate) fn destroy_reason(&self) -> DestroyReason {
        use Error as E;
        match self {
            E::BytesErr { .. } | E::ChanProto(_) | E::CircProto(_) | E::Extend(_) | E::Bug(_) => {
                DestroyReason::PROTOCOL
            }
            E::ChanIoErr(_) | E::ExtendTimeout => DestroyReason::CONNECTFAILED,
            E::ChannelClosed(_) | E::CircuitClosed | E::IdRangeFull => {
                DestroyReason::CHANNEL_CLOSED
            }
        }
    }
}

impl HasKind for Error {
    fn kind(&self) -> ErrorKind {
        use Error as E;
        use ErrorKind as EK;
        match self {
            E::BytesErr { .. } => EK::TorProtocolViolation,
            E::ChanIoErr(_) => EK::LocalNetworkError,
            E::ChanProto(_) => EK::TorProtocolViolation,
            E::CircProto(_) => EK::TorProtocolViolation,
            E::ChannelClosed(e) => e.kind(),
            E::CircuitClosed => EK::CircuitCollapse,
            E::Extend(_) => EK::TorProtocolViolation,
            E::ExtendTimeout => EK::TorNetworkTimeout,
            E::IdRangeFull => EK::BadApiUsage,
            E::Bug(e) => e.kind(),
        }
    }
}

/// How one turn of the reactor's loop ended, when it didn't end
/// quietly.
///
/// Distinguishes "stop the circuit on purpose" from "stop the circuit
/// because something failed"; [`Reactor::run`](crate::Reactor::run)
/// reports only the latter to its caller.
#[derive(Debug)]
pub(crate) enum ReactorError {
    /// Teardown was requested; the recorded reason says why.
    Shutdown,
    /// A failure is forcing teardown.
    Err(Error),
}
impl From<Error> for ReactorError {
    fn from(e: Error) -> ReactorError {
        ReactorError::Err(e)
    }
}
impl From<ChannelClosed> for ReactorError {
    fn from(e: ChannelClosed) -> ReactorError {
        ReactorError::Err(e.into())
    }
}
impl From<tor_error::Bug> for ReactorError {
    fn from(e: tor_error::Bug) -> ReactorError {
        ReactorError::Err(e.into())
    }
}
