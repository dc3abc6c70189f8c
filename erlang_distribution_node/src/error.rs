//! Error types for every layer of the node.
//!
//! Decode errors are fatal to a single decode, handshake errors to a single
//! connection attempt. Routing misses are never errors (they are logged and
//! dropped by the node), lifecycle errors report operations on closed
//! mailboxes and nodes.

use std::sync::Arc;

use nom::error::{ErrorKind, ParseError};
use thiserror::Error;

use crate::etf::{Pid, Reference, Term};

/// Failure to decode external term format bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown term tag {0}")]
    UnknownTag(u8),
    #[error("expected version tag 131, found {0}")]
    MissingVersion(u8),
    #[error("input ended before the term was complete")]
    Truncated,
    #[error("invalid {what}: {reason}")]
    Invalid { what: &'static str, reason: String },
    #[error("compressed term inflated to {actual} bytes, header announced {expected}")]
    CompressedSize { expected: usize, actual: usize },
    #[error("{0} trailing bytes after term")]
    TrailingBytes(usize),
}

impl DecodeError {
    pub(crate) fn invalid(what: &'static str, reason: impl Into<String>) -> Self {
        DecodeError::Invalid {
            what,
            reason: reason.into(),
        }
    }
}

impl<'a> ParseError<&'a [u8]> for DecodeError {
    fn from_error_kind(_input: &'a [u8], kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Eof | ErrorKind::Complete => DecodeError::Truncated,
            other => DecodeError::invalid("term", other.description()),
        }
    }

    fn append(_input: &'a [u8], _kind: ErrorKind, other: Self) -> Self {
        other
    }
}

impl From<nom::Err<DecodeError>> for DecodeError {
    fn from(err: nom::Err<DecodeError>) -> Self {
        match err {
            nom::Err::Incomplete(_) => DecodeError::Truncated,
            nom::Err::Error(e) | nom::Err::Failure(e) => e,
        }
    }
}

/// A term built from code violates a term invariant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TermError {
    #[error("duplicate map key {0}")]
    DuplicateKey(Term),
    #[error("bitstring must have 1 to 8 bits in a non-empty last byte, got {0}")]
    BitCount(u8),
}

/// A control tuple did not have the shape its tag requires.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("control message is not a tuple")]
    NotATuple,
    #[error("control message tag is not an integer")]
    MissingTag,
    #[error("unknown control message tag {0}")]
    UnknownTag(i64),
    #[error("control message {name} expects arity {expected}, got {actual}")]
    Arity {
        name: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("control message {name} slot {slot} must be {expected}")]
    Slot {
        name: &'static str,
        slot: usize,
        expected: &'static str,
    },
}

/// A distribution frame could not be turned into a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("distribution message must start with 112, found {0:?}")]
    MissingPassThrough(Option<u8>),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error("{0} message carries no payload term")]
    MissingPayload(&'static str),
}

/// Node name could not be parsed or resolved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("node name `{0}` is empty or malformed")]
    Malformed(String),
    #[error("could not resolve host `{host}`: {reason}")]
    Unresolved { host: String, reason: String },
}

/// Failure of the peer lookup collaborator.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("io error talking to the name service: {0}")]
    Io(#[from] std::io::Error),
    #[error("name service refused: {0}")]
    Refused(String),
    #[error("malformed name service reply: {0}")]
    Malformed(String),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

/// Why a handshake attempt failed. Every variant is fatal to that attempt.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("io error during handshake: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake timed out in state {0}")]
    Timeout(&'static str),
    #[error("unexpected handshake message {tag:?} in state {state}")]
    UnexpectedMessage { state: &'static str, tag: Option<u8> },
    #[error("malformed handshake message: {0}")]
    Malformed(String),
    #[error("peer answered with status `{0}`")]
    Status(String),
    #[error("challenge digest mismatch, cookies differ or the peer forged the digest")]
    DigestMismatch,
    #[error("version ranges {local_low}..={local_high} and {peer_low}..={peer_high} do not overlap")]
    VersionMismatch {
        local_low: u16,
        local_high: u16,
        peer_low: u16,
        peer_high: u16,
    },
    #[error("transport protocols differ (local {local}, peer {peer})")]
    ProtocolMismatch { local: u8, peer: u8 },
    #[error("peer `{0}` could not be resolved")]
    UnknownPeer(String),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

impl From<deku::DekuError> for HandshakeError {
    fn from(err: deku::DekuError) -> Self {
        HandshakeError::Malformed(err.to_string())
    }
}

/// Errors surfaced by [`crate::Node`] and [`crate::Mailbox`] operations.
#[derive(Debug, Clone, Error)]
pub enum NodeError {
    #[error("node is closed")]
    NodeClosed,
    #[error("mailbox {0} is closed")]
    MailboxClosed(Pid),
    #[error("name `{0}` is already registered")]
    NameTaken(String),
    #[error("no process registered as `{0}`")]
    NoSuchName(String),
    #[error("node `{0}` not found by the name service")]
    NodeNotFound(String),
    #[error("could not connect to `{node}`: {reason}")]
    Connect { node: String, reason: Arc<HandshakeError> },
    #[error("connection to `{0}` is closed")]
    ConnectionClosed(String),
    #[error("name service failure: {0}")]
    Lookup(Arc<LookupError>),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),
    #[error("{0}")]
    Config(String),
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Io(Arc::new(err))
    }
}

impl From<LookupError> for NodeError {
    fn from(err: LookupError) -> Self {
        NodeError::Lookup(Arc::new(err))
    }
}

/// What a mailbox receive produced instead of an ordinary message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReceiveError {
    /// A linked process exited, or `exit/2` was sent to this mailbox.
    #[error("process {from} exited: {reason}")]
    Exit { from: Pid, reason: Term },
    /// A monitored process exited.
    #[error("monitored process {from} went down: {reason}")]
    Down {
        reference: Reference,
        from: Term,
        reason: Term,
    },
    #[error("mailbox is closed")]
    Closed,
}
