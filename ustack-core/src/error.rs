//! Error types for the stack, covering datagram parsing, protocol state
//! violations, and user-driven operations.

use std::{error, fmt, io, result};

use crate::protocol::fsm::State;

/// A convenience wrapper around `Result` for `ustack_core::Error`.
pub type Result<T> = result::Result<T, Error>;

/// Set of errors that can occur while driving the stack.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Error reading from or writing to the device or the payload sink.
    ///
    /// Device-level failures are the only fatal errors in the stack.
    Io(io::Error),
    /// Error parsing an IPv4 datagram or TCP segment; the datagram is
    /// dropped.
    Parse(ParseError),
    /// Segment illegal for the connection's current state; the connection is
    /// removed.
    Protocol(ProtocolError),
    /// Invalid user-driven operation; the connection is preserved.
    User(UserError),
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Error {
        Error::Parse(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Error {
        Error::Protocol(err)
    }
}

impl From<UserError> for Error {
    fn from(err: UserError) -> Error {
        Error::User(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::Io(ref err) => fmt::Display::fmt(err, f),
            Error::Parse(ref err) => fmt::Display::fmt(err, f),
            Error::Protocol(ref err) => fmt::Display::fmt(err, f),
            Error::User(ref err) => fmt::Display::fmt(err, f),
        }
    }
}

/// Error occurred while trying to parse an IPv4 header or TCP segment.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum ParseError {
    /// Datagram is not IPv4.
    NonIpv4 { provided: u8 },
    /// Input buffer ended before the header did.
    Truncated { provided: usize, min: usize },
    /// IPv4 IHL smaller than the 20-byte minimum header.
    InvalidIhl { provided: u8 },
    /// TCP data offset smaller than the 20-byte minimum header.
    InvalidDataOffset { provided: u8 },
}

impl error::Error for ParseError {}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ParseError::NonIpv4 { provided } => {
                write!(f, "can't handle non-IPv4 packets: got IPv{provided}")
            }
            ParseError::Truncated { provided, min } => {
                write!(
                    f,
                    "truncated header: {provided} bytes (need at least {min} bytes)"
                )
            }
            ParseError::InvalidIhl { provided } => {
                write!(f, "invalid IPv4 IHL: {provided} (must be at least 5)")
            }
            ParseError::InvalidDataOffset { provided } => {
                write!(f, "invalid TCP data offset: {provided} (must be at least 5)")
            }
        }
    }
}

/// Segment flags illegal for the connection's current state.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The received control bits have no transition out of `state`.
    UnexpectedSegment {
        /// State the connection was in when the segment arrived.
        state: State,
        /// Short description of what the state machine expected.
        reason: &'static str,
    },
}

impl error::Error for ProtocolError {}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ProtocolError::UnexpectedSegment { state, reason } => {
                write!(f, "illegal segment in {state}: {reason}")
            }
        }
    }
}

/// Invalid user-driven operation on a connection.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum UserError {
    /// A `write` exceeds the available send window.
    BufferFull {
        /// Bytes the caller attempted to write.
        requested: usize,
        /// Bytes the connection can currently accept.
        available: usize,
    },
    /// `write` or `close` called in a state that forbids it.
    IllegalState {
        /// The attempted operation.
        op: &'static str,
        /// State the connection was in.
        state: State,
    },
    /// The given connection id does not refer to a live connection.
    UnknownConnection {
        /// The id supplied by the user.
        id: usize,
    },
}

impl error::Error for UserError {}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            UserError::BufferFull {
                requested,
                available,
            } => {
                write!(
                    f,
                    "send buffer full: requested {requested} bytes ({available} bytes available)"
                )
            }
            UserError::IllegalState { op, state } => {
                write!(f, "cannot {op} a connection in {state}")
            }
            UserError::UnknownConnection { id } => {
                write!(f, "no open connection with id {id}")
            }
        }
    }
}
