//! Implements errors associated with the connection

use std::io;

use fe2o3_amqp091_types::{method::MethodId, EncodeError};
use tokio::task::JoinError;

use crate::{
    error::{CloseReason, ProtocolViolation},
    frames::FrameError,
    transport,
};

/// Errors associated with [`crate::Connection`]. Returned when the connection engine stops.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error
    #[error("IO Error {0:?}")]
    Io(#[from] io::Error),

    /// Nothing was received for twice the heartbeat period
    #[error("Idle timeout")]
    IdleTimeout,

    /// The transport ended before the close handshake
    #[error("Transport closed by peer")]
    TransportClosed,

    /// The peer broke the protocol. A `connection.close` with the matching reply code was
    /// sent before the engine stopped.
    #[error(transparent)]
    ProtocolViolation(#[from] ProtocolViolation),

    /// The broker closed the connection
    #[error("Remote closed the connection {0}")]
    Remote(CloseReason),

    /// No `close-ok` arrived in time
    #[error("Timed out waiting for connection.close-ok")]
    CloseTimeout,

    /// The engine task failed
    #[error(transparent)]
    JoinError(JoinError),

    /// The engine outcome was already taken by [`close`](crate::ConnectionHandle::close) or
    /// [`on_close`](crate::ConnectionHandle::on_close)
    #[error("Illegal local state")]
    IllegalState,
}

impl Error {
    /// The close reason reported to channels when the engine stops with this error
    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        match self {
            Error::ProtocolViolation(violation) => Some(violation.close_reason()),
            Error::Remote(reason) => Some(reason.clone()),
            _ => None,
        }
    }
}

impl From<transport::Error> for Error {
    fn from(err: transport::Error) -> Self {
        match err {
            transport::Error::Io(e) => Self::Io(e),
            transport::Error::IdleTimeout => Self::IdleTimeout,
            transport::Error::Frame(e) => Self::ProtocolViolation(ProtocolViolation::Frame(e.to_string())),
        }
    }
}

/// Error allocating a channel
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocChannelError {
    /// Channel 0 is reserved for the connection
    #[error("Channel 0 is reserved for the connection")]
    Reserved,

    /// The id exceeds the negotiated channel-max
    #[error("Channel {id} exceeds channel-max {max}")]
    OutOfRange {
        /// Requested id
        id: u16,
        /// Negotiated channel-max
        max: u16,
    },

    /// A channel with this id is still registered
    #[error("Channel {0} is already allocated")]
    AlreadyAllocated(u16),

    /// The connection is closing or closed
    #[error("Connection is closed")]
    ConnectionClosed,
}

/// Error associated with opening a connection
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    /// IO error
    #[error("IO Error {0:?}")]
    Io(#[from] io::Error),

    /// Error parsing the url
    #[error(transparent)]
    UrlError(#[from] url::ParseError),

    /// Domain is invalid or not found
    #[error("Invalid domain")]
    InvalidDomain,

    /// Scheme is invalid or not found
    #[error(r#"Invalid scheme {0:?}. Only "amqp" is supported."#)]
    InvalidScheme(String),

    /// The broker answered the protocol header with its own
    #[error("Protocol header mismatch. Found {0:?}")]
    ProtocolHeaderMismatch([u8; 8]),

    /// `connection.start` announced another protocol version
    #[error("Unsupported protocol version {major}-{minor}")]
    VersionMismatch {
        /// version-major
        major: u64,
        /// version-minor
        minor: u64,
    },

    /// The broker does not offer the configured SASL mechanism
    #[error("Mechanism {mechanism} not offered by the broker (offered: {offered})")]
    MechanismNotSupported {
        /// Mechanism of the configured profile
        mechanism: &'static str,
        /// Mechanisms listed in `connection.start`
        offered: String,
    },

    /// The broker closed the connection during the handshake, eg. with 403 ACCESS_REFUSED
    #[error("Connection rejected {0}")]
    Rejected(CloseReason),

    /// The transport ended during the handshake
    #[error("Connection closed during the handshake")]
    ConnectionClosed,

    /// The handshake did not complete within the handshake timeout
    #[error("Handshake timed out")]
    Timeout,

    /// The broker sent a method that does not belong to the handshake
    #[error("Unexpected method {0} during the handshake")]
    UnexpectedMethod(MethodId),

    /// Malformed frame or a frame not allowed during the handshake
    #[error(transparent)]
    ProtocolViolation(#[from] ProtocolViolation),

    /// Client properties or credentials cannot be encoded
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl From<transport::Error> for OpenError {
    fn from(err: transport::Error) -> Self {
        match err {
            transport::Error::Io(e) => Self::Io(e),
            transport::Error::IdleTimeout => Self::Timeout,
            transport::Error::Frame(FrameError::ProtocolHeader(header)) => {
                Self::ProtocolHeaderMismatch(header)
            }
            transport::Error::Frame(e) => Self::ProtocolViolation(ProtocolViolation::Frame(e.to_string())),
        }
    }
}
