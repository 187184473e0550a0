use std::io;

use fe2o3_amqp091_types::{DecodeError, EncodeError};

/// Error encoding or decoding a frame
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// IO error from the underlying stream
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The peer answered with a protocol header instead of a frame, which means it does not
    /// speak our protocol version
    #[error("Peer sent protocol header {0:?}")]
    ProtocolHeader([u8; 8]),

    /// The frame does not end with `0xCE`
    #[error("Frame does not end with 0xCE, found {0:#04x}")]
    MissingFrameEnd(u8),

    /// The frame type octet is not method, header, body or heartbeat
    #[error("Unknown frame type {0}")]
    UnknownFrameType(u8),

    /// The frame exceeds the negotiated maximum frame size
    #[error("Frame of {size} bytes exceeds maximum frame size {max}")]
    FrameTooLarge {
        /// Size of the frame including overhead
        size: usize,
        /// Negotiated maximum
        max: usize,
    },

    /// The declared payload size does not match the bytes available
    #[error("Frame declares {declared} payload bytes, found {actual}")]
    LengthMismatch {
        /// Size from the frame header
        declared: usize,
        /// Actual payload size
        actual: usize,
    },

    /// Heartbeats must be on channel 0 with no payload
    #[error("Malformed heartbeat on channel {channel} with {size} payload bytes")]
    MalformedHeartbeat {
        /// Channel id
        channel: u16,
        /// Payload size
        size: usize,
    },

    /// Error decoding the payload
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Error encoding the payload
    #[error(transparent)]
    Encode(#[from] EncodeError),
}
