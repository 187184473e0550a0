//! AMQP 0-9-1 frames
//!
//! ```text
//! +------+---------+---------+-------------+-----------+
//! | type | channel |  size   |   payload   | frame-end |
//! |  u8  |   u16   |   u32   | size octets |   0xCE    |
//! +------+---------+---------+-------------+-----------+
//! ```

use bytes::Bytes;
use fe2o3_amqp091_types::{method::Method, primitives::FieldTable};

mod codec;
mod content;
mod error;

pub use codec::{decode_frame, FrameCodec};
pub use content::{content_frames, ContentAssembler};
pub use error::FrameError;

/// Method frame
pub const FRAME_METHOD: u8 = 1;

/// Content header frame
pub const FRAME_HEADER: u8 = 2;

/// Content body frame
pub const FRAME_BODY: u8 = 3;

/// Heartbeat frame
pub const FRAME_HEARTBEAT: u8 = 8;

/// Last octet of every frame
pub const FRAME_END: u8 = 0xCE;

/// Type, channel and size
pub const FRAME_HEADER_SIZE: usize = 7;

/// Bytes of every frame that are not payload
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + 1;

/// A frame together with its channel
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Channel id, 0 for the connection
    pub channel: u16,

    /// Frame body
    pub body: FrameBody,
}

impl Frame {
    /// Creates a new frame
    pub fn new(channel: impl Into<u16>, body: FrameBody) -> Self {
        Self {
            channel: channel.into(),
            body,
        }
    }

    /// A method frame
    pub fn method(channel: u16, method: Method) -> Self {
        Self::new(channel, FrameBody::Method(method))
    }

    /// A heartbeat frame (always on channel 0)
    pub fn heartbeat() -> Self {
        Self::new(0u16, FrameBody::Heartbeat)
    }
}

/// Frame body
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    /// A method with its arguments
    Method(Method),

    /// A content header
    Header(ContentHeader),

    /// A slice of a content body
    Body(Bytes),

    /// Heartbeat, no payload
    Heartbeat,
}

impl FrameBody {
    /// Name of the frame type, used in logs and errors
    pub fn kind(&self) -> &'static str {
        match self {
            FrameBody::Method(_) => "method",
            FrameBody::Header(_) => "header",
            FrameBody::Body(_) => "body",
            FrameBody::Heartbeat => "heartbeat",
        }
    }
}

/// Content header: announces the class, total body size and properties of a content
#[derive(Debug, Clone, PartialEq)]
pub struct ContentHeader {
    /// Class id, must match the carrying method's class
    pub class_id: u16,

    /// Unused, always 0
    pub weight: u16,

    /// Total size of all body frames
    pub body_size: u64,

    /// Content properties
    pub properties: FieldTable,
}
