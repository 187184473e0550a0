//! Close reasons and protocol violations shared by connections and channels

use std::fmt;

use fe2o3_amqp091_types::{
    constants::{self, reply_code_name},
    method::MethodId,
    primitives::Arguments,
    DecodeError, EncodeError,
};

/// The reply code and text carried by a `connection.close` or `channel.close`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Reply code, eg. 504 for a channel error
    pub reply_code: u16,

    /// Human readable reason
    pub reply_text: String,

    /// Class id of the method that caused the close, 0 if none
    pub class_id: u16,

    /// Method id of the method that caused the close, 0 if none
    pub method_id: u16,
}

impl CloseReason {
    /// Creates a new close reason
    pub fn new(reply_code: u16, reply_text: impl Into<String>) -> Self {
        Self {
            reply_code,
            reply_text: reply_text.into(),
            class_id: 0,
            method_id: 0,
        }
    }

    /// A normal shutdown (200)
    pub fn normal() -> Self {
        Self::new(constants::REPLY_SUCCESS, "Goodbye")
    }

    /// A channel error (504), used when operating on a channel that is not open
    pub fn channel_error(reply_text: impl Into<String>) -> Self {
        Self::new(constants::CHANNEL_ERROR, reply_text)
    }

    /// Records the method that caused the close
    pub fn with_method(mut self, id: MethodId) -> Self {
        self.class_id = id.class_id;
        self.method_id = id.method_id;
        self
    }

    /// Whether this is a normal shutdown
    pub fn is_normal(&self) -> bool {
        self.reply_code == constants::REPLY_SUCCESS
    }

    /// Reads the reason from `close` method arguments
    pub fn from_arguments(arguments: &Arguments) -> Self {
        let short = |name| arguments.get_u64(name).unwrap_or_default() as u16;
        Self {
            reply_code: short("reply-code"),
            reply_text: arguments.get_str("reply-text").unwrap_or_default().to_string(),
            class_id: short("class-id"),
            method_id: short("method-id"),
        }
    }

    /// Arguments of a `connection.close` or `channel.close` carrying this reason
    pub fn to_arguments(&self) -> Arguments {
        // Reply text is a short string on the wire
        let mut text = self.reply_text.clone();
        if text.len() > u8::MAX as usize {
            let mut end = u8::MAX as usize;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
        }
        Arguments::new()
            .with("reply-code", self.reply_code)
            .with("reply-text", text)
            .with("class-id", self.class_id)
            .with("method-id", self.method_id)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match reply_code_name(self.reply_code) {
            Some(name) => write!(f, "{} {}", self.reply_code, name)?,
            None => write!(f, "{}", self.reply_code)?,
        }
        if !self.reply_text.is_empty() {
            write!(f, ": {}", self.reply_text)?;
        }
        Ok(())
    }
}

/// The peer sent something that does not fit the protocol state. Always fatal to the
/// connection, except for [`ProtocolViolation::UnknownDeliveryTag`] which is caught locally
/// before anything is sent.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolViolation {
    /// A frame arrived for a channel that is not registered
    #[error("Frame received on unknown channel {0}")]
    UnknownChannel(u16),

    /// A frame type that is not allowed on this channel or in this state
    #[error("Unexpected frame on channel {channel}: {kind}")]
    UnexpectedFrame {
        /// Channel id
        channel: u16,
        /// Description of the frame
        kind: &'static str,
    },

    /// A content header arrived without a preceding content-bearing method
    #[error("Content header without a content-bearing method")]
    UnexpectedHeader,

    /// A body frame arrived for no delivery or before its header
    #[error("Body frame for an unknown delivery")]
    UnexpectedBody,

    /// A method frame arrived before the previous content was complete
    #[error("Method {0} interrupted an incomplete content")]
    ContentInterrupted(MethodId),

    /// Body frames carried more bytes than announced by the content header
    #[error("Content body exceeds the declared size {declared}")]
    BodyOverflow {
        /// Body size from the content header
        declared: u64,
    },

    /// The content header's class does not match the method's class
    #[error("Content header class {found} does not match method class {expected}")]
    ClassMismatch {
        /// Class of the method
        expected: u16,
        /// Class of the header
        found: u16,
    },

    /// A method that answers nothing outstanding
    #[error("Unexpected method {0}")]
    UnexpectedMethod(MethodId),

    /// Delivery tags must strictly increase on a channel
    #[error("Delivery tag {tag} does not follow {last}")]
    DeliveryTagOrder {
        /// The offending tag
        tag: u64,
        /// The last tag seen on the channel
        last: u64,
    },

    /// An acknowledgement for a tag that was never delivered or is already settled
    #[error("Unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    /// A frame or its payload could not be decoded
    #[error("Malformed frame: {0}")]
    Frame(String),
}

impl ProtocolViolation {
    /// Reply code to report to the peer
    pub fn reply_code(&self) -> u16 {
        match self {
            ProtocolViolation::UnknownChannel(_) => constants::CHANNEL_ERROR,
            ProtocolViolation::UnexpectedFrame { .. }
            | ProtocolViolation::UnexpectedHeader
            | ProtocolViolation::UnexpectedBody
            | ProtocolViolation::ContentInterrupted(_)
            | ProtocolViolation::ClassMismatch { .. } => constants::UNEXPECTED_FRAME,
            ProtocolViolation::UnexpectedMethod(_) => constants::COMMAND_INVALID,
            ProtocolViolation::DeliveryTagOrder { .. } => constants::COMMAND_INVALID,
            ProtocolViolation::UnknownDeliveryTag(_) => constants::PRECONDITION_FAILED,
            ProtocolViolation::BodyOverflow { .. } | ProtocolViolation::Frame(_) => {
                constants::FRAME_ERROR
            }
        }
    }

    /// Close reason to report to the peer
    pub fn close_reason(&self) -> CloseReason {
        CloseReason::new(self.reply_code(), self.to_string())
    }
}

impl From<DecodeError> for ProtocolViolation {
    fn from(err: DecodeError) -> Self {
        Self::Frame(err.to_string())
    }
}

impl From<EncodeError> for ProtocolViolation {
    fn from(err: EncodeError) -> Self {
        Self::Frame(err.to_string())
    }
}
