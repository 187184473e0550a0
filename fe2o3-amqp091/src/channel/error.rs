use fe2o3_amqp091_types::{method::MethodId, EncodeError};

use crate::error::{CloseReason, ProtocolViolation};

/// Channel error
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// The channel or connection is not usable. Carries the reply code and text when the
    /// closure came with one, eg. 504 when operating on a channel that was never opened.
    #[error("Channel is closed {}", match .0 { Some(r) => r.to_string(), None => String::new() })]
    Closed(Option<CloseReason>),

    /// The request would break the protocol and was not sent
    #[error(transparent)]
    ProtocolViolation(#[from] ProtocolViolation),

    /// No method with this name in the method table
    #[error("Unknown method {0:?}")]
    UnknownMethod(String),

    /// The arguments or properties cannot be encoded
    #[error(transparent)]
    Arguments(#[from] EncodeError),

    /// The broker answered with a method the call did not expect
    #[error("Unexpected reply {0}")]
    UnexpectedReply(MethodId),
}

impl Error {
    /// Reply code of the close reason, if any
    pub fn reply_code(&self) -> Option<u16> {
        match self {
            Error::Closed(Some(reason)) => Some(reason.reply_code),
            _ => None,
        }
    }

    /// The close reason, if the channel or connection was closed with one
    pub fn close_reason(&self) -> Option<&CloseReason> {
        match self {
            Error::Closed(reason) => reason.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn not_open(channel: u16) -> Self {
        Error::Closed(Some(CloseReason::channel_error(format!(
            "channel {} is not open",
            channel
        ))))
    }
}
