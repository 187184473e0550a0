//! Controls sent from connection and channel handles to the connection engine

use fe2o3_amqp091_types::method::Method;
use tokio::sync::oneshot;

use crate::{
    channel::{self, Route},
    connection::AllocChannelError,
    content::{Content, Reply},
    error::CloseReason,
    queue::DeliveryQueue,
};

pub(crate) type InvokeResponder = oneshot::Sender<Result<Option<Reply>, channel::Error>>;

#[derive(Debug)]
pub(crate) enum ConnectionControl {
    /// Registers an `Unopened` channel and answers with the registration's generation
    AllocateChannel {
        id: u16,
        responder: oneshot::Sender<Result<u64, AllocChannelError>>,
    },

    /// Sends a method (and content) on a channel. Synchronous methods are answered once the
    /// reply arrives, asynchronous ones once the frames are handed to the transport.
    Invoke {
        channel: u16,
        generation: u64,
        method: Method,
        content: Option<Content>,
        responder: InvokeResponder,
    },

    /// Closes a channel from the connection handle
    CloseChannel {
        channel: u16,
        reason: CloseReason,
        responder: InvokeResponder,
    },

    /// Returns the delivery queue of a consumer tag or of returned messages
    Queue {
        channel: u16,
        generation: u64,
        route: Route,
        responder: oneshot::Sender<Result<DeliveryQueue, channel::Error>>,
    },

    /// Flips the local flow switch without telling the broker
    LocalFlow {
        channel: u16,
        generation: u64,
        active: bool,
        responder: oneshot::Sender<Result<(), channel::Error>>,
    },

    /// Closes the connection
    Close(Option<CloseReason>),
}
