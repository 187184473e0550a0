//! Channels multiplexed over a connection
//!
//! A [`Channel`] is a cheap handle; the state lives on the connection engine. Synchronous
//! methods hold the channel's RPC lock until the reply arrives, so at most one is outstanding
//! per channel while asynchronous methods (publish, ack, ...) pass straight through.

use std::sync::Arc;

use bytes::BytesMut;
use fe2o3_amqp091_types::{
    method::{encode_properties, Method, MethodTable},
    primitives::Arguments,
    protocol,
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::instrument;

use crate::{
    connection::Shared,
    content::{Content, Message, Reply},
    control::ConnectionControl,
    error::CloseReason,
    queue::DeliveryQueue,
};

mod endpoint;
mod error;
mod flow;
mod state;

pub(crate) use endpoint::ChannelEndpoint;
pub use error::Error;
pub(crate) use flow::Route;
pub use state::ChannelState;

/// Who is told when the application turns a channel's flow off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowMode {
    /// `channel.flow` is sent to the broker, and deliveries that were already in flight are
    /// held locally until flow is turned back on
    #[default]
    Broker,

    /// Only the local switch is flipped. The broker keeps delivering; messages are held
    /// until flow is turned back on.
    Client,
}

/// Whether the method's `no-wait` (or `nowait`) bit is set
pub(crate) fn no_wait(arguments: &Arguments) -> bool {
    arguments
        .get_bool("no-wait")
        .or_else(|| arguments.get_bool("nowait"))
        .unwrap_or(false)
}

/// Reply of [`Channel::queue_declare`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclareOk {
    /// Queue name, as generated by the broker when an empty name was declared
    pub queue: String,

    /// Messages ready in the queue
    pub message_count: u32,

    /// Active consumers of the queue
    pub consumer_count: u32,
}

/// A channel handle
#[derive(Debug, Clone)]
pub struct Channel {
    id: u16,
    generation: u64,
    control: mpsc::Sender<ConnectionControl>,
    table: Arc<dyn MethodTable>,
    rpc_lock: Arc<Mutex<()>>,
    flow_mode: FlowMode,
    shared: Arc<Shared>,
}

impl Channel {
    pub(crate) fn new(
        id: u16,
        generation: u64,
        control: mpsc::Sender<ConnectionControl>,
        table: Arc<dyn MethodTable>,
        flow_mode: FlowMode,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            id,
            generation,
            control,
            table,
            rpc_lock: Arc::new(Mutex::new(())),
            flow_mode,
            shared,
        }
    }

    /// Channel id
    pub fn id(&self) -> u16 {
        self.id
    }

    /// How [`Channel::set_flow`] behaves
    pub fn flow_mode(&self) -> FlowMode {
        self.flow_mode
    }

    fn connection_closed(&self) -> Error {
        Error::Closed(self.shared.close_reason())
    }

    /// Invokes a method by its dotted name, eg. `"queue.declare"`. Argument names may use
    /// `_` in place of `-`.
    ///
    /// Returns the reply for a synchronous method, or `None` for an asynchronous one or
    /// when `no-wait` is set.
    pub async fn invoke(&self, name: &str, arguments: Arguments) -> Result<Option<Reply>, Error> {
        self.invoke_with_content(name, arguments, None).await
    }

    /// Invokes a method that may carry content, eg. `"basic.publish"`
    pub async fn invoke_with_content(
        &self,
        name: &str,
        arguments: Arguments,
        content: Option<Content>,
    ) -> Result<Option<Reply>, Error> {
        let spec = self
            .table
            .method_by_name(name)
            .ok_or_else(|| Error::UnknownMethod(name.to_string()))?;
        let method = Method::from_spec(spec, arguments)?;
        self.invoke_method(method, content).await
    }

    /// Invokes an already built method
    #[instrument(skip_all, fields(channel = self.id, method = %method.id))]
    pub async fn invoke_method(
        &self,
        method: Method,
        content: Option<Content>,
    ) -> Result<Option<Reply>, Error> {
        let spec = self
            .table
            .method(method.id)
            .ok_or_else(|| Error::UnknownMethod(method.id.to_string()))?;

        // Encoding errors are reported here instead of failing the transport
        let mut scratch = BytesMut::new();
        method.encode(&*self.table, &mut scratch)?;
        if let (Some(content), Some(fields)) = (&content, self.table.properties(method.id.class_id)) {
            encode_properties(fields, &content.properties, &mut scratch)?;
        }

        // `channel.close` bypasses the lock; closing fails whatever call is outstanding
        let exclusive = spec.synchronous
            && !no_wait(&method.arguments)
            && !method.is(protocol::CHANNEL_CLOSE);
        let _guard = match exclusive {
            true => Some(self.rpc_lock.lock().await),
            false => None,
        };

        let (responder, reply) = oneshot::channel();
        let control = ConnectionControl::Invoke {
            channel: self.id,
            generation: self.generation,
            method,
            content,
            responder,
        };
        self.control
            .send(control)
            .await
            .map_err(|_| self.connection_closed())?;
        reply.await.map_err(|_| self.connection_closed())?
    }

    async fn call(&self, name: &str, arguments: Arguments) -> Result<Option<Reply>, Error> {
        self.invoke(name, arguments).await
    }

    /// Opens the channel
    pub async fn open(&self) -> Result<(), Error> {
        self.call("channel.open", Arguments::new()).await.map(|_| ())
    }

    /// Closes the channel and waits for `close-ok`
    pub async fn close(&self, reason: CloseReason) -> Result<(), Error> {
        let method = Method::new(protocol::CHANNEL_CLOSE, reason.to_arguments());
        self.invoke_method(method, None).await.map(|_| ())
    }

    /// Returns the delivery queue of a consumer tag. Deliveries that arrived before the
    /// queue was first referenced are kept.
    pub async fn queue(&self, consumer_tag: &str) -> Result<DeliveryQueue, Error> {
        self.route_queue(Route::Consumer(consumer_tag.to_string()))
            .await
    }

    /// Returns the queue of messages returned by the broker (`basic.return`)
    pub async fn returned(&self) -> Result<DeliveryQueue, Error> {
        self.route_queue(Route::Returned).await
    }

    async fn route_queue(&self, route: Route) -> Result<DeliveryQueue, Error> {
        let (responder, reply) = oneshot::channel();
        self.control
            .send(ConnectionControl::Queue {
                channel: self.id,
                generation: self.generation,
                route,
                responder,
            })
            .await
            .map_err(|_| self.connection_closed())?;
        reply.await.map_err(|_| self.connection_closed())?
    }

    /// Turns the delivery flow on or off according to the channel's [`FlowMode`]. Nothing
    /// that arrives while flow is off is lost; it is delivered in order once flow resumes.
    pub async fn set_flow(&self, active: bool) -> Result<(), Error> {
        match self.flow_mode {
            FlowMode::Broker => self.channel_flow(active).await.map(|_| ()),
            FlowMode::Client => {
                let (responder, reply) = oneshot::channel();
                self.control
                    .send(ConnectionControl::LocalFlow {
                        channel: self.id,
                        generation: self.generation,
                        active,
                        responder,
                    })
                    .await
                    .map_err(|_| self.connection_closed())?;
                reply.await.map_err(|_| self.connection_closed())?
            }
        }
    }

    /* -------------------------------------------------------------------------- */
    /*                                   Channel                                  */
    /* -------------------------------------------------------------------------- */

    /// Sends `channel.flow` and returns the state confirmed by the broker
    pub async fn channel_flow(&self, active: bool) -> Result<bool, Error> {
        let reply = self
            .call("channel.flow", Arguments::new().with("active", active))
            .await?;
        Ok(reply
            .and_then(|r| r.arguments().get_bool("active"))
            .unwrap_or(active))
    }

    /* -------------------------------------------------------------------------- */
    /*                                  Exchange                                  */
    /* -------------------------------------------------------------------------- */

    /// Declares an exchange. `options` takes the remaining `exchange.declare` arguments
    /// (`passive`, `durable`, `auto-delete`, `internal`, `no-wait`, `arguments`).
    pub async fn exchange_declare(
        &self,
        exchange: &str,
        kind: &str,
        options: Arguments,
    ) -> Result<(), Error> {
        let arguments = options.with("exchange", exchange).with("type", kind);
        self.call("exchange.declare", arguments).await.map(|_| ())
    }

    /// Deletes an exchange
    pub async fn exchange_delete(&self, exchange: &str, options: Arguments) -> Result<(), Error> {
        let arguments = options.with("exchange", exchange);
        self.call("exchange.delete", arguments).await.map(|_| ())
    }

    /// Binds an exchange to another exchange
    pub async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        options: Arguments,
    ) -> Result<(), Error> {
        let arguments = options
            .with("destination", destination)
            .with("source", source)
            .with("routing-key", routing_key);
        self.call("exchange.bind", arguments).await.map(|_| ())
    }

    /// Removes an exchange to exchange binding
    pub async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        options: Arguments,
    ) -> Result<(), Error> {
        let arguments = options
            .with("destination", destination)
            .with("source", source)
            .with("routing-key", routing_key);
        self.call("exchange.unbind", arguments).await.map(|_| ())
    }

    /* -------------------------------------------------------------------------- */
    /*                                    Queue                                   */
    /* -------------------------------------------------------------------------- */

    /// Declares a queue. An empty name asks the broker to generate one.
    pub async fn queue_declare(&self, queue: &str, options: Arguments) -> Result<QueueDeclareOk, Error> {
        let arguments = options.with("queue", queue);
        let reply = self.call("queue.declare", arguments).await?;
        let ok = match reply {
            Some(reply) => {
                let args = reply.arguments();
                QueueDeclareOk {
                    queue: args.get_str("queue").unwrap_or(queue).to_string(),
                    message_count: args.get_u64("message-count").unwrap_or(0) as u32,
                    consumer_count: args.get_u64("consumer-count").unwrap_or(0) as u32,
                }
            }
            None => QueueDeclareOk {
                queue: queue.to_string(),
                message_count: 0,
                consumer_count: 0,
            },
        };
        Ok(ok)
    }

    /// Binds a queue to an exchange
    pub async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: Arguments,
    ) -> Result<(), Error> {
        let arguments = options
            .with("queue", queue)
            .with("exchange", exchange)
            .with("routing-key", routing_key);
        self.call("queue.bind", arguments).await.map(|_| ())
    }

    /// Removes a queue binding
    pub async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: Arguments,
    ) -> Result<(), Error> {
        let arguments = options
            .with("queue", queue)
            .with("exchange", exchange)
            .with("routing-key", routing_key);
        self.call("queue.unbind", arguments).await.map(|_| ())
    }

    /// Purges a queue, returning the number of messages removed
    pub async fn queue_purge(&self, queue: &str, options: Arguments) -> Result<u32, Error> {
        let reply = self.call("queue.purge", options.with("queue", queue)).await?;
        Ok(message_count(reply))
    }

    /// Deletes a queue, returning the number of messages it held
    pub async fn queue_delete(&self, queue: &str, options: Arguments) -> Result<u32, Error> {
        let reply = self.call("queue.delete", options.with("queue", queue)).await?;
        Ok(message_count(reply))
    }

    /* -------------------------------------------------------------------------- */
    /*                                    Basic                                   */
    /* -------------------------------------------------------------------------- */

    /// Sets the prefetch window
    pub async fn basic_qos(&self, prefetch_size: u32, prefetch_count: u16, global: bool) -> Result<(), Error> {
        let arguments = Arguments::new()
            .with("prefetch-size", prefetch_size)
            .with("prefetch-count", prefetch_count)
            .with("global", global);
        self.call("basic.qos", arguments).await.map(|_| ())
    }

    /// Starts a consumer and returns its tag. An empty tag asks the broker to generate one.
    /// Deliveries go to [`Channel::queue`] of the returned tag.
    pub async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: Arguments,
    ) -> Result<String, Error> {
        let arguments = options
            .with("queue", queue)
            .with("consumer-tag", consumer_tag);
        let reply = self.call("basic.consume", arguments).await?;
        let tag = reply
            .as_ref()
            .and_then(|r| r.arguments().get_str("consumer-tag"))
            .unwrap_or(consumer_tag);
        Ok(tag.to_string())
    }

    /// Cancels a consumer. Its delivery queue is closed once the broker confirms.
    pub async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), Error> {
        let arguments = Arguments::new().with("consumer-tag", consumer_tag);
        self.call("basic.cancel", arguments).await.map(|_| ())
    }

    /// Publishes a message. `options` takes `mandatory` and `immediate`.
    pub async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: impl Into<Content>,
        options: Arguments,
    ) -> Result<(), Error> {
        let arguments = options
            .with("exchange", exchange)
            .with("routing-key", routing_key);
        self.invoke_with_content("basic.publish", arguments, Some(content.into()))
            .await
            .map(|_| ())
    }

    /// Fetches a single message, or `None` if the queue is empty
    pub async fn basic_get(&self, queue: &str, no_ack: bool) -> Result<Option<Message>, Error> {
        let arguments = Arguments::new().with("queue", queue).with("no-ack", no_ack);
        match self.call("basic.get", arguments).await? {
            Some(reply) if reply.is(protocol::BASIC_GET_OK) => Ok(reply.into_message()),
            Some(reply) if reply.is(protocol::BASIC_GET_EMPTY) => Ok(None),
            Some(reply) => Err(Error::UnexpectedReply(reply.method.id)),
            None => Ok(None),
        }
    }

    /// Acknowledges one delivery, or every delivery up to `delivery_tag` if `multiple`
    pub async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), Error> {
        let arguments = Arguments::new()
            .with("delivery-tag", delivery_tag)
            .with("multiple", multiple);
        self.call("basic.ack", arguments).await.map(|_| ())
    }

    /// Rejects one delivery
    pub async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), Error> {
        let arguments = Arguments::new()
            .with("delivery-tag", delivery_tag)
            .with("requeue", requeue);
        self.call("basic.reject", arguments).await.map(|_| ())
    }

    /// Rejects one or more deliveries
    pub async fn basic_nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<(), Error> {
        let arguments = Arguments::new()
            .with("delivery-tag", delivery_tag)
            .with("multiple", multiple)
            .with("requeue", requeue);
        self.call("basic.nack", arguments).await.map(|_| ())
    }

    /// Asks the broker to redeliver unacknowledged messages
    pub async fn basic_recover(&self, requeue: bool) -> Result<(), Error> {
        let arguments = Arguments::new().with("requeue", requeue);
        self.call("basic.recover", arguments).await.map(|_| ())
    }

    /* -------------------------------------------------------------------------- */
    /*                               Confirm and Tx                               */
    /* -------------------------------------------------------------------------- */

    /// Puts the channel in confirm mode
    pub async fn confirm_select(&self) -> Result<(), Error> {
        self.call("confirm.select", Arguments::new()).await.map(|_| ())
    }

    /// Puts the channel in transaction mode
    pub async fn tx_select(&self) -> Result<(), Error> {
        self.call("tx.select", Arguments::new()).await.map(|_| ())
    }

    /// Commits the current transaction
    pub async fn tx_commit(&self) -> Result<(), Error> {
        self.call("tx.commit", Arguments::new()).await.map(|_| ())
    }

    /// Abandons the current transaction
    pub async fn tx_rollback(&self) -> Result<(), Error> {
        self.call("tx.rollback", Arguments::new()).await.map(|_| ())
    }
}

fn message_count(reply: Option<Reply>) -> u32 {
    reply
        .and_then(|r| r.arguments().get_u64("message-count"))
        .unwrap_or(0) as u32
}
