//! Engine-side channel state

use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    sync::Arc,
};

use fe2o3_amqp091_types::{
    method::{Method, MethodSpec, MethodTable},
    primitives::Arguments,
    protocol,
};
use tracing::{debug, trace, warn};

use crate::{
    content::{Content, Message, Reply},
    control::InvokeResponder,
    error::{CloseReason, ProtocolViolation},
    frames::{content_frames, ContentAssembler, Frame, FrameBody},
    queue::{DeliveryQueue, QueueSender},
};

use super::{
    flow::{FlowController, Route},
    no_wait,
    state::ChannelState,
    Error,
};

/// A synchronous request waiting for its reply
#[derive(Debug)]
struct PendingCall {
    request: Method,
    responder: InvokeResponder,
}

/// The connection engine's view of one channel. Everything here runs on the engine task.
#[derive(Debug)]
pub(crate) struct ChannelEndpoint {
    id: u16,
    generation: u64,
    state: ChannelState,
    table: Arc<dyn MethodTable>,
    frame_max: usize,

    pending: VecDeque<PendingCall>,
    assembler: ContentAssembler,

    queues: HashMap<Route, QueueSender>,
    no_ack_consumers: HashSet<String>,
    flow: FlowController,

    unacked: BTreeSet<u64>,
    last_delivery_tag: u64,

    close_reason: Option<CloseReason>,
}

impl ChannelEndpoint {
    pub fn new(id: u16, generation: u64, table: Arc<dyn MethodTable>, frame_max: usize) -> Self {
        Self {
            id,
            generation,
            state: ChannelState::Unopened,
            table,
            frame_max,
            pending: VecDeque::new(),
            assembler: ContentAssembler::new(),
            queues: HashMap::new(),
            no_ack_consumers: HashSet::new(),
            flow: FlowController::default(),
            unacked: BTreeSet::new(),
            last_delivery_tag: 0,
            close_reason: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[cfg(test)]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ChannelState::Closed
    }

    /* -------------------------------------------------------------------------- */
    /*                                  Outgoing                                  */
    /* -------------------------------------------------------------------------- */

    /// Handles a method invoked by the application. Returns the frames to send. The responder
    /// is either answered right away or parked until the reply arrives.
    pub fn on_outgoing(
        &mut self,
        method: Method,
        content: Option<Content>,
        responder: InvokeResponder,
    ) -> Vec<Frame> {
        let table = self.table.clone();
        let spec = match table.method(method.id) {
            Some(spec) => spec,
            None => {
                let _ = responder.send(Err(Error::UnknownMethod(method.id.to_string())));
                return Vec::new();
            }
        };

        if let Err(err) = self.check_outgoing(&method) {
            let _ = responder.send(Err(err));
            return Vec::new();
        }

        match method.id {
            protocol::CHANNEL_OPEN => self.state = ChannelState::Opening,
            protocol::CHANNEL_CLOSE => return self.begin_close(method, responder),
            protocol::BASIC_ACK | protocol::BASIC_REJECT | protocol::BASIC_NACK => {
                if let Err(violation) = self.settle(&method) {
                    let _ = responder.send(Err(violation.into()));
                    return Vec::new();
                }
            }
            protocol::CHANNEL_FLOW if method.arguments.get_bool("active") == Some(false) => {
                // Deliveries already in flight must not reach a consumer either
                self.flow.set_active(false);
            }
            protocol::BASIC_RECOVER | protocol::BASIC_RECOVER_ASYNC => {
                // Redeliveries come with new tags
                self.unacked.clear();
            }
            _ => {}
        }

        let frames = match (spec.content, content) {
            (true, content) => {
                let content = content.unwrap_or_default();
                if method.is(protocol::BASIC_PUBLISH) && self.flow.is_publish_paused() {
                    debug!(channel = self.id, "Broker paused flow, holding publish");
                    self.flow.hold_publish(method, content);
                    let _ = responder.send(Ok(None));
                    return Vec::new();
                }
                self.content_frames(method.clone(), content)
            }
            (false, _) => vec![Frame::method(self.id, method.clone())],
        };

        self.park_or_answer(spec, method, responder);
        frames
    }

    /// Handles a close requested through the connection handle
    pub fn on_close_request(&mut self, reason: CloseReason, responder: InvokeResponder) -> Vec<Frame> {
        match self.state {
            ChannelState::Unopened => {
                self.finish_close(Some(reason));
                let _ = responder.send(Ok(None));
                Vec::new()
            }
            ChannelState::Opening | ChannelState::Open => {
                let method = Method::new(protocol::CHANNEL_CLOSE, reason.to_arguments());
                self.begin_close(method, responder)
            }
            ChannelState::Closing | ChannelState::Closed => {
                let _ = responder.send(Err(Error::not_open(self.id)));
                Vec::new()
            }
        }
    }

    /// Returns the delivery queue of a route, creating it on first reference
    pub fn queue(&mut self, route: Route) -> Result<DeliveryQueue, Error> {
        match self.state {
            ChannelState::Closing | ChannelState::Closed => Err(Error::not_open(self.id)),
            _ => Ok(self.queue_sender(route).queue()),
        }
    }

    /// Flips the local flow switch. Turning flow on releases held deliveries.
    pub fn set_local_flow(&mut self, active: bool) -> Result<(), Error> {
        if self.state != ChannelState::Open {
            return Err(Error::not_open(self.id));
        }
        for (route, message) in self.flow.set_active(active) {
            self.queue_sender(route).push(message);
        }
        Ok(())
    }

    fn check_outgoing(&self, method: &Method) -> Result<(), Error> {
        match (self.state, method.id) {
            (ChannelState::Unopened, protocol::CHANNEL_OPEN) => Ok(()),
            (ChannelState::Opening, protocol::CHANNEL_CLOSE) => Ok(()),
            (ChannelState::Open, protocol::CHANNEL_OPEN) => Err(Error::Closed(Some(
                CloseReason::channel_error(format!("channel {} is already open", self.id)),
            ))),
            (ChannelState::Open, _) => Ok(()),
            _ => Err(Error::not_open(self.id)),
        }
    }

    fn park_or_answer(&mut self, spec: &MethodSpec, request: Method, responder: InvokeResponder) {
        if spec.synchronous && !no_wait(&request.arguments) {
            self.pending.push_back(PendingCall { request, responder });
        } else {
            let _ = responder.send(Ok(None));
        }
    }

    fn content_frames(&self, method: Method, content: Content) -> Vec<Frame> {
        let class_id = method.id.class_id;
        let mut frames = vec![Frame::method(self.id, method)];
        frames.extend(content_frames(self.id, class_id, content, self.frame_max));
        frames
    }

    fn begin_close(&mut self, method: Method, responder: InvokeResponder) -> Vec<Frame> {
        let reason = CloseReason::from_arguments(&method.arguments);
        debug!(channel = self.id, %reason, "Closing channel");
        self.fail_pending(Some(reason.clone()));
        self.assembler = ContentAssembler::new();
        self.state = ChannelState::Closing;
        self.close_reason = Some(reason);
        self.pending.push_back(PendingCall {
            request: method.clone(),
            responder,
        });
        vec![Frame::method(self.id, method)]
    }

    /// Checks and settles an acknowledgement. Nothing is sent for an unknown tag.
    fn settle(&mut self, method: &Method) -> Result<(), ProtocolViolation> {
        let tag = method.arguments.get_u64("delivery-tag").unwrap_or(0);
        let multiple = !method.is(protocol::BASIC_REJECT)
            && method.arguments.get_bool("multiple").unwrap_or(false);

        match (multiple, tag) {
            (true, 0) => self.unacked.clear(),
            (true, tag) => {
                if !self.unacked.contains(&tag) {
                    return Err(ProtocolViolation::UnknownDeliveryTag(tag));
                }
                self.unacked.retain(|t| *t > tag);
            }
            (false, tag) => {
                if !self.unacked.remove(&tag) {
                    return Err(ProtocolViolation::UnknownDeliveryTag(tag));
                }
            }
        }
        Ok(())
    }

    /* -------------------------------------------------------------------------- */
    /*                                  Incoming                                  */
    /* -------------------------------------------------------------------------- */

    /// Handles a frame from the broker. Returns the frames to send in response.
    pub fn on_frame(&mut self, body: FrameBody) -> Result<Vec<Frame>, ProtocolViolation> {
        match self.state {
            ChannelState::Unopened | ChannelState::Closed => {
                Err(ProtocolViolation::UnexpectedFrame {
                    channel: self.id,
                    kind: body.kind(),
                })
            }
            ChannelState::Closing => Ok(self.on_frame_while_closing(body)),
            ChannelState::Opening | ChannelState::Open => match body {
                FrameBody::Method(method) => self.on_method(method),
                FrameBody::Header(header) => match self.assembler.on_header(header)? {
                    Some((method, content)) => self.on_content(method, content),
                    None => Ok(Vec::new()),
                },
                FrameBody::Body(bytes) => match self.assembler.on_body(bytes)? {
                    Some((method, content)) => self.on_content(method, content),
                    None => Ok(Vec::new()),
                },
                FrameBody::Heartbeat => Err(ProtocolViolation::UnexpectedFrame {
                    channel: self.id,
                    kind: "heartbeat",
                }),
            },
        }
    }

    /// Only the close handshake matters once `channel.close` was sent
    fn on_frame_while_closing(&mut self, body: FrameBody) -> Vec<Frame> {
        match body {
            FrameBody::Method(method) if method.is(protocol::CHANNEL_CLOSE_OK) => {
                let reason = self.close_reason.take();
                if let Some(call) = self.pending.pop_front() {
                    let _ = call.responder.send(Ok(Some(Reply {
                        method,
                        content: None,
                    })));
                }
                self.finish_close(reason);
                Vec::new()
            }
            FrameBody::Method(method) if method.is(protocol::CHANNEL_CLOSE) => {
                // Both sides closed at the same time; our close-ok is still expected
                let reason = CloseReason::from_arguments(&method.arguments);
                debug!(channel = self.id, %reason, "Close crossed with the broker's");
                self.close_reason = Some(reason);
                vec![self.close_ok()]
            }
            body => {
                trace!(channel = self.id, kind = body.kind(), "Discarding frame while closing");
                Vec::new()
            }
        }
    }

    fn on_method(&mut self, method: Method) -> Result<Vec<Frame>, ProtocolViolation> {
        if !self.assembler.is_idle() {
            return Err(ProtocolViolation::ContentInterrupted(method.id));
        }
        let table = self.table.clone();
        let spec = table
            .method(method.id)
            .ok_or(ProtocolViolation::UnexpectedMethod(method.id))?;
        if spec.content {
            self.assembler.start(method)?;
            return Ok(Vec::new());
        }

        match method.id {
            protocol::CHANNEL_CLOSE => {
                let reason = CloseReason::from_arguments(&method.arguments);
                warn!(channel = self.id, %reason, "Channel closed by broker");
                self.finish_close(Some(reason));
                Ok(vec![self.close_ok()])
            }
            protocol::CHANNEL_FLOW => {
                let active = method.arguments.get_bool("active").unwrap_or(true);
                debug!(channel = self.id, active, "Broker flow");
                let mut frames = vec![Frame::method(
                    self.id,
                    Method::new(
                        protocol::CHANNEL_FLOW_OK,
                        Arguments::new().with("active", active),
                    ),
                )];
                for (method, content) in self.flow.set_remote_active(active) {
                    frames.extend(self.content_frames(method, content));
                }
                Ok(frames)
            }
            protocol::BASIC_CANCEL => {
                let tag = method.arguments.get_str("consumer-tag").unwrap_or_default();
                debug!(channel = self.id, consumer_tag = tag, "Consumer cancelled by broker");
                let tag = tag.to_string();
                self.remove_consumer(&tag, None);
                match no_wait(&method.arguments) {
                    true => Ok(Vec::new()),
                    false => Ok(vec![Frame::method(
                        self.id,
                        Method::new(
                            protocol::BASIC_CANCEL_OK,
                            Arguments::new().with("consumer-tag", tag),
                        ),
                    )]),
                }
            }
            protocol::BASIC_ACK | protocol::BASIC_NACK => {
                // Publisher confirms are not tracked
                trace!(channel = self.id, method = %method.id, arguments = ?method.arguments, "Confirm");
                Ok(Vec::new())
            }
            _ => self.on_reply(method, None),
        }
    }

    fn on_reply(&mut self, method: Method, content: Option<Content>) -> Result<Vec<Frame>, ProtocolViolation> {
        let table = self.table.clone();
        let call = match self.pending.front() {
            Some(call)
                if table
                    .method(call.request.id)
                    .map(|spec| spec.is_response(method.id))
                    .unwrap_or(false) =>
            {
                self.pending.pop_front()
            }
            _ => None,
        };
        let call = call.ok_or(ProtocolViolation::UnexpectedMethod(method.id))?;

        match method.id {
            protocol::CHANNEL_OPEN_OK => {
                debug!(channel = self.id, "Channel opened");
                self.state = ChannelState::Open;
            }
            protocol::BASIC_CONSUME_OK => {
                let tag = method
                    .arguments
                    .get_str("consumer-tag")
                    .unwrap_or_default()
                    .to_string();
                if call.request.arguments.get_bool("no-ack").unwrap_or(false) {
                    self.no_ack_consumers.insert(tag.clone());
                }
                self.queue_sender(Route::Consumer(tag));
            }
            protocol::BASIC_CANCEL_OK => {
                let tag = method
                    .arguments
                    .get_str("consumer-tag")
                    .unwrap_or_default()
                    .to_string();
                self.remove_consumer(&tag, None);
            }
            protocol::CHANNEL_FLOW_OK => {
                let active = method.arguments.get_bool("active").unwrap_or(true);
                for (route, message) in self.flow.set_active(active) {
                    self.queue_sender(route).push(message);
                }
            }
            _ => {}
        }

        let _ = call.responder.send(Ok(Some(Reply { method, content })));
        Ok(Vec::new())
    }

    fn on_content(&mut self, method: Method, content: Content) -> Result<Vec<Frame>, ProtocolViolation> {
        match method.id {
            protocol::BASIC_DELIVER => {
                let tag = self.check_delivery_tag(&method)?;
                let consumer_tag = method
                    .arguments
                    .get_str("consumer-tag")
                    .unwrap_or_default()
                    .to_string();
                if !self.no_ack_consumers.contains(&consumer_tag) {
                    self.unacked.insert(tag);
                }
                trace!(channel = self.id, delivery_tag = tag, consumer_tag = %consumer_tag, "Deliver");
                self.route(Route::Consumer(consumer_tag), Message::new(method, content));
                Ok(Vec::new())
            }
            protocol::BASIC_GET_OK => {
                let tag = self.check_delivery_tag(&method)?;
                let no_ack = match self.pending.front() {
                    Some(call) if call.request.is(protocol::BASIC_GET) => {
                        call.request.arguments.get_bool("no-ack").unwrap_or(false)
                    }
                    _ => return Err(ProtocolViolation::UnexpectedMethod(method.id)),
                };
                if !no_ack {
                    self.unacked.insert(tag);
                }
                self.on_reply(method, Some(content))
            }
            protocol::BASIC_RETURN => {
                let message = Message::new(method, content);
                if let Some((code, text)) = message.return_reason() {
                    debug!(channel = self.id, reply_code = code, reply_text = text, "Message returned");
                }
                self.route(Route::Returned, message);
                Ok(Vec::new())
            }
            _ => Err(ProtocolViolation::UnexpectedMethod(method.id)),
        }
    }

    fn check_delivery_tag(&mut self, method: &Method) -> Result<u64, ProtocolViolation> {
        let tag = method.arguments.get_u64("delivery-tag").unwrap_or(0);
        if tag <= self.last_delivery_tag {
            return Err(ProtocolViolation::DeliveryTagOrder {
                tag,
                last: self.last_delivery_tag,
            });
        }
        self.last_delivery_tag = tag;
        Ok(tag)
    }

    /* -------------------------------------------------------------------------- */
    /*                                   Helpers                                  */
    /* -------------------------------------------------------------------------- */

    fn route(&mut self, route: Route, message: Message) {
        if let Some((route, message)) = self.flow.admit(route, message) {
            self.queue_sender(route).push(message);
        }
    }

    fn queue_sender(&mut self, route: Route) -> &QueueSender {
        self.queues.entry(route).or_insert_with(DeliveryQueue::channel)
    }

    fn remove_consumer(&mut self, tag: &str, reason: Option<CloseReason>) {
        self.no_ack_consumers.remove(tag);
        if let Some(sender) = self.queues.remove(&Route::Consumer(tag.to_string())) {
            sender.close(reason);
        }
    }

    fn close_ok(&self) -> Frame {
        Frame::method(
            self.id,
            Method::new(protocol::CHANNEL_CLOSE_OK, Arguments::new()),
        )
    }

    fn fail_pending(&mut self, reason: Option<CloseReason>) {
        for call in self.pending.drain(..) {
            let _ = call.responder.send(Err(Error::Closed(reason.clone())));
        }
    }

    /// Moves to `Closed`: fails outstanding calls and closes every queue after handing it
    /// whatever the flow controller still holds.
    pub fn finish_close(&mut self, reason: Option<CloseReason>) {
        self.state = ChannelState::Closed;
        self.assembler = ContentAssembler::new();
        self.fail_pending(reason.clone());
        for (route, message) in self.flow.take_held() {
            self.queue_sender(route).push(message);
        }
        for (_, sender) in self.queues.drain() {
            sender.close(reason.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use fe2o3_amqp091_types::{constants, protocol::Amqp091};
    use tokio::sync::oneshot;

    use super::*;
    use crate::frames::ContentHeader;

    fn endpoint() -> ChannelEndpoint {
        ChannelEndpoint::new(1, 1, Arc::new(Amqp091), 4096)
    }

    fn invoke(
        endpoint: &mut ChannelEndpoint,
        id: fe2o3_amqp091_types::method::MethodId,
        arguments: Arguments,
        content: Option<Content>,
    ) -> (Vec<Frame>, oneshot::Receiver<Result<Option<Reply>, Error>>) {
        let (tx, rx) = oneshot::channel();
        let frames = endpoint.on_outgoing(Method::new(id, arguments), content, tx);
        (frames, rx)
    }

    fn method(id: fe2o3_amqp091_types::method::MethodId, arguments: Arguments) -> FrameBody {
        FrameBody::Method(Method::new(id, arguments))
    }

    fn open(endpoint: &mut ChannelEndpoint) {
        let (frames, mut rx) = invoke(endpoint, protocol::CHANNEL_OPEN, Arguments::new(), None);
        assert_eq!(frames.len(), 1);
        assert!(rx.try_recv().is_err());
        endpoint
            .on_frame(method(protocol::CHANNEL_OPEN_OK, Arguments::new()))
            .unwrap();
        assert!(rx.try_recv().unwrap().unwrap().is_some());
        assert_eq!(endpoint.state(), ChannelState::Open);
    }

    fn deliver(endpoint: &mut ChannelEndpoint, consumer_tag: &str, tag: u64, body: &'static str) {
        endpoint
            .on_frame(method(
                protocol::BASIC_DELIVER,
                Arguments::new()
                    .with("consumer-tag", consumer_tag)
                    .with("delivery-tag", tag),
            ))
            .unwrap();
        endpoint
            .on_frame(FrameBody::Header(ContentHeader {
                class_id: protocol::class::BASIC,
                weight: 0,
                body_size: body.len() as u64,
                properties: Default::default(),
            }))
            .unwrap();
        endpoint
            .on_frame(FrameBody::Body(bytes::Bytes::from_static(body.as_bytes())))
            .unwrap();
    }

    #[test]
    fn methods_before_open_are_rejected_with_channel_error() {
        let mut endpoint = endpoint();
        let (frames, mut rx) = invoke(
            &mut endpoint,
            protocol::QUEUE_DECLARE,
            Arguments::new().with("queue", "q"),
            None,
        );
        assert!(frames.is_empty());
        let err = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err.reply_code(), Some(constants::CHANNEL_ERROR));
    }

    #[test]
    fn async_methods_are_answered_immediately() {
        let mut endpoint = endpoint();
        open(&mut endpoint);
        let (frames, mut rx) = invoke(
            &mut endpoint,
            protocol::BASIC_PUBLISH,
            Arguments::new().with("routing-key", "q"),
            Some(Content::from("hello")),
        );
        assert_eq!(frames.len(), 3);
        assert_eq!(rx.try_recv().unwrap().unwrap(), None);
    }

    #[test]
    fn no_wait_methods_do_not_wait() {
        let mut endpoint = endpoint();
        open(&mut endpoint);
        let (frames, mut rx) = invoke(
            &mut endpoint,
            protocol::QUEUE_DECLARE,
            Arguments::new().with("queue", "q").with("no-wait", true),
            None,
        );
        assert_eq!(frames.len(), 1);
        assert_eq!(rx.try_recv().unwrap().unwrap(), None);
    }

    #[test]
    fn deliveries_before_queue_reference_are_kept() {
        let mut endpoint = endpoint();
        open(&mut endpoint);
        deliver(&mut endpoint, "ctag", 1, "early");
        let queue = endpoint.queue(Route::Consumer("ctag".into())).unwrap();
        assert_eq!(queue.try_get().unwrap().body(), "early");
    }

    #[test]
    fn delivery_tags_must_increase() {
        let mut endpoint = endpoint();
        open(&mut endpoint);
        deliver(&mut endpoint, "ctag", 2, "a");
        let result = endpoint.on_frame(method(
            protocol::BASIC_DELIVER,
            Arguments::new()
                .with("consumer-tag", "ctag")
                .with("delivery-tag", 2u64),
        ));
        assert!(result.is_ok());
        let result = endpoint.on_frame(FrameBody::Header(ContentHeader {
            class_id: protocol::class::BASIC,
            weight: 0,
            body_size: 0,
            properties: Default::default(),
        }));
        assert_eq!(
            result,
            Err(ProtocolViolation::DeliveryTagOrder { tag: 2, last: 2 })
        );
    }

    #[test]
    fn acks_are_checked_against_unsettled_tags() {
        let mut endpoint = endpoint();
        open(&mut endpoint);
        deliver(&mut endpoint, "ctag", 1, "a");
        deliver(&mut endpoint, "ctag", 2, "b");
        deliver(&mut endpoint, "ctag", 3, "c");

        let (frames, mut rx) = invoke(
            &mut endpoint,
            protocol::BASIC_ACK,
            Arguments::new().with("delivery-tag", 7u64),
            None,
        );
        assert!(frames.is_empty());
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(Error::ProtocolViolation(ProtocolViolation::UnknownDeliveryTag(7)))
        );

        let (frames, _) = invoke(
            &mut endpoint,
            protocol::BASIC_ACK,
            Arguments::new().with("delivery-tag", 2u64).with("multiple", true),
            None,
        );
        assert_eq!(frames.len(), 1);

        // 1 was settled by the multiple ack
        let (frames, mut rx) = invoke(
            &mut endpoint,
            protocol::BASIC_REJECT,
            Arguments::new().with("delivery-tag", 1u64),
            None,
        );
        assert!(frames.is_empty());
        assert!(rx.try_recv().unwrap().is_err());

        let (frames, _) = invoke(
            &mut endpoint,
            protocol::BASIC_NACK,
            Arguments::new().with("delivery-tag", 3u64),
            None,
        );
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn no_ack_deliveries_cannot_be_acked() {
        let mut endpoint = endpoint();
        open(&mut endpoint);
        let (_, mut rx) = invoke(
            &mut endpoint,
            protocol::BASIC_CONSUME,
            Arguments::new().with("queue", "q").with("no-ack", true),
            None,
        );
        endpoint
            .on_frame(method(
                protocol::BASIC_CONSUME_OK,
                Arguments::new().with("consumer-tag", "auto"),
            ))
            .unwrap();
        assert!(rx.try_recv().unwrap().unwrap().is_some());

        deliver(&mut endpoint, "auto", 1, "a");
        let (frames, _) = invoke(
            &mut endpoint,
            protocol::BASIC_ACK,
            Arguments::new().with("delivery-tag", 1u64),
            None,
        );
        assert!(frames.is_empty());
    }

    #[test]
    fn local_flow_holds_and_releases_deliveries() {
        let mut endpoint = endpoint();
        open(&mut endpoint);
        let queue = endpoint.queue(Route::Consumer("ctag".into())).unwrap();
        endpoint.set_local_flow(false).unwrap();
        deliver(&mut endpoint, "ctag", 1, "held");
        assert!(queue.try_get().is_err());
        endpoint.set_local_flow(true).unwrap();
        assert_eq!(queue.try_get().unwrap().body(), "held");
    }

    #[test]
    fn broker_flow_pauses_publishes() {
        let mut endpoint = endpoint();
        open(&mut endpoint);
        let frames = endpoint
            .on_frame(method(
                protocol::CHANNEL_FLOW,
                Arguments::new().with("active", false),
            ))
            .unwrap();
        assert_eq!(frames.len(), 1);

        let (frames, mut rx) = invoke(
            &mut endpoint,
            protocol::BASIC_PUBLISH,
            Arguments::new(),
            Some(Content::from("later")),
        );
        assert!(frames.is_empty());
        assert_eq!(rx.try_recv().unwrap().unwrap(), None);

        let frames = endpoint
            .on_frame(method(
                protocol::CHANNEL_FLOW,
                Arguments::new().with("active", true),
            ))
            .unwrap();
        // flow-ok, then publish, header and body
        assert_eq!(frames.len(), 4);
    }

    #[test]
    fn unexpected_reply_is_a_violation() {
        let mut endpoint = endpoint();
        open(&mut endpoint);
        let result = endpoint.on_frame(method(protocol::QUEUE_DECLARE_OK, Arguments::new()));
        assert_eq!(
            result,
            Err(ProtocolViolation::UnexpectedMethod(protocol::QUEUE_DECLARE_OK))
        );
    }

    #[test]
    fn method_inside_content_is_a_violation() {
        let mut endpoint = endpoint();
        open(&mut endpoint);
        endpoint
            .on_frame(method(
                protocol::BASIC_DELIVER,
                Arguments::new().with("delivery-tag", 1u64),
            ))
            .unwrap();
        let result = endpoint.on_frame(method(protocol::CHANNEL_FLOW, Arguments::new()));
        assert_eq!(
            result,
            Err(ProtocolViolation::ContentInterrupted(protocol::CHANNEL_FLOW))
        );
    }

    #[test]
    fn broker_close_fails_pending_calls_and_queues() {
        let mut endpoint = endpoint();
        open(&mut endpoint);
        let queue = endpoint.queue(Route::Returned).unwrap();
        let (_, mut rx) = invoke(
            &mut endpoint,
            protocol::QUEUE_DECLARE,
            Arguments::new().with("queue", "q").with("passive", true),
            None,
        );

        let reason = CloseReason::new(constants::NOT_FOUND, "no queue 'q'");
        let frames = endpoint
            .on_frame(method(protocol::CHANNEL_CLOSE, reason.to_arguments()))
            .unwrap();
        assert!(matches!(&frames[0].body, FrameBody::Method(m) if m.is(protocol::CHANNEL_CLOSE_OK)));
        assert!(endpoint.is_closed());
        assert_eq!(rx.try_recv().unwrap(), Err(Error::Closed(Some(reason.clone()))));
        assert_eq!(
            queue.try_get(),
            Err(crate::queue::GetError::Closed(Some(reason)))
        );
    }

    #[test]
    fn client_close_waits_for_close_ok() {
        let mut endpoint = endpoint();
        open(&mut endpoint);
        let (frames, mut rx) = invoke(
            &mut endpoint,
            protocol::CHANNEL_CLOSE,
            CloseReason::normal().to_arguments(),
            None,
        );
        assert_eq!(frames.len(), 1);
        assert_eq!(endpoint.state(), ChannelState::Closing);

        // Anything but close-ok is discarded
        assert!(endpoint
            .on_frame(method(protocol::BASIC_QOS_OK, Arguments::new()))
            .unwrap()
            .is_empty());

        let (_, mut late) = invoke(&mut endpoint, protocol::TX_SELECT, Arguments::new(), None);
        assert!(late.try_recv().unwrap().is_err());

        endpoint
            .on_frame(method(protocol::CHANNEL_CLOSE_OK, Arguments::new()))
            .unwrap();
        assert!(endpoint.is_closed());
        assert!(rx.try_recv().unwrap().unwrap().is_some());
    }
}
