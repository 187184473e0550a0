//! The engine owns the transport and every channel's state. Handles talk to it through the
//! control channel; frames from the broker are dispatched to channels here.

use std::{pin::Pin, sync::Arc, time::Duration};

use fe2o3_amqp091_types::{
    constants::{self, FRAME_MIN_SIZE},
    method::{Method, MethodId},
    primitives::Arguments,
    protocol,
};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc::Receiver,
    task::JoinHandle,
    time::Sleep,
};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    auth::SaslProfile,
    channel,
    control::ConnectionControl,
    error::{CloseReason, ProtocolViolation},
    frames::{Frame, FrameBody},
    transport::{self, protocol_header::ProtocolHeader, Transport},
    util::{negotiate, Running},
};

use super::{
    heartbeat::HeartBeat, AllocChannelError, Builder, Connection, ConnectionState, Error,
    OpenError, Shared, Tune,
};

pub(crate) struct ConnectionEngine<Io> {
    transport: Transport<Io>,
    connection: Connection,
    control: Receiver<ConnectionControl>,
    control_closed: bool,
    heartbeat: HeartBeat,
    close_timeout: Duration,
    close_deadline: Option<Pin<Box<Sleep>>>,
    shared: Arc<Shared>,
}

impl<Io> ConnectionEngine<Io>
where
    Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Runs the opening handshake without starting the event loop
    pub(crate) async fn open(
        mut io: Io,
        builder: &Builder,
        control: Receiver<ConnectionControl>,
        shared: Arc<Shared>,
    ) -> Result<Self, OpenError> {
        Transport::send_proto_header(&mut io, ProtocolHeader::amqp091()).await?;

        // Frames up to the protocol minimum are always allowed before tuning
        let max_frame_size = match builder.frame_max {
            0 => 0,
            n => n.max(FRAME_MIN_SIZE) as usize,
        };
        let transport = Transport::bind(io, builder.method_table.clone(), max_frame_size, None);
        let requested = Tune {
            channel_max: builder.channel_max,
            frame_max: builder.frame_max,
            heartbeat: builder.heartbeat,
        };

        let mut engine = Self {
            transport,
            connection: Connection::new(builder.method_table.clone(), requested),
            control,
            control_closed: false,
            heartbeat: HeartBeat::never(),
            close_timeout: builder.close_timeout,
            close_deadline: None,
            shared,
        };

        let sasl = builder.sasl_profile.clone().unwrap_or_default();
        engine.handshake(builder, &sasl).await?;
        Ok(engine)
    }

    pub(crate) fn tune(&self) -> Tune {
        self.connection.tune
    }

    pub(crate) fn spawn(self) -> JoinHandle<Result<(), Error>> {
        tokio::spawn(self.event_loop())
    }

    async fn handshake(&mut self, builder: &Builder, sasl: &SaslProfile) -> Result<(), OpenError> {
        let start = self.expect_method(protocol::CONNECTION_START).await?;
        let major = start.arguments.get_u64("version-major").unwrap_or_default();
        let minor = start.arguments.get_u64("version-minor").unwrap_or_default();
        if major != constants::MAJOR as u64 || minor != constants::MINOR as u64 {
            return Err(OpenError::VersionMismatch { major, minor });
        }
        let mechanisms = start.arguments.get_str("mechanisms").unwrap_or_default();
        if !sasl.is_offered(mechanisms) {
            return Err(OpenError::MechanismNotSupported {
                mechanism: sasl.mechanism(),
                offered: mechanisms.to_string(),
            });
        }
        debug!(
            server_properties = ?start.arguments.get_table("server-properties"),
            mechanism = sasl.mechanism(),
            "connection.start"
        );

        let response = sasl.response()?;
        let start_ok = Arguments::new()
            .with("client-properties", builder.client_properties.clone())
            .with("mechanism", sasl.mechanism())
            .with("response", response.clone())
            .with("locale", builder.locale.as_str());
        self.send_method(protocol::CONNECTION_START_OK, start_ok).await?;

        // Every challenge is answered with the same response
        let tune = loop {
            let method = self.recv_handshake_method().await?;
            match method.id {
                protocol::CONNECTION_SECURE => {
                    let secure_ok = Arguments::new().with("response", response.clone());
                    self.send_method(protocol::CONNECTION_SECURE_OK, secure_ok)
                        .await?;
                }
                protocol::CONNECTION_TUNE => break method,
                id => return Err(OpenError::UnexpectedMethod(id)),
            }
        };

        let offered = &tune.arguments;
        let requested = self.connection.tune;
        let tune = Tune {
            channel_max: negotiate(
                requested.channel_max,
                offered.get_u64("channel-max").unwrap_or_default() as u16,
            ),
            frame_max: negotiate(
                requested.frame_max,
                offered.get_u64("frame-max").unwrap_or_default() as u32,
            ),
            heartbeat: negotiate(
                requested.heartbeat,
                offered.get_u64("heartbeat").unwrap_or_default() as u16,
            ),
        };
        debug!(?tune, "connection.tune");
        let tune_ok = Arguments::new()
            .with("channel-max", tune.channel_max)
            .with("frame-max", tune.frame_max)
            .with("heartbeat", tune.heartbeat);
        self.send_method(protocol::CONNECTION_TUNE_OK, tune_ok).await?;
        self.apply_tune(tune);

        let open = Arguments::new().with("virtual-host", builder.virtual_host.as_str());
        self.send_method(protocol::CONNECTION_OPEN, open).await?;
        self.expect_method(protocol::CONNECTION_OPEN_OK).await?;

        info!(vhost = %builder.virtual_host, "Connection opened");
        self.connection.set_state(ConnectionState::Open);
        Ok(())
    }

    fn apply_tune(&mut self, tune: Tune) {
        self.connection.set_tune(tune);
        self.transport.set_max_frame_size(tune.frame_max as usize);
        if tune.heartbeat > 0 {
            let period = Duration::from_secs(tune.heartbeat as u64);
            self.heartbeat = HeartBeat::new(period);
            self.transport.set_idle_timeout(period * 2);
        }
    }

    /// Next method on channel 0. A `connection.close` from the broker ends the handshake.
    async fn recv_handshake_method(&mut self) -> Result<Method, OpenError> {
        loop {
            let frame = match self.transport.next().await {
                Some(frame) => frame?,
                None => return Err(OpenError::ConnectionClosed),
            };
            trace!(channel = frame.channel, frame = ?frame.body, "RECV");
            match (frame.channel, frame.body) {
                (_, FrameBody::Heartbeat) => continue,
                (0, FrameBody::Method(method)) if method.is(protocol::CONNECTION_CLOSE) => {
                    let reason = CloseReason::from_arguments(&method.arguments);
                    warn!(%reason, "Connection rejected");
                    let _ = self
                        .send_method(protocol::CONNECTION_CLOSE_OK, Arguments::new())
                        .await;
                    return Err(OpenError::Rejected(reason));
                }
                (0, FrameBody::Method(method)) => return Ok(method),
                (channel, body) => {
                    return Err(ProtocolViolation::UnexpectedFrame {
                        channel,
                        kind: body.kind(),
                    }
                    .into())
                }
            }
        }
    }

    async fn expect_method(&mut self, id: MethodId) -> Result<Method, OpenError> {
        let method = self.recv_handshake_method().await?;
        match method.is(id) {
            true => Ok(method),
            false => Err(OpenError::UnexpectedMethod(method.id)),
        }
    }

    async fn send_method(&mut self, id: MethodId, arguments: Arguments) -> Result<(), transport::Error> {
        self.send_frame(Frame::method(0, Method::new(id, arguments)))
            .await
    }

    #[instrument(name = "SEND", skip_all)]
    async fn send_frame(&mut self, frame: Frame) -> Result<(), transport::Error> {
        trace!(channel = frame.channel, frame = ?frame.body);
        self.transport.send(frame).await?;
        self.heartbeat.reset();
        Ok(())
    }

    /// Sends frames back to back with a single flush, so that a method and its content are
    /// never interleaved with anything else
    #[instrument(name = "SEND", skip_all)]
    async fn send_frames(&mut self, frames: Vec<Frame>) -> Result<(), transport::Error> {
        if frames.is_empty() {
            return Ok(());
        }
        for frame in frames {
            trace!(channel = frame.channel, frame = ?frame.body);
            self.transport.feed(frame).await?;
        }
        self.transport.flush().await?;
        self.heartbeat.reset();
        Ok(())
    }
}

impl<Io> ConnectionEngine<Io>
where
    Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    #[instrument(name = "RECV", skip_all)]
    async fn on_incoming(
        &mut self,
        incoming: Result<Frame, transport::Error>,
    ) -> Result<Running, Error> {
        let Frame { channel, body } = incoming?;
        trace!(channel, frame = ?body);

        if channel == 0 {
            return self.on_connection_frame(body).await;
        }

        if self.connection.state() != ConnectionState::Open {
            trace!(channel, "Discarding frame while closing");
            return Ok(Running::Continue);
        }

        let endpoint = self
            .connection
            .channel_mut(channel)
            .ok_or(ProtocolViolation::UnknownChannel(channel))?;
        let frames = endpoint.on_frame(body)?;
        self.connection.remove_if_closed(channel);
        self.send_frames(frames).await?;
        Ok(Running::Continue)
    }

    async fn on_connection_frame(&mut self, body: FrameBody) -> Result<Running, Error> {
        let method = match body {
            FrameBody::Heartbeat => return Ok(Running::Continue),
            FrameBody::Method(method) => method,
            body => {
                return Err(ProtocolViolation::UnexpectedFrame {
                    channel: 0,
                    kind: body.kind(),
                }
                .into())
            }
        };

        match method.id {
            protocol::CONNECTION_CLOSE => {
                let reason = CloseReason::from_arguments(&method.arguments);
                self.send_method(protocol::CONNECTION_CLOSE_OK, Arguments::new())
                    .await?;
                let crossed = self.connection.state() == ConnectionState::Closing;
                self.connection.set_state(ConnectionState::Closed);
                match crossed {
                    true => Ok(Running::Stop),
                    false => {
                        warn!(%reason, "Connection closed by broker");
                        Err(Error::Remote(reason))
                    }
                }
            }
            protocol::CONNECTION_CLOSE_OK if self.connection.state() == ConnectionState::Closing => {
                self.connection.set_state(ConnectionState::Closed);
                Ok(Running::Stop)
            }
            protocol::CONNECTION_BLOCKED => {
                let reason = method.arguments.get_str("reason").unwrap_or_default();
                warn!(reason, "Connection blocked by broker");
                self.shared.set_blocked(Some(reason.to_string()));
                Ok(Running::Continue)
            }
            protocol::CONNECTION_UNBLOCKED => {
                info!("Connection unblocked");
                self.shared.set_blocked(None);
                Ok(Running::Continue)
            }
            id => Err(ProtocolViolation::UnexpectedMethod(id).into()),
        }
    }

    async fn on_control(&mut self, control: ConnectionControl) -> Result<Running, Error> {
        if self.connection.state() != ConnectionState::Open {
            self.reject_control(control);
            return Ok(Running::Continue);
        }

        match control {
            ConnectionControl::AllocateChannel { id, responder } => {
                let result = self.connection.allocate_channel(id);
                let _ = responder.send(result);
            }
            ConnectionControl::Invoke {
                channel,
                generation,
                method,
                content,
                responder,
            } => {
                let frames = match self.connection.registered_mut(channel, generation) {
                    Some(endpoint) => endpoint.on_outgoing(method, content, responder),
                    None => {
                        let _ = responder.send(Err(channel::Error::not_open(channel)));
                        return Ok(Running::Continue);
                    }
                };
                self.connection.remove_if_closed(channel);
                self.send_frames(frames).await?;
            }
            ConnectionControl::CloseChannel {
                channel,
                reason,
                responder,
            } => {
                let frames = match self.connection.channel_mut(channel) {
                    Some(endpoint) => endpoint.on_close_request(reason, responder),
                    None => {
                        let _ = responder.send(Err(channel::Error::not_open(channel)));
                        return Ok(Running::Continue);
                    }
                };
                self.connection.remove_if_closed(channel);
                self.send_frames(frames).await?;
            }
            ConnectionControl::Queue {
                channel,
                generation,
                route,
                responder,
            } => {
                let result = match self.connection.registered_mut(channel, generation) {
                    Some(endpoint) => endpoint.queue(route),
                    None => Err(channel::Error::not_open(channel)),
                };
                let _ = responder.send(result);
            }
            ConnectionControl::LocalFlow {
                channel,
                generation,
                active,
                responder,
            } => {
                let result = match self.connection.registered_mut(channel, generation) {
                    Some(endpoint) => endpoint.set_local_flow(active),
                    None => Err(channel::Error::not_open(channel)),
                };
                let _ = responder.send(result);
            }
            ConnectionControl::Close(reason) => {
                self.send_close(reason.unwrap_or_else(CloseReason::normal))
                    .await?;
            }
        }
        Ok(Running::Continue)
    }

    /// Answers a control that arrived after the connection left `Open`
    fn reject_control(&self, control: ConnectionControl) {
        let closed = || channel::Error::Closed(self.shared.close_reason());
        match control {
            ConnectionControl::AllocateChannel { responder, .. } => {
                let _ = responder.send(Err(AllocChannelError::ConnectionClosed));
            }
            ConnectionControl::Invoke { responder, .. }
            | ConnectionControl::CloseChannel { responder, .. } => {
                let _ = responder.send(Err(closed()));
            }
            ConnectionControl::Queue { responder, .. } => {
                let _ = responder.send(Err(closed()));
            }
            ConnectionControl::LocalFlow { responder, .. } => {
                let _ = responder.send(Err(closed()));
            }
            ConnectionControl::Close(_) => {}
        }
    }

    async fn send_close(&mut self, reason: CloseReason) -> Result<(), Error> {
        debug!(%reason, "Closing connection");
        self.shared.set_close_reason(Some(reason.clone()));
        self.connection.set_state(ConnectionState::Closing);
        self.close_deadline = Some(Box::pin(tokio::time::sleep(self.close_timeout)));
        self.send_method(protocol::CONNECTION_CLOSE, reason.to_arguments())
            .await?;
        Ok(())
    }

    async fn on_heartbeat(&mut self) -> Result<Running, Error> {
        match self.connection.state() {
            ConnectionState::Open | ConnectionState::Closing => {
                self.send_frame(Frame::heartbeat()).await?;
                Ok(Running::Continue)
            }
            ConnectionState::Connecting => Ok(Running::Continue),
            ConnectionState::Closed => Ok(Running::Stop),
        }
    }

    async fn event_loop(mut self) -> Result<(), Error> {
        let outcome = loop {
            let result = tokio::select! {
                _ = self.heartbeat.next() => self.on_heartbeat().await,
                incoming = self.transport.next() => {
                    match incoming {
                        Some(incoming) => self.on_incoming(incoming).await,
                        None => Err(Error::TransportClosed),
                    }
                },
                control = self.control.recv(), if !self.control_closed => {
                    match control {
                        Some(control) => self.on_control(control).await,
                        None => {
                            // Every handle is gone
                            self.control_closed = true;
                            self.on_control(ConnectionControl::Close(None)).await
                        }
                    }
                },
                _ = close_deadline(&mut self.close_deadline) => Err(Error::CloseTimeout),
            };

            match result {
                Ok(Running::Continue) => {}
                Ok(Running::Stop) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        self.teardown(&outcome).await;
        outcome
    }

    /// Fails every channel and every queued control, then shuts the transport down
    async fn teardown(&mut self, outcome: &Result<(), Error>) {
        let reason = match outcome {
            Ok(()) => {
                debug!("Connection closed");
                self.shared.close_reason()
            }
            Err(Error::ProtocolViolation(violation)) => {
                error!(%violation, "Protocol violation");
                let reason = violation.close_reason();
                if self.connection.state() == ConnectionState::Open {
                    // Best effort, the engine stops either way
                    let _ = self
                        .send_method(protocol::CONNECTION_CLOSE, reason.to_arguments())
                        .await;
                }
                Some(reason)
            }
            Err(err) => {
                error!(?err, "Connection engine stopped");
                err.close_reason().or_else(|| self.shared.close_reason())
            }
        };

        self.connection.set_state(ConnectionState::Closed);
        self.shared.set_close_reason(reason.clone());
        self.connection.close_channels(reason);

        self.control.close();
        while let Ok(control) = self.control.try_recv() {
            self.reject_control(control);
        }

        let _ = tokio::time::timeout(self.close_timeout, self.transport.close()).await;
    }
}

async fn close_deadline(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
