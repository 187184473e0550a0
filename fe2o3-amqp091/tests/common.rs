#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use fe2o3_amqp091::{
    connection::Builder,
    frames::{ContentHeader, Frame, FrameBody, FrameCodec},
    types::{
        method::{Method, MethodId},
        primitives::{Arguments, FieldTable},
        protocol::{self, Amqp091},
    },
    ConnectionHandle,
};
use futures_util::{SinkExt, StreamExt};
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};
use tokio::{
    io::{AsyncReadExt, DuplexStream},
    sync::OnceCell,
};
use tokio_util::codec::Framed;

static DOCKER: OnceCell<Cli> = OnceCell::const_new();

pub async fn setup_rabbitmq(username: Option<&str>, password: Option<&str>) -> (Container<'static, GenericImage>, u16) {
    let docker = DOCKER.get_or_init(|| async { Cli::default() }).await;
    let image = match (username, password) {
        (Some(username), Some(password)) => GenericImage::new("docker.io/library/rabbitmq", "3-alpine")
            .with_env_var("RABBITMQ_DEFAULT_USER", username)
            .with_env_var("RABBITMQ_DEFAULT_PASS", password)
            .with_exposed_port(5672)
            .with_wait_for(WaitFor::message_on_stdout("Server startup complete")),
        _ => GenericImage::new("docker.io/library/rabbitmq", "3-alpine")
            .with_exposed_port(5672)
            .with_wait_for(WaitFor::message_on_stdout("Server startup complete")),
    };
    let node = docker.run(image);
    let port = node.get_host_port_ipv4(5672);
    (node, port)
}

/// The broker's end of an in-memory connection
pub struct FakeBroker {
    framed: Framed<DuplexStream, FrameCodec>,
}

pub struct Tune {
    pub channel_max: u16,
    pub frame_max: u32,
    pub heartbeat: u16,
}

impl Default for Tune {
    fn default() -> Self {
        Self {
            channel_max: 2047,
            frame_max: 131_072,
            heartbeat: 0,
        }
    }
}

impl FakeBroker {
    /// Reads the client's protocol header
    pub async fn accept(mut io: DuplexStream) -> Self {
        let mut header = [0u8; 8];
        io.read_exact(&mut header).await.unwrap();
        assert_eq!(&header, b"AMQP\x00\x00\x09\x01");
        let framed = Framed::new(io, FrameCodec::new(Arc::new(Amqp091), 0));
        Self { framed }
    }

    pub async fn send(&mut self, channel: u16, id: MethodId, arguments: Arguments) {
        self.framed
            .send(Frame::method(channel, Method::new(id, arguments)))
            .await
            .unwrap();
    }

    pub async fn send_frame(&mut self, frame: Frame) {
        self.framed.send(frame).await.unwrap();
    }

    /// Sends a content-bearing method with the body in a single frame
    pub async fn send_content(&mut self, channel: u16, id: MethodId, arguments: Arguments, body: &'static [u8]) {
        self.send_content_chunks(channel, id, arguments, FieldTable::new(), &[body])
            .await
    }

    pub async fn send_content_chunks(
        &mut self,
        channel: u16,
        id: MethodId,
        arguments: Arguments,
        properties: FieldTable,
        chunks: &[&'static [u8]],
    ) {
        let body_size = chunks.iter().map(|c| c.len() as u64).sum();
        self.framed
            .feed(Frame::method(channel, Method::new(id, arguments)))
            .await
            .unwrap();
        let header = ContentHeader {
            class_id: id.class_id,
            weight: 0,
            body_size,
            properties,
        };
        self.framed
            .feed(Frame::new(channel, FrameBody::Header(header)))
            .await
            .unwrap();
        for chunk in chunks {
            self.framed
                .feed(Frame::new(channel, FrameBody::Body(Bytes::from_static(chunk))))
                .await
                .unwrap();
        }
        self.framed.flush().await.unwrap();
    }

    pub async fn deliver(&mut self, channel: u16, consumer_tag: &str, delivery_tag: u64, body: &'static [u8]) {
        let arguments = Arguments::new()
            .with("consumer-tag", consumer_tag)
            .with("delivery-tag", delivery_tag)
            .with("exchange", "")
            .with("routing-key", "q");
        self.send_content(channel, protocol::BASIC_DELIVER, arguments, body)
            .await
    }

    /// Next frame, heartbeats included. `None` once the client closed the stream.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        self.framed.next().await.map(|frame| frame.unwrap())
    }

    /// Next non-heartbeat frame
    pub async fn recv(&mut self) -> Frame {
        loop {
            let frame = self.recv_frame().await.expect("client closed the stream");
            if !matches!(frame.body, FrameBody::Heartbeat) {
                return frame;
            }
        }
    }

    pub async fn recv_method(&mut self) -> (u16, Method) {
        let frame = self.recv().await;
        match frame.body {
            FrameBody::Method(method) => (frame.channel, method),
            body => panic!("expecting a method, found {:?}", body),
        }
    }

    pub async fn expect(&mut self, id: MethodId) -> (u16, Method) {
        let (channel, method) = self.recv_method().await;
        assert_eq!(method.id, id, "unexpected {:?}", method);
        (channel, method)
    }

    pub async fn start(&mut self, mechanisms: &str) {
        let arguments = Arguments::new()
            .with("version-major", 0u8)
            .with("version-minor", 9u8)
            .with("server-properties", FieldTable::new().with("product", "fake"))
            .with("mechanisms", mechanisms)
            .with("locales", "en_US");
        self.send(0, protocol::CONNECTION_START, arguments).await;
    }

    pub async fn handshake(&mut self, tune: Tune) {
        self.start("PLAIN AMQPLAIN").await;
        let (_, start_ok) = self.expect(protocol::CONNECTION_START_OK).await;
        assert_eq!(start_ok.arguments.get_str("mechanism"), Some("PLAIN"));

        let arguments = Arguments::new()
            .with("channel-max", tune.channel_max)
            .with("frame-max", tune.frame_max)
            .with("heartbeat", tune.heartbeat);
        self.send(0, protocol::CONNECTION_TUNE, arguments).await;
        self.expect(protocol::CONNECTION_TUNE_OK).await;
        self.expect(protocol::CONNECTION_OPEN).await;
        self.send(0, protocol::CONNECTION_OPEN_OK, Arguments::new())
            .await;
    }

    /// Answers `channel.open`
    pub async fn open_channel(&mut self) -> u16 {
        let (channel, _) = self.expect(protocol::CHANNEL_OPEN).await;
        self.send(channel, protocol::CHANNEL_OPEN_OK, Arguments::new())
            .await;
        channel
    }

    /// Answers `basic.consume` with `consumer_tag`
    pub async fn consume_ok(&mut self, consumer_tag: &str) -> Method {
        let (channel, consume) = self.expect(protocol::BASIC_CONSUME).await;
        self.send(
            channel,
            protocol::BASIC_CONSUME_OK,
            Arguments::new().with("consumer-tag", consumer_tag),
        )
        .await;
        consume
    }
}

/// Opens a connection to a fake broker over an in-memory stream
pub async fn connect(builder: Builder, tune: Tune) -> (ConnectionHandle, FakeBroker) {
    let (client, server) = tokio::io::duplex(256 * 1024);
    let broker = tokio::spawn(async move {
        let mut broker = FakeBroker::accept(server).await;
        broker.handshake(tune).await;
        broker
    });
    let connection = builder.open_with_stream(client).await.unwrap();
    let broker = broker.await.unwrap();
    (connection, broker)
}
