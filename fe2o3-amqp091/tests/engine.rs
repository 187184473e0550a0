//! Tests the connection engine against a scripted broker

use std::time::Duration;

use fe2o3_amqp091::{
    channel::{self, FlowMode},
    connection::{Builder, OpenError},
    error::{CloseReason, ProtocolViolation},
    frames::FrameBody,
    queue::GetError,
    types::{constants, primitives::Arguments, protocol},
    Content,
};

mod common;

use common::{connect, FakeBroker, Tune};

#[tokio::test]
async fn consume_ack_and_order() {
    let (mut connection, mut broker) = connect(Builder::new(), Tune::default()).await;

    let (channel, _) = tokio::join!(connection.open_channel(1), broker.open_channel());
    let channel = channel.unwrap();

    let (tag, consume) = tokio::join!(
        channel.basic_consume("q", "", Arguments::new()),
        broker.consume_ok("amq.ctag-1")
    );
    let tag = tag.unwrap();
    assert_eq!(tag, "amq.ctag-1");
    assert_eq!(consume.arguments.get_str("queue"), Some("q"));

    broker.deliver(1, &tag, 1, b"first").await;
    broker.deliver(1, &tag, 2, b"second").await;

    let queue = channel.queue(&tag).await.unwrap();
    let first = queue.recv().await.unwrap();
    let second = queue.recv().await.unwrap();
    assert_eq!(first.body(), &b"first"[..]);
    assert_eq!(first.delivery_tag(), Some(1));
    assert_eq!(second.body(), &b"second"[..]);

    channel.basic_ack(2, true).await.unwrap();
    let (ch, ack) = broker.expect(protocol::BASIC_ACK).await;
    assert_eq!(ch, 1);
    assert_eq!(ack.arguments.get_u64("delivery-tag"), Some(2));
    assert_eq!(ack.arguments.get_bool("multiple"), Some(true));

    let (closed, _) = tokio::join!(connection.close(), async {
        broker.expect(protocol::CONNECTION_CLOSE).await;
        broker
            .send(0, protocol::CONNECTION_CLOSE_OK, Arguments::new())
            .await;
    });
    closed.unwrap();
}

#[tokio::test]
async fn publish_is_split_into_frames() {
    let tune = Tune {
        frame_max: 4096,
        ..Default::default()
    };
    let (connection, mut broker) = connect(Builder::new().frame_max(4096), tune).await;
    let (channel, _) = tokio::join!(connection.open_channel(1), broker.open_channel());
    let channel = channel.unwrap();

    let body = vec![7u8; 10_000];
    let content = Content::new(body).with_property("content-type", "application/octet-stream");
    channel
        .basic_publish("amq.direct", "key", content, Arguments::new().with("mandatory", true))
        .await
        .unwrap();

    let (_, publish) = broker.expect(protocol::BASIC_PUBLISH).await;
    assert_eq!(publish.arguments.get_str("routing-key"), Some("key"));
    assert_eq!(publish.arguments.get_bool("mandatory"), Some(true));

    match broker.recv().await.body {
        FrameBody::Header(header) => {
            assert_eq!(header.body_size, 10_000);
            assert_eq!(
                header.properties.get_str("content-type"),
                Some("application/octet-stream")
            );
        }
        body => panic!("expecting a content header, found {:?}", body),
    }
    let mut sizes = Vec::new();
    while sizes.iter().sum::<usize>() < 10_000 {
        match broker.recv().await.body {
            FrameBody::Body(bytes) => sizes.push(bytes.len()),
            body => panic!("expecting a body frame, found {:?}", body),
        }
    }
    assert_eq!(sizes, vec![4088, 4088, 1824]);
}

#[tokio::test]
async fn deliveries_arriving_in_several_body_frames_are_assembled() {
    let (connection, mut broker) = connect(Builder::new(), Tune::default()).await;
    let (channel, _) = tokio::join!(connection.open_channel(1), broker.open_channel());
    let channel = channel.unwrap();

    let arguments = Arguments::new()
        .with("consumer-tag", "c")
        .with("delivery-tag", 1u64)
        .with("exchange", "")
        .with("routing-key", "q");
    broker
        .send_content_chunks(
            1,
            protocol::BASIC_DELIVER,
            arguments,
            Default::default(),
            &[b"hel", b"lo ", b"world"],
        )
        .await;

    // The queue is referenced after the delivery arrived
    let queue = channel.queue("c").await.unwrap();
    let message = queue.get(Duration::from_secs(5)).await.unwrap();
    assert_eq!(message.body(), &b"hello world"[..]);
    assert_eq!(message.consumer_tag(), Some("c"));
}

#[tokio::test]
async fn unknown_delivery_tag_is_rejected_locally() {
    let (connection, mut broker) = connect(Builder::new(), Tune::default()).await;
    let (channel, _) = tokio::join!(connection.open_channel(1), broker.open_channel());
    let channel = channel.unwrap();

    let result = channel.basic_ack(42, false).await;
    assert_eq!(
        result,
        Err(channel::Error::ProtocolViolation(
            ProtocolViolation::UnknownDeliveryTag(42)
        ))
    );

    // Nothing was sent for the ack; the next frame is the qos
    let (qos, _) = tokio::join!(channel.basic_qos(0, 10, false), async {
        let (ch, qos) = broker.expect(protocol::BASIC_QOS).await;
        assert_eq!(qos.arguments.get_u64("prefetch-count"), Some(10));
        broker.send(ch, protocol::BASIC_QOS_OK, Arguments::new()).await;
    });
    qos.unwrap();
}

#[tokio::test]
async fn client_flow_holds_deliveries_until_resumed() {
    let builder = Builder::new().flow_mode(FlowMode::Client);
    let (connection, mut broker) = connect(builder, Tune::default()).await;
    let (channel, _) = tokio::join!(connection.open_channel(1), broker.open_channel());
    let channel = channel.unwrap();

    let (tag, _) = tokio::join!(
        channel.basic_consume("q", "c", Arguments::new()),
        broker.consume_ok("c")
    );
    let queue = channel.queue(&tag.unwrap()).await.unwrap();

    channel.set_flow(false).await.unwrap();
    broker.deliver(1, "c", 1, b"held").await;
    assert_eq!(
        queue.get(Duration::from_millis(200)).await,
        Err(GetError::Empty)
    );

    channel.set_flow(true).await.unwrap();
    let message = queue.get(Duration::from_secs(5)).await.unwrap();
    assert_eq!(message.body(), &b"held"[..]);
}

#[tokio::test]
async fn broker_flow_mode_sends_channel_flow() {
    let (connection, mut broker) = connect(Builder::new(), Tune::default()).await;
    let (channel, _) = tokio::join!(connection.open_channel(1), broker.open_channel());
    let channel = channel.unwrap();

    let (tag, _) = tokio::join!(
        channel.basic_consume("q", "c", Arguments::new()),
        broker.consume_ok("c")
    );
    let queue = channel.queue(&tag.unwrap()).await.unwrap();

    let (result, _) = tokio::join!(channel.set_flow(false), async {
        let (ch, flow) = broker.expect(protocol::CHANNEL_FLOW).await;
        assert_eq!(flow.arguments.get_bool("active"), Some(false));
        // A delivery that was already in flight
        broker.deliver(ch, "c", 1, b"in flight").await;
        broker
            .send(ch, protocol::CHANNEL_FLOW_OK, Arguments::new().with("active", false))
            .await;
    });
    result.unwrap();
    assert_eq!(queue.try_get(), Err(GetError::Empty));

    let (result, _) = tokio::join!(channel.set_flow(true), async {
        let (ch, _) = broker.expect(protocol::CHANNEL_FLOW).await;
        broker
            .send(ch, protocol::CHANNEL_FLOW_OK, Arguments::new().with("active", true))
            .await;
    });
    result.unwrap();
    let message = queue.get(Duration::from_secs(5)).await.unwrap();
    assert_eq!(message.body(), &b"in flight"[..]);
}

#[tokio::test]
async fn unopened_channel_answers_with_channel_error() {
    let (connection, _broker) = connect(Builder::new(), Tune::default()).await;

    let channel = connection.channel(200).await.unwrap();
    let err = channel
        .queue_declare("q", Arguments::new())
        .await
        .unwrap_err();
    assert_eq!(err.reply_code(), Some(constants::CHANNEL_ERROR));

    // Closing a channel that was never opened does not involve the broker
    connection
        .close_channel(200, CloseReason::normal())
        .await
        .unwrap();
    let err = channel.invoke("tx.select", Arguments::new()).await.unwrap_err();
    assert_eq!(err.reply_code(), Some(constants::CHANNEL_ERROR));
}

#[tokio::test]
async fn broker_channel_close_fails_the_pending_call() {
    let (connection, mut broker) = connect(Builder::new(), Tune::default()).await;
    let (channel, _) = tokio::join!(connection.open_channel(1), broker.open_channel());
    let channel = channel.unwrap();

    let (result, _) = tokio::join!(
        channel.queue_declare("missing", Arguments::new().with("passive", true)),
        async {
            let (ch, _) = broker.expect(protocol::QUEUE_DECLARE).await;
            let reason = CloseReason::new(constants::NOT_FOUND, "NOT_FOUND - no queue 'missing'")
                .with_method(protocol::QUEUE_DECLARE);
            broker.send(ch, protocol::CHANNEL_CLOSE, reason.to_arguments()).await;
            broker.expect(protocol::CHANNEL_CLOSE_OK).await;
        }
    );
    let err = result.unwrap_err();
    assert_eq!(err.reply_code(), Some(constants::NOT_FOUND));

    // The channel is gone; further calls fail without reaching the broker
    let err = channel.basic_qos(0, 1, false).await.unwrap_err();
    assert_eq!(err.reply_code(), Some(constants::CHANNEL_ERROR));

    // and its id can be used again
    let (reopened, _) = tokio::join!(connection.open_channel(1), broker.open_channel());
    reopened.unwrap();
}

#[tokio::test]
async fn basic_get_returns_a_message_or_none() {
    let (connection, mut broker) = connect(Builder::new(), Tune::default()).await;
    let (channel, _) = tokio::join!(connection.open_channel(1), broker.open_channel());
    let channel = channel.unwrap();

    let (message, _) = tokio::join!(channel.basic_get("q", false), async {
        let (ch, _) = broker.expect(protocol::BASIC_GET).await;
        let arguments = Arguments::new()
            .with("delivery-tag", 1u64)
            .with("exchange", "")
            .with("routing-key", "q")
            .with("message-count", 0u32);
        broker
            .send_content(ch, protocol::BASIC_GET_OK, arguments, b"got")
            .await;
    });
    let message = message.unwrap().unwrap();
    assert_eq!(message.body(), &b"got"[..]);

    let (empty, _) = tokio::join!(channel.basic_get("q", false), async {
        let (ch, _) = broker.expect(protocol::BASIC_GET).await;
        broker.send(ch, protocol::BASIC_GET_EMPTY, Arguments::new()).await;
    });
    assert!(empty.unwrap().is_none());

    // The fetched message can be acknowledged
    channel.basic_ack(1, false).await.unwrap();
    broker.expect(protocol::BASIC_ACK).await;
}

#[tokio::test]
async fn returned_messages_have_their_own_queue() {
    let (connection, mut broker) = connect(Builder::new(), Tune::default()).await;
    let (channel, _) = tokio::join!(connection.open_channel(1), broker.open_channel());
    let channel = channel.unwrap();

    let arguments = Arguments::new()
        .with("reply-code", constants::NO_ROUTE)
        .with("reply-text", "NO_ROUTE")
        .with("exchange", "amq.direct")
        .with("routing-key", "nowhere");
    broker
        .send_content(1, protocol::BASIC_RETURN, arguments, b"bounced")
        .await;

    let returned = channel.returned().await.unwrap();
    let message = returned.get(Duration::from_secs(5)).await.unwrap();
    assert_eq!(message.return_reason(), Some((constants::NO_ROUTE, "NO_ROUTE")));
    assert_eq!(message.body(), &b"bounced"[..]);
}

#[tokio::test]
async fn broker_connection_close_fails_everything() {
    let (mut connection, mut broker) = connect(Builder::new(), Tune::default()).await;
    let (channel, _) = tokio::join!(connection.open_channel(1), broker.open_channel());
    let channel = channel.unwrap();
    let (tag, _) = tokio::join!(
        channel.basic_consume("q", "c", Arguments::new()),
        broker.consume_ok("c")
    );
    let queue = channel.queue(&tag.unwrap()).await.unwrap();

    let (result, _) = tokio::join!(channel.tx_select(), async {
        broker.expect(protocol::TX_SELECT).await;
        let reason = CloseReason::new(constants::CONNECTION_FORCED, "shutdown");
        broker.send(0, protocol::CONNECTION_CLOSE, reason.to_arguments()).await;
        broker.expect(protocol::CONNECTION_CLOSE_OK).await;
    });
    let err = result.unwrap_err();
    assert_eq!(err.reply_code(), Some(constants::CONNECTION_FORCED));

    match queue.recv().await {
        Err(GetError::Closed(Some(reason))) => assert_eq!(reason.reply_code, constants::CONNECTION_FORCED),
        other => panic!("unexpected {:?}", other),
    }

    match connection.on_close().await {
        Err(fe2o3_amqp091::connection::Error::Remote(reason)) => {
            assert_eq!(reason.reply_code, constants::CONNECTION_FORCED)
        }
        other => panic!("unexpected {:?}", other),
    }
    let err = channel.basic_qos(0, 1, false).await.unwrap_err();
    assert_eq!(err.reply_code(), Some(constants::CONNECTION_FORCED));
}

#[tokio::test]
async fn frame_on_unknown_channel_is_fatal() {
    let (mut connection, mut broker) = connect(Builder::new(), Tune::default()).await;
    broker
        .send(9, protocol::CHANNEL_OPEN_OK, Arguments::new())
        .await;

    let (_, close) = broker.expect(protocol::CONNECTION_CLOSE).await;
    assert_eq!(
        close.arguments.get_u64("reply-code"),
        Some(constants::CHANNEL_ERROR as u64)
    );
    match connection.on_close().await {
        Err(fe2o3_amqp091::connection::Error::ProtocolViolation(violation)) => {
            assert_eq!(violation, ProtocolViolation::UnknownChannel(9))
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn heartbeat_is_sent_on_a_silent_connection() {
    let tune = Tune {
        heartbeat: 5,
        ..Default::default()
    };
    let (connection, mut broker) = connect(Builder::new().heartbeat(5), tune).await;
    let frame = broker.recv_frame().await.unwrap();
    assert_eq!(frame.channel, 0);
    assert!(matches!(frame.body, FrameBody::Heartbeat));
    assert_eq!(connection.tune().heartbeat, 5);
}

#[tokio::test(start_paused = true)]
async fn silent_broker_times_out() {
    let tune = Tune {
        heartbeat: 1,
        ..Default::default()
    };
    let (mut connection, _broker) = connect(Builder::new().heartbeat(1), tune).await;
    assert!(matches!(
        connection.on_close().await,
        Err(fe2o3_amqp091::connection::Error::IdleTimeout)
    ));
}

#[tokio::test]
async fn handshake_rejected_by_broker() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let broker = tokio::spawn(async move {
        let mut broker = FakeBroker::accept(server).await;
        broker.start("PLAIN").await;
        broker.expect(protocol::CONNECTION_START_OK).await;
        let reason = CloseReason::new(constants::ACCESS_REFUSED, "ACCESS_REFUSED - Login was refused");
        broker
            .send(0, protocol::CONNECTION_CLOSE, reason.to_arguments())
            .await;
        broker.expect(protocol::CONNECTION_CLOSE_OK).await;
    });

    let result = Builder::new().open_with_stream(client).await;
    match result {
        Err(OpenError::Rejected(reason)) => assert_eq!(reason.reply_code, constants::ACCESS_REFUSED),
        other => panic!("unexpected {:?}", other),
    }
    broker.await.unwrap();
}

#[tokio::test]
async fn mechanism_must_be_offered() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let _broker = tokio::spawn(async move {
        let mut broker = FakeBroker::accept(server).await;
        broker.start("EXTERNAL").await;
        std::future::pending::<()>().await
    });

    let result = Builder::new().open_with_stream(client).await;
    assert!(matches!(
        result,
        Err(OpenError::MechanismNotSupported { mechanism: "PLAIN", .. })
    ));
}

#[tokio::test]
async fn protocol_header_mismatch_is_reported() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let broker = tokio::spawn(async move {
        let mut header = [0u8; 8];
        server.read_exact(&mut header).await.unwrap();
        server.write_all(b"AMQP\x00\x00\x09\x00").await.unwrap();
        server
    });

    let result = Builder::new().open_with_stream(client).await;
    match result {
        Err(OpenError::ProtocolHeaderMismatch(header)) => assert_eq!(&header, b"AMQP\x00\x00\x09\x00"),
        other => panic!("unexpected {:?}", other),
    }
    let _server = broker.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn handshake_times_out() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let _broker = tokio::spawn(async move {
        let _broker = FakeBroker::accept(server).await;
        std::future::pending::<()>().await
    });

    let result = Builder::new()
        .handshake_timeout(Duration::from_secs(3))
        .open_with_stream(client)
        .await;
    assert!(matches!(result, Err(OpenError::Timeout)));
}

#[tokio::test]
async fn closed_channel_rejects_calls() {
    let (connection, mut broker) = connect(Builder::new(), Tune::default()).await;
    let (channel, _) = tokio::join!(connection.open_channel(1), broker.open_channel());
    let channel = channel.unwrap();

    let (closed, _) = tokio::join!(channel.close(CloseReason::normal()), async {
        let (ch, close) = broker.expect(protocol::CHANNEL_CLOSE).await;
        assert_eq!(
            close.arguments.get_u64("reply-code"),
            Some(constants::REPLY_SUCCESS as u64)
        );
        broker.send(ch, protocol::CHANNEL_CLOSE_OK, Arguments::new()).await;
    });
    closed.unwrap();

    let err = channel
        .queue_declare("q", Arguments::new())
        .await
        .unwrap_err();
    assert_eq!(err.reply_code(), Some(constants::CHANNEL_ERROR));
}

#[tokio::test]
async fn handle_of_a_closed_channel_does_not_reach_its_successor() {
    let (connection, mut broker) = connect(Builder::new(), Tune::default()).await;
    let (old, _) = tokio::join!(connection.open_channel(1), broker.open_channel());
    let old = old.unwrap();

    let (closed, _) = tokio::join!(old.close(CloseReason::normal()), async {
        let (ch, _) = broker.expect(protocol::CHANNEL_CLOSE).await;
        broker.send(ch, protocol::CHANNEL_CLOSE_OK, Arguments::new()).await;
    });
    closed.unwrap();

    let (new, _) = tokio::join!(connection.open_channel(1), broker.open_channel());
    let new = new.unwrap();

    let err = old.basic_qos(0, 1, false).await.unwrap_err();
    assert_eq!(err.reply_code(), Some(constants::CHANNEL_ERROR));
    let err = old.queue("c").await.unwrap_err();
    assert_eq!(err.reply_code(), Some(constants::CHANNEL_ERROR));

    // Nothing from the old handle went out; the next frame belongs to the new one
    let (selected, _) = tokio::join!(new.tx_select(), async {
        let (ch, _) = broker.expect(protocol::TX_SELECT).await;
        assert_eq!(ch, 1);
        broker.send(ch, protocol::TX_SELECT_OK, Arguments::new()).await;
    });
    selected.unwrap();
}

#[tokio::test]
async fn close_is_not_held_up_by_an_outstanding_call() {
    let (connection, mut broker) = connect(Builder::new(), Tune::default()).await;
    let (channel, _) = tokio::join!(connection.open_channel(1), broker.open_channel());
    let channel = channel.unwrap();

    let exchange = async {
        tokio::join!(channel.queue_declare("never.answered", Arguments::new()), async {
            // The declare is on the wire and the broker stays silent about it
            broker.expect(protocol::QUEUE_DECLARE).await;
            let (closed, _) = tokio::join!(channel.close(CloseReason::normal()), async {
                let (ch, _) = broker.expect(protocol::CHANNEL_CLOSE).await;
                broker.send(ch, protocol::CHANNEL_CLOSE_OK, Arguments::new()).await;
            });
            closed
        })
    };
    let (declared, closed) = tokio::time::timeout(Duration::from_secs(5), exchange)
        .await
        .expect("channel.close waited for the outstanding call");

    closed.unwrap();
    assert!(matches!(declared, Err(channel::Error::Closed(_))));
}

#[tokio::test]
async fn synchronous_calls_on_a_channel_are_serialized() {
    let (connection, mut broker) = connect(Builder::new(), Tune::default()).await;
    let (channel, _) = tokio::join!(connection.open_channel(1), broker.open_channel());
    let channel = channel.unwrap();
    let other = channel.clone();

    let declare_ok = |queue: &str| {
        Arguments::new()
            .with("queue", queue)
            .with("message-count", 0u32)
            .with("consumer-count", 0u32)
    };

    let (first, second, _) = tokio::join!(
        channel.queue_declare("first", Arguments::new()),
        other.queue_declare("second", Arguments::new()),
        async {
            let (ch, declare) = broker.expect(protocol::QUEUE_DECLARE).await;
            assert_eq!(declare.arguments.get_str("queue"), Some("first"));

            // The second request waits for the first reply
            let next = tokio::time::timeout(Duration::from_millis(200), broker.recv_frame()).await;
            assert!(next.is_err(), "second request sent early: {:?}", next);

            broker
                .send(ch, protocol::QUEUE_DECLARE_OK, declare_ok("first"))
                .await;
            let (ch, declare) = broker.expect(protocol::QUEUE_DECLARE).await;
            assert_eq!(declare.arguments.get_str("queue"), Some("second"));
            broker
                .send(ch, protocol::QUEUE_DECLARE_OK, declare_ok("second"))
                .await;
        }
    );
    assert_eq!(first.unwrap().queue, "first");
    assert_eq!(second.unwrap().queue, "second");
}
