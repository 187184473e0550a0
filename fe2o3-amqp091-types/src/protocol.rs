//! The AMQP 0-9-1 method table, including the RabbitMQ extensions
//! (`exchange.bind`, `basic.nack`, `confirm.select` and `connection.blocked`)

use crate::method::{FieldKind::*, FieldSpec, MethodId, MethodSpec, MethodTable};

/// Class ids
pub mod class {
    /// `connection`
    pub const CONNECTION: u16 = 10;
    /// `channel`
    pub const CHANNEL: u16 = 20;
    /// `exchange`
    pub const EXCHANGE: u16 = 40;
    /// `queue`
    pub const QUEUE: u16 = 50;
    /// `basic`
    pub const BASIC: u16 = 60;
    /// `confirm`
    pub const CONFIRM: u16 = 85;
    /// `tx`
    pub const TX: u16 = 90;
}

macro_rules! method_ids {
    ($($name:ident = ($class:expr, $method:expr)),* $(,)?) => {
        $(
            #[allow(missing_docs)]
            pub const $name: MethodId = MethodId::new($class, $method);
        )*
    };
}

method_ids! {
    CONNECTION_START = (class::CONNECTION, 10),
    CONNECTION_START_OK = (class::CONNECTION, 11),
    CONNECTION_SECURE = (class::CONNECTION, 20),
    CONNECTION_SECURE_OK = (class::CONNECTION, 21),
    CONNECTION_TUNE = (class::CONNECTION, 30),
    CONNECTION_TUNE_OK = (class::CONNECTION, 31),
    CONNECTION_OPEN = (class::CONNECTION, 40),
    CONNECTION_OPEN_OK = (class::CONNECTION, 41),
    CONNECTION_CLOSE = (class::CONNECTION, 50),
    CONNECTION_CLOSE_OK = (class::CONNECTION, 51),
    CONNECTION_BLOCKED = (class::CONNECTION, 60),
    CONNECTION_UNBLOCKED = (class::CONNECTION, 61),

    CHANNEL_OPEN = (class::CHANNEL, 10),
    CHANNEL_OPEN_OK = (class::CHANNEL, 11),
    CHANNEL_FLOW = (class::CHANNEL, 20),
    CHANNEL_FLOW_OK = (class::CHANNEL, 21),
    CHANNEL_CLOSE = (class::CHANNEL, 40),
    CHANNEL_CLOSE_OK = (class::CHANNEL, 41),

    EXCHANGE_DECLARE = (class::EXCHANGE, 10),
    EXCHANGE_DECLARE_OK = (class::EXCHANGE, 11),
    EXCHANGE_DELETE = (class::EXCHANGE, 20),
    EXCHANGE_DELETE_OK = (class::EXCHANGE, 21),
    EXCHANGE_BIND = (class::EXCHANGE, 30),
    EXCHANGE_BIND_OK = (class::EXCHANGE, 31),
    EXCHANGE_UNBIND = (class::EXCHANGE, 40),
    EXCHANGE_UNBIND_OK = (class::EXCHANGE, 51),

    QUEUE_DECLARE = (class::QUEUE, 10),
    QUEUE_DECLARE_OK = (class::QUEUE, 11),
    QUEUE_BIND = (class::QUEUE, 20),
    QUEUE_BIND_OK = (class::QUEUE, 21),
    QUEUE_PURGE = (class::QUEUE, 30),
    QUEUE_PURGE_OK = (class::QUEUE, 31),
    QUEUE_DELETE = (class::QUEUE, 40),
    QUEUE_DELETE_OK = (class::QUEUE, 41),
    QUEUE_UNBIND = (class::QUEUE, 50),
    QUEUE_UNBIND_OK = (class::QUEUE, 51),

    BASIC_QOS = (class::BASIC, 10),
    BASIC_QOS_OK = (class::BASIC, 11),
    BASIC_CONSUME = (class::BASIC, 20),
    BASIC_CONSUME_OK = (class::BASIC, 21),
    BASIC_CANCEL = (class::BASIC, 30),
    BASIC_CANCEL_OK = (class::BASIC, 31),
    BASIC_PUBLISH = (class::BASIC, 40),
    BASIC_RETURN = (class::BASIC, 50),
    BASIC_DELIVER = (class::BASIC, 60),
    BASIC_GET = (class::BASIC, 70),
    BASIC_GET_OK = (class::BASIC, 71),
    BASIC_GET_EMPTY = (class::BASIC, 72),
    BASIC_ACK = (class::BASIC, 80),
    BASIC_REJECT = (class::BASIC, 90),
    BASIC_RECOVER_ASYNC = (class::BASIC, 100),
    BASIC_RECOVER = (class::BASIC, 110),
    BASIC_RECOVER_OK = (class::BASIC, 111),
    BASIC_NACK = (class::BASIC, 120),

    CONFIRM_SELECT = (class::CONFIRM, 10),
    CONFIRM_SELECT_OK = (class::CONFIRM, 11),

    TX_SELECT = (class::TX, 10),
    TX_SELECT_OK = (class::TX, 11),
    TX_COMMIT = (class::TX, 20),
    TX_COMMIT_OK = (class::TX, 21),
    TX_ROLLBACK = (class::TX, 30),
    TX_ROLLBACK_OK = (class::TX, 31),
}

macro_rules! f {
    ($name:literal, $kind:ident) => {
        FieldSpec {
            name: $name,
            kind: $kind,
        }
    };
}

const CLOSE_FIELDS: &[FieldSpec] = &[
    f!("reply-code", Short),
    f!("reply-text", ShortStr),
    f!("class-id", Short),
    f!("method-id", Short),
];

const NO_FIELDS: &[FieldSpec] = &[];

const fn sync(
    name: &'static str,
    id: MethodId,
    responses: &'static [u16],
    fields: &'static [FieldSpec],
) -> MethodSpec {
    MethodSpec {
        name,
        id,
        synchronous: true,
        responses,
        content: false,
        fields,
    }
}

const fn not_sync(name: &'static str, id: MethodId, fields: &'static [FieldSpec]) -> MethodSpec {
    MethodSpec {
        name,
        id,
        synchronous: false,
        responses: &[],
        content: false,
        fields,
    }
}

const fn with_content(name: &'static str, id: MethodId, fields: &'static [FieldSpec]) -> MethodSpec {
    MethodSpec {
        name,
        id,
        synchronous: false,
        responses: &[],
        content: true,
        fields,
    }
}

/// All methods, sorted by id
static METHODS: &[MethodSpec] = &[
    sync(
        "connection.start",
        CONNECTION_START,
        &[11],
        &[
            f!("version-major", Octet),
            f!("version-minor", Octet),
            f!("server-properties", Table),
            f!("mechanisms", LongStr),
            f!("locales", LongStr),
        ],
    ),
    not_sync(
        "connection.start-ok",
        CONNECTION_START_OK,
        &[
            f!("client-properties", Table),
            f!("mechanism", ShortStr),
            f!("response", LongStr),
            f!("locale", ShortStr),
        ],
    ),
    sync("connection.secure", CONNECTION_SECURE, &[21], &[f!("challenge", LongStr)]),
    not_sync("connection.secure-ok", CONNECTION_SECURE_OK, &[f!("response", LongStr)]),
    sync(
        "connection.tune",
        CONNECTION_TUNE,
        &[31],
        &[
            f!("channel-max", Short),
            f!("frame-max", Long),
            f!("heartbeat", Short),
        ],
    ),
    not_sync(
        "connection.tune-ok",
        CONNECTION_TUNE_OK,
        &[
            f!("channel-max", Short),
            f!("frame-max", Long),
            f!("heartbeat", Short),
        ],
    ),
    sync(
        "connection.open",
        CONNECTION_OPEN,
        &[41],
        &[
            f!("virtual-host", ShortStr),
            f!("reserved-1", ShortStr),
            f!("reserved-2", Bit),
        ],
    ),
    not_sync("connection.open-ok", CONNECTION_OPEN_OK, &[f!("reserved-1", ShortStr)]),
    sync("connection.close", CONNECTION_CLOSE, &[51], CLOSE_FIELDS),
    not_sync("connection.close-ok", CONNECTION_CLOSE_OK, NO_FIELDS),
    not_sync("connection.blocked", CONNECTION_BLOCKED, &[f!("reason", ShortStr)]),
    not_sync("connection.unblocked", CONNECTION_UNBLOCKED, NO_FIELDS),
    // channel
    sync("channel.open", CHANNEL_OPEN, &[11], &[f!("reserved-1", ShortStr)]),
    not_sync("channel.open-ok", CHANNEL_OPEN_OK, &[f!("reserved-1", LongStr)]),
    sync("channel.flow", CHANNEL_FLOW, &[21], &[f!("active", Bit)]),
    not_sync("channel.flow-ok", CHANNEL_FLOW_OK, &[f!("active", Bit)]),
    sync("channel.close", CHANNEL_CLOSE, &[41], CLOSE_FIELDS),
    not_sync("channel.close-ok", CHANNEL_CLOSE_OK, NO_FIELDS),
    // exchange
    sync(
        "exchange.declare",
        EXCHANGE_DECLARE,
        &[11],
        &[
            f!("reserved-1", Short),
            f!("exchange", ShortStr),
            f!("type", ShortStr),
            f!("passive", Bit),
            f!("durable", Bit),
            f!("auto-delete", Bit),
            f!("internal", Bit),
            f!("no-wait", Bit),
            f!("arguments", Table),
        ],
    ),
    not_sync("exchange.declare-ok", EXCHANGE_DECLARE_OK, NO_FIELDS),
    sync(
        "exchange.delete",
        EXCHANGE_DELETE,
        &[21],
        &[
            f!("reserved-1", Short),
            f!("exchange", ShortStr),
            f!("if-unused", Bit),
            f!("no-wait", Bit),
        ],
    ),
    not_sync("exchange.delete-ok", EXCHANGE_DELETE_OK, NO_FIELDS),
    sync(
        "exchange.bind",
        EXCHANGE_BIND,
        &[31],
        &[
            f!("reserved-1", Short),
            f!("destination", ShortStr),
            f!("source", ShortStr),
            f!("routing-key", ShortStr),
            f!("no-wait", Bit),
            f!("arguments", Table),
        ],
    ),
    not_sync("exchange.bind-ok", EXCHANGE_BIND_OK, NO_FIELDS),
    sync(
        "exchange.unbind",
        EXCHANGE_UNBIND,
        &[51],
        &[
            f!("reserved-1", Short),
            f!("destination", ShortStr),
            f!("source", ShortStr),
            f!("routing-key", ShortStr),
            f!("no-wait", Bit),
            f!("arguments", Table),
        ],
    ),
    not_sync("exchange.unbind-ok", EXCHANGE_UNBIND_OK, NO_FIELDS),
    // queue
    sync(
        "queue.declare",
        QUEUE_DECLARE,
        &[11],
        &[
            f!("reserved-1", Short),
            f!("queue", ShortStr),
            f!("passive", Bit),
            f!("durable", Bit),
            f!("exclusive", Bit),
            f!("auto-delete", Bit),
            f!("no-wait", Bit),
            f!("arguments", Table),
        ],
    ),
    not_sync(
        "queue.declare-ok",
        QUEUE_DECLARE_OK,
        &[
            f!("queue", ShortStr),
            f!("message-count", Long),
            f!("consumer-count", Long),
        ],
    ),
    sync(
        "queue.bind",
        QUEUE_BIND,
        &[21],
        &[
            f!("reserved-1", Short),
            f!("queue", ShortStr),
            f!("exchange", ShortStr),
            f!("routing-key", ShortStr),
            f!("no-wait", Bit),
            f!("arguments", Table),
        ],
    ),
    not_sync("queue.bind-ok", QUEUE_BIND_OK, NO_FIELDS),
    sync(
        "queue.purge",
        QUEUE_PURGE,
        &[31],
        &[
            f!("reserved-1", Short),
            f!("queue", ShortStr),
            f!("no-wait", Bit),
        ],
    ),
    not_sync("queue.purge-ok", QUEUE_PURGE_OK, &[f!("message-count", Long)]),
    sync(
        "queue.delete",
        QUEUE_DELETE,
        &[41],
        &[
            f!("reserved-1", Short),
            f!("queue", ShortStr),
            f!("if-unused", Bit),
            f!("if-empty", Bit),
            f!("no-wait", Bit),
        ],
    ),
    not_sync("queue.delete-ok", QUEUE_DELETE_OK, &[f!("message-count", Long)]),
    sync(
        "queue.unbind",
        QUEUE_UNBIND,
        &[51],
        &[
            f!("reserved-1", Short),
            f!("queue", ShortStr),
            f!("exchange", ShortStr),
            f!("routing-key", ShortStr),
            f!("arguments", Table),
        ],
    ),
    not_sync("queue.unbind-ok", QUEUE_UNBIND_OK, NO_FIELDS),
    // basic
    sync(
        "basic.qos",
        BASIC_QOS,
        &[11],
        &[
            f!("prefetch-size", Long),
            f!("prefetch-count", Short),
            f!("global", Bit),
        ],
    ),
    not_sync("basic.qos-ok", BASIC_QOS_OK, NO_FIELDS),
    sync(
        "basic.consume",
        BASIC_CONSUME,
        &[21],
        &[
            f!("reserved-1", Short),
            f!("queue", ShortStr),
            f!("consumer-tag", ShortStr),
            f!("no-local", Bit),
            f!("no-ack", Bit),
            f!("exclusive", Bit),
            f!("no-wait", Bit),
            f!("arguments", Table),
        ],
    ),
    not_sync("basic.consume-ok", BASIC_CONSUME_OK, &[f!("consumer-tag", ShortStr)]),
    sync(
        "basic.cancel",
        BASIC_CANCEL,
        &[31],
        &[f!("consumer-tag", ShortStr), f!("no-wait", Bit)],
    ),
    not_sync("basic.cancel-ok", BASIC_CANCEL_OK, &[f!("consumer-tag", ShortStr)]),
    with_content(
        "basic.publish",
        BASIC_PUBLISH,
        &[
            f!("reserved-1", Short),
            f!("exchange", ShortStr),
            f!("routing-key", ShortStr),
            f!("mandatory", Bit),
            f!("immediate", Bit),
        ],
    ),
    with_content(
        "basic.return",
        BASIC_RETURN,
        &[
            f!("reply-code", Short),
            f!("reply-text", ShortStr),
            f!("exchange", ShortStr),
            f!("routing-key", ShortStr),
        ],
    ),
    with_content(
        "basic.deliver",
        BASIC_DELIVER,
        &[
            f!("consumer-tag", ShortStr),
            f!("delivery-tag", LongLong),
            f!("redelivered", Bit),
            f!("exchange", ShortStr),
            f!("routing-key", ShortStr),
        ],
    ),
    sync(
        "basic.get",
        BASIC_GET,
        &[71, 72],
        &[
            f!("reserved-1", Short),
            f!("queue", ShortStr),
            f!("no-ack", Bit),
        ],
    ),
    with_content(
        "basic.get-ok",
        BASIC_GET_OK,
        &[
            f!("delivery-tag", LongLong),
            f!("redelivered", Bit),
            f!("exchange", ShortStr),
            f!("routing-key", ShortStr),
            f!("message-count", Long),
        ],
    ),
    not_sync("basic.get-empty", BASIC_GET_EMPTY, &[f!("reserved-1", ShortStr)]),
    not_sync(
        "basic.ack",
        BASIC_ACK,
        &[f!("delivery-tag", LongLong), f!("multiple", Bit)],
    ),
    not_sync(
        "basic.reject",
        BASIC_REJECT,
        &[f!("delivery-tag", LongLong), f!("requeue", Bit)],
    ),
    not_sync("basic.recover-async", BASIC_RECOVER_ASYNC, &[f!("requeue", Bit)]),
    sync("basic.recover", BASIC_RECOVER, &[111], &[f!("requeue", Bit)]),
    not_sync("basic.recover-ok", BASIC_RECOVER_OK, NO_FIELDS),
    not_sync(
        "basic.nack",
        BASIC_NACK,
        &[
            f!("delivery-tag", LongLong),
            f!("multiple", Bit),
            f!("requeue", Bit),
        ],
    ),
    // confirm
    sync("confirm.select", CONFIRM_SELECT, &[11], &[f!("nowait", Bit)]),
    not_sync("confirm.select-ok", CONFIRM_SELECT_OK, NO_FIELDS),
    // tx
    sync("tx.select", TX_SELECT, &[11], NO_FIELDS),
    not_sync("tx.select-ok", TX_SELECT_OK, NO_FIELDS),
    sync("tx.commit", TX_COMMIT, &[21], NO_FIELDS),
    not_sync("tx.commit-ok", TX_COMMIT_OK, NO_FIELDS),
    sync("tx.rollback", TX_ROLLBACK, &[31], NO_FIELDS),
    not_sync("tx.rollback-ok", TX_ROLLBACK_OK, NO_FIELDS),
];

/// Properties of the `basic` content class, in flag order
pub static BASIC_PROPERTIES: &[FieldSpec] = &[
    f!("content-type", ShortStr),
    f!("content-encoding", ShortStr),
    f!("headers", Table),
    f!("delivery-mode", Octet),
    f!("priority", Octet),
    f!("correlation-id", ShortStr),
    f!("reply-to", ShortStr),
    f!("expiration", ShortStr),
    f!("message-id", ShortStr),
    f!("timestamp", Timestamp),
    f!("type", ShortStr),
    f!("user-id", ShortStr),
    f!("app-id", ShortStr),
    f!("cluster-id", ShortStr),
];

/// The standard AMQP 0-9-1 method table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Amqp091;

impl MethodTable for Amqp091 {
    fn method(&self, id: MethodId) -> Option<&MethodSpec> {
        METHODS
            .binary_search_by_key(&id, |spec| spec.id)
            .ok()
            .map(|i| &METHODS[i])
    }

    fn method_by_name(&self, name: &str) -> Option<&MethodSpec> {
        METHODS.iter().find(|spec| spec.name == name)
    }

    fn properties(&self, class_id: u16) -> Option<&[FieldSpec]> {
        match class_id {
            class::BASIC => Some(BASIC_PROPERTIES),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn methods_are_sorted_by_id() {
        assert!(METHODS.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test]
    fn lookup_by_id_and_name_agree() {
        for spec in METHODS {
            assert_eq!(Amqp091.method(spec.id), Some(spec));
            assert_eq!(Amqp091.method_by_name(spec.name), Some(spec));
        }
    }

    #[test]
    fn every_response_is_in_the_table() {
        for spec in METHODS.iter().filter(|s| s.synchronous) {
            assert!(!spec.responses.is_empty(), "{}", spec.name);
            for id in spec.response_ids() {
                assert!(Amqp091.method(id).is_some(), "{} -> {}", spec.name, id);
            }
        }
    }

    #[test]
    fn basic_get_is_answered_by_get_ok_or_get_empty() {
        let spec = Amqp091.method(BASIC_GET).unwrap();
        assert!(spec.is_response(BASIC_GET_OK));
        assert!(spec.is_response(BASIC_GET_EMPTY));
        assert!(!spec.is_response(BASIC_DELIVER));
    }
}
