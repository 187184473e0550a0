//! Message content and delivered messages

use bytes::Bytes;
use fe2o3_amqp091_types::{
    method::{Method, MethodId},
    primitives::{FieldTable, Value},
    protocol,
};

/// Body bytes plus the content properties (`content-type`, `delivery-mode`, ...)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Content {
    /// Opaque body
    pub body: Bytes,

    /// Properties keyed by name, in the order they were set
    pub properties: FieldTable,
}

impl Content {
    /// Creates content with no properties
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            properties: FieldTable::new(),
        }
    }

    /// Sets a property and returns the content, for chaining
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Returns a property
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }
}

impl From<&'static str> for Content {
    fn from(body: &'static str) -> Self {
        Self::new(body)
    }
}

impl From<String> for Content {
    fn from(body: String) -> Self {
        Self::new(body)
    }
}

impl From<Vec<u8>> for Content {
    fn from(body: Vec<u8>) -> Self {
        Self::new(body)
    }
}

impl From<Bytes> for Content {
    fn from(body: Bytes) -> Self {
        Self::new(body)
    }
}

/// A complete content-bearing method received from the broker: `basic.deliver`,
/// `basic.get-ok` or `basic.return`
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// The method that carried the content
    pub method: Method,

    /// Body and properties
    pub content: Content,
}

impl Message {
    /// Creates a new message
    pub fn new(method: Method, content: Content) -> Self {
        Self { method, content }
    }

    /// Id of the carrying method
    pub fn method_id(&self) -> MethodId {
        self.method.id
    }

    /// The body
    pub fn body(&self) -> &Bytes {
        &self.content.body
    }

    /// The content properties
    pub fn properties(&self) -> &FieldTable {
        &self.content.properties
    }

    /// Delivery tag, absent on returned messages
    pub fn delivery_tag(&self) -> Option<u64> {
        self.method.arguments.get_u64("delivery-tag")
    }

    /// Consumer tag, only present on `basic.deliver`
    pub fn consumer_tag(&self) -> Option<&str> {
        self.method.arguments.get_str("consumer-tag")
    }

    /// Whether the broker delivered this message before
    pub fn redelivered(&self) -> bool {
        self.method.arguments.get_bool("redelivered").unwrap_or(false)
    }

    /// Exchange the message was published to
    pub fn exchange(&self) -> &str {
        self.method.arguments.get_str("exchange").unwrap_or_default()
    }

    /// Routing key used when publishing
    pub fn routing_key(&self) -> &str {
        self.method.arguments.get_str("routing-key").unwrap_or_default()
    }

    /// Messages left in the queue, only present on `basic.get-ok`
    pub fn message_count(&self) -> Option<u32> {
        self.method
            .arguments
            .get_u64("message-count")
            .map(|n| n as u32)
    }

    /// Reply code and text of a returned message
    pub fn return_reason(&self) -> Option<(u16, &str)> {
        if !self.method.is(protocol::BASIC_RETURN) {
            return None;
        }
        let code = self.method.arguments.get_u64("reply-code")? as u16;
        let text = self.method.arguments.get_str("reply-text").unwrap_or_default();
        Some((code, text))
    }
}

impl From<Message> for Content {
    fn from(message: Message) -> Self {
        message.content
    }
}

/// The reply to a synchronous method
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// The reply method
    pub method: Method,

    /// Content, only for replies that carry one (`basic.get-ok`)
    pub content: Option<Content>,
}

impl Reply {
    /// The reply's arguments
    pub fn arguments(&self) -> &FieldTable {
        &self.method.arguments
    }

    /// Whether the reply is the given method
    pub fn is(&self, id: MethodId) -> bool {
        self.method.is(id)
    }

    /// Turns a content-bearing reply into a [`Message`]
    pub fn into_message(self) -> Option<Message> {
        let Reply { method, content } = self;
        content.map(|content| Message::new(method, content))
    }
}

#[cfg(test)]
mod tests {
    use fe2o3_amqp091_types::primitives::Arguments;

    use super::*;

    #[test]
    fn accessors_read_delivery_metadata() {
        let method = Method::new(
            protocol::BASIC_DELIVER,
            Arguments::new()
                .with("consumer-tag", "ctag")
                .with("delivery-tag", 7u64)
                .with("redelivered", true)
                .with("exchange", "amq.direct")
                .with("routing-key", "rk"),
        );
        let message = Message::new(method, Content::from("body"));
        assert_eq!(message.delivery_tag(), Some(7));
        assert_eq!(message.consumer_tag(), Some("ctag"));
        assert!(message.redelivered());
        assert_eq!(message.exchange(), "amq.direct");
        assert_eq!(message.routing_key(), "rk");
        assert_eq!(message.return_reason(), None);
    }

    #[test]
    fn get_ok_reply_becomes_message() {
        let reply = Reply {
            method: Method::new(protocol::BASIC_GET_OK, Arguments::new()),
            content: Some(Content::from("x")),
        };
        let message = reply.into_message().unwrap();
        assert_eq!(message.body(), &Bytes::from_static(b"x"));
    }
}
