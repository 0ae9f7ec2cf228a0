// ABOUTME: Inbound message representation assembled from method, header and body frames
// ABOUTME: Tracks completion against the declared body size from the content header

use amq_protocol::protocol::basic::{AMQPProperties, Deliver, GetOk, Return};
use bytes::{Bytes, BytesMut};

/// The method frame that started a content sequence.
#[derive(Clone, Debug)]
pub(crate) enum InboundMethod {
    Deliver(Deliver),
    GetOk(GetOk),
    Return(Return),
}

/// A message from the broker.
///
/// Created when a `Basic.Deliver`, `Basic.GetOk` or `Basic.Return` method
/// arrives; the following content header contributes the properties and the
/// expected body size, and body frames are appended until the declared size
/// is reached.
#[derive(Clone, Debug)]
pub struct Message {
    method: InboundMethod,
    properties: AMQPProperties,
    body: BytesMut,
    expected_body_size: Option<u64>,
}

impl Message {
    pub(crate) fn new(method: InboundMethod) -> Self {
        Self {
            method,
            properties: AMQPProperties::default(),
            body: BytesMut::new(),
            expected_body_size: None,
        }
    }

    pub(crate) fn set_content_header(&mut self, body_size: u64, properties: AMQPProperties) {
        self.expected_body_size = Some(body_size);
        self.properties = properties;
    }

    pub(crate) fn append_body(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    /// Complete once the accumulated body length equals the size declared
    /// in the content header. A zero-size body is complete as soon as the
    /// header has been seen.
    pub(crate) fn is_complete(&self) -> bool {
        self.expected_body_size == Some(self.body.len() as u64)
    }

    pub(crate) fn method(&self) -> &InboundMethod {
        &self.method
    }

    /// The exchange the message was published to.
    pub fn exchange(&self) -> &str {
        match &self.method {
            InboundMethod::Deliver(m) => m.exchange.as_str(),
            InboundMethod::GetOk(m) => m.exchange.as_str(),
            InboundMethod::Return(m) => m.exchange.as_str(),
        }
    }

    /// The routing key the message was published with.
    pub fn routing_key(&self) -> &str {
        match &self.method {
            InboundMethod::Deliver(m) => m.routing_key.as_str(),
            InboundMethod::GetOk(m) => m.routing_key.as_str(),
            InboundMethod::Return(m) => m.routing_key.as_str(),
        }
    }

    /// Server-assigned delivery tag; absent on returned messages.
    pub fn delivery_tag(&self) -> Option<u64> {
        match &self.method {
            InboundMethod::Deliver(m) => Some(m.delivery_tag),
            InboundMethod::GetOk(m) => Some(m.delivery_tag),
            InboundMethod::Return(_) => None,
        }
    }

    /// The consumer tag the message was delivered to, for consumer
    /// deliveries.
    pub fn consumer_tag(&self) -> Option<&str> {
        match &self.method {
            InboundMethod::Deliver(m) => Some(m.consumer_tag.as_str()),
            _ => None,
        }
    }

    /// Whether the broker flagged the message as redelivered; absent on
    /// returned messages.
    pub fn redelivered(&self) -> Option<bool> {
        match &self.method {
            InboundMethod::Deliver(m) => Some(m.redelivered),
            InboundMethod::GetOk(m) => Some(m.redelivered),
            InboundMethod::Return(_) => None,
        }
    }

    /// Remaining message count reported by `Basic.GetOk`.
    pub fn message_count(&self) -> Option<u32> {
        match &self.method {
            InboundMethod::GetOk(m) => Some(m.message_count),
            _ => None,
        }
    }

    /// True when this message came back via `Basic.Return`.
    pub fn is_returned(&self) -> bool {
        matches!(self.method, InboundMethod::Return(_))
    }

    /// Reply code of a returned message.
    pub fn reply_code(&self) -> Option<u16> {
        match &self.method {
            InboundMethod::Return(m) => Some(m.reply_code),
            _ => None,
        }
    }

    /// Reply text of a returned message.
    pub fn reply_text(&self) -> Option<&str> {
        match &self.method {
            InboundMethod::Return(m) => Some(m.reply_text.as_str()),
            _ => None,
        }
    }

    /// The message properties from the content header.
    pub fn properties(&self) -> &AMQPProperties {
        &self.properties
    }

    /// The message body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Consume the message, returning the body.
    pub fn into_body(self) -> Bytes {
        self.body.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivered() -> Message {
        Message::new(InboundMethod::Deliver(Deliver {
            consumer_tag: "ctag-1".into(),
            delivery_tag: 7,
            redelivered: false,
            exchange: "amq.topic".into(),
            routing_key: "a.b".into(),
        }))
    }

    #[test]
    fn incomplete_until_header_and_body_arrive() {
        let mut message = delivered();
        assert!(!message.is_complete());
        message.set_content_header(11, AMQPProperties::default());
        assert!(!message.is_complete());
        message.append_body(b"hello ");
        assert!(!message.is_complete());
        message.append_body(b"world");
        assert!(message.is_complete());
        assert_eq!(message.body(), b"hello world");
    }

    #[test]
    fn zero_length_body_completes_after_the_header() {
        let mut message = delivered();
        message.set_content_header(0, AMQPProperties::default());
        assert!(message.is_complete());
        assert!(message.body().is_empty());
    }

    #[test]
    fn accessors_reflect_the_starting_method() {
        let mut message = Message::new(InboundMethod::Return(Return {
            reply_code: 312,
            reply_text: "NO_ROUTE".into(),
            exchange: "amq.direct".into(),
            routing_key: "nowhere".into(),
        }));
        message.set_content_header(2, AMQPProperties::default());
        message.append_body(b"hi");
        assert!(message.is_returned());
        assert_eq!(message.reply_code(), Some(312));
        assert_eq!(message.reply_text(), Some("NO_ROUTE"));
        assert_eq!(message.delivery_tag(), None);
        assert_eq!(message.exchange(), "amq.direct");

        let delivered = delivered();
        assert_eq!(delivered.consumer_tag(), Some("ctag-1"));
        assert_eq!(delivered.delivery_tag(), Some(7));
        assert_eq!(delivered.redelivered(), Some(false));
        assert!(!delivered.is_returned());
    }
}
