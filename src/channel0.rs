// ABOUTME: Connection-level (channel 0) handshake and lifecycle handling
// ABOUTME: Negotiates tuning parameters and surfaces server properties and capabilities

use amq_protocol::auth::{Credentials, SASLMechanism};
use amq_protocol::frame::{AMQPFrame, ProtocolVersion};
use amq_protocol::protocol::connection::{self, AMQPMethod};
use amq_protocol::protocol::AMQPClass;
use amq_protocol::types::{AMQPValue, FieldTable};
use tracing::{debug, warn};

use crate::client::types::ConnectOptions;

/// Frame max used when the server leaves the choice to the client.
const DEFAULT_FRAME_MAX: u32 = 131_072;

/// Outcome of processing a channel-0 method, for the client to act on.
#[derive(Debug)]
pub(crate) enum Channel0Event {
    /// Connection.OpenOk received; the handshake is complete.
    Opened,
    /// Broker-initiated Connection.Close.
    RemoteClose { reply_code: u16, reply_text: String },
    /// Connection.CloseOk for a close we initiated.
    CloseOk,
    /// Broker applied connection-wide flow control.
    Blocked(String),
    Unblocked,
    /// Connection.UpdateSecretOk received.
    SecretUpdated,
}

/// The pre-channel handshake state and everything negotiated by it.
///
/// `Channel0` is a pure state machine: [`Channel0::handle`] consumes a
/// channel-0 method and returns the frames to write plus an event for the
/// client. The client owns the socket and the heartbeat timer.
pub(crate) struct Channel0 {
    credentials: Credentials,
    vhost: String,
    locale: String,
    product: String,
    requested_heartbeat: Option<u16>,
    requested_channel_max: u16,
    server_properties: FieldTable,
    max_channels: u16,
    max_frame_size: u32,
    heartbeat_interval: u16,
    opened: bool,
}

impl Channel0 {
    pub(crate) fn new(options: &ConnectOptions) -> Self {
        Self {
            credentials: Credentials::new(options.username.clone(), options.password.clone()),
            vhost: options.vhost.clone(),
            locale: options.locale.clone(),
            product: options.product.clone(),
            requested_heartbeat: options.heartbeat,
            requested_channel_max: options.channel_max,
            server_properties: FieldTable::default(),
            max_channels: options.channel_max,
            max_frame_size: DEFAULT_FRAME_MAX,
            heartbeat_interval: 0,
            opened: false,
        }
    }

    /// The protocol header that opens the conversation.
    pub(crate) fn protocol_header(&self) -> AMQPFrame {
        AMQPFrame::ProtocolHeader(ProtocolVersion::amqp_0_9_1())
    }

    /// Process one channel-0 method, returning reply frames and an event.
    pub(crate) fn handle(
        &mut self,
        method: AMQPMethod,
    ) -> (Vec<AMQPFrame>, Option<Channel0Event>) {
        match method {
            AMQPMethod::Start(start) => {
                debug!(
                    version_major = start.version_major,
                    version_minor = start.version_minor,
                    "connection.start received"
                );
                self.server_properties = start.server_properties;
                let start_ok = connection::StartOk {
                    client_properties: self.client_properties(),
                    mechanism: "PLAIN".into(),
                    response: self
                        .credentials
                        .sasl_auth_string(SASLMechanism::Plain)
                        .into(),
                    locale: self.locale.as_str().into(),
                };
                (vec![method_frame(AMQPMethod::StartOk(start_ok))], None)
            }
            AMQPMethod::Tune(tune) => {
                self.max_channels = if tune.channel_max == 0 {
                    self.requested_channel_max
                } else {
                    tune.channel_max.min(self.requested_channel_max)
                };
                self.max_frame_size = if tune.frame_max == 0 {
                    DEFAULT_FRAME_MAX
                } else {
                    tune.frame_max
                };
                self.heartbeat_interval = self.requested_heartbeat.unwrap_or(tune.heartbeat);
                debug!(
                    channel_max = self.max_channels,
                    frame_max = self.max_frame_size,
                    heartbeat = self.heartbeat_interval,
                    "tuned connection"
                );
                let tune_ok = connection::TuneOk {
                    channel_max: self.max_channels,
                    frame_max: self.max_frame_size,
                    heartbeat: self.heartbeat_interval,
                };
                let open = connection::Open {
                    virtual_host: self.vhost.as_str().into(),
                };
                (
                    vec![
                        method_frame(AMQPMethod::TuneOk(tune_ok)),
                        method_frame(AMQPMethod::Open(open)),
                    ],
                    None,
                )
            }
            AMQPMethod::OpenOk(_) => {
                self.opened = true;
                (Vec::new(), Some(Channel0Event::Opened))
            }
            AMQPMethod::Close(close) => {
                self.opened = false;
                let event = Channel0Event::RemoteClose {
                    reply_code: close.reply_code,
                    reply_text: close.reply_text.as_str().to_string(),
                };
                (
                    vec![method_frame(AMQPMethod::CloseOk(connection::CloseOk {}))],
                    Some(event),
                )
            }
            AMQPMethod::CloseOk(_) => {
                self.opened = false;
                (Vec::new(), Some(Channel0Event::CloseOk))
            }
            AMQPMethod::Blocked(blocked) => {
                let reason = blocked.reason.as_str().to_string();
                (Vec::new(), Some(Channel0Event::Blocked(reason)))
            }
            AMQPMethod::Unblocked(_) => (Vec::new(), Some(Channel0Event::Unblocked)),
            AMQPMethod::UpdateSecretOk(_) => (Vec::new(), Some(Channel0Event::SecretUpdated)),
            other => {
                warn!(?other, "unhandled channel-0 method");
                (Vec::new(), None)
            }
        }
    }

    /// The Connection.Close frame for a client-initiated shutdown.
    pub(crate) fn close_frame(&self, reply_code: u16, reply_text: &str) -> AMQPFrame {
        method_frame(AMQPMethod::Close(connection::Close {
            reply_code,
            reply_text: reply_text.into(),
            class_id: 0,
            method_id: 0,
        }))
    }

    /// The Connection.UpdateSecret frame (RabbitMQ extension).
    pub(crate) fn update_secret_frame(&self, secret: &str, reason: &str) -> AMQPFrame {
        method_frame(AMQPMethod::UpdateSecret(connection::UpdateSecret {
            new_secret: secret.into(),
            reason: reason.into(),
        }))
    }

    pub(crate) fn is_open(&self) -> bool {
        self.opened
    }

    pub(crate) fn max_channels(&self) -> u16 {
        self.max_channels
    }

    pub(crate) fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    pub(crate) fn heartbeat_interval(&self) -> u16 {
        self.heartbeat_interval
    }

    pub(crate) fn server_properties(&self) -> &FieldTable {
        &self.server_properties
    }

    /// Capability names the server advertises as enabled.
    pub(crate) fn capabilities(&self) -> Vec<String> {
        match self.capability_table() {
            Some(table) => table
                .inner()
                .iter()
                .filter(|(_, value)| matches!(value, AMQPValue::Boolean(true)))
                .map(|(name, _)| name.as_str().to_string())
                .collect(),
            None => Vec::new(),
        }
    }

    pub(crate) fn has_capability(&self, name: &str) -> bool {
        self.capability_table()
            .and_then(|table| {
                table
                    .inner()
                    .iter()
                    .find(|(key, _)| key.as_str() == name)
                    .map(|(_, value)| matches!(value, AMQPValue::Boolean(true)))
            })
            .unwrap_or(false)
    }

    fn capability_table(&self) -> Option<&FieldTable> {
        self.server_properties
            .inner()
            .iter()
            .find(|(key, _)| key.as_str() == "capabilities")
            .and_then(|(_, value)| match value {
                AMQPValue::FieldTable(table) => Some(table),
                _ => None,
            })
    }

    fn client_properties(&self) -> FieldTable {
        let mut capabilities = FieldTable::default();
        capabilities.insert("publisher_confirms".into(), AMQPValue::Boolean(true));
        capabilities.insert("basic.nack".into(), AMQPValue::Boolean(true));
        capabilities.insert("connection.blocked".into(), AMQPValue::Boolean(true));
        capabilities.insert(
            "authentication_failure_close".into(),
            AMQPValue::Boolean(true),
        );

        let mut properties = FieldTable::default();
        properties.insert(
            "product".into(),
            AMQPValue::LongString(self.product.as_str().into()),
        );
        properties.insert(
            "version".into(),
            AMQPValue::LongString(env!("CARGO_PKG_VERSION").into()),
        );
        properties.insert("platform".into(), AMQPValue::LongString("rust".into()));
        properties.insert("capabilities".into(), AMQPValue::FieldTable(capabilities));
        properties
    }
}

fn method_frame(method: AMQPMethod) -> AMQPFrame {
    AMQPFrame::Method(0, AMQPClass::Connection(method))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_start() -> connection::Start {
        let mut capabilities = FieldTable::default();
        capabilities.insert("publisher_confirms".into(), AMQPValue::Boolean(true));
        capabilities.insert("direct_reply_to".into(), AMQPValue::Boolean(false));
        let mut properties = FieldTable::default();
        properties.insert("capabilities".into(), AMQPValue::FieldTable(capabilities));
        properties.insert(
            "product".into(),
            AMQPValue::LongString("RabbitMQ".into()),
        );
        connection::Start {
            version_major: 0,
            version_minor: 9,
            server_properties: properties,
            mechanisms: "PLAIN AMQPLAIN".into(),
            locales: "en_US".into(),
        }
    }

    #[test]
    fn start_is_answered_with_plain_credentials() {
        let mut channel0 = Channel0::new(&ConnectOptions::default());
        let (replies, event) = channel0.handle(AMQPMethod::Start(server_start()));
        assert!(event.is_none());
        assert_eq!(replies.len(), 1);
        match &replies[0] {
            AMQPFrame::Method(0, AMQPClass::Connection(AMQPMethod::StartOk(start_ok))) => {
                assert_eq!(start_ok.mechanism.as_str(), "PLAIN");
                assert_eq!(start_ok.locale.as_str(), "en-US");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn tune_negotiates_and_opens_the_vhost() {
        let mut channel0 = Channel0::new(&ConnectOptions::default());
        let (replies, event) = channel0.handle(AMQPMethod::Tune(connection::Tune {
            channel_max: 2047,
            frame_max: 0,
            heartbeat: 60,
        }));
        assert!(event.is_none());
        assert_eq!(channel0.max_channels(), 2047);
        assert_eq!(channel0.max_frame_size(), DEFAULT_FRAME_MAX);
        assert_eq!(channel0.heartbeat_interval(), 60);
        assert_eq!(replies.len(), 2);
        match &replies[1] {
            AMQPFrame::Method(0, AMQPClass::Connection(AMQPMethod::Open(open))) => {
                assert_eq!(open.virtual_host.as_str(), "/");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn requested_heartbeat_wins_over_the_server_suggestion() {
        let mut options = ConnectOptions::default();
        options.heartbeat = Some(5);
        let mut channel0 = Channel0::new(&options);
        channel0.handle(AMQPMethod::Tune(connection::Tune {
            channel_max: 0,
            frame_max: 4096,
            heartbeat: 60,
        }));
        assert_eq!(channel0.heartbeat_interval(), 5);
        assert_eq!(channel0.max_frame_size(), 4096);
        assert_eq!(channel0.max_channels(), 32768);
    }

    #[test]
    fn open_ok_completes_the_handshake() {
        let mut channel0 = Channel0::new(&ConnectOptions::default());
        assert!(!channel0.is_open());
        let (replies, event) = channel0.handle(AMQPMethod::OpenOk(connection::OpenOk {}));
        assert!(replies.is_empty());
        assert!(matches!(event, Some(Channel0Event::Opened)));
        assert!(channel0.is_open());
    }

    #[test]
    fn remote_close_is_acknowledged_and_reported() {
        let mut channel0 = Channel0::new(&ConnectOptions::default());
        channel0.handle(AMQPMethod::OpenOk(connection::OpenOk {}));
        let (replies, event) = channel0.handle(AMQPMethod::Close(connection::Close {
            reply_code: 320,
            reply_text: "CONNECTION_FORCED".into(),
            class_id: 0,
            method_id: 0,
        }));
        assert!(matches!(
            &replies[0],
            AMQPFrame::Method(0, AMQPClass::Connection(AMQPMethod::CloseOk(_)))
        ));
        match event {
            Some(Channel0Event::RemoteClose {
                reply_code,
                reply_text,
            }) => {
                assert_eq!(reply_code, 320);
                assert_eq!(reply_text, "CONNECTION_FORCED");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(!channel0.is_open());
    }

    #[test]
    fn capabilities_reflect_the_server_properties() {
        let mut channel0 = Channel0::new(&ConnectOptions::default());
        channel0.handle(AMQPMethod::Start(server_start()));
        assert!(channel0.has_capability("publisher_confirms"));
        assert!(!channel0.has_capability("direct_reply_to"));
        assert!(!channel0.has_capability("per_consumer_qos"));
        assert_eq!(channel0.capabilities(), vec!["publisher_confirms"]);
    }
}
