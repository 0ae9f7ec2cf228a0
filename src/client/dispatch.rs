// ABOUTME: Inbound frame dispatch from the reader task into the state machine
// ABOUTME: Handles broker-initiated frames, confirm bookkeeping and content assembly

use std::sync::Arc;

use amq_protocol::frame::{AMQPContentHeader, AMQPFrame};
use amq_protocol::protocol::{basic, channel, confirm, exchange, queue, tx};
use amq_protocol::protocol::AMQPClass;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::channel0::Channel0Event;
use crate::client::error::{BrokerError, Error};
use crate::client::{ClientInner, MessageCallback};
use crate::message::{InboundMethod, Message};
use crate::state::ConnectionState;

enum CallbackTarget {
    Consumer(String),
    Get,
    Return,
}

impl ClientInner {
    /// Entry point for every frame the transport decodes, called from the
    /// reader task in stream order.
    pub(crate) async fn on_frame(self: Arc<Self>, frame: AMQPFrame) {
        match frame {
            AMQPFrame::Heartbeat(_) => trace!("heartbeat received"),
            AMQPFrame::ProtocolHeader(_) => {
                self.state.set_exception(Error::Unmarshal(
                    "unexpected protocol header from the broker".to_string(),
                ));
            }
            AMQPFrame::Method(0, AMQPClass::Connection(method)) => {
                self.on_channel0_method(method).await;
            }
            AMQPFrame::Method(_, class) => self.on_method(class).await,
            AMQPFrame::Header(_, _, header) => self.on_content_header(*header),
            AMQPFrame::Body(_, payload) => self.on_content_body(&payload),
        }
    }

    /// Validated transition; a table violation during dispatch poisons the
    /// connection rather than unwinding the reader task.
    fn transition(&self, next: ConnectionState) {
        if let Err(err) = self.state.set(next) {
            self.state.set_exception(err);
        }
    }

    async fn on_channel0_method(
        &self,
        method: amq_protocol::protocol::connection::AMQPMethod,
    ) {
        let (replies, event) = self.channel0.lock().handle(method);
        for frame in replies {
            if let Err(err) = self.write_frame(frame).await {
                self.state.set_exception(err);
                return;
            }
        }
        match event {
            Some(Channel0Event::Opened) => self.transition(ConnectionState::Opened),
            Some(Channel0Event::RemoteClose {
                reply_code,
                reply_text,
            }) => {
                info!(reply_code, %reply_text, "connection closed by broker");
                self.state
                    .set_exception(BrokerError::from_reply(reply_code, &reply_text).into());
            }
            Some(Channel0Event::CloseOk) => self.transition(ConnectionState::Closed),
            Some(Channel0Event::Blocked(reason)) => {
                warn!(%reason, "connection blocked by broker flow control");
                self.session.lock().blocked = true;
            }
            Some(Channel0Event::Unblocked) => {
                info!("connection unblocked");
                self.session.lock().blocked = false;
            }
            Some(Channel0Event::SecretUpdated) => {
                self.transition(ConnectionState::UpdateSecretOkReceived);
            }
            None => {}
        }
    }

    async fn on_method(self: Arc<Self>, class: AMQPClass) {
        // Kept so error paths and reply extraction can reach the frame that
        // fired the transition without threading it through wait results.
        self.session.lock().last_frame = Some(class.clone());
        match class {
            AMQPClass::Basic(method) => self.on_basic(method),
            AMQPClass::Channel(method) => self.on_channel(method).await,
            AMQPClass::Confirm(confirm::AMQPMethod::SelectOk(_)) => {
                self.transition(ConnectionState::ConfirmSelectOkReceived);
            }
            AMQPClass::Exchange(method) => self.on_exchange(method),
            AMQPClass::Queue(method) => self.on_queue(method),
            AMQPClass::Tx(method) => self.on_tx(method),
            other => {
                self.state.set_exception(Error::Unmarshal(format!(
                    "unsupported method frame: {other:?}"
                )));
            }
        }
    }

    fn on_basic(&self, method: basic::AMQPMethod) {
        match method {
            basic::AMQPMethod::Ack(ack) => {
                debug!(
                    delivery_tag = ack.delivery_tag,
                    multiple = ack.multiple,
                    "publish acknowledged"
                );
                {
                    let mut session = self.session.lock();
                    if ack.multiple {
                        session.acks.extend_to(ack.delivery_tag);
                    } else {
                        session.acks.insert(ack.delivery_tag);
                    }
                }
                self.transition(ConnectionState::BasicAckReceived);
            }
            basic::AMQPMethod::Nack(nack) => {
                debug!(
                    delivery_tag = nack.delivery_tag,
                    multiple = nack.multiple,
                    "publish negatively acknowledged"
                );
                {
                    let mut session = self.session.lock();
                    if nack.multiple {
                        session.nacks.extend_to(nack.delivery_tag);
                    } else {
                        session.nacks.insert(nack.delivery_tag);
                    }
                }
                self.transition(ConnectionState::BasicNackReceived);
            }
            basic::AMQPMethod::Reject(reject) => {
                debug!(delivery_tag = reject.delivery_tag, "publish rejected");
                self.session.lock().rejects.insert(reject.delivery_tag);
                self.transition(ConnectionState::BasicRejectReceived);
            }
            basic::AMQPMethod::Cancel(cancel) => {
                warn!(
                    consumer_tag = cancel.consumer_tag.as_str(),
                    "consumer cancelled by the server"
                );
                self.transition(ConnectionState::BasicCancelReceived);
            }
            basic::AMQPMethod::CancelOk(_) => {
                self.transition(ConnectionState::BasicCancelOkReceived);
            }
            basic::AMQPMethod::ConsumeOk(consume_ok) => {
                let consumer_tag = consume_ok.consumer_tag.as_str().to_string();
                let pending = self.session.lock().pending_consumers.pop_front();
                match pending {
                    Some(pending) => {
                        debug!(%consumer_tag, "consumer registered");
                        self.session
                            .lock()
                            .consumers
                            .insert(consumer_tag.clone(), pending.callback);
                        let _ = pending.tx.send(consumer_tag);
                    }
                    None => warn!(%consumer_tag, "ConsumeOk without a pending consume"),
                }
                self.transition(ConnectionState::BasicConsumeOkReceived);
            }
            basic::AMQPMethod::Deliver(deliver) => {
                self.session.lock().message =
                    Some(Message::new(InboundMethod::Deliver(deliver)));
                self.transition(ConnectionState::BasicDeliverReceived);
            }
            basic::AMQPMethod::GetEmpty(_) => {
                self.transition(ConnectionState::BasicGetEmptyReceived);
                let pending: Option<oneshot::Sender<Option<Message>>> =
                    self.session.lock().pending_get.take();
                match pending {
                    Some(tx) => {
                        let _ = tx.send(None);
                    }
                    None => warn!("GetEmpty without an outstanding basic.get"),
                }
            }
            basic::AMQPMethod::GetOk(get_ok) => {
                self.session.lock().message = Some(Message::new(InboundMethod::GetOk(get_ok)));
                self.transition(ConnectionState::BasicGetOkReceived);
            }
            basic::AMQPMethod::QosOk(_) => self.transition(ConnectionState::BasicQosOkReceived),
            basic::AMQPMethod::RecoverOk(_) => {
                self.transition(ConnectionState::BasicRecoverOkReceived);
            }
            basic::AMQPMethod::Return(ret) => {
                info!(
                    reply_code = ret.reply_code,
                    reply_text = ret.reply_text.as_str(),
                    "message returned by the broker"
                );
                self.session.lock().message = Some(Message::new(InboundMethod::Return(ret)));
                self.transition(ConnectionState::BasicReturnReceived);
            }
            other => {
                self.state.set_exception(Error::Unmarshal(format!(
                    "unsupported basic method from broker: {other:?}"
                )));
            }
        }
    }

    async fn on_channel(self: Arc<Self>, method: channel::AMQPMethod) {
        match method {
            channel::AMQPMethod::OpenOk(_) => {
                self.transition(ConnectionState::ChannelOpenOkReceived);
            }
            channel::AMQPMethod::Close(close) => self.on_channel_close(close).await,
            channel::AMQPMethod::CloseOk(_) => {
                self.session.lock().channel_open = false;
                self.transition(ConnectionState::ChannelCloseOkReceived);
            }
            channel::AMQPMethod::Flow(flow) => {
                info!(active = flow.active, "channel flow control from broker");
                self.transition(ConnectionState::ChannelFlowReceived);
                let channel_id = self.session.lock().channel;
                let reply = AMQPFrame::Method(
                    channel_id,
                    AMQPClass::Channel(channel::AMQPMethod::FlowOk(channel::FlowOk {
                        active: flow.active,
                    })),
                );
                if let Err(err) = self.write_frame(reply).await {
                    self.state.set_exception(err);
                    return;
                }
                self.transition(ConnectionState::ChannelFlowOkSent);
            }
            other => {
                self.state.set_exception(Error::Unmarshal(format!(
                    "unsupported channel method from broker: {other:?}"
                )));
            }
        }
    }

    /// Broker-initiated Channel.Close: acknowledge it and schedule the
    /// automatic re-open that every "await reopen" step relies on. The
    /// operation that caused the close reads the reply code out of the
    /// saved close reply.
    async fn on_channel_close(self: Arc<Self>, close: channel::Close) {
        info!(
            reply_code = close.reply_code,
            reply_text = close.reply_text.as_str(),
            "channel closed by broker"
        );
        {
            let mut session = self.session.lock();
            session.channel_open = false;
            session.last_channel_close =
                Some((close.reply_code, close.reply_text.as_str().to_string()));
        }
        self.transition(ConnectionState::ChannelCloseReceived);
        let channel_id = self.session.lock().channel;
        let reply = AMQPFrame::Method(
            channel_id,
            AMQPClass::Channel(channel::AMQPMethod::CloseOk(channel::CloseOk {})),
        );
        if let Err(err) = self.write_frame(reply).await {
            self.state.set_exception(err);
            return;
        }
        self.transition(ConnectionState::ChannelCloseOkSent);
        let inner = Arc::clone(&self);
        tokio::spawn(async move {
            if let Err(err) = inner.open_channel().await {
                inner.state.set_exception(err);
            }
        });
    }

    fn on_exchange(&self, method: exchange::AMQPMethod) {
        match method {
            exchange::AMQPMethod::BindOk(_) => {
                self.transition(ConnectionState::ExchangeBindOkReceived);
            }
            exchange::AMQPMethod::DeclareOk(_) => {
                self.transition(ConnectionState::ExchangeDeclareOkReceived);
            }
            exchange::AMQPMethod::DeleteOk(_) => {
                self.transition(ConnectionState::ExchangeDeleteOkReceived);
            }
            exchange::AMQPMethod::UnbindOk(_) => {
                self.transition(ConnectionState::ExchangeUnbindOkReceived);
            }
            other => {
                self.state.set_exception(Error::Unmarshal(format!(
                    "unsupported exchange method from broker: {other:?}"
                )));
            }
        }
    }

    fn on_queue(&self, method: queue::AMQPMethod) {
        match method {
            queue::AMQPMethod::BindOk(_) => self.transition(ConnectionState::QueueBindOkReceived),
            queue::AMQPMethod::DeclareOk(_) => {
                self.transition(ConnectionState::QueueDeclareOkReceived);
            }
            queue::AMQPMethod::DeleteOk(_) => {
                self.transition(ConnectionState::QueueDeleteOkReceived);
            }
            queue::AMQPMethod::PurgeOk(_) => {
                self.transition(ConnectionState::QueuePurgeOkReceived);
            }
            queue::AMQPMethod::UnbindOk(_) => {
                self.transition(ConnectionState::QueueUnbindOkReceived);
            }
            other => {
                self.state.set_exception(Error::Unmarshal(format!(
                    "unsupported queue method from broker: {other:?}"
                )));
            }
        }
    }

    fn on_tx(&self, method: tx::AMQPMethod) {
        match method {
            tx::AMQPMethod::SelectOk(_) => self.transition(ConnectionState::TxSelectOkReceived),
            tx::AMQPMethod::CommitOk(_) => self.transition(ConnectionState::TxCommitOkReceived),
            tx::AMQPMethod::RollbackOk(_) => {
                self.transition(ConnectionState::TxRollbackOkReceived);
            }
            other => {
                self.state.set_exception(Error::Unmarshal(format!(
                    "unsupported tx method from broker: {other:?}"
                )));
            }
        }
    }

    fn on_content_header(&self, header: AMQPContentHeader) {
        self.transition(ConnectionState::ContentHeaderReceived);
        let complete = {
            let mut session = self.session.lock();
            match session.message.as_mut() {
                Some(message) => {
                    message.set_content_header(header.body_size, header.properties);
                    message.is_complete()
                }
                None => {
                    drop(session);
                    self.state.set_exception(Error::Unmarshal(
                        "content header without a pending message".to_string(),
                    ));
                    return;
                }
            }
        };
        if complete {
            self.finish_message();
        }
    }

    fn on_content_body(&self, payload: &[u8]) {
        self.transition(ConnectionState::ContentBodyReceived);
        let complete = {
            let mut session = self.session.lock();
            match session.message.as_mut() {
                Some(message) => {
                    message.append_body(payload);
                    message.is_complete()
                }
                None => {
                    drop(session);
                    self.state.set_exception(Error::Unmarshal(
                        "content body without a pending message".to_string(),
                    ));
                    return;
                }
            }
        };
        if complete {
            self.finish_message();
        }
    }

    /// The message is fully assembled: route it to the consumer callback,
    /// the outstanding basic.get, or the returned-message handler.
    /// Callbacks run as their own tasks on the runtime.
    fn finish_message(&self) {
        self.transition(ConnectionState::MessageAssembled);
        let message = match self.session.lock().message.take() {
            Some(message) => message,
            None => return,
        };
        let target = match message.method() {
            InboundMethod::Deliver(deliver) => {
                CallbackTarget::Consumer(deliver.consumer_tag.as_str().to_string())
            }
            InboundMethod::GetOk(_) => CallbackTarget::Get,
            InboundMethod::Return(_) => CallbackTarget::Return,
        };
        match target {
            CallbackTarget::Consumer(consumer_tag) => {
                let callback: Option<Arc<dyn MessageCallback>> =
                    self.session.lock().consumers.get(&consumer_tag).cloned();
                match callback {
                    Some(callback) => {
                        tokio::spawn(callback.on_message(message));
                    }
                    None => warn!(%consumer_tag, "delivery for an unknown consumer dropped"),
                }
            }
            CallbackTarget::Get => {
                let pending = self.session.lock().pending_get.take();
                match pending {
                    Some(tx) => {
                        let _ = tx.send(Some(message));
                    }
                    None => warn!("assembled GetOk message without an outstanding basic.get"),
                }
            }
            CallbackTarget::Return => {
                let callback = self.session.lock().on_return.clone();
                match callback {
                    Some(callback) => {
                        tokio::spawn(callback.on_message(message));
                    }
                    None => warn!("returned message dropped, no return callback registered"),
                }
            }
        }
    }
}
