// ABOUTME: The public operation surface: management, configuration, acks, consuming, publish
// ABOUTME: Every operation validates, writes its request, enters the Sent state and awaits the reply

use amq_protocol::frame::{AMQPContentHeader, AMQPFrame};
use amq_protocol::protocol::{basic, confirm, exchange, queue, tx};
use amq_protocol::protocol::AMQPClass;
use amq_protocol::types::FieldTable;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::client::error::{BrokerError, Error, Result};
use crate::client::types::{
    validate_exchange_name, validate_short_string, ConsumeOptions, ExchangeDeclareOptions,
    Properties, PublishOptions, QosOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use crate::client::{Client, MessageCallback, PendingConsumer};
use crate::message::Message;
use crate::state::{ConnectionState, StateWaiter};

const CONFIRM_STATES: &[ConnectionState] = &[
    ConnectionState::BasicAckReceived,
    ConnectionState::BasicNackReceived,
    ConnectionState::ChannelCloseReceived,
];

impl Client {
    // Exchange and queue management -------------------------------------

    /// Verify the exchange exists, creating it if needed.
    pub async fn exchange_declare(
        &mut self,
        exchange: &str,
        exchange_type: &str,
        options: ExchangeDeclareOptions,
        arguments: Option<FieldTable>,
    ) -> Result<()> {
        validate_exchange_name("exchange", exchange)?;
        validate_short_string("exchange_type", exchange_type)?;
        self.management_call(
            ConnectionState::ExchangeDeclareSent,
            ConnectionState::ExchangeDeclareOkReceived,
            AMQPClass::Exchange(exchange::AMQPMethod::Declare(exchange::Declare {
                exchange: exchange.into(),
                kind: exchange_type.into(),
                passive: options.passive,
                durable: options.durable,
                auto_delete: options.auto_delete,
                internal: options.internal,
                nowait: false,
                arguments: arguments.unwrap_or_default(),
            })),
        )
        .await
    }

    /// Delete an exchange; all queue bindings on it are cancelled.
    pub async fn exchange_delete(&mut self, exchange: &str, if_unused: bool) -> Result<()> {
        validate_exchange_name("exchange", exchange)?;
        self.management_call(
            ConnectionState::ExchangeDeleteSent,
            ConnectionState::ExchangeDeleteOkReceived,
            AMQPClass::Exchange(exchange::AMQPMethod::Delete(exchange::Delete {
                exchange: exchange.into(),
                if_unused,
                nowait: false,
            })),
        )
        .await
    }

    /// Bind an exchange to an exchange.
    pub async fn exchange_bind(
        &mut self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: Option<FieldTable>,
    ) -> Result<()> {
        validate_exchange_name("destination", destination)?;
        validate_exchange_name("source", source)?;
        validate_short_string("routing_key", routing_key)?;
        self.management_call(
            ConnectionState::ExchangeBindSent,
            ConnectionState::ExchangeBindOkReceived,
            AMQPClass::Exchange(exchange::AMQPMethod::Bind(exchange::Bind {
                destination: destination.into(),
                source: source.into(),
                routing_key: routing_key.into(),
                nowait: false,
                arguments: arguments.unwrap_or_default(),
            })),
        )
        .await
    }

    /// Unbind an exchange from an exchange.
    pub async fn exchange_unbind(
        &mut self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: Option<FieldTable>,
    ) -> Result<()> {
        validate_exchange_name("destination", destination)?;
        validate_exchange_name("source", source)?;
        validate_short_string("routing_key", routing_key)?;
        self.management_call(
            ConnectionState::ExchangeUnbindSent,
            ConnectionState::ExchangeUnbindOkReceived,
            AMQPClass::Exchange(exchange::AMQPMethod::Unbind(exchange::Unbind {
                destination: destination.into(),
                source: source.into(),
                routing_key: routing_key.into(),
                nowait: false,
                arguments: arguments.unwrap_or_default(),
            })),
        )
        .await
    }

    /// Declare a queue, creating it if needed. Returns the message count
    /// and consumer count reported by the broker.
    pub async fn queue_declare(
        &mut self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: Option<FieldTable>,
    ) -> Result<(u32, u32)> {
        validate_short_string("queue", queue)?;
        self.management_call(
            ConnectionState::QueueDeclareSent,
            ConnectionState::QueueDeclareOkReceived,
            AMQPClass::Queue(queue::AMQPMethod::Declare(queue::Declare {
                queue: queue.into(),
                passive: options.passive,
                durable: options.durable,
                exclusive: options.exclusive,
                auto_delete: options.auto_delete,
                nowait: false,
                arguments: arguments.unwrap_or_default(),
            })),
        )
        .await?;
        match &self.inner.session.lock().last_frame {
            Some(AMQPClass::Queue(queue::AMQPMethod::DeclareOk(ok))) => {
                Ok((ok.message_count, ok.consumer_count))
            }
            other => {
                debug!(?other, "DeclareOk already superseded in the frame log");
                Ok((0, 0))
            }
        }
    }

    /// Delete a queue; pending messages go to the dead-letter queue if one
    /// is configured.
    pub async fn queue_delete(&mut self, queue: &str, options: QueueDeleteOptions) -> Result<()> {
        validate_short_string("queue", queue)?;
        self.management_call(
            ConnectionState::QueueDeleteSent,
            ConnectionState::QueueDeleteOkReceived,
            AMQPClass::Queue(queue::AMQPMethod::Delete(queue::Delete {
                queue: queue.into(),
                if_unused: options.if_unused,
                if_empty: options.if_empty,
                nowait: false,
            })),
        )
        .await
    }

    /// Bind a queue to an exchange.
    pub async fn queue_bind(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: Option<FieldTable>,
    ) -> Result<()> {
        validate_short_string("queue", queue)?;
        validate_exchange_name("exchange", exchange)?;
        validate_short_string("routing_key", routing_key)?;
        self.management_call(
            ConnectionState::QueueBindSent,
            ConnectionState::QueueBindOkReceived,
            AMQPClass::Queue(queue::AMQPMethod::Bind(queue::Bind {
                queue: queue.into(),
                exchange: exchange.into(),
                routing_key: routing_key.into(),
                nowait: false,
                arguments: arguments.unwrap_or_default(),
            })),
        )
        .await
    }

    /// Unbind a queue from an exchange.
    pub async fn queue_unbind(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: Option<FieldTable>,
    ) -> Result<()> {
        validate_short_string("queue", queue)?;
        validate_exchange_name("exchange", exchange)?;
        validate_short_string("routing_key", routing_key)?;
        self.management_call(
            ConnectionState::QueueUnbindSent,
            ConnectionState::QueueUnbindOkReceived,
            AMQPClass::Queue(queue::AMQPMethod::Unbind(queue::Unbind {
                queue: queue.into(),
                exchange: exchange.into(),
                routing_key: routing_key.into(),
                arguments: arguments.unwrap_or_default(),
            })),
        )
        .await
    }

    /// Remove all messages from a queue that are not awaiting
    /// acknowledgment. Returns the number of messages purged.
    pub async fn queue_purge(&mut self, queue: &str) -> Result<u32> {
        validate_short_string("queue", queue)?;
        self.management_call(
            ConnectionState::QueuePurgeSent,
            ConnectionState::QueuePurgeOkReceived,
            AMQPClass::Queue(queue::AMQPMethod::Purge(queue::Purge {
                queue: queue.into(),
                nowait: false,
            })),
        )
        .await?;
        match &self.inner.session.lock().last_frame {
            Some(AMQPClass::Queue(queue::AMQPMethod::PurgeOk(ok))) => Ok(ok.message_count),
            other => {
                debug!(?other, "PurgeOk already superseded in the frame log");
                Ok(0)
            }
        }
    }

    // Channel-level configuration ----------------------------------------

    /// Turn on publisher confirmations.
    pub async fn confirm_select(&mut self) -> Result<()> {
        if !self
            .inner
            .channel0
            .lock()
            .has_capability("publisher_confirms")
        {
            return Err(Error::NotSupported(
                "server does not support publisher confirmations".to_string(),
            ));
        }
        if self.inner.session.lock().publisher_confirms {
            return Err(Error::Validation(
                "publisher confirmations are already enabled".to_string(),
            ));
        }
        let waiter = self
            .inner
            .state
            .subscribe(&[ConnectionState::ConfirmSelectOkReceived]);
        self.request(
            ConnectionState::ConfirmSelectSent,
            AMQPClass::Confirm(confirm::AMQPMethod::Select(confirm::Select {
                nowait: false,
            })),
        )
        .await?;
        self.wait_on_state(waiter).await?;
        self.inner.session.lock().publisher_confirms = true;
        Ok(())
    }

    /// Specify quality of service. RabbitMQ interprets `global = false` as
    /// per-consumer and `global = true` as per-channel.
    pub async fn basic_qos(&mut self, options: QosOptions) -> Result<()> {
        let waiter = self
            .inner
            .state
            .subscribe(&[ConnectionState::BasicQosOkReceived]);
        self.request(
            ConnectionState::BasicQosSent,
            AMQPClass::Basic(basic::AMQPMethod::Qos(basic::Qos {
                prefetch_count: options.prefetch_count,
                global: options.global,
            })),
        )
        .await?;
        self.wait_not_implemented_aware(waiter).await
    }

    /// Ask the server to redeliver all unacknowledged messages on the
    /// channel. RabbitMQ only implements `requeue = true`.
    pub async fn basic_recover(&mut self, requeue: bool) -> Result<()> {
        let waiter = self
            .inner
            .state
            .subscribe(&[ConnectionState::BasicRecoverOkReceived]);
        self.request(
            ConnectionState::BasicRecoverSent,
            AMQPClass::Basic(basic::AMQPMethod::Recover(basic::Recover { requeue })),
        )
        .await?;
        self.wait_not_implemented_aware(waiter).await
    }

    /// Select standard transaction mode. Must be called before
    /// [`Client::tx_commit`] or [`Client::tx_rollback`].
    pub async fn tx_select(&mut self) -> Result<()> {
        let waiter = self
            .inner
            .state
            .subscribe(&[ConnectionState::TxSelectOkReceived]);
        self.request(
            ConnectionState::TxSelectSent,
            AMQPClass::Tx(tx::AMQPMethod::Select(tx::Select {})),
        )
        .await?;
        self.inner.session.lock().transactional = true;
        self.wait_on_state(waiter).await?;
        Ok(())
    }

    /// Commit the current transaction; a new one starts immediately.
    pub async fn tx_commit(&mut self) -> Result<()> {
        if !self.inner.session.lock().transactional {
            return Err(Error::NoTransaction);
        }
        let waiter = self
            .inner
            .state
            .subscribe(&[ConnectionState::TxCommitOkReceived]);
        self.request(
            ConnectionState::TxCommitSent,
            AMQPClass::Tx(tx::AMQPMethod::Commit(tx::Commit {})),
        )
        .await?;
        self.wait_on_state(waiter).await?;
        Ok(())
    }

    /// Abandon the current transaction. Unacked messages are not
    /// automatically redelivered; issue an explicit recover for that.
    pub async fn tx_rollback(&mut self) -> Result<()> {
        if !self.inner.session.lock().transactional {
            return Err(Error::NoTransaction);
        }
        let waiter = self
            .inner
            .state
            .subscribe(&[ConnectionState::TxRollbackOkReceived]);
        self.request(
            ConnectionState::TxRollbackSent,
            AMQPClass::Tx(tx::AMQPMethod::Rollback(tx::Rollback {})),
        )
        .await?;
        self.wait_on_state(waiter).await?;
        Ok(())
    }

    /// Update the connection secret (RabbitMQ extension, e.g. refreshed
    /// OAuth tokens).
    pub async fn update_secret(&mut self, secret: &str, reason: &str) -> Result<()> {
        validate_short_string("reason", reason)?;
        let waiter = self
            .inner
            .state
            .subscribe(&[ConnectionState::UpdateSecretOkReceived]);
        self.inner.state.set(ConnectionState::UpdateSecretSent)?;
        let frame = self.inner.channel0.lock().update_secret_frame(secret, reason);
        self.inner.write_frame(frame).await?;
        self.wait_on_state(waiter).await?;
        Ok(())
    }

    // Acknowledgements (fire and forget) ---------------------------------

    /// Acknowledge one or more delivered messages. No reply is expected
    /// from the broker and none is awaited.
    pub async fn basic_ack(&mut self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.request(
            ConnectionState::BasicAckSent,
            AMQPClass::Basic(basic::AMQPMethod::Ack(basic::Ack {
                delivery_tag,
                multiple,
            })),
        )
        .await
    }

    /// Reject one or more incoming messages.
    pub async fn basic_nack(
        &mut self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<()> {
        self.request(
            ConnectionState::BasicNackSent,
            AMQPClass::Basic(basic::AMQPMethod::Nack(basic::Nack {
                delivery_tag,
                multiple,
                requeue,
            })),
        )
        .await
    }

    /// Reject an incoming message.
    pub async fn basic_reject(&mut self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.request(
            ConnectionState::BasicRejectSent,
            AMQPClass::Basic(basic::AMQPMethod::Reject(basic::Reject {
                delivery_tag,
                requeue,
            })),
        )
        .await
    }

    // Consuming ----------------------------------------------------------

    /// Start a queue consumer. `callback` is invoked with each delivered
    /// [`Message`]; the returned consumer tag identifies the subscription
    /// for [`Client::basic_cancel`].
    pub async fn basic_consume(
        &mut self,
        queue: &str,
        consumer_tag: Option<&str>,
        options: ConsumeOptions,
        arguments: Option<FieldTable>,
        callback: impl MessageCallback,
    ) -> Result<String> {
        validate_short_string("queue", queue)?;
        if let Some(tag) = consumer_tag {
            validate_short_string("consumer_tag", tag)?;
        }
        let (tx, rx) = oneshot::channel();
        let pending_id = {
            let mut session = self.inner.session.lock();
            session.next_pending_id += 1;
            let id = session.next_pending_id;
            session.pending_consumers.push_back(PendingConsumer {
                id,
                tx,
                callback: std::sync::Arc::new(callback),
            });
            id
        };
        let waiter = self.inner.state.subscribe(&[
            ConnectionState::BasicConsumeOkReceived,
            ConnectionState::ChannelCloseReceived,
        ]);
        let written = self
            .request(
                ConnectionState::BasicConsumeSent,
                AMQPClass::Basic(basic::AMQPMethod::Consume(basic::Consume {
                    queue: queue.into(),
                    consumer_tag: consumer_tag.unwrap_or("").into(),
                    no_local: options.no_local,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                    arguments: arguments.unwrap_or_default(),
                })),
            )
            .await;
        if let Err(err) = written {
            self.remove_pending_consumer(pending_id);
            return Err(err);
        }
        let fired = match self.wait_on_state(waiter).await {
            Ok(fired) => fired,
            Err(err) => {
                self.remove_pending_consumer(pending_id);
                return Err(err);
            }
        };
        if fired == ConnectionState::ChannelCloseReceived {
            self.remove_pending_consumer(pending_id);
            let err = self.last_close_error();
            self.await_reopen().await?;
            return Err(err);
        }
        rx.await.map_err(|_| Error::ConnectionClosed)
    }

    /// End a queue consumer. Messages already in flight may still be
    /// delivered before the cancellation takes effect.
    pub async fn basic_cancel(&mut self, consumer_tag: &str) -> Result<()> {
        validate_short_string("consumer_tag", consumer_tag)?;
        let waiter = self
            .inner
            .state
            .subscribe(&[ConnectionState::BasicCancelOkReceived]);
        self.request(
            ConnectionState::BasicCancelSent,
            AMQPClass::Basic(basic::AMQPMethod::Cancel(basic::Cancel {
                consumer_tag: consumer_tag.into(),
                nowait: false,
            })),
        )
        .await?;
        self.wait_on_state(waiter).await?;
        self.inner.session.lock().consumers.remove(consumer_tag);
        Ok(())
    }

    /// Fetch a single message from a queue. Resolves to `None` when the
    /// queue is empty. Only one `basic_get` may be outstanding at a time.
    pub async fn basic_get(&mut self, queue: &str, no_ack: bool) -> Result<Option<Message>> {
        validate_short_string("queue", queue)?;
        let (tx, mut rx) = oneshot::channel();
        {
            let mut session = self.inner.session.lock();
            if session.pending_get.is_some() {
                return Err(Error::Validation(
                    "a basic.get is already outstanding".to_string(),
                ));
            }
            session.pending_get = Some(tx);
        }
        let close_waiter = self
            .inner
            .state
            .subscribe(&[ConnectionState::ChannelCloseReceived]);
        let written = self
            .request(
                ConnectionState::BasicGetSent,
                AMQPClass::Basic(basic::AMQPMethod::Get(basic::Get {
                    queue: queue.into(),
                    no_ack,
                })),
            )
            .await;
        if let Err(err) = written {
            self.inner.session.lock().pending_get = None;
            return Err(err);
        }
        tokio::select! {
            outcome = &mut rx => outcome.map_err(|_| Error::ConnectionClosed),
            fired = close_waiter.wait() => {
                self.inner.session.lock().pending_get = None;
                match fired {
                    Ok(_) => {
                        let err = self.last_close_error();
                        self.await_reopen().await?;
                        Err(err)
                    }
                    Err(err) => {
                        if err.is_amqp() {
                            self.reconnect().await?;
                        }
                        Err(err)
                    }
                }
            }
        }
    }

    // Publishing ---------------------------------------------------------

    /// Publish a message.
    ///
    /// Returns `None` when publisher confirmations are off. With
    /// confirmations enabled (see [`Client::confirm_select`]) the call
    /// suspends until the broker confirms this delivery tag and returns
    /// `Some(true)` on ack, `Some(false)` on nack or when the channel was
    /// closed while waiting. A mandatory or immediate publish that cannot
    /// be routed comes back through the registered message-return
    /// callback.
    pub async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        options: PublishOptions,
        properties: Properties,
    ) -> Result<Option<bool>> {
        validate_exchange_name("exchange", exchange)?;
        validate_short_string("routing_key", routing_key)?;
        properties.validate()?;

        let max_frame = self.inner.channel0.lock().max_frame_size() as usize;
        let (channel_id, delivery_tag, confirming) = {
            let mut session = self.inner.session.lock();
            session.next_delivery_tag += 1;
            (
                session.channel,
                session.next_delivery_tag,
                session.publisher_confirms,
            )
        };
        debug!(
            delivery_tag,
            exchange, routing_key, "publishing {} byte message", body.len()
        );

        let method = AMQPClass::Basic(basic::AMQPMethod::Publish(basic::Publish {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            mandatory: options.mandatory,
            immediate: options.immediate,
        }));
        let class_id = method.get_amqp_class_id();
        let mut frames = Vec::with_capacity(2 + body.len().div_ceil(max_frame.max(1)));
        frames.push(AMQPFrame::Method(channel_id, method));
        frames.push(AMQPFrame::Header(
            channel_id,
            class_id,
            Box::new(AMQPContentHeader {
                class_id,
                body_size: body.len() as u64,
                properties: properties.to_amqp(),
            }),
        ));
        for chunk in body.chunks(max_frame) {
            frames.push(AMQPFrame::Body(channel_id, chunk.to_vec()));
        }

        let waiter = if confirming {
            Some(self.inner.state.subscribe(CONFIRM_STATES))
        } else {
            None
        };
        // The reader task may dispatch the confirm the moment the frames
        // reach the socket, so the publish states are entered before the
        // write rather than interleaved with it.
        self.inner.state.set(ConnectionState::BasicPublishSent)?;
        self.inner.state.set(ConnectionState::ContentHeaderSent)?;
        self.inner.state.set(ConnectionState::ContentBodySent)?;
        self.inner.write_frames(&frames).await?;

        let Some(mut current) = waiter else {
            return Ok(None);
        };
        loop {
            // A confirm for this tag may already have been recorded while a
            // confirm for a concurrent publish woke us.
            {
                let mut session = self.inner.session.lock();
                if session.acks.take(delivery_tag) {
                    return Ok(Some(true));
                }
                if session.nacks.take(delivery_tag) {
                    return Ok(Some(false));
                }
            }
            let fired = self.wait_on_state(current).await?;
            if fired == ConnectionState::ChannelCloseReceived {
                self.await_reopen().await?;
                return Ok(Some(false));
            }
            current = self.inner.state.subscribe(CONFIRM_STATES);
        }
    }

    // Shared plumbing ----------------------------------------------------

    /// Enter the `*Sent` state and write the method frame on the data
    /// channel. The state is set first: the reader task may dispatch the
    /// response before the write future resolves, and the transition table
    /// requires the request state to be current by then.
    async fn request(&self, sent: ConnectionState, class: AMQPClass) -> Result<()> {
        self.inner.state.set(sent)?;
        let channel_id = self.inner.session.lock().channel;
        self.inner
            .write_frame(AMQPFrame::Method(channel_id, class))
            .await
    }

    /// Await a registered waiter, reconnecting first when an AMQP-level
    /// error surfaces through it. The original error is re-raised so the
    /// triggering operation still fails.
    async fn wait_on_state(&mut self, waiter: StateWaiter) -> Result<ConnectionState> {
        match waiter.wait().await {
            Err(err) if err.is_amqp() => {
                warn!(error = %err, "AMQP error while waiting on state, reconnecting");
                Box::pin(self.reconnect()).await?;
                Err(err)
            }
            outcome => outcome,
        }
    }

    /// Like `wait_on_state`, but translates a server-side NotImplemented
    /// close into the stable client error for unsupported commands.
    async fn wait_not_implemented_aware(&mut self, waiter: StateWaiter) -> Result<()> {
        match self.wait_on_state(waiter).await {
            Ok(_) => Ok(()),
            Err(Error::Broker(BrokerError::NotImplemented(text))) => {
                Err(Error::NotImplementedOnServer(text))
            }
            Err(err) => Err(err),
        }
    }

    /// Send a management request and wait for its Ok state or a
    /// broker-initiated channel close. On close, the reply code is mapped
    /// through the error table and raised after the automatic channel
    /// re-open completes, leaving the channel usable.
    async fn management_call(
        &mut self,
        sent: ConnectionState,
        ok: ConnectionState,
        class: AMQPClass,
    ) -> Result<()> {
        let waiter = self
            .inner
            .state
            .subscribe(&[ok, ConnectionState::ChannelCloseReceived]);
        self.request(sent, class).await?;
        let fired = self.wait_on_state(waiter).await?;
        if fired == ConnectionState::ChannelCloseReceived {
            let err = self.last_close_error();
            self.await_reopen().await?;
            return Err(err);
        }
        Ok(())
    }

    /// The typed error for the channel close most recently received.
    fn last_close_error(&self) -> Error {
        match self.inner.session.lock().last_channel_close.take() {
            Some((reply_code, reply_text)) => {
                BrokerError::from_reply(reply_code, &reply_text).into()
            }
            None => Error::ConnectionClosed,
        }
    }

    /// Wait for the automatic channel re-open scheduled by the dispatch of
    /// a broker-initiated Channel.Close.
    async fn await_reopen(&mut self) -> Result<()> {
        if self.inner.session.lock().channel_open {
            return Ok(());
        }
        let waiter = self
            .inner
            .state
            .subscribe(&[ConnectionState::ChannelOpenOkReceived]);
        if self.inner.session.lock().channel_open {
            return Ok(());
        }
        waiter.wait().await?;
        Ok(())
    }

    fn remove_pending_consumer(&self, id: u64) {
        self.inner
            .session
            .lock()
            .pending_consumers
            .retain(|pending| pending.id != id);
    }
}
