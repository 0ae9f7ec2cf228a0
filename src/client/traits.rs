// ABOUTME: Callback capability implemented by message handlers
// ABOUTME: Blanket-implemented for async closures so plain functions work directly

use std::future::Future;
use std::pin::Pin;

use crate::message::Message;

/// Future returned by a message callback; scheduled on the runtime by the
/// dispatcher.
pub type CallbackFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Receives messages from the broker.
///
/// Used both for consumer deliveries registered with `basic_consume` and
/// for the returned-message handler registered with
/// `register_message_return_callback`. Any `Fn(Message) -> impl Future`
/// closure qualifies:
///
/// ```rust,no_run
/// # use amqp091::{Client, ConsumeOptions, Message};
/// # async fn example(client: &mut Client) -> amqp091::Result<()> {
/// let tag = client
///     .basic_consume(
///         "work",
///         None,
///         ConsumeOptions::default(),
///         None,
///         |message: Message| async move {
///             println!("received {} bytes", message.body().len());
///         },
///     )
///     .await?;
/// # Ok(())
/// # }
/// ```
pub trait MessageCallback: Send + Sync + 'static {
    fn on_message(&self, message: Message) -> CallbackFuture;
}

impl<F, Fut> MessageCallback for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn on_message(&self, message: Message) -> CallbackFuture {
        Box::pin(self(message))
    }
}
