// ABOUTME: Connection state machine with the table of legal transitions
// ABOUTME: Provides the wait-for-state primitive that all client operations suspend on

use std::fmt;
use std::time::{Duration, Instant};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::client::error::{Error, Result};

/// Every state the client connection can be in.
///
/// The integer tag is the primary identity of a state and is stable across
/// the transition table; the `Display` impl provides the descriptive name
/// used in logs and error messages.
///
/// States fall into three groups: connection lifecycle (`Disconnected`
/// through `Opened`, `Closing`, `Closed`), one `*Sent`/`*Received` pair per
/// request/response exchange on the data channel, and the two universal
/// states `Uninitialized` and `ExceptionRaised`.
#[derive(Clone, Copy, Debug, Eq, Hash, IntoPrimitive, PartialEq, TryFromPrimitive)]
#[repr(u16)]
pub enum ConnectionState {
    Uninitialized = 0x00,
    ExceptionRaised = 0x01,
    Disconnected = 0x11,
    Connecting = 0x12,
    Connected = 0x13,
    Opened = 0x14,
    UpdateSecretSent = 0x15,
    UpdateSecretOkReceived = 0x16,
    OpeningChannel = 0x17,
    ChannelOpenSent = 0x20,
    ChannelOpenOkReceived = 0x21,
    ChannelCloseReceived = 0x22,
    ChannelCloseSent = 0x23,
    ChannelCloseOkReceived = 0x24,
    ChannelCloseOkSent = 0x25,
    ChannelFlowReceived = 0x26,
    ChannelFlowOkSent = 0x27,
    ConfirmSelectSent = 0x30,
    ConfirmSelectOkReceived = 0x31,
    ExchangeBindSent = 0x40,
    ExchangeBindOkReceived = 0x41,
    ExchangeDeclareSent = 0x42,
    ExchangeDeclareOkReceived = 0x43,
    ExchangeDeleteSent = 0x44,
    ExchangeDeleteOkReceived = 0x45,
    ExchangeUnbindSent = 0x46,
    ExchangeUnbindOkReceived = 0x47,
    QueueBindSent = 0x50,
    QueueBindOkReceived = 0x51,
    QueueDeclareSent = 0x52,
    QueueDeclareOkReceived = 0x53,
    QueueDeleteSent = 0x54,
    QueueDeleteOkReceived = 0x55,
    QueuePurgeSent = 0x56,
    QueuePurgeOkReceived = 0x57,
    QueueUnbindSent = 0x58,
    QueueUnbindOkReceived = 0x59,
    TxSelectSent = 0x60,
    TxSelectOkReceived = 0x61,
    TxCommitSent = 0x62,
    TxCommitOkReceived = 0x63,
    TxRollbackSent = 0x64,
    TxRollbackOkReceived = 0x65,
    BasicAckReceived = 0x70,
    BasicAckSent = 0x71,
    BasicCancelReceived = 0x72,
    BasicCancelSent = 0x73,
    BasicCancelOkReceived = 0x74,
    BasicCancelOkSent = 0x75,
    BasicConsumeSent = 0x76,
    BasicConsumeOkReceived = 0x77,
    BasicDeliverReceived = 0x78,
    ContentHeaderReceived = 0x79,
    ContentBodyReceived = 0x80,
    BasicGetSent = 0x81,
    BasicGetEmptyReceived = 0x82,
    BasicGetOkReceived = 0x83,
    BasicNackReceived = 0x84,
    BasicNackSent = 0x85,
    BasicPublishSent = 0x86,
    ContentHeaderSent = 0x87,
    ContentBodySent = 0x88,
    BasicQosSent = 0x89,
    BasicQosOkReceived = 0x90,
    BasicRecoverSent = 0x91,
    BasicRecoverOkReceived = 0x92,
    BasicRejectReceived = 0x93,
    BasicRejectSent = 0x94,
    BasicReturnReceived = 0x95,
    MessageAssembled = 0x96,
    Closing = 0x100,
    Closed = 0x101,
}

/// States a new client-initiated operation may legally enter from once the
/// channel is open. Shared successor set for the post-acknowledgement
/// states.
const IDLE: &[ConnectionState] = &[
    ConnectionState::UpdateSecretSent,
    ConnectionState::BasicCancelSent,
    ConnectionState::ChannelCloseReceived,
    ConnectionState::ChannelCloseSent,
    ConnectionState::ChannelFlowReceived,
    ConnectionState::ConfirmSelectSent,
    ConnectionState::ExchangeBindSent,
    ConnectionState::ExchangeDeclareSent,
    ConnectionState::ExchangeDeleteSent,
    ConnectionState::ExchangeUnbindSent,
    ConnectionState::QueueBindSent,
    ConnectionState::QueueDeclareSent,
    ConnectionState::QueueDeleteSent,
    ConnectionState::QueuePurgeSent,
    ConnectionState::QueueUnbindSent,
    ConnectionState::TxSelectSent,
    ConnectionState::TxCommitSent,
    ConnectionState::TxRollbackSent,
    ConnectionState::BasicConsumeSent,
    ConnectionState::BasicDeliverReceived,
    ConnectionState::BasicGetSent,
    ConnectionState::BasicPublishSent,
    ConnectionState::BasicQosSent,
    ConnectionState::BasicRecoverSent,
    ConnectionState::Closing,
    ConnectionState::Closed,
];

impl ConnectionState {
    /// Whether `next` is a legal successor of `self` in the transition
    /// table. Entering the current state again is handled by the caller and
    /// never consults the table.
    pub(crate) fn allows(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match self {
            Uninitialized => next == Disconnected,
            ExceptionRaised => matches!(next, Closing | Closed | Disconnected),
            Disconnected => next == Connecting,
            Connecting => matches!(next, Connected | Closed),
            Connected => matches!(next, Opened | Closed),
            Opened => next == OpeningChannel,
            OpeningChannel => next == ChannelOpenSent,
            UpdateSecretSent => next == UpdateSecretOkReceived,
            UpdateSecretOkReceived => IDLE.contains(&next),
            ChannelOpenSent => next == ChannelOpenOkReceived,
            ChannelOpenOkReceived => IDLE.contains(&next),
            ChannelCloseReceived => next == ChannelCloseOkSent,
            ChannelCloseSent => next == ChannelCloseOkReceived,
            ChannelCloseOkReceived => matches!(next, OpeningChannel | Closing),
            ChannelCloseOkSent => next == OpeningChannel,
            ChannelFlowReceived => next == ChannelFlowOkSent,
            ChannelFlowOkSent => IDLE.contains(&next),
            ConfirmSelectSent => next == ConfirmSelectOkReceived,
            ConfirmSelectOkReceived => IDLE.contains(&next),
            ExchangeBindSent => matches!(next, ChannelCloseReceived | ExchangeBindOkReceived),
            ExchangeBindOkReceived => IDLE.contains(&next),
            ExchangeDeclareSent => matches!(next, ChannelCloseReceived | ExchangeDeclareOkReceived),
            ExchangeDeclareOkReceived => IDLE.contains(&next),
            ExchangeDeleteSent => matches!(next, ChannelCloseReceived | ExchangeDeleteOkReceived),
            ExchangeDeleteOkReceived => IDLE.contains(&next),
            ExchangeUnbindSent => matches!(next, ChannelCloseReceived | ExchangeUnbindOkReceived),
            ExchangeUnbindOkReceived => IDLE.contains(&next),
            QueueBindSent => matches!(next, ChannelCloseReceived | QueueBindOkReceived),
            QueueBindOkReceived => IDLE.contains(&next),
            QueueDeclareSent => matches!(next, ChannelCloseReceived | QueueDeclareOkReceived),
            QueueDeclareOkReceived => IDLE.contains(&next),
            QueueDeleteSent => matches!(next, ChannelCloseReceived | QueueDeleteOkReceived),
            QueueDeleteOkReceived => IDLE.contains(&next),
            QueuePurgeSent => matches!(next, ChannelCloseReceived | QueuePurgeOkReceived),
            QueuePurgeOkReceived => IDLE.contains(&next),
            QueueUnbindSent => matches!(next, ChannelCloseReceived | QueueUnbindOkReceived),
            QueueUnbindOkReceived => IDLE.contains(&next),
            TxSelectSent => next == TxSelectOkReceived,
            TxSelectOkReceived => {
                IDLE.contains(&next) || matches!(next, TxCommitSent | TxRollbackSent)
            }
            TxCommitSent => next == TxCommitOkReceived,
            TxCommitOkReceived => IDLE.contains(&next),
            TxRollbackSent => next == TxRollbackOkReceived,
            TxRollbackOkReceived => IDLE.contains(&next),
            BasicAckReceived => IDLE.contains(&next),
            BasicAckSent => IDLE.contains(&next),
            BasicCancelReceived => IDLE.contains(&next),
            BasicCancelSent => next == BasicCancelOkReceived,
            BasicCancelOkReceived => IDLE.contains(&next),
            BasicCancelOkSent => IDLE.contains(&next),
            BasicConsumeSent => matches!(next, ChannelCloseReceived | BasicConsumeOkReceived),
            BasicConsumeOkReceived => IDLE.contains(&next),
            BasicDeliverReceived => next == ContentHeaderReceived,
            // A zero-length body completes straight after the header.
            ContentHeaderReceived => matches!(next, ContentBodyReceived | MessageAssembled),
            ContentBodyReceived => next == MessageAssembled,
            BasicGetSent => {
                matches!(
                    next,
                    ChannelCloseReceived | BasicGetEmptyReceived | BasicGetOkReceived
                )
            }
            BasicGetEmptyReceived => IDLE.contains(&next),
            BasicGetOkReceived => next == ContentHeaderReceived,
            BasicNackReceived => IDLE.contains(&next),
            BasicNackSent => IDLE.contains(&next),
            BasicPublishSent => next == ContentHeaderSent,
            ContentHeaderSent => next == ContentBodySent,
            ContentBodySent => {
                IDLE.contains(&next)
                    || matches!(
                        next,
                        BasicAckReceived
                            | BasicNackReceived
                            | BasicRejectReceived
                            | BasicReturnReceived
                    )
            }
            BasicQosSent => matches!(next, ChannelCloseReceived | BasicQosOkReceived),
            BasicQosOkReceived => IDLE.contains(&next),
            BasicRecoverSent => next == BasicRecoverOkReceived,
            BasicRecoverOkReceived => IDLE.contains(&next),
            BasicRejectReceived => IDLE.contains(&next),
            BasicRejectSent => IDLE.contains(&next),
            BasicReturnReceived => next == ContentHeaderReceived,
            MessageAssembled => {
                IDLE.contains(&next)
                    || matches!(
                        next,
                        BasicAckReceived
                            | BasicAckSent
                            | BasicNackSent
                            | BasicNackReceived
                            | BasicRejectSent
                            | BasicRejectReceived
                    )
            }
            Closing => next == Closed,
            Closed => next == Connecting,
        }
    }

    fn description(self) -> &'static str {
        use ConnectionState::*;
        match self {
            Uninitialized => "Uninitialized",
            ExceptionRaised => "Exception Raised",
            Disconnected => "Disconnected",
            Connecting => "Connecting",
            Connected => "Connected",
            Opened => "Opened",
            UpdateSecretSent => "Updating Secret",
            UpdateSecretOkReceived => "Secret Updated",
            OpeningChannel => "Opening Channel",
            ChannelOpenSent => "Channel Requested",
            ChannelOpenOkReceived => "Channel Open",
            ChannelCloseReceived => "Channel Close Received",
            ChannelCloseSent => "Channel Close Sent",
            ChannelCloseOkReceived => "Channel CloseOk Received",
            ChannelCloseOkSent => "Channel CloseOk Sent",
            ChannelFlowReceived => "Channel Flow Received",
            ChannelFlowOkSent => "Channel FlowOk Sent",
            ConfirmSelectSent => "Enabling Publisher Confirmations",
            ConfirmSelectOkReceived => "Publisher Confirmations Enabled",
            ExchangeBindSent => "Binding Exchange",
            ExchangeBindOkReceived => "Exchange Bound",
            ExchangeDeclareSent => "Declaring Exchange",
            ExchangeDeclareOkReceived => "Exchange Declared",
            ExchangeDeleteSent => "Deleting Exchange",
            ExchangeDeleteOkReceived => "Exchange Deleted",
            ExchangeUnbindSent => "Unbinding Exchange",
            ExchangeUnbindOkReceived => "Exchange Unbound",
            QueueBindSent => "Binding Queue",
            QueueBindOkReceived => "Queue Bound",
            QueueDeclareSent => "Declaring Queue",
            QueueDeclareOkReceived => "Queue Declared",
            QueueDeleteSent => "Deleting Queue",
            QueueDeleteOkReceived => "Queue Deleted",
            QueuePurgeSent => "Purging Queue",
            QueuePurgeOkReceived => "Queue Purged",
            QueueUnbindSent => "Unbinding Queue",
            QueueUnbindOkReceived => "Queue Unbound",
            TxSelectSent => "Starting Transaction",
            TxSelectOkReceived => "Transaction Started",
            TxCommitSent => "Committing Transaction",
            TxCommitOkReceived => "Transaction Committed",
            TxRollbackSent => "Aborting Transaction",
            TxRollbackOkReceived => "Transaction Aborted",
            BasicAckReceived => "Received Message Acknowledgement",
            BasicAckSent => "Sent Message Acknowledgement",
            BasicCancelReceived => "Server Cancelled Consumer",
            BasicCancelSent => "Cancelling Consumer",
            BasicCancelOkReceived => "Consumer Cancelled",
            BasicCancelOkSent => "Acknowledged Cancelled Consumer",
            BasicConsumeSent => "Initiating Consuming of Messages",
            BasicConsumeOkReceived => "Consuming of Messages Initiated",
            BasicDeliverReceived => "Server Delivered Message",
            ContentHeaderReceived => "Received Content Header",
            ContentBodyReceived => "Received Content Body",
            BasicGetSent => "Requesting Individual Message",
            BasicGetEmptyReceived => "Message Not Available",
            BasicGetOkReceived => "Individual Message To Be Delivered",
            BasicNackReceived => "Server Sent Negative Acknowledgement",
            BasicNackSent => "Sending Negative Acknowledgement",
            BasicPublishSent => "Publishing Message",
            ContentHeaderSent => "Message Content Header Sent",
            ContentBodySent => "Message Body Sent",
            BasicQosSent => "Setting QoS",
            BasicQosOkReceived => "QoS Set",
            BasicRecoverSent => "Sending Recover Request",
            BasicRecoverOkReceived => "Recover Request Received",
            BasicRejectReceived => "Server Rejected Message",
            BasicRejectSent => "Sending Message Rejection",
            BasicReturnReceived => "Server Returned Message",
            MessageAssembled => "Message Assembled",
            Closing => "Closing",
            Closed => "Closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

struct Waiter {
    awaited: Vec<ConnectionState>,
    tx: oneshot::Sender<Result<ConnectionState>>,
}

struct Inner {
    state: ConnectionState,
    entered_at: Instant,
    exception: Option<Error>,
    waiters: Vec<Waiter>,
}

/// Tracks the connection state and wakes the operations suspended on it.
///
/// Waiters register with [`StateManager::subscribe`] *before* the request
/// frame is written and await the returned [`StateWaiter`] afterwards, so a
/// response dispatched in between cannot be lost. Wakes are delivered
/// through a channel, never inline: the transitioning code finishes its
/// book-keeping before any awakened task runs.
pub(crate) struct StateManager {
    inner: Mutex<Inner>,
}

impl StateManager {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ConnectionState::Uninitialized,
                entered_at: Instant::now(),
                exception: None,
                waiters: Vec::new(),
            }),
        }
    }

    pub(crate) fn current(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// How long the current state has been active.
    pub(crate) fn time_in_state(&self) -> Duration {
        self.inner.lock().entered_at.elapsed()
    }

    /// Transition to `next`, validating against the table. Re-entering the
    /// current state skips validation and book-keeping but still signals
    /// waiters on that state: two Basic.Ack frames in a row both land in
    /// `BasicAckReceived` and each must wake its publisher.
    pub(crate) fn set(&self, next: ConnectionState) -> Result<()> {
        let mut inner = self.inner.lock();
        if next != inner.state {
            if !inner.state.allows(next) {
                return Err(Error::InvalidStateTransition {
                    from: inner.state.to_string(),
                    to: next.to_string(),
                });
            }
            debug!(
                from = %inner.state,
                from_tag = u16::from(inner.state),
                to = %next,
                to_tag = u16::from(next),
                elapsed = ?inner.entered_at.elapsed(),
                "state transition"
            );
            inner.state = next;
            inner.entered_at = Instant::now();
        }
        let mut idx = 0;
        while idx < inner.waiters.len() {
            if inner.waiters[idx].tx.is_closed() {
                inner.waiters.swap_remove(idx);
            } else if inner.waiters[idx].awaited.contains(&next) {
                let waiter = inner.waiters.swap_remove(idx);
                let _ = waiter.tx.send(Ok(next));
            } else {
                idx += 1;
            }
        }
        Ok(())
    }

    /// Force the state to `ExceptionRaised` and re-raise the error into
    /// every pending waiter. With no waiter pending the error is stored and
    /// taken by the next `subscribe` call.
    pub(crate) fn set_exception(&self, err: Error) {
        let mut inner = self.inner.lock();
        warn!(state = %inner.state, error = %err, "exception raised");
        inner.state = ConnectionState::ExceptionRaised;
        inner.entered_at = Instant::now();
        let waiters = std::mem::take(&mut inner.waiters);
        if waiters.is_empty() {
            inner.exception = Some(err);
        } else {
            inner.exception = None;
            for waiter in waiters {
                let _ = waiter.tx.send(Err(err.clone()));
            }
        }
    }

    /// Register a waiter on each of the given states. The registration is
    /// live as soon as this returns; awaiting the waiter later observes any
    /// transition that happened in between. A stored exception is taken
    /// (cleared from the manager) and delivered instead.
    pub(crate) fn subscribe(&self, awaited: &[ConnectionState]) -> StateWaiter {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        if let Some(err) = inner.exception.take() {
            let _ = tx.send(Err(err));
        } else {
            inner.waiters.push(Waiter {
                awaited: awaited.to_vec(),
                tx,
            });
        }
        StateWaiter { rx }
    }

    /// Register and immediately await; returns the state that fired.
    pub(crate) async fn wait_for(&self, awaited: &[ConnectionState]) -> Result<ConnectionState> {
        self.subscribe(awaited).wait().await
    }

    /// Hard reset used by reconnect: back to `Closed` without consulting
    /// the table. Outstanding waiters are failed, not leaked.
    pub(crate) fn reset_to_closed(&self) {
        let mut inner = self.inner.lock();
        inner.state = ConnectionState::Closed;
        inner.entered_at = Instant::now();
        inner.exception = None;
        for waiter in std::mem::take(&mut inner.waiters) {
            let _ = waiter.tx.send(Err(Error::ConnectionClosed));
        }
    }
}

/// A registered wait on one or more states.
pub(crate) struct StateWaiter {
    rx: oneshot::Receiver<Result<ConnectionState>>,
}

impl StateWaiter {
    /// Suspend until one of the awaited states is entered or an exception
    /// is raised into the manager.
    pub(crate) async fn wait(self) -> Result<ConnectionState> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::ConnectionClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opened_manager() -> StateManager {
        let manager = StateManager::new();
        manager.set(ConnectionState::Disconnected).unwrap();
        manager.set(ConnectionState::Connecting).unwrap();
        manager.set(ConnectionState::Connected).unwrap();
        manager.set(ConnectionState::Opened).unwrap();
        manager.set(ConnectionState::OpeningChannel).unwrap();
        manager.set(ConnectionState::ChannelOpenSent).unwrap();
        manager.set(ConnectionState::ChannelOpenOkReceived).unwrap();
        manager
    }

    #[test]
    fn legal_transition_chain() {
        let manager = opened_manager();
        assert_eq!(manager.current(), ConnectionState::ChannelOpenOkReceived);
        manager.set(ConnectionState::ExchangeDeclareSent).unwrap();
        manager
            .set(ConnectionState::ExchangeDeclareOkReceived)
            .unwrap();
        assert_eq!(
            manager.current(),
            ConnectionState::ExchangeDeclareOkReceived
        );
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let manager = StateManager::new();
        let err = manager.set(ConnectionState::Connected).unwrap_err();
        match err {
            Error::InvalidStateTransition { from, to } => {
                assert_eq!(from, "Uninitialized");
                assert_eq!(to, "Connected");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(manager.current(), ConnectionState::Uninitialized);
    }

    #[test]
    fn same_state_reentry_is_a_noop() {
        let manager = opened_manager();
        manager.set(ConnectionState::ChannelOpenOkReceived).unwrap();
        assert_eq!(manager.current(), ConnectionState::ChannelOpenOkReceived);
    }

    #[test]
    fn every_idle_member_is_reachable_from_channel_open() {
        for state in IDLE {
            assert!(
                ConnectionState::ChannelOpenOkReceived.allows(*state),
                "{state} unreachable from Channel Open"
            );
        }
    }

    #[tokio::test]
    async fn waiter_observes_transition_registered_before_it() {
        let manager = opened_manager();
        let waiter = manager.subscribe(&[ConnectionState::ExchangeDeclareOkReceived]);
        manager.set(ConnectionState::ExchangeDeclareSent).unwrap();
        manager
            .set(ConnectionState::ExchangeDeclareOkReceived)
            .unwrap();
        assert_eq!(
            waiter.wait().await.unwrap(),
            ConnectionState::ExchangeDeclareOkReceived
        );
    }

    #[tokio::test]
    async fn multi_state_wait_returns_the_state_that_fired() {
        let manager = opened_manager();
        let waiter = manager.subscribe(&[
            ConnectionState::QueueDeclareOkReceived,
            ConnectionState::ChannelCloseReceived,
        ]);
        manager.set(ConnectionState::QueueDeclareSent).unwrap();
        manager.set(ConnectionState::ChannelCloseReceived).unwrap();
        assert_eq!(
            waiter.wait().await.unwrap(),
            ConnectionState::ChannelCloseReceived
        );
    }

    #[tokio::test]
    async fn same_state_reentry_still_wakes_waiters() {
        let manager = opened_manager();
        manager.set(ConnectionState::BasicPublishSent).unwrap();
        manager.set(ConnectionState::ContentHeaderSent).unwrap();
        manager.set(ConnectionState::ContentBodySent).unwrap();
        manager.set(ConnectionState::BasicAckReceived).unwrap();
        // A second publisher waiting while the state is already
        // BasicAckReceived must see the next ack arrive.
        let waiter = manager.subscribe(&[ConnectionState::BasicAckReceived]);
        manager.set(ConnectionState::BasicAckReceived).unwrap();
        assert_eq!(
            waiter.wait().await.unwrap(),
            ConnectionState::BasicAckReceived
        );
    }

    #[tokio::test]
    async fn no_retroactive_wake_for_late_subscribers() {
        let manager = opened_manager();
        manager.set(ConnectionState::QueueDeclareSent).unwrap();
        manager.set(ConnectionState::QueueDeclareOkReceived).unwrap();
        let mut waiter = manager.subscribe(&[ConnectionState::QueueDeclareOkReceived]);
        // The transition already happened; the waiter must not resolve.
        assert!(waiter.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn exception_is_raised_into_every_pending_waiter() {
        let manager = opened_manager();
        let first = manager.subscribe(&[ConnectionState::QueueDeclareOkReceived]);
        let second = manager.subscribe(&[ConnectionState::BasicConsumeOkReceived]);
        manager.set_exception(Error::ConnectionClosed);
        assert!(matches!(first.wait().await, Err(Error::ConnectionClosed)));
        assert!(matches!(second.wait().await, Err(Error::ConnectionClosed)));
        assert_eq!(manager.current(), ConnectionState::ExceptionRaised);
        // The exception was delivered, not stored; a later subscriber waits.
        let mut later = manager.subscribe(&[ConnectionState::Closed]);
        assert!(later.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stored_exception_is_taken_by_the_next_subscriber() {
        let manager = opened_manager();
        manager.set_exception(Error::ConnectionClosed);
        let waiter = manager.subscribe(&[ConnectionState::QueueDeclareOkReceived]);
        assert!(matches!(waiter.wait().await, Err(Error::ConnectionClosed)));
        // Taken means cleared: the next subscriber is not poisoned.
        let mut clean = manager.subscribe(&[ConnectionState::Closed]);
        assert!(clean.rx.try_recv().is_err());
    }

    #[test]
    fn state_tags_roundtrip() {
        for tag in [0x00u16, 0x01, 0x11, 0x21, 0x53, 0x70, 0x96, 0x101] {
            let state = ConnectionState::try_from(tag).unwrap();
            assert_eq!(u16::from(state), tag);
        }
        assert!(ConnectionState::try_from(0x2_u16).is_err());
    }
}
