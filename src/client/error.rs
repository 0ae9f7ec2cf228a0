// ABOUTME: Client error types covering validation, transport, codec and broker failures
// ABOUTME: Maps AMQP reply codes to the typed errors raised from operations

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Typed rendering of the AMQP reply codes a broker sends on
/// `Channel.Close` / `Connection.Close`, plus a catch-all for codes outside
/// the table. Soft errors (3xx/4xx) close the channel; hard errors (5xx)
/// close the connection.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("content too large (311): {0}")]
    ContentTooLarge(String),
    #[error("no route (312): {0}")]
    NoRoute(String),
    #[error("no consumers (313): {0}")]
    NoConsumers(String),
    #[error("access refused (403): {0}")]
    AccessRefused(String),
    #[error("not found (404): {0}")]
    NotFound(String),
    #[error("resource locked (405): {0}")]
    ResourceLocked(String),
    #[error("precondition failed (406): {0}")]
    PreconditionFailed(String),
    #[error("frame error (501): {0}")]
    FrameError(String),
    #[error("syntax error (502): {0}")]
    SyntaxError(String),
    #[error("command invalid (503): {0}")]
    CommandInvalid(String),
    #[error("channel error (504): {0}")]
    ChannelError(String),
    #[error("unexpected frame (505): {0}")]
    UnexpectedFrame(String),
    #[error("resource error (506): {0}")]
    ResourceError(String),
    #[error("not allowed (530): {0}")]
    NotAllowed(String),
    #[error("not implemented (540): {0}")]
    NotImplemented(String),
    #[error("internal error (541): {0}")]
    InternalError(String),
    #[error("broker closed with reply code {code}: {text}")]
    Unexpected { code: u16, text: String },
}

impl BrokerError {
    /// The static reply-code table.
    pub fn from_reply(code: u16, text: &str) -> Self {
        let text = text.to_string();
        match code {
            311 => Self::ContentTooLarge(text),
            312 => Self::NoRoute(text),
            313 => Self::NoConsumers(text),
            403 => Self::AccessRefused(text),
            404 => Self::NotFound(text),
            405 => Self::ResourceLocked(text),
            406 => Self::PreconditionFailed(text),
            501 => Self::FrameError(text),
            502 => Self::SyntaxError(text),
            503 => Self::CommandInvalid(text),
            504 => Self::ChannelError(text),
            505 => Self::UnexpectedFrame(text),
            506 => Self::ResourceError(text),
            530 => Self::NotAllowed(text),
            540 => Self::NotImplemented(text),
            541 => Self::InternalError(text),
            code => Self::Unexpected { code, text },
        }
    }

    /// The wire reply code this error was built from.
    pub fn reply_code(&self) -> u16 {
        match self {
            Self::ContentTooLarge(_) => 311,
            Self::NoRoute(_) => 312,
            Self::NoConsumers(_) => 313,
            Self::AccessRefused(_) => 403,
            Self::NotFound(_) => 404,
            Self::ResourceLocked(_) => 405,
            Self::PreconditionFailed(_) => 406,
            Self::FrameError(_) => 501,
            Self::SyntaxError(_) => 502,
            Self::CommandInvalid(_) => 503,
            Self::ChannelError(_) => 504,
            Self::UnexpectedFrame(_) => 505,
            Self::ResourceError(_) => 506,
            Self::NotAllowed(_) => 530,
            Self::NotImplemented(_) => 540,
            Self::InternalError(_) => 541,
            Self::Unexpected { code, .. } => *code,
        }
    }
}

/// Error type for all client operations.
///
/// The variants split into argument errors (raised at the operation
/// boundary, never touching connection state), transport and codec errors,
/// and broker-level errors surfaced through an awaited state. Errors are
/// `Clone` because an exception raised on the connection is re-raised into
/// every pending waiter; `io::Error` is held behind an `Arc` for that
/// reason.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// I/O error on the socket.
    #[error("connection error: {0}")]
    Io(Arc<io::Error>),

    /// The connect URL failed to parse or used an unsupported scheme.
    #[error("invalid connection URL: {0}")]
    InvalidUrl(String),

    /// An argument failed validation.
    #[error("invalid argument: {0}")]
    Validation(String),

    /// TLS setup or handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The codec rejected inbound bytes as definitively invalid.
    #[error("failed to unmarshal frame: {0}")]
    Unmarshal(String),

    /// The codec failed to serialize an outbound frame.
    #[error("failed to marshal frame: {0}")]
    Marshal(String),

    /// The socket closed while an operation was outstanding.
    #[error("connection closed unexpectedly")]
    ConnectionClosed,

    /// The initial socket connect did not complete in time.
    #[error("timed out connecting to the broker")]
    ConnectTimeout,

    /// The broker closed the channel or connection with a reply code.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The broker does not advertise a capability the operation requires.
    #[error("not supported by the server: {0}")]
    NotSupported(String),

    /// `tx_commit` / `tx_rollback` without a preceding `tx_select`.
    #[error("no transaction was started on this channel")]
    NoTransaction,

    /// The server rejected a command it does not implement.
    #[error("not implemented on the server: {0}")]
    NotImplementedOnServer(String),

    /// A state transition outside the table; a programmer error.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },
}

impl Error {
    /// Whether this is an AMQP-level failure. A waiter surfacing one of
    /// these triggers a reconnect before the error reaches the caller;
    /// argument, I/O and programmer errors do not.
    pub(crate) fn is_amqp(&self) -> bool {
        matches!(
            self,
            Error::Broker(_)
                | Error::Unmarshal(_)
                | Error::Marshal(_)
                | Error::NotImplementedOnServer(_)
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_code_table_roundtrips() {
        for code in [
            311, 312, 313, 403, 404, 405, 406, 501, 502, 503, 504, 505, 506, 530, 540, 541,
        ] {
            let err = BrokerError::from_reply(code, "because");
            assert_eq!(err.reply_code(), code);
        }
    }

    #[test]
    fn unknown_codes_are_preserved() {
        let err = BrokerError::from_reply(999, "surprise");
        assert_eq!(
            err,
            BrokerError::Unexpected {
                code: 999,
                text: "surprise".to_string()
            }
        );
        assert_eq!(err.reply_code(), 999);
    }

    #[test]
    fn broker_errors_trigger_reconnect_io_errors_do_not() {
        assert!(Error::Broker(BrokerError::from_reply(404, "no")).is_amqp());
        assert!(Error::Unmarshal("bad frame".into()).is_amqp());
        assert!(!Error::Validation("bad argument".into()).is_amqp());
        assert!(!Error::from(io::Error::other("boom")).is_amqp());
    }
}
