//! Error taxonomy for the broker.
//!
//! [`BrokerError`] is the closed, internal error type shared by the codec,
//! frame, dispatcher and executor modules. Every non-[`BrokerError::Fatal`]
//! variant maps 1:1 onto a reply message type (see [`BrokerError::reply_kind`]);
//! `Fatal` never becomes a reply and instead propagates out of
//! [`crate::broker::Broker::start`]/`attach` as `anyhow::Error`, matching how
//! the rest of this crate's public API surfaces errors.

use crate::frame::ReplyKind;

/// Errors produced while decoding, routing or executing a request.
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    /// The request frame was structurally invalid (wrong part count, bad
    /// execution context, unknown content type, undecodable payload).
    #[error("malformed request: {0}")]
    Malformed(String),

    /// `thing-id` or `object-name` did not resolve to a registered Thing or
    /// property/action.
    #[error("unknown target: {0}")]
    UnknownTarget(String),

    /// The requested operation is not implemented for the target (e.g.
    /// deleting a property that does not support deletion).
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// The Thing's property/action implementation returned an error.
    #[error("execution failed: {0}")]
    UserException(String),

    /// An invocation or execution deadline elapsed before the operation
    /// could complete.
    #[error("timed out waiting for {0}")]
    TimedOut(&'static str),

    /// An endpoint failed to send or receive a frame. Logged and the reply
    /// (if any) is dropped, since there is no channel left to carry it.
    #[error("transport error: {0}")]
    Transport(String),

    /// An error severe enough that the broker cannot continue operating the
    /// affected endpoint or Thing. Never converted to a reply frame.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl BrokerError {
    /// The reply message type this error maps to, if any.
    ///
    /// Returns `None` for [`BrokerError::Fatal`] and [`BrokerError::Transport`],
    /// neither of which produce a reply frame.
    pub fn reply_kind(&self) -> Option<ReplyKind> {
        match self {
            BrokerError::Malformed(_) | BrokerError::UnknownTarget(_) => {
                Some(ReplyKind::InvalidMessage)
            }
            BrokerError::Unsupported(_) | BrokerError::UserException(_) => {
                Some(ReplyKind::Exception)
            }
            BrokerError::TimedOut(_) => Some(ReplyKind::Timeout),
            BrokerError::Transport(_) | BrokerError::Fatal(_) => None,
        }
    }
}
