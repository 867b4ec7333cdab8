//! Crate error taxonomy.

use std::net::SocketAddr;

use thiserror::Error;

use crate::message::block::BlockError;
use crate::message::EncodeError;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of the endpoint API.
#[derive(Debug, Error)]
pub enum Error {
    /// The peer answered a confirmable message with a reset.
    #[error("wait response reset by peer")]
    Reset,
    /// No response arrived within the waiter's deadline.
    #[error("wait response timeout")]
    Timeout,
    /// A confirmable message exhausted its retransmissions.
    #[error("wait ack timeout")]
    AckTimeout,
    #[error("session closed")]
    SessionClosed,
    /// A server-side send addressed a peer without a session.
    #[error("session not found for {0}")]
    SessionNotFound(SocketAddr),
    /// Another request with the same token is still in flight.
    #[error("token duplicate")]
    DuplicateToken,
    /// Another acknowledgement wait with the same message-id is still
    /// in flight.
    #[error("message id {0} duplicate")]
    DuplicateMessageId(u16),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    /// A request sent over a dialed connection named a different
    /// authority than the connection.
    #[error("request host {request} does not match connection host {conn}")]
    HostMismatch { request: String, conn: String },
    #[error(transparent)]
    Stack(#[from] StackError),
    #[error("encode: {0}")]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// An error raised inside the layer stack, tagged with the layer that
/// produced it.
#[derive(Debug, Error)]
#[error("{layer}: {kind}")]
pub struct StackError {
    pub layer: &'static str,
    #[source]
    pub kind: StackErrorKind,
}

impl StackError {
    pub fn new(layer: &'static str, kind: StackErrorKind) -> StackError {
        StackError { layer, kind }
    }
}

#[derive(Debug, Error)]
pub enum StackErrorKind {
    /// A confirmable send reused an in-flight message-id.
    #[error("message id {0} duplicate")]
    DuplicateMessageId(u16),
    /// An acknowledgement was sent for a non-confirmable exchange.
    #[error("non-confirmable message needs no ack")]
    AckForNonConfirmable,
    /// A second reply was stored for the same exchange.
    #[error("reply already stored")]
    ReplyAlreadyStored,
    /// A block-wise transfer is already in flight on this session.
    #[error("block transfer in progress")]
    TransferBusy,
    /// An acknowledgement arrived for a block other than the one in
    /// flight.
    #[error("unexpected block message id {0}")]
    UnexpectedMessageId(u16),
    /// A response during a block-wise download carried no Block2 option.
    #[error("no block2 option")]
    NoBlock2Option,
    /// An acknowledgement matched no tracked outgoing exchange.
    #[error("block exchange state not found")]
    StateNotFound,
    #[error(transparent)]
    Block(#[from] BlockError),
}
