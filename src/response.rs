//! The user-facing response type.

use crate::message::{Code, Options};

/// A response as delivered to a waiting caller or an observer.
#[derive(Clone, Debug)]
pub struct Response {
    /// True when the response rode piggybacked in an acknowledgement.
    pub ack: bool,
    /// The status code (class 2, 4 or 5).
    pub status: Code,
    pub options: Options,
    pub token: Vec<u8>,
    pub payload: Vec<u8>,
}
