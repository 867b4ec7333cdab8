//! Completion handles for outstanding exchanges.
//!
//! The caller keeps the receiving half of a oneshot channel; the
//! session's running task completes the waiter when the matching
//! acknowledgement, response, reset or timeout arrives.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::Error;
use crate::message::{Message, MessageType};
use crate::response::Response;

/// Wakes a caller waiting for the acknowledgement of a confirmable
/// message. Keyed by message-id in the session.
pub(crate) struct AckWaiter {
    tx: oneshot::Sender<Result<(), Error>>,
}

impl AckWaiter {
    pub fn new(tx: oneshot::Sender<Result<(), Error>>) -> AckWaiter {
        AckWaiter { tx }
    }

    pub fn done(self, result: Result<(), Error>) {
        let _ = self.tx.send(result);
    }
}

/// Wakes a caller waiting for the response to a request. Keyed by
/// token in the session; remembers the request's message-id so a peer
/// reset can find it.
pub(crate) struct ResponseWaiter {
    tx: oneshot::Sender<Result<Response, Error>>,
    deadline: Instant,
    pub message_id: u16,
}

impl ResponseWaiter {
    pub fn new(
        tx: oneshot::Sender<Result<Response, Error>>,
        timeout: Duration,
        message_id: u16,
        now: Instant,
    ) -> ResponseWaiter {
        ResponseWaiter { tx, deadline: now + timeout, message_id }
    }

    pub fn timed_out(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn done(self, result: Result<Message, Error>) {
        let _ = self.tx.send(result.map(Response::from_message));
    }
}

impl Response {
    pub(crate) fn from_message(m: Message) -> Response {
        Response {
            ack: m.message_type == MessageType::Acknowledgement,
            status: m.code,
            options: m.options,
            token: m.token,
            payload: m.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Code;

    #[tokio::test]
    async fn response_waiter_completes_with_response() {
        let (tx, rx) = oneshot::channel();
        let w = ResponseWaiter::new(tx, Duration::from_secs(5), 7, Instant::now());
        assert_eq!(w.message_id, 7);

        let mut m = Message::ack(7);
        m.code = Code::CONTENT;
        m.token = b"t".to_vec();
        m.payload = b"hello".to_vec();
        w.done(Ok(m));

        let resp = rx.await.unwrap().unwrap();
        assert!(resp.ack);
        assert_eq!(resp.status, Code::CONTENT);
        assert_eq!(resp.payload, b"hello");
    }

    #[tokio::test]
    async fn response_waiter_reports_errors() {
        let (tx, rx) = oneshot::channel();
        let w = ResponseWaiter::new(tx, Duration::from_secs(5), 7, Instant::now());
        w.done(Err(Error::Reset));
        assert!(matches!(rx.await.unwrap(), Err(Error::Reset)));
    }

    #[test]
    fn deadline_is_checked_against_now() {
        let now = Instant::now();
        let (tx, _rx) = oneshot::channel();
        let w = ResponseWaiter::new(tx, Duration::from_secs(5), 1, now);
        assert!(!w.timed_out(now));
        assert!(w.timed_out(now + Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn ack_waiter_round_trip() {
        let (tx, rx) = oneshot::channel();
        AckWaiter::new(tx).done(Ok(()));
        assert!(rx.await.unwrap().is_ok());
    }
}
