//! Confirmable-message retransmission (RFC 7252 section 4.2).

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{StackError, StackErrorKind};
use crate::message::{Message, MessageType};
use crate::params::Params;

use super::{Layer, LayerIo};

/// State of one in-flight confirmable message.
struct TxState {
    start: Instant,
    last_send: Instant,
    retransmit: u32,
    timeout: Duration,
    message: Message,
}

pub(crate) struct Reliability {
    max_retransmit: u32,
    max_transmit_span: Duration,
    max_transmit_wait: Duration,
    ack_timeout: Duration,
    ack_random_factor: f64,
    states: HashMap<u16, TxState>,
}

impl Reliability {
    pub fn new(params: &Params) -> Reliability {
        Reliability {
            max_retransmit: params.max_retransmit,
            max_transmit_span: params.max_transmit_span,
            max_transmit_wait: params.max_transmit_wait,
            ack_timeout: params.ack_timeout,
            ack_random_factor: params.ack_random_factor,
            states: HashMap::new(),
        }
    }

    /// The first timeout is `ACK_TIMEOUT * rand(1, ACK_RANDOM_FACTOR)`.
    fn rand_ack_timeout(&self) -> Duration {
        let factor = (self.ack_random_factor - 1.0).max(0.0);
        self.ack_timeout.mul_f64(1.0 + rand::random::<f64>() * factor)
    }
}

impl Layer for Reliability {
    fn update(&mut self, io: &mut LayerIo) {
        let now = io.now();
        let mut expired = Vec::new();
        let mut resend = Vec::new();
        for (id, s) in &self.states {
            if s.last_send - s.start >= self.max_transmit_span
                || now - s.start >= self.max_transmit_wait
            {
                expired.push(*id);
            } else if now - s.last_send >= s.timeout {
                if s.retransmit >= self.max_retransmit {
                    expired.push(*id);
                } else {
                    resend.push(*id);
                }
            }
        }
        for id in expired {
            if let Some(s) = self.states.remove(&id) {
                io.ack_timeout(s.message);
            }
        }
        for id in resend {
            if let Some(s) = self.states.get_mut(&id) {
                s.last_send = now;
                s.retransmit += 1;
                s.timeout *= 2;
                io.send(s.message.clone());
            }
        }
    }

    fn recv(&mut self, m: Message, io: &mut LayerIo) -> Result<(), StackError> {
        if m.message_type != MessageType::Acknowledgement
            && m.message_type != MessageType::Reset
        {
            io.recv(m);
            return Ok(());
        }
        // Only acknowledgements and resets that match an in-flight
        // exchange travel further up.
        if self.states.remove(&m.message_id).is_some() {
            io.recv(m);
        }
        Ok(())
    }

    fn send(&mut self, m: Message, io: &mut LayerIo) -> Result<(), StackError> {
        if m.message_type != MessageType::Confirmable {
            io.send(m);
            return Ok(());
        }
        if self.states.contains_key(&m.message_id) {
            return Err(err(StackErrorKind::DuplicateMessageId(m.message_id)));
        }
        let now = io.now();
        let state = TxState {
            start: now,
            last_send: now,
            retransmit: 0,
            timeout: self.rand_ack_timeout(),
            message: m.clone(),
        };
        self.states.insert(m.message_id, state);
        io.send(m);
        Ok(())
    }
}

fn err(kind: StackErrorKind) -> StackError {
    StackError::new("reliability", kind)
}
