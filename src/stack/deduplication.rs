//! Message-id deduplication (RFC 7252 section 4.5).
//!
//! Every confirmable or non-confirmable arrival leaves a state behind
//! for its lifetime. When the reply to a confirmable message is sent it
//! is stored with the state, so a retransmitted request can be answered
//! without involving the upper layers again.

use std::collections::HashMap;
use std::time::Duration;

use log::debug;
use tokio::time::Instant;

use crate::error::{StackError, StackErrorKind};
use crate::message::{Message, MessageType};
use crate::params::Params;

use super::{Layer, LayerIo};

struct DedupState {
    arrival: Instant,
    message_type: MessageType,
    reply: Option<Message>,
}

pub(crate) struct Deduplication {
    non_lifetime: Duration,
    exchange_lifetime: Duration,
    states: HashMap<u16, DedupState>,
}

impl Deduplication {
    pub fn new(params: &Params) -> Deduplication {
        Deduplication {
            non_lifetime: params.non_lifetime,
            exchange_lifetime: params.exchange_lifetime,
            states: HashMap::new(),
        }
    }

    /// Looks up a live state; expired states count as absent.
    fn state(&mut self, message_id: u16, now: Instant) -> Option<&mut DedupState> {
        let s = self.states.get_mut(&message_id)?;
        if now - s.arrival > match s.message_type {
            MessageType::Confirmable => self.exchange_lifetime,
            _ => self.non_lifetime,
        } {
            return None;
        }
        Some(s)
    }
}

impl Layer for Deduplication {
    fn update(&mut self, io: &mut LayerIo) {
        let now = io.now();
        self.states.retain(|_, s| {
            now - s.arrival
                <= match s.message_type {
                    MessageType::Confirmable => self.exchange_lifetime,
                    _ => self.non_lifetime,
                }
        });
    }

    fn recv(&mut self, m: Message, io: &mut LayerIo) -> Result<(), StackError> {
        if m.message_type != MessageType::Confirmable
            && m.message_type != MessageType::NonConfirmable
        {
            io.recv(m);
            return Ok(());
        }

        let now = io.now();
        let Some(state) = self.state(m.message_id, now) else {
            self.states.insert(
                m.message_id,
                DedupState { arrival: now, message_type: m.message_type, reply: None },
            );
            io.recv(m);
            return Ok(());
        };

        match (state.message_type, m.message_type) {
            (MessageType::NonConfirmable, MessageType::NonConfirmable) => {
                // Duplicate best-effort message; nothing to do.
            }
            (MessageType::Confirmable, MessageType::Confirmable) => {
                match &state.reply {
                    Some(reply) if reply.token.is_empty() || reply.token == m.token => {
                        debug!("replay stored reply for duplicate {}", m);
                        let replay = reply.clone();
                        io.send(replay);
                    }
                    Some(reply) => {
                        debug!("token mismatch on duplicate {}, stored {}", m, reply);
                        io.send_rst(m.message_id);
                    }
                    // The reply is still being produced; the peer will
                    // retransmit again.
                    None => {}
                }
            }
            (MessageType::NonConfirmable, MessageType::Confirmable) => {
                io.send_rst(m.message_id);
            }
            _ => {
                debug!("ignore duplicate {}", m);
            }
        }
        Ok(())
    }

    fn send(&mut self, m: Message, io: &mut LayerIo) -> Result<(), StackError> {
        if m.message_type != MessageType::Acknowledgement
            && m.message_type != MessageType::Reset
        {
            io.send(m);
            return Ok(());
        }

        let now = io.now();
        let ack = m.message_type == MessageType::Acknowledgement;
        if let Some(state) = self.state(m.message_id, now) {
            if state.message_type == MessageType::NonConfirmable && ack {
                return Err(err(StackErrorKind::AckForNonConfirmable));
            }
            if state.reply.is_some() {
                return Err(err(StackErrorKind::ReplyAlreadyStored));
            }
            state.reply = Some(m.clone());
        }
        io.send(m);
        Ok(())
    }
}

fn err(kind: StackErrorKind) -> StackError {
    StackError::new("deduplication", kind)
}
