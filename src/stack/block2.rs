//! Block2 transfers: fragmented response bodies (RFC 7959).
//!
//! The responder side slices an oversized piggybacked response and
//! serves follow-up requests from the stored payload. The reassembly
//! side tracks every outgoing confirmable exchange by message-id,
//! accumulates Block2 slices, and issues the follow-up requests itself;
//! the completed response surfaces under the original exchange.

use std::collections::HashMap;
use std::time::Duration;

use log::debug;
use tokio::time::Instant;

use crate::error::{StackError, StackErrorKind};
use crate::message::block::{fix_block_size, BlockBuffer, BlockOption};
use crate::message::{options, Message, MessageType};
use crate::params::Params;

use super::{Layer, LayerIo};

pub(crate) struct Block2 {
    tx: Responder,
    rx: Reassembler,
}

impl Block2 {
    pub fn new(params: &Params) -> Block2 {
        Block2 {
            tx: Responder {
                block_size: params.max_block_size,
                lifetime: params.exchange_lifetime,
                active: None,
            },
            rx: Reassembler { lifetime: params.exchange_lifetime, states: HashMap::new() },
        }
    }
}

impl Layer for Block2 {
    fn update(&mut self, io: &mut LayerIo) {
        let now = io.now();
        if let Some(d) = &self.tx.active {
            if now - d.started > self.tx.lifetime {
                debug!("block2: downlink for {} expired", d.message);
                self.tx.active = None;
            }
        }
        self.rx.states.retain(|_, s| now - s.started <= self.rx.lifetime);
    }

    fn recv(&mut self, m: Message, io: &mut LayerIo) -> Result<(), StackError> {
        match m.message_type {
            MessageType::Confirmable => self.tx.recv(m, io),
            MessageType::Acknowledgement => self.rx.recv(m, io),
            _ => {
                io.recv(m);
                Ok(())
            }
        }
    }

    fn send(&mut self, m: Message, io: &mut LayerIo) -> Result<(), StackError> {
        match m.message_type {
            MessageType::Confirmable => self.rx.track(m, io),
            MessageType::Acknowledgement => self.tx.send(m, io),
            _ => {
                io.send(m);
                Ok(())
            }
        }
    }

    fn on_ack_timeout(&mut self, m: Message, io: &mut LayerIo) {
        self.rx.on_ack_timeout(m, io);
    }
}

/// An outgoing fragmented response being served slice by slice.
struct Downlink {
    started: Instant,
    message: Message,
}

struct Responder {
    block_size: u32,
    lifetime: Duration,
    active: Option<Downlink>,
}

impl Responder {
    fn send(&mut self, m: Message, io: &mut LayerIo) -> Result<(), StackError> {
        if self.active.is_some() {
            return Err(err(StackErrorKind::TransferBusy));
        }
        if m.payload.len() <= self.block_size as usize {
            io.send(m);
            return Ok(());
        }
        self.active = Some(Downlink { started: io.now(), message: m.clone() });
        let size = self.block_size;
        self.send_slice(m.message_id, 0, size, io)
    }

    fn recv(&mut self, m: Message, io: &mut LayerIo) -> Result<(), StackError> {
        if self.active.is_none() {
            io.recv(m);
            return Ok(());
        }
        let Some(opt) = BlockOption::block2(&m) else {
            return Err(err(StackErrorKind::NoBlock2Option));
        };
        // The peer may shrink the block size; never grow past our own.
        let size = fix_block_size(opt.size).min(self.block_size);
        self.send_slice(m.message_id, opt.num, size, io)
    }

    fn send_slice(
        &mut self,
        message_id: u16,
        num: u32,
        size: u32,
        io: &mut LayerIo,
    ) -> Result<(), StackError> {
        let Some(downlink) = self.active.as_ref() else {
            return Err(err(StackErrorKind::StateNotFound));
        };
        let source = &downlink.message;
        let (opt, slice) = match BlockBuffer(&source.payload).read(num, size) {
            Ok(v) => v,
            Err(e) => return Err(err(StackErrorKind::Block(e))),
        };

        let mut reply = Message {
            message_type: MessageType::Acknowledgement,
            code: source.code,
            message_id,
            payload: slice.to_vec(),
            ..Message::default()
        };
        if !opt.more {
            reply.token = source.token.clone();
            reply.options = source.options.clone();
        }
        reply.options.set(options::BLOCK2, opt.value());
        if !opt.more {
            self.active = None;
        }
        io.send(reply);
        Ok(())
    }
}

struct RxState {
    started: Instant,
    /// The exchange as the session submitted it.
    source: Message,
    buffer: Vec<u8>,
}

struct Reassembler {
    lifetime: Duration,
    /// In-flight outgoing exchanges keyed by the message-id currently
    /// on the wire.
    states: HashMap<u16, RxState>,
}

impl Reassembler {
    fn track(&mut self, m: Message, io: &mut LayerIo) -> Result<(), StackError> {
        if self.states.contains_key(&m.message_id) {
            return Err(err(StackErrorKind::DuplicateMessageId(m.message_id)));
        }
        self.states.insert(
            m.message_id,
            RxState { started: io.now(), source: m.clone(), buffer: Vec::new() },
        );
        io.send(m);
        Ok(())
    }

    fn recv(&mut self, mut m: Message, io: &mut LayerIo) -> Result<(), StackError> {
        let Some(mut state) = self.states.remove(&m.message_id) else {
            return Err(err(StackErrorKind::StateNotFound));
        };

        let Some(opt) = BlockOption::block2(&m) else {
            io.recv(m);
            return Ok(());
        };

        state.buffer.extend_from_slice(&m.payload);
        if !opt.more {
            m.message_id = state.source.message_id;
            m.payload = state.buffer;
            io.recv(m);
            return Ok(());
        }

        // More slices to fetch: repeat the request for the next block
        // under a fresh message-id.
        let next_id = io.gen_message_id();
        let mut next = Message {
            message_type: MessageType::Confirmable,
            code: state.source.code,
            message_id: next_id,
            token: state.source.token.clone(),
            options: state.source.options.clone(),
            ..Message::default()
        };
        next.options.set(
            options::BLOCK2,
            BlockOption::new(opt.num + 1, false, opt.size).value(),
        );
        state.started = io.now();
        self.states.insert(next_id, state);
        io.send(next);
        Ok(())
    }

    fn on_ack_timeout(&mut self, m: Message, io: &mut LayerIo) {
        match self.states.remove(&m.message_id) {
            Some(state) => io.ack_timeout(state.source),
            None => io.ack_timeout(m),
        }
    }
}

fn err(kind: StackErrorKind) -> StackError {
    StackError::new("block2", kind)
}
