//! Block1 transfers: fragmented request bodies (RFC 7959).
//!
//! The transmitter side fragments an outgoing confirmable request whose
//! payload exceeds the block size and walks the blocks as the peer
//! acknowledges them. The assembly side accumulates inbound request
//! blocks per token, answers intermediate blocks with `2.31 Continue`,
//! and splices the final Block1 echo into the response produced by the
//! handler.

use std::collections::HashMap;
use std::time::Duration;

use log::debug;
use tokio::time::Instant;

use crate::error::{StackError, StackErrorKind};
use crate::message::block::{fix_block_size, BlockOption, BlockReader};
use crate::message::{options, Code, Message, MessageType};
use crate::params::Params;

use super::{Layer, LayerIo};

pub(crate) struct Block1 {
    tx: Transmitter,
    rx: Assembler,
}

impl Block1 {
    pub fn new(params: &Params) -> Block1 {
        Block1 {
            tx: Transmitter {
                block_size: params.max_block_size,
                lifetime: params.exchange_lifetime,
                active: None,
            },
            rx: Assembler {
                lifetime: params.exchange_lifetime,
                blocks: HashMap::new(),
                splices: HashMap::new(),
            },
        }
    }
}

impl Layer for Block1 {
    fn update(&mut self, io: &mut LayerIo) {
        let now = io.now();
        if let Some(up) = &self.tx.active {
            if now - up.started > self.tx.lifetime {
                debug!("block1: uplink for {} expired", up.source);
                self.tx.active = None;
            }
        }
        self.rx.blocks.retain(|_, a| now - a.started <= self.rx.lifetime);
        self.rx.splices.retain(|_, s| now - s.started <= self.rx.lifetime);
    }

    fn recv(&mut self, m: Message, io: &mut LayerIo) -> Result<(), StackError> {
        match m.message_type {
            MessageType::Confirmable => self.rx.recv(m, io),
            MessageType::Acknowledgement => self.tx.recv(m, io),
            _ => {
                io.recv(m);
                Ok(())
            }
        }
    }

    fn send(&mut self, m: Message, io: &mut LayerIo) -> Result<(), StackError> {
        match m.message_type {
            MessageType::Confirmable => self.tx.send(m, io),
            MessageType::Acknowledgement => self.rx.send(m, io),
            _ => {
                io.send(m);
                Ok(())
            }
        }
    }

    fn on_ack_timeout(&mut self, m: Message, io: &mut LayerIo) {
        self.tx.on_ack_timeout(m, io);
    }
}

/// An outgoing fragmented request.
struct Uplink {
    started: Instant,
    /// The request as the session submitted it; its message-id and
    /// token identify the exchange to the upper layers.
    source: Message,
    reader: BlockReader,
    /// Message-id of the block currently in flight.
    block_message_id: u16,
}

struct Transmitter {
    block_size: u32,
    lifetime: Duration,
    active: Option<Uplink>,
}

impl Transmitter {
    fn send(&mut self, m: Message, io: &mut LayerIo) -> Result<(), StackError> {
        if self.active.is_some() {
            return Err(err(StackErrorKind::TransferBusy));
        }
        if m.payload.len() <= self.block_size as usize {
            io.send(m);
            return Ok(());
        }

        let reader = BlockReader::new(m.payload.clone());
        self.active = Some(Uplink {
            started: io.now(),
            source: m.clone(),
            reader,
            block_message_id: m.message_id,
        });
        let size = self.block_size;
        self.send_block(m.message_id, 0, size, io)
    }

    fn recv(&mut self, mut m: Message, io: &mut LayerIo) -> Result<(), StackError> {
        let Some(up) = &self.active else {
            io.recv(m);
            return Ok(());
        };
        if m.message_id != up.block_message_id {
            return Err(err(StackErrorKind::UnexpectedMessageId(m.message_id)));
        }

        if m.code == Code::REQUEST_ENTITY_INCOMPLETE
            || m.code == Code::REQUEST_ENTITY_TOO_LARGE
        {
            // The peer refused the transfer; hand the error response to
            // the waiting caller under the original exchange.
            if let Some(up) = self.active.take() {
                m.message_id = up.source.message_id;
            }
            io.recv(m);
            return Ok(());
        }

        match BlockOption::block1(&m) {
            Some(opt) if opt.more => {
                let size = fix_block_size(opt.size).min(self.block_size);
                let next_id = io.gen_message_id();
                self.send_block(next_id, opt.num + 1, size, io)
            }
            _ => {
                // Final acknowledgement: the response answers the
                // original request.
                if let Some(up) = self.active.take() {
                    m.message_id = up.source.message_id;
                }
                io.recv(m);
                Ok(())
            }
        }
    }

    fn send_block(
        &mut self,
        message_id: u16,
        num: u32,
        size: u32,
        io: &mut LayerIo,
    ) -> Result<(), StackError> {
        let Some(up) = self.active.as_mut() else {
            return Err(err(StackErrorKind::StateNotFound));
        };
        let (opt, payload) = match up.reader.read(num, size) {
            Ok(v) => v,
            Err(e) => {
                self.active = None;
                return Err(err(StackErrorKind::Block(e)));
            }
        };
        let up = match self.active.as_mut() {
            Some(up) => up,
            None => return Err(err(StackErrorKind::StateNotFound)),
        };
        up.block_message_id = message_id;

        let mut block = Message {
            message_type: MessageType::Confirmable,
            code: up.source.code,
            message_id,
            token: up.source.token.clone(),
            payload,
            ..Message::default()
        };
        if opt.num == 0 || !opt.more {
            block.options = up.source.options.clone();
        }
        block.options.set(options::BLOCK1, opt.value());
        io.send(block);
        Ok(())
    }

    fn on_ack_timeout(&mut self, m: Message, io: &mut LayerIo) {
        match self.active.take() {
            Some(up) if up.block_message_id == m.message_id => {
                io.ack_timeout(up.source);
            }
            other => {
                self.active = other;
                io.ack_timeout(m);
            }
        }
    }
}

struct Accum {
    started: Instant,
    buffer: Vec<u8>,
}

struct Splice {
    started: Instant,
    block1: u32,
}

struct Assembler {
    lifetime: Duration,
    /// Accumulating request bodies, one per token.
    blocks: HashMap<Vec<u8>, Accum>,
    /// Block1 echoes awaiting the handler's response, keyed by the
    /// message-id the response will carry.
    splices: HashMap<u16, Splice>,
}

impl Assembler {
    fn recv(&mut self, mut m: Message, io: &mut LayerIo) -> Result<(), StackError> {
        let Some(opt) = BlockOption::block1(&m) else {
            io.recv(m);
            return Ok(());
        };

        let now = io.now();
        let state = self
            .blocks
            .entry(m.token.clone())
            .or_insert_with(|| Accum { started: now, buffer: Vec::new() });

        if state.buffer.len() != opt.num as usize * opt.size as usize {
            let mut reply = Message::ack(m.message_id);
            reply.code = Code::REQUEST_ENTITY_INCOMPLETE;
            reply.token = m.token;
            io.send(reply);
            return Ok(());
        }
        state.buffer.extend_from_slice(&m.payload);

        if opt.more {
            let mut reply = Message::ack(m.message_id);
            reply.code = Code::CONTINUE;
            reply.token = m.token;
            reply.options.set(options::BLOCK1, opt.value());
            io.send(reply);
            return Ok(());
        }

        if self.splices.contains_key(&m.message_id) {
            return Err(err(StackErrorKind::DuplicateMessageId(m.message_id)));
        }
        let Some(state) = self.blocks.remove(&m.token) else {
            return Err(err(StackErrorKind::StateNotFound));
        };
        self.splices
            .insert(m.message_id, Splice { started: state.started, block1: opt.value() });
        m.payload = state.buffer;
        io.recv(m);
        Ok(())
    }

    fn send(&mut self, mut m: Message, io: &mut LayerIo) -> Result<(), StackError> {
        if let Some(s) = self.splices.remove(&m.message_id) {
            m.options.set(options::BLOCK1, s.block1);
        }
        io.send(m);
        Ok(())
    }
}

fn err(kind: StackErrorKind) -> StackError {
    StackError::new("block1", kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::{Job, StackOutput};

    fn params() -> Params {
        Params { max_block_size: 16, ..Params::default() }
    }

    fn io_for<'a>(
        now: Instant,
        seq: &'a mut u16,
        output: &'a mut StackOutput,
    ) -> LayerIo<'a> {
        LayerIo { now, seq, cursor: 0, jobs: Default::default(), output }
    }

    fn request(payload: &[u8]) -> Message {
        let mut m = Message {
            message_type: MessageType::Confirmable,
            code: Code::PUT,
            message_id: 100,
            token: b"tk".to_vec(),
            payload: payload.to_vec(),
            ..Message::default()
        };
        m.options.set_path("/upload");
        m
    }

    fn pop_down(io: &mut LayerIo) -> Message {
        match io.jobs.pop_front().expect("job queued") {
            Job::Down(_, m) => m,
            _ => panic!("expected a downward message"),
        }
    }

    fn pop_up(io: &mut LayerIo) -> Message {
        match io.jobs.pop_front().expect("job queued") {
            Job::Up(_, m) => m,
            _ => panic!("expected an upward message"),
        }
    }

    #[test]
    fn small_payload_passes_untouched() {
        let mut l = Block1::new(&params());
        let mut seq = 200;
        let mut out = StackOutput::default();
        let mut io = io_for(Instant::now(), &mut seq, &mut out);
        l.send(request(b"small"), &mut io).unwrap();
        let m = pop_down(&mut io);
        assert!(!m.options.contains(options::BLOCK1));
        assert_eq!(m.payload, b"small");
    }

    #[test]
    fn uplink_walks_blocks_and_restores_message_id() {
        let mut l = Block1::new(&params());
        let payload: Vec<u8> = (0..40u8).collect();
        let mut seq = 200;
        let mut out = StackOutput::default();
        let mut io = io_for(Instant::now(), &mut seq, &mut out);

        l.send(request(&payload), &mut io).unwrap();
        let b0 = pop_down(&mut io);
        assert_eq!(b0.message_id, 100);
        assert_eq!(BlockOption::block1(&b0).unwrap(), BlockOption::new(0, true, 16));
        assert_eq!(b0.payload, &payload[..16]);
        assert!(b0.options.contains(options::URI_PATH));

        // The peer acknowledges block 0 with Continue.
        let mut ack = Message::ack(b0.message_id);
        ack.code = Code::CONTINUE;
        ack.options.set(options::BLOCK1, BlockOption::new(0, true, 16).value());
        l.recv(ack, &mut io).unwrap();
        let b1 = pop_down(&mut io);
        assert_eq!(b1.message_id, 201);
        assert_eq!(BlockOption::block1(&b1).unwrap(), BlockOption::new(1, true, 16));
        assert!(!b1.options.contains(options::URI_PATH));

        let mut ack = Message::ack(b1.message_id);
        ack.code = Code::CONTINUE;
        ack.options.set(options::BLOCK1, BlockOption::new(1, true, 16).value());
        l.recv(ack, &mut io).unwrap();
        let b2 = pop_down(&mut io);
        assert_eq!(BlockOption::block1(&b2).unwrap(), BlockOption::new(2, false, 16));
        assert_eq!(b2.payload, &payload[32..]);
        assert!(b2.options.contains(options::URI_PATH));

        // Final acknowledgement maps back to the original exchange.
        let mut ack = Message::ack(b2.message_id);
        ack.code = Code::CHANGED;
        ack.token = b"tk".to_vec();
        ack.options.set(options::BLOCK1, BlockOption::new(2, false, 16).value());
        l.recv(ack, &mut io).unwrap();
        let done = pop_up(&mut io);
        assert_eq!(done.message_id, 100);
        assert_eq!(done.code, Code::CHANGED);
    }

    #[test]
    fn uplink_shrinks_to_the_peers_block_size() {
        let mut l = Block1::new(&Params { max_block_size: 32, ..Params::default() });
        let payload: Vec<u8> = (0..64u8).collect();
        let mut seq = 200;
        let mut out = StackOutput::default();
        let mut io = io_for(Instant::now(), &mut seq, &mut out);

        l.send(request(&payload), &mut io).unwrap();
        let b0 = pop_down(&mut io);
        assert_eq!(BlockOption::block1(&b0).unwrap().size, 32);

        // The peer echoes a smaller size; following blocks adapt.
        let mut ack = Message::ack(b0.message_id);
        ack.code = Code::CONTINUE;
        ack.options.set(options::BLOCK1, BlockOption::new(0, true, 16).value());
        l.recv(ack, &mut io).unwrap();
        let b1 = pop_down(&mut io);
        let opt = BlockOption::block1(&b1).unwrap();
        assert_eq!(opt.size, 16);
        assert_eq!(b1.payload, &payload[32..48]);
    }

    #[test]
    fn second_transfer_is_refused_while_busy() {
        let mut l = Block1::new(&params());
        let payload: Vec<u8> = (0..40u8).collect();
        let mut seq = 200;
        let mut out = StackOutput::default();
        let mut io = io_for(Instant::now(), &mut seq, &mut out);
        l.send(request(&payload), &mut io).unwrap();
        let err = l.send(request(&payload), &mut io).unwrap_err();
        assert!(matches!(err.kind, StackErrorKind::TransferBusy));
    }

    #[test]
    fn peer_rejection_aborts_the_transfer() {
        let mut l = Block1::new(&params());
        let payload: Vec<u8> = (0..40u8).collect();
        let mut seq = 200;
        let mut out = StackOutput::default();
        let mut io = io_for(Instant::now(), &mut seq, &mut out);
        l.send(request(&payload), &mut io).unwrap();
        let b0 = pop_down(&mut io);

        let mut ack = Message::ack(b0.message_id);
        ack.code = Code::REQUEST_ENTITY_TOO_LARGE;
        l.recv(ack, &mut io).unwrap();
        let up = pop_up(&mut io);
        assert_eq!(up.message_id, 100);
        assert_eq!(up.code, Code::REQUEST_ENTITY_TOO_LARGE);
        assert!(l.tx.active.is_none());
    }

    #[test]
    fn ack_timeout_mid_transfer_surfaces_the_original() {
        let mut l = Block1::new(&params());
        let payload: Vec<u8> = (0..40u8).collect();
        let mut seq = 200;
        let mut out = StackOutput::default();
        let mut io = io_for(Instant::now(), &mut seq, &mut out);
        l.send(request(&payload), &mut io).unwrap();
        let b0 = pop_down(&mut io);

        l.on_ack_timeout(b0, &mut io);
        match io.jobs.pop_front().unwrap() {
            Job::Timeout(_, m) => {
                assert_eq!(m.message_id, 100);
                assert_eq!(m.token, b"tk".to_vec());
            }
            _ => panic!("expected an ack-timeout signal"),
        }
        assert!(l.tx.active.is_none());
    }

    #[test]
    fn assembly_accumulates_and_splices() {
        let mut l = Block1::new(&params());
        let mut seq = 300;
        let mut out = StackOutput::default();
        let mut io = io_for(Instant::now(), &mut seq, &mut out);
        let payload: Vec<u8> = (0..40u8).collect();

        for (num, mid) in [(0u32, 50u16), (1, 51), (2, 52)] {
            let start = num as usize * 16;
            let end = payload.len().min(start + 16);
            let mut m = Message {
                message_type: MessageType::Confirmable,
                code: Code::PUT,
                message_id: mid,
                token: b"up".to_vec(),
                payload: payload[start..end].to_vec(),
                ..Message::default()
            };
            let more = end < payload.len();
            m.options.set(options::BLOCK1, BlockOption::new(num, more, 16).value());
            l.recv(m, &mut io).unwrap();

            if more {
                let reply = pop_down(&mut io);
                assert_eq!(reply.code, Code::CONTINUE);
                assert_eq!(reply.message_id, mid);
                assert_eq!(
                    BlockOption::block1(&reply).unwrap(),
                    BlockOption::new(num, true, 16)
                );
            }
        }

        // The assembled request reaches the session in one piece.
        let assembled = pop_up(&mut io);
        assert_eq!(assembled.payload, payload);
        assert_eq!(assembled.message_id, 52);

        // The handler's response gets the final Block1 echo.
        let mut resp = Message::ack(52);
        resp.code = Code::CHANGED;
        resp.token = b"up".to_vec();
        l.send(resp, &mut io).unwrap();
        let out_msg = pop_down(&mut io);
        assert_eq!(
            BlockOption::block1(&out_msg).unwrap(),
            BlockOption::new(2, false, 16)
        );
        assert!(l.rx.splices.is_empty());
    }

    #[test]
    fn offset_mismatch_answers_incomplete() {
        let mut l = Block1::new(&params());
        let mut seq = 300;
        let mut out = StackOutput::default();
        let mut io = io_for(Instant::now(), &mut seq, &mut out);

        // Block 1 arrives before block 0.
        let mut m = Message {
            message_type: MessageType::Confirmable,
            code: Code::PUT,
            message_id: 60,
            token: b"oo".to_vec(),
            payload: vec![0; 16],
            ..Message::default()
        };
        m.options.set(options::BLOCK1, BlockOption::new(1, true, 16).value());
        l.recv(m, &mut io).unwrap();

        let reply = pop_down(&mut io);
        assert_eq!(reply.code, Code::REQUEST_ENTITY_INCOMPLETE);
        assert_eq!(reply.token, b"oo".to_vec());
        // The assembly state survives for a retry.
        assert!(l.rx.blocks.contains_key(&b"oo".to_vec()));
    }

    #[test]
    fn stale_states_are_swept() {
        let mut l = Block1::new(&params());
        let start = Instant::now();
        let mut seq = 300;
        let mut out = StackOutput::default();
        let mut io = io_for(start, &mut seq, &mut out);

        let mut m = Message {
            message_type: MessageType::Confirmable,
            code: Code::PUT,
            message_id: 70,
            token: b"st".to_vec(),
            payload: vec![0; 16],
            ..Message::default()
        };
        m.options.set(options::BLOCK1, BlockOption::new(0, true, 16).value());
        l.recv(m, &mut io).unwrap();
        assert!(!l.rx.blocks.is_empty());

        let mut out = StackOutput::default();
        let mut io = io_for(start + Duration::from_secs(248), &mut seq, &mut out);
        l.update(&mut io);
        assert!(l.rx.blocks.is_empty());
    }
}
