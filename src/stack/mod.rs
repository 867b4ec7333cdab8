//! The per-session layer stack.
//!
//! Outgoing messages enter at the top and travel block1 → block2 →
//! deduplication → reliability before reaching the wire; incoming
//! messages traverse the same layers bottom-up and end in session
//! dispatch. A layer may inject messages mid-traversal (a stored reply,
//! a follow-up block request), which continue from its own position in
//! the chain.
//!
//! The chain is driven by an explicit work queue rather than
//! layer-to-layer references: the session owns the stack, the stack
//! owns each layer by value, and [`LayerIo`] carries a layer's emitted
//! messages to its neighbours. All of it runs on the session's running
//! task, so no layer state is shared or locked.

pub(crate) mod block1;
pub(crate) mod block2;
pub(crate) mod deduplication;
pub(crate) mod reliability;

use std::collections::VecDeque;

use log::warn;
use tokio::time::Instant;

use crate::error::StackError;
use crate::message::Message;
use crate::params::Params;

/// One protocol layer.
///
/// `recv` handles a message moving up, `send` a message moving down.
/// `on_ack_timeout` carries the reliability layer's give-up signal
/// upward so that block-wise layers can map an aborted block back to
/// the exchange that started it.
pub(crate) trait Layer {
    fn update(&mut self, io: &mut LayerIo);

    fn recv(&mut self, m: Message, io: &mut LayerIo) -> Result<(), StackError>;

    fn send(&mut self, m: Message, io: &mut LayerIo) -> Result<(), StackError>;

    fn on_ack_timeout(&mut self, m: Message, io: &mut LayerIo) {
        io.ack_timeout(m);
    }
}

enum Job {
    /// Run `send` on the layer at this index.
    Down(usize, Message),
    /// Run `recv` on the layer at this index.
    Up(usize, Message),
    /// Run `on_ack_timeout` on the layer at this index.
    Timeout(usize, Message),
}

/// Everything a layer can reach while processing one event: the tick
/// instant, the session's message-id counter, and the queues feeding
/// its neighbours.
pub(crate) struct LayerIo<'a> {
    now: Instant,
    seq: &'a mut u16,
    /// Index of the layer currently executing; top layer is 0.
    cursor: usize,
    jobs: VecDeque<Job>,
    output: &'a mut StackOutput,
}

/// What one traversal of the stack produced.
#[derive(Default)]
pub(crate) struct StackOutput {
    /// Messages that reached the bottom, ready to serialize and write.
    pub transmit: Vec<Message>,
    /// Messages that reached the top, ready for session dispatch.
    pub deliver: Vec<Message>,
    /// Give-up signals that reached the top; each carries the original
    /// message whose acknowledgement never came.
    pub timeouts: Vec<Message>,
}

impl<'a> LayerIo<'a> {
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Issues a fresh message-id from the session's counter.
    pub fn gen_message_id(&mut self) -> u16 {
        *self.seq = self.seq.wrapping_add(1);
        *self.seq
    }

    /// Passes a message down toward the wire, entering below the
    /// current layer.
    pub fn send(&mut self, m: Message) {
        self.jobs.push_back(Job::Down(self.cursor + 1, m));
    }

    /// Passes a message up toward the session, entering above the
    /// current layer.
    pub fn recv(&mut self, m: Message) {
        if self.cursor == 0 {
            self.output.deliver.push(m);
        } else {
            self.jobs.push_back(Job::Up(self.cursor - 1, m));
        }
    }

    /// Sends a bare reset for the given message-id downward.
    pub fn send_rst(&mut self, message_id: u16) {
        self.send(Message::rst(message_id));
    }

    /// Raises an ack-timeout signal toward the session.
    pub fn ack_timeout(&mut self, m: Message) {
        if self.cursor == 0 {
            self.output.timeouts.push(m);
        } else {
            self.jobs.push_back(Job::Timeout(self.cursor - 1, m));
        }
    }
}

/// The assembled chain. Layer index 0 is the top (closest to the
/// session), the last index the bottom (closest to the wire).
pub(crate) struct Stack {
    layers: Vec<Box<dyn Layer + Send>>,
}

impl Stack {
    pub fn new(params: &Params) -> Stack {
        Stack {
            layers: vec![
                Box::new(block1::Block1::new(params)),
                Box::new(block2::Block2::new(params)),
                Box::new(deduplication::Deduplication::new(params)),
                Box::new(reliability::Reliability::new(params)),
            ],
        }
    }

    /// Feeds an outgoing message into the top of the chain. The error,
    /// if any, is the one raised for the message itself; messages a
    /// layer emitted along the way still complete.
    pub fn send(
        &mut self,
        m: Message,
        seq: &mut u16,
        now: Instant,
        output: &mut StackOutput,
    ) -> Result<(), StackError> {
        self.run(Job::Down(0, m), seq, now, output)
    }

    /// Feeds an incoming message into the bottom of the chain.
    pub fn recv(
        &mut self,
        m: Message,
        seq: &mut u16,
        now: Instant,
        output: &mut StackOutput,
    ) -> Result<(), StackError> {
        let bottom = self.layers.len() - 1;
        self.run(Job::Up(bottom, m), seq, now, output)
    }

    /// Drives every layer's timers once.
    pub fn update(&mut self, seq: &mut u16, now: Instant, output: &mut StackOutput) {
        for i in 0..self.layers.len() {
            let mut io = LayerIo {
                now,
                seq: &mut *seq,
                cursor: i,
                jobs: VecDeque::new(),
                output: &mut *output,
            };
            self.layers[i].update(&mut io);
            let jobs = io.jobs;
            self.drain(jobs, seq, now, output);
        }
    }

    fn run(
        &mut self,
        first: Job,
        seq: &mut u16,
        now: Instant,
        output: &mut StackOutput,
    ) -> Result<(), StackError> {
        let followups = {
            let mut io = LayerIo {
                now,
                seq: &mut *seq,
                cursor: 0,
                jobs: VecDeque::new(),
                output: &mut *output,
            };
            self.dispatch(first, &mut io)?;
            io.jobs
        };
        self.drain(followups, seq, now, output);
        Ok(())
    }

    /// Runs queued follow-up jobs. Their failures are logged rather
    /// than propagated; the triggering operation has already been
    /// accounted for.
    fn drain(
        &mut self,
        mut jobs: VecDeque<Job>,
        seq: &mut u16,
        now: Instant,
        output: &mut StackOutput,
    ) {
        while let Some(job) = jobs.pop_front() {
            let mut io = LayerIo {
                now,
                seq: &mut *seq,
                cursor: 0,
                jobs,
                output: &mut *output,
            };
            if let Err(e) = self.dispatch(job, &mut io) {
                warn!("stack: {}", e);
            }
            jobs = io.jobs;
        }
    }

    fn dispatch(&mut self, job: Job, io: &mut LayerIo) -> Result<(), StackError> {
        match job {
            Job::Down(i, m) => {
                if i == self.layers.len() {
                    io.output.transmit.push(m);
                    Ok(())
                } else {
                    io.cursor = i;
                    self.layers[i].send(m, io)
                }
            }
            Job::Up(i, m) => {
                io.cursor = i;
                self.layers[i].recv(m, io)
            }
            Job::Timeout(i, m) => {
                io.cursor = i;
                self.layers[i].on_ack_timeout(m, io);
                Ok(())
            }
        }
    }
}
