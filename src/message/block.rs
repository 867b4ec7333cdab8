//! Block1/Block2 option values and payload slicing (RFC 7959).
//!
//! A block option packs `(num << 4) | (more << 3) | szx` into a uint of
//! at most three bytes, where the block size is `2^(szx + 4)`.

use thiserror::Error;

use super::options;
use super::Message;

const SZX_MASK: u32 = 0x07;
const MORE_MASK: u32 = 1 << 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    /// The requested block starts past the end of the payload.
    #[error("block offset beyond payload")]
    OutOfRange,
    /// The peer requested a block out of order.
    #[error("block sequence confusion")]
    SequenceConfusion,
}

/// Decoded form of a Block1 or Block2 option.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BlockOption {
    pub num: u32,
    pub more: bool,
    pub size: u32,
}

impl BlockOption {
    pub fn new(num: u32, more: bool, size: u32) -> BlockOption {
        BlockOption { num, more, size }
    }

    pub fn from_value(value: u32) -> BlockOption {
        BlockOption {
            num: value >> 4,
            more: value & MORE_MASK == MORE_MASK,
            size: size_from_exponent(value & SZX_MASK),
        }
    }

    pub fn value(&self) -> u32 {
        let mut value = self.num << 4;
        if self.more {
            value |= MORE_MASK;
        }
        value | exponent_for_size(self.size)
    }

    /// Reads the Block1 option from a message, if present.
    pub fn block1(m: &Message) -> Option<BlockOption> {
        m.options.get_uint(options::BLOCK1).map(BlockOption::from_value)
    }

    /// Reads the Block2 option from a message, if present.
    pub fn block2(m: &Message) -> Option<BlockOption> {
        m.options.get_uint(options::BLOCK2).map(BlockOption::from_value)
    }
}

fn exponent_for_size(size: u32) -> u32 {
    match size {
        16 => 0,
        32 => 1,
        64 => 2,
        128 => 3,
        256 => 4,
        512 => 5,
        _ => 6,
    }
}

fn size_from_exponent(exp: u32) -> u32 {
    match exp {
        0 => 16,
        1 => 32,
        2 => 64,
        3 => 128,
        4 => 256,
        5 => 512,
        _ => 1024,
    }
}

/// Rounds an arbitrary size down to the nearest valid block size.
pub fn fix_block_size(size: u32) -> u32 {
    match size {
        0..=31 => 16,
        32..=63 => 32,
        64..=127 => 64,
        128..=255 => 128,
        256..=511 => 256,
        512..=1023 => 512,
        _ => 1024,
    }
}

/// Stateless random-access slicer over a response payload. The block2
/// responder recomputes the offset from the peer's `(num, size)` on
/// every request, so a peer that shrinks the block size mid-transfer
/// still addresses the right bytes.
pub struct BlockBuffer<'a>(pub &'a [u8]);

impl<'a> BlockBuffer<'a> {
    pub fn read(&self, num: u32, size: u32) -> Result<(BlockOption, &'a [u8]), BlockError> {
        let len = self.0.len();
        let start = num as usize * size as usize;
        if start >= len {
            return Err(BlockError::OutOfRange);
        }
        let end = len.min(start + size as usize);
        let opt = BlockOption::new(num, end < len, size);
        Ok((opt, &self.0[start..end]))
    }
}

/// Sequential reader over a request payload for the block1 transmitter.
/// Tracks the expected next block number itself, so a confused peer
/// echo is detected instead of resent blindly.
#[derive(Debug, Default)]
pub struct BlockReader {
    seq: u32,
    off: usize,
    buf: Vec<u8>,
}

impl BlockReader {
    pub fn new(buf: Vec<u8>) -> BlockReader {
        BlockReader { seq: 0, off: 0, buf }
    }

    pub fn read(&mut self, seq: u32, size: u32) -> Result<(BlockOption, Vec<u8>), BlockError> {
        if self.off >= self.buf.len() {
            return Err(BlockError::OutOfRange);
        }
        if self.seq != seq {
            return Err(BlockError::SequenceConfusion);
        }
        self.seq = self.off as u32 / size + 1;

        let start = self.off;
        self.off = self.buf.len().min(start + size as usize);

        let opt = BlockOption::new(self.seq - 1, self.off < self.buf.len(), size);
        Ok((opt, self.buf[start..self.off].to_vec()))
    }
}
