//! Inbound and outbound byte buffers.
//!
//! [`InputBuffer`] accumulates socket reads and always starts at a message
//! boundary: callers only consume lengths they have already validated as a
//! whole message. Consumed ranges are split off as owned [`Bytes`], so a
//! decoded message never borrows from the receive buffer.
//!
//! [`OutputBuffer`] is a queue of encoded messages. A message can be
//! prepended ahead of normal traffic without splitting one that is already
//! partially written.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

use crate::error::{RelayError, Result};

/// Append/consume buffer for bytes read from a socket.
#[derive(Debug, Default)]
pub struct InputBuffer {
    data: BytesMut,
}

impl InputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Up to `n` bytes from the front, without consuming them.
    pub fn peek(&self, n: usize) -> &[u8] {
        &self.data[..n.min(self.data.len())]
    }

    /// Everything currently buffered.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Remove exactly `n` bytes from the front.
    pub fn consume(&mut self, n: usize) -> Result<Bytes> {
        if n > self.data.len() {
            return Err(RelayError::BufferUnderflow {
                requested: n,
                available: self.data.len(),
            });
        }
        Ok(self.data.split_to(n).freeze())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// Queue of encoded messages waiting for the transport.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    chunks: VecDeque<Bytes>,
    /// Bytes of the front chunk already handed to the transport.
    front_offset: usize,
    length: usize,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.length += bytes.len();
        self.chunks.push_back(bytes);
    }

    /// Queue `bytes` ahead of everything not yet started.
    pub fn prepend(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.length += bytes.len();
        if self.front_offset > 0 {
            self.chunks.insert(1, bytes);
        } else {
            self.chunks.push_front(bytes);
        }
    }

    /// Unsent remainder of the front chunk.
    pub fn get_buffer(&self) -> Option<Bytes> {
        self.chunks
            .front()
            .map(|front| front.slice(self.front_offset..))
    }

    /// Mark `n` bytes from the front as sent.
    pub fn advance(&mut self, mut n: usize) -> Result<()> {
        if n > self.length {
            return Err(RelayError::BufferUnderflow {
                requested: n,
                available: self.length,
            });
        }
        self.length -= n;
        while n > 0 {
            let remaining = match self.chunks.front() {
                Some(front) => front.len() - self.front_offset,
                None => break,
            };
            if n >= remaining {
                self.chunks.pop_front();
                self.front_offset = 0;
                n -= remaining;
            } else {
                self.front_offset += n;
                n = 0;
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn has_partial_message(&self) -> bool {
        self.front_offset > 0
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.front_offset = 0;
        self.length = 0;
    }
}
