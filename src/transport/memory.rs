//! In-process transport.
//!
//! Captures everything a connection sends and records close requests instead
//! of touching a socket. Useful for embedding the protocol engine behind a
//! custom I/O layer and for driving connections in tests.

use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::core::buffer::OutputBuffer;
use crate::error::Result;
use crate::transport::Transport;

#[derive(Debug, Default)]
pub struct MemoryTransport {
    written: Mutex<BytesMut>,
    close_requests: Mutex<Vec<bool>>,
    closed: AtomicBool,
    /// Leave sends in the output buffer, as a socket above its high-water
    /// mark would.
    hold_writes: AtomicBool,
    /// Simulated bytes still queued in the socket.
    write_buffer_size: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take everything written so far.
    pub fn take_written(&self) -> Bytes {
        let mut written = self
            .written
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        written.split().freeze()
    }

    /// `should_retry` of every close request, in order.
    pub fn close_requests(&self) -> Vec<bool> {
        self.close_requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn set_hold_writes(&self, hold: bool) {
        self.hold_writes.store(hold, Ordering::Release);
    }

    pub fn set_write_buffer_size(&self, size: usize) {
        self.write_buffer_size.store(size, Ordering::Relaxed);
    }
}

impl Transport for MemoryTransport {
    fn send(&self, buffer: &mut OutputBuffer) -> Result<()> {
        if self.hold_writes.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut written = self
            .written
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while let Some(chunk) = buffer.get_buffer() {
            written.extend_from_slice(&chunk);
            buffer.advance(chunk.len())?;
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !self.is_closed()
    }

    fn write_buffer_size(&self) -> usize {
        self.write_buffer_size.load(Ordering::Relaxed)
    }

    fn mark_for_close(&self, should_retry: bool) {
        self.closed.store(true, Ordering::Release);
        self.close_requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(should_retry);
    }
}
