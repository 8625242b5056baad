//! Ring buffer implementation
//!
//! Fixed-capacity circular byte store used for PTY history and process
//! log capture. Once full, each write evicts the oldest bytes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Global counter for tracking bytes held across all ring buffers
static GLOBAL_BUFFERED_BYTES: AtomicUsize = AtomicUsize::new(0);

/// Default capacity for PTY history (256 KiB)
pub const DEFAULT_PTY_BUFFER_BYTES: usize = 256 * 1024;

/// Get total bytes held across all ring buffers
pub fn global_buffered_bytes() -> usize {
    GLOBAL_BUFFERED_BYTES.load(Ordering::Relaxed)
}

/// Get a human-readable memory usage string
pub fn format_memory_usage() -> String {
    let bytes = global_buffered_bytes();
    if bytes >= 1024 * 1024 {
        format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Circular byte buffer
#[derive(Debug)]
pub struct RingBuffer {
    data: VecDeque<u8>,
    capacity: usize,
    /// Bytes ever written, including evicted ones
    total_written: u64,
}

impl RingBuffer {
    /// Create a new ring buffer holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
            total_written: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Bytes that were written but have since been evicted
    pub fn evicted(&self) -> u64 {
        self.total_written - self.data.len() as u64
    }

    /// Append bytes, evicting the oldest ones past capacity
    pub fn write(&mut self, bytes: &[u8]) {
        self.total_written += bytes.len() as u64;
        if self.capacity == 0 {
            return;
        }

        let before = self.data.len();

        // Only the tail of an oversized write can survive
        let bytes = if bytes.len() > self.capacity {
            &bytes[bytes.len() - self.capacity..]
        } else {
            bytes
        };

        let overflow = (self.data.len() + bytes.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.data.drain(..overflow);
        }
        self.data.extend(bytes);

        let after = self.data.len();
        if after > before {
            GLOBAL_BUFFERED_BYTES.fetch_add(after - before, Ordering::Relaxed);
        } else {
            GLOBAL_BUFFERED_BYTES.fetch_sub(before - after, Ordering::Relaxed);
        }
    }

    /// Copy out the readable bytes, oldest first
    pub fn read_all(&self) -> Vec<u8> {
        let (front, back) = self.data.as_slices();
        let mut out = Vec::with_capacity(self.data.len());
        out.extend_from_slice(front);
        out.extend_from_slice(back);
        out
    }

    /// Readable bytes as lossy UTF-8
    pub fn read_string(&self) -> String {
        String::from_utf8_lossy(&self.read_all()).into_owned()
    }

    /// Drop all readable bytes
    pub fn clear(&mut self) {
        GLOBAL_BUFFERED_BYTES.fetch_sub(self.data.len(), Ordering::Relaxed);
        self.data.clear();
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        GLOBAL_BUFFERED_BYTES.fetch_sub(self.data.len(), Ordering::Relaxed);
    }
}
