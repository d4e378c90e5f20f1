// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

/// Fixed-capacity circular byte buffer holding the tail of a session's
/// PTY output.
///
/// Appends never grow the buffer: once `capacity` bytes are stored, every
/// new byte overwrites the oldest one. The total number of bytes ever
/// written is tracked so diagnostics can report how much history was lost.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Vec<u8>,
    capacity: usize,
    write_pos: usize,
    total_written: u64,
}

impl RingBuffer {
    /// Create a new ring buffer with the given capacity (clamped to 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { buf: vec![0u8; capacity], capacity, write_pos: 0, total_written: 0 }
    }

    /// Append data, discarding the oldest bytes once full.
    pub fn write(&mut self, data: &[u8]) {
        let accepted = data.len() as u64;
        // Only the last `capacity` bytes of an oversized write can survive.
        let data = &data[data.len().saturating_sub(self.capacity)..];

        let start = self.write_pos;
        let end = start + data.len();
        if end <= self.capacity {
            self.buf[start..end].copy_from_slice(data);
        } else {
            let first = self.capacity - start;
            self.buf[start..].copy_from_slice(&data[..first]);
            self.buf[..data.len() - first].copy_from_slice(&data[first..]);
        }

        self.write_pos = end % self.capacity;
        self.total_written += accepted;
    }

    /// Number of bytes currently held.
    pub fn len(&self) -> usize {
        self.total_written.min(self.capacity as u64) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.total_written == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total bytes ever accepted by [`write`](Self::write).
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Held bytes as two slices in chronological order.
    pub fn as_slices(&self) -> (&[u8], &[u8]) {
        let len = self.len();
        if len < self.capacity {
            (&self.buf[..len], &[])
        } else {
            (&self.buf[self.write_pos..], &self.buf[..self.write_pos])
        }
    }

    /// Copy the held bytes into one contiguous buffer, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        let (a, b) = self.as_slices();
        let mut out = Vec::with_capacity(a.len() + b.len());
        out.extend_from_slice(a);
        out.extend_from_slice(b);
        out
    }

    /// Drop all held bytes.
    pub fn clear(&mut self) {
        self.write_pos = 0;
        self.total_written = 0;
    }
}

#[cfg(test)]
#[path = "ring_tests.rs"]
mod tests;
