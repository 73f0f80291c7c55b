//! Growable chunked byte buffer.
//!
//! Codeblock payloads are physically split across a precinct's stored
//! ranges; this type lets the collector append those pieces without copying
//! them into one allocation up front, and later copy any sub-range out as a
//! contiguous buffer.

/// An append-only buffer made of discontiguous chunks with a single logical
/// offset space.
#[derive(Debug, Default)]
pub struct CompositeArray {
    chunks: Vec<Vec<u8>>,
    /// Logical start offset of each chunk; parallel to `chunks`.
    offsets: Vec<u64>,
    length: u64,
}

impl CompositeArray {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total logical length in bytes.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Append a chunk; returns the logical offset it was placed at.
    pub fn push_chunk(&mut self, bytes: Vec<u8>) -> u64 {
        let offset = self.length;
        self.length += bytes.len() as u64;
        self.offsets.push(offset);
        self.chunks.push(bytes);
        offset
    }

    /// Copy `[start, start + length)` out as one contiguous buffer.
    ///
    /// Panics in debug builds if the range exceeds the logical length; that
    /// is a caller bug, not a data-availability condition.
    pub fn copy_range(&self, start: u64, length: u64) -> Vec<u8> {
        debug_assert!(start + length <= self.length, "composite range out of bounds");
        if length == 0 {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(length as usize);
        let mut remaining = length;
        let mut at = start;
        let mut idx = self.offsets.partition_point(|&o| o <= start) - 1;
        while remaining > 0 {
            let chunk = &self.chunks[idx];
            let local = (at - self.offsets[idx]) as usize;
            let take = (chunk.len() - local).min(remaining as usize);
            out.extend_from_slice(&chunk[local..local + take]);
            at += take as u64;
            remaining -= take as u64;
            idx += 1;
        }
        out
    }

    /// Copy the full content out as one contiguous buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.length as usize);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }
}
