//! Partial-range byte stores ("databins") for JPIP delivery.
//!
//! A databin holds out-of-order fragments of one logical unit of a
//! codestream (main header, tile header, precinct, ...). Fragments are
//! merged on insertion and never removed, so a reader always observes a
//! monotonically growing set of available offsets.

use crate::error::JpipError;
use num_enum::TryFromPrimitive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// JPIP databin class identifiers (ISO/IEC 15444-9 A.2.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum DatabinClass {
    Precinct = 0,
    TileHeader = 2,
    /// Whole-tile bins, delivered in JPT-stream mode only.
    Tile = 4,
    MainHeader = 6,
    Metadata = 8,
}

/// Identity of a databin: class plus in-class index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DatabinId {
    pub class: DatabinClass,
    pub in_class_index: u64,
}

#[derive(Debug, Clone)]
struct StoredRange {
    start: u64,
    bytes: Vec<u8>,
}

impl StoredRange {
    fn end(&self) -> u64 {
        self.start + self.bytes.len() as u64
    }
}

/// Ordered set of non-overlapping byte ranges with merge-on-insert.
#[derive(Debug, Default)]
pub struct RangeStore {
    ranges: Vec<StoredRange>,
    known_length: Option<u64>,
}

impl RangeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fragment at `start`, merging with overlapping and adjacent
    /// ranges. Previously stored bytes win on overlap, so re-delivery of
    /// already-covered offsets is idempotent. Returns true if any offset
    /// became newly available.
    pub fn insert_range(&mut self, start: u64, bytes: &[u8]) -> Result<bool, JpipError> {
        if bytes.is_empty() {
            return Ok(false);
        }
        let end = start + bytes.len() as u64;
        if let Some(known) = self.known_length
            && end > known
        {
            return Err(JpipError::RangeBeyondKnownLength);
        }

        // Find the span of existing ranges that overlap or touch [start, end).
        let first = self.ranges.partition_point(|r| r.end() < start);
        let last = self.ranges.partition_point(|r| r.start <= end);
        if first == last {
            self.ranges.insert(
                first,
                StoredRange {
                    start,
                    bytes: bytes.to_vec(),
                },
            );
            return Ok(true);
        }

        let merged_start = self.ranges[first].start.min(start);
        let merged_end = self.ranges[last - 1].end().max(end);
        let mut merged = vec![0u8; (merged_end - merged_start) as usize];
        let mut previously_available = 0usize;

        let at = (start - merged_start) as usize;
        merged[at..at + bytes.len()].copy_from_slice(bytes);
        for range in &self.ranges[first..last] {
            let at = (range.start - merged_start) as usize;
            merged[at..at + range.bytes.len()].copy_from_slice(&range.bytes);
            previously_available += range.bytes.len();
        }

        let grew = merged.len() > previously_available;
        self.ranges.splice(
            first..last,
            std::iter::once(StoredRange {
                start: merged_start,
                bytes: merged,
            }),
        );
        Ok(grew)
    }

    /// Record the total length of this bin, learned from the transport.
    pub fn mark_known_length(&mut self, length: u64) -> Result<(), JpipError> {
        if let Some(existing) = self.known_length {
            if existing != length {
                return Err(JpipError::InternalInconsistency(
                    "databin known length reported twice with different values",
                ));
            }
            return Ok(());
        }
        if self.ranges.last().is_some_and(|r| r.end() > length) {
            return Err(JpipError::RangeBeyondKnownLength);
        }
        self.known_length = Some(length);
        Ok(())
    }

    pub fn known_length(&self) -> Option<u64> {
        self.known_length
    }

    /// True iff every byte of `[start, start + length)` has been inserted.
    pub fn is_range_available(&self, start: u64, length: u64) -> bool {
        if length == 0 {
            return true;
        }
        self.containing_range(start)
            .is_some_and(|r| r.end() >= start + length)
    }

    /// Copy out a contiguous sub-range, or `None` if any byte is missing.
    /// An empty range has no missing bytes, so it always succeeds.
    pub fn copy_out(&self, start: u64, length: u64) -> Option<Vec<u8>> {
        if length == 0 {
            return Some(Vec::new());
        }
        let range = self.containing_range(start)?;
        if range.end() < start + length {
            return None;
        }
        let at = (start - range.start) as usize;
        Some(range.bytes[at..at + length as usize].to_vec())
    }

    /// Single-byte variant of `copy_out`, used by the bit-level reader.
    pub fn byte_at(&self, offset: u64) -> Option<u8> {
        let range = self.containing_range(offset)?;
        Some(range.bytes[(offset - range.start) as usize])
    }

    /// True iff one range spans `[0, known_length)`.
    pub fn is_fully_loaded(&self) -> bool {
        match self.known_length {
            Some(length) => length == 0 || self.is_range_available(0, length),
            None => false,
        }
    }

    /// Length of the contiguous prefix that starts at offset zero.
    pub fn loaded_prefix_length(&self) -> u64 {
        match self.ranges.first() {
            Some(r) if r.start == 0 => r.end(),
            _ => 0,
        }
    }

    fn containing_range(&self, offset: u64) -> Option<&StoredRange> {
        let idx = self.ranges.partition_point(|r| r.end() <= offset);
        let range = self.ranges.get(idx)?;
        (range.start <= offset).then_some(range)
    }
}

/// Handle returned by [`Databin::add_listener`], used to unregister.
pub type ListenerHandle = u64;

type Listener = Box<dyn Fn(&DatabinId) + Send + Sync>;
type SharedListener = Arc<dyn Fn(&DatabinId) + Send + Sync>;

/// A thread-safe databin: a [`RangeStore`] plus an observer list.
///
/// Insertion is applied under a write lock, so concurrent queries never
/// observe a half-merged range set. Listeners are invoked synchronously in
/// registration order, after both the store lock and the listener lock have
/// been released; a listener may unregister itself (or any other listener)
/// during dispatch.
pub struct Databin {
    id: DatabinId,
    store: RwLock<RangeStore>,
    listeners: Mutex<Vec<(ListenerHandle, SharedListener)>>,
    next_listener: AtomicU64,
}

impl Databin {
    pub fn new(id: DatabinId) -> Self {
        Self {
            id,
            store: RwLock::new(RangeStore::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> DatabinId {
        self.id
    }

    pub fn insert_range(&self, start: u64, bytes: &[u8]) -> Result<(), JpipError> {
        let grew = self
            .store
            .write()
            .expect("databin store lock poisoned")
            .insert_range(start, bytes)?;
        if grew {
            log::trace!(
                "{:?} {} grew: +{} bytes at {start}",
                self.id.class,
                self.id.in_class_index,
                bytes.len(),
            );
            self.notify();
        }
        Ok(())
    }

    pub fn mark_known_length(&self, length: u64) -> Result<(), JpipError> {
        self.store
            .write()
            .expect("databin store lock poisoned")
            .mark_known_length(length)?;
        self.notify();
        Ok(())
    }

    pub fn is_range_available(&self, start: u64, length: u64) -> bool {
        self.read().is_range_available(start, length)
    }

    pub fn copy_out(&self, start: u64, length: u64) -> Option<Vec<u8>> {
        self.read().copy_out(start, length)
    }

    pub fn byte_at(&self, offset: u64) -> Option<u8> {
        self.read().byte_at(offset)
    }

    pub fn is_fully_loaded(&self) -> bool {
        self.read().is_fully_loaded()
    }

    pub fn known_length(&self) -> Option<u64> {
        self.read().known_length()
    }

    pub fn loaded_prefix_length(&self) -> u64 {
        self.read().loaded_prefix_length()
    }

    /// Copy of the full content; only valid once fully loaded.
    pub fn copy_all(&self) -> Option<Vec<u8>> {
        let store = self.read();
        let length = store.known_length()?;
        store.copy_out(0, length)
    }

    /// Register a "data arrived" listener. Dispatch is synchronous and in
    /// registration order.
    pub fn add_listener(&self, listener: Listener) -> ListenerHandle {
        let handle = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .expect("databin listener lock poisoned")
            .push((handle, Arc::from(listener)));
        handle
    }

    pub fn remove_listener(&self, handle: ListenerHandle) {
        self.listeners
            .lock()
            .expect("databin listener lock poisoned")
            .retain(|(h, _)| *h != handle);
    }

    fn notify(&self) {
        // Dispatch from a snapshot, outside the listener lock: a callback
        // that calls remove_listener on this databin must not re-enter it.
        let snapshot: Vec<SharedListener> = self
            .listeners
            .lock()
            .expect("databin listener lock poisoned")
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in &snapshot {
            listener(&self.id);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RangeStore> {
        self.store.read().expect("databin store lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn precinct_id(index: u64) -> DatabinId {
        DatabinId {
            class: DatabinClass::Precinct,
            in_class_index: index,
        }
    }

    #[test]
    fn test_insert_order_independence() {
        // The union of available offsets must not depend on delivery order.
        let deliveries: [&[(u64, &[u8])]; 3] = [
            &[(0, b"abcd"), (4, b"efgh"), (10, b"xy")],
            &[(10, b"xy"), (4, b"efgh"), (0, b"abcd")],
            &[(4, b"efgh"), (0, b"abcd"), (10, b"xy")],
        ];
        for delivery in deliveries {
            let mut store = RangeStore::new();
            for (start, bytes) in delivery {
                store.insert_range(*start, bytes).unwrap();
            }
            assert_eq!(store.copy_out(0, 8).unwrap(), b"abcdefgh");
            assert_eq!(store.copy_out(10, 2).unwrap(), b"xy");
            assert!(!store.is_range_available(8, 1));
        }
    }

    #[test]
    fn test_overlapping_insert_is_idempotent() {
        let mut store = RangeStore::new();
        store.insert_range(2, b"cdef").unwrap();
        store.insert_range(0, b"abcdefgh").unwrap();
        store.insert_range(2, b"cdef").unwrap();
        assert_eq!(store.copy_out(0, 8).unwrap(), b"abcdefgh");
    }

    #[test]
    fn test_copy_out_returns_none_on_gap() {
        let mut store = RangeStore::new();
        store.insert_range(0, b"ab").unwrap();
        store.insert_range(4, b"ef").unwrap();
        assert!(store.copy_out(0, 6).is_none());
        assert!(store.copy_out(3, 1).is_none());
        assert_eq!(store.copy_out(4, 2).unwrap(), b"ef");
    }

    #[test]
    fn test_adjacent_ranges_merge() {
        let mut store = RangeStore::new();
        store.insert_range(0, b"ab").unwrap();
        store.insert_range(2, b"cd").unwrap();
        assert_eq!(store.loaded_prefix_length(), 4);
        assert_eq!(store.copy_out(0, 4).unwrap(), b"abcd");
    }

    #[test]
    fn test_known_length_and_fully_loaded() {
        let mut store = RangeStore::new();
        store.insert_range(0, b"abcd").unwrap();
        assert!(!store.is_fully_loaded());
        store.mark_known_length(6).unwrap();
        assert!(!store.is_fully_loaded());
        store.insert_range(4, b"ef").unwrap();
        assert!(store.is_fully_loaded());
        assert_eq!(
            store.insert_range(6, b"x"),
            Err(JpipError::RangeBeyondKnownLength)
        );
    }

    #[test]
    fn test_zero_length_bin_is_fully_loaded() {
        let mut store = RangeStore::new();
        store.mark_known_length(0).unwrap();
        assert!(store.is_fully_loaded());
    }

    #[test]
    fn test_zero_length_copy_always_succeeds() {
        // An empty interval has no missing bytes, so copying it must work
        // even where nothing has been inserted.
        let store = RangeStore::new();
        assert_eq!(store.copy_out(0, 0).unwrap(), b"");
        assert_eq!(store.copy_out(5, 0).unwrap(), b"");

        // In particular, a zero-length bin (an empty tile header) must be
        // copyable as a whole.
        let bin = Databin::new(precinct_id(0));
        bin.mark_known_length(0).unwrap();
        assert!(bin.is_fully_loaded());
        assert_eq!(bin.copy_all().unwrap(), b"");
    }

    #[test]
    fn test_listener_fires_on_growth_and_unregisters() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicUsize;

        let bin = Databin::new(precinct_id(3));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_listener = Arc::clone(&calls);
        let handle = bin.add_listener(Box::new(move |id| {
            assert_eq!(id.in_class_index, 3);
            calls_in_listener.fetch_add(1, Ordering::Relaxed);
        }));

        bin.insert_range(0, b"ab").unwrap();
        // Re-delivering covered bytes must not re-notify.
        bin.insert_range(0, b"ab").unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        bin.remove_listener(handle);
        bin.insert_range(2, b"cd").unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_listener_can_unregister_itself_during_dispatch() {
        use std::sync::atomic::AtomicUsize;

        let bin = Arc::new(Databin::new(precinct_id(7)));
        let calls = Arc::new(AtomicUsize::new(0));
        let handle_cell = Arc::new(AtomicU64::new(0));

        let bin_in_listener = Arc::clone(&bin);
        let calls_in_listener = Arc::clone(&calls);
        let cell = Arc::clone(&handle_cell);
        let handle = bin.add_listener(Box::new(move |_| {
            calls_in_listener.fetch_add(1, Ordering::Relaxed);
            bin_in_listener.remove_listener(cell.load(Ordering::Relaxed));
        }));
        handle_cell.store(handle, Ordering::Relaxed);

        bin.insert_range(0, b"ab").unwrap();
        bin.insert_range(2, b"cd").unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
