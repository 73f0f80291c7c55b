//! Bit-level reader over a partially loaded databin, with the packet-header
//! bit-unstuffing of ISO/IEC 15444-1 B.10.1: the byte following a 0xFF byte
//! carries a stuffed 0 in its most significant bit.
//!
//! Every read distinguishes "not loaded yet" (`Ok(None)`) from malformed
//! data (`Err`). Transactions snapshot the cursor so that a parse attempt
//! interrupted by missing data can be rolled back and retried later.

use crate::databin::Databin;
use crate::error::JpipError;
use crate::marker::MARKER_START_BYTE;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
struct Cursor {
    byte_offset: u64,
    /// Bits consumed within the current byte, 0..8.
    bit_offset: u8,
    /// The previously finished byte was 0xFF, so the current byte's most
    /// significant bit is a stuffed zero.
    after_ff: bool,
}

pub struct BitstreamReader {
    databin: Arc<Databin>,
    cursor: Cursor,
    snapshots: Vec<Cursor>,
}

impl BitstreamReader {
    pub fn new(databin: Arc<Databin>) -> Self {
        Self {
            databin,
            cursor: Cursor {
                byte_offset: 0,
                bit_offset: 0,
                after_ff: false,
            },
            snapshots: Vec::new(),
        }
    }

    pub fn databin(&self) -> &Arc<Databin> {
        &self.databin
    }

    /// Snapshot the cursor; every transaction must end in a matching
    /// `commit` or `abort`.
    pub fn start_transaction(&mut self) {
        self.snapshots.push(self.cursor);
    }

    pub fn commit(&mut self) -> Result<(), JpipError> {
        match self.snapshots.pop() {
            Some(_) => Ok(()),
            None => {
                debug_assert!(false, "commit without open transaction");
                Err(JpipError::InternalInconsistency(
                    "commit without open transaction",
                ))
            }
        }
    }

    /// Roll the cursor back to the matching `start_transaction`.
    pub fn abort(&mut self) -> Result<(), JpipError> {
        match self.snapshots.pop() {
            Some(snapshot) => {
                self.cursor = snapshot;
                Ok(())
            }
            None => {
                debug_assert!(false, "abort without open transaction");
                Err(JpipError::InternalInconsistency(
                    "abort without open transaction",
                ))
            }
        }
    }

    /// Byte offset of the cursor; valid only on a byte boundary.
    pub fn byte_offset(&self) -> Result<u64, JpipError> {
        if self.cursor.bit_offset != 0 {
            debug_assert!(false, "byte offset queried mid-byte");
            return Err(JpipError::InternalInconsistency(
                "byte offset queried mid-byte",
            ));
        }
        Ok(self.cursor.byte_offset)
    }

    /// Reposition to a byte boundary, discarding any unstuffing context.
    pub fn seek_to_byte(&mut self, offset: u64) {
        self.cursor = Cursor {
            byte_offset: offset,
            bit_offset: 0,
            after_ff: false,
        };
    }

    /// Read a single bit. `Ok(None)` when the byte is not loaded yet.
    pub fn shift_bit(&mut self) -> Result<Option<u8>, JpipError> {
        let Some(byte) = self.databin.byte_at(self.cursor.byte_offset) else {
            return Ok(None);
        };
        let mut bit_offset = self.cursor.bit_offset;
        if bit_offset == 0 && self.cursor.after_ff {
            if byte & 0x80 != 0 {
                return Err(JpipError::InvalidBitStuffing);
            }
            bit_offset = 1;
        }
        let bit = (byte >> (7 - bit_offset)) & 1;
        bit_offset += 1;
        if bit_offset == 8 {
            self.cursor = Cursor {
                byte_offset: self.cursor.byte_offset + 1,
                bit_offset: 0,
                after_ff: byte == MARKER_START_BYTE,
            };
        } else {
            self.cursor.bit_offset = bit_offset;
        }
        Ok(Some(bit))
    }

    /// Read `count` bits MSB-first. The cursor is unchanged on `Ok(None)`.
    pub fn shift_bits(&mut self, count: u8) -> Result<Option<u32>, JpipError> {
        debug_assert!(count <= 32);
        let saved = self.cursor;
        let mut value = 0u32;
        for _ in 0..count {
            match self.shift_bit()? {
                Some(bit) => value = (value << 1) | u32::from(bit),
                None => {
                    self.cursor = saved;
                    return Ok(None);
                }
            }
        }
        Ok(Some(value))
    }

    /// Count consecutive 1 bits, consuming the terminating 0. The cursor is
    /// unchanged on `Ok(None)`.
    pub fn count_ones_until_zero(&mut self) -> Result<Option<u32>, JpipError> {
        self.count_until(0)
    }

    /// Count consecutive 0 bits, consuming the terminating 1. The cursor is
    /// unchanged on `Ok(None)`.
    pub fn count_zeros_until_one(&mut self) -> Result<Option<u32>, JpipError> {
        self.count_until(1)
    }

    fn count_until(&mut self, terminator: u8) -> Result<Option<u32>, JpipError> {
        let saved = self.cursor;
        let mut count = 0u32;
        loop {
            match self.shift_bit()? {
                Some(bit) if bit == terminator => return Ok(Some(count)),
                Some(_) => count += 1,
                None => {
                    self.cursor = saved;
                    return Ok(None);
                }
            }
        }
    }

    /// Advance to the next byte boundary. A terminating 0xFF byte pulls the
    /// following stuffed byte into the header as well; its most significant
    /// bit must be the stuffed zero.
    pub fn align(&mut self) -> Result<Option<()>, JpipError> {
        let mut offset = self.cursor.byte_offset;
        if self.cursor.bit_offset > 0 {
            let Some(byte) = self.databin.byte_at(offset) else {
                return Ok(None);
            };
            offset += 1;
            if byte == MARKER_START_BYTE {
                let Some(stuffed) = self.databin.byte_at(offset) else {
                    return Ok(None);
                };
                if stuffed & 0x80 != 0 {
                    return Err(JpipError::InvalidBitStuffing);
                }
                offset += 1;
            }
        } else if self.cursor.after_ff {
            let Some(stuffed) = self.databin.byte_at(offset) else {
                return Ok(None);
            };
            if stuffed & 0x80 != 0 {
                return Err(JpipError::InvalidBitStuffing);
            }
            offset += 1;
        }
        self.cursor = Cursor {
            byte_offset: offset,
            bit_offset: 0,
            after_ff: false,
        };
        Ok(Some(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::databin::{DatabinClass, DatabinId};

    fn databin_with(bytes: &[u8]) -> Arc<Databin> {
        let databin = Arc::new(Databin::new(DatabinId {
            class: DatabinClass::Precinct,
            in_class_index: 0,
        }));
        databin.insert_range(0, bytes).unwrap();
        databin
    }

    #[test]
    fn test_shift_bits_msb_first() {
        let mut reader = BitstreamReader::new(databin_with(&[0b1011_0010, 0b0100_0000]));
        assert_eq!(reader.shift_bit().unwrap(), Some(1));
        assert_eq!(reader.shift_bits(4).unwrap(), Some(0b0110));
        assert_eq!(reader.shift_bits(4).unwrap(), Some(0b0100));
    }

    #[test]
    fn test_stuffed_bit_after_ff_is_skipped() {
        // 0xFF then 0b0110_0000: the MSB of the second byte is the stuffed
        // zero, so the next seven data bits are 110_0000.
        let mut reader = BitstreamReader::new(databin_with(&[0xFF, 0b0110_0000]));
        assert_eq!(reader.shift_bits(8).unwrap(), Some(0xFF));
        assert_eq!(reader.shift_bits(7).unwrap(), Some(0b110_0000));
        assert_eq!(reader.byte_offset().unwrap(), 2);
    }

    #[test]
    fn test_set_msb_after_ff_is_malformed() {
        let mut reader = BitstreamReader::new(databin_with(&[0xFF, 0b1000_0000]));
        assert_eq!(reader.shift_bits(8).unwrap(), Some(0xFF));
        assert_eq!(reader.shift_bit(), Err(JpipError::InvalidBitStuffing));
    }

    #[test]
    fn test_missing_byte_returns_none_and_keeps_cursor() {
        let databin = Arc::new(Databin::new(DatabinId {
            class: DatabinClass::Precinct,
            in_class_index: 0,
        }));
        databin.insert_range(0, &[0b1010_0000]).unwrap();
        let mut reader = BitstreamReader::new(databin);
        assert_eq!(reader.shift_bits(12).unwrap(), None);
        // The cursor did not move; the available bits still read correctly.
        assert_eq!(reader.shift_bits(4).unwrap(), Some(0b1010));
    }

    #[test]
    fn test_transaction_rollback_and_commit() {
        let mut reader = BitstreamReader::new(databin_with(&[0b1100_1010]));
        reader.start_transaction();
        assert_eq!(reader.shift_bits(4).unwrap(), Some(0b1100));
        reader.abort().unwrap();
        assert_eq!(reader.shift_bits(4).unwrap(), Some(0b1100));
        reader.start_transaction();
        assert_eq!(reader.shift_bits(4).unwrap(), Some(0b1010));
        reader.commit().unwrap();
        assert_eq!(reader.byte_offset().unwrap(), 1);
    }

    #[test]
    fn test_count_runs() {
        let mut reader = BitstreamReader::new(databin_with(&[0b1110_0010]));
        assert_eq!(reader.count_ones_until_zero().unwrap(), Some(3));
        assert_eq!(reader.count_zeros_until_one().unwrap(), Some(2));
    }

    #[test]
    fn test_align_consumes_stuffed_byte_after_ff() {
        let mut reader = BitstreamReader::new(databin_with(&[0xFF, 0x7F, 0xAB]));
        assert_eq!(reader.shift_bits(8).unwrap(), Some(0xFF));
        assert_eq!(reader.align().unwrap(), Some(()));
        assert_eq!(reader.byte_offset().unwrap(), 2);
        let mut reader = BitstreamReader::new(databin_with(&[0b1010_0000, 0xCD]));
        assert_eq!(reader.shift_bits(3).unwrap(), Some(0b101));
        assert_eq!(reader.align().unwrap(), Some(()));
        assert_eq!(reader.byte_offset().unwrap(), 1);
    }

    #[test]
    fn test_seek_resets_unstuffing_context() {
        let mut reader = BitstreamReader::new(databin_with(&[0xFF, 0x91, 0x80]));
        assert_eq!(reader.shift_bits(8).unwrap(), Some(0xFF));
        reader.seek_to_byte(2);
        // 0x80 would be malformed right after 0xFF, but the seek landed on
        // a fresh byte boundary.
        assert_eq!(reader.shift_bit().unwrap(), Some(1));
    }
}
