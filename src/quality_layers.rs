//! Packet-header parsing per precinct (ISO/IEC 15444-1 B.10): quality-layer
//! boundaries within a precinct databin.
//!
//! Packets arrive incrementally over JPIP, so each parse attempt runs inside
//! a bitstream transaction with a snapshot of the tag trees and codeblock
//! state; an attempt that runs out of bytes is rolled back and retried once
//! more of the databin has been delivered. Packet bodies are never decoded
//! here, only their lengths, which is all the reconstructor needs.

use crate::bitstream::BitstreamReader;
use crate::cache::DatabinCache;
use crate::codestream::{CodestreamStructure, TileStructure};
use crate::databin::Databin;
use crate::error::JpipError;
use crate::marker::{J2kMarkerCode, MARKER_START_BYTE, SOP_SEGMENT_LENGTH};
use crate::region::PrecinctPosition;
use crate::tag_tree::TagTree;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One codeblock's contribution to a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketCodeblock {
    pub subband: usize,
    /// Raster index within the subband's codeblock grid.
    pub codeblock: usize,
    pub added_passes: u32,
    /// Absolute offset of the contribution within the precinct databin.
    pub body_offset: u64,
    pub body_length: u64,
    /// Signalled on first inclusion only.
    pub missing_bitplanes: Option<u32>,
}

/// A fully parsed packet header and the extent of its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPacket {
    pub layer: u32,
    pub header_start: u64,
    pub body_start: u64,
    /// First offset past the packet body.
    pub end_offset: u64,
    pub codeblocks: Vec<PacketCodeblock>,
}

#[derive(Debug, Clone, Default)]
struct CodeblockState {
    included: bool,
    lblock: u32,
    missing_bitplanes: u32,
}

#[derive(Debug, Clone)]
struct SubbandState {
    num_x: usize,
    num_y: usize,
    inclusion: TagTree,
    zero_bitplanes: TagTree,
    blocks: Vec<CodeblockState>,
}

/// Sequential packet-header parser for one precinct databin.
pub struct QualityLayerParser {
    databin: Arc<Databin>,
    reader: BitstreamReader,
    sop_markers: bool,
    eph_markers: bool,
    declared_layers: u32,
    subbands: Vec<SubbandState>,
    packets: Vec<ParsedPacket>,
}

impl QualityLayerParser {
    pub fn new(
        tile: &TileStructure,
        position: &PrecinctPosition,
        databin: Arc<Databin>,
    ) -> Result<Self, JpipError> {
        let coding = &tile.coding;
        // Selective arithmetic bypass and per-pass termination both split a
        // codeblock contribution into multiple codeword segments (B.10.7.2),
        // which this parser does not follow.
        if coding.codeblock_style & 0x05 != 0 {
            return Err(JpipError::UnsupportedFeature(
                "multiple codeword segments per codeblock (B.10.7.2)",
            ));
        }
        let subbands = tile
            .codeblock_grids(
                position.component,
                position.resolution,
                position.precinct_x,
                position.precinct_y,
            )
            .into_iter()
            .map(|grid| {
                let num_x = grid.num_x as usize;
                let num_y = grid.num_y as usize;
                SubbandState {
                    num_x,
                    num_y,
                    inclusion: TagTree::new(num_x.max(1), num_y.max(1)),
                    zero_bitplanes: TagTree::new(num_x.max(1), num_y.max(1)),
                    blocks: {
                        let mut blocks = vec![CodeblockState::default(); num_x * num_y];
                        for block in &mut blocks {
                            block.lblock = 3;
                        }
                        blocks
                    },
                }
            })
            .collect();
        Ok(Self {
            reader: BitstreamReader::new(Arc::clone(&databin)),
            databin,
            sop_markers: coding.sop_markers,
            eph_markers: coding.eph_markers,
            declared_layers: coding.num_quality_layers as u32,
            subbands,
            packets: Vec::new(),
        })
    }

    pub fn declared_layers(&self) -> u32 {
        self.declared_layers
    }

    pub fn packets(&self) -> &[ParsedPacket] {
        &self.packets
    }

    /// Parse packet headers until `max_layers` packets are known or the
    /// databin runs out of contiguous bytes. Returns the number of layers
    /// whose bytes, headers and bodies both, are fully present from the
    /// start of the databin.
    pub fn parse_up_to(&mut self, max_layers: u32) -> Result<u32, JpipError> {
        let target = max_layers.min(self.declared_layers);
        while (self.packets.len() as u32) < target {
            match self.parse_next_packet()? {
                Some(_) => {}
                None => break,
            }
        }
        let prefix = self.databin.loaded_prefix_length();
        Ok(self
            .packets
            .iter()
            .take(target as usize)
            .take_while(|packet| packet.end_offset <= prefix)
            .count() as u32)
    }

    /// Byte length of the databin prefix covering the first `layers`
    /// packets; zero when no packet is covered.
    pub fn end_offset_of_last_full_packet(&self, layers: u32) -> u64 {
        self.packets
            .iter()
            .take(layers as usize)
            .last()
            .map_or(0, |packet| packet.end_offset)
    }

    /// Final number of missing most-significant bitplanes signalled for a
    /// codeblock, if it has been included so far.
    pub fn missing_bitplanes(&self, subband: usize, codeblock: usize) -> Option<u32> {
        let block = &self.subbands[subband].blocks[codeblock];
        block.included.then_some(block.missing_bitplanes)
    }

    /// Attempt to parse one more packet; `Ok(None)` leaves all state as it
    /// was, either because the databin ended or all layers are parsed.
    fn parse_next_packet(&mut self) -> Result<Option<ParsedPacket>, JpipError> {
        let layer = self.packets.len() as u32;
        if layer >= self.declared_layers {
            return Ok(None);
        }
        let snapshot = self.subbands.clone();
        self.reader.start_transaction();
        match self.try_parse_packet(layer) {
            Ok(Some(packet)) => {
                self.reader.commit()?;
                log::trace!(
                    "packet parsed: layer {layer}, header [{}, {}), body ends at {}",
                    packet.header_start,
                    packet.body_start,
                    packet.end_offset,
                );
                self.packets.push(packet.clone());
                Ok(Some(packet))
            }
            Ok(None) => {
                self.reader.abort()?;
                self.subbands = snapshot;
                Ok(None)
            }
            Err(err) => {
                self.reader.abort()?;
                self.subbands = snapshot;
                Err(err)
            }
        }
    }

    fn try_parse_packet(&mut self, layer: u32) -> Result<Option<ParsedPacket>, JpipError> {
        let mut header_start = self.reader.byte_offset()?;

        // An SOP segment may precede each packet when signalled in Scod.
        if self.sop_markers {
            match self.starts_with_marker(header_start, J2kMarkerCode::StartOfPacket) {
                None => return Ok(None),
                Some(true) => {
                    if !self
                        .databin
                        .is_range_available(header_start, SOP_SEGMENT_LENGTH)
                    {
                        return Ok(None);
                    }
                    header_start += SOP_SEGMENT_LENGTH;
                    self.reader.seek_to_byte(header_start);
                }
                Some(false) => {}
            }
        }

        let Some(nonzero) = self.reader.shift_bit()? else {
            return Ok(None);
        };

        let mut codeblocks = Vec::new();
        if nonzero == 1 {
            let Self {
                reader, subbands, ..
            } = self;
            for (subband_index, subband) in subbands.iter_mut().enumerate() {
                for y in 0..subband.num_y {
                    for x in 0..subband.num_x {
                        let index = y * subband.num_x + x;
                        let included = if subband.blocks[index].included {
                            match reader.shift_bit()? {
                                None => return Ok(None),
                                Some(bit) => bit == 1,
                            }
                        } else {
                            match subband.inclusion.decode_at_threshold(reader, x, y, layer + 1)? {
                                None => return Ok(None),
                                Some(included) => included,
                            }
                        };
                        if !included {
                            continue;
                        }

                        let missing_bitplanes = if subband.blocks[index].included {
                            None
                        } else {
                            match subband.zero_bitplanes.decode_value(reader, x, y)? {
                                None => return Ok(None),
                                Some(value) => {
                                    subband.blocks[index].missing_bitplanes = value;
                                    Some(value)
                                }
                            }
                        };
                        subband.blocks[index].included = true;

                        let Some(added_passes) = read_coding_passes(reader)? else {
                            return Ok(None);
                        };

                        // Lblock signalling, then the codeword segment
                        // length (B.10.7.1).
                        let Some(increase) = reader.count_ones_until_zero()? else {
                            return Ok(None);
                        };
                        let block = &mut subband.blocks[index];
                        block.lblock += increase;
                        let length_bits = block.lblock + added_passes.ilog2();
                        if length_bits > 32 {
                            return Err(JpipError::InvalidCodewordLength);
                        }
                        let Some(body_length) = reader.shift_bits(length_bits as u8)? else {
                            return Ok(None);
                        };
                        codeblocks.push(PacketCodeblock {
                            subband: subband_index,
                            codeblock: index,
                            added_passes,
                            body_offset: 0,
                            body_length: body_length as u64,
                            missing_bitplanes,
                        });
                    }
                }
            }
        }

        if self.reader.align()?.is_none() {
            return Ok(None);
        }
        let mut body_start = self.reader.byte_offset()?;
        if self.eph_markers {
            match self.starts_with_marker(body_start, J2kMarkerCode::EndOfPacketHeader) {
                None => return Ok(None),
                Some(false) => return Err(JpipError::EphMarkerNotFound),
                Some(true) => {
                    body_start += crate::marker::EPH_LENGTH;
                    self.reader.seek_to_byte(body_start);
                }
            }
        }

        let mut offset = body_start;
        for codeblock in &mut codeblocks {
            codeblock.body_offset = offset;
            offset += codeblock.body_length;
        }
        self.reader.seek_to_byte(offset);

        Ok(Some(ParsedPacket {
            layer,
            header_start,
            body_start,
            end_offset: offset,
            codeblocks,
        }))
    }

    /// `None` when the two bytes at `offset` are not loaded yet.
    fn starts_with_marker(&self, offset: u64, marker: J2kMarkerCode) -> Option<bool> {
        let first = self.databin.byte_at(offset)?;
        let second = self.databin.byte_at(offset + 1)?;
        Some(first == MARKER_START_BYTE && second == u8::from(marker))
    }
}

/// Number of coding passes, Table B.4. Every prefix decodes; the codeword
/// space signals 1 through 164 passes.
fn read_coding_passes(reader: &mut BitstreamReader) -> Result<Option<u32>, JpipError> {
    let Some(bit) = reader.shift_bit()? else {
        return Ok(None);
    };
    if bit == 0 {
        return Ok(Some(1));
    }
    let Some(bit) = reader.shift_bit()? else {
        return Ok(None);
    };
    if bit == 0 {
        return Ok(Some(2));
    }
    let Some(two) = reader.shift_bits(2)? else {
        return Ok(None);
    };
    if two < 3 {
        return Ok(Some(3 + two));
    }
    let Some(five) = reader.shift_bits(5)? else {
        return Ok(None);
    };
    if five < 31 {
        return Ok(Some(6 + five));
    }
    let Some(seven) = reader.shift_bits(7)? else {
        return Ok(None);
    };
    Ok(Some(37 + seven))
}

/// Shared parser cache keyed by precinct in-class index.
#[derive(Default)]
pub struct QualityLayerCache {
    parsers: Mutex<HashMap<u64, Arc<Mutex<QualityLayerParser>>>>,
}

impl QualityLayerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parser for one precinct, created on first use from the databin cache.
    pub fn parser(
        &self,
        structure: &CodestreamStructure,
        tile: &TileStructure,
        position: &PrecinctPosition,
        databins: &DatabinCache,
    ) -> Result<Arc<Mutex<QualityLayerParser>>, JpipError> {
        let in_class_index = position.in_class_index(structure, tile);
        let mut parsers = self
            .parsers
            .lock()
            .map_err(|_| JpipError::InternalInconsistency("quality layer cache lock poisoned"))?;
        if let Some(parser) = parsers.get(&in_class_index) {
            return Ok(Arc::clone(parser));
        }
        let databin = databins.precinct(in_class_index);
        let parser = Arc::new(Mutex::new(QualityLayerParser::new(tile, position, databin)?));
        parsers.insert(in_class_index, Arc::clone(&parser));
        Ok(parser)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codestream::test_support::{push_cod, push_qcd, push_siz};
    use crate::databin::{DatabinClass, DatabinId};

    /// Bit-level writer for building packet headers in tests, applying the
    /// B.10.1 stuffing rule.
    struct HeaderWriter {
        bytes: Vec<u8>,
        bit: u8,
        current: u8,
    }

    impl HeaderWriter {
        fn new() -> Self {
            Self {
                bytes: Vec::new(),
                bit: 0,
                current: 0,
            }
        }

        fn push_bit(&mut self, bit: u8) {
            if self.bit == 0 && self.bytes.last() == Some(&0xFF) {
                // Stuffed zero in the MSB after a 0xFF byte.
                self.bit = 1;
            }
            self.current |= bit << (7 - self.bit);
            self.bit += 1;
            if self.bit == 8 {
                self.bytes.push(self.current);
                self.current = 0;
                self.bit = 0;
            }
        }

        fn push_bits(&mut self, value: u32, count: u8) {
            for shift in (0..count).rev() {
                self.push_bit(((value >> shift) & 1) as u8);
            }
        }

        fn finish(mut self) -> Vec<u8> {
            if self.bit > 0 {
                self.bytes.push(self.current);
            }
            self.bytes
        }
    }

    fn structure_single_tile() -> CodestreamStructure {
        // 64x64 image in one tile, 1 component, RPCL, 3 layers, 1
        // decomposition level, 64x64 precincts, 16x16 codeblocks. The LL
        // band is 32x32, so its precinct holds a 2x2 codeblock grid.
        let mut bytes = vec![0xFF, 0x4F];
        push_siz(&mut bytes, (64, 64), (64, 64), 1);
        push_cod(&mut bytes, 2, 3, 1, (2, 2), &[(6, 6), (6, 6)]);
        push_qcd(&mut bytes, 1);
        CodestreamStructure::from_bytes(bytes).unwrap()
    }

    fn precinct_databin(bytes: &[u8]) -> Arc<Databin> {
        let databin = Arc::new(Databin::new(DatabinId {
            class: DatabinClass::Precinct,
            in_class_index: 0,
        }));
        databin.insert_range(0, bytes).unwrap();
        databin
    }

    fn resolution_zero_position() -> PrecinctPosition {
        PrecinctPosition {
            tile_index: 0,
            component: 0,
            resolution: 0,
            precinct_x: 0,
            precinct_y: 0,
        }
    }

    /// One packet at layer 0 for the 2x2 LL codeblock grid of the test
    /// structure: only codeblock (0,0) included, 1 coding pass, 4 body
    /// bytes.
    fn single_inclusion_packet() -> Vec<u8> {
        let mut writer = HeaderWriter::new();
        writer.push_bit(1); // non-empty packet
        // Inclusion tag tree for (0,0) at threshold 1: root value 0 ("1"),
        // leaf value 0 ("1").
        writer.push_bits(0b11, 2);
        // Zero bitplanes for (0,0): root 0, leaf 0.
        writer.push_bits(0b11, 2);
        writer.push_bit(0); // 1 coding pass
        writer.push_bit(0); // Lblock unchanged
        writer.push_bits(4, 3); // segment length, 3 bits
        // Remaining codeblocks (0,1), (1,0), (1,1): not included at layer 0.
        // Each reads one inclusion tag-tree bit off the shared root.
        writer.push_bit(0);
        writer.push_bit(0);
        writer.push_bit(0);
        let mut bytes = writer.finish();
        bytes.extend_from_slice(&[0xA0, 0xA1, 0xA2, 0xA3]);
        bytes
    }

    #[test]
    fn test_parse_single_packet() {
        let structure = structure_single_tile();
        let tile = structure.default_tile_structure(0);
        let parser_databin = precinct_databin(&single_inclusion_packet());
        let mut parser =
            QualityLayerParser::new(&tile, &resolution_zero_position(), parser_databin).unwrap();

        assert_eq!(parser.parse_up_to(3).unwrap(), 1);
        let packet = &parser.packets()[0];
        assert_eq!(packet.layer, 0);
        assert_eq!(packet.header_start, 0);
        assert_eq!(packet.codeblocks.len(), 1);
        let codeblock = &packet.codeblocks[0];
        assert_eq!(codeblock.codeblock, 0);
        assert_eq!(codeblock.added_passes, 1);
        assert_eq!(codeblock.body_length, 4);
        assert_eq!(codeblock.body_offset, packet.body_start);
        assert_eq!(codeblock.missing_bitplanes, Some(0));
        assert_eq!(packet.end_offset, packet.body_start + 4);
        assert_eq!(parser.end_offset_of_last_full_packet(1), packet.end_offset);
    }

    #[test]
    fn test_incomplete_header_rolls_back_and_resumes() {
        let structure = structure_single_tile();
        let tile = structure.default_tile_structure(0);
        let bytes = single_inclusion_packet();

        let databin = Arc::new(Databin::new(DatabinId {
            class: DatabinClass::Precinct,
            in_class_index: 0,
        }));
        // Only the first header byte at first.
        databin.insert_range(0, &bytes[..1]).unwrap();
        let mut parser =
            QualityLayerParser::new(&tile, &resolution_zero_position(), Arc::clone(&databin))
                .unwrap();
        assert_eq!(parser.parse_up_to(3).unwrap(), 0);

        // Delivering the rest makes the same parser succeed.
        databin.insert_range(1, &bytes[1..]).unwrap();
        assert_eq!(parser.parse_up_to(3).unwrap(), 1);
    }

    #[test]
    fn test_header_without_body_is_not_reached() {
        let structure = structure_single_tile();
        let tile = structure.default_tile_structure(0);
        let bytes = single_inclusion_packet();
        let header_length = bytes.len() - 4;

        let databin = Arc::new(Databin::new(DatabinId {
            class: DatabinClass::Precinct,
            in_class_index: 0,
        }));
        // Header plus two of the four body bytes.
        databin
            .insert_range(0, &bytes[..header_length + 2])
            .unwrap();
        let mut parser =
            QualityLayerParser::new(&tile, &resolution_zero_position(), Arc::clone(&databin))
                .unwrap();
        // The header parses, but the layer only counts once its body is
        // fully present.
        assert_eq!(parser.parse_up_to(3).unwrap(), 0);
        databin
            .insert_range(header_length as u64 + 2, &bytes[header_length + 2..])
            .unwrap();
        assert_eq!(parser.parse_up_to(3).unwrap(), 1);
    }

    #[test]
    fn test_empty_packet() {
        let structure = structure_single_tile();
        let tile = structure.default_tile_structure(0);
        // Zero-length bit 0, alignment pads the byte.
        let databin = precinct_databin(&[0x00]);
        let mut parser =
            QualityLayerParser::new(&tile, &resolution_zero_position(), databin).unwrap();
        assert_eq!(parser.parse_up_to(1).unwrap(), 1);
        let packet = &parser.packets()[0];
        assert!(packet.codeblocks.is_empty());
        assert_eq!(packet.end_offset, 1);
    }

    #[test]
    fn test_multiple_codeword_segments_unsupported() {
        let structure = structure_single_tile();
        let tile = structure.default_tile_structure(0);
        let mut modified = (*tile).clone();
        modified.coding.codeblock_style = 0x04;
        let result = QualityLayerParser::new(
            &modified,
            &resolution_zero_position(),
            precinct_databin(&[]),
        );
        assert!(matches!(result.err(), Some(JpipError::UnsupportedFeature(_))));
    }

    #[test]
    fn test_incremental_parse_matches_bulk() {
        let structure = structure_single_tile();
        let tile = structure.default_tile_structure(0);
        // Layer 0 with an included codeblock, layers 1 and 2 empty.
        let mut bytes = single_inclusion_packet();
        bytes.extend_from_slice(&[0x00, 0x00]);

        let mut bulk =
            QualityLayerParser::new(&tile, &resolution_zero_position(), precinct_databin(&bytes))
                .unwrap();
        assert_eq!(bulk.parse_up_to(3).unwrap(), 3);

        // Advancing the target one layer at a time must leave the cached
        // packet sequence byte-identical to the single bulk parse.
        let mut incremental =
            QualityLayerParser::new(&tile, &resolution_zero_position(), precinct_databin(&bytes))
                .unwrap();
        for target in 1..=3u32 {
            assert_eq!(incremental.parse_up_to(target).unwrap(), target);
        }
        assert_eq!(incremental.packets(), bulk.packets());
    }

    #[test]
    fn test_parse_is_clamped_to_declared_layers() {
        let structure = structure_single_tile();
        let tile = structure.default_tile_structure(0);
        // Three declared layers, all empty packets, plus trailing garbage
        // that must never be touched.
        let databin = precinct_databin(&[0x00, 0x00, 0x00, 0xFF]);
        let mut parser =
            QualityLayerParser::new(&tile, &resolution_zero_position(), databin).unwrap();
        assert_eq!(parser.parse_up_to(u32::MAX).unwrap(), 3);
        assert_eq!(parser.packets().len(), 3);
        assert_eq!(parser.end_offset_of_last_full_packet(3), 3);
    }
}
