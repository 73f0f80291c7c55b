//! Codestream reconstruction: assemble a standalone JPEG 2000 codestream
//! for a region and quality from whatever the databin cache holds.
//!
//! The emitted codestream re-anchors the image area and tile grid to the
//! requested region at the requested resolution cut, patches the header
//! segments accordingly, renumbers the covered tiles contiguously, and
//! pads every precinct whose data stops early with empty packets so the
//! declared layer count always holds. Because Psot precedes the data it
//! covers, emission runs twice over a fixed plan: a counting pass sizing
//! each tile-part, then a buffer pass writing the bytes, verified against
//! each other.

use crate::cache::DatabinCache;
use crate::codestream::{parse_tile_header, CodestreamStructure, ProgressionOrder, SegmentSpan};
use crate::databin::{Databin, DatabinClass};
use crate::error::JpipError;
use crate::marker::J2kMarkerCode;
use crate::quality_layers::QualityLayerCache;
use crate::region::{precincts_in_part, tiles_in_part, CodestreamPartParams, PrecinctIterator};
use crate::sink::{BufferSink, CountingSink, Sink};
use std::sync::Arc;

const COMMENT_TEXT: &[u8] = b"jpipexp reconstructed codestream";

/// Patched SIZ geometry, in cut-level reference grid units.
#[derive(Debug, Clone, Copy)]
struct SizPatch {
    xsiz: u32,
    ysiz: u32,
    xosiz: u32,
    yosiz: u32,
    xtsiz: u32,
    ytsiz: u32,
    xtosiz: u32,
    ytosiz: u32,
}

struct PrecinctPlan {
    /// `None` for precincts outside the part: all layers are padded.
    databin: Option<Arc<Databin>>,
    copy_length: u64,
    synth_empty: u32,
}

struct TilePlan {
    header_bytes: Vec<u8>,
    header_segments: Vec<SegmentSpan>,
    eph_markers: bool,
    precincts: Vec<PrecinctPlan>,
}

struct ReconstructionPlan {
    levels_to_cut: u8,
    order: ProgressionOrder,
    siz: SizPatch,
    tiles: Vec<TilePlan>,
}

/// Assembles codestreams from a databin cache.
pub struct Reconstructor<'a> {
    structure: &'a CodestreamStructure,
    databins: &'a DatabinCache,
    quality: &'a QualityLayerCache,
}

impl<'a> Reconstructor<'a> {
    pub fn new(
        structure: &'a CodestreamStructure,
        databins: &'a DatabinCache,
        quality: &'a QualityLayerCache,
    ) -> Self {
        Self {
            structure,
            databins,
            quality,
        }
    }

    /// Build the codestream for a part. `Ok(None)` while a tile header the
    /// part needs is still partial; precincts below the part's minimum
    /// quality are an error, precincts beyond it are padded with empty
    /// packets.
    pub fn reconstruct(
        &self,
        params: &CodestreamPartParams,
        order: ProgressionOrder,
    ) -> Result<Option<Vec<u8>>, JpipError> {
        let Some(plan) = self.build_plan(params, order)? else {
            return Ok(None);
        };
        let mut counting = CountingSink::new();
        let lengths = emit_codestream(self.structure, &plan, &mut counting, None)?;
        let mut buffer = BufferSink::new();
        emit_codestream(self.structure, &plan, &mut buffer, Some(&lengths))?;
        log::debug!(
            "reconstructed {} tiles, {} bytes",
            plan.tiles.len(),
            buffer.position(),
        );
        Ok(Some(buffer.into_bytes()))
    }

    fn build_plan(
        &self,
        params: &CodestreamPartParams,
        order: ProgressionOrder,
    ) -> Result<Option<ReconstructionPlan>, JpipError> {
        params.validate(self.structure)?;
        if !order.is_layer_innermost() {
            return Err(JpipError::InvalidArgument(
                "reconstruction requires a layer-innermost progression order",
            ));
        }
        // JPT-stream sessions deliver whole-tile bins; only JPP (precinct)
        // delivery can be reassembled here.
        if self.databins.contains_class(DatabinClass::Tile) {
            return Err(JpipError::UnsupportedFeature(
                "reconstruction from tile (JPT-stream) databins",
            ));
        }
        let siz = self.patch_geometry(params)?;

        let tiles = tiles_in_part(self.structure, params);
        if tiles.count() > u64::from(u16::MAX) {
            return Err(JpipError::InvalidArgument(
                "part covers more tiles than a codestream can index",
            ));
        }
        let tiles_per_row = self.structure.size().num_tiles_x();
        let mut tile_plans = Vec::new();
        for tile_index in tiles.iter(tiles_per_row) {
            match self.build_tile_plan(params, order, tile_index)? {
                Some(plan) => tile_plans.push(plan),
                None => return Ok(None),
            }
        }
        Ok(Some(ReconstructionPlan {
            levels_to_cut: params.levels_to_cut,
            order,
            siz,
            tiles: tile_plans,
        }))
    }

    fn build_tile_plan(
        &self,
        params: &CodestreamPartParams,
        order: ProgressionOrder,
        tile_index: u64,
    ) -> Result<Option<TilePlan>, JpipError> {
        let header = self.databins.tile_header(tile_index);
        let Some(tile) = self.structure.tile_structure(tile_index, &header)? else {
            return Ok(None);
        };
        let Some(header_bytes) = header.copy_all() else {
            return Ok(None);
        };
        let info = parse_tile_header(&header_bytes)?;

        let declared = u32::from(tile.num_quality_layers());
        let max_target = params.max_num_quality_layers.resolve(declared);
        let min_target = params.min_num_quality_layers.resolve(declared);

        let ranges = precincts_in_part(self.structure, &tile, tile_index, params);
        let iter = PrecinctIterator::new(
            Arc::clone(&tile),
            tile_index,
            order,
            params.levels_to_cut,
            Some(ranges),
            true,
        )?;
        let mut precincts = Vec::new();
        for step in iter {
            if !step.in_part {
                precincts.push(PrecinctPlan {
                    databin: None,
                    copy_length: 0,
                    synth_empty: declared,
                });
                continue;
            }
            let in_class_index = step.position.in_class_index(self.structure, &tile);
            let parser =
                self.quality
                    .parser(self.structure, &tile, &step.position, self.databins)?;
            let mut parser = parser.lock().map_err(|_| {
                JpipError::InternalInconsistency("quality layer parser lock poisoned")
            })?;
            let reached = parser.parse_up_to(max_target)?;
            if reached < min_target {
                return Err(JpipError::MinimumQualityNotReached);
            }
            precincts.push(PrecinctPlan {
                databin: Some(self.databins.precinct(in_class_index)),
                copy_length: parser.end_offset_of_last_full_packet(reached),
                synth_empty: declared - reached,
            });
        }
        Ok(Some(TilePlan {
            header_bytes,
            header_segments: info.segments,
            eph_markers: tile.coding.eph_markers,
            precincts,
        }))
    }

    /// New SIZ geometry: the image area becomes the requested region and
    /// the tile grid is re-anchored so the part's first tile is tile zero.
    fn patch_geometry(&self, params: &CodestreamPartParams) -> Result<SizPatch, JpipError> {
        let size = self.structure.size();
        let cut = params.levels_to_cut;
        let scale = 1u64 << cut;
        if cut > 0 {
            let aligned = [
                size.tile_width,
                size.tile_height,
                size.tile_offset_x,
                size.tile_offset_y,
            ]
            .iter()
            .all(|value| value % scale == 0);
            if !aligned {
                return Err(JpipError::UnsupportedFeature(
                    "tile grid not aligned to the requested resolution scale",
                ));
            }
        }
        let tiles = tiles_in_part(self.structure, params);
        let grid_x = size.tile_offset_x + tiles.min_tile_x * size.tile_width;
        let grid_y = size.tile_offset_y + tiles.min_tile_y * size.tile_height;
        let offset_x = size.image_offset_x.div_ceil(scale);
        let offset_y = size.image_offset_y.div_ceil(scale);
        Ok(SizPatch {
            xsiz: (offset_x + params.max_x_exclusive) as u32,
            ysiz: (offset_y + params.max_y_exclusive) as u32,
            xosiz: (offset_x + params.min_x) as u32,
            yosiz: (offset_y + params.min_y) as u32,
            xtsiz: (size.tile_width / scale) as u32,
            ytsiz: (size.tile_height / scale) as u32,
            xtosiz: (grid_x / scale) as u32,
            ytosiz: (grid_y / scale) as u32,
        })
    }
}

fn emit_codestream<S: Sink>(
    structure: &CodestreamStructure,
    plan: &ReconstructionPlan,
    sink: &mut S,
    expected_lengths: Option<&[u64]>,
) -> Result<Vec<u64>, JpipError> {
    let bytes = structure.main_header_bytes();
    for segment in structure.main_header_segments() {
        let segment_bytes = &bytes[segment.offset..segment.offset + segment.length];
        emit_segment(sink, segment, segment_bytes, plan, false)?;
    }
    emit_com(sink);

    let mut lengths = Vec::with_capacity(plan.tiles.len());
    for (new_index, tile) in plan.tiles.iter().enumerate() {
        let start = sink.position();
        let psot = expected_lengths.map_or(0, |lengths| lengths[new_index]);
        let psot = u32::try_from(psot).map_err(|_| {
            JpipError::UnsupportedFeature("tile-part larger than a Psot field can express")
        })?;
        sink.write(&[0xFF, 0x90]); // SOT
        sink.write_u16(10);
        sink.write_u16(new_index as u16);
        sink.write_u32(psot);
        sink.write_u8(0); // TPsot
        sink.write_u8(1); // TNsot

        for segment in &tile.header_segments {
            let segment_bytes = &tile.header_bytes[segment.offset..segment.offset + segment.length];
            emit_segment(sink, segment, segment_bytes, plan, true)?;
        }
        sink.write(&[0xFF, 0x93]); // SOD

        for precinct in &tile.precincts {
            if precinct.copy_length > 0 {
                let databin = precinct.databin.as_ref().ok_or(
                    JpipError::InternalInconsistency("planned copy from an out-of-part precinct"),
                )?;
                let data = databin
                    .copy_out(0, precinct.copy_length)
                    .ok_or(JpipError::InternalInconsistency(
                        "planned precinct bytes are not in the cache",
                    ))?;
                sink.write(&data);
            }
            for _ in 0..precinct.synth_empty {
                // Empty packet: a single zero-length bit, byte-aligned. No
                // SOP is synthesized; EPH follows when the tile uses it.
                sink.write_u8(0x00);
                if tile.eph_markers {
                    sink.write(&[0xFF, 0x92]);
                }
            }
        }

        let length = sink.position() - start;
        if let Some(expected) = expected_lengths
            && expected[new_index] != length
        {
            return Err(JpipError::InternalInconsistency(
                "tile-part length diverged between emission passes",
            ));
        }
        lengths.push(length);
    }

    sink.write(&[0xFF, 0xD9]); // EOC
    Ok(lengths)
}

fn emit_segment<S: Sink>(
    sink: &mut S,
    segment: &SegmentSpan,
    bytes: &[u8],
    plan: &ReconstructionPlan,
    in_tile_header: bool,
) -> Result<(), JpipError> {
    match segment.marker {
        J2kMarkerCode::ImageAndTileSize => {
            emit_patched_siz(sink, bytes, &plan.siz);
        }
        J2kMarkerCode::CodingStyleDefault => {
            emit_patched_cod(sink, bytes, plan.levels_to_cut, plan.order);
        }
        J2kMarkerCode::QuantizationDefault => {
            emit_patched_qcd(sink, bytes, plan.levels_to_cut);
        }
        J2kMarkerCode::QuantizationComponent if plan.levels_to_cut > 0 => {
            return Err(JpipError::UnsupportedFeature(
                "per-component quantization (QCC) with a resolution cut",
            ));
        }
        // Pointer segments describe the original layout, not ours.
        J2kMarkerCode::TilePartLengths
        | J2kMarkerCode::PacketLengthMain
        | J2kMarkerCode::PacketLengthTile => {}
        // The tile emitter writes its own SOD after the segments.
        J2kMarkerCode::StartOfData if in_tile_header => {}
        _ => sink.write(bytes),
    }
    Ok(())
}

fn emit_patched_siz<S: Sink>(sink: &mut S, bytes: &[u8], siz: &SizPatch) {
    debug_assert!(bytes.len() >= 40);
    sink.write(&bytes[..6]); // marker, Lsiz, Rsiz
    sink.write_u32(siz.xsiz);
    sink.write_u32(siz.ysiz);
    sink.write_u32(siz.xosiz);
    sink.write_u32(siz.yosiz);
    sink.write_u32(siz.xtsiz);
    sink.write_u32(siz.ytsiz);
    sink.write_u32(siz.xtosiz);
    sink.write_u32(siz.ytosiz);
    sink.write(&bytes[38..]); // Csiz and component parameters
}

fn emit_patched_cod<S: Sink>(sink: &mut S, bytes: &[u8], cut: u8, order: ProgressionOrder) {
    debug_assert!(bytes.len() >= 14);
    let scod = bytes[4];
    let dropped = if scod & 0x01 != 0 { cut as usize } else { 0 };
    sink.write(&bytes[..2]);
    sink.write_u16((bytes.len() - 2 - dropped) as u16);
    sink.write_u8(scod);
    sink.write_u8(order as u8);
    sink.write(&bytes[6..9]); // layers, MCT
    sink.write_u8(bytes[9] - cut); // decomposition levels
    sink.write(&bytes[10..bytes.len() - dropped]);
}

fn emit_patched_qcd<S: Sink>(sink: &mut S, bytes: &[u8], cut: u8) {
    debug_assert!(bytes.len() >= 5);
    let sqcd = bytes[4];
    // Entry width by quantization style; scalar-derived signals a single
    // entry that survives any cut.
    let entry_width = match sqcd & 0x1F {
        0 => 1,
        1 => 0,
        _ => 2,
    };
    let dropped = entry_width * 3 * cut as usize;
    sink.write(&bytes[..2]);
    sink.write_u16((bytes.len() - 2 - dropped) as u16);
    sink.write(&bytes[4..bytes.len() - dropped]);
}

fn emit_com<S: Sink>(sink: &mut S) {
    sink.write(&[0xFF, 0x64]);
    sink.write_u16((4 + COMMENT_TEXT.len()) as u16);
    sink.write_u16(1); // Rcom: Latin text
    sink.write(COMMENT_TEXT);
}
