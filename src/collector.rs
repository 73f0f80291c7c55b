//! Header-free packet collection: per-codeblock byte ranges and metadata
//! for consumers that decode codeblocks directly instead of feeding a full
//! codestream to an external decoder.
//!
//! Each codeblock's contributions are scattered across the quality-layer
//! packets of its precinct; collection concatenates them into one
//! consolidated buffer so every codeblock ends up as a single contiguous
//! range, skipping all marker and header synthesis.

use crate::cache::DatabinCache;
use crate::codestream::{CodestreamStructure, TileStructure};
use crate::composite::CompositeArray;
use crate::error::JpipError;
use crate::quality_layers::QualityLayerCache;
use crate::region::{
    precincts_in_part, tiles_in_part, CodestreamPartParams, PrecinctIterator, PrecinctPosition,
};
use std::sync::Arc;

/// Where a precinct's samples sit, in the pixel grid of its resolution
/// level relative to the tile origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelPlacement {
    pub min_x: u64,
    pub min_y: u64,
    pub max_x_exclusive: u64,
    pub max_y_exclusive: u64,
}

/// One codeblock's consolidated data and decode parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectedCodeblock {
    /// Subband slot in packet order: LL at resolution zero, else HL, LH, HH.
    pub subband: usize,
    /// Raster index within the subband's codeblock grid.
    pub codeblock: usize,
    /// Range within the consolidated buffer.
    pub offset: u64,
    pub length: u64,
    /// Total coding passes across the collected layers.
    pub coding_passes: u32,
    /// Missing most-significant bitplanes, signalled on first inclusion.
    pub zero_bit_planes: u32,
}

/// All collected data for one precinct.
#[derive(Debug, Clone)]
pub struct CollectedPrecinct {
    pub position: PrecinctPosition,
    pub placement: PixelPlacement,
    /// Quality layers whose packets contributed.
    pub layers_collected: u32,
    /// Codeblocks included in at least one collected packet, in subband
    /// then raster order.
    pub codeblocks: Vec<CollectedCodeblock>,
}

/// Pixel registration of the collected tiles against the requested region,
/// at the part's cut resolution: rendering the collected tiles at
/// `(x_in_original_request, y_in_original_request)` within a target of the
/// request's dimensions places the requested pixels correctly. The offsets
/// are non-positive, since the covered tiles start at or before the
/// request's origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestPlacement {
    pub x_in_original_request: i64,
    pub y_in_original_request: i64,
    pub original_request_width: u64,
    pub original_request_height: u64,
}

/// The outcome of a collection pass over a part.
#[derive(Debug)]
pub struct CollectedPart {
    /// Main header bytes, for consumers that need the coding parameters.
    pub header_bytes: Vec<u8>,
    pub placement: RequestPlacement,
    pub data: CompositeArray,
    pub precincts: Vec<CollectedPrecinct>,
}

/// Extracts codeblock payloads for a part straight from the databin cache.
pub struct PacketCollector<'a> {
    structure: &'a CodestreamStructure,
    databins: &'a DatabinCache,
    quality: &'a QualityLayerCache,
}

impl<'a> PacketCollector<'a> {
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

    /// Collect every in-part precinct's codeblock data up to the part's
    /// maximum quality. `Ok(None)` while a tile header the part needs is
    /// still partial; a precinct below the part's minimum quality is a
    /// definitive failure.
    pub fn collect(
        &self,
        params: &CodestreamPartParams,
    ) -> Result<Option<CollectedPart>, JpipError> {
        params.validate(self.structure)?;
        let mut data = CompositeArray::new();
        let mut precincts = Vec::new();

        let tiles = tiles_in_part(self.structure, params);
        for tile_index in tiles.iter(self.structure.size().num_tiles_x()) {
            let header = self.databins.tile_header(tile_index);
            let Some(tile) = self.structure.tile_structure(tile_index, &header)? else {
                return Ok(None);
            };
            let declared = u32::from(tile.num_quality_layers());
            let max_target = params.max_num_quality_layers.resolve(declared);
            let min_target = params.min_num_quality_layers.resolve(declared);

            let ranges = precincts_in_part(self.structure, &tile, tile_index, params);
            let iter = PrecinctIterator::new(
                Arc::clone(&tile),
                tile_index,
                tile.coding.progression_order,
                params.levels_to_cut,
                Some(ranges),
                false,
            )?;
            for step in iter {
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
                let in_class_index = step.position.in_class_index(self.structure, &tile);
                let databin = self.databins.precinct(in_class_index);

                // Bucket contributions per codeblock so each codeblock's
                // layers land contiguously in the consolidated buffer.
                let grids = tile.codeblock_grids(
                    step.position.component,
                    step.position.resolution,
                    step.position.precinct_x,
                    step.position.precinct_y,
                );
                let mut codeblocks = Vec::new();
                for (subband, grid) in grids.iter().enumerate() {
                    for codeblock in 0..(grid.num_x * grid.num_y) as usize {
                        let mut collected: Option<CollectedCodeblock> = None;
                        for packet in parser.packets().iter().take(reached as usize) {
                            for piece in packet
                                .codeblocks
                                .iter()
                                .filter(|p| p.subband == subband && p.codeblock == codeblock)
                            {
                                let bytes = databin
                                    .copy_out(piece.body_offset, piece.body_length)
                                    .ok_or(JpipError::InternalInconsistency(
                                        "parsed packet body is not in the cache",
                                    ))?;
                                let offset = data.push_chunk(bytes);
                                let entry = collected.get_or_insert(CollectedCodeblock {
                                    subband,
                                    codeblock,
                                    offset,
                                    length: 0,
                                    coding_passes: 0,
                                    zero_bit_planes: piece.missing_bitplanes.unwrap_or(0),
                                });
                                entry.length += piece.body_length;
                                entry.coding_passes += piece.added_passes;
                            }
                        }
                        if let Some(entry) = collected {
                            codeblocks.push(entry);
                        }
                    }
                }
                precincts.push(CollectedPrecinct {
                    position: step.position,
                    placement: placement_of(&tile, &step.position),
                    layers_collected: reached,
                    codeblocks,
                });
            }
        }
        Ok(Some(CollectedPart {
            header_bytes: self.structure.main_header_bytes().to_vec(),
            placement: request_placement(self.structure, params),
            data,
            precincts,
        }))
    }
}

fn request_placement(
    structure: &CodestreamStructure,
    params: &CodestreamPartParams,
) -> RequestPlacement {
    let size = structure.size();
    let scale = 1u64 << params.levels_to_cut;
    let tiles = tiles_in_part(structure, params);
    // Pixel origin of the first covered tile, clamped to the image area,
    // then scaled down and re-expressed relative to the image offset the
    // way the part coordinates are.
    let grid_x =
        (size.tile_offset_x + tiles.min_tile_x * size.tile_width).max(size.image_offset_x);
    let grid_y =
        (size.tile_offset_y + tiles.min_tile_y * size.tile_height).max(size.image_offset_y);
    let aligned_x = grid_x.div_ceil(scale) - size.image_offset_x.div_ceil(scale);
    let aligned_y = grid_y.div_ceil(scale) - size.image_offset_y.div_ceil(scale);
    RequestPlacement {
        x_in_original_request: aligned_x as i64 - params.min_x as i64,
        y_in_original_request: aligned_y as i64 - params.min_y as i64,
        original_request_width: params.max_x_exclusive - params.min_x,
        original_request_height: params.max_y_exclusive - params.min_y,
    }
}

fn placement_of(tile: &TileStructure, position: &PrecinctPosition) -> PixelPlacement {
    let res = &tile.components[position.component].resolutions[position.resolution as usize];
    let width = 1u64 << res.precinct_width_exp.min(62);
    let height = 1u64 << res.precinct_height_exp.min(62);
    PixelPlacement {
        min_x: (position.precinct_x * width).min(res.width),
        min_y: (position.precinct_y * height).min(res.height),
        max_x_exclusive: ((position.precinct_x + 1) * width).min(res.width),
        max_y_exclusive: ((position.precinct_y + 1) * height).min(res.height),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MessageHeader;
    use crate::codestream::test_support::{push_cod, push_qcd, push_siz};
    use crate::databin::DatabinClass;
    use crate::region::QualityLimit;

    fn main_header_bytes() -> Vec<u8> {
        // 64x64 single tile, RPCL, 2 layers, 1 decomposition level.
        let mut bytes = vec![0xFF, 0x4F];
        push_siz(&mut bytes, (64, 64), (64, 64), 1);
        push_cod(&mut bytes, 2, 2, 1, (4, 4), &[(6, 6), (6, 6)]);
        push_qcd(&mut bytes, 1);
        bytes
    }

    fn push_message(cache: &DatabinCache, class: DatabinClass, index: u64, bytes: &[u8]) {
        cache
            .push_message(
                MessageHeader {
                    class,
                    in_class_index: index,
                    body_start: 0,
                    body_length: bytes.len() as u64,
                    is_last_byte_in_databin: true,
                },
                bytes,
            )
            .unwrap();
    }

    fn full_part() -> CodestreamPartParams {
        CodestreamPartParams {
            min_x: 0,
            min_y: 0,
            max_x_exclusive: 64,
            max_y_exclusive: 64,
            levels_to_cut: 0,
            min_num_quality_layers: QualityLimit::Limited(1),
            max_num_quality_layers: QualityLimit::Max,
        }
    }

    #[test]
    fn test_collects_codeblock_ranges_and_metadata() {
        let cache = DatabinCache::new();
        push_message(&cache, DatabinClass::MainHeader, 0, &main_header_bytes());
        push_message(&cache, DatabinClass::TileHeader, 0, &[]);
        // LL precinct: layer 0 includes the single codeblock with one pass
        // and a 2-byte body, layer 1 empty. Resolution 1: two empty layers.
        push_message(&cache, DatabinClass::Precinct, 0, &[0xE2, 0xB0, 0xB1, 0x00]);
        push_message(&cache, DatabinClass::Precinct, 1, &[0x00, 0x00]);
        let structure = CodestreamStructure::from_main_header(&cache.main_header())
            .unwrap()
            .unwrap();
        let quality = QualityLayerCache::new();
        let collector = PacketCollector::new(&structure, &cache, &quality);

        let part = collector.collect(&full_part()).unwrap().unwrap();
        assert_eq!(part.header_bytes, main_header_bytes());
        assert_eq!(
            part.placement,
            RequestPlacement {
                x_in_original_request: 0,
                y_in_original_request: 0,
                original_request_width: 64,
                original_request_height: 64,
            }
        );
        assert_eq!(part.precincts.len(), 2);

        let ll = &part.precincts[0];
        assert_eq!(ll.position.resolution, 0);
        assert_eq!(ll.layers_collected, 2);
        assert_eq!(
            ll.placement,
            PixelPlacement {
                min_x: 0,
                min_y: 0,
                max_x_exclusive: 32,
                max_y_exclusive: 32,
            }
        );
        assert_eq!(
            ll.codeblocks,
            vec![CollectedCodeblock {
                subband: 0,
                codeblock: 0,
                offset: 0,
                length: 2,
                coding_passes: 1,
                zero_bit_planes: 0,
            }]
        );
        assert_eq!(part.data.copy_range(0, 2), [0xB0, 0xB1]);

        // Resolution 1 carried only empty packets.
        assert_eq!(part.precincts[1].position.resolution, 1);
        assert!(part.precincts[1].codeblocks.is_empty());
        assert_eq!(part.data.len(), 2);
    }

    #[test]
    fn test_placement_reports_tile_overhang() {
        let cache = DatabinCache::new();
        push_message(&cache, DatabinClass::MainHeader, 0, &main_header_bytes());
        push_message(&cache, DatabinClass::TileHeader, 0, &[]);
        push_message(&cache, DatabinClass::Precinct, 0, &[0xE2, 0xB0, 0xB1, 0x00]);
        push_message(&cache, DatabinClass::Precinct, 1, &[0x00, 0x00]);
        let structure = CodestreamStructure::from_main_header(&cache.main_header())
            .unwrap()
            .unwrap();
        let quality = QualityLayerCache::new();
        let collector = PacketCollector::new(&structure, &cache, &quality);

        // The request covers the tile's lower-right corner; the collected
        // tile starts 40 pixels up and to the left of it.
        let mut params = full_part();
        params.min_x = 40;
        params.min_y = 40;
        let part = collector.collect(&params).unwrap().unwrap();
        assert_eq!(
            part.placement,
            RequestPlacement {
                x_in_original_request: -40,
                y_in_original_request: -40,
                original_request_width: 24,
                original_request_height: 24,
            }
        );
    }

    #[test]
    fn test_minimum_quality_is_definitive() {
        let cache = DatabinCache::new();
        push_message(&cache, DatabinClass::MainHeader, 0, &main_header_bytes());
        push_message(&cache, DatabinClass::TileHeader, 0, &[]);
        let structure = CodestreamStructure::from_main_header(&cache.main_header())
            .unwrap()
            .unwrap();
        let quality = QualityLayerCache::new();
        let collector = PacketCollector::new(&structure, &cache, &quality);
        assert_eq!(
            collector.collect(&full_part()).unwrap_err(),
            JpipError::MinimumQualityNotReached
        );
    }

    #[test]
    fn test_missing_tile_header_yields_none() {
        let cache = DatabinCache::new();
        push_message(&cache, DatabinClass::MainHeader, 0, &main_header_bytes());
        let structure = CodestreamStructure::from_main_header(&cache.main_header())
            .unwrap()
            .unwrap();
        let quality = QualityLayerCache::new();
        let collector = PacketCollector::new(&structure, &cache, &quality);
        assert!(collector.collect(&full_part()).unwrap().is_none());
    }
}
