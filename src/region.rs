//! Region-to-structure mapping: which tiles and precincts a pixel
//! rectangle covers, and in what order the precincts are sequenced.

use crate::codestream::{
    CodestreamStructure, PrecinctMember, ProgressionOrder, TileStructure,
};
use crate::error::JpipError;
use std::sync::Arc;

/// Guard band, in resolution pixels on each side, admitting the wavelet
/// synthesis support of neighboring precincts.
const WAVELET_SUPPORT_GUARD: u64 = 4;

/// A quality-layer bound: a concrete count or the tile's declared maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityLimit {
    Limited(u32),
    Max,
}

impl QualityLimit {
    /// Resolve against a tile's declared layer count.
    pub fn resolve(self, declared_layers: u32) -> u32 {
        match self {
            Self::Limited(n) => n.min(declared_layers),
            Self::Max => declared_layers,
        }
    }
}

/// A requested codestream part: pixel rectangle at a resolution cut, plus
/// quality bounds. Pixel coordinates are relative to the image origin at
/// the cut level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodestreamPartParams {
    pub min_x: u64,
    pub min_y: u64,
    pub max_x_exclusive: u64,
    pub max_y_exclusive: u64,
    pub levels_to_cut: u8,
    pub min_num_quality_layers: QualityLimit,
    pub max_num_quality_layers: QualityLimit,
}

impl CodestreamPartParams {
    /// Argument validation; performed before any parsing is attempted.
    pub fn validate(&self, structure: &CodestreamStructure) -> Result<(), JpipError> {
        if self.min_x >= self.max_x_exclusive || self.min_y >= self.max_y_exclusive {
            return Err(JpipError::RegionOutOfBounds);
        }
        structure.validate_levels_to_cut(self.levels_to_cut)?;
        let scale = 1u64 << self.levels_to_cut;
        let level_width = structure.size().image_width().div_ceil(scale);
        let level_height = structure.size().image_height().div_ceil(scale);
        if self.max_x_exclusive > level_width || self.max_y_exclusive > level_height {
            return Err(JpipError::RegionOutOfBounds);
        }
        if let (QualityLimit::Limited(min), QualityLimit::Limited(max)) =
            (self.min_num_quality_layers, self.max_num_quality_layers)
            && min > max
        {
            return Err(JpipError::InvalidArgument(
                "minimum quality layer count exceeds the maximum",
            ));
        }
        Ok(())
    }

    /// Absolute reference-grid rectangle of the request.
    fn reference_rect(&self, structure: &CodestreamStructure) -> (u64, u64, u64, u64) {
        let size = structure.size();
        let scale = self.levels_to_cut;
        (
            size.image_offset_x + (self.min_x << scale),
            size.image_offset_y + (self.min_y << scale),
            size.image_offset_x + (self.max_x_exclusive << scale),
            size.image_offset_y + (self.max_y_exclusive << scale),
        )
    }
}

/// Inclusive-exclusive tile-index bounds of a part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub min_tile_x: u64,
    pub min_tile_y: u64,
    pub max_tile_x_exclusive: u64,
    pub max_tile_y_exclusive: u64,
}

impl TileRange {
    pub fn iter(self, tiles_per_row: u64) -> impl Iterator<Item = u64> {
        (self.min_tile_y..self.max_tile_y_exclusive).flat_map(move |ty| {
            (self.min_tile_x..self.max_tile_x_exclusive).map(move |tx| ty * tiles_per_row + tx)
        })
    }

    pub fn count(self) -> u64 {
        (self.max_tile_x_exclusive - self.min_tile_x) * (self.max_tile_y_exclusive - self.min_tile_y)
    }
}

/// Back-project a pixel rectangle into tile-grid coordinates.
///
/// The first tile row/column may be undersized (the tile grid origin can
/// precede the image origin), so it is handled separately from the regular
/// tile pitch.
pub fn tiles_in_part(
    structure: &CodestreamStructure,
    params: &CodestreamPartParams,
) -> TileRange {
    let size = structure.size();
    let (ref_min_x, ref_min_y, ref_max_x, ref_max_y) = params.reference_rect(structure);

    let tile_of = |p: u64, first_end: u64, pitch: u64, count: u64| -> u64 {
        let idx = if p < first_end {
            0
        } else {
            1 + (p - first_end) / pitch
        };
        idx.min(count - 1)
    };
    let first_end_x = size.tile_offset_x + size.tile_width;
    let first_end_y = size.tile_offset_y + size.tile_height;

    TileRange {
        min_tile_x: tile_of(ref_min_x, first_end_x, size.tile_width, size.num_tiles_x()),
        min_tile_y: tile_of(ref_min_y, first_end_y, size.tile_height, size.num_tiles_y()),
        max_tile_x_exclusive: tile_of(ref_max_x - 1, first_end_x, size.tile_width, size.num_tiles_x())
            + 1,
        max_tile_y_exclusive: tile_of(
            ref_max_y - 1,
            first_end_y,
            size.tile_height,
            size.num_tiles_y(),
        ) + 1,
    }
}

/// Absolute reference-grid start of a tile along one axis.
fn tile_start(index: u64, image_offset: u64, tile_offset: u64, pitch: u64) -> u64 {
    if index == 0 {
        image_offset
    } else {
        tile_offset + index * pitch
    }
}

/// Precinct-index rectangle (exclusive max); empty when `max <= min`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrecinctIndexRect {
    pub min_x: u64,
    pub min_y: u64,
    pub max_x_exclusive: u64,
    pub max_y_exclusive: u64,
}

impl PrecinctIndexRect {
    pub fn is_empty(&self) -> bool {
        self.max_x_exclusive <= self.min_x || self.max_y_exclusive <= self.min_y
    }

    pub fn contains(&self, x: u64, y: u64) -> bool {
        x >= self.min_x && x < self.max_x_exclusive && y >= self.min_y && y < self.max_y_exclusive
    }
}

/// Per-component, per-resolution precinct bounds of a part within a tile.
#[derive(Debug, Clone)]
pub struct PrecinctRanges {
    /// Indexed `[component][resolution]`.
    pub ranges: Vec<Vec<PrecinctIndexRect>>,
}

/// Back-project a part's rectangle into precinct-index bounds for every
/// component and resolution level of a tile, with a guard band for the
/// wavelet synthesis support.
pub fn precincts_in_part(
    structure: &CodestreamStructure,
    tile: &TileStructure,
    tile_index: u64,
    params: &CodestreamPartParams,
) -> PrecinctRanges {
    let size = structure.size();
    let tiles_x = size.num_tiles_x();
    let tx = tile_index % tiles_x;
    let ty = tile_index / tiles_x;

    let tile_start_x = tile_start(tx, size.image_offset_x, size.tile_offset_x, size.tile_width);
    let tile_start_y = tile_start(ty, size.image_offset_y, size.tile_offset_y, size.tile_height);
    let (ref_min_x, ref_min_y, ref_max_x, ref_max_y) = params.reference_rect(structure);

    // Intersect the request with the tile, in reference-grid coordinates.
    let local_min_x = ref_min_x.max(tile_start_x) - tile_start_x;
    let local_min_y = ref_min_y.max(tile_start_y) - tile_start_y;
    let local_max_x = ref_max_x.min(tile_start_x + tile.width).saturating_sub(tile_start_x);
    let local_max_y = ref_max_y.min(tile_start_y + tile.height).saturating_sub(tile_start_y);

    let levels = tile.coding.num_resolution_levels;
    let ranges = size
        .components
        .iter()
        .enumerate()
        .map(|(c, comp)| {
            let tile_comp = &tile.components[c];
            (0..levels)
                .map(|r| {
                    let res = &tile_comp.resolutions[r as usize];
                    if local_max_x <= local_min_x || local_max_y <= local_min_y {
                        return PrecinctIndexRect::default();
                    }
                    let scale_x = comp.scale_x << (levels - 1 - r);
                    let scale_y = comp.scale_y << (levels - 1 - r);
                    let res_min_x = (local_min_x / scale_x).saturating_sub(WAVELET_SUPPORT_GUARD);
                    let res_min_y = (local_min_y / scale_y).saturating_sub(WAVELET_SUPPORT_GUARD);
                    let res_max_x =
                        (local_max_x.div_ceil(scale_x) + WAVELET_SUPPORT_GUARD).min(res.width);
                    let res_max_y =
                        (local_max_y.div_ceil(scale_y) + WAVELET_SUPPORT_GUARD).min(res.height);
                    if res_max_x <= res_min_x || res_max_y <= res_min_y {
                        return PrecinctIndexRect::default();
                    }
                    let ppx = res.precinct_width_exp.min(62);
                    let ppy = res.precinct_height_exp.min(62);
                    PrecinctIndexRect {
                        min_x: res_min_x >> ppx,
                        min_y: res_min_y >> ppy,
                        max_x_exclusive: (((res_max_x - 1) >> ppx) + 1).min(res.num_precincts_x),
                        max_y_exclusive: (((res_max_y - 1) >> ppy) + 1).min(res.num_precincts_y),
                    }
                })
                .collect()
        })
        .collect();
    PrecinctRanges { ranges }
}

/// Position of one precinct within the codestream's structural grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrecinctPosition {
    pub tile_index: u64,
    pub component: usize,
    pub resolution: u8,
    pub precinct_x: u64,
    pub precinct_y: u64,
}

impl PrecinctPosition {
    /// The precinct databin's in-class index (ISO/IEC 15444-9 A.3.2):
    /// `t + (c + s * numComponents) * numTiles`, where `s` counts the
    /// precincts of lower resolutions plus this precinct's raster index.
    pub fn in_class_index(&self, structure: &CodestreamStructure, tile: &TileStructure) -> u64 {
        let tile_comp = &tile.components[self.component];
        let res = &tile_comp.resolutions[self.resolution as usize];
        let seq = tile_comp.precincts_before_resolution(self.resolution)
            + self.precinct_y * res.num_precincts_x
            + self.precinct_x;
        let num_components = structure.num_components() as u64;
        let num_tiles = structure.size().num_tiles();
        self.tile_index + (self.component as u64 + seq * num_components) * num_tiles
    }
}

/// One yielded precinct with its membership flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecinctStep {
    pub position: PrecinctPosition,
    pub in_part: bool,
}

/// Enumerates a tile's precincts in progression order.
///
/// The rightmost member of the order's precinct-member string advances
/// first; wraparound carries into the next member, and any carry resets the
/// inner members to their sub-range minimum. In constrained mode the
/// position member wraps within the part's precinct sub-range; in
/// iterate-all mode every precinct is yielded with an `in_part` flag.
pub struct PrecinctIterator {
    tile: Arc<TileStructure>,
    tile_index: u64,
    part: Option<PrecinctRanges>,
    iterate_all: bool,
    /// Precinct members, outermost first.
    members: [PrecinctMember; 3],
    num_resolutions: u8,
    state: IterState,
    done: bool,
    started: bool,
}

#[derive(Debug, Clone, Copy)]
struct IterState {
    resolution: u8,
    component: usize,
    precinct_x: u64,
    precinct_y: u64,
}

impl PrecinctIterator {
    pub fn new(
        tile: Arc<TileStructure>,
        tile_index: u64,
        order: ProgressionOrder,
        levels_to_cut: u8,
        part: Option<PrecinctRanges>,
        iterate_all: bool,
    ) -> Result<Self, JpipError> {
        if levels_to_cut >= tile.coding.num_resolution_levels {
            return Err(JpipError::TooManyResolutionLevelsToCut);
        }
        let num_resolutions = tile.coding.num_resolution_levels - levels_to_cut;
        let mut iter = Self {
            tile,
            tile_index,
            part,
            iterate_all,
            members: order.precinct_members(),
            num_resolutions,
            state: IterState {
                resolution: 0,
                component: 0,
                precinct_x: 0,
                precinct_y: 0,
            },
            done: false,
            started: false,
        };
        iter.reset_position();
        Ok(iter)
    }

    /// Precinct bounds of the current (component, resolution).
    fn bounds(&self) -> PrecinctIndexRect {
        let res =
            &self.tile.components[self.state.component].resolutions[self.state.resolution as usize];
        let full = PrecinctIndexRect {
            min_x: 0,
            min_y: 0,
            max_x_exclusive: res.num_precincts_x,
            max_y_exclusive: res.num_precincts_y,
        };
        if self.iterate_all {
            full
        } else {
            match &self.part {
                Some(part) => part.ranges[self.state.component][self.state.resolution as usize],
                None => full,
            }
        }
    }

    fn reset_position(&mut self) {
        let bounds = self.bounds();
        self.state.precinct_x = bounds.min_x;
        self.state.precinct_y = bounds.min_y;
    }

    /// Advance one member; returns false on wraparound.
    fn advance_member(&mut self, member: PrecinctMember) -> bool {
        match member {
            PrecinctMember::Resolution => {
                if self.state.resolution + 1 < self.num_resolutions {
                    self.state.resolution += 1;
                    true
                } else {
                    self.state.resolution = 0;
                    false
                }
            }
            PrecinctMember::Component => {
                if self.state.component + 1 < self.tile.components.len() {
                    self.state.component += 1;
                    true
                } else {
                    self.state.component = 0;
                    false
                }
            }
            PrecinctMember::Position => {
                let bounds = self.bounds();
                if self.state.precinct_x + 1 < bounds.max_x_exclusive {
                    self.state.precinct_x += 1;
                    return true;
                }
                self.state.precinct_x = bounds.min_x;
                if self.state.precinct_y + 1 < bounds.max_y_exclusive {
                    self.state.precinct_y += 1;
                    return true;
                }
                self.state.precinct_y = bounds.min_y;
                false
            }
        }
    }

    /// Advance to the next state; returns false when the sequence ends.
    fn step(&mut self) -> bool {
        for i in (0..3).rev() {
            let member = self.members[i];
            if self.advance_member(member) {
                // A carry into member i resets everything inner to it; the
                // position sub-range may have changed with the new
                // component or resolution.
                if self.members[i + 1..].contains(&PrecinctMember::Position) {
                    self.reset_position();
                }
                return true;
            }
        }
        false
    }

    fn current_valid(&self) -> bool {
        !self.bounds().is_empty()
    }

    fn current(&self) -> PrecinctStep {
        let position = PrecinctPosition {
            tile_index: self.tile_index,
            component: self.state.component,
            resolution: self.state.resolution,
            precinct_x: self.state.precinct_x,
            precinct_y: self.state.precinct_y,
        };
        let in_part = match &self.part {
            Some(part) => part.ranges[self.state.component][self.state.resolution as usize]
                .contains(self.state.precinct_x, self.state.precinct_y),
            None => true,
        };
        PrecinctStep { position, in_part }
    }
}

impl Iterator for PrecinctIterator {
    type Item = PrecinctStep;

    fn next(&mut self) -> Option<PrecinctStep> {
        if self.done {
            return None;
        }
        if !self.started {
            self.started = true;
            if self.current_valid() {
                return Some(self.current());
            }
        }
        loop {
            if !self.step() {
                self.done = true;
                return None;
            }
            if self.current_valid() {
                return Some(self.current());
            }
        }
    }
}
