//! Codestream structure model.
//!
//! Parses the main header once from its databin and exposes the tile grid,
//! per-tile coding parameters, and precinct/resolution/component geometry.
//! Tile headers may override the default coding style; override structures
//! are memoized per tile index, default structures per edge-type pair
//! (edge tiles are smaller, so nine classes cover every tile).

use crate::databin::Databin;
use crate::error::JpipError;
use crate::marker::{J2kMarkerCode, MARKER_START_BYTE};
use num_enum::TryFromPrimitive;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Progression orders (ISO/IEC 15444-1 Table A.16).
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ProgressionOrder {
    LayerResolutionComponentPosition = 0,
    ResolutionLayerComponentPosition = 1,
    ResolutionPositionComponentLayer = 2,
    PositionComponentResolutionLayer = 3,
    ComponentPositionResolutionLayer = 4,
}

/// One member of the precinct enumeration order (the progression order
/// with the layer member removed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecinctMember {
    Resolution,
    Component,
    Position,
}

impl ProgressionOrder {
    /// True when the layer member is innermost (RPCL, PCRL, CPRL); only
    /// such orders admit precinct-contiguous packet emission.
    pub fn is_layer_innermost(self) -> bool {
        matches!(
            self,
            Self::ResolutionPositionComponentLayer
                | Self::PositionComponentResolutionLayer
                | Self::ComponentPositionResolutionLayer
        )
    }

    /// The three precinct members, outermost first.
    pub fn precinct_members(self) -> [PrecinctMember; 3] {
        use PrecinctMember::*;
        match self {
            Self::LayerResolutionComponentPosition
            | Self::ResolutionLayerComponentPosition
            | Self::ResolutionPositionComponentLayer => [Resolution, Position, Component],
            Self::PositionComponentResolutionLayer => [Position, Component, Resolution],
            Self::ComponentPositionResolutionLayer => [Component, Position, Resolution],
        }
    }
}

/// Per-component data from the SIZ marker.
#[derive(Debug, Clone, Copy)]
pub struct ComponentParams {
    pub precision: u8,
    pub is_signed: bool,
    /// Horizontal subsampling on the reference grid.
    pub scale_x: u64,
    /// Vertical subsampling on the reference grid.
    pub scale_y: u64,
}

/// Image and tile geometry from the SIZ marker.
#[derive(Debug, Clone)]
pub struct SizeParams {
    pub reference_grid_width: u64,
    pub reference_grid_height: u64,
    pub image_offset_x: u64,
    pub image_offset_y: u64,
    pub tile_width: u64,
    pub tile_height: u64,
    pub tile_offset_x: u64,
    pub tile_offset_y: u64,
    pub components: Vec<ComponentParams>,
}

impl SizeParams {
    pub fn image_width(&self) -> u64 {
        self.reference_grid_width - self.image_offset_x
    }

    pub fn image_height(&self) -> u64 {
        self.reference_grid_height - self.image_offset_y
    }

    pub fn num_tiles_x(&self) -> u64 {
        (self.reference_grid_width - self.tile_offset_x).div_ceil(self.tile_width)
    }

    pub fn num_tiles_y(&self) -> u64 {
        (self.reference_grid_height - self.tile_offset_y).div_ceil(self.tile_height)
    }

    pub fn num_tiles(&self) -> u64 {
        self.num_tiles_x() * self.num_tiles_y()
    }
}

/// Coding-style parameters from a COD marker segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodingParams {
    pub progression_order: ProgressionOrder,
    pub num_quality_layers: u16,
    pub num_resolution_levels: u8,
    /// log2 of the nominal codeblock width (already +2 adjusted, 2..=10).
    pub codeblock_width_exp: u8,
    pub codeblock_height_exp: u8,
    pub codeblock_style: u8,
    pub transformation: u8,
    /// Precinct (width, height) exponents per resolution level, lowest
    /// first. `(15, 15)` throughout when the codestream leaves precincts at
    /// their default size.
    pub precinct_size_exps: Vec<(u8, u8)>,
    pub precincts_defined: bool,
    pub sop_markers: bool,
    pub eph_markers: bool,
}

impl CodingParams {
    pub fn precinct_exps(&self, resolution: u8) -> (u8, u8) {
        self.precinct_size_exps[resolution as usize]
    }
}

/// A marker segment's position inside a copied header buffer.
#[derive(Debug, Clone, Copy)]
pub struct SegmentSpan {
    pub marker: J2kMarkerCode,
    /// Offset of the 0xFF marker start byte.
    pub offset: usize,
    /// Total length including the two marker bytes.
    pub length: usize,
}

/// Cursor over a fully-copied header buffer.
pub struct SegmentReader<'a> {
    source: &'a [u8],
    position: usize,
}

impl<'a> SegmentReader<'a> {
    pub fn new(source: &'a [u8]) -> Self {
        Self {
            source,
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.source.len() - self.position
    }

    pub fn read_u8(&mut self) -> Result<u8, JpipError> {
        if self.position >= self.source.len() {
            return Err(JpipError::InvalidMarkerSegmentSize);
        }
        let value = self.source[self.position];
        self.position += 1;
        Ok(value)
    }

    pub fn read_u16(&mut self) -> Result<u16, JpipError> {
        let b1 = self.read_u8()? as u16;
        let b2 = self.read_u8()? as u16;
        Ok((b1 << 8) | b2)
    }

    pub fn read_u32(&mut self) -> Result<u32, JpipError> {
        let b1 = self.read_u16()? as u32;
        let b2 = self.read_u16()? as u32;
        Ok((b1 << 16) | b2)
    }

    pub fn advance(&mut self, count: usize) -> Result<(), JpipError> {
        if self.remaining() < count {
            return Err(JpipError::InvalidMarkerSegmentSize);
        }
        self.position += count;
        Ok(())
    }

    pub fn read_marker(&mut self) -> Result<J2kMarkerCode, JpipError> {
        if self.read_u8()? != MARKER_START_BYTE {
            return Err(JpipError::UnexpectedMarker(
                self.source[self.position - 1] as u16,
            ));
        }
        let byte = self.read_u8()?;
        J2kMarkerCode::try_from(byte).map_err(|_| JpipError::UnexpectedMarker(0xFF00 | byte as u16))
    }
}

/// Edge classification of a tile along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileEdge {
    First,
    Middle,
    Last,
}

/// Geometry of one resolution level of one tile-component.
#[derive(Debug, Clone)]
pub struct ResolutionGeometry {
    pub width: u64,
    pub height: u64,
    pub precinct_width_exp: u8,
    pub precinct_height_exp: u8,
    pub num_precincts_x: u64,
    pub num_precincts_y: u64,
}

impl ResolutionGeometry {
    pub fn num_precincts(&self) -> u64 {
        self.num_precincts_x * self.num_precincts_y
    }
}

/// Geometry of one component within a tile.
#[derive(Debug, Clone)]
pub struct TileComponent {
    pub width: u64,
    pub height: u64,
    pub resolutions: Vec<ResolutionGeometry>,
}

impl TileComponent {
    /// Precincts contributed by resolutions below `resolution`.
    pub fn precincts_before_resolution(&self, resolution: u8) -> u64 {
        self.resolutions[..resolution as usize]
            .iter()
            .map(ResolutionGeometry::num_precincts)
            .sum()
    }

    pub fn num_precincts_total(&self) -> u64 {
        self.resolutions
            .iter()
            .map(ResolutionGeometry::num_precincts)
            .sum()
    }
}

/// Codeblock grid dimensions of one subband of one precinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeblockGrid {
    pub num_x: u64,
    pub num_y: u64,
}

/// Coding parameters plus derived geometry for one tile shape.
#[derive(Debug, Clone)]
pub struct TileStructure {
    pub width: u64,
    pub height: u64,
    pub coding: CodingParams,
    pub components: Vec<TileComponent>,
}

impl TileStructure {
    fn build(width: u64, height: u64, coding: CodingParams, size: &SizeParams) -> Self {
        let components = size
            .components
            .iter()
            .map(|comp| {
                let comp_width = width.div_ceil(comp.scale_x);
                let comp_height = height.div_ceil(comp.scale_y);
                let levels = coding.num_resolution_levels;
                let resolutions = (0..levels)
                    .map(|r| {
                        let down = 1u64 << (levels - 1 - r);
                        let res_width = comp_width.div_ceil(down);
                        let res_height = comp_height.div_ceil(down);
                        let (ppx, ppy) = coding.precinct_exps(r);
                        let num_x = if res_width == 0 {
                            0
                        } else {
                            res_width.div_ceil(1u64 << ppx.min(62))
                        };
                        let num_y = if res_height == 0 {
                            0
                        } else {
                            res_height.div_ceil(1u64 << ppy.min(62))
                        };
                        ResolutionGeometry {
                            width: res_width,
                            height: res_height,
                            precinct_width_exp: ppx,
                            precinct_height_exp: ppy,
                            num_precincts_x: num_x,
                            num_precincts_y: num_y,
                        }
                    })
                    .collect();
                TileComponent {
                    width: comp_width,
                    height: comp_height,
                    resolutions,
                }
            })
            .collect();
        Self {
            width,
            height,
            coding,
            components,
        }
    }

    pub fn num_quality_layers(&self) -> u16 {
        self.coding.num_quality_layers
    }

    /// Codeblock grids per subband of one precinct: one grid at resolution
    /// zero (the LL band), else three (HL, LH, HH in packet order).
    pub fn codeblock_grids(
        &self,
        component: usize,
        resolution: u8,
        precinct_x: u64,
        precinct_y: u64,
    ) -> Vec<CodeblockGrid> {
        let comp = &self.components[component];
        let levels = self.coding.num_resolution_levels;
        let (ppx, ppy) = self.coding.precinct_exps(resolution);
        let cb_w_exp = self.coding.codeblock_width_exp;
        let cb_h_exp = self.coding.codeblock_height_exp;

        // Subband-space precinct size: halved relative to the resolution
        // grid except at resolution zero (B.6).
        let half = u8::from(resolution > 0);
        let prec_w_exp = ppx.saturating_sub(half);
        let prec_h_exp = ppy.saturating_sub(half);
        let eff_cb_w = 1u64 << cb_w_exp.min(prec_w_exp).min(62);
        let eff_cb_h = 1u64 << cb_h_exp.min(prec_h_exp).min(62);
        let prec_w = 1u64 << prec_w_exp.min(62);
        let prec_h = 1u64 << prec_h_exp.min(62);

        let grid_for = |band_w: u64, band_h: u64| {
            let x0 = (precinct_x * prec_w).min(band_w);
            let x1 = ((precinct_x + 1) * prec_w).min(band_w);
            let y0 = (precinct_y * prec_h).min(band_h);
            let y1 = ((precinct_y + 1) * prec_h).min(band_h);
            CodeblockGrid {
                num_x: if x1 > x0 {
                    x1.div_ceil(eff_cb_w) - x0 / eff_cb_w
                } else {
                    0
                },
                num_y: if y1 > y0 {
                    y1.div_ceil(eff_cb_h) - y0 / eff_cb_h
                } else {
                    0
                },
            }
        };

        if resolution == 0 {
            let res = &comp.resolutions[0];
            vec![grid_for(res.width, res.height)]
        } else {
            // Band extents of decomposition level d follow from the extent
            // of LL at level d-1 (B.5): low-pass keeps ceil(n/2) samples,
            // high-pass floor(n/2).
            let d = levels - resolution;
            let parent_w = comp.width.div_ceil(1u64 << (d - 1).min(62));
            let parent_h = comp.height.div_ceil(1u64 << (d - 1).min(62));
            let low_w = parent_w.div_ceil(2);
            let high_w = parent_w / 2;
            let low_h = parent_h.div_ceil(2);
            let high_h = parent_h / 2;
            vec![
                grid_for(high_w, low_h), // HL
                grid_for(low_w, high_h), // LH
                grid_for(high_w, high_h), // HH
            ]
        }
    }
}

/// Content of a parsed tile-header databin.
#[derive(Debug, Clone)]
pub struct TileHeaderInfo {
    pub segments: Vec<SegmentSpan>,
    pub cod_override: Option<CodingParams>,
    pub ends_with_start_of_data: bool,
}

/// The parsed codestream structure: main-header parameters plus memoized
/// per-tile structures.
pub struct CodestreamStructure {
    size: SizeParams,
    default_coding: CodingParams,
    main_header_bytes: Vec<u8>,
    main_header_segments: Vec<SegmentSpan>,
    default_tiles: Mutex<HashMap<(TileEdge, TileEdge), Arc<TileStructure>>>,
    override_tiles: Mutex<HashMap<u64, Arc<TileStructure>>>,
}

impl CodestreamStructure {
    /// Parse the main header. Returns `Ok(None)` until the main-header
    /// databin is fully loaded.
    pub fn from_main_header(databin: &Databin) -> Result<Option<Self>, JpipError> {
        let Some(bytes) = databin.copy_all() else {
            return Ok(None);
        };
        Self::from_bytes(bytes).map(Some)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, JpipError> {
        let mut reader = SegmentReader::new(&bytes);
        if reader.read_marker()? != J2kMarkerCode::StartOfCodestream {
            return Err(JpipError::StartOfCodestreamNotFound);
        }
        let mut segments = vec![SegmentSpan {
            marker: J2kMarkerCode::StartOfCodestream,
            offset: 0,
            length: 2,
        }];
        let mut size: Option<SizeParams> = None;
        let mut coding: Option<CodingParams> = None;

        while reader.remaining() >= 2 {
            let offset = reader.position();
            let marker = reader.read_marker()?;
            match marker {
                J2kMarkerCode::ImageAndTileSize => {
                    let length = Self::segment_length(&mut reader)?;
                    size = Some(parse_siz(&mut reader)?);
                    let end = offset + length + 2;
                    if reader.position() > end {
                        return Err(JpipError::InvalidMarkerSegmentSize);
                    }
                    reader.advance(end - reader.position())?;
                    segments.push(SegmentSpan {
                        marker,
                        offset,
                        length: length + 2,
                    });
                }
                J2kMarkerCode::CodingStyleDefault => {
                    let length = Self::segment_length(&mut reader)?;
                    coding = Some(parse_cod(&mut reader, length)?);
                    segments.push(SegmentSpan {
                        marker,
                        offset,
                        length: length + 2,
                    });
                }
                J2kMarkerCode::QuantizationDefault => {
                    let length = Self::segment_length(&mut reader)?;
                    validate_qcd(&bytes[offset + 4..offset + 2 + length])?;
                    reader.advance(length - 2)?;
                    segments.push(SegmentSpan {
                        marker,
                        offset,
                        length: length + 2,
                    });
                }
                J2kMarkerCode::PackedPacketHeadersMain => {
                    return Err(JpipError::UnsupportedFeature(
                        "packed packet headers in the main header (PPM)",
                    ));
                }
                J2kMarkerCode::CodingStyleComponent => {
                    return Err(JpipError::UnsupportedFeature(
                        "per-component coding style (COC)",
                    ));
                }
                J2kMarkerCode::ProgressionOrderChange => {
                    return Err(JpipError::UnsupportedFeature(
                        "progression order change (POC)",
                    ));
                }
                J2kMarkerCode::StartOfTile | J2kMarkerCode::StartOfData => {
                    return Err(JpipError::UnexpectedMarker(0xFF00 | marker as u16));
                }
                _ => {
                    // QCC, COM, CRG, TLM, PLM, CAP, RGN: structure-neutral.
                    let length = Self::segment_length(&mut reader)?;
                    reader.advance(length - 2)?;
                    segments.push(SegmentSpan {
                        marker,
                        offset,
                        length: length + 2,
                    });
                }
            }
        }
        if reader.remaining() != 0 {
            return Err(JpipError::InvalidMarkerSegmentSize);
        }

        let size = size.ok_or(JpipError::SizMarkerNotFound)?;
        let default_coding = coding.ok_or(JpipError::CodMarkerNotFound)?;
        log::debug!(
            "main header parsed: {}x{} image, {}x{} tile grid, {} components, {} levels, {} layers",
            size.image_width(),
            size.image_height(),
            size.num_tiles_x(),
            size.num_tiles_y(),
            size.components.len(),
            default_coding.num_resolution_levels,
            default_coding.num_quality_layers,
        );
        Ok(Self {
            size,
            default_coding,
            main_header_bytes: bytes,
            main_header_segments: segments,
            default_tiles: Mutex::new(HashMap::new()),
            override_tiles: Mutex::new(HashMap::new()),
        })
    }

    fn segment_length(reader: &mut SegmentReader<'_>) -> Result<usize, JpipError> {
        let length = reader.read_u16()? as usize;
        if length < 2 {
            return Err(JpipError::InvalidMarkerSegmentSize);
        }
        Ok(length)
    }

    pub fn size(&self) -> &SizeParams {
        &self.size
    }

    pub fn default_coding(&self) -> &CodingParams {
        &self.default_coding
    }

    pub fn main_header_bytes(&self) -> &[u8] {
        &self.main_header_bytes
    }

    pub fn main_header_segments(&self) -> &[SegmentSpan] {
        &self.main_header_segments
    }

    pub fn num_components(&self) -> usize {
        self.size.components.len()
    }

    /// Fails unless `levels_to_cut` is strictly below every component's
    /// resolution-level count.
    pub fn validate_levels_to_cut(&self, levels_to_cut: u8) -> Result<(), JpipError> {
        if levels_to_cut >= self.default_coding.num_resolution_levels {
            return Err(JpipError::TooManyResolutionLevelsToCut);
        }
        Ok(())
    }

    pub fn tile_edge_types(&self, tile_index: u64) -> (TileEdge, TileEdge) {
        let tiles_x = self.size.num_tiles_x();
        let tiles_y = self.size.num_tiles_y();
        let tx = tile_index % tiles_x;
        let ty = tile_index / tiles_x;
        let classify = |idx: u64, count: u64| {
            if idx == 0 {
                TileEdge::First
            } else if idx + 1 == count {
                TileEdge::Last
            } else {
                TileEdge::Middle
            }
        };
        (classify(tx, tiles_x), classify(ty, tiles_y))
    }

    /// Pixel extent of a tile along one axis, from its edge class.
    ///
    /// The last tile's size is `(levelSize - firstTileSize) mod tileSize`,
    /// falling back to the full tile size when the remainder is zero.
    fn edge_extent(edge: TileEdge, level_size: u64, first: u64, regular: u64) -> u64 {
        match edge {
            TileEdge::First => first,
            TileEdge::Middle => regular,
            TileEdge::Last => {
                let remainder = (level_size - first) % regular;
                if remainder == 0 { regular } else { remainder }
            }
        }
    }

    fn first_tile_width(&self) -> u64 {
        (self.size.tile_offset_x + self.size.tile_width).min(self.size.reference_grid_width)
            - self.size.image_offset_x
    }

    fn first_tile_height(&self) -> u64 {
        (self.size.tile_offset_y + self.size.tile_height).min(self.size.reference_grid_height)
            - self.size.image_offset_y
    }

    /// Pixel size of a tile given its edge classification.
    pub fn tile_extent(&self, edges: (TileEdge, TileEdge)) -> (u64, u64) {
        let width = Self::edge_extent(
            edges.0,
            self.size.image_width(),
            self.first_tile_width(),
            self.size.tile_width,
        );
        let height = Self::edge_extent(
            edges.1,
            self.size.image_height(),
            self.first_tile_height(),
            self.size.tile_height,
        );
        (width, height)
    }

    /// The default (non-overridden) structure for a tile, memoized per
    /// edge-type pair.
    pub fn default_tile_structure(&self, tile_index: u64) -> Arc<TileStructure> {
        let edges = self.tile_edge_types(tile_index);
        let mut defaults = self.default_tiles.lock().expect("tile memo lock poisoned");
        Arc::clone(defaults.entry(edges).or_insert_with(|| {
            let (width, height) = self.tile_extent(edges);
            Arc::new(TileStructure::build(
                width,
                height,
                self.default_coding.clone(),
                &self.size,
            ))
        }))
    }

    /// The structure for a tile, honoring a tile-header COD override.
    /// Returns `Ok(None)` until the tile-header databin is fully loaded.
    pub fn tile_structure(
        &self,
        tile_index: u64,
        tile_header: &Databin,
    ) -> Result<Option<Arc<TileStructure>>, JpipError> {
        if let Some(cached) = self
            .override_tiles
            .lock()
            .expect("tile memo lock poisoned")
            .get(&tile_index)
        {
            return Ok(Some(Arc::clone(cached)));
        }
        let Some(bytes) = tile_header.copy_all() else {
            return Ok(None);
        };
        let info = parse_tile_header(&bytes)?;
        let structure = match info.cod_override {
            Some(coding) => {
                log::debug!("tile {tile_index} carries a coding-style override");
                let (width, height) = self.tile_extent(self.tile_edge_types(tile_index));
                let built = Arc::new(TileStructure::build(width, height, coding, &self.size));
                self.override_tiles
                    .lock()
                    .expect("tile memo lock poisoned")
                    .insert(tile_index, Arc::clone(&built));
                built
            }
            None => self.default_tile_structure(tile_index),
        };
        Ok(Some(structure))
    }
}

fn parse_siz(reader: &mut SegmentReader<'_>) -> Result<SizeParams, JpipError> {
    let _capabilities = reader.read_u16()?;
    let reference_grid_width = reader.read_u32()? as u64;
    let reference_grid_height = reader.read_u32()? as u64;
    let image_offset_x = reader.read_u32()? as u64;
    let image_offset_y = reader.read_u32()? as u64;
    let tile_width = reader.read_u32()? as u64;
    let tile_height = reader.read_u32()? as u64;
    let tile_offset_x = reader.read_u32()? as u64;
    let tile_offset_y = reader.read_u32()? as u64;
    let component_count = reader.read_u16()?;

    if tile_width == 0 || tile_height == 0 {
        return Err(JpipError::InvalidSizParameter("tile size must be nonzero"));
    }
    if reference_grid_width <= image_offset_x || reference_grid_height <= image_offset_y {
        return Err(JpipError::InvalidSizParameter("empty image area"));
    }
    if tile_offset_x > image_offset_x || tile_offset_y > image_offset_y {
        return Err(JpipError::InvalidSizParameter(
            "tile grid origin must not exceed the image origin",
        ));
    }
    if component_count == 0 {
        return Err(JpipError::InvalidSizParameter("zero components"));
    }

    let mut components = Vec::with_capacity(component_count as usize);
    for _ in 0..component_count {
        let depth_byte = reader.read_u8()?;
        let scale_x = reader.read_u8()? as u64;
        let scale_y = reader.read_u8()? as u64;
        if scale_x == 0 || scale_y == 0 {
            return Err(JpipError::InvalidSizParameter(
                "component subsampling factor must be nonzero",
            ));
        }
        components.push(ComponentParams {
            precision: (depth_byte & 0x7F) + 1,
            is_signed: (depth_byte & 0x80) != 0,
            scale_x,
            scale_y,
        });
    }
    Ok(SizeParams {
        reference_grid_width,
        reference_grid_height,
        image_offset_x,
        image_offset_y,
        tile_width,
        tile_height,
        tile_offset_x,
        tile_offset_y,
        components,
    })
}

fn parse_cod(reader: &mut SegmentReader<'_>, length: usize) -> Result<CodingParams, JpipError> {
    let scod = reader.read_u8()?;
    let prog_byte = reader.read_u8()?;
    let progression_order = ProgressionOrder::try_from(prog_byte)
        .map_err(|_| JpipError::InvalidProgressionOrder(prog_byte))?;
    let num_quality_layers = reader.read_u16()?;
    let _mct = reader.read_u8()?;
    let decomposition_levels = reader.read_u8()?;
    let codeblock_width_raw = reader.read_u8()?;
    let codeblock_height_raw = reader.read_u8()?;
    let codeblock_style = reader.read_u8()?;
    let transformation = reader.read_u8()?;

    if num_quality_layers == 0 {
        return Err(JpipError::InvalidMarkerSegmentSize);
    }
    if codeblock_width_raw > 8 {
        return Err(JpipError::InvalidCodeblockSize(codeblock_width_raw));
    }
    if codeblock_height_raw > 8 {
        return Err(JpipError::InvalidCodeblockSize(codeblock_height_raw));
    }
    if codeblock_width_raw + codeblock_height_raw > 8 {
        return Err(JpipError::InvalidCodeblockSize(
            codeblock_width_raw + codeblock_height_raw,
        ));
    }

    let num_resolution_levels = decomposition_levels + 1;
    let precincts_defined = (scod & 0x01) != 0;
    let mut precinct_size_exps = Vec::with_capacity(num_resolution_levels as usize);
    if precincts_defined {
        for resolution in 0..num_resolution_levels {
            let byte = reader.read_u8()?;
            let ppx = byte & 0x0F;
            let ppy = byte >> 4;
            // PPx = 0 is only allowed at resolution 0 (Table A.21).
            if resolution > 0 && (ppx == 0 || ppy == 0) {
                return Err(JpipError::InvalidPrecinctSize);
            }
            precinct_size_exps.push((ppx, ppy));
        }
    } else {
        precinct_size_exps.resize(num_resolution_levels as usize, (15, 15));
    }

    // Consumed from the Lcod budget: its own 2 length bytes, 10 fixed
    // bytes, and one precinct byte per resolution when defined.
    let consumed = 12 + if precincts_defined {
        num_resolution_levels as usize
    } else {
        0
    };
    if length < consumed {
        return Err(JpipError::InvalidMarkerSegmentSize);
    }
    reader.advance(length - consumed)?;

    Ok(CodingParams {
        progression_order,
        num_quality_layers,
        num_resolution_levels,
        codeblock_width_exp: codeblock_width_raw + 2,
        codeblock_height_exp: codeblock_height_raw + 2,
        codeblock_style,
        transformation,
        precinct_size_exps,
        precincts_defined,
        sop_markers: (scod & 0x02) != 0,
        eph_markers: (scod & 0x04) != 0,
    })
}

fn validate_qcd(body: &[u8]) -> Result<(), JpipError> {
    let Some(&sqcd) = body.first() else {
        return Err(JpipError::InvalidMarkerSegmentSize);
    };
    let style = sqcd & 0x1F;
    if style > 2 {
        return Err(JpipError::InvalidQuantizationStyle(style));
    }
    Ok(())
}

/// Parse a tile-header databin's content: a run of marker segments with an
/// optional trailing SOD. An empty bin means "no overrides".
pub fn parse_tile_header(bytes: &[u8]) -> Result<TileHeaderInfo, JpipError> {
    let mut reader = SegmentReader::new(bytes);
    let mut segments = Vec::new();
    let mut cod_override = None;
    let mut ends_with_start_of_data = false;

    while reader.remaining() >= 2 {
        let offset = reader.position();
        let marker = reader.read_marker()?;
        match marker {
            J2kMarkerCode::StartOfData => {
                ends_with_start_of_data = true;
                segments.push(SegmentSpan {
                    marker,
                    offset,
                    length: 2,
                });
                break;
            }
            J2kMarkerCode::PackedPacketHeadersTile => {
                return Err(JpipError::UnsupportedFeature(
                    "packed packet headers in a tile header (PPT)",
                ));
            }
            J2kMarkerCode::CodingStyleComponent => {
                return Err(JpipError::UnsupportedFeature(
                    "per-component coding style (COC)",
                ));
            }
            J2kMarkerCode::CodingStyleDefault => {
                let length = CodestreamStructure::segment_length(&mut reader)?;
                cod_override = Some(parse_cod(&mut reader, length)?);
                segments.push(SegmentSpan {
                    marker,
                    offset,
                    length: length + 2,
                });
            }
            _ => {
                let length = CodestreamStructure::segment_length(&mut reader)?;
                reader.advance(length - 2)?;
                segments.push(SegmentSpan {
                    marker,
                    offset,
                    length: length + 2,
                });
            }
        }
    }
    if !ends_with_start_of_data && reader.remaining() != 0 {
        return Err(JpipError::InvalidMarkerSegmentSize);
    }
    Ok(TileHeaderInfo {
        segments,
        cod_override,
        ends_with_start_of_data,
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::main_header;
    use super::*;

    fn structure_256x256_tiles_100() -> CodestreamStructure {
        // 256x256 image, 100x100 tiles, 1 component, RPCL, 1 layer,
        // 2 decomposition levels, precincts 64x64 at every level.
        let bytes = main_header((256, 256), (100, 100), 1, 2, 1, 2, &[(6, 6), (6, 6), (6, 6)]);
        CodestreamStructure::from_bytes(bytes).unwrap()
    }

    #[test]
    fn test_parse_main_header_basics() {
        let structure = structure_256x256_tiles_100();
        assert_eq!(structure.size().image_width(), 256);
        assert_eq!(structure.size().num_tiles_x(), 3);
        assert_eq!(structure.size().num_tiles(), 9);
        assert_eq!(structure.default_coding().num_resolution_levels, 3);
        assert_eq!(
            structure.default_coding().progression_order,
            ProgressionOrder::ResolutionPositionComponentLayer
        );
    }

    #[test]
    fn test_edge_tile_extents() {
        let structure = structure_256x256_tiles_100();
        // First (0,0): full 100. Last column: 256 - 2*100 = 56.
        assert_eq!(structure.tile_extent((TileEdge::First, TileEdge::First)), (100, 100));
        assert_eq!(structure.tile_extent((TileEdge::Last, TileEdge::Middle)), (56, 100));
        assert_eq!(structure.tile_extent((TileEdge::Middle, TileEdge::Last)), (100, 56));
    }

    #[test]
    fn test_last_tile_falls_back_to_full_width_when_exact() {
        // 300-wide image over 100-wide tiles: last remainder is exactly 0.
        let bytes = main_header((300, 100), (100, 100), 1, 2, 1, 0, &[(6, 6)]);
        let structure = CodestreamStructure::from_bytes(bytes).unwrap();
        assert_eq!(structure.tile_extent((TileEdge::Last, TileEdge::First)), (100, 100));
    }

    #[test]
    fn test_default_structure_memoized_per_edge_pair() {
        let structure = structure_256x256_tiles_100();
        // Tiles 1 and 2 of the first row share (Middle, First).
        let a = structure.default_tile_structure(1);
        let b = structure.default_tile_structure(1);
        assert!(Arc::ptr_eq(&a, &b));
        let corner = structure.default_tile_structure(0);
        assert!(!Arc::ptr_eq(&a, &corner));
    }

    #[test]
    fn test_precinct_counts() {
        let structure = structure_256x256_tiles_100();
        let tile = structure.default_tile_structure(0);
        let comp = &tile.components[0];
        // Tile 100x100; res widths: 25, 50, 100; precincts 64 wide.
        assert_eq!(comp.resolutions[0].width, 25);
        assert_eq!(comp.resolutions[0].num_precincts_x, 1);
        assert_eq!(comp.resolutions[1].width, 50);
        assert_eq!(comp.resolutions[1].num_precincts_x, 1);
        assert_eq!(comp.resolutions[2].width, 100);
        assert_eq!(comp.resolutions[2].num_precincts_x, 2);
        assert_eq!(comp.num_precincts_total(), 1 + 1 + 4);
        assert_eq!(comp.precincts_before_resolution(2), 2);
    }

    #[test]
    fn test_codeblock_grids() {
        let structure = structure_256x256_tiles_100();
        let tile = structure.default_tile_structure(0);
        // Resolution 0: LL band 25x25, precinct 64 -> one grid.
        let grids = tile.codeblock_grids(0, 0, 0, 0);
        assert_eq!(grids.len(), 1);
        // Codeblock 64 wide, effective min(64, precinct 64) -> 1x1 blocks.
        assert_eq!(grids[0], CodeblockGrid { num_x: 1, num_y: 1 });

        // Resolution 2: three subbands, parent extent 100 -> bands 50/50.
        let grids = tile.codeblock_grids(0, 2, 0, 0);
        assert_eq!(grids.len(), 3);
        // Precinct 64 in resolution coords -> 32 in subband coords;
        // codeblock 64 clamped to 32 -> bands 50 wide span 1 block in the
        // first precinct column (x in [0,32)).
        assert_eq!(grids[0], CodeblockGrid { num_x: 1, num_y: 1 });
    }

    #[test]
    fn test_levels_to_cut_validation() {
        let structure = structure_256x256_tiles_100();
        assert!(structure.validate_levels_to_cut(2).is_ok());
        assert_eq!(
            structure.validate_levels_to_cut(3),
            Err(JpipError::TooManyResolutionLevelsToCut)
        );
    }

    #[test]
    fn test_ppm_is_unsupported() {
        let mut bytes = vec![0xFF, 0x4F];
        super::test_support::push_siz(&mut bytes, (64, 64), (64, 64), 1);
        bytes.extend_from_slice(&[0xFF, 0x60, 0x00, 0x03, 0x00]); // PPM
        let result = CodestreamStructure::from_bytes(bytes);
        assert!(matches!(result, Err(JpipError::UnsupportedFeature(_))));
    }

    #[test]
    fn test_tile_header_override_detection() {
        let mut bytes = Vec::new();
        super::test_support::push_cod(&mut bytes, 2, 1, 1, (4, 4), &[(6, 6), (6, 6)]);
        bytes.extend_from_slice(&[0xFF, 0x93]); // SOD
        let info = parse_tile_header(&bytes).unwrap();
        assert!(info.cod_override.is_some());
        assert!(info.ends_with_start_of_data);
        assert_eq!(info.segments.len(), 2);

        let empty = parse_tile_header(&[]).unwrap();
        assert!(empty.cod_override.is_none());
        assert!(!empty.ends_with_start_of_data);
    }
}
