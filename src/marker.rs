use num_enum::{IntoPrimitive, TryFromPrimitive};

/// JPEG 2000 codestream marker codes (ISO/IEC 15444-1 Annex A).
///
/// Only the second byte is stored; every marker is preceded by 0xFF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum J2kMarkerCode {
    /// SOC: Start of codestream.
    StartOfCodestream = 0x4F,
    /// SIZ: Image and tile size.
    ImageAndTileSize = 0x51,
    /// COD: Coding style default.
    CodingStyleDefault = 0x52,
    /// COC: Coding style component.
    CodingStyleComponent = 0x53,
    /// TLM: Tile-part lengths.
    TilePartLengths = 0x55,
    /// PLM: Packet length, main header.
    PacketLengthMain = 0x57,
    /// PLT: Packet length, tile-part header.
    PacketLengthTile = 0x58,
    /// QCD: Quantization default.
    QuantizationDefault = 0x5C,
    /// QCC: Quantization component.
    QuantizationComponent = 0x5D,
    /// RGN: Region of interest.
    RegionOfInterest = 0x5E,
    /// POC: Progression order change.
    ProgressionOrderChange = 0x5F,
    /// PPM: Packed packet headers, main header.
    PackedPacketHeadersMain = 0x60,
    /// PPT: Packed packet headers, tile-part header.
    PackedPacketHeadersTile = 0x61,
    /// CRG: Component registration.
    ComponentRegistration = 0x63,
    /// COM: Comment.
    Comment = 0x64,
    /// CAP: Extended capability (Part 15).
    Capability = 0x50,
    /// SOT: Start of tile-part.
    StartOfTile = 0x90,
    /// SOP: Start of packet.
    StartOfPacket = 0x91,
    /// EPH: End of packet header.
    EndOfPacketHeader = 0x92,
    /// SOD: Start of data.
    StartOfData = 0x93,
    /// EOC: End of codestream.
    EndOfCodestream = 0xD9,
}

pub const MARKER_START_BYTE: u8 = 0xFF;

/// Length in bytes of a whole SOP marker segment (marker + Lsop + Nsop).
pub const SOP_SEGMENT_LENGTH: u64 = 6;
/// Length in bytes of an EPH marker (no segment body).
pub const EPH_LENGTH: u64 = 2;
