use thiserror::Error;

/// Errors raised by the JPIP cache and reconstruction engine.
///
/// "Not enough bytes have arrived yet" is deliberately absent: parse
/// primitives report it as `Ok(None)` so callers can retry once more data
/// has been delivered. Every variant here is either malformed input, a legal
/// but unsupported feature, a bad argument, or an internal invariant failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JpipError {
    // Malformed input (violates the JPEG 2000 / JPIP binary grammar)
    #[error("Start of codestream (SOC) marker not found")]
    StartOfCodestreamNotFound,
    #[error("Unexpected marker 0x{0:04X} in header")]
    UnexpectedMarker(u16),
    #[error("Invalid marker segment length")]
    InvalidMarkerSegmentSize,
    #[error("Image and tile size (SIZ) marker not found before coding parameters")]
    SizMarkerNotFound,
    #[error("Coding style default (COD) marker not found in main header")]
    CodMarkerNotFound,
    #[error("Invalid bit-stuffing: byte after 0xFF has its high bit set (B.10.1)")]
    InvalidBitStuffing,
    #[error("Invalid codeblock size exponent {0} (B.7)")]
    InvalidCodeblockSize(u8),
    #[error("Invalid precinct size exponent")]
    InvalidPrecinctSize,
    #[error("Invalid progression order byte {0}")]
    InvalidProgressionOrder(u8),
    #[error("Invalid SIZ parameter: {0}")]
    InvalidSizParameter(&'static str),
    #[error("Invalid quantization style {0} (A.6.4)")]
    InvalidQuantizationStyle(u8),
    #[error("Invalid codeword segment length signalling in packet header (B.10.7.1)")]
    InvalidCodewordLength,
    #[error("End of packet header (EPH) marker expected but not found")]
    EphMarkerNotFound,
    #[error("Databin range message extends beyond the bin's declared length")]
    RangeBeyondKnownLength,

    // Legal but unsupported features
    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(&'static str),

    // Argument validation
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("Requested region is empty or outside the image bounds")]
    RegionOutOfBounds,
    #[error("Resolution levels to cut must be below every component's level count")]
    TooManyResolutionLevelsToCut,
    #[error("Minimum quality layer count was not reached for every precinct")]
    MinimumQualityNotReached,

    // Logic bugs in the engine itself
    #[error("Internal inconsistency: {0}")]
    InternalInconsistency(&'static str),
}
