pub mod bitstream;
pub mod cache;
pub mod codestream;
pub mod collector;
pub mod composite;
pub mod databin;
pub mod error;
pub mod marker;
pub mod progressive;
pub mod quality_layers;
pub mod reconstruct;
pub mod region;
pub mod sink;
pub mod tag_tree;

pub use cache::{DatabinCache, MessageHeader};
pub use codestream::{CodestreamStructure, ProgressionOrder, TileStructure};
pub use collector::{CollectedPart, PacketCollector};
pub use databin::{Databin, DatabinClass, DatabinId};
pub use error::JpipError;
pub use progressive::{ProgressiveRequest, ProgressiveStage, ProgressiveStatus, Progressiveness};
pub use quality_layers::QualityLayerCache;
pub use reconstruct::Reconstructor;
pub use region::{CodestreamPartParams, QualityLimit};
