//! jpipexp CLI - replay recorded JPIP message dumps offline.
//!
//! A dump is a flat sequence of framed databin messages, each:
//! class id (u8), in-class index (u64), body start offset (u64),
//! body length (u32), last-byte flag (u8), then the body bytes.
//! All integers are big-endian.

use clap::{Parser, Subcommand, ValueEnum};
use jpipexp_rs::{
    CodestreamPartParams, CodestreamStructure, DatabinCache, DatabinClass, MessageHeader,
    ProgressionOrder, QualityLayerCache, QualityLimit, Reconstructor,
};
use std::fs;
use std::path::PathBuf;

/// Progressive JPIP cache: reconstruct JPEG 2000 codestreams from message dumps
#[derive(Parser)]
#[command(name = "jpipexp")]
#[command(author = "jpipexp-rs contributors")]
#[command(version)]
#[command(about = "Reconstruct JPEG 2000 codestreams from recorded JPIP message dumps", long_about = None)]
#[command(after_help = "EXAMPLES:
    jpipexp reconstruct -i session.jpipdump -o region.j2k
    jpipexp reconstruct -i session.jpipdump -o thumb.j2k --levels-to-cut 2 --max-quality 1
    jpipexp info -i session.jpipdump

For more information, visit: https://github.com/rad-medica/jpipexp-rs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconstruct a standalone .j2k codestream from a message dump
    ///
    /// Replays the dump into the databin cache, then emits a byte-exact
    /// codestream for the requested region, resolution, and quality.
    #[command(visible_alias = "r")]
    Reconstruct {
        /// Input message dump file
        #[arg(short, long, help = "Path to the recorded JPIP message dump")]
        input: PathBuf,

        /// Output codestream file
        #[arg(short, long, help = "Path for the reconstructed .j2k file")]
        output: PathBuf,

        /// Region minimum x, in pixels at the cut resolution level
        #[arg(long, default_value = "0")]
        min_x: u64,

        /// Region minimum y
        #[arg(long, default_value = "0")]
        min_y: u64,

        /// Region maximum x, exclusive (default: image width)
        #[arg(long)]
        max_x: Option<u64>,

        /// Region maximum y, exclusive (default: image height)
        #[arg(long)]
        max_y: Option<u64>,

        /// Resolution levels to drop from the top
        #[arg(short, long, default_value = "0")]
        levels_to_cut: u8,

        /// Minimum quality layers required per precinct ("max" or a count)
        #[arg(long, default_value = "1")]
        min_quality: String,

        /// Quality layers to include ("max" or a count)
        #[arg(long, default_value = "max")]
        max_quality: String,

        /// Progression order of the emitted codestream
        #[arg(short, long, default_value = "rpcl", value_enum)]
        progression: Progression,
    },

    /// Display the codestream structure recorded in a message dump
    #[command(visible_alias = "i")]
    Info {
        /// Input message dump file
        #[arg(short, long, help = "Path to the recorded JPIP message dump")]
        input: PathBuf,
    },
}

/// Layer-innermost progression orders the reconstructor can emit.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Progression {
    /// Resolution-position-component-layer
    Rpcl,
    /// Position-component-resolution-layer
    Pcrl,
    /// Component-position-resolution-layer
    Cprl,
}

impl From<Progression> for ProgressionOrder {
    fn from(value: Progression) -> Self {
        match value {
            Progression::Rpcl => Self::ResolutionPositionComponentLayer,
            Progression::Pcrl => Self::PositionComponentResolutionLayer,
            Progression::Cprl => Self::ComponentPositionResolutionLayer,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Reconstruct {
            input,
            output,
            min_x,
            min_y,
            max_x,
            max_y,
            levels_to_cut,
            min_quality,
            max_quality,
            progression,
        } => reconstruct(
            &input,
            &output,
            (min_x, min_y, max_x, max_y),
            levels_to_cut,
            &min_quality,
            &max_quality,
            progression,
        ),
        Commands::Info { input } => show_info(&input),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn reconstruct(
    input: &PathBuf,
    output: &PathBuf,
    region: (u64, u64, Option<u64>, Option<u64>),
    levels_to_cut: u8,
    min_quality: &str,
    max_quality: &str,
    progression: Progression,
) -> Result<(), Box<dyn std::error::Error>> {
    let (cache, _) = load_dump(input)?;
    let structure = parse_structure(&cache)?;

    let scale = 1u64 << levels_to_cut;
    let (min_x, min_y, max_x, max_y) = region;
    let params = CodestreamPartParams {
        min_x,
        min_y,
        max_x_exclusive: max_x.unwrap_or_else(|| structure.size().image_width().div_ceil(scale)),
        max_y_exclusive: max_y.unwrap_or_else(|| structure.size().image_height().div_ceil(scale)),
        levels_to_cut,
        min_num_quality_layers: parse_quality(min_quality)?,
        max_num_quality_layers: parse_quality(max_quality)?,
    };

    let quality = QualityLayerCache::new();
    let reconstructor = Reconstructor::new(&structure, &cache, &quality);
    match reconstructor.reconstruct(&params, progression.into())? {
        Some(bytes) => {
            fs::write(output, &bytes)?;
            println!("✓ Reconstructed {} bytes to {:?}", bytes.len(), output);
            Ok(())
        }
        None => Err("dump does not cover the tile headers of the requested region".into()),
    }
}

fn show_info(input: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let (cache, counts) = load_dump(input)?;

    println!("File: {:?}", input);
    println!("Messages:");
    for (class, count) in counts {
        println!("  {:?}: {}", class, count);
    }
    println!();

    let structure = parse_structure(&cache)?;
    let size = structure.size();
    let coding = structure.default_coding();
    println!("Codestream:");
    println!("  Dimensions: {}x{}", size.image_width(), size.image_height());
    println!("  Components: {}", structure.num_components());
    println!(
        "  Tile grid:  {}x{} tiles of {}x{}",
        size.num_tiles_x(),
        size.num_tiles_y(),
        size.tile_width,
        size.tile_height
    );
    println!("  Levels:     {}", coding.num_resolution_levels);
    println!("  Layers:     {}", coding.num_quality_layers);
    println!(
        "  Progression: {}",
        match coding.progression_order {
            ProgressionOrder::LayerResolutionComponentPosition => "LRCP",
            ProgressionOrder::ResolutionLayerComponentPosition => "RLCP",
            ProgressionOrder::ResolutionPositionComponentLayer => "RPCL",
            ProgressionOrder::PositionComponentResolutionLayer => "PCRL",
            ProgressionOrder::ComponentPositionResolutionLayer => "CPRL",
        }
    );
    Ok(())
}

// Internal helpers

fn load_dump(
    path: &PathBuf,
) -> Result<(DatabinCache, Vec<(DatabinClass, usize)>), Box<dyn std::error::Error>> {
    let data = fs::read(path)?;
    let cache = DatabinCache::new();
    let mut counts: Vec<(DatabinClass, usize)> = Vec::new();

    let mut at = 0usize;
    while at < data.len() {
        if data.len() - at < 22 {
            return Err("truncated message frame".into());
        }
        let class = DatabinClass::try_from(data[at])
            .map_err(|_| format!("unknown databin class id {}", data[at]))?;
        let in_class_index = u64::from_be_bytes(data[at + 1..at + 9].try_into()?);
        let body_start = u64::from_be_bytes(data[at + 9..at + 17].try_into()?);
        let body_length = u32::from_be_bytes(data[at + 17..at + 21].try_into()?) as usize;
        let is_last = data[at + 21] != 0;
        at += 22;
        if data.len() - at < body_length {
            return Err("truncated message body".into());
        }
        cache.push_message(
            MessageHeader {
                class,
                in_class_index,
                body_start,
                body_length: body_length as u64,
                is_last_byte_in_databin: is_last,
            },
            &data[at..at + body_length],
        )?;
        at += body_length;

        match counts.iter_mut().find(|(c, _)| *c == class) {
            Some((_, count)) => *count += 1,
            None => counts.push((class, 1)),
        }
    }
    Ok((cache, counts))
}

fn parse_structure(cache: &DatabinCache) -> Result<CodestreamStructure, Box<dyn std::error::Error>> {
    CodestreamStructure::from_main_header(&cache.main_header())?
        .ok_or_else(|| "dump does not contain a complete main header".into())
}

fn parse_quality(value: &str) -> Result<QualityLimit, Box<dyn std::error::Error>> {
    if value.eq_ignore_ascii_case("max") {
        Ok(QualityLimit::Max)
    } else {
        Ok(QualityLimit::Limited(value.parse()?))
    }
}
