//! End-to-end path: JPIP messages pushed into the cache, progressive
//! readiness stages firing as data arrives, then codestream reconstruction
//! and header-free collection over the same cache.

use jpipexp_rs::collector::PacketCollector;
use jpipexp_rs::progressive::{ProgressiveRequest, ProgressiveStatus, Progressiveness};
use jpipexp_rs::{
    CodestreamPartParams, CodestreamStructure, DatabinCache, DatabinClass, MessageHeader,
    ProgressionOrder, QualityLayerCache, QualityLimit, Reconstructor,
};
use std::sync::{Arc, Mutex};

/// Main header of a 64x64 single-tile, one-component codestream: RPCL,
/// 2 quality layers, 1 decomposition level, 64x64 precincts.
fn main_header_bytes() -> Vec<u8> {
    let mut bytes = vec![0xFF, 0x4F];

    // SIZ
    bytes.extend_from_slice(&[0xFF, 0x51]);
    bytes.extend_from_slice(&41u16.to_be_bytes());
    bytes.extend_from_slice(&0u16.to_be_bytes()); // Rsiz
    for value in [64u32, 64, 0, 0, 64, 64, 0, 0] {
        bytes.extend_from_slice(&value.to_be_bytes());
    }
    bytes.extend_from_slice(&1u16.to_be_bytes()); // Csiz
    bytes.extend_from_slice(&[0x07, 0x01, 0x01]);

    // COD
    bytes.extend_from_slice(&[0xFF, 0x52]);
    bytes.extend_from_slice(&14u16.to_be_bytes());
    bytes.push(0x01); // Scod: precincts defined
    bytes.push(0x02); // RPCL
    bytes.extend_from_slice(&2u16.to_be_bytes()); // layers
    bytes.push(0x00); // MCT
    bytes.push(0x01); // decomposition levels
    bytes.extend_from_slice(&[0x04, 0x04]); // 64x64 codeblocks
    bytes.push(0x00); // codeblock style
    bytes.push(0x01); // 5-3 reversible
    bytes.extend_from_slice(&[0x66, 0x66]); // 64x64 precincts

    // QCD
    bytes.extend_from_slice(&[0xFF, 0x5C]);
    bytes.extend_from_slice(&7u16.to_be_bytes());
    bytes.push(0x40); // no quantization, 2 guard bits
    bytes.extend_from_slice(&[0x48, 0x48, 0x48, 0x48]);

    bytes
}

/// LL precinct: layer 0 includes the single codeblock (1 pass, 2-byte
/// body), layer 1 is empty.
const LL_PRECINCT: [u8; 4] = [0xE2, 0xB0, 0xB1, 0x00];
/// Resolution-1 precinct: two empty packets.
const RES1_PRECINCT: [u8; 2] = [0x00, 0x00];

fn push(cache: &DatabinCache, class: DatabinClass, index: u64, start: u64, bytes: &[u8], last: bool) {
    cache
        .push_message(
            MessageHeader {
                class,
                in_class_index: index,
                body_start: start,
                body_length: bytes.len() as u64,
                is_last_byte_in_databin: last,
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
fn test_messages_to_codestream() {
    let cache = Arc::new(DatabinCache::new());
    push(&cache, DatabinClass::MainHeader, 0, 0, &main_header_bytes(), true);
    push(&cache, DatabinClass::TileHeader, 0, 0, &[], true);

    let structure = Arc::new(
        CodestreamStructure::from_main_header(&cache.main_header())
            .unwrap()
            .unwrap(),
    );
    let quality = Arc::new(QualityLayerCache::new());

    let events: Arc<Mutex<Vec<ProgressiveStatus>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let request = ProgressiveRequest::new(
        Arc::clone(&structure),
        Arc::clone(&cache),
        Arc::clone(&quality),
        full_part(),
        Progressiveness::default(),
        Box::new(move |status| sink.lock().unwrap().push(*status)),
    )
    .unwrap();

    // Layer 0 of both precincts: the preview stage fires.
    push(&cache, DatabinClass::Precinct, 0, 0, &LL_PRECINCT[..3], false);
    push(&cache, DatabinClass::Precinct, 1, 0, &RES1_PRECINCT[..1], false);
    assert_eq!(events.lock().unwrap().len(), 1);
    assert_eq!(request.status().min_layer_reached, 1);
    assert!(!request.status().done);

    // Remaining bytes: full quality reached.
    push(&cache, DatabinClass::Precinct, 0, 3, &LL_PRECINCT[3..], true);
    push(&cache, DatabinClass::Precinct, 1, 1, &RES1_PRECINCT[1..], true);
    assert!(request.status().done);
    assert_eq!(events.lock().unwrap().len(), 2);
    assert_eq!(request.error(), None);

    // Reconstruct: original main header, a comment, one renumbered
    // tile-part carrying both precincts' packets, EOC.
    let reconstructor = Reconstructor::new(&structure, &cache, &quality);
    let bytes = reconstructor
        .reconstruct(&full_part(), ProgressionOrder::ResolutionPositionComponentLayer)
        .unwrap()
        .unwrap();

    let header = main_header_bytes();
    assert_eq!(&bytes[..header.len()], &header[..]);
    // COM directly after the copied main header.
    let mut at = header.len();
    assert_eq!(&bytes[at..at + 2], &[0xFF, 0x64]);
    at += 2 + u16::from_be_bytes([bytes[at + 2], bytes[at + 3]]) as usize;
    // SOT for tile 0, Psot covering SOT + SOD + 6 packet bytes.
    assert_eq!(&bytes[at..at + 6], &[0xFF, 0x90, 0x00, 0x0A, 0x00, 0x00]);
    assert_eq!(&bytes[at + 6..at + 10], &20u32.to_be_bytes());
    assert_eq!(&bytes[at + 10..at + 12], &[0x00, 0x01]);
    assert_eq!(&bytes[at + 12..at + 14], &[0xFF, 0x93]);
    assert_eq!(&bytes[at + 14..at + 18], &LL_PRECINCT);
    assert_eq!(&bytes[at + 18..at + 20], &RES1_PRECINCT);
    assert_eq!(&bytes[at + 20..], &[0xFF, 0xD9]);

    // Header-free collection of the same part.
    let collector = PacketCollector::new(&structure, &cache, &quality);
    let part = collector.collect(&full_part()).unwrap().unwrap();
    assert_eq!(part.precincts.len(), 2);
    assert_eq!(part.precincts[0].codeblocks.len(), 1);
    assert_eq!(part.precincts[0].codeblocks[0].coding_passes, 1);
    assert_eq!(part.data.copy_range(0, 2), [0xB0, 0xB1]);
}

#[test]
fn test_reconstruction_waits_for_tile_header() {
    let cache = DatabinCache::new();
    push(&cache, DatabinClass::MainHeader, 0, 0, &main_header_bytes(), true);
    let structure = CodestreamStructure::from_main_header(&cache.main_header())
        .unwrap()
        .unwrap();
    let quality = QualityLayerCache::new();
    let reconstructor = Reconstructor::new(&structure, &cache, &quality);
    assert!(reconstructor
        .reconstruct(&full_part(), ProgressionOrder::ResolutionPositionComponentLayer)
        .unwrap()
        .is_none());

    // Once the tile header arrives but no precinct data, the configured
    // minimum of one layer cannot be met.
    push(&cache, DatabinClass::TileHeader, 0, 0, &[], true);
    assert_eq!(
        reconstructor
            .reconstruct(&full_part(), ProgressionOrder::ResolutionPositionComponentLayer)
            .unwrap_err(),
        jpipexp_rs::JpipError::MinimumQualityNotReached
    );
}
