//! Databin cache and transport-facing message routing.
//!
//! The transport layer (out of scope here) delivers JPIP messages of
//! `{class, in-class index, byte range, is-last flag}` plus body bytes.
//! This module routes each message to its databin, creating bins lazily on
//! first reference.

use crate::databin::{Databin, DatabinClass, DatabinId};
use crate::error::JpipError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Header of one JPIP stream message (ISO/IEC 15444-9 A.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub class: DatabinClass,
    pub in_class_index: u64,
    pub body_start: u64,
    pub body_length: u64,
    /// Set when this message carries the final byte of the bin, which fixes
    /// the bin's total length.
    pub is_last_byte_in_databin: bool,
}

/// Lazily populated map from databin identity to databin.
///
/// Bins are created on first reference and never removed; multiple requests
/// share the same bins and observe one monotonically growing view.
#[derive(Default)]
pub struct DatabinCache {
    bins: Mutex<HashMap<DatabinId, Arc<Databin>>>,
}

impl DatabinCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the bin for `id`, creating it if this is the first reference.
    pub fn databin(&self, id: DatabinId) -> Arc<Databin> {
        let mut bins = self.bins.lock().expect("databin cache lock poisoned");
        Arc::clone(bins.entry(id).or_insert_with(|| Arc::new(Databin::new(id))))
    }

    pub fn main_header(&self) -> Arc<Databin> {
        self.databin(DatabinId {
            class: DatabinClass::MainHeader,
            in_class_index: 0,
        })
    }

    pub fn tile_header(&self, tile_index: u64) -> Arc<Databin> {
        self.databin(DatabinId {
            class: DatabinClass::TileHeader,
            in_class_index: tile_index,
        })
    }

    pub fn precinct(&self, in_class_index: u64) -> Arc<Databin> {
        self.databin(DatabinId {
            class: DatabinClass::Precinct,
            in_class_index,
        })
    }

    /// Whether any bin of `class` has been referenced or delivered.
    pub fn contains_class(&self, class: DatabinClass) -> bool {
        self.bins
            .lock()
            .expect("databin cache lock poisoned")
            .keys()
            .any(|id| id.class == class)
    }

    /// Route one delivered message into its databin.
    pub fn push_message(&self, header: MessageHeader, body: &[u8]) -> Result<(), JpipError> {
        if body.len() as u64 != header.body_length {
            return Err(JpipError::InvalidArgument(
                "message body length does not match its header",
            ));
        }
        let bin = self.databin(DatabinId {
            class: header.class,
            in_class_index: header.in_class_index,
        });
        bin.insert_range(header.body_start, body)?;
        if header.is_last_byte_in_databin {
            bin.mark_known_length(header.body_start + header.body_length)?;
        }
        Ok(())
    }
}
