//! Progressive readiness tracking: watches the databin cache and reports,
//! stage by stage, when a requested region can be reconstructed at
//! increasing quality.
//!
//! A request first waits for the tile-header databins of every tile the
//! region touches; precinct databins are subscribed only once their tile's
//! header is fully loaded, since the header may override the coding
//! parameters the precinct geometry depends on. Each delivered byte range
//! re-runs the affected precinct's packet parser, and a stage fires once
//! every in-part precinct has reached the stage's layer count.

use crate::cache::DatabinCache;
use crate::codestream::CodestreamStructure;
use crate::databin::{Databin, ListenerHandle};
use crate::error::JpipError;
use crate::quality_layers::{QualityLayerCache, QualityLayerParser};
use crate::region::{precincts_in_part, tiles_in_part, CodestreamPartParams, PrecinctIterator, QualityLimit};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// One quality stage of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressiveStage {
    pub min_num_quality_layers: QualityLimit,
    /// Target the tile's declared layer total even when the request caps
    /// quality below it.
    pub force_max_quality: bool,
}

impl ProgressiveStage {
    pub fn new(min_num_quality_layers: QualityLimit) -> Self {
        Self {
            min_num_quality_layers,
            force_max_quality: false,
        }
    }
}

/// The quality stages a request advances through, lowest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progressiveness {
    pub stages: Vec<ProgressiveStage>,
}

impl Default for Progressiveness {
    /// A first-layer preview stage followed by full quality.
    fn default() -> Self {
        Self {
            stages: vec![
                ProgressiveStage::new(QualityLimit::Limited(1)),
                ProgressiveStage::new(QualityLimit::Max),
            ],
        }
    }
}

impl Progressiveness {
    pub fn validate(&self) -> Result<(), JpipError> {
        if self.stages.is_empty() {
            return Err(JpipError::InvalidArgument(
                "progressiveness needs at least one stage",
            ));
        }
        let mut previous: Option<QualityLimit> = None;
        for stage in &self.stages {
            match (previous, stage.min_num_quality_layers) {
                (Some(QualityLimit::Max), _) => {
                    return Err(JpipError::InvalidArgument(
                        "no stage may follow a full-quality stage",
                    ));
                }
                (Some(QualityLimit::Limited(a)), QualityLimit::Limited(b)) if b <= a => {
                    return Err(JpipError::InvalidArgument(
                        "stage layer counts must be strictly increasing",
                    ));
                }
                _ => {}
            }
            previous = Some(stage.min_num_quality_layers);
        }
        Ok(())
    }
}

/// Snapshot handed to the listener on every stage advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressiveStatus {
    pub stages_reached: usize,
    pub total_stages: usize,
    /// Minimum layer count reached across all in-part precincts; monotonic.
    pub min_layer_reached: u32,
    pub done: bool,
}

pub type ProgressiveListener = Box<dyn Fn(&ProgressiveStatus) + Send + Sync>;

struct PrecinctTracker {
    parser: Arc<Mutex<QualityLayerParser>>,
    databin: Arc<Databin>,
    listener_handle: ListenerHandle,
    /// Layer count each stage requires from this precinct.
    stage_targets: Vec<u32>,
    reached: u32,
}

struct RequestState {
    /// Tile-header subscriptions for tiles whose header is still partial.
    pending_tiles: HashMap<u64, (Arc<Databin>, ListenerHandle)>,
    precincts: HashMap<u64, PrecinctTracker>,
    /// Per stage, how many precincts already satisfy it.
    stage_counts: Vec<usize>,
    stages_reached: usize,
    cancelled: bool,
    error: Option<JpipError>,
}

struct RequestInner {
    structure: Arc<CodestreamStructure>,
    databins: Arc<DatabinCache>,
    quality: Arc<QualityLayerCache>,
    params: CodestreamPartParams,
    stages: Vec<ProgressiveStage>,
    listener: ProgressiveListener,
    state: Mutex<RequestState>,
}

/// One in-flight progressive readiness request. Dropping it unsubscribes
/// from every databin it watches.
pub struct ProgressiveRequest {
    inner: Arc<RequestInner>,
}

impl ProgressiveRequest {
    pub fn new(
        structure: Arc<CodestreamStructure>,
        databins: Arc<DatabinCache>,
        quality: Arc<QualityLayerCache>,
        params: CodestreamPartParams,
        progressiveness: Progressiveness,
        listener: ProgressiveListener,
    ) -> Result<Self, JpipError> {
        progressiveness.validate()?;
        params.validate(&structure)?;
        let stage_count = progressiveness.stages.len();
        let inner = Arc::new(RequestInner {
            structure,
            databins,
            quality,
            params,
            stages: progressiveness.stages,
            listener,
            state: Mutex::new(RequestState {
                pending_tiles: HashMap::new(),
                precincts: HashMap::new(),
                stage_counts: vec![0; stage_count],
                stages_reached: 0,
                cancelled: false,
                error: None,
            }),
        });
        RequestInner::start(&inner)?;
        Ok(Self { inner })
    }

    pub fn status(&self) -> ProgressiveStatus {
        let state = self.inner.lock_state();
        self.inner.status_of(&state)
    }

    /// First error hit while reacting to databin updates, if any. Such an
    /// error stops the request; it will not advance further.
    pub fn error(&self) -> Option<JpipError> {
        self.inner.lock_state().error.clone()
    }

    /// Unsubscribe from all databins. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

impl Drop for ProgressiveRequest {
    fn drop(&mut self) {
        self.inner.cancel();
    }
}

impl RequestInner {
    fn lock_state(&self) -> MutexGuard<'_, RequestState> {
        // Listener closures never panic while holding the lock.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn start(inner: &Arc<Self>) -> Result<(), JpipError> {
        let tiles = tiles_in_part(&inner.structure, &inner.params);
        let tiles_per_row = inner.structure.size().num_tiles_x();
        let events = {
            let mut state = inner.lock_state();
            for tile_index in tiles.iter(tiles_per_row) {
                let header = inner.databins.tile_header(tile_index);
                if header.is_fully_loaded() {
                    Self::setup_tile(inner, &mut state, tile_index)?;
                } else {
                    let weak = Arc::downgrade(inner);
                    let handle = header.add_listener(Box::new(move |_| {
                        if let Some(inner) = weak.upgrade() {
                            RequestInner::on_tile_header(&inner, tile_index);
                        }
                    }));
                    state
                        .pending_tiles
                        .insert(tile_index, (Arc::clone(&header), handle));
                    // The header may have completed between the check and
                    // the subscription.
                    if header.is_fully_loaded() {
                        if let Some((databin, handle)) = state.pending_tiles.remove(&tile_index) {
                            databin.remove_listener(handle);
                        }
                        Self::setup_tile(inner, &mut state, tile_index)?;
                    }
                }
            }
            inner.advance_stages(&mut state)
        };
        inner.fire(&events);
        Ok(())
    }

    /// Tile-header databin update; sets the tile up once fully loaded.
    fn on_tile_header(inner: &Arc<Self>, tile_index: u64) {
        let events = {
            let mut state = inner.lock_state();
            if state.cancelled || state.error.is_some() {
                return;
            }
            if !state.pending_tiles.contains_key(&tile_index)
                || !inner.databins.tile_header(tile_index).is_fully_loaded()
            {
                return;
            }
            if let Some((databin, handle)) = state.pending_tiles.remove(&tile_index) {
                databin.remove_listener(handle);
            }
            if let Err(err) = Self::setup_tile(inner, &mut state, tile_index) {
                log::error!("progressive request stopped on tile {tile_index}: {err}");
                state.error = Some(err);
                return;
            }
            inner.advance_stages(&mut state)
        };
        inner.fire(&events);
    }

    /// Build the tile's precinct trackers and subscribe their databins.
    fn setup_tile(
        inner: &Arc<Self>,
        state: &mut RequestState,
        tile_index: u64,
    ) -> Result<(), JpipError> {
        let header = inner.databins.tile_header(tile_index);
        let Some(tile) = inner.structure.tile_structure(tile_index, &header)? else {
            debug_assert!(false, "tile header not loaded in setup");
            return Err(JpipError::InternalInconsistency(
                "tile set up before its header was loaded",
            ));
        };
        let ranges = precincts_in_part(&inner.structure, &tile, tile_index, &inner.params);
        let iter = PrecinctIterator::new(
            Arc::clone(&tile),
            tile_index,
            tile.coding.progression_order,
            inner.params.levels_to_cut,
            Some(ranges),
            false,
        )?;
        for step in iter {
            let in_class_index = step.position.in_class_index(&inner.structure, &tile);
            if state.precincts.contains_key(&in_class_index) {
                continue;
            }
            let parser =
                inner
                    .quality
                    .parser(&inner.structure, &tile, &step.position, &inner.databins)?;
            let declared = parser.lock().map_or_else(
                |_| {
                    Err(JpipError::InternalInconsistency(
                        "quality layer parser lock poisoned",
                    ))
                },
                |parser| Ok(parser.declared_layers()),
            )?;
            let cap = inner.params.max_num_quality_layers.resolve(declared);
            let stage_targets: Vec<u32> = inner
                .stages
                .iter()
                .map(|stage| {
                    if stage.force_max_quality {
                        declared
                    } else {
                        stage.min_num_quality_layers.resolve(declared).min(cap)
                    }
                })
                .collect();

            let databin = inner.databins.precinct(in_class_index);
            let weak = Arc::downgrade(inner);
            let listener_handle = databin.add_listener(Box::new(move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_precinct(in_class_index);
                }
            }));
            let mut tracker = PrecinctTracker {
                parser,
                databin,
                listener_handle,
                stage_targets,
                reached: 0,
            };
            Self::reparse(&mut tracker, &mut state.stage_counts)?;
            state.precincts.insert(in_class_index, tracker);
        }
        Ok(())
    }

    /// Precinct databin update; re-runs its packet parser.
    fn on_precinct(&self, in_class_index: u64) {
        let events = {
            let mut state = self.lock_state();
            if state.cancelled || state.error.is_some() {
                return;
            }
            let RequestState {
                precincts,
                stage_counts,
                ..
            } = &mut *state;
            let Some(tracker) = precincts.get_mut(&in_class_index) else {
                return;
            };
            if let Err(err) = Self::reparse(tracker, stage_counts) {
                log::error!("progressive request stopped on precinct {in_class_index}: {err}");
                state.error = Some(err);
                return;
            }
            self.advance_stages(&mut state)
        };
        self.fire(&events);
    }

    /// Parse as far as the data allows and update the stage counts with any
    /// newly satisfied stages.
    fn reparse(tracker: &mut PrecinctTracker, stage_counts: &mut [usize]) -> Result<(), JpipError> {
        let max_target = tracker.stage_targets.iter().copied().max().unwrap_or(0);
        let reached = tracker
            .parser
            .lock()
            .map_err(|_| JpipError::InternalInconsistency("quality layer parser lock poisoned"))?
            .parse_up_to(max_target)?;
        if reached > tracker.reached {
            for (stage, &target) in tracker.stage_targets.iter().enumerate() {
                if tracker.reached < target && reached >= target {
                    stage_counts[stage] += 1;
                }
            }
            tracker.reached = reached;
        }
        Ok(())
    }

    /// Advance through newly satisfied stages; one status event per stage.
    fn advance_stages(&self, state: &mut RequestState) -> Vec<ProgressiveStatus> {
        let mut events = Vec::new();
        if !state.pending_tiles.is_empty() {
            return events;
        }
        let total = state.precincts.len();
        while state.stages_reached < self.stages.len()
            && state.stage_counts[state.stages_reached] == total
        {
            state.stages_reached += 1;
            events.push(self.status_of(state));
        }
        events
    }

    fn status_of(&self, state: &RequestState) -> ProgressiveStatus {
        ProgressiveStatus {
            stages_reached: state.stages_reached,
            total_stages: self.stages.len(),
            min_layer_reached: state
                .precincts
                .values()
                .map(|tracker| tracker.reached)
                .min()
                .unwrap_or(0),
            done: state.pending_tiles.is_empty() && state.stages_reached == self.stages.len(),
        }
    }

    fn fire(&self, events: &[ProgressiveStatus]) {
        for event in events {
            (self.listener)(event);
        }
    }

    fn cancel(&self) {
        let (tiles, precincts) = {
            let mut state = self.lock_state();
            state.cancelled = true;
            (
                state.pending_tiles.drain().collect::<Vec<_>>(),
                state
                    .precincts
                    .drain()
                    .map(|(_, tracker)| (tracker.databin, tracker.listener_handle))
                    .collect::<Vec<_>>(),
            )
        };
        for (_, (databin, handle)) in tiles {
            databin.remove_listener(handle);
        }
        for (databin, handle) in precincts {
            databin.remove_listener(handle);
        }
    }
}
