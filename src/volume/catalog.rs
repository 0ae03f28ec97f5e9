//! Brick catalog - the single source of truth for which bricks exist
//!
//! One [`BrickEntry`] per `(level, bx, by, bz)` of the pyramid. State lives
//! in an atomic tag shared with decode workers, so a worker can check that
//! its ticket is still wanted without taking a lock. Every transition is a
//! compare-and-swap from one expected state, which keeps two transitions
//! for the same key from racing.

use crate::core::error::Error;
use crate::core::types::{BrickKey, Mat4, Result};
use crate::math::Aabb;
use crate::volume::pyramid::{PyramidDescriptor, SourceLocator};
use std::collections::HashMap;
use std::ops::RangeBounds;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

/// State of a brick in the catalog
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BrickState {
    /// No payload on the GPU, not requested
    Unloaded = 0,
    /// Decode in flight
    Loading = 1,
    /// Uploaded and usable
    Resident = 2,
    /// Payload still resident, derived geometry out of date
    Stale = 3,
}

impl BrickState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => BrickState::Loading,
            2 => BrickState::Resident,
            3 => BrickState::Stale,
            _ => BrickState::Unloaded,
        }
    }

    /// Resident or Stale: a GPU handle exists
    pub fn has_payload(self) -> bool {
        matches!(self, BrickState::Resident | BrickState::Stale)
    }
}

/// Atomic brick state plus load generation, shared with worker tickets
#[derive(Clone, Debug, Default)]
pub struct StateTag {
    state: Arc<AtomicU8>,
    generation: Arc<AtomicU64>,
}

impl StateTag {
    pub fn get(&self) -> BrickState {
        BrickState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Move `from -> to`; false if the current state is not `from`
    pub fn transition(&self, from: BrickState, to: BrickState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// True while this generation's load is still the wanted one
    pub fn is_current(&self, generation: u64) -> bool {
        self.get() == BrickState::Loading && self.generation() == generation
    }

    /// Unloaded -> Loading, returning the new load generation
    fn begin_load(&self) -> Option<u64> {
        if self.transition(BrickState::Unloaded, BrickState::Loading) {
            Some(self.generation.fetch_add(1, Ordering::AcqRel) + 1)
        } else {
            None
        }
    }

    /// Drop whatever the brick holds or is waiting for.
    ///
    /// Bumping the generation orphans any in-flight decode.
    fn reset(&self) -> BrickState {
        self.generation.fetch_add(1, Ordering::AcqRel);
        BrickState::from_u8(self.state.swap(BrickState::Unloaded as u8, Ordering::AcqRel))
    }
}

/// Catalog record for one brick
#[derive(Clone, Debug)]
pub struct BrickEntry {
    pub key: BrickKey,
    tag: StateTag,
    /// Lower = load first
    pub priority: f32,
    /// Frame in which the renderer last asked for this brick
    pub last_requested: u64,
    /// The brick has been Resident at least once
    pub ever_resident: bool,
    /// Decoded payload was all zero
    pub known_empty: bool,
    pub locator: SourceLocator,
    /// Brick box in the unit cube
    pub bounds: Aabb,
    /// Brick box in world space, valid for `geometry_revision`
    pub world_bounds: Aabb,
    pub geometry_revision: u64,
}

impl BrickEntry {
    pub fn state(&self) -> BrickState {
        self.tag.get()
    }

    /// Shared handle for worker tickets
    pub fn tag(&self) -> &StateTag {
        &self.tag
    }

    pub fn generation(&self) -> u64 {
        self.tag.generation()
    }

    /// Unloaded -> Loading; returns the load generation on success
    pub fn begin_load(&mut self) -> Option<u64> {
        let generation = self.tag.begin_load()?;
        log::trace!("{} Unloaded -> Loading (gen {})", self.key, generation);
        Some(generation)
    }

    /// Loading -> Resident if `generation` is still the wanted load
    pub fn finish_load(&mut self, generation: u64) -> bool {
        if self.tag.generation() != generation
            || !self.tag.transition(BrickState::Loading, BrickState::Resident)
        {
            return false;
        }
        self.ever_resident = true;
        log::trace!("{} Loading -> Resident", self.key);
        true
    }

    /// Loading -> Unloaded after a failed or discarded load
    pub fn abort_load(&mut self, generation: u64) -> bool {
        if self.tag.generation() != generation
            || !self.tag.transition(BrickState::Loading, BrickState::Unloaded)
        {
            return false;
        }
        log::trace!("{} Loading -> Unloaded", self.key);
        true
    }

    /// Any state -> Unloaded; returns the previous state
    pub fn evict(&mut self) -> BrickState {
        let previous = self.tag.reset();
        log::trace!("{} {:?} -> Unloaded", self.key, previous);
        previous
    }
}

/// In-memory index of every brick of a dataset
#[derive(Debug)]
pub struct BrickCatalog {
    entries: HashMap<BrickKey, BrickEntry>,
    level_count: u32,
    geometry_revision: u64,
}

impl BrickCatalog {
    /// Populate one Unloaded entry per brick of every level
    pub fn build(desc: &PyramidDescriptor) -> Result<Self> {
        desc.validate()?;
        let mut entries = HashMap::with_capacity(desc.total_bricks());
        for (l, level) in desc.levels.iter().enumerate() {
            let grid = level.grid();
            for bz in 0..grid.z {
                for by in 0..grid.y {
                    for bx in 0..grid.x {
                        let key = BrickKey::new(l as u32, bx, by, bz);
                        let (Some(bounds), Some(locator)) = (desc.brick_bounds(key), desc.locator(key)) else {
                            return Err(Error::InvalidDescriptor(format!("brick {key} has no layout")));
                        };
                        entries.insert(key, BrickEntry {
                            key,
                            tag: StateTag::default(),
                            priority: f32::MAX,
                            last_requested: 0,
                            ever_resident: false,
                            known_empty: false,
                            locator,
                            bounds,
                            world_bounds: bounds,
                            geometry_revision: 0,
                        });
                    }
                }
            }
        }
        log::info!(
            "Built brick catalog: {} levels, {} bricks",
            desc.level_count(),
            entries.len()
        );
        Ok(Self {
            entries,
            level_count: desc.level_count(),
            geometry_revision: 0,
        })
    }

    /// Entry for a key; `None` for keys outside the grid
    pub fn lookup(&self, key: BrickKey) -> Option<&BrickEntry> {
        self.entries.get(&key)
    }

    pub fn lookup_mut(&mut self, key: BrickKey) -> Option<&mut BrickEntry> {
        self.entries.get_mut(&key)
    }

    pub fn contains(&self, key: BrickKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn level_count(&self) -> u32 {
        self.level_count
    }

    pub fn geometry_revision(&self) -> u64 {
        self.geometry_revision
    }

    pub fn iter(&self) -> impl Iterator<Item = &BrickEntry> {
        self.entries.values()
    }

    /// Keys of one level, sorted
    pub fn keys_at_level(&self, level: u32) -> Vec<BrickKey> {
        let mut keys: Vec<_> = self.entries.keys().filter(|k| k.level == level).copied().collect();
        keys.sort();
        keys
    }

    /// Number of entries currently in `state`
    pub fn count_in(&self, state: BrickState) -> usize {
        self.entries.values().filter(|e| e.state() == state).count()
    }

    /// Flag Resident entries on the given levels as Stale.
    ///
    /// Only the state changes; GPU handles stay with the resident set.
    /// Returns the number of entries marked.
    pub fn mark_stale(&mut self, levels: impl RangeBounds<u32>) -> usize {
        let mut marked = 0;
        for entry in self.entries.values_mut() {
            if levels.contains(&entry.key.level)
                && entry.tag.transition(BrickState::Resident, BrickState::Stale)
            {
                marked += 1;
            }
        }
        log::debug!("Marked {} bricks stale", marked);
        marked
    }

    /// Recompute world bounds from a unit-cube-to-world transform and
    /// return Stale entries to Resident
    pub fn refresh_geometry(&mut self, transform: &Mat4, revision: u64) -> usize {
        let mut refreshed = 0;
        for entry in self.entries.values_mut() {
            entry.world_bounds = entry.bounds.transformed(transform);
            entry.geometry_revision = revision;
            if entry.tag.transition(BrickState::Stale, BrickState::Resident) {
                refreshed += 1;
            }
        }
        self.geometry_revision = revision;
        refreshed
    }
}
