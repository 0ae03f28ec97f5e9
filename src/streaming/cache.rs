//! Resident set - the bounded pool of GPU-resident bricks
//!
//! Each frame the renderer declares the bricks it wants and how urgently.
//! The resident set picks the most urgent bricks that fit the memory budget,
//! evicts what no longer fits, and admits new loads within the response-time
//! window. Decoded buffers come back through [`ResidentSet::complete`], which
//! uploads them on the calling (render) thread.
//!
//! Eviction order when room is needed:
//! 1. bricks not requested this frame, least recently requested first, ties
//!    broken by largest footprint first;
//! 2. requested bricks that did not make the wanted set, least urgent first.
//!
//! Bricks pinned by the renderer are never evicted.

use crate::core::error::Error;
use crate::core::types::{BrickKey, Result};
use crate::streaming::budget::BrickBudget;
use crate::streaming::config::CacheConfig;
use crate::streaming::gpu::TextureUploader;
use crate::streaming::loader::{LoadOutcome, LoadResult, LoadTicket};
use crate::streaming::priority::{AdmissionCandidate, AdmissionQueue};
use crate::volume::buffer::VoxelBuffer;
use crate::volume::catalog::{BrickCatalog, BrickState};
use crate::volume::pyramid::PyramidDescriptor;
use std::collections::{HashMap, HashSet};

/// Priority given to requested keys missing from the priority map
pub const DEFAULT_PRIORITY: f32 = f32::MAX;

/// Weight of the newest sample in the decode-time estimate
const DECODE_ESTIMATE_ALPHA: f32 = 0.2;

/// A texture owned by the resident set
#[derive(Debug)]
pub struct ResidentTexture<H> {
    pub handle: H,
    pub bytes: u64,
    /// Render passes currently using the handle
    pub ref_count: u32,
}

#[derive(Clone, Copy, Debug)]
struct InFlight {
    generation: u64,
    reserved: u64,
}

/// What one `request_visible` call decided
#[derive(Debug, Default)]
pub struct FrameReport {
    pub frame: u64,
    /// Loads admitted this frame, to be handed to a loader
    pub tickets: Vec<LoadTicket>,
    /// Resident bricks released this frame
    pub evicted: Vec<BrickKey>,
    /// Loads abandoned because their brick dropped out of the wanted set
    pub cancelled: Vec<BrickKey>,
    /// Wanted bricks left for a later frame
    pub deferred: usize,
    /// Wanted bricks skipped as known empty
    pub skipped_empty: usize,
    pub ignored_out_of_range: usize,
}

/// Running counters
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CacheStats {
    pub frame: u64,
    pub resident: usize,
    pub loading: usize,
    pub used_bytes: u64,
    pub pending_bytes: u64,
    pub budget_bytes: u64,
    pub loads_started: u64,
    pub loads_completed: u64,
    pub decode_failures: u64,
    pub allocation_failures: u64,
    pub discarded: u64,
    pub evictions: u64,
    pub decode_estimate_ms: f32,
}

/// Budgeted set of resident brick textures
pub struct ResidentSet<U: TextureUploader> {
    config: CacheConfig,
    uploader: U,
    budget: BrickBudget,
    textures: HashMap<BrickKey, ResidentTexture<U::Handle>>,
    in_flight: HashMap<BrickKey, InFlight>,
    /// Bricks chosen by the latest frame
    wanted: HashSet<BrickKey>,
    errors: Vec<Error>,
    frame: u64,
    decode_estimate_ms: f32,
    stats: CacheStats,
}

impl<U: TextureUploader> ResidentSet<U> {
    /// Create a resident set for one dataset
    ///
    /// Fails with `BudgetExceededByReservation` if the budget cannot hold
    /// the largest brick of the pyramid.
    pub fn new(config: CacheConfig, uploader: U, desc: &PyramidDescriptor) -> Result<Self> {
        Self::check_config(&config, desc)?;
        log::info!(
            "Resident set: budget {} bytes, response window {} ms",
            config.budget_bytes(),
            config.response_time_ms
        );
        Ok(Self {
            budget: BrickBudget::new(config.budget_bytes()),
            decode_estimate_ms: config.initial_decode_estimate_ms,
            config,
            uploader,
            textures: HashMap::new(),
            in_flight: HashMap::new(),
            wanted: HashSet::new(),
            errors: Vec::new(),
            frame: 0,
            stats: CacheStats::default(),
        })
    }

    fn check_config(config: &CacheConfig, desc: &PyramidDescriptor) -> Result<()> {
        config.validate()?;
        if desc.brick_edge > config.brick_edge {
            return Err(Error::InvalidConfig(format!(
                "pyramid brick edge {} exceeds configured brick edge {}",
                desc.brick_edge, config.brick_edge
            )));
        }
        let minimum = desc.max_brick_bytes() as u64;
        if config.budget_bytes() < minimum {
            return Err(Error::BudgetExceededByReservation {
                budget_bytes: config.budget_bytes(),
                minimum_bytes: minimum,
            });
        }
        Ok(())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Replace the configuration and re-evaluate the budget immediately.
    ///
    /// Returns the keys evicted to fit the new budget.
    pub fn set_config(
        &mut self,
        config: CacheConfig,
        catalog: &mut BrickCatalog,
        desc: &PyramidDescriptor,
    ) -> Result<Vec<BrickKey>> {
        Self::check_config(&config, desc)?;
        self.budget.set_budget(config.budget_bytes());
        self.config = config;

        // Re-run the wanted selection against the new limit using the
        // priorities already stored in the catalog
        let mut queue = AdmissionQueue::new();
        for &key in &self.wanted {
            if let (Some(entry), Some(bytes)) = (catalog.lookup(key), desc.brick_bytes(key)) {
                queue.push(AdmissionCandidate { key, priority: entry.priority, bytes: bytes as u64 });
            }
        }
        let requested: HashSet<BrickKey> = self.wanted.clone();
        let (wanted, _) = self.select_wanted(queue.into_sorted(), catalog);
        self.wanted = wanted;

        let mut cancelled = Vec::new();
        self.cancel_unwanted(catalog, &mut cancelled);
        let mut evicted = Vec::new();
        self.make_room(catalog, &requested, 0, &mut evicted);
        log::debug!(
            "Config updated: budget {} bytes, {} evicted, {} cancelled",
            self.budget.budget(),
            evicted.len(),
            cancelled.len()
        );
        Ok(evicted)
    }

    /// Declare the bricks wanted this frame. Never blocks.
    ///
    /// Keys outside the catalog are ignored. Missing priorities default to
    /// [`DEFAULT_PRIORITY`].
    pub fn request_visible<I>(
        &mut self,
        catalog: &mut BrickCatalog,
        desc: &PyramidDescriptor,
        keys: I,
        priorities: &HashMap<BrickKey, f32>,
    ) -> FrameReport
    where
        I: IntoIterator<Item = BrickKey>,
    {
        self.frame += 1;
        let mut report = FrameReport { frame: self.frame, ..Default::default() };

        // Update catalog entries for every valid request
        let mut requested = HashSet::new();
        let mut queue = AdmissionQueue::new();
        for key in keys {
            let (Some(entry), Some(bytes)) = (catalog.lookup_mut(key), desc.brick_bytes(key)) else {
                report.ignored_out_of_range += 1;
                log::trace!("Ignoring out-of-range request {}", key);
                continue;
            };
            if !requested.insert(key) {
                continue;
            }
            entry.priority = priorities.get(&key).copied().unwrap_or(DEFAULT_PRIORITY);
            entry.last_requested = self.frame;
            queue.push(AdmissionCandidate { key, priority: entry.priority, bytes: bytes as u64 });
        }

        let ordered = queue.into_sorted();
        let (wanted, skipped) = self.select_wanted(ordered.clone(), catalog);
        report.skipped_empty = skipped;
        self.wanted = wanted;

        self.cancel_unwanted(catalog, &mut report.cancelled);

        let needed: u64 = ordered
            .iter()
            .filter(|c| self.wanted.contains(&c.key))
            .filter(|c| catalog.lookup(c.key).is_some_and(|e| e.state() == BrickState::Unloaded))
            .map(|c| c.bytes)
            .sum();
        self.make_room(catalog, &requested, needed, &mut report.evicted);

        self.admit(catalog, desc, &ordered, &mut report);

        if self.budget.over_budget() {
            log::warn!(
                "Resident set over budget ({} of {} bytes), pinned bricks hold the excess",
                self.budget.committed(),
                self.budget.budget()
            );
        }
        log::debug!(
            "Frame {}: {} requested, {} wanted, {} admitted, {} deferred, {} evicted, {} ignored",
            self.frame,
            requested.len(),
            self.wanted.len(),
            report.tickets.len(),
            report.deferred,
            report.evicted.len(),
            report.ignored_out_of_range
        );
        report
    }

    /// Greedy prefix of the ordered requests that fits the budget, after
    /// what pinned bricks outside the request already hold
    fn select_wanted(
        &self,
        ordered: Vec<AdmissionCandidate>,
        catalog: &BrickCatalog,
    ) -> (HashSet<BrickKey>, usize) {
        let requested: HashSet<BrickKey> = ordered.iter().map(|c| c.key).collect();
        let pinned_elsewhere: u64 = self
            .textures
            .iter()
            .filter(|(k, t)| t.ref_count > 0 && !requested.contains(k))
            .map(|(_, t)| t.bytes)
            .sum();
        let limit = self.budget.budget().saturating_sub(pinned_elsewhere);

        let mut wanted = HashSet::new();
        let mut skipped = 0;
        let mut total = 0u64;
        for c in ordered {
            if self.config.skip_empty_bricks && catalog.lookup(c.key).is_some_and(|e| e.known_empty) {
                skipped += 1;
                continue;
            }
            if total + c.bytes > limit {
                break;
            }
            total += c.bytes;
            wanted.insert(c.key);
        }
        (wanted, skipped)
    }

    /// Abandon loads whose brick is no longer wanted
    fn cancel_unwanted(&mut self, catalog: &mut BrickCatalog, cancelled: &mut Vec<BrickKey>) {
        let dropped: Vec<BrickKey> = self
            .in_flight
            .keys()
            .filter(|k| !self.wanted.contains(k))
            .copied()
            .collect();
        for key in dropped {
            if let Some(flight) = self.in_flight.remove(&key) {
                self.budget.release_reservation(flight.reserved);
            }
            if let Some(entry) = catalog.lookup_mut(key) {
                entry.evict();
            }
            cancelled.push(key);
        }
    }

    /// Evict until used + pending + `needed` fits the budget or nothing
    /// evictable is left
    fn make_room(
        &mut self,
        catalog: &mut BrickCatalog,
        requested: &HashSet<BrickKey>,
        needed: u64,
        evicted: &mut Vec<BrickKey>,
    ) {
        let fits = |budget: &BrickBudget| budget.committed().saturating_add(needed) <= budget.budget();
        if fits(&self.budget) {
            return;
        }

        let last_requested = |key: &BrickKey| catalog.lookup(*key).map_or(0, |e| e.last_requested);
        let priority = |key: &BrickKey| catalog.lookup(*key).map_or(f32::MAX, |e| e.priority);

        let mut idle: Vec<(BrickKey, u64, u64)> = Vec::new();
        let mut unwanted: Vec<(BrickKey, f32)> = Vec::new();
        for (key, tex) in &self.textures {
            if tex.ref_count > 0 || self.wanted.contains(key) {
                continue;
            }
            if requested.contains(key) {
                unwanted.push((*key, priority(key)));
            } else {
                idle.push((*key, last_requested(key), tex.bytes));
            }
        }
        idle.sort_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)).then(a.0.cmp(&b.0)));
        unwanted.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let order = idle.into_iter().map(|(k, _, _)| k).chain(unwanted.into_iter().map(|(k, _)| k));
        for key in order {
            if fits(&self.budget) {
                break;
            }
            if self.evict(catalog, key) {
                evicted.push(key);
            }
        }
    }

    /// Promote wanted Unloaded bricks to Loading within budget and the
    /// response-time window. At least one brick is admitted per frame.
    fn admit(
        &mut self,
        catalog: &mut BrickCatalog,
        desc: &PyramidDescriptor,
        ordered: &[AdmissionCandidate],
        report: &mut FrameReport,
    ) {
        let window_ms = self.config.response_time_ms as f32;
        let per_brick_ms = self.decode_estimate_ms / self.config.max_concurrent_decodes as f32;
        let mut spent_ms = 0.0;

        for c in ordered {
            if !self.wanted.contains(&c.key) {
                continue;
            }
            let Some(entry) = catalog.lookup_mut(c.key) else { continue };
            if entry.state() != BrickState::Unloaded {
                continue;
            }
            let over_window = !report.tickets.is_empty() && spent_ms + per_brick_ms > window_ms;
            if over_window || !self.budget.can_load(c.bytes) {
                report.deferred += 1;
                continue;
            }
            let (Some(generation), Some(expected_dims)) = (entry.begin_load(), desc.brick_dims(c.key)) else {
                continue;
            };
            spent_ms += per_brick_ms;
            self.budget.reserve(c.bytes);
            self.in_flight.insert(c.key, InFlight { generation, reserved: c.bytes });
            self.stats.loads_started += 1;
            report.tickets.push(LoadTicket {
                key: c.key,
                generation,
                locator: entry.locator.clone(),
                priority: c.priority,
                expected_dims,
                depth: desc.bit_depth,
                tag: entry.tag().clone(),
            });
        }
    }

    /// Upload step of a load, run on the render thread.
    ///
    /// Returns true when the brick became Resident. Results for loads that
    /// were cancelled or are no longer wanted are discarded.
    pub fn complete(&mut self, catalog: &mut BrickCatalog, result: LoadResult) -> bool {
        let key = result.key;
        let Some(flight) = self.in_flight.get(&key).copied().filter(|f| f.generation == result.generation) else {
            log::trace!("{} stale result discarded (gen {})", key, result.generation);
            self.stats.discarded += 1;
            return false;
        };
        self.in_flight.remove(&key);

        if result.decode_ms > 0.0 {
            self.decode_estimate_ms = (1.0 - DECODE_ESTIMATE_ALPHA) * self.decode_estimate_ms
                + DECODE_ESTIMATE_ALPHA * result.decode_ms;
        }

        let Some(entry) = catalog.lookup_mut(key) else {
            self.budget.release_reservation(flight.reserved);
            return false;
        };

        let buffer = match result.outcome {
            LoadOutcome::Decoded(buffer) => buffer,
            LoadOutcome::Cancelled => {
                self.budget.release_reservation(flight.reserved);
                entry.abort_load(flight.generation);
                self.stats.discarded += 1;
                return false;
            }
            LoadOutcome::Failed(reason) => {
                self.budget.release_reservation(flight.reserved);
                entry.abort_load(flight.generation);
                log::warn!("Decode of {} failed: {}", key, reason);
                self.stats.decode_failures += 1;
                self.errors.push(Error::BrickDecodeFailed { key, reason });
                return false;
            }
        };

        if !self.wanted.contains(&key) {
            self.budget.release_reservation(flight.reserved);
            entry.abort_load(flight.generation);
            self.stats.discarded += 1;
            log::trace!("{} decoded but no longer wanted", key);
            return false;
        }

        if buffer.is_empty() {
            entry.known_empty = true;
            if self.config.skip_empty_bricks {
                self.budget.release_reservation(flight.reserved);
                entry.abort_load(flight.generation);
                log::trace!("{} is empty, skipped", key);
                return false;
            }
        }

        self.upload(catalog, key, flight, &buffer)
    }

    fn upload(&mut self, catalog: &mut BrickCatalog, key: BrickKey, flight: InFlight, buffer: &VoxelBuffer) -> bool {
        let Some(entry) = catalog.lookup_mut(key) else { return false };
        let bytes = buffer.byte_len() as u64;
        match self.uploader.upload(key, buffer) {
            Ok(handle) => {
                if !entry.finish_load(flight.generation) {
                    self.uploader.release(handle);
                    self.budget.release_reservation(flight.reserved);
                    return false;
                }
                self.budget.commit(flight.reserved, bytes);
                self.textures.insert(key, ResidentTexture { handle, bytes, ref_count: 0 });
                self.stats.loads_completed += 1;
                true
            }
            Err(e) => {
                self.budget.release_reservation(flight.reserved);
                entry.abort_load(flight.generation);
                log::warn!("Upload of {} failed: {}", key, e);
                self.stats.allocation_failures += 1;
                self.errors.push(match e {
                    Error::AllocationFailure { .. } => e,
                    other => Error::AllocationFailure {
                        key,
                        bytes: bytes as usize,
                        reason: other.to_string(),
                    },
                });
                false
            }
        }
    }

    /// Release one resident brick. Pinned bricks are refused.
    pub fn evict(&mut self, catalog: &mut BrickCatalog, key: BrickKey) -> bool {
        if self.textures.get(&key).is_none_or(|t| t.ref_count > 0) {
            return false;
        }
        let Some(tex) = self.textures.remove(&key) else { return false };
        self.uploader.release(tex.handle);
        self.budget.free(tex.bytes);
        if let Some(entry) = catalog.lookup_mut(key) {
            entry.evict();
        }
        self.stats.evictions += 1;
        true
    }

    /// Release every unpinned texture and abandon all loads
    pub fn clear(&mut self, catalog: &mut BrickCatalog) {
        let mut cancelled = Vec::new();
        self.wanted.clear();
        self.cancel_unwanted(catalog, &mut cancelled);
        let keys: Vec<BrickKey> = self.textures.keys().copied().collect();
        for key in keys {
            self.evict(catalog, key);
        }
    }

    // --- Renderer access ---

    /// Handle of a Resident or Stale brick
    pub fn get_resident_texture(&self, key: BrickKey) -> Option<&U::Handle> {
        self.textures.get(&key).map(|t| &t.handle)
    }

    /// The brick's own texture, or the nearest coarser resident one
    pub fn resolve_texture(&self, desc: &PyramidDescriptor, key: BrickKey) -> Option<(BrickKey, &U::Handle)> {
        let mut current = Some(key).filter(|k| desc.contains(*k));
        while let Some(k) = current {
            if let Some(t) = self.textures.get(&k) {
                return Some((k, &t.handle));
            }
            current = desc.coarser_key(k);
        }
        None
    }

    /// Mark a brick as in use by a render pass
    pub fn pin(&mut self, key: BrickKey) -> bool {
        match self.textures.get_mut(&key) {
            Some(t) => {
                t.ref_count += 1;
                true
            }
            None => false,
        }
    }

    pub fn unpin(&mut self, key: BrickKey) {
        if let Some(t) = self.textures.get_mut(&key) {
            t.ref_count = t.ref_count.saturating_sub(1);
        }
    }

    pub fn ref_count(&self, key: BrickKey) -> u32 {
        self.textures.get(&key).map_or(0, |t| t.ref_count)
    }

    /// Errors recorded since the last call, each reported once
    pub fn drain_errors(&mut self) -> Vec<Error> {
        std::mem::take(&mut self.errors)
    }

    // --- Queries ---

    pub fn is_wanted(&self, key: BrickKey) -> bool {
        self.wanted.contains(&key)
    }

    pub fn used_bytes(&self) -> u64 {
        self.budget.used()
    }

    pub fn pending_bytes(&self) -> u64 {
        self.budget.pending()
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget.budget()
    }

    pub fn resident_count(&self) -> usize {
        self.textures.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn decode_estimate_ms(&self) -> f32 {
        self.decode_estimate_ms
    }

    pub fn uploader(&self) -> &U {
        &self.uploader
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            frame: self.frame,
            resident: self.textures.len(),
            loading: self.in_flight.len(),
            used_bytes: self.budget.used(),
            pending_bytes: self.budget.pending(),
            budget_bytes: self.budget.budget(),
            decode_estimate_ms: self.decode_estimate_ms,
            ..self.stats
        }
    }
}

impl<U: TextureUploader> Drop for ResidentSet<U> {
    fn drop(&mut self) {
        for (_, tex) in self.textures.drain() {
            self.uploader.release(tex.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BitDepth, UVec3, Vec3};
    use crate::streaming::gpu::HostUploader;
    use crate::streaming::loader::{BrickDecoder, MemoryDecoder, decode_ticket};
    use crate::volume::pyramid::SourceLocator;

    const KB: f64 = 1.0 / 1024.0;

    struct Fixture {
        desc: PyramidDescriptor,
        catalog: BrickCatalog,
        set: ResidentSet<HostUploader>,
        decoder: MemoryDecoder,
    }

    /// Row of `bricks` bricks along x, each `edge^3` U16 voxels
    fn fixture(bricks: u32, edge: u32, budget_mb: f64) -> Fixture {
        let extent = UVec3::new(edge * bricks, edge, edge);
        let desc = PyramidDescriptor::single_resolution(extent, BitDepth::U16, Vec3::ONE, edge).unwrap();
        let catalog = BrickCatalog::build(&desc).unwrap();
        let config = CacheConfig { memory_budget_mb: budget_mb, ..Default::default() };
        let set = ResidentSet::new(config, HostUploader::new(), &desc).unwrap();
        let mut full = VoxelBuffer::zeroed(extent, BitDepth::U16, Vec3::ONE);
        full.fill(7);
        let decoder = MemoryDecoder::new(full, desc.clone());
        Fixture { desc, catalog, set, decoder }
    }

    fn key(bx: u32) -> BrickKey {
        BrickKey::new(0, bx, 0, 0)
    }

    impl Fixture {
        fn request(&mut self, requests: &[(u32, f32)]) -> FrameReport {
            let priorities: HashMap<BrickKey, f32> = requests.iter().map(|&(bx, p)| (key(bx), p)).collect();
            self.set.request_visible(&mut self.catalog, &self.desc, requests.iter().map(|&(bx, _)| key(bx)), &priorities)
        }

        /// Request, decode inline and upload
        fn frame(&mut self, requests: &[(u32, f32)]) -> FrameReport {
            let report = self.request(requests);
            for ticket in &report.tickets {
                let result = decode_ticket(&self.decoder, ticket);
                self.set.complete(&mut self.catalog, result);
            }
            report
        }

        fn state(&self, bx: u32) -> BrickState {
            self.catalog.lookup(key(bx)).unwrap().state()
        }
    }

    #[test]
    fn test_budget_smaller_than_brick_rejected() {
        let desc = PyramidDescriptor::single_resolution(UVec3::splat(64), BitDepth::U8, Vec3::ONE, 64).unwrap();
        let config = CacheConfig { memory_budget_mb: 0.1, ..Default::default() };
        let result = ResidentSet::new(config, HostUploader::new(), &desc);
        assert!(matches!(result, Err(Error::BudgetExceededByReservation { minimum_bytes: 262144, .. })));
    }

    #[test]
    fn test_brick_edge_above_config_rejected() {
        let desc = PyramidDescriptor::single_resolution(UVec3::splat(128), BitDepth::U8, Vec3::ONE, 128).unwrap();
        let narrow = CacheConfig { brick_edge: 64, ..Default::default() };
        let result = ResidentSet::new(narrow.clone(), HostUploader::new(), &desc);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));

        let mut catalog = BrickCatalog::build(&desc).unwrap();
        let mut set = ResidentSet::new(CacheConfig::default(), HostUploader::new(), &desc).unwrap();
        assert!(matches!(set.set_config(narrow, &mut catalog, &desc), Err(Error::InvalidConfig(_))));
        assert_eq!(set.config().brick_edge, 128);
    }

    #[test]
    fn test_out_of_range_request_is_noop() {
        let mut f = fixture(2, 8, 1.0);
        let report = f.frame(&[(5, 1.0), (99, 0.0)]);
        assert_eq!(report.ignored_out_of_range, 2);
        assert!(report.tickets.is_empty());
        assert_eq!(f.set.used_bytes(), 0);
        assert_eq!(f.set.uploader().live_count(), 0);
        assert_eq!(f.catalog.count_in(BrickState::Unloaded), 2);
        assert!(f.set.get_resident_texture(key(99)).is_none());
    }

    #[test]
    fn test_most_urgent_four_of_six_resident() {
        // 128 x 128 x 64 U8 = 1 MiB per brick, budget of 4 bricks
        let extent = UVec3::new(128 * 6, 128, 64);
        let desc = PyramidDescriptor::single_resolution(extent, BitDepth::U8, Vec3::ONE, 128).unwrap();
        assert_eq!(desc.max_brick_bytes(), 1024 * 1024);
        let mut catalog = BrickCatalog::build(&desc).unwrap();
        let config = CacheConfig { memory_budget_mb: 4.0, ..Default::default() };
        let mut set = ResidentSet::new(config, HostUploader::new(), &desc).unwrap();
        let mut full = VoxelBuffer::zeroed(extent, BitDepth::U8, Vec3::ONE);
        full.fill(1);
        let decoder = MemoryDecoder::new(full, desc.clone());

        // Priorities 1..6, keys listed least urgent first
        let keys: Vec<BrickKey> = (0..6).rev().map(key).collect();
        let priorities: HashMap<BrickKey, f32> = (0..6).map(|bx| (key(bx), (bx + 1) as f32)).collect();

        for _ in 0..2 {
            let report = set.request_visible(&mut catalog, &desc, keys.iter().copied(), &priorities);
            for ticket in &report.tickets {
                set.complete(&mut catalog, decode_ticket(&decoder, ticket));
            }
            assert!(set.used_bytes() <= set.budget_bytes());
        }

        for bx in 0..4 {
            assert_eq!(catalog.lookup(key(bx)).unwrap().state(), BrickState::Resident, "brick {bx}");
        }
        for bx in 4..6 {
            assert_ne!(catalog.lookup(key(bx)).unwrap().state(), BrickState::Resident, "brick {bx}");
        }
        assert_eq!(set.resident_count(), 4);
        assert_eq!(set.used_bytes(), 4 * 1024 * 1024);
    }

    #[test]
    fn test_used_never_exceeds_budget() {
        // 8^3 U16 = 1 KiB bricks, budget of 3
        let mut f = fixture(8, 8, 3.0 * KB);
        let frames: [&[(u32, f32)]; 5] = [
            &[(0, 1.0), (1, 2.0), (2, 3.0), (3, 4.0)],
            &[(4, 1.0), (5, 2.0)],
            &[(6, 0.5), (7, 0.6), (0, 0.7), (1, 0.8)],
            &[],
            &[(2, 1.0), (3, 1.0), (4, 1.0), (5, 1.0), (6, 1.0)],
        ];
        for requests in frames {
            f.frame(requests);
            assert_eq!(f.set.in_flight_count(), 0);
            assert!(f.set.used_bytes() <= f.set.budget_bytes());
            assert_eq!(f.set.uploader().live_bytes() as u64, f.set.used_bytes());
        }
    }

    #[test]
    fn test_pinned_brick_never_evicted() {
        let mut f = fixture(4, 8, 2.0 * KB);
        f.frame(&[(0, 1.0), (1, 2.0)]);
        assert_eq!(f.state(0), BrickState::Resident);
        assert_eq!(f.state(1), BrickState::Resident);

        assert!(f.set.pin(key(0)));
        let report = f.frame(&[(2, 1.0), (3, 2.0)]);

        assert_eq!(f.state(0), BrickState::Resident);
        assert!(f.set.get_resident_texture(key(0)).is_some());
        assert_eq!(report.evicted, vec![key(1)]);
        assert_eq!(f.state(2), BrickState::Resident);
        assert_ne!(f.state(3), BrickState::Resident);
        assert!(f.set.used_bytes() <= f.set.budget_bytes());

        // Explicit eviction is refused while pinned
        assert!(!f.set.evict(&mut f.catalog, key(0)));
        f.set.unpin(key(0));
        assert_eq!(f.set.ref_count(key(0)), 0);
        assert!(f.set.evict(&mut f.catalog, key(0)));
        assert_eq!(f.state(0), BrickState::Unloaded);
    }

    #[test]
    fn test_eviction_prefers_least_recently_requested() {
        let mut f = fixture(4, 8, 2.0 * KB);
        f.frame(&[(0, 1.0)]);
        f.frame(&[(1, 1.0)]);
        // Brick 0 was requested longest ago
        let report = f.frame(&[(2, 1.0)]);
        assert_eq!(report.evicted, vec![key(0)]);
        assert_eq!(f.state(1), BrickState::Resident);
        assert_eq!(f.state(2), BrickState::Resident);
    }

    #[test]
    fn test_short_buffer_reverts_and_reports_once() {
        let mut f = fixture(2, 8, 1.0);
        let short = |_: BrickKey, _: &SourceLocator| -> Result<VoxelBuffer> {
            Ok(VoxelBuffer::zeroed(UVec3::new(8, 8, 2), BitDepth::U16, Vec3::ONE))
        };

        let report = f.request(&[(0, 1.0)]);
        assert_eq!(report.tickets.len(), 1);
        assert_eq!(f.state(0), BrickState::Loading);
        let result = decode_ticket(&short, &report.tickets[0]);
        assert!(!f.set.complete(&mut f.catalog, result));

        assert_eq!(f.state(0), BrickState::Unloaded);
        assert_eq!(f.set.pending_bytes(), 0);
        assert_eq!(f.set.in_flight_count(), 0);
        let errors = f.set.drain_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind(), crate::core::error::ErrorKind::BrickDecodeFailed);
        assert!(f.set.drain_errors().is_empty());
        assert_eq!(f.set.stats().decode_failures, 1);

        // Nothing retries until the brick is requested again
        assert_eq!(f.state(0), BrickState::Unloaded);
        let report = f.request(&[(0, 1.0)]);
        assert_eq!(report.tickets.len(), 1);
    }

    #[test]
    fn test_mark_stale_keeps_handles() {
        let mut f = fixture(2, 8, 1.0);
        f.frame(&[(0, 1.0), (1, 2.0)]);
        let before = f.set.get_resident_texture(key(0)).cloned().unwrap();

        assert_eq!(f.catalog.mark_stale(0..1), 2);
        assert_eq!(f.state(0), BrickState::Stale);
        assert_eq!(f.set.get_resident_texture(key(0)), Some(&before));
        assert_eq!(f.set.resident_count(), 2);

        // Still wanted and holding a payload, so no reload is issued
        let report = f.frame(&[(0, 1.0), (1, 2.0)]);
        assert!(report.tickets.is_empty());
        assert_eq!(f.state(0), BrickState::Stale);
    }

    #[test]
    fn test_result_discarded_when_no_longer_wanted() {
        let mut f = fixture(2, 8, 1.0);
        let report = f.request(&[(0, 1.0)]);
        let ticket = report.tickets[0].clone();

        // Next frame no longer wants brick 0; the load is abandoned
        let report = f.request(&[(1, 1.0)]);
        assert_eq!(report.cancelled, vec![key(0)]);
        assert_eq!(f.state(0), BrickState::Unloaded);

        let result = decode_ticket(&f.decoder, &ticket);
        assert!(matches!(result.outcome, LoadOutcome::Cancelled));
        assert!(!f.set.complete(&mut f.catalog, result));
        assert_eq!(f.state(0), BrickState::Unloaded);
        assert_eq!(f.set.used_bytes(), 0);
    }

    #[test]
    fn test_late_result_after_cancel_discarded() {
        let mut f = fixture(2, 8, 1.0);
        let report = f.request(&[(0, 1.0)]);
        // Decode finished before the cancel
        let result = decode_ticket(&f.decoder, &report.tickets[0]);
        f.request(&[(1, 1.0)]);
        assert!(!f.set.complete(&mut f.catalog, result));
        assert_eq!(f.state(0), BrickState::Unloaded);
        assert_eq!(f.set.uploader().live_count(), 0);
    }

    #[test]
    fn test_response_window_defers() {
        let mut f = fixture(8, 8, 1.0);
        let config = CacheConfig {
            response_time_ms: 10,
            initial_decode_estimate_ms: 10.0,
            max_concurrent_decodes: 1,
            ..Default::default()
        };
        f.set = ResidentSet::new(config, HostUploader::new(), &f.desc).unwrap();

        let requests: Vec<(u32, f32)> = (0..4).map(|bx| (bx, bx as f32)).collect();
        let report = f.request(&requests);
        assert_eq!(report.tickets.len(), 1);
        assert_eq!(report.tickets[0].key, key(0));
        assert_eq!(report.deferred, 3);

        // Deferred bricks start on later frames
        let report = f.request(&requests);
        assert_eq!(report.tickets.len(), 1);
        assert_eq!(report.tickets[0].key, key(1));
    }

    #[test]
    fn test_allocation_failure_reported() {
        let extent = UVec3::new(16, 8, 8);
        let desc = PyramidDescriptor::single_resolution(extent, BitDepth::U8, Vec3::ONE, 8).unwrap();
        let mut catalog = BrickCatalog::build(&desc).unwrap();
        let mut set = ResidentSet::new(CacheConfig::default(), HostUploader::with_capacity(600), &desc).unwrap();
        let decoder = MemoryDecoder::new(VoxelBuffer::zeroed(extent, BitDepth::U8, Vec3::ONE), desc.clone());

        let priorities = HashMap::new();
        let report = set.request_visible(&mut catalog, &desc, [key(0), key(1)], &priorities);
        for t in &report.tickets {
            set.complete(&mut catalog, decode_ticket(&decoder, t));
        }
        let errors = set.drain_errors();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], Error::AllocationFailure { .. }));
        assert_eq!(set.resident_count(), 1);
        assert_eq!(catalog.count_in(BrickState::Unloaded), 1);
    }

    #[test]
    fn test_skip_empty_bricks() {
        let extent = UVec3::new(16, 8, 8);
        let desc = PyramidDescriptor::single_resolution(extent, BitDepth::U8, Vec3::ONE, 8).unwrap();
        let mut catalog = BrickCatalog::build(&desc).unwrap();
        let config = CacheConfig { skip_empty_bricks: true, ..Default::default() };
        let mut set = ResidentSet::new(config, HostUploader::new(), &desc).unwrap();
        let mut full = VoxelBuffer::zeroed(extent, BitDepth::U8, Vec3::ONE);
        full.fill_with(|i, _, _| if i >= 8 { 3 } else { 0 });
        let decoder = MemoryDecoder::new(full, desc.clone());

        let priorities = HashMap::new();
        let report = set.request_visible(&mut catalog, &desc, [key(0), key(1)], &priorities);
        for t in &report.tickets {
            set.complete(&mut catalog, decode_ticket(&decoder, t));
        }
        assert!(catalog.lookup(key(0)).unwrap().known_empty);
        assert_eq!(catalog.lookup(key(0)).unwrap().state(), BrickState::Unloaded);
        assert_eq!(catalog.lookup(key(1)).unwrap().state(), BrickState::Resident);

        let report = set.request_visible(&mut catalog, &desc, [key(0), key(1)], &priorities);
        assert_eq!(report.skipped_empty, 1);
        assert!(report.tickets.is_empty());
    }

    #[test]
    fn test_set_config_shrinks_budget() {
        let mut f = fixture(4, 8, 4.0 * KB);
        f.frame(&[(0, 1.0), (1, 2.0), (2, 3.0), (3, 4.0)]);
        assert_eq!(f.set.resident_count(), 4);

        let config = CacheConfig { memory_budget_mb: 2.0 * KB, ..Default::default() };
        let evicted = f.set.set_config(config, &mut f.catalog, &f.desc).unwrap();
        assert_eq!(evicted.len(), 2);
        assert!(f.set.used_bytes() <= f.set.budget_bytes());
        assert_eq!(f.state(0), BrickState::Resident);
        assert_eq!(f.state(1), BrickState::Resident);

        let too_small = CacheConfig { memory_budget_mb: 0.5 * KB, ..Default::default() };
        assert!(f.set.set_config(too_small, &mut f.catalog, &f.desc).is_err());
    }

    #[test]
    fn test_resolve_texture_falls_back_to_coarser() {
        let extent = UVec3::new(16, 8, 8);
        let desc = PyramidDescriptor::multi_resolution(extent, BitDepth::U8, Vec3::ONE, 8, 2).unwrap();
        let mut catalog = BrickCatalog::build(&desc).unwrap();
        let mut set = ResidentSet::new(CacheConfig::default(), HostUploader::new(), &desc).unwrap();
        let decoder = MemoryDecoder::new(VoxelBuffer::zeroed(extent, BitDepth::U8, Vec3::ONE), desc.clone());

        let coarse = BrickKey::new(1, 0, 0, 0);
        let report = set.request_visible(&mut catalog, &desc, [coarse], &HashMap::new());
        for t in &report.tickets {
            set.complete(&mut catalog, decode_ticket(&decoder, t));
        }

        let (found, _) = set.resolve_texture(&desc, key(1)).unwrap();
        assert_eq!(found, coarse);
        assert!(set.get_resident_texture(key(1)).is_none());
        assert!(set.resolve_texture(&desc, key(9)).is_none());
    }

    #[test]
    fn test_decode_estimate_tracks_measurements() {
        let mut f = fixture(1, 8, 1.0);
        let report = f.request(&[(0, 1.0)]);
        let mut result = decode_ticket(&f.decoder, &report.tickets[0]);
        result.decode_ms = 15.0;
        f.set.complete(&mut f.catalog, result);
        // 0.8 * 5 + 0.2 * 15
        assert!((f.set.decode_estimate_ms() - 7.0).abs() < 1e-4);
    }

    #[test]
    fn test_decoder_trait_object() {
        let f = fixture(1, 8, 1.0);
        let decoder: &dyn BrickDecoder = &f.decoder;
        let locator = f.desc.locator(key(0)).unwrap();
        assert_eq!(decoder.decode(key(0), &locator).unwrap().get(0, 0, 0), Some(7));
    }
}
