//! Volume cache facade
//!
//! Wires one [`Dataset`] to its [`ResidentSet`], the auxiliary channels and
//! a decode worker pool. All methods run on the render thread; only
//! decoding happens elsewhere.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::auxiliary::{AuxFill, AuxKind, AuxSynchronizer, AuxWarning};
use crate::clip::ClipPlaneSet;
use crate::core::error::Error;
use crate::core::types::{BrickKey, Mat4, Result, UVec3, Vec3};
use crate::streaming::cache::{CacheStats, FrameReport, ResidentSet};
use crate::streaming::config::CacheConfig;
use crate::streaming::gpu::TextureUploader;
use crate::streaming::loader::{BrickDecoder, BrickLoader, LoadResult};
use crate::streaming::priority::ViewState;
use crate::volume::dataset::Dataset;
use crate::volume::pyramid::PyramidDescriptor;

pub struct VolumeCache<U: TextureUploader> {
    dataset: Dataset,
    resident: ResidentSet<U>,
    aux: AuxSynchronizer,
    loader: BrickLoader,
}

impl<U: TextureUploader> VolumeCache<U> {
    /// Build the catalog and start `config.max_concurrent_decodes` workers
    pub fn new(
        desc: PyramidDescriptor,
        config: CacheConfig,
        uploader: U,
        decoder: Arc<dyn BrickDecoder>,
    ) -> Result<Self> {
        let dataset = Dataset::new(desc)?;
        let resident = ResidentSet::new(config.clone(), uploader, dataset.descriptor())?;
        let loader = BrickLoader::new(decoder, config.max_concurrent_decodes)?;
        Ok(Self {
            aux: AuxSynchronizer::new(&config),
            dataset,
            resident,
            loader,
        })
    }

    /// Apply a new configuration; the budget is re-evaluated at once.
    ///
    /// The worker pool keeps the width it was created with.
    pub fn set_config(&mut self, config: CacheConfig) -> Result<Vec<BrickKey>> {
        if config.max_concurrent_decodes != self.resident.config().max_concurrent_decodes {
            log::warn!(
                "max_concurrent_decodes changed to {}, worker pool keeps its width",
                config.max_concurrent_decodes
            );
        }
        self.aux.set_config(&config);
        let (catalog, desc) = self.dataset.split_mut();
        let evicted = self.resident.set_config(config, catalog, desc)?;
        for &key in &evicted {
            self.aux.sync(key, self.dataset.catalog());
        }
        Ok(evicted)
    }

    /// Declare this frame's bricks with explicit priorities and dispatch
    /// the admitted loads. Never blocks.
    pub fn request_visible_with(&mut self, keys: &[BrickKey], priorities: &HashMap<BrickKey, f32>) -> FrameReport {
        if self.dataset.refresh_geometry() > 0 {
            self.aux.sync_all(self.dataset.catalog());
        }
        let (catalog, desc) = self.dataset.split_mut();
        let report = self
            .resident
            .request_visible(catalog, desc, keys.iter().copied(), priorities);

        for &key in &report.cancelled {
            self.loader.cancel(key);
        }
        for &key in &report.evicted {
            self.aux.sync(key, self.dataset.catalog());
        }
        for ticket in &report.tickets {
            self.loader.submit(ticket.clone());
        }
        report
    }

    /// Declare this frame's bricks; priorities come from the view
    pub fn request_visible(&mut self, keys: &[BrickKey], view: &ViewState) -> FrameReport {
        let target = self
            .dataset
            .target_level(view, self.resident.config().detail_level_offset);
        let priorities = self.dataset.priorities(keys, view, target);
        self.request_visible_with(keys, &priorities)
    }

    /// Pick the level the view wants, make it active and request all of
    /// its bricks in render order
    pub fn request_view(&mut self, view: &ViewState) -> Result<FrameReport> {
        let config = self.resident.config();
        let (offset, order) = (config.detail_level_offset, config.update_order);
        let target = self.dataset.target_level(view, offset);
        let level = self.dataset.set_level(target)?;
        let keys = self.dataset.sorted_bricks(level, view, order);
        Ok(self.request_visible(&keys, view))
    }

    /// Upload every finished decode; returns how many bricks became Resident
    pub fn process_completed(&mut self) -> usize {
        let results = self.loader.poll_results();
        self.complete_all(results)
    }

    /// Like [`process_completed`](Self::process_completed), waiting up to
    /// `timeout` for `count` results
    pub fn wait_completed(&mut self, count: usize, timeout: Duration) -> usize {
        let results = self.loader.wait_for_results(count, timeout);
        self.complete_all(results)
    }

    fn complete_all(&mut self, results: Vec<LoadResult>) -> usize {
        let mut resident = 0;
        for result in results {
            let key = result.key;
            if self.resident.complete(self.dataset.catalog_mut(), result) {
                resident += 1;
                self.aux.sync(key, self.dataset.catalog());
            }
        }
        resident
    }

    // --- Renderer access ---

    pub fn get_resident_texture(&self, key: BrickKey) -> Option<&U::Handle> {
        self.resident.get_resident_texture(key)
    }

    /// The brick's texture or the nearest coarser resident one
    pub fn resolve_texture(&self, key: BrickKey) -> Option<(BrickKey, &U::Handle)> {
        self.resident.resolve_texture(self.dataset.descriptor(), key)
    }

    pub fn pin(&mut self, key: BrickKey) -> bool {
        self.resident.pin(key)
    }

    pub fn unpin(&mut self, key: BrickKey) {
        self.resident.unpin(key)
    }

    pub fn get_transform(&self) -> Mat4 {
        self.dataset.transform()
    }

    pub fn get_clip_planes(&self) -> &ClipPlaneSet {
        self.dataset.clip_planes()
    }

    // --- Geometry ---

    pub fn set_level(&mut self, level: u32) -> Result<u32> {
        self.dataset.set_level(level)
    }

    pub fn set_spacing(&mut self, spacing: Vec3) -> Result<()> {
        self.dataset.set_base_spacing(spacing)
    }

    pub fn set_spacing_scale(&mut self, scale: Vec3) -> Result<()> {
        self.dataset.set_spacing_scale(scale)
    }

    pub fn set_clip_rotation(&mut self, rotation_deg: [f32; 3]) {
        self.dataset.set_clip_rotation(rotation_deg)
    }

    pub fn set_clip_interval(&mut self, axis: usize, lo: f32, hi: f32) -> bool {
        self.dataset.set_clip_interval(axis, lo, hi)
    }

    // --- Auxiliary channels ---

    pub fn add_channel(&mut self, kind: AuxKind, fill: AuxFill) -> Result<bool> {
        self.aux.add_channel(kind, fill, self.dataset.descriptor())
    }

    pub fn ensure_brick(&mut self, kind: AuxKind, key: BrickKey) -> Result<bool> {
        self.aux.ensure_brick(kind, key, self.dataset.descriptor())
    }

    pub fn get_voxel(&self, kind: AuxKind, voxel: UVec3) -> Option<u32> {
        self.aux.get_voxel(kind, voxel, self.dataset.descriptor())
    }

    pub fn set_voxel(&mut self, kind: AuxKind, voxel: UVec3, value: u32) -> Result<()> {
        self.aux.set_voxel(kind, voxel, value, self.dataset.descriptor())
    }

    /// Record an aux upload; refused while the primary brick never was resident
    pub fn mark_aux_uploaded(&mut self, kind: AuxKind, key: BrickKey) -> Result<()> {
        self.aux.mark_uploaded(kind, key, self.dataset.catalog())
    }

    pub fn take_aux_warnings(&mut self) -> Vec<AuxWarning> {
        self.aux.take_warnings()
    }

    // --- Accessors ---

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn resident(&self) -> &ResidentSet<U> {
        &self.resident
    }

    pub fn aux(&self) -> &AuxSynchronizer {
        &self.aux
    }

    pub fn aux_mut(&mut self) -> &mut AuxSynchronizer {
        &mut self.aux
    }

    pub fn pending_decodes(&self) -> usize {
        self.loader.pending_count()
    }

    /// Recoverable errors since the last call
    pub fn drain_errors(&mut self) -> Vec<Error> {
        self.resident.drain_errors()
    }

    pub fn stats(&self) -> CacheStats {
        self.resident.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BitDepth, Vec2};
    use crate::streaming::gpu::HostUploader;
    use crate::streaming::loader::MemoryDecoder;
    use crate::volume::buffer::VoxelBuffer;
    use crate::volume::catalog::BrickState;

    fn cache() -> VolumeCache<HostUploader> {
        let extent = UVec3::new(32, 32, 16);
        let desc = PyramidDescriptor::multi_resolution(extent, BitDepth::U8, Vec3::ONE, 8, 3).unwrap();
        let mut full = VoxelBuffer::zeroed(extent, BitDepth::U8, Vec3::ONE);
        full.fill_with(|i, j, k| 1 + (i + j + k) % 200);
        let decoder = Arc::new(MemoryDecoder::new(full, desc.clone()));
        VolumeCache::new(desc, CacheConfig::default(), HostUploader::new(), decoder).unwrap()
    }

    fn view() -> ViewState {
        ViewState::look_at(Vec3::new(16.0, 16.0, -40.0), Vec3::new(16.0, 16.0, 8.0), 0.8, Vec2::new(1024.0, 768.0))
    }

    #[test]
    fn test_request_and_complete() {
        let mut cache = cache();
        let keys = cache.dataset().catalog().keys_at_level(1);
        let report = cache.request_visible(&keys, &view());
        assert_eq!(report.tickets.len(), keys.len());
        assert_eq!(cache.pending_decodes(), keys.len());

        let done = cache.wait_completed(keys.len(), Duration::from_secs(10));
        assert_eq!(done, keys.len());
        for key in &keys {
            assert!(cache.get_resident_texture(*key).is_some());
            assert_eq!(cache.dataset().catalog().lookup(*key).unwrap().state(), BrickState::Resident);
        }
        assert!(cache.drain_errors().is_empty());
        assert_eq!(cache.stats().loads_completed, keys.len() as u64);
    }

    #[test]
    fn test_request_view_activates_target_level() {
        let mut cache = cache();
        let report = cache.request_view(&view()).unwrap();
        let level = cache.dataset().level();
        assert!(!report.tickets.is_empty());
        assert!(report.tickets.iter().all(|t| t.key.level == level));
    }

    #[test]
    fn test_spacing_change_keeps_textures() {
        let mut cache = cache();
        let keys = cache.dataset().catalog().keys_at_level(2);
        cache.request_visible(&keys, &view());
        cache.wait_completed(keys.len(), Duration::from_secs(10));

        cache.set_spacing(Vec3::new(1.0, 1.0, 2.0)).unwrap();
        assert_eq!(cache.dataset().catalog().lookup(keys[0]).unwrap().state(), BrickState::Stale);
        assert!(cache.get_resident_texture(keys[0]).is_some());
        assert_eq!(cache.get_transform().transform_point3(Vec3::ONE), Vec3::new(32.0, 32.0, 32.0));

        cache.request_visible(&keys, &view());
        assert_eq!(cache.dataset().catalog().lookup(keys[0]).unwrap().state(), BrickState::Resident);
    }

    #[test]
    fn test_aux_upload_gated_on_primary() {
        let mut cache = cache();
        let key = BrickKey::new(0, 0, 0, 0);
        assert!(cache.ensure_brick(AuxKind::Mask, key).unwrap());
        assert!(cache.mark_aux_uploaded(AuxKind::Mask, key).is_err());

        cache.request_visible(&[key], &view());
        assert_eq!(cache.wait_completed(1, Duration::from_secs(10)), 1);
        cache.mark_aux_uploaded(AuxKind::Mask, key).unwrap();

        cache.set_voxel(AuxKind::Mask, UVec3::new(1, 2, 3), 255).unwrap();
        assert_eq!(cache.get_voxel(AuxKind::Mask, UVec3::new(1, 2, 3)), Some(255));
        assert!(cache.take_aux_warnings().is_empty());
    }

    #[test]
    fn test_out_of_range_keys_ignored() {
        let mut cache = cache();
        let report = cache.request_visible_with(&[BrickKey::new(7, 0, 0, 0)], &HashMap::new());
        assert_eq!(report.ignored_out_of_range, 1);
        assert!(report.tickets.is_empty());
        assert_eq!(cache.pending_decodes(), 0);
    }
}
