//! A dataset: pyramid layout, brick catalog and world placement
//!
//! Spacing and level changes flag resident bricks Stale and re-derive the
//! transform and clip planes at once. Brick world bounds catch up on the
//! next [`Dataset::refresh_geometry`], which returns Stale bricks to
//! Resident; their textures stay valid throughout.

use std::collections::HashMap;

use crate::clip::{ClipParams, ClipPlaneSet, TransformCoordinator};
use crate::core::error::Error;
use crate::core::types::{BrickKey, Mat4, Result, UVec3, Vec3};
use crate::math::Aabb;
use crate::streaming::config::UpdateOrder;
use crate::streaming::lod;
use crate::streaming::priority::{brick_priority, ViewState};
use crate::volume::catalog::BrickCatalog;
use crate::volume::pyramid::PyramidDescriptor;

#[derive(Debug)]
pub struct Dataset {
    desc: PyramidDescriptor,
    catalog: BrickCatalog,
    coordinator: TransformCoordinator,
    level: u32,
}

fn check_spacing(what: &str, v: Vec3) -> Result<()> {
    if v.is_finite() && v.cmpgt(Vec3::ZERO).all() {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!("{what} {v} must be positive")))
    }
}

impl Dataset {
    pub fn new(desc: PyramidDescriptor) -> Result<Self> {
        let catalog = BrickCatalog::build(&desc)?;
        let (extent, spacing) = level_geometry(&desc, 0)?;
        let mut dataset = Self {
            coordinator: TransformCoordinator::new(extent, spacing),
            desc,
            catalog,
            level: 0,
        };
        dataset.refresh_geometry();
        Ok(dataset)
    }

    pub fn descriptor(&self) -> &PyramidDescriptor {
        &self.desc
    }

    pub fn catalog(&self) -> &BrickCatalog {
        &self.catalog
    }

    pub fn catalog_mut(&mut self) -> &mut BrickCatalog {
        &mut self.catalog
    }

    /// Catalog and descriptor borrowed together for resident-set calls
    pub fn split_mut(&mut self) -> (&mut BrickCatalog, &PyramidDescriptor) {
        (&mut self.catalog, &self.desc)
    }

    pub fn coordinator(&self) -> &TransformCoordinator {
        &self.coordinator
    }

    /// Active resolution level
    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn set_base_spacing(&mut self, spacing: Vec3) -> Result<()> {
        check_spacing("base spacing", spacing)?;
        self.desc.base_spacing = spacing.to_array();
        self.geometry_changed()
    }

    pub fn set_spacing_scale(&mut self, scale: Vec3) -> Result<()> {
        check_spacing("spacing scale", scale)?;
        self.coordinator.set_spacing_scale(scale);
        self.catalog.mark_stale(..);
        Ok(())
    }

    /// Switch the active level, clamped to the pyramid; returns the level applied
    pub fn set_level(&mut self, level: u32) -> Result<u32> {
        let level = level.min(self.desc.level_count().saturating_sub(1));
        if level != self.level {
            self.level = level;
            self.geometry_changed()?;
            log::debug!("Active level -> {}", level);
        }
        Ok(level)
    }

    fn geometry_changed(&mut self) -> Result<()> {
        let (extent, spacing) = level_geometry(&self.desc, self.level)?;
        self.coordinator.set_level_geometry(extent, spacing);
        self.catalog.mark_stale(..);
        Ok(())
    }

    pub fn set_clip_params(&mut self, params: ClipParams) {
        self.coordinator.set_clip_params(params);
    }

    pub fn set_clip_rotation(&mut self, rotation_deg: [f32; 3]) {
        self.coordinator.set_clip_rotation(rotation_deg);
    }

    pub fn set_clip_interval(&mut self, axis: usize, lo: f32, hi: f32) -> bool {
        self.coordinator.set_clip_interval(axis, lo, hi)
    }

    pub fn transform(&self) -> Mat4 {
        self.coordinator.transform()
    }

    pub fn clip_planes(&self) -> &ClipPlaneSet {
        self.coordinator.clip_planes()
    }

    /// Brick world bounds lag the coordinator
    pub fn geometry_pending(&self) -> bool {
        self.catalog.geometry_revision() != self.coordinator.revision()
    }

    /// Bring brick world bounds up to date; returns the number of bricks
    /// moved from Stale back to Resident
    pub fn refresh_geometry(&mut self) -> usize {
        if !self.geometry_pending() {
            return 0;
        }
        let transform = self.coordinator.transform();
        self.catalog.refresh_geometry(&transform, self.coordinator.revision())
    }

    /// World-space box of a brick under the current transform
    pub fn world_bounds(&self, key: BrickKey) -> Option<Aabb> {
        let entry = self.catalog.lookup(key)?;
        Some(entry.bounds.transformed(&self.coordinator.transform()))
    }

    /// World-space voxel size of every level
    pub fn level_voxel_sizes(&self) -> Vec<Vec3> {
        let scale = self.coordinator.spacing_scale();
        (0..self.desc.level_count())
            .filter_map(|l| self.desc.level_spacing(l))
            .map(|s| s * scale)
            .collect()
    }

    /// Level the view wants for the volume center
    pub fn target_level(&self, view: &ViewState, detail_offset: i32) -> u32 {
        let center = self.transform().transform_point3(Vec3::splat(0.5));
        lod::target_level(view, center, &self.level_voxel_sizes(), detail_offset)
    }

    /// Per-brick priorities for one frame's request
    pub fn priorities(&self, keys: &[BrickKey], view: &ViewState, target_level: u32) -> HashMap<BrickKey, f32> {
        let transform = self.transform();
        keys.iter()
            .filter_map(|&key| {
                let center = self.catalog.lookup(key)?.bounds.transformed(&transform).center();
                Some((key, brick_priority(view.screen_distance(center), key.level, target_level)))
            })
            .collect()
    }

    /// Bricks of a level in render order
    pub fn sorted_bricks(&self, level: u32, view: &ViewState, order: UpdateOrder) -> Vec<BrickKey> {
        let transform = self.transform();
        let mut keyed: Vec<(f32, BrickKey)> = self
            .catalog
            .keys_at_level(level)
            .into_iter()
            .filter_map(|key| {
                let bounds = self.catalog.lookup(key)?.bounds.transformed(&transform);
                Some((view.sort_distance(&bounds), key))
            })
            .collect();
        keyed.sort_by(|a, b| match order {
            UpdateOrder::BackToFront => b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)),
            UpdateOrder::FrontToBack => a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)),
        });
        keyed.into_iter().map(|(_, key)| key).collect()
    }
}

fn level_geometry(desc: &PyramidDescriptor, level: u32) -> Result<(UVec3, Vec3)> {
    let extent = desc
        .level(level)
        .map(|l| l.extent())
        .ok_or_else(|| Error::InvalidDescriptor(format!("level {level} missing")))?;
    let spacing = desc
        .level_spacing(level)
        .ok_or_else(|| Error::InvalidDescriptor(format!("level {level} missing")))?;
    Ok((extent, spacing))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BitDepth, UVec3, Vec2};
    use crate::volume::catalog::BrickState;

    fn dataset() -> Dataset {
        let desc = PyramidDescriptor::multi_resolution(UVec3::new(32, 32, 16), BitDepth::U8, Vec3::ONE, 8, 3).unwrap();
        Dataset::new(desc).unwrap()
    }

    fn make_resident(ds: &mut Dataset, key: BrickKey) {
        let entry = ds.catalog_mut().lookup_mut(key).unwrap();
        let generation = entry.begin_load().unwrap();
        assert!(entry.finish_load(generation));
    }

    #[test]
    fn test_new_is_clean() {
        let ds = dataset();
        assert!(!ds.geometry_pending());
        assert_eq!(ds.transform().transform_point3(Vec3::ONE), Vec3::new(32.0, 32.0, 16.0));
    }

    #[test]
    fn test_spacing_change_marks_stale_then_refreshes() {
        let mut ds = dataset();
        let key = BrickKey::new(0, 1, 1, 0);
        make_resident(&mut ds, key);

        ds.set_base_spacing(Vec3::new(1.0, 1.0, 3.0)).unwrap();
        assert_eq!(ds.catalog().lookup(key).unwrap().state(), BrickState::Stale);
        assert!(ds.geometry_pending());
        // Transform is already current
        assert_eq!(ds.transform().transform_point3(Vec3::ONE), Vec3::new(32.0, 32.0, 48.0));

        assert_eq!(ds.refresh_geometry(), 1);
        let entry = ds.catalog().lookup(key).unwrap();
        assert_eq!(entry.state(), BrickState::Resident);
        assert_eq!(entry.world_bounds.max, Vec3::new(16.0, 16.0, 24.0));
        assert!(!ds.geometry_pending());
    }

    #[test]
    fn test_invalid_spacing_rejected() {
        let mut ds = dataset();
        assert!(ds.set_base_spacing(Vec3::new(0.0, 1.0, 1.0)).is_err());
        assert!(ds.set_spacing_scale(Vec3::new(1.0, f32::NAN, 1.0)).is_err());
        assert!(!ds.geometry_pending());
    }

    #[test]
    fn test_set_level_clamps() {
        let mut ds = dataset();
        assert_eq!(ds.set_level(9).unwrap(), 2);
        assert_eq!(ds.level(), 2);
        // Same world size on every level
        assert_eq!(ds.transform().transform_point3(Vec3::ONE), Vec3::new(32.0, 32.0, 16.0));
    }

    #[test]
    fn test_sorted_bricks_orders() {
        let ds = dataset();
        let view = ViewState::look_at(Vec3::new(4.0, 4.0, -50.0), Vec3::new(4.0, 4.0, 8.0), 0.8, Vec2::new(800.0, 600.0));
        let back = ds.sorted_bricks(0, &view, UpdateOrder::BackToFront);
        let front = ds.sorted_bricks(0, &view, UpdateOrder::FrontToBack);
        assert_eq!(back.len(), 32);
        assert_eq!(front[0], BrickKey::new(0, 0, 0, 0));
        assert_eq!(back.last(), Some(&BrickKey::new(0, 0, 0, 0)));
        assert_eq!(back[0].bz, 1);
    }

    #[test]
    fn test_priorities_prefer_target_level() {
        let ds = dataset();
        let view = ViewState::look_at(Vec3::new(16.0, 16.0, -40.0), Vec3::new(16.0, 16.0, 8.0), 0.8, Vec2::new(800.0, 600.0));
        let keys = [BrickKey::new(0, 1, 1, 0), BrickKey::new(2, 0, 0, 0)];
        let p = ds.priorities(&keys, &view, 2);
        assert!(p[&keys[1]] < p[&keys[0]]);
        assert!(ds.target_level(&view, 0) < ds.descriptor().level_count());
    }
}
