//! Transform & clip coordinator
//!
//! Holds the inputs that shape a dataset in world space (level extent and
//! spacing, user spacing scale, clip parameters) and the two products
//! derived from them. Every setter re-derives both products before it
//! returns, so reads never observe a half-updated pair and never mutate.

use crate::core::types::{Mat4, UVec3, Vec3};

use super::planes::{ClipParams, ClipPlaneSet};

#[derive(Clone, Debug)]
pub struct TransformCoordinator {
    extent: UVec3,
    level_spacing: Vec3,
    spacing_scale: Vec3,
    params: ClipParams,
    transform: Mat4,
    planes: ClipPlaneSet,
    revision: u64,
}

impl TransformCoordinator {
    pub fn new(extent: UVec3, level_spacing: Vec3) -> Self {
        let mut coordinator = Self {
            extent,
            level_spacing,
            spacing_scale: Vec3::ONE,
            params: ClipParams::default(),
            transform: Mat4::IDENTITY,
            planes: ClipPlaneSet::default(),
            revision: 0,
        };
        coordinator.recompute();
        coordinator
    }

    /// Extent and voxel size of the active level
    pub fn set_level_geometry(&mut self, extent: UVec3, level_spacing: Vec3) {
        self.extent = extent;
        self.level_spacing = level_spacing;
        self.recompute();
    }

    pub fn set_spacing_scale(&mut self, scale: Vec3) {
        self.spacing_scale = scale;
        self.recompute();
    }

    pub fn set_clip_params(&mut self, params: ClipParams) {
        self.params = params;
        self.recompute();
    }

    pub fn set_clip_rotation(&mut self, rotation_deg: [f32; 3]) {
        self.params.rotation_deg = rotation_deg;
        self.recompute();
    }

    /// Returns false, leaving everything untouched, for a bad axis or value
    pub fn set_clip_interval(&mut self, axis: usize, lo: f32, hi: f32) -> bool {
        if !self.params.set_interval(axis, lo, hi) {
            return false;
        }
        self.recompute();
        true
    }

    pub fn clip_params(&self) -> &ClipParams {
        &self.params
    }

    pub fn spacing_scale(&self) -> Vec3 {
        self.spacing_scale
    }

    /// Effective voxel size on the active level
    pub fn spacing(&self) -> Vec3 {
        self.level_spacing * self.spacing_scale
    }

    /// Physical size of the whole volume
    pub fn world_size(&self) -> Vec3 {
        self.extent.as_vec3() * self.spacing()
    }

    /// Unit-cube-to-world transform
    pub fn transform(&self) -> Mat4 {
        self.transform
    }

    pub fn clip_planes(&self) -> &ClipPlaneSet {
        &self.planes
    }

    /// Bumped once per derivation
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn recompute(&mut self) {
        let size = self.world_size();
        self.transform = Mat4::from_scale(size);

        let spacing = self.spacing();
        let scale = if spacing.cmpgt(Vec3::ZERO).all() && self.extent.cmpgt(UVec3::ZERO).all() {
            (Vec3::ONE / size).normalize_or(Vec3::ONE)
        } else {
            Vec3::ONE
        };
        self.planes = ClipPlaneSet::derive(&self.params, scale);
        self.revision += 1;
        log::trace!("Re-derived transform and clip planes (revision {})", self.revision);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> TransformCoordinator {
        TransformCoordinator::new(UVec3::new(200, 100, 50), Vec3::new(0.5, 0.5, 2.0))
    }

    #[test]
    fn test_transform_from_extent_and_spacing() {
        let c = coordinator();
        let corner = c.transform().transform_point3(Vec3::ONE);
        assert_eq!(corner, Vec3::new(100.0, 50.0, 100.0));
    }

    #[test]
    fn test_level_change_keeps_world_size() {
        let mut c = coordinator();
        let before = c.transform();
        // Next coarser level: half the voxels, twice the spacing
        c.set_level_geometry(UVec3::new(100, 50, 25), Vec3::new(1.0, 1.0, 4.0));
        assert_eq!(c.transform(), before);
    }

    #[test]
    fn test_every_setter_bumps_revision() {
        let mut c = coordinator();
        let r0 = c.revision();
        c.set_spacing_scale(Vec3::new(1.0, 1.0, 2.0));
        c.set_clip_rotation([10.0, 0.0, 0.0]);
        assert!(c.set_clip_interval(2, 0.1, 0.9));
        assert!(!c.set_clip_interval(5, 0.1, 0.9));
        assert_eq!(c.revision(), r0 + 3);
        assert_eq!(c.spacing(), Vec3::new(0.5, 0.5, 4.0));
    }

    #[test]
    fn test_reads_are_bit_identical() {
        let mut c = coordinator();
        c.set_clip_rotation([15.0, 30.0, 45.0]);
        c.set_spacing_scale(Vec3::new(1.0, 2.0, 0.5));
        c.set_level_geometry(UVec3::new(100, 50, 25), Vec3::new(1.0, 1.0, 4.0));
        let (t1, p1) = (c.transform(), *c.clip_planes());
        let (t2, p2) = (c.transform(), *c.clip_planes());
        assert_eq!(t1.to_cols_array(), t2.to_cols_array());
        assert_eq!(p1.to_arrays(), p2.to_arrays());
    }

    #[test]
    fn test_clip_planes_follow_interval() {
        let mut c = coordinator();
        c.set_clip_interval(0, 0.5, 1.0);
        assert!(!c.clip_planes().contains(Vec3::new(0.25, 0.5, 0.5)));
        assert!(c.clip_planes().contains(Vec3::new(0.75, 0.5, 0.5)));
    }
}
