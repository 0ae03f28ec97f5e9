//! User-facing clip parameters and the derived six-plane set

use serde::{Deserialize, Serialize};

use crate::core::types::{EulerRot, Quat, Vec3};
use crate::math::Plane;

/// Clip box as the user edits it
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClipParams {
    /// Kept `[lo, hi]` interval per axis, in the unit cube
    pub intervals: [[f32; 2]; 3],
    /// Euler rotation of the box about the volume center, degrees
    pub rotation_deg: [f32; 3],
}

impl Default for ClipParams {
    fn default() -> Self {
        Self {
            intervals: [[0.0, 1.0]; 3],
            rotation_deg: [0.0; 3],
        }
    }
}

impl ClipParams {
    /// Set one axis interval, clamped to the unit cube with `lo <= hi`
    pub fn set_interval(&mut self, axis: usize, lo: f32, hi: f32) -> bool {
        if axis > 2 || !lo.is_finite() || !hi.is_finite() {
            return false;
        }
        let lo = lo.clamp(0.0, 1.0);
        let hi = hi.clamp(0.0, 1.0);
        self.intervals[axis] = [lo.min(hi), lo.max(hi)];
        true
    }

    pub fn rotation(&self) -> Quat {
        let [x, y, z] = self.rotation_deg;
        Quat::from_euler(EulerRot::XYZ, x.to_radians(), y.to_radians(), z.to_radians())
    }
}

/// Six half-spaces in the unit cube: `-x, +x, -y, +y, -z, +z` faces
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClipPlaneSet {
    pub planes: [Plane; 6],
}

impl Default for ClipPlaneSet {
    fn default() -> Self {
        Self::axis_aligned(&ClipParams::default())
    }
}

impl ClipPlaneSet {
    /// Unrotated planes bounding the intervals
    pub fn axis_aligned(params: &ClipParams) -> Self {
        let mut planes = [Plane::new(Vec3::X, 0.0); 6];
        for axis in 0..3 {
            let [lo, hi] = params.intervals[axis];
            let mut n = Vec3::ZERO;
            n[axis] = 1.0;
            let mut p_lo = Vec3::ZERO;
            p_lo[axis] = lo;
            let mut p_hi = Vec3::ZERO;
            p_hi[axis] = hi;
            planes[axis * 2] = Plane::from_point_normal(p_lo, n);
            planes[axis * 2 + 1] = Plane::from_point_normal(p_hi, -n);
        }
        Self { planes }
    }

    /// Derive the plane set for a box rotated about the volume center.
    ///
    /// `scale` is the normalised `1 / (resolution * spacing)` of the level.
    /// The step order matters: center, rotate, scale, un-center.
    pub fn derive(params: &ClipParams, scale: Vec3) -> Self {
        let mut set = Self::axis_aligned(params);
        let rotation = params.rotation();
        for plane in &mut set.planes {
            plane.translate(Vec3::splat(-0.5));
            plane.rotate(rotation);
            plane.scale(scale);
            plane.translate(Vec3::splat(0.5));
        }
        set
    }

    /// Point is inside every half-space
    pub fn contains(&self, point: Vec3) -> bool {
        self.planes.iter().all(|p| p.distance_to_point(point) >= -1e-6)
    }

    /// Packed planes for a shader uniform block
    pub fn to_arrays(&self) -> [[f32; 4]; 6] {
        self.planes.map(|p| p.to_array())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_keeps_whole_cube() {
        let set = ClipPlaneSet::default();
        assert!(set.contains(Vec3::ZERO));
        assert!(set.contains(Vec3::ONE));
        assert!(set.contains(Vec3::splat(0.5)));
        assert!(!set.contains(Vec3::new(1.1, 0.5, 0.5)));
    }

    #[test]
    fn test_interval_clamped_and_ordered() {
        let mut params = ClipParams::default();
        assert!(params.set_interval(1, 0.8, -0.3));
        assert_eq!(params.intervals[1], [0.0, 0.8]);
        assert!(!params.set_interval(3, 0.0, 1.0));
        assert!(!params.set_interval(0, f32::NAN, 1.0));
    }

    #[test]
    fn test_unrotated_derive_matches_intervals() {
        let mut params = ClipParams::default();
        params.set_interval(0, 0.25, 0.75);
        let scale = Vec3::new(1.0, 1.0, 0.2).normalize();
        let set = ClipPlaneSet::derive(&params, scale);
        assert!(set.contains(Vec3::new(0.3, 0.5, 0.5)));
        assert!(!set.contains(Vec3::new(0.2, 0.5, 0.5)));
        assert!(!set.contains(Vec3::new(0.8, 0.5, 0.5)));
        assert!(set.contains(Vec3::new(0.5, 0.0, 1.0)));
    }

    #[test]
    fn test_rotation_about_center() {
        let mut params = ClipParams::default();
        params.set_interval(0, 0.4, 0.6);
        params.rotation_deg = [0.0, 0.0, 90.0];
        let set = ClipPlaneSet::derive(&params, Vec3::ONE.normalize());
        // The x slab now runs along y
        assert!(set.contains(Vec3::new(0.5, 0.45, 0.5)));
        assert!(set.contains(Vec3::new(0.9, 0.5, 0.5)));
        assert!(!set.contains(Vec3::new(0.5, 0.3, 0.5)));
    }
}
