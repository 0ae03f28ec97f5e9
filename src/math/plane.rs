//! Half-space planes used for clipping

use crate::core::types::{Quat, Vec3};

/// A plane defined by normal and distance from origin.
///
/// Points with a non-negative signed distance are on the kept side.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Plane {
    pub normal: Vec3,
    pub distance: f32,
}

impl Plane {
    pub fn new(normal: Vec3, distance: f32) -> Self {
        Self { normal, distance }
    }

    /// Plane through `point` facing `normal`
    pub fn from_point_normal(point: Vec3, normal: Vec3) -> Self {
        let normal = normal.normalize_or_zero();
        Self {
            normal,
            distance: -normal.dot(point),
        }
    }

    /// Signed distance from point to plane (positive = in front)
    pub fn distance_to_point(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.distance
    }

    /// Move the plane by `offset`
    pub fn translate(&mut self, offset: Vec3) {
        self.distance -= self.normal.dot(offset);
    }

    /// Rotate the plane about the origin
    pub fn rotate(&mut self, rotation: Quat) {
        self.normal = rotation * self.normal;
    }

    /// Re-express the normal in a space stretched component-wise by
    /// `1 / scale`, keeping the plane's distance from the origin.
    ///
    /// Axis-aligned planes are unchanged; oblique normals tilt toward the
    /// axes with the smaller scale.
    pub fn scale(&mut self, scale: Vec3) {
        let n = self.normal / scale;
        let len = n.length();
        if len > 0.0 && len.is_finite() {
            self.normal = n / len;
        }
    }

    /// Packed `(nx, ny, nz, d)` for shader uniforms
    pub fn to_array(&self) -> [f32; 4] {
        [self.normal.x, self.normal.y, self.normal.z, self.distance]
    }
}
