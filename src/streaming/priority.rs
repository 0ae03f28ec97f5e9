//! Brick priority and the per-frame admission queue
//!
//! Priority is a plain float where lower means "load first":
//!
//! ```text
//! priority = screen_distance + LEVEL_MISMATCH_WEIGHT * |level - target_level|
//! ```
//!
//! `screen_distance` is the distance of the brick's projected center from
//! the viewport center in normalized device coordinates, so a brick at the
//! center of the screen scores 0 and one at a corner about 1.41.

use crate::core::types::{BrickKey, Mat4, Vec2, Vec3};
use crate::math::Aabb;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Cost of each level between a brick and the level the view wants
pub const LEVEL_MISMATCH_WEIGHT: f32 = 1.0;

/// Screen distance assigned to bricks behind the eye
pub const BEHIND_EYE_DISTANCE: f32 = 1.0e3;

/// Camera projection model
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Projection {
    Perspective { fovy_radians: f32 },
    /// World-space height of the view volume
    Orthographic { height: f32 },
}

/// Everything the cache needs to know about the current view
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewState {
    pub eye: Vec3,
    /// Unit view direction
    pub forward: Vec3,
    pub up: Vec3,
    pub projection: Projection,
    /// Viewport size in pixels
    pub viewport: Vec2,
    pub near: f32,
    pub far: f32,
}

impl ViewState {
    /// Perspective view looking from `eye` at `target`
    pub fn look_at(eye: Vec3, target: Vec3, fovy_radians: f32, viewport: Vec2) -> Self {
        Self {
            eye,
            forward: (target - eye).normalize_or_zero(),
            up: Vec3::Y,
            projection: Projection::Perspective { fovy_radians },
            viewport,
            near: 0.01,
            far: 1.0e5,
        }
    }

    pub fn is_perspective(&self) -> bool {
        matches!(self.projection, Projection::Perspective { .. })
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.eye, self.forward, self.up)
    }

    pub fn projection_matrix(&self) -> Mat4 {
        let aspect = if self.viewport.y > 0.0 { self.viewport.x / self.viewport.y } else { 1.0 };
        match self.projection {
            Projection::Perspective { fovy_radians } => {
                Mat4::perspective_rh(fovy_radians, aspect, self.near, self.far)
            }
            Projection::Orthographic { height } => {
                let h = height * 0.5;
                let w = h * aspect;
                Mat4::orthographic_rh(-w, w, -h, h, self.near, self.far)
            }
        }
    }

    pub fn view_proj(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// World-space size covered by one pixel at `point`
    pub fn pixel_footprint(&self, point: Vec3) -> f32 {
        let height_px = self.viewport.y.max(1.0);
        match self.projection {
            Projection::Perspective { fovy_radians } => {
                let depth = (point - self.eye).dot(self.forward).max(self.near);
                2.0 * depth * (fovy_radians * 0.5).tan() / height_px
            }
            Projection::Orthographic { height } => height / height_px,
        }
    }

    /// Distance of a point's projection from the viewport center, in NDC
    pub fn screen_distance(&self, point: Vec3) -> f32 {
        let clip = self.view_proj() * point.extend(1.0);
        if clip.w <= 0.0 {
            return BEHIND_EYE_DISTANCE;
        }
        Vec2::new(clip.x, clip.y).length() / clip.w
    }

    /// Render-order distance of a box: nearest corner of the box shrunk by
    /// a thousandth of its diagonal, measured from the eye (perspective) or
    /// along the view direction (orthographic)
    pub fn sort_distance(&self, bounds: &Aabb) -> f32 {
        let shrunk = bounds.shrunk(0.001);
        shrunk
            .corners()
            .iter()
            .map(|c| {
                if self.is_perspective() {
                    c.distance(self.eye)
                } else {
                    (*c - self.eye).dot(self.forward)
                }
            })
            .fold(f32::INFINITY, f32::min)
    }
}

/// Priority of one brick for the current frame
pub fn brick_priority(screen_distance: f32, level: u32, target_level: u32) -> f32 {
    screen_distance.max(0.0) + LEVEL_MISMATCH_WEIGHT * level.abs_diff(target_level) as f32
}

/// A brick waiting for admission
#[derive(Clone, Copy, Debug)]
pub struct AdmissionCandidate {
    pub key: BrickKey,
    /// Lower = more urgent
    pub priority: f32,
    pub bytes: u64,
}

impl Eq for AdmissionCandidate {}

impl PartialEq for AdmissionCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Ord for AdmissionCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Lowest priority value pops first from the max-heap; key breaks ties
        // so the order is deterministic
        other
            .priority
            .total_cmp(&self.priority)
            .then_with(|| other.key.cmp(&self.key))
    }
}

impl PartialOrd for AdmissionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-priority queue of bricks to consider this frame
#[derive(Default)]
pub struct AdmissionQueue {
    heap: BinaryHeap<AdmissionCandidate>,
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: AdmissionCandidate) {
        self.heap.push(candidate);
    }

    /// Most urgent candidate
    pub fn pop(&mut self) -> Option<AdmissionCandidate> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    /// Drain in ascending priority order
    pub fn into_sorted(self) -> Vec<AdmissionCandidate> {
        // into_sorted_vec is ascending by Ord, i.e. least urgent first
        let mut v = self.heap.into_sorted_vec();
        v.reverse();
        v
    }
}
