//! Core type aliases and shared value types

use serde::{Deserialize, Serialize};

pub use glam::{
    Vec2, Vec3, Vec4,
    Mat3, Mat4,
    Quat, EulerRot,
    IVec3, UVec3,
};

/// Standard Result type for the cache
pub type Result<T> = std::result::Result<T, crate::core::error::Error>;

/// Address of one brick: pyramid level plus brick-grid coordinate.
///
/// Keys are only meaningful for the dataset whose catalog produced them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BrickKey {
    pub level: u32,
    pub bx: u32,
    pub by: u32,
    pub bz: u32,
}

impl BrickKey {
    pub fn new(level: u32, bx: u32, by: u32, bz: u32) -> Self {
        Self { level, bx, by, bz }
    }

    /// Brick-grid coordinate as a vector
    pub fn coord(&self) -> UVec3 {
        UVec3::new(self.bx, self.by, self.bz)
    }

    /// Same brick coordinate on another level
    pub fn with_level(&self, level: u32) -> Self {
        Self { level, ..*self }
    }
}

impl std::fmt::Display for BrickKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}({}, {}, {})", self.level, self.bx, self.by, self.bz)
    }
}

/// Storage width of one voxel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BitDepth {
    U8,
    U16,
    U32,
}

impl BitDepth {
    /// Bytes per voxel
    pub fn bytes(self) -> usize {
        match self {
            BitDepth::U8 => 1,
            BitDepth::U16 => 2,
            BitDepth::U32 => 4,
        }
    }

    /// Largest representable voxel value
    pub fn max_value(self) -> u32 {
        match self {
            BitDepth::U8 => u8::MAX as u32,
            BitDepth::U16 => u16::MAX as u32,
            BitDepth::U32 => u32::MAX,
        }
    }
}
