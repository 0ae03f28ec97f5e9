//! Pyramid descriptor
//!
//! Static metadata for a dataset: per resolution level, the voxel extent and
//! the brick grid covering it, plus where each brick's payload comes from.
//! Bricks are `brick_edge` voxels on a side and do not overlap; bricks on
//! the far faces of a level are clipped to the level extent.

use crate::core::error::Error;
use crate::core::types::{BitDepth, BrickKey, Result, UVec3, Vec3};
use crate::math::Aabb;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One level of the pyramid
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolutionLevel {
    /// Voxel extent of the whole level
    pub extent: [u32; 3],
    /// Brick grid dimensions (bricks per axis)
    pub grid: [u32; 3],
    /// Downsample factor relative to level 0 (`2^level`)
    pub downsample: u32,
}

impl ResolutionLevel {
    fn new(extent: UVec3, brick_edge: u32, downsample: u32) -> Self {
        let grid = (extent + UVec3::splat(brick_edge - 1)) / brick_edge;
        Self {
            extent: extent.to_array(),
            grid: grid.to_array(),
            downsample,
        }
    }

    pub fn extent(&self) -> UVec3 {
        UVec3::from_array(self.extent)
    }

    pub fn grid(&self) -> UVec3 {
        UVec3::from_array(self.grid)
    }

    /// Number of bricks on this level
    pub fn brick_count(&self) -> usize {
        self.grid.iter().map(|&n| n as usize).product()
    }
}

/// Where the payload of a level lives
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Storage {
    /// One full-resolution buffer held by the decoder
    #[default]
    Memory,
    /// Directory of per-level, per-brick files
    Directory(PathBuf),
}

/// Back-pointer from a brick to its payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceLocator {
    File { path: PathBuf, offset: u64 },
    /// Voxel origin inside the full-resolution buffer
    Memory { origin: UVec3 },
}

/// Static description of a dataset's resolution pyramid
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PyramidDescriptor {
    pub bit_depth: BitDepth,
    /// Physical voxel size at level 0
    pub base_spacing: [f32; 3],
    /// Brick edge length in voxels, a power of two
    pub brick_edge: u32,
    pub levels: Vec<ResolutionLevel>,
    #[serde(skip)]
    pub storage: Storage,
}

impl PyramidDescriptor {
    /// Single-level descriptor backed by one in-memory buffer
    pub fn single_resolution(extent: UVec3, bit_depth: BitDepth, spacing: Vec3, brick_edge: u32) -> Result<Self> {
        Self::multi_resolution(extent, bit_depth, spacing, brick_edge, 1)
    }

    /// Descriptor with `level_count` levels, each halving the previous
    /// extent (never below one voxel)
    pub fn multi_resolution(
        extent: UVec3,
        bit_depth: BitDepth,
        spacing: Vec3,
        brick_edge: u32,
        level_count: u32,
    ) -> Result<Self> {
        if brick_edge == 0 || !brick_edge.is_power_of_two() {
            return Err(Error::InvalidDescriptor(format!(
                "brick edge {brick_edge} is not a power of two"
            )));
        }
        let mut levels = Vec::with_capacity(level_count as usize);
        let mut level_extent = extent;
        for l in 0..level_count {
            levels.push(ResolutionLevel::new(level_extent, brick_edge, 1 << l.min(31)));
            level_extent = (level_extent / 2).max(UVec3::ONE);
        }
        let desc = Self {
            bit_depth,
            base_spacing: spacing.to_array(),
            brick_edge,
            levels,
            storage: Storage::Memory,
        };
        desc.validate()?;
        Ok(desc)
    }

    /// Point brick locators at a directory pyramid
    pub fn with_directory(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage = Storage::Directory(root.into());
        self
    }

    /// Reject descriptors no catalog can be built from
    pub fn validate(&self) -> Result<()> {
        if self.levels.is_empty() {
            return Err(Error::InvalidDescriptor("pyramid declares zero levels".into()));
        }
        if self.levels[0].brick_count() == 0 {
            return Err(Error::InvalidDescriptor("level 0 declares zero bricks".into()));
        }
        if self.brick_edge == 0 || !self.brick_edge.is_power_of_two() {
            return Err(Error::InvalidDescriptor(format!(
                "brick edge {} is not a power of two",
                self.brick_edge
            )));
        }
        if self.base_spacing.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(Error::InvalidDescriptor(format!(
                "spacing {:?} must be positive",
                self.base_spacing
            )));
        }
        for (l, level) in self.levels.iter().enumerate() {
            if level.extent().cmpeq(UVec3::ZERO).any() {
                return Err(Error::InvalidDescriptor(format!(
                    "level {l} extent {:?} has a zero axis",
                    level.extent
                )));
            }
            let expected = (level.extent() + UVec3::splat(self.brick_edge - 1)) / self.brick_edge;
            if expected != level.grid() {
                return Err(Error::InvalidDescriptor(format!(
                    "level {l} grid {:?} does not cover extent {:?}",
                    level.grid, level.extent
                )));
            }
        }
        Ok(())
    }

    pub fn level_count(&self) -> u32 {
        self.levels.len() as u32
    }

    pub fn is_multiresolution(&self) -> bool {
        self.levels.len() > 1
    }

    pub fn level(&self, level: u32) -> Option<&ResolutionLevel> {
        self.levels.get(level as usize)
    }

    pub fn base_spacing(&self) -> Vec3 {
        Vec3::from_array(self.base_spacing)
    }

    /// Total bricks over all levels
    pub fn total_bricks(&self) -> usize {
        self.levels.iter().map(ResolutionLevel::brick_count).sum()
    }

    /// Bytes of one full (unclipped) brick
    pub fn brick_stride(&self) -> usize {
        (self.brick_edge as usize).pow(3) * self.bit_depth.bytes()
    }

    /// Whether the key addresses a brick of this pyramid
    pub fn contains(&self, key: BrickKey) -> bool {
        self.level(key.level)
            .is_some_and(|l| key.coord().cmplt(l.grid()).all())
    }

    /// Voxel origin of a brick within its level
    pub fn brick_origin(&self, key: BrickKey) -> Option<UVec3> {
        self.contains(key).then(|| key.coord() * self.brick_edge)
    }

    /// Voxel dimensions of a brick, clipped at the level boundary
    pub fn brick_dims(&self, key: BrickKey) -> Option<UVec3> {
        let level = self.level(key.level)?;
        let origin = self.brick_origin(key)?;
        Some((level.extent() - origin).min(UVec3::splat(self.brick_edge)))
    }

    /// Payload size of a brick in bytes
    pub fn brick_bytes(&self, key: BrickKey) -> Option<usize> {
        let dims = self.brick_dims(key)?;
        Some(dims.x as usize * dims.y as usize * dims.z as usize * self.bit_depth.bytes())
    }

    /// Largest single brick in the pyramid
    pub fn max_brick_bytes(&self) -> usize {
        self.levels
            .iter()
            .enumerate()
            .filter_map(|(l, _)| self.brick_bytes(BrickKey::new(l as u32, 0, 0, 0)))
            .max()
            .unwrap_or(0)
    }

    /// Brick box in the dataset's unit cube
    pub fn brick_bounds(&self, key: BrickKey) -> Option<Aabb> {
        let extent = self.level(key.level)?.extent().as_vec3();
        let origin = self.brick_origin(key)?.as_vec3();
        let dims = self.brick_dims(key)?.as_vec3();
        Some(Aabb::new(origin / extent, (origin + dims) / extent))
    }

    /// Payload back-pointer for a brick
    pub fn locator(&self, key: BrickKey) -> Option<SourceLocator> {
        let origin = self.brick_origin(key)?;
        Some(match &self.storage {
            Storage::Memory => SourceLocator::Memory { origin },
            Storage::Directory(root) => SourceLocator::File {
                path: super::disk_io::brick_path(root, key),
                offset: 0,
            },
        })
    }

    /// Brick containing a voxel of the given level
    pub fn key_for_voxel(&self, level: u32, voxel: UVec3) -> Option<BrickKey> {
        let l = self.level(level)?;
        if !voxel.cmplt(l.extent()).all() {
            return None;
        }
        let c = voxel / self.brick_edge;
        Some(BrickKey::new(level, c.x, c.y, c.z))
    }

    /// Adjacent brick along `axis` (0 = x, 1 = y, 2 = z) in direction `dir`
    pub fn neighbor(&self, key: BrickKey, axis: usize, dir: i32) -> Option<BrickKey> {
        if axis > 2 || !self.contains(key) {
            return None;
        }
        let mut c = key.coord().as_ivec3();
        c[axis] += dir.signum();
        if c[axis] < 0 {
            return None;
        }
        let c = c.as_uvec3();
        let n = BrickKey::new(key.level, c.x, c.y, c.z);
        self.contains(n).then_some(n)
    }

    /// Brick on the next coarser level covering this brick's origin
    pub fn coarser_key(&self, key: BrickKey) -> Option<BrickKey> {
        let here = self.level(key.level)?.extent();
        let there = self.level(key.level + 1)?.extent();
        if here.cmpeq(UVec3::ZERO).any() || there.cmpeq(UVec3::ZERO).any() {
            return None;
        }
        let origin = self.brick_origin(key)?;
        let mapped = (origin.as_dvec3() * there.as_dvec3() / here.as_dvec3())
            .floor()
            .as_uvec3()
            .min(there.saturating_sub(UVec3::ONE));
        self.key_for_voxel(key.level + 1, mapped)
    }

    /// Physical voxel size on a level
    pub fn level_spacing(&self, level: u32) -> Option<Vec3> {
        let base = self.levels.first()?.extent().as_vec3();
        let here = self.level(level)?.extent().as_vec3();
        Some(self.base_spacing() * base / here)
    }

    /// Read a JSON header; storage is left as `Memory`
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let desc: Self = serde_json::from_str(&text)?;
        desc.validate()?;
        Ok(desc)
    }

    /// Write the JSON header
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc() -> PyramidDescriptor {
        PyramidDescriptor::multi_resolution(UVec3::new(20, 16, 8), BitDepth::U16, Vec3::new(1.0, 1.0, 2.0), 8, 3)
            .unwrap()
    }

    #[test]
    fn test_levels_halve() {
        let d = desc();
        assert_eq!(d.level_count(), 3);
        assert_eq!(d.level(0).unwrap().grid(), UVec3::new(3, 2, 1));
        assert_eq!(d.level(1).unwrap().extent(), UVec3::new(10, 8, 4));
        assert_eq!(d.level(2).unwrap().extent(), UVec3::new(5, 4, 2));
        assert_eq!(d.level(2).unwrap().downsample, 4);
        assert_eq!(d.total_bricks(), 6 + 2 + 1);
        assert!(d.is_multiresolution());
    }

    #[test]
    fn test_zero_levels_rejected() {
        let result = PyramidDescriptor::multi_resolution(UVec3::splat(8), BitDepth::U8, Vec3::ONE, 8, 0);
        assert!(matches!(result, Err(Error::InvalidDescriptor(_))));
    }

    #[test]
    fn test_zero_bricks_rejected() {
        let result = PyramidDescriptor::single_resolution(UVec3::new(0, 8, 8), BitDepth::U8, Vec3::ONE, 8);
        assert!(matches!(result, Err(Error::InvalidDescriptor(_))));
    }

    #[test]
    fn test_negative_spacing_rejected() {
        let result = PyramidDescriptor::single_resolution(UVec3::splat(8), BitDepth::U8, Vec3::new(1.0, -1.0, 1.0), 8);
        assert!(matches!(result, Err(Error::InvalidDescriptor(_))));
    }

    #[test]
    fn test_non_power_of_two_edge_rejected() {
        let result = PyramidDescriptor::single_resolution(UVec3::splat(8), BitDepth::U8, Vec3::ONE, 6);
        assert!(result.is_err());
    }

    #[test]
    fn test_contains_and_dims() {
        let d = desc();
        assert!(d.contains(BrickKey::new(0, 2, 1, 0)));
        assert!(!d.contains(BrickKey::new(0, 3, 0, 0)));
        assert!(!d.contains(BrickKey::new(3, 0, 0, 0)));
        // Edge brick clipped to 20 - 16 = 4 voxels in x
        assert_eq!(d.brick_dims(BrickKey::new(0, 2, 0, 0)), Some(UVec3::new(4, 8, 8)));
        assert_eq!(d.brick_bytes(BrickKey::new(0, 2, 0, 0)), Some(4 * 8 * 8 * 2));
        assert_eq!(d.max_brick_bytes(), 8 * 8 * 8 * 2);
        assert_eq!(d.brick_dims(BrickKey::new(0, 9, 0, 0)), None);
    }

    #[test]
    fn test_brick_bounds() {
        let d = desc();
        let b = d.brick_bounds(BrickKey::new(0, 2, 1, 0)).unwrap();
        assert_eq!(b.min, Vec3::new(0.8, 0.5, 0.0));
        assert_eq!(b.max, Vec3::ONE);
    }

    #[test]
    fn test_neighbor() {
        let d = desc();
        let k = BrickKey::new(0, 0, 0, 0);
        assert_eq!(d.neighbor(k, 0, 1), Some(BrickKey::new(0, 1, 0, 0)));
        assert_eq!(d.neighbor(k, 0, -1), None);
        assert_eq!(d.neighbor(k, 2, 1), None);
        assert_eq!(d.neighbor(k, 3, 1), None);
    }

    #[test]
    fn test_coarser_key() {
        let d = desc();
        assert_eq!(d.coarser_key(BrickKey::new(0, 2, 1, 0)), Some(BrickKey::new(1, 1, 0, 0)));
        assert_eq!(d.coarser_key(BrickKey::new(1, 1, 0, 0)), Some(BrickKey::new(2, 0, 0, 0)));
        assert_eq!(d.coarser_key(BrickKey::new(2, 0, 0, 0)), None);
    }

    #[test]
    fn test_level_spacing() {
        let d = desc();
        assert_eq!(d.level_spacing(0), Some(Vec3::new(1.0, 1.0, 2.0)));
        assert_eq!(d.level_spacing(1), Some(Vec3::new(2.0, 2.0, 4.0)));
        assert_eq!(d.level_spacing(5), None);
    }

    #[test]
    fn test_locator() {
        let d = desc();
        assert_eq!(
            d.locator(BrickKey::new(0, 1, 1, 0)),
            Some(SourceLocator::Memory { origin: UVec3::new(8, 8, 0) })
        );
        let d = d.with_directory("/data/pyr");
        match d.locator(BrickKey::new(1, 1, 0, 0)) {
            Some(SourceLocator::File { path, offset }) => {
                assert!(path.ends_with("level_1/brick_1_0_0.brk"));
                assert_eq!(offset, 0);
            }
            other => panic!("unexpected locator {other:?}"),
        }
    }

    #[test]
    fn test_json_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pyramid.json");
        let d = desc();
        d.save(&path).unwrap();
        let loaded = PyramidDescriptor::load(&path).unwrap();
        assert_eq!(loaded, d);
    }

    #[test]
    fn test_zero_extent_level_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pyramid.json");
        let mut d = desc();
        d.levels[1].extent = [0, 0, 0];
        d.levels[1].grid = [0, 0, 0];
        std::fs::write(&path, serde_json::to_string_pretty(&d).unwrap()).unwrap();
        assert!(matches!(PyramidDescriptor::load(&path), Err(Error::InvalidDescriptor(_))));
        assert!(crate::volume::BrickCatalog::build(&d).is_err());
        // Unvalidated descriptors still never underflow
        assert_eq!(d.coarser_key(BrickKey::new(0, 1, 0, 0)), None);
    }
}
