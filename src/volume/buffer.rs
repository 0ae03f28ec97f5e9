//! Typed 3-D voxel arrays
//!
//! A [`VoxelBuffer`] is the unit of brick payload: an owned x-fastest array
//! of 8, 16 or 32 bit voxels with physical spacing metadata. Decoders produce
//! them on worker threads and hand them to the render thread by value.

use crate::core::types::{BitDepth, Result, UVec3, Vec3};
use rayon::prelude::*;
use std::io;

/// Typed voxel storage
#[derive(Clone, Debug, PartialEq)]
pub enum VoxelData {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
}

impl VoxelData {
    fn zeroed(depth: BitDepth, len: usize) -> Self {
        match depth {
            BitDepth::U8 => VoxelData::U8(vec![0; len]),
            BitDepth::U16 => VoxelData::U16(vec![0; len]),
            BitDepth::U32 => VoxelData::U32(vec![0; len]),
        }
    }

    fn from_values(depth: BitDepth, values: Vec<u32>) -> Self {
        match depth {
            BitDepth::U8 => VoxelData::U8(values.into_iter().map(|v| v as u8).collect()),
            BitDepth::U16 => VoxelData::U16(values.into_iter().map(|v| v as u16).collect()),
            BitDepth::U32 => VoxelData::U32(values),
        }
    }

    pub fn depth(&self) -> BitDepth {
        match self {
            VoxelData::U8(_) => BitDepth::U8,
            VoxelData::U16(_) => BitDepth::U16,
            VoxelData::U32(_) => BitDepth::U32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            VoxelData::U8(v) => v.len(),
            VoxelData::U16(v) => v.len(),
            VoxelData::U32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn get(&self, idx: usize) -> u32 {
        match self {
            VoxelData::U8(v) => v[idx] as u32,
            VoxelData::U16(v) => v[idx] as u32,
            VoxelData::U32(v) => v[idx],
        }
    }

    #[inline]
    fn set(&mut self, idx: usize, value: u32) {
        match self {
            VoxelData::U8(v) => v[idx] = value as u8,
            VoxelData::U16(v) => v[idx] = value as u16,
            VoxelData::U32(v) => v[idx] = value,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        match self {
            VoxelData::U8(v) => v.as_slice(),
            VoxelData::U16(v) => bytemuck::cast_slice(v.as_slice()),
            VoxelData::U32(v) => bytemuck::cast_slice(v.as_slice()),
        }
    }

    fn all_zero(&self) -> bool {
        match self {
            VoxelData::U8(v) => v.par_iter().all(|&x| x == 0),
            VoxelData::U16(v) => v.par_iter().all(|&x| x == 0),
            VoxelData::U32(v) => v.par_iter().all(|&x| x == 0),
        }
    }
}

/// Owned 3-D voxel array with spacing
#[derive(Clone, Debug, PartialEq)]
pub struct VoxelBuffer {
    dims: UVec3,
    spacing: Vec3,
    data: VoxelData,
}

impl VoxelBuffer {
    /// Create a zero-filled buffer
    pub fn zeroed(dims: UVec3, depth: BitDepth, spacing: Vec3) -> Self {
        let len = (dims.x as usize) * (dims.y as usize) * (dims.z as usize);
        Self {
            dims,
            spacing,
            data: VoxelData::zeroed(depth, len),
        }
    }

    /// Wrap existing typed storage
    ///
    /// Fails if the storage length does not match `dims`.
    pub fn from_data(dims: UVec3, spacing: Vec3, data: VoxelData) -> Result<Self> {
        let expected = (dims.x as usize) * (dims.y as usize) * (dims.z as usize);
        if data.len() != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("voxel count {} does not match dims {:?} ({})", data.len(), dims, expected),
            )
            .into());
        }
        Ok(Self { dims, spacing, data })
    }

    /// Build a buffer from little-endian raw bytes
    ///
    /// A short buffer is an error; trailing bytes are ignored.
    pub fn from_bytes(dims: UVec3, depth: BitDepth, spacing: Vec3, bytes: &[u8]) -> Result<Self> {
        let len = (dims.x as usize) * (dims.y as usize) * (dims.z as usize);
        let needed = len * depth.bytes();
        if bytes.len() < needed {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short voxel buffer: {} of {} bytes", bytes.len(), needed),
            )
            .into());
        }
        let bytes = &bytes[..needed];
        let data = match depth {
            BitDepth::U8 => VoxelData::U8(bytes.to_vec()),
            BitDepth::U16 => VoxelData::U16(
                bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect(),
            ),
            BitDepth::U32 => VoxelData::U32(
                bytes
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
        };
        Ok(Self { dims, spacing, data })
    }

    pub fn dims(&self) -> UVec3 {
        self.dims
    }

    pub fn spacing(&self) -> Vec3 {
        self.spacing
    }

    pub fn set_spacing(&mut self, spacing: Vec3) {
        self.spacing = spacing;
    }

    pub fn depth(&self) -> BitDepth {
        self.data.depth()
    }

    pub fn data(&self) -> &VoxelData {
        &self.data
    }

    pub fn voxel_count(&self) -> usize {
        self.data.len()
    }

    /// Payload size in bytes
    pub fn byte_len(&self) -> usize {
        self.data.len() * self.depth().bytes()
    }

    /// Raw payload in host byte order (little-endian on supported targets)
    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_bytes()
    }

    /// Payload as little-endian bytes regardless of host order
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match &self.data {
            VoxelData::U8(v) => v.clone(),
            VoxelData::U16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            VoxelData::U32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }

    #[inline]
    fn index(&self, i: u32, j: u32, k: u32) -> Option<usize> {
        if i >= self.dims.x || j >= self.dims.y || k >= self.dims.z {
            return None;
        }
        let (nx, ny) = (self.dims.x as usize, self.dims.y as usize);
        Some(i as usize + nx * (j as usize + ny * k as usize))
    }

    /// Read a voxel, `None` outside the buffer
    pub fn get(&self, i: u32, j: u32, k: u32) -> Option<u32> {
        self.index(i, j, k).map(|idx| self.data.get(idx))
    }

    /// Write a voxel; values are truncated to the bit depth.
    ///
    /// Returns false outside the buffer.
    pub fn set(&mut self, i: u32, j: u32, k: u32, value: u32) -> bool {
        match self.index(i, j, k) {
            Some(idx) => {
                self.data.set(idx, value);
                true
            }
            None => false,
        }
    }

    /// Set every voxel to `value`
    pub fn fill(&mut self, value: u32) {
        match &mut self.data {
            VoxelData::U8(v) => v.fill(value as u8),
            VoxelData::U16(v) => v.fill(value as u16),
            VoxelData::U32(v) => v.fill(value),
        }
    }

    /// Fill each voxel from its (i, j, k) coordinate, in parallel
    pub fn fill_with<F>(&mut self, f: F)
    where
        F: Fn(u32, u32, u32) -> u32 + Sync,
    {
        let (nx, ny) = (self.dims.x as usize, self.dims.y as usize);
        let coord = |idx: usize| {
            let i = idx % nx;
            let j = (idx / nx) % ny;
            let k = idx / (nx * ny);
            f(i as u32, j as u32, k as u32)
        };
        match &mut self.data {
            VoxelData::U8(v) => v.par_iter_mut().enumerate().for_each(|(idx, x)| *x = coord(idx) as u8),
            VoxelData::U16(v) => v.par_iter_mut().enumerate().for_each(|(idx, x)| *x = coord(idx) as u16),
            VoxelData::U32(v) => v.par_iter_mut().enumerate().for_each(|(idx, x)| *x = coord(idx)),
        }
    }

    /// True when every voxel is zero
    pub fn is_empty(&self) -> bool {
        self.data.all_zero()
    }

    /// Copy a sub-box starting at `origin`; voxels outside the source read as zero
    pub fn copy_region(&self, origin: UVec3, dims: UVec3) -> VoxelBuffer {
        let mut out = VoxelBuffer::zeroed(dims, self.depth(), self.spacing);
        let end = (origin + dims).min(self.dims);
        if origin.x >= end.x || origin.y >= end.y || origin.z >= end.z {
            return out;
        }
        let run = (end.x - origin.x) as usize;
        for k in origin.z..end.z {
            for j in origin.y..end.y {
                let (Some(src), Some(dst)) = (
                    self.index(origin.x, j, k),
                    out.index(0, j - origin.y, k - origin.z),
                ) else {
                    continue;
                };
                match (&self.data, &mut out.data) {
                    (VoxelData::U8(s), VoxelData::U8(d)) => d[dst..dst + run].copy_from_slice(&s[src..src + run]),
                    (VoxelData::U16(s), VoxelData::U16(d)) => d[dst..dst + run].copy_from_slice(&s[src..src + run]),
                    (VoxelData::U32(s), VoxelData::U32(d)) => d[dst..dst + run].copy_from_slice(&s[src..src + run]),
                    _ => {}
                }
            }
        }
        out
    }

    /// Halve each dimension (minimum 1) with a box filter; spacing doubles
    /// along the axes that shrank.
    pub fn downsample_2x(&self) -> VoxelBuffer {
        let src = self.dims;
        let dst = (src / 2).max(UVec3::ONE);
        let (nx, ny) = (dst.x as usize, dst.y as usize);
        let count = nx * ny * dst.z as usize;

        let values: Vec<u32> = (0..count)
            .into_par_iter()
            .map(|idx| {
                let x = (idx % nx) as u32;
                let y = ((idx / nx) % ny) as u32;
                let z = (idx / (nx * ny)) as u32;
                let lo = UVec3::new(x, y, z) * 2;
                let hi = (lo + UVec3::splat(2)).min(src);
                let mut sum = 0u64;
                let mut n = 0u64;
                for k in lo.z..hi.z {
                    for j in lo.y..hi.y {
                        for i in lo.x..hi.x {
                            if let Some(v) = self.get(i, j, k) {
                                sum += v as u64;
                                n += 1;
                            }
                        }
                    }
                }
                if n == 0 { 0 } else { (sum / n) as u32 }
            })
            .collect();

        let scale = src.as_vec3() / dst.as_vec3();
        VoxelBuffer {
            dims: dst,
            spacing: self.spacing * scale,
            data: VoxelData::from_values(self.depth(), values),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed() {
        let buf = VoxelBuffer::zeroed(UVec3::new(4, 3, 2), BitDepth::U16, Vec3::ONE);
        assert_eq!(buf.voxel_count(), 24);
        assert_eq!(buf.byte_len(), 48);
        assert_eq!(buf.as_bytes().len(), 48);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_get_set_bounds() {
        let mut buf = VoxelBuffer::zeroed(UVec3::splat(4), BitDepth::U8, Vec3::ONE);
        assert!(buf.set(1, 2, 3, 7));
        assert_eq!(buf.get(1, 2, 3), Some(7));
        assert!(!buf.set(4, 0, 0, 1));
        assert_eq!(buf.get(0, 4, 0), None);
        assert!(!buf.is_empty());
    }

    #[test]
    fn test_set_truncates_to_depth() {
        let mut buf = VoxelBuffer::zeroed(UVec3::ONE, BitDepth::U8, Vec3::ONE);
        buf.set(0, 0, 0, 0x1ff);
        assert_eq!(buf.get(0, 0, 0), Some(0xff));
    }

    #[test]
    fn test_from_bytes_little_endian() {
        let bytes = [0x01, 0x02, 0x03, 0x04];
        let buf = VoxelBuffer::from_bytes(UVec3::new(2, 1, 1), BitDepth::U16, Vec3::ONE, &bytes).unwrap();
        assert_eq!(buf.get(0, 0, 0), Some(0x0201));
        assert_eq!(buf.get(1, 0, 0), Some(0x0403));
        assert_eq!(buf.to_le_bytes(), bytes.to_vec());
    }

    #[test]
    fn test_from_bytes_short_buffer() {
        let result = VoxelBuffer::from_bytes(UVec3::splat(2), BitDepth::U8, Vec3::ONE, &[0u8; 7]);
        assert!(result.is_err());
    }

    #[test]
    fn test_from_data_length_mismatch() {
        let result = VoxelBuffer::from_data(UVec3::splat(2), Vec3::ONE, VoxelData::U8(vec![0; 3]));
        assert!(result.is_err());
    }

    #[test]
    fn test_fill_with() {
        let mut buf = VoxelBuffer::zeroed(UVec3::new(3, 2, 2), BitDepth::U32, Vec3::ONE);
        buf.fill_with(|i, j, k| i + 10 * j + 100 * k);
        assert_eq!(buf.get(2, 1, 1), Some(112));
        assert_eq!(buf.get(0, 0, 0), Some(0));
    }

    #[test]
    fn test_copy_region_clipped() {
        let mut src = VoxelBuffer::zeroed(UVec3::splat(4), BitDepth::U8, Vec3::ONE);
        src.fill_with(|i, j, k| 1 + i + 4 * j + 16 * k);

        let region = src.copy_region(UVec3::new(2, 2, 2), UVec3::splat(4));
        assert_eq!(region.dims(), UVec3::splat(4));
        assert_eq!(region.get(0, 0, 0), src.get(2, 2, 2));
        assert_eq!(region.get(1, 1, 1), src.get(3, 3, 3));
        // Outside the source
        assert_eq!(region.get(2, 0, 0), Some(0));
        assert_eq!(region.get(3, 3, 3), Some(0));
    }

    #[test]
    fn test_downsample_2x() {
        let mut src = VoxelBuffer::zeroed(UVec3::new(4, 4, 1), BitDepth::U8, Vec3::ONE);
        src.fill_with(|i, _, _| if i < 2 { 10 } else { 30 });
        let half = src.downsample_2x();
        assert_eq!(half.dims(), UVec3::new(2, 2, 1));
        assert_eq!(half.get(0, 0, 0), Some(10));
        assert_eq!(half.get(1, 1, 0), Some(30));
        assert_eq!(half.spacing(), Vec3::new(2.0, 2.0, 1.0));
    }
}
