//! Directory pyramid layout and brick file I/O
//!
//! ```text
//! <root>/pyramid.json
//! <root>/level_<L>/brick_<x>_<y>_<z>.brk
//! ```
//!
//! Each brick file is LZ4-compressed (size-prepended) raw little-endian
//! voxels in x-fastest order.

use crate::core::error::Error;
use crate::core::types::{BrickKey, Result};
use crate::streaming::loader::BrickDecoder;
use crate::volume::buffer::VoxelBuffer;
use crate::volume::pyramid::{PyramidDescriptor, SourceLocator};
use std::io;
use std::path::{Path, PathBuf};

/// Header file name inside a pyramid directory
pub const PYRAMID_HEADER: &str = "pyramid.json";

/// Get the file path for a brick
pub fn brick_path(root: &Path, key: BrickKey) -> PathBuf {
    root.join(format!("level_{}", key.level))
        .join(format!("brick_{}_{}_{}.brk", key.bx, key.by, key.bz))
}

/// Compress a brick payload using LZ4
pub fn compress_brick(buffer: &VoxelBuffer) -> Vec<u8> {
    lz4_flex::compress_prepend_size(&buffer.to_le_bytes())
}

/// Decompress a brick file body
pub fn decompress_brick(data: &[u8]) -> Result<Vec<u8>> {
    lz4_flex::decompress_size_prepended(data).map_err(|e| {
        io::Error::new(io::ErrorKind::InvalidData, format!("LZ4 decompression failed: {}", e)).into()
    })
}

/// Write one brick file, creating the level directory if needed
pub fn write_brick(root: &Path, key: BrickKey, buffer: &VoxelBuffer) -> Result<()> {
    let path = brick_path(root, key);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, compress_brick(buffer))?;
    Ok(())
}

/// Uncompressed length recorded in a brick body's 4-byte header
pub fn declared_len(data: &[u8]) -> Option<usize> {
    let header: [u8; 4] = data.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(header) as usize)
}

/// Read one brick file as raw little-endian bytes.
///
/// The size header must equal `expected_len` before anything is
/// decompressed.
pub fn read_brick(path: &Path, offset: u64, expected_len: usize) -> Result<Vec<u8>> {
    let data = std::fs::read(path)?;
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
    let body = &data[start..];
    match declared_len(body) {
        Some(len) if len == expected_len => decompress_brick(body),
        declared => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("brick header declares {declared:?} bytes, expected {expected_len}"),
        )
        .into()),
    }
}

/// Split a full-resolution buffer into a directory pyramid.
///
/// Level `L + 1` is the 2x box downsample of level `L`. The header is
/// written last so a partially written directory never looks complete.
pub fn write_pyramid(root: &Path, desc: &PyramidDescriptor, full: &VoxelBuffer) -> Result<()> {
    desc.validate()?;
    let extent = desc.levels[0].extent();
    if full.dims() != extent || full.depth() != desc.bit_depth {
        return Err(Error::InvalidDescriptor(format!(
            "buffer {:?}/{:?} does not match level 0 {:?}/{:?}",
            full.dims(),
            full.depth(),
            extent,
            desc.bit_depth
        )));
    }
    std::fs::create_dir_all(root)?;

    let mut level_buffer = full.clone();
    for (l, level) in desc.levels.iter().enumerate() {
        if l > 0 {
            level_buffer = level_buffer.downsample_2x();
        }
        if level_buffer.dims() != level.extent() {
            return Err(Error::InvalidDescriptor(format!(
                "level {l} extent {:?} is not a 2x downsample",
                level.extent
            )));
        }
        let grid = level.grid();
        for bz in 0..grid.z {
            for by in 0..grid.y {
                for bx in 0..grid.x {
                    let key = BrickKey::new(l as u32, bx, by, bz);
                    let (Some(origin), Some(dims)) = (desc.brick_origin(key), desc.brick_dims(key)) else {
                        continue;
                    };
                    write_brick(root, key, &level_buffer.copy_region(origin, dims))?;
                }
            }
        }
        log::debug!("Wrote level {} ({} bricks)", l, level.brick_count());
    }

    desc.save(&root.join(PYRAMID_HEADER))?;
    log::info!("Wrote pyramid to {:?}: {} bricks", root, desc.total_bricks());
    Ok(())
}

/// Open a pyramid directory written by [`write_pyramid`]
pub fn open_pyramid(root: &Path) -> Result<PyramidDescriptor> {
    Ok(PyramidDescriptor::load(&root.join(PYRAMID_HEADER))?.with_directory(root))
}

/// Decoder reading bricks from a directory pyramid
pub struct DirectoryDecoder {
    desc: PyramidDescriptor,
}

impl DirectoryDecoder {
    pub fn new(desc: PyramidDescriptor) -> Self {
        Self { desc }
    }

    /// Open `root` and build a decoder for it
    pub fn open(root: &Path) -> Result<Self> {
        Ok(Self::new(open_pyramid(root)?))
    }

    pub fn descriptor(&self) -> &PyramidDescriptor {
        &self.desc
    }
}

impl BrickDecoder for DirectoryDecoder {
    fn decode(&self, key: BrickKey, locator: &SourceLocator) -> Result<VoxelBuffer> {
        let SourceLocator::File { path, offset } = locator else {
            return Err(Error::BrickDecodeFailed {
                key,
                reason: "locator is not a file".into(),
            });
        };
        let (Some(dims), Some(spacing), Some(expected)) = (
            self.desc.brick_dims(key),
            self.desc.level_spacing(key.level),
            self.desc.brick_bytes(key),
        ) else {
            return Err(Error::OutOfRangeKey(key));
        };
        let bytes = read_brick(path, *offset, expected).map_err(|e| match e {
            Error::Io(err) if err.kind() == io::ErrorKind::InvalidData => Error::BrickDecodeFailed {
                key,
                reason: err.to_string(),
            },
            other => other,
        })?;
        VoxelBuffer::from_bytes(dims, self.desc.bit_depth, spacing, &bytes)
    }
}
