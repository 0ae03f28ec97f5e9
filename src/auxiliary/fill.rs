//! Initial contents of auxiliary bricks
//!
//! Pattern fills are defined over the whole level-0 volume, so a brick's
//! values depend on where it sits, not only on its size.

use crate::core::types::UVec3;
use crate::math::{bit_length, encode_morton_3d, reverse_bits};
use crate::volume::buffer::VoxelBuffer;

/// Fill applied when an auxiliary brick is first allocated
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AuxFill {
    #[default]
    Zero,
    /// Largest value of the channel depth (255 for masks)
    Full,
    Constant(u32),
    /// Linear voxel index + 1
    Ordered,
    /// Voxel count - linear voxel index
    Reverse,
    /// Voxel count minus the Morton interleave of the bit-reversed coordinates
    Shuffled,
}

/// Fill value of one voxel of the level-0 volume
pub fn fill_value(fill: AuxFill, voxel: UVec3, extent: UVec3, max_value: u32) -> u32 {
    let total = (extent.x as u64 * extent.y as u64 * extent.z as u64) as u32;
    match fill {
        AuxFill::Zero => 0,
        AuxFill::Full => max_value,
        AuxFill::Constant(v) => v.min(max_value),
        AuxFill::Ordered => linear_index(voxel, extent).wrapping_add(1),
        AuxFill::Reverse => total.wrapping_sub(linear_index(voxel, extent)),
        AuxFill::Shuffled => {
            let len = bit_length(extent.max_element());
            let code = encode_morton_3d(
                reverse_bits(voxel.x, len),
                reverse_bits(voxel.y, len),
                reverse_bits(voxel.z, len),
            );
            total.wrapping_sub(code as u32)
        }
    }
}

fn linear_index(voxel: UVec3, extent: UVec3) -> u32 {
    voxel.x
        .wrapping_add(extent.x.wrapping_mul(voxel.y))
        .wrapping_add(extent.x.wrapping_mul(extent.y).wrapping_mul(voxel.z))
}

/// Fill a brick whose first voxel sits at `origin` inside a volume of `extent`
pub fn fill_brick(buffer: &mut VoxelBuffer, fill: AuxFill, origin: UVec3, extent: UVec3) {
    let max_value = buffer.depth().max_value();
    match fill {
        AuxFill::Zero => buffer.fill(0),
        AuxFill::Full | AuxFill::Constant(_) => buffer.fill(fill_value(fill, UVec3::ZERO, extent, max_value)),
        _ => buffer.fill_with(|i, j, k| fill_value(fill, origin + UVec3::new(i, j, k), extent, max_value)),
    }
}
