//! Pyramid level selection
//!
//! The renderer picks the level whose voxels are about one pixel on screen,
//! then shifts it by the user's signed detail offset. Positive offsets pick
//! coarser levels, negative offsets finer ones.

use crate::core::types::Vec3;
use crate::streaming::priority::ViewState;

/// Choose the level whose voxel size best matches a pixel footprint
///
/// Returns the coarsest level whose voxels are no larger than `footprint`,
/// or level 0 when even the finest voxels are larger.
///
/// # Arguments
/// * `footprint` - World-space size of one pixel
/// * `voxel_sizes` - World-space voxel size per level, finest first
///
/// # Examples
/// ```
/// use brickcache::streaming::lod::select_level;
///
/// let sizes = [1.0, 2.0, 4.0, 8.0];
/// assert_eq!(select_level(0.5, &sizes), 0);  // Zoomed in
/// assert_eq!(select_level(2.0, &sizes), 1);
/// assert_eq!(select_level(5.0, &sizes), 2);
/// assert_eq!(select_level(100.0, &sizes), 3); // Coarsest available
/// ```
pub fn select_level(footprint: f32, voxel_sizes: &[f32]) -> u32 {
    voxel_sizes
        .iter()
        .rposition(|&size| size <= footprint)
        .unwrap_or(0) as u32
}

/// Apply the detail offset and clamp to the pyramid
///
/// # Examples
/// ```
/// use brickcache::streaming::lod::apply_detail_offset;
///
/// assert_eq!(apply_detail_offset(1, 1, 4), 2);
/// assert_eq!(apply_detail_offset(1, -3, 4), 0); // Clamped to finest
/// assert_eq!(apply_detail_offset(2, 5, 4), 3);  // Clamped to coarsest
/// ```
pub fn apply_detail_offset(level: u32, offset: i32, level_count: u32) -> u32 {
    if level_count == 0 {
        return 0;
    }
    (level as i64 + offset as i64).clamp(0, level_count as i64 - 1) as u32
}

/// Level the view wants for a point, detail offset applied
///
/// # Arguments
/// * `view` - Current view
/// * `point` - World-space point (usually the volume center)
/// * `level_voxel_sizes` - World-space voxel size per level
/// * `detail_offset` - Signed user offset
pub fn target_level(view: &ViewState, point: Vec3, level_voxel_sizes: &[Vec3], detail_offset: i32) -> u32 {
    let sizes: Vec<f32> = level_voxel_sizes.iter().map(|s| s.max_element()).collect();
    let native = select_level(view.pixel_footprint(point), &sizes);
    apply_detail_offset(native, detail_offset, sizes.len() as u32)
}

/// Downsample factor of a level
///
/// # Examples
/// ```
/// use brickcache::streaming::lod::downsample_factor;
///
/// assert_eq!(downsample_factor(0), 1);
/// assert_eq!(downsample_factor(3), 8);
/// ```
pub fn downsample_factor(level: u32) -> u32 {
    1u32 << level.min(31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Vec2;

    #[test]
    fn test_select_level() {
        let sizes = [1.0, 2.0, 4.0];
        assert_eq!(select_level(0.0, &sizes), 0);
        assert_eq!(select_level(1.0, &sizes), 0);
        assert_eq!(select_level(3.9, &sizes), 1);
        assert_eq!(select_level(4.0, &sizes), 2);
        assert_eq!(select_level(1.0, &[]), 0);
    }

    #[test]
    fn test_apply_detail_offset() {
        assert_eq!(apply_detail_offset(0, 0, 1), 0);
        assert_eq!(apply_detail_offset(0, 5, 1), 0);
        assert_eq!(apply_detail_offset(3, -1, 6), 2);
        assert_eq!(apply_detail_offset(3, 0, 0), 0);
    }

    #[test]
    fn test_target_level_moves_with_distance() {
        let sizes = [Vec3::splat(1.0), Vec3::splat(2.0), Vec3::splat(4.0)];
        let near = ViewState::look_at(Vec3::new(0.0, 0.0, 100.0), Vec3::ZERO, 60f32.to_radians(), Vec2::new(100.0, 100.0));
        let far = ViewState::look_at(Vec3::new(0.0, 0.0, 1000.0), Vec3::ZERO, 60f32.to_radians(), Vec2::new(100.0, 100.0));

        // footprint near = 2 * 100 * tan(30deg) / 100 ~= 1.15
        assert_eq!(target_level(&near, Vec3::ZERO, &sizes, 0), 0);
        assert_eq!(target_level(&far, Vec3::ZERO, &sizes, 0), 2);
        assert_eq!(target_level(&near, Vec3::ZERO, &sizes, 1), 1);
        assert_eq!(target_level(&far, Vec3::ZERO, &sizes, -5), 0);
    }

    #[test]
    fn test_downsample_factor() {
        assert_eq!(downsample_factor(1), 2);
        assert_eq!(downsample_factor(40), 1 << 31);
    }
}
