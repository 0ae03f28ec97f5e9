//! Cache configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::error::Error;
use crate::core::types::Result;

/// Bytes per configured megabyte.
pub const MB: f64 = 1024.0 * 1024.0;

/// Smallest and largest accepted brick edge (voxels).
pub const BRICK_EDGE_RANGE: (u32, u32) = (64, 4096);

/// Accepted range of the detail level offset.
pub const DETAIL_OFFSET_RANGE: (i32, i32) = (-5, 5);

/// Order in which bricks are handed to the renderer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOrder {
    #[default]
    BackToFront,
    FrontToBack,
}

// ---------------------------------------------------------------------------
// CacheConfig
// ---------------------------------------------------------------------------

/// Settings consumed by the resident set. Passed in explicitly and updated
/// through `ResidentSet::set_config`, which re-evaluates the budget.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// GPU memory budget for primary bricks.
    pub memory_budget_mb: f64,
    /// Largest brick edge in voxels (power of two) the cache uploads.
    /// Also the edge new pyramids are written with.
    pub brick_edge: u32,
    /// Soft per-frame deadline for starting new loads.
    pub response_time_ms: u32,
    /// Signed shift of the level treated as native for a view.
    pub detail_level_offset: i32,
    pub update_order: UpdateOrder,
    /// Worker pool width.
    pub max_concurrent_decodes: usize,
    /// Never admit bricks already decoded as all-zero.
    pub skip_empty_bricks: bool,
    /// Decode time assumed before any brick has been measured.
    pub initial_decode_estimate_ms: f32,
    /// Aux-channel memory above which a warning is raised.
    pub aux_warning_mb: f64,
    /// Mask undo snapshots kept per channel.
    pub mask_undo_depth: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_budget_mb: 1000.0,
            brick_edge: 128,
            response_time_ms: 100,
            detail_level_offset: 0,
            update_order: UpdateOrder::BackToFront,
            max_concurrent_decodes: 4,
            skip_empty_bricks: false,
            initial_decode_estimate_ms: 5.0,
            aux_warning_mb: 512.0,
            mask_undo_depth: 8,
        }
    }
}

impl CacheConfig {
    /// Check every field against its accepted range.
    pub fn validate(&self) -> Result<()> {
        if !self.memory_budget_mb.is_finite() || self.memory_budget_mb <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "memory budget {} MB must be positive",
                self.memory_budget_mb
            )));
        }
        let (lo, hi) = BRICK_EDGE_RANGE;
        if !self.brick_edge.is_power_of_two() || self.brick_edge < lo || self.brick_edge > hi {
            return Err(Error::InvalidConfig(format!(
                "brick edge {} must be a power of two in {lo}..={hi}",
                self.brick_edge
            )));
        }
        if self.response_time_ms == 0 {
            return Err(Error::InvalidConfig("response time must be positive".into()));
        }
        let (lo, hi) = DETAIL_OFFSET_RANGE;
        if self.detail_level_offset < lo || self.detail_level_offset > hi {
            return Err(Error::InvalidConfig(format!(
                "detail level offset {} outside {lo}..={hi}",
                self.detail_level_offset
            )));
        }
        if self.max_concurrent_decodes == 0 {
            return Err(Error::InvalidConfig("max_concurrent_decodes must be positive".into()));
        }
        if !self.initial_decode_estimate_ms.is_finite() || self.initial_decode_estimate_ms <= 0.0 {
            return Err(Error::InvalidConfig("initial decode estimate must be positive".into()));
        }
        if !self.aux_warning_mb.is_finite() || self.aux_warning_mb < 0.0 {
            return Err(Error::InvalidConfig("aux warning threshold must be non-negative".into()));
        }
        Ok(())
    }

    pub fn budget_bytes(&self) -> u64 {
        (self.memory_budget_mb * MB) as u64
    }

    pub fn aux_warning_bytes(&self) -> u64 {
        (self.aux_warning_mb * MB) as u64
    }

    pub fn response_time(&self) -> Duration {
        Duration::from_millis(self.response_time_ms as u64)
    }

    // -- Persistence ----------------------------------------------------------

    /// Parse and validate; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
