//! Keeps mask and label channels in lock-step with the primary catalog.
//!
//! Auxiliary bricks hold user work, so they are never evicted for budget
//! reasons. Memory above the configured threshold is reported through
//! [`AuxSynchronizer::take_warnings`] instead.

use std::collections::BTreeMap;

use super::channel::AuxChannel;
use super::fill::AuxFill;
use super::AuxKind;
use crate::core::error::Error;
use crate::core::types::{BrickKey, Result, UVec3};
use crate::streaming::config::CacheConfig;
use crate::volume::catalog::BrickCatalog;
use crate::volume::pyramid::PyramidDescriptor;

/// Auxiliary memory crossed the warning threshold
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuxWarning {
    pub total_bytes: u64,
    pub threshold_bytes: u64,
}

#[derive(Debug)]
pub struct AuxSynchronizer {
    channels: BTreeMap<AuxKind, AuxChannel>,
    warning_bytes: u64,
    undo_depth: usize,
    /// Set while above the threshold so each crossing warns once
    over_threshold: bool,
    warnings: Vec<AuxWarning>,
}

impl AuxSynchronizer {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            channels: BTreeMap::new(),
            warning_bytes: config.aux_warning_bytes(),
            undo_depth: config.mask_undo_depth,
            over_threshold: false,
            warnings: Vec::new(),
        }
    }

    /// Pick up new thresholds; existing history is kept
    pub fn set_config(&mut self, config: &CacheConfig) {
        self.warning_bytes = config.aux_warning_bytes();
        self.undo_depth = config.mask_undo_depth;
        self.check_pressure();
    }

    fn channel_undo_depth(&self, kind: AuxKind) -> usize {
        match kind {
            AuxKind::Mask => self.undo_depth,
            AuxKind::Label => 0,
        }
    }

    /// Create a channel, or re-fill an existing one.
    ///
    /// Returns true when the channel was created.
    pub fn add_channel(&mut self, kind: AuxKind, fill: AuxFill, desc: &PyramidDescriptor) -> Result<bool> {
        if let Some(channel) = self.channels.get_mut(&kind) {
            channel.refill(fill, desc)?;
            log::debug!("Refilled {:?} channel with {:?}", kind, fill);
            return Ok(false);
        }
        let undo_depth = self.channel_undo_depth(kind);
        self.channels.insert(kind, AuxChannel::new(kind, fill, undo_depth));
        log::info!("Created {:?} channel ({:?} fill)", kind, fill);
        Ok(true)
    }

    pub fn remove_channel(&mut self, kind: AuxKind) -> Option<AuxChannel> {
        let removed = self.channels.remove(&kind);
        if removed.is_some() {
            log::info!("Removed {:?} channel", kind);
            self.check_pressure();
        }
        removed
    }

    pub fn has_channel(&self, kind: AuxKind) -> bool {
        self.channels.contains_key(&kind)
    }

    pub fn channel(&self, kind: AuxKind) -> Option<&AuxChannel> {
        self.channels.get(&kind)
    }

    fn channel_or_create(&mut self, kind: AuxKind) -> &mut AuxChannel {
        let undo_depth = self.channel_undo_depth(kind);
        self.channels.entry(kind).or_insert_with(|| {
            log::info!("Created {:?} channel on first touch", kind);
            AuxChannel::new(kind, AuxFill::Zero, undo_depth)
        })
    }

    /// Allocate and fill the aux brick for a level-0 key on first touch.
    ///
    /// Returns whether a new allocation happened, which the renderer uses
    /// to decide on a re-upload.
    pub fn ensure_brick(&mut self, kind: AuxKind, key: BrickKey, desc: &PyramidDescriptor) -> Result<bool> {
        let allocated = self.channel_or_create(kind).ensure(key, desc)?;
        if allocated {
            self.check_pressure();
        }
        Ok(allocated)
    }

    /// Mirror the primary brick's payload state onto every channel.
    ///
    /// Called after the primary catalog evicts or re-derives a brick.
    /// Returns the number of aux bricks whose flags changed.
    pub fn sync(&mut self, primary_key: BrickKey, catalog: &BrickCatalog) -> usize {
        if primary_key.level != 0 {
            return 0;
        }
        let has_payload = catalog
            .lookup(primary_key)
            .is_some_and(|e| e.state().has_payload());
        let mut changed = 0;
        for channel in self.channels.values_mut() {
            let Some(brick) = channel.brick_mut(primary_key) else {
                continue;
            };
            let uploaded = brick.uploaded && has_payload;
            if brick.valid != has_payload || brick.uploaded != uploaded {
                brick.valid = has_payload;
                brick.uploaded = uploaded;
                changed += 1;
            }
        }
        if changed > 0 {
            log::trace!("Synced {} aux bricks for {}", changed, primary_key);
        }
        changed
    }

    /// [`sync`](Self::sync) every allocated aux brick
    pub fn sync_all(&mut self, catalog: &BrickCatalog) -> usize {
        let mut keys: Vec<BrickKey> = self.channels.values().flat_map(|c| c.keys().copied()).collect();
        keys.sort();
        keys.dedup();
        keys.into_iter().map(|key| self.sync(key, catalog)).sum()
    }

    /// Record that the renderer uploaded an aux brick.
    ///
    /// Refused unless the primary brick has been resident at least once.
    pub fn mark_uploaded(&mut self, kind: AuxKind, key: BrickKey, catalog: &BrickCatalog) -> Result<()> {
        let entry = catalog.lookup(key).ok_or(Error::OutOfRangeKey(key))?;
        if !entry.ever_resident {
            return Err(Error::AuxChannelUnavailable { kind, key });
        }
        let brick = self
            .channels
            .get_mut(&kind)
            .and_then(|c| c.brick_mut(key))
            .ok_or(Error::AuxChannelUnavailable { kind, key })?;
        brick.uploaded = true;
        brick.valid = entry.state().has_payload();
        Ok(())
    }

    /// Value of a level-0 voxel; `None` without the channel or outside the volume
    pub fn get_voxel(&self, kind: AuxKind, voxel: UVec3, desc: &PyramidDescriptor) -> Option<u32> {
        self.channels.get(&kind)?.get_voxel(voxel, desc)
    }

    /// Paint one level-0 voxel, allocating channel and brick on demand
    pub fn set_voxel(&mut self, kind: AuxKind, voxel: UVec3, value: u32, desc: &PyramidDescriptor) -> Result<()> {
        let channel = self.channel_or_create(kind);
        let before = channel.len();
        channel.set_voxel(voxel, value, desc)?;
        if channel.len() != before {
            self.check_pressure();
        }
        Ok(())
    }

    /// Bricks of a channel needing re-upload
    pub fn take_dirty(&mut self, kind: AuxKind) -> Vec<BrickKey> {
        self.channels
            .get_mut(&kind)
            .map(|c| c.take_dirty())
            .unwrap_or_default()
    }

    pub fn invalidate_all(&mut self, kind: AuxKind) {
        if let Some(channel) = self.channels.get_mut(&kind) {
            channel.set_all_valid(false);
        }
    }

    pub fn validate_all(&mut self, kind: AuxKind) {
        if let Some(channel) = self.channels.get_mut(&kind) {
            channel.set_all_valid(true);
        }
    }

    pub fn push_undo(&mut self, kind: AuxKind) {
        if let Some(channel) = self.channels.get_mut(&kind) {
            channel.push_undo();
            self.check_pressure();
        }
    }

    pub fn undo(&mut self, kind: AuxKind, desc: &PyramidDescriptor) -> Result<bool> {
        let restored = match self.channels.get_mut(&kind) {
            Some(channel) => channel.undo(desc)?,
            None => return Ok(false),
        };
        self.check_pressure();
        Ok(restored)
    }

    pub fn redo(&mut self, kind: AuxKind, desc: &PyramidDescriptor) -> Result<bool> {
        let restored = match self.channels.get_mut(&kind) {
            Some(channel) => channel.redo(desc)?,
            None => return Ok(false),
        };
        self.check_pressure();
        Ok(restored)
    }

    /// CPU bytes held across all channels, edit history included
    pub fn total_bytes(&self) -> u64 {
        self.channels.values().map(|c| c.bytes()).sum()
    }

    pub fn take_warnings(&mut self) -> Vec<AuxWarning> {
        std::mem::take(&mut self.warnings)
    }

    fn check_pressure(&mut self) {
        let total = self.total_bytes();
        let over = total > self.warning_bytes;
        if over && !self.over_threshold {
            log::warn!(
                "Auxiliary channels hold {:.1} MB, above the {:.1} MB warning threshold",
                total as f64 / crate::streaming::config::MB,
                self.warning_bytes as f64 / crate::streaming::config::MB
            );
            self.warnings.push(AuxWarning { total_bytes: total, threshold_bytes: self.warning_bytes });
        }
        self.over_threshold = over;
    }
}
