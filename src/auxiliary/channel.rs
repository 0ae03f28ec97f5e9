//! One auxiliary channel: lazily allocated level-0 bricks plus edit history

use std::collections::{HashMap, HashSet, VecDeque};

use super::fill::{fill_brick, fill_value, AuxFill};
use super::AuxKind;
use crate::core::error::Error;
use crate::core::types::{BrickKey, Result, UVec3};
use crate::volume::buffer::VoxelBuffer;
use crate::volume::pyramid::PyramidDescriptor;

/// CPU copy of one auxiliary brick
#[derive(Clone, Debug)]
pub struct AuxBrick {
    pub buffer: VoxelBuffer,
    /// Mirrors whether the primary brick currently has a payload
    pub valid: bool,
    /// The renderer holds an up-to-date upload of `buffer`
    pub uploaded: bool,
}

type Snapshot = HashMap<BrickKey, VoxelBuffer>;

/// Mask or label volume aligned brick-for-brick with level 0 of the primary
#[derive(Debug)]
pub struct AuxChannel {
    kind: AuxKind,
    fill: AuxFill,
    bricks: HashMap<BrickKey, AuxBrick>,
    /// Bricks whose contents changed since the last `take_dirty`
    dirty: HashSet<BrickKey>,
    undo: VecDeque<Snapshot>,
    redo: Vec<Snapshot>,
    undo_depth: usize,
}

impl AuxChannel {
    pub fn new(kind: AuxKind, fill: AuxFill, undo_depth: usize) -> Self {
        Self {
            kind,
            fill,
            bricks: HashMap::new(),
            dirty: HashSet::new(),
            undo: VecDeque::new(),
            redo: Vec::new(),
            undo_depth,
        }
    }

    pub fn kind(&self) -> AuxKind {
        self.kind
    }

    pub fn fill(&self) -> AuxFill {
        self.fill
    }

    pub fn brick(&self, key: BrickKey) -> Option<&AuxBrick> {
        self.bricks.get(&key)
    }

    pub fn brick_mut(&mut self, key: BrickKey) -> Option<&mut AuxBrick> {
        self.bricks.get_mut(&key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &BrickKey> {
        self.bricks.keys()
    }

    pub fn len(&self) -> usize {
        self.bricks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bricks.is_empty()
    }

    /// CPU bytes held by allocated bricks and their undo/redo snapshots
    pub fn bytes(&self) -> u64 {
        self.brick_bytes() + self.history_bytes()
    }

    pub fn brick_bytes(&self) -> u64 {
        self.bricks.values().map(|b| b.buffer.byte_len() as u64).sum()
    }

    pub fn history_bytes(&self) -> u64 {
        self.undo
            .iter()
            .chain(self.redo.iter())
            .flat_map(|snapshot| snapshot.values())
            .map(|buffer| buffer.byte_len() as u64)
            .sum()
    }

    /// Allocate and fill the brick for a level-0 key.
    ///
    /// Returns `Ok(false)` without touching anything if it already exists.
    pub fn ensure(&mut self, key: BrickKey, desc: &PyramidDescriptor) -> Result<bool> {
        if key.level != 0 || !desc.contains(key) {
            return Err(Error::OutOfRangeKey(key));
        }
        if self.bricks.contains_key(&key) {
            return Ok(false);
        }
        let buffer = self.filled_buffer(key, desc)?;
        self.bricks.insert(key, AuxBrick { buffer, valid: false, uploaded: false });
        self.dirty.insert(key);
        log::trace!("Allocated {:?} brick {}", self.kind, key);
        Ok(true)
    }

    fn filled_buffer(&self, key: BrickKey, desc: &PyramidDescriptor) -> Result<VoxelBuffer> {
        let (Some(origin), Some(dims), Some(extent)) = (
            desc.brick_origin(key),
            desc.brick_dims(key),
            desc.level(0).map(|l| l.extent()),
        ) else {
            return Err(Error::OutOfRangeKey(key));
        };
        let mut buffer = VoxelBuffer::zeroed(dims, self.kind.depth(), desc.base_spacing());
        fill_brick(&mut buffer, self.fill, origin, extent);
        Ok(buffer)
    }

    /// Re-apply a fill to every allocated brick and make it the default for new ones
    pub fn refill(&mut self, fill: AuxFill, desc: &PyramidDescriptor) -> Result<()> {
        self.fill = fill;
        let keys: Vec<_> = self.bricks.keys().copied().collect();
        for key in keys {
            let buffer = self.filled_buffer(key, desc)?;
            self.replace(key, buffer);
        }
        Ok(())
    }

    fn replace(&mut self, key: BrickKey, buffer: VoxelBuffer) {
        if let Some(brick) = self.bricks.get_mut(&key) {
            brick.buffer = buffer;
            brick.uploaded = false;
            self.dirty.insert(key);
        }
    }

    /// Value at a level-0 voxel; unallocated bricks read as their fill
    pub fn get_voxel(&self, voxel: UVec3, desc: &PyramidDescriptor) -> Option<u32> {
        let key = desc.key_for_voxel(0, voxel)?;
        match self.bricks.get(&key) {
            Some(brick) => {
                let local = voxel - desc.brick_origin(key)?;
                brick.buffer.get(local.x, local.y, local.z)
            }
            None => {
                let extent = desc.level(0)?.extent();
                Some(fill_value(self.fill, voxel, extent, self.kind.depth().max_value()))
            }
        }
    }

    /// Write a level-0 voxel, allocating its brick if needed.
    ///
    /// Values above the channel depth saturate, like a constant fill.
    pub fn set_voxel(&mut self, voxel: UVec3, value: u32, desc: &PyramidDescriptor) -> Result<()> {
        let Some(key) = desc.key_for_voxel(0, voxel) else {
            return Err(Error::OutOfRangeKey(BrickKey::new(
                0,
                voxel.x / desc.brick_edge,
                voxel.y / desc.brick_edge,
                voxel.z / desc.brick_edge,
            )));
        };
        self.ensure(key, desc)?;
        let origin = desc.brick_origin(key).ok_or(Error::OutOfRangeKey(key))?;
        if let Some(brick) = self.bricks.get_mut(&key) {
            let local = voxel - origin;
            let value = value.min(self.kind.depth().max_value());
            brick.buffer.set(local.x, local.y, local.z, value);
            brick.uploaded = false;
            self.dirty.insert(key);
        }
        Ok(())
    }

    /// Take all dirty bricks and clear the dirty list, sorted by key
    pub fn take_dirty(&mut self) -> Vec<BrickKey> {
        let mut keys: Vec<_> = self.dirty.drain().collect();
        keys.sort();
        keys
    }

    pub fn is_dirty(&self, key: BrickKey) -> bool {
        self.dirty.contains(&key)
    }

    pub fn set_all_valid(&mut self, valid: bool) {
        for brick in self.bricks.values_mut() {
            brick.valid = valid;
        }
    }

    /// Record the current contents as an undo point; clears redo
    pub fn push_undo(&mut self) {
        if self.undo_depth == 0 {
            return;
        }
        if self.undo.len() == self.undo_depth {
            self.undo.pop_front();
        }
        self.undo.push_back(self.snapshot());
        self.redo.clear();
    }

    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    /// Restore the latest undo point
    pub fn undo(&mut self, desc: &PyramidDescriptor) -> Result<bool> {
        let Some(snapshot) = self.undo.pop_back() else {
            return Ok(false);
        };
        self.redo.push(self.snapshot());
        self.restore(snapshot, desc)?;
        Ok(true)
    }

    /// Re-apply the most recently undone state
    pub fn redo(&mut self, desc: &PyramidDescriptor) -> Result<bool> {
        let Some(snapshot) = self.redo.pop() else {
            return Ok(false);
        };
        self.undo.push_back(self.snapshot());
        self.restore(snapshot, desc)?;
        Ok(true)
    }

    fn snapshot(&self) -> Snapshot {
        self.bricks.iter().map(|(k, b)| (*k, b.buffer.clone())).collect()
    }

    // Bricks allocated after the snapshot go back to their fill
    fn restore(&mut self, mut snapshot: Snapshot, desc: &PyramidDescriptor) -> Result<()> {
        let keys: Vec<_> = self.bricks.keys().copied().collect();
        for key in keys {
            let buffer = match snapshot.remove(&key) {
                Some(buffer) => buffer,
                None => self.filled_buffer(key, desc)?,
            };
            self.replace(key, buffer);
        }
        for (key, buffer) in snapshot {
            self.bricks.insert(key, AuxBrick { buffer, valid: false, uploaded: false });
            self.dirty.insert(key);
        }
        Ok(())
    }
}
