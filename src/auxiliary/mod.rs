//! Mask and label channels kept brick-aligned with the primary volume

pub mod channel;
pub mod fill;
pub mod synchronizer;

use crate::core::types::BitDepth;

pub use channel::{AuxBrick, AuxChannel};
pub use fill::AuxFill;
pub use synchronizer::{AuxSynchronizer, AuxWarning};

/// Kind of auxiliary channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AuxKind {
    /// Binary paint selection
    Mask,
    /// Integer component IDs
    Label,
}

impl AuxKind {
    pub fn depth(self) -> BitDepth {
        match self {
            AuxKind::Mask => BitDepth::U8,
            AuxKind::Label => BitDepth::U32,
        }
    }
}
