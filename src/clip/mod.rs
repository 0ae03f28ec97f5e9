//! Clip planes and the unit-cube-to-world transform

pub mod coordinator;
pub mod planes;

pub use coordinator::TransformCoordinator;
pub use planes::{ClipParams, ClipPlaneSet};
