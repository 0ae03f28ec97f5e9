//! brickcache - out-of-core, multi-resolution volume brick cache
//!
//! Splits large 3D volumes into a pyramid of fixed-size bricks and keeps
//! the most useful ones resident on the GPU under a memory budget, with
//! mask and label channels and clip planes kept consistent alongside.

pub mod core;
pub mod math;
pub mod volume;
pub mod streaming;
pub mod auxiliary;
pub mod clip;
pub mod volume_cache;

pub use volume_cache::VolumeCache;
