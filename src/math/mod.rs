//! Mathematical utilities and data structures

pub mod aabb;
pub mod morton;
pub mod plane;

pub use aabb::Aabb;
pub use morton::{encode_morton_3d, reverse_bits, bit_length};
pub use plane::Plane;
