//! Volume data: voxel buffers, pyramid layout, brick catalog and datasets

pub mod buffer;
pub mod catalog;
pub mod dataset;
pub mod disk_io;
pub mod pyramid;

pub use buffer::{VoxelBuffer, VoxelData};
pub use catalog::{BrickCatalog, BrickEntry, BrickState, StateTag};
pub use dataset::Dataset;
pub use disk_io::DirectoryDecoder;
pub use pyramid::{PyramidDescriptor, ResolutionLevel, SourceLocator, Storage};
