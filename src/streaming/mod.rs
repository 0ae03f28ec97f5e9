//! Brick streaming: budgeting, prioritisation, decoding and residency

pub mod config;
pub mod budget;
pub mod priority;
pub mod lod;
pub mod gpu;
pub mod loader;
pub mod cache;

pub use config::{CacheConfig, UpdateOrder};
pub use budget::BrickBudget;
pub use priority::{
    AdmissionCandidate, AdmissionQueue, Projection, ViewState,
    brick_priority,
};
pub use lod::{select_level, apply_detail_offset, target_level};
pub use gpu::{TextureUploader, WgpuUploader, BrickTexture, HostUploader, HostTexture};
pub use loader::{
    BrickDecoder, BrickLoader, MemoryDecoder,
    LoadTicket, LoadResult, LoadOutcome, decode_ticket,
};
pub use cache::{ResidentSet, FrameReport, CacheStats};
