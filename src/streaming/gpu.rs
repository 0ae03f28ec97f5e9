//! Texture upload backends
//!
//! All GPU calls happen on the render thread through a [`TextureUploader`].
//! The resident set owns every handle it receives and gives each one back
//! through [`TextureUploader::release`] on eviction.

use crate::core::error::Error;
use crate::core::types::{BitDepth, BrickKey, Result};
use crate::volume::buffer::VoxelBuffer;

/// Render-thread texture allocator
pub trait TextureUploader {
    /// GPU handle type stored by the resident set
    type Handle;

    /// Create a texture holding `buffer`
    fn upload(&mut self, key: BrickKey, buffer: &VoxelBuffer) -> Result<Self::Handle>;

    /// Destroy a texture created by `upload`
    fn release(&mut self, handle: Self::Handle);
}

/// A 3D brick texture
#[derive(Debug)]
pub struct BrickTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub format: wgpu::TextureFormat,
}

/// Uploads bricks as single-channel 3D textures
pub struct WgpuUploader {
    device: wgpu::Device,
    queue: wgpu::Queue,
}

impl WgpuUploader {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self { device, queue }
    }

    /// Open a device without a surface, for tools and offline checks
    pub async fn headless() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| Error::Gpu(format!("No suitable adapter found: {:?}", e)))?;

        let required_features = adapter.features() & wgpu::Features::TEXTURE_FORMAT_16BIT_NORM;
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("brickcache_device"),
                required_features,
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
                experimental_features: Default::default(),
                trace: Default::default(),
            })
            .await
            .map_err(|e| Error::Gpu(e.to_string()))?;
        log::info!(
            "Headless GPU ready: {} (max 3D texture {})",
            adapter.get_info().name,
            device.limits().max_texture_dimension_3d
        );
        Ok(Self::new(device, queue))
    }

    /// Texture format for a voxel depth
    pub fn format_for(&self, depth: BitDepth) -> Result<wgpu::TextureFormat> {
        match depth {
            BitDepth::U8 => Ok(wgpu::TextureFormat::R8Unorm),
            BitDepth::U16 => {
                if self.device.features().contains(wgpu::Features::TEXTURE_FORMAT_16BIT_NORM) {
                    Ok(wgpu::TextureFormat::R16Unorm)
                } else {
                    Err(Error::Gpu("R16Unorm requires TEXTURE_FORMAT_16BIT_NORM".into()))
                }
            }
            BitDepth::U32 => Ok(wgpu::TextureFormat::R32Uint),
        }
    }
}

impl TextureUploader for WgpuUploader {
    type Handle = BrickTexture;

    fn upload(&mut self, key: BrickKey, buffer: &VoxelBuffer) -> Result<BrickTexture> {
        let dims = buffer.dims();
        let max_dim = self.device.limits().max_texture_dimension_3d;
        if dims.max_element() > max_dim {
            return Err(Error::AllocationFailure {
                key,
                bytes: buffer.byte_len(),
                reason: format!("brick {:?} exceeds max 3D texture dimension {}", dims, max_dim),
            });
        }
        let format = self.format_for(buffer.depth())?;
        let size = wgpu::Extent3d {
            width: dims.x,
            height: dims.y,
            depth_or_array_layers: dims.z,
        };
        let label = format!("brick_{}_{}_{}_{}", key.level, key.bx, key.by, key.bz);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label.as_str()),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D3,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            buffer.as_bytes(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(dims.x * buffer.depth().bytes() as u32),
                rows_per_image: Some(dims.y),
            },
            size,
        );
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(BrickTexture { texture, view, format })
    }

    fn release(&mut self, handle: BrickTexture) {
        handle.texture.destroy();
    }
}

/// Handle produced by [`HostUploader`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostTexture {
    pub id: u64,
    pub key: BrickKey,
    pub bytes: usize,
}

/// Host-memory uploader for headless use and tests.
///
/// Keeps only sizes. With a capacity set, uploads that would exceed it
/// fail with `AllocationFailure`.
#[derive(Debug, Default)]
pub struct HostUploader {
    next_id: u64,
    live_bytes: usize,
    live_count: usize,
    capacity: Option<usize>,
}

impl HostUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    pub fn live_count(&self) -> usize {
        self.live_count
    }
}

impl TextureUploader for HostUploader {
    type Handle = HostTexture;

    fn upload(&mut self, key: BrickKey, buffer: &VoxelBuffer) -> Result<HostTexture> {
        let bytes = buffer.byte_len();
        if let Some(capacity) = self.capacity
            && self.live_bytes + bytes > capacity
        {
            return Err(Error::AllocationFailure {
                key,
                bytes,
                reason: format!("host pool full ({} of {} bytes)", self.live_bytes, capacity),
            });
        }
        self.next_id += 1;
        self.live_bytes += bytes;
        self.live_count += 1;
        Ok(HostTexture { id: self.next_id, key, bytes })
    }

    fn release(&mut self, handle: HostTexture) {
        self.live_bytes = self.live_bytes.saturating_sub(handle.bytes);
        self.live_count = self.live_count.saturating_sub(1);
    }
}
