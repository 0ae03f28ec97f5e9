//! Pyramid builder binary - writes a synthetic dataset in the brick layout.
//!
//! Usage: cargo run --release --bin build_pyramid -- [OPTIONS]
//!
//! Options:
//!   --size <N>        Level-0 edge in voxels (default: 256)
//!   --depth <Z>       Level-0 depth in voxels (default: size / 2)
//!   --brick <EDGE>    Brick edge in voxels (default: the config's brick_edge)
//!   --levels <N>      Pyramid levels (default: 3)
//!   --bits <8|16>     Voxel depth (default: 8)
//!   --out <DIR>       Output directory (default: "assets/pyramids/synthetic")
//!   --config <FILE>   Cache configuration JSON (default: built-in defaults)
//!   --verify          Stream one view from the written pyramid
//!   --gpu             With --verify, upload through a headless wgpu device
//!
//! Output structure:
//!   <out>/
//!     pyramid.json              # Level extents, grids, spacing
//!     level_0/
//!       brick_0_0_0.brk         # LZ4-compressed little-endian voxels
//!       ...

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::{UVec3, Vec2, Vec3};

use brickcache::core::types::{BitDepth, Result};
use brickcache::streaming::{CacheConfig, HostUploader, TextureUploader, ViewState, WgpuUploader};
use brickcache::volume::disk_io::{self, DirectoryDecoder};
use brickcache::volume::{PyramidDescriptor, VoxelBuffer};
use brickcache::VolumeCache;

fn main() {
    brickcache::core::logging::init_with_timestamps();

    if let Err(e) = run() {
        eprintln!("build_pyramid failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let size = parse_u32_arg(&args, "--size").unwrap_or(256).max(1);
    let depth_z = parse_u32_arg(&args, "--depth").unwrap_or((size / 2).max(1));
    let config = match parse_str_arg(&args, "--config") {
        Some(path) => CacheConfig::load(Path::new(&path))?,
        None => CacheConfig::default(),
    };
    let brick_edge = parse_u32_arg(&args, "--brick").unwrap_or(config.brick_edge);
    let levels = parse_u32_arg(&args, "--levels").unwrap_or(3);
    let bit_depth = match parse_u32_arg(&args, "--bits").unwrap_or(8) {
        16 => BitDepth::U16,
        _ => BitDepth::U8,
    };
    let output_dir = PathBuf::from(
        parse_str_arg(&args, "--out").unwrap_or_else(|| "assets/pyramids/synthetic".to_string()),
    );
    let verify = args.iter().any(|a| a == "--verify");
    let gpu = args.iter().any(|a| a == "--gpu");

    let extent = UVec3::new(size, size, depth_z);
    let spacing = Vec3::new(0.5, 0.5, 2.0);

    println!("=== Brick Pyramid Builder ===");
    println!("Extent: {} x {} x {} ({:?})", extent.x, extent.y, extent.z, bit_depth);
    println!("Brick:  {} voxels, {} levels", brick_edge, levels);
    println!("Output: {}", output_dir.display());
    println!();

    let desc = PyramidDescriptor::multi_resolution(extent, bit_depth, spacing, brick_edge, levels)?;

    let start = Instant::now();
    let volume = synthetic_volume(extent, bit_depth, spacing);
    println!("Generated volume in {:.2}s", start.elapsed().as_secs_f64());

    let start = Instant::now();
    disk_io::write_pyramid(&output_dir, &desc, &volume)?;
    println!(
        "Wrote {} bricks in {:.2}s",
        desc.total_bricks(),
        start.elapsed().as_secs_f64()
    );

    if verify {
        let decoder = Arc::new(DirectoryDecoder::open(&output_dir)?);
        let desc = decoder.descriptor().clone();
        if gpu {
            let uploader = pollster::block_on(WgpuUploader::headless())?;
            stream_once(desc, config, uploader, decoder)?;
        } else {
            stream_once(desc, config, HostUploader::new(), decoder)?;
        }
    }

    println!();
    println!("Done!");
    Ok(())
}

/// A few soft blobs over a dim background
fn synthetic_volume(extent: UVec3, depth: BitDepth, spacing: Vec3) -> VoxelBuffer {
    let max = depth.max_value() as f32;
    let size = extent.as_vec3();
    let blobs = [
        (Vec3::new(0.3, 0.3, 0.5), 0.18),
        (Vec3::new(0.7, 0.6, 0.4), 0.22),
        (Vec3::new(0.5, 0.8, 0.7), 0.12),
    ];
    let mut volume = VoxelBuffer::zeroed(extent, depth, spacing);
    volume.fill_with(|i, j, k| {
        let p = (Vec3::new(i as f32, j as f32, k as f32) + 0.5) / size;
        let intensity = blobs
            .iter()
            .map(|&(center, radius)| (1.0 - p.distance(center) / radius).max(0.0))
            .fold(0.0f32, f32::max);
        (intensity * max) as u32
    });
    volume
}

fn stream_once<U: TextureUploader>(
    desc: PyramidDescriptor,
    config: CacheConfig,
    uploader: U,
    decoder: Arc<DirectoryDecoder>,
) -> Result<()> {
    let mut cache = VolumeCache::new(desc, config, uploader, decoder)?;
    let world = cache.get_transform().transform_point3(Vec3::ONE);
    let center = world * 0.5;
    let view = ViewState::look_at(
        center - Vec3::Z * world.max_element() * 1.5,
        center,
        45f32.to_radians(),
        Vec2::new(1280.0, 720.0),
    );

    let report = cache.request_view(&view)?;
    let resident = cache.wait_completed(report.tickets.len(), Duration::from_secs(30));
    let stats = cache.stats();
    println!(
        "Streamed level {}: {} admitted, {} resident, {} deferred, {:.1} MB used, decode ~{:.2} ms",
        cache.dataset().level(),
        report.tickets.len(),
        resident,
        report.deferred,
        stats.used_bytes as f64 / (1024.0 * 1024.0),
        stats.decode_estimate_ms
    );
    for e in cache.drain_errors() {
        eprintln!("  {e}");
    }
    Ok(())
}

fn parse_u32_arg(args: &[String], flag: &str) -> Option<u32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(|s| s.clone())
}
