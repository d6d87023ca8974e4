//! Shared fixtures for unit tests: a coarse test configuration, synthetic
//! depth images of analytic scenes, and camera pose helpers.

use glam::{Mat4, Vec3};

use crate::config::FusionConfig;
use crate::hash_table::{HashTableParams, SpatialHashTable};
use crate::integration::fusion::FrameProjection;
use crate::integration::{DepthImage, DepthProvider, FrameInput};
use crate::types::{BlockIndex, Intrinsics, SlotId};
use crate::volume::surface_band_blocks;

pub const WIDTH: usize = 64;
pub const HEIGHT: usize = 48;
pub const HIGH_CONFIDENCE: u8 = 2;

/// Coarse voxels so a frame touches ~100 blocks, and a generous timeout so
/// unoptimized builds never trip it.
pub fn test_config() -> FusionConfig {
  let mut config = FusionConfig::default();
  config.resolution.tier_voxel_sizes = [0.02, 0.04, 0.08];
  config.resolution.tier_depth_thresholds = [1.5, 3.0];
  config.storage.pool_capacity = 2048;
  config.storage.initial_buckets = 1024;
  config.gate.frame_timeout = 5.0;
  config
}

pub fn test_table(config: &FusionConfig) -> SpatialHashTable {
  SpatialHashTable::new(HashTableParams {
    pool_capacity: config.storage.pool_capacity,
    initial_buckets: config.storage.initial_buckets,
    max_load_factor: config.storage.max_load_factor,
    max_probe_length: config.storage.max_probe_length,
  })
}

/// Roughly 56 degree horizontal field of view.
pub fn intrinsics() -> Intrinsics {
  Intrinsics::new(60.0, 60.0, 32.0, 24.0, WIDTH as u32, HEIGHT as u32)
}

/// Camera at `eye` looking at `target`, world +Y up (camera +Y is down).
pub fn look_at(eye: Vec3, target: Vec3) -> Mat4 {
  let forward = (target - eye).normalize();
  let right = forward.cross(Vec3::Y).normalize();
  let down = forward.cross(right);
  Mat4::from_cols(
    right.extend(0.0),
    down.extend(0.0),
    forward.extend(0.0),
    eye.extend(1.0),
  )
}

/// Camera at `eye` looking down world +Z.
pub fn pose_at(eye: Vec3) -> Mat4 {
  Mat4::from_translation(eye)
}

pub fn frame_input(timestamp: f64, camera_to_world: Mat4) -> FrameInput {
  FrameInput::new(timestamp, intrinsics(), camera_to_world, WIDTH as u32, HEIGHT as u32)
}

/// Fronto-parallel plane `distance` metres in front of the camera.
pub fn plane_depth(distance: f32) -> DepthImage {
  DepthImage::from_fn(WIDTH, HEIGHT, |_, _| (distance, HIGH_CONFIDENCE))
}

/// Sphere seen from `camera_to_world`; pixels that miss it are invalid.
pub fn sphere_depth(camera_to_world: Mat4, center: Vec3, radius: f32) -> DepthImage {
  let intr = intrinsics();
  let world_to_camera = camera_to_world.inverse();
  let c = world_to_camera.transform_point3(center);
  DepthImage::from_fn(WIDTH, HEIGHT, |x, y| {
    let ray = Vec3::new(
      (x as f32 - intr.cx()) / intr.fx(),
      (y as f32 - intr.cy()) / intr.fy(),
      1.0,
    );
    let dir = ray.normalize();
    let b = dir.dot(c);
    let disc = b * b - (c.length_squared() - radius * radius);
    if disc < 0.0 {
      return (0.0, 0);
    }
    let t = b - disc.sqrt();
    if t <= 0.0 {
      return (0.0, 0);
    }
    ((dir * t).z, HIGH_CONFIDENCE)
  })
}

/// Allocate the blocks covering the observed surface band, the way the
/// volume does before dispatching a frame.
pub fn allocate_band(
  table: &mut SpatialHashTable,
  input: &FrameInput,
  depth: &dyn DepthProvider,
  config: &FusionConfig,
) -> Vec<(BlockIndex, SlotId)> {
  let Some(frame) = FrameProjection::new(input, depth.width(), depth.height(), &config.resolution) else {
    return Vec::new();
  };
  surface_band_blocks(&frame, depth, config, usize::MAX)
    .into_iter()
    .filter_map(|(key, voxel_size)| table.insert_or_get(key, voxel_size).ok().map(|slot| (key, slot)))
    .collect()
}
