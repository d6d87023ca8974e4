//! Adaptive resolution - pure coordinate and weighting math.
//!
//! Maps depth to a resolution tier, world positions to block coordinates,
//! voxel size to a truncation band, and observation geometry to fusion
//! weights. Nothing here holds state.
//!
//! # Block coordinates
//!
//! ```text
//!   world x:   -2e    -e     0     e     2e       (e = 8 × voxel_size)
//!               │      │     │     │      │
//!   block:      │  -2  │ -1  │  0  │  1   │
//!
//!   floor(-0.001 / e) = -1   (truncation would give 0, folding two blocks
//!                              onto one index next to the origin)
//! ```

use glam::Vec3;

use crate::config::{ResolutionConfig, WeightingConfig, CONFIDENCE_LEVELS, TIER_COUNT};
use crate::constants::BLOCK_EDGE;
use crate::error::FusionError;
use crate::types::BlockIndex;

/// Resolution tier for an observation at `depth`. Depths past the far tier
/// threshold (and non-finite depths) map to the coarsest tier.
#[inline]
pub fn tier_for_depth(depth: f32, config: &ResolutionConfig) -> usize {
  let [near, far] = config.tier_depth_thresholds;
  if depth < near {
    0
  } else if depth < far {
    1
  } else {
    TIER_COUNT - 1
  }
}

/// Voxel size for an observation at `depth`. Monotonic non-decreasing.
#[inline]
pub fn voxel_size(depth: f32, config: &ResolutionConfig) -> f32 {
  config.tier_voxel_sizes[tier_for_depth(depth, config)]
}

/// World extent of one block at the given voxel size.
#[inline(always)]
pub fn block_extent(voxel_size: f32) -> f32 {
  voxel_size * BLOCK_EDGE as f32
}

/// Block containing `position`. Each axis is
/// `floor(position / (voxel_size × 8))`.
pub fn block_index(position: Vec3, voxel_size: f32) -> Result<BlockIndex, FusionError> {
  if !voxel_size.is_finite() || voxel_size <= 0.0 {
    return Err(FusionError::InvalidVoxelSize(voxel_size));
  }
  if !position.is_finite() {
    return Err(FusionError::NonFiniteCoordinate);
  }
  let scaled = (position / block_extent(voxel_size)).floor();
  let limit = i32::MAX as f32;
  if scaled.abs().max_element() >= limit {
    return Err(FusionError::NonFiniteCoordinate);
  }
  Ok(BlockIndex::new(scaled.x as i32, scaled.y as i32, scaled.z as i32))
}

/// World-space centre of voxel (x, y, z) inside `block`.
#[inline]
pub fn voxel_center(block: BlockIndex, voxel_size: f32, x: usize, y: usize, z: usize) -> Vec3 {
  block.origin(voxel_size) + (Vec3::new(x as f32, y as f32, z as f32) + 0.5) * voxel_size
}

/// Truncation band half-width. Always ≥ 2 × voxel size (validated
/// multiplier) and ≥ the configured floor.
#[inline]
pub fn truncation_distance(voxel_size: f32, config: &ResolutionConfig) -> f32 {
  (config.truncation_multiplier * voxel_size).max(config.truncation_floor)
}

/// Full weight up to the reference depth, inverse-square falloff beyond it.
#[inline]
pub fn distance_weight(depth: f32, config: &WeightingConfig) -> f32 {
  let floor = config.distance_weight_floor;
  if !depth.is_finite() {
    return floor;
  }
  if depth <= config.distance_reference_depth {
    return 1.0;
  }
  let ratio = config.distance_reference_depth / depth;
  (ratio * ratio).clamp(floor, 1.0)
}

/// Weight of a sensor confidence level. Levels above the table saturate.
#[inline]
pub fn confidence_weight(level: u8, config: &WeightingConfig) -> f32 {
  let idx = (level as usize).min(CONFIDENCE_LEVELS - 1);
  config.confidence_weights[idx].clamp(config.confidence_weight_floor, 1.0)
}

/// |cos θ| between the viewing ray and the surface normal, floored so that
/// grazing observations still contribute. Degenerate vectors count as
/// head-on.
#[inline]
pub fn viewing_angle_weight(view_ray: Vec3, normal: Vec3, config: &WeightingConfig) -> f32 {
  let (Some(ray), Some(n)) = (view_ray.try_normalize(), normal.try_normalize()) else {
    return 1.0;
  };
  ray.dot(n).abs().clamp(config.angle_weight_floor, 1.0)
}

/// Δw = distance × confidence × viewing angle.
#[inline]
pub fn observation_weight(
  depth: f32,
  confidence: u8,
  view_ray: Vec3,
  normal: Vec3,
  config: &WeightingConfig,
) -> f32 {
  distance_weight(depth, config)
    * confidence_weight(confidence, config)
    * viewing_angle_weight(view_ray, normal, config)
}

#[cfg(test)]
#[path = "resolution_test.rs"]
mod resolution_test;
