//! Per-voxel fusion math shared by both backends.
//!
//! Integration is split in two phases so that a block's writes are
//! all-or-nothing:
//!
//! 1. [`observe_block`] - read-only. Projects every voxel centre into the
//!    depth image and records what the frame says about it.
//! 2. [`commit_block`] - applies those observations to the block in one
//!    write.
//!
//! Observations never depend on the stored voxel values, so an asynchronous
//! backend may compute them while earlier frames are still committing.
//!
//! # Signed distance
//!
//! ```text
//!   camera ──────────────►  voxel (z) ─────── surface (d_obs)
//!                           sdf = d_obs - z
//!
//!   sdf >  trunc : free space beyond the band  → carve
//!   |sdf| <= trunc : inside the band           → fuse
//!   sdf < -trunc : occluded                    → untouched
//! ```

use glam::{Mat4, Vec3};

use super::depth::DepthProvider;
use super::{FrameInput, VolumeAccessor};
use crate::config::{FusionConfig, ResolutionConfig, WeightingConfig};
use crate::constants::{index_to_coord, VOXELS_PER_BLOCK};
use crate::resolution::{observation_weight, truncation_distance, voxel_center};
use crate::types::{sdf_conversion, BlockIndex, SlotId, Voxel, VoxelBlock};

/// Camera model for one frame, in depth-image pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameProjection {
  world_to_camera: Mat4,
  camera_to_world: Mat4,
  fx: f32,
  fy: f32,
  cx: f32,
  cy: f32,
  width: usize,
  height: usize,
  min_depth: f32,
  max_depth: f32,
}

impl FrameProjection {
  /// `None` if the pose is not invertible or the intrinsics are unusable.
  pub fn new(input: &FrameInput, width: usize, height: usize, config: &ResolutionConfig) -> Option<Self> {
    if input.camera_to_world.determinant().abs() < f32::EPSILON {
      return None;
    }
    let world_to_camera = input.camera_to_world.inverse();
    let intrinsics = input.intrinsics.scaled_to(width as u32, height as u32);
    if !world_to_camera.is_finite() || !intrinsics.is_finite() {
      return None;
    }
    Some(Self {
      world_to_camera,
      camera_to_world: input.camera_to_world,
      fx: intrinsics.fx(),
      fy: intrinsics.fy(),
      cx: intrinsics.cx(),
      cy: intrinsics.cy(),
      width,
      height,
      min_depth: config.min_depth,
      max_depth: config.max_depth,
    })
  }

  #[inline]
  pub fn width(&self) -> usize {
    self.width
  }

  #[inline]
  pub fn height(&self) -> usize {
    self.height
  }

  #[inline]
  pub fn camera_origin(&self) -> Vec3 {
    self.camera_to_world.w_axis.truncate()
  }

  /// World point → (pixel x, pixel y, camera-space point). `None` behind the
  /// camera or outside the image.
  #[inline]
  pub fn project(&self, world: Vec3) -> Option<(usize, usize, Vec3)> {
    let p = self.world_to_camera.transform_point3(world);
    if p.z <= f32::EPSILON {
      return None;
    }
    let u = (self.fx * p.x / p.z + self.cx).round();
    let v = (self.fy * p.y / p.z + self.cy).round();
    if !(u >= 0.0 && v >= 0.0 && u < self.width as f32 && v < self.height as f32) {
      return None;
    }
    Some((u as usize, v as usize, p))
  }

  /// Camera-space point at pixel (u, v) with z-depth `depth`.
  #[inline]
  pub fn back_project_camera(&self, u: f32, v: f32, depth: f32) -> Vec3 {
    Vec3::new(
      (u - self.cx) * depth / self.fx,
      (v - self.cy) * depth / self.fy,
      depth,
    )
  }

  /// World-space point at pixel (u, v) with z-depth `depth`.
  #[inline]
  pub fn back_project(&self, u: f32, v: f32, depth: f32) -> Vec3 {
    self
      .camera_to_world
      .transform_point3(self.back_project_camera(u, v, depth))
  }

  #[inline]
  fn depth(&self, depth: &dyn DepthProvider, x: usize, y: usize) -> Option<f32> {
    depth.valid_depth_at(x, y, self.min_depth, self.max_depth)
  }

  /// Camera-space surface normal at (x, y) from forward differences.
  /// Zero when a neighbor is missing.
  pub fn surface_normal(&self, depth: &dyn DepthProvider, x: usize, y: usize) -> Vec3 {
    let (Some(d0), Some(dx), Some(dy)) = (
      self.depth(depth, x, y),
      self.depth(depth, x + 1, y),
      self.depth(depth, x, y + 1),
    ) else {
      return Vec3::ZERO;
    };
    let (u, v) = (x as f32, y as f32);
    let p0 = self.back_project_camera(u, v, d0);
    let px = self.back_project_camera(u + 1.0, v, dx);
    let py = self.back_project_camera(u, v + 1.0, dy);
    (px - p0).cross(py - p0)
  }
}

/// What one frame says about one voxel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Observation {
  /// Inside the truncation band. `sdf` is normalized to [-1, 1], `weight`
  /// is in storage units.
  Fuse { sdf: f32, weight: f32, confidence: u8 },
  /// Seen through: free space beyond the band.
  Carve { weight: f32 },
}

/// Block to observe, resolved from the active set.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BlockTarget {
  pub key: BlockIndex,
  pub slot: SlotId,
  pub voxel_size: f32,
}

/// Observations for one block, keyed by voxel index.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockObservations {
  pub key: BlockIndex,
  pub slot: SlotId,
  pub updates: Vec<(u16, Observation)>,
}

/// Observe every voxel of `target` in the frame. Read-only.
pub fn observe_block(
  target: &BlockTarget,
  frame: &FrameProjection,
  depth: &dyn DepthProvider,
  config: &FusionConfig,
) -> BlockObservations {
  let weighting = &config.weighting;
  let trunc = truncation_distance(target.voxel_size, &config.resolution);
  let mut updates = Vec::new();

  for index in 0..VOXELS_PER_BLOCK {
    let (x, y, z) = index_to_coord(index);
    let center = voxel_center(target.key, target.voxel_size, x, y, z);
    let Some((u, v, camera_point)) = frame.project(center) else {
      continue;
    };
    let Some(observed) = frame.depth(depth, u, v) else {
      continue;
    };
    let confidence = depth.confidence_at(u, v);
    if confidence < weighting.min_confidence {
      continue;
    }

    let sdf = observed - camera_point.z;
    if sdf < -trunc {
      continue;
    }

    let normal = frame.surface_normal(depth, u, v);
    let quality = observation_weight(observed, confidence, camera_point, normal, weighting);
    let weight = (quality * weighting.observation_weight_scale).max(1.0);

    let observation = if sdf > trunc {
      Observation::Carve {
        weight: weight * weighting.carve_rate,
      }
    } else {
      Observation::Fuse {
        sdf: sdf / trunc,
        weight,
        confidence,
      }
    };
    updates.push((index as u16, observation));
  }

  BlockObservations {
    key: target.key,
    slot: target.slot,
    updates,
  }
}

/// Outcome of applying one observation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoxelChange {
  Fused,
  Carved,
  Unchanged,
}

/// Apply one observation to a voxel.
///
/// Fusion is a weight-clamped running average. The previous weight is first
/// limited to `weight_max - Δw`, so `new_weight = min(old + Δw, weight_max)`
/// and the blend divides by exactly that weight.
pub fn apply_observation(voxel: &mut Voxel, observation: Observation, config: &WeightingConfig) -> VoxelChange {
  let weight_max = config.weight_max as f32;
  match observation {
    Observation::Fuse {
      sdf,
      weight,
      confidence,
    } => {
      if !sdf.is_finite() || !weight.is_finite() {
        return VoxelChange::Unchanged;
      }
      let delta = weight.clamp(0.0, weight_max);
      let previous = (voxel.weight as f32).min(weight_max - delta);
      let new_weight = previous + delta;
      if new_weight <= 0.0 {
        return VoxelChange::Unchanged;
      }
      let blended = (voxel.sdf_normalized() * previous + sdf.clamp(-1.0, 1.0) * delta) / new_weight;

      let before = *voxel;
      voxel.sdf = sdf_conversion::to_storage(blended);
      voxel.weight = new_weight.round().clamp(1.0, weight_max) as u8;
      voxel.confidence = voxel.confidence.max(confidence);
      if *voxel == before {
        VoxelChange::Unchanged
      } else {
        VoxelChange::Fused
      }
    }
    Observation::Carve { weight } => {
      // Only voxels claiming to be behind a surface hold geometry to remove.
      if voxel.weight == 0 || voxel.sdf >= 0 || !weight.is_finite() || weight <= 0.0 {
        return VoxelChange::Unchanged;
      }
      // Floor so every carve removes at least one unit.
      let remaining = (voxel.weight as f32 - weight).floor();
      if remaining < 1.0 {
        *voxel = Voxel::EMPTY;
      } else {
        voxel.weight = remaining as u8;
      }
      VoxelChange::Carved
    }
  }
}

/// Voxel counts of one block commit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommitCounts {
  pub fused: usize,
  pub carved: usize,
}

impl CommitCounts {
  #[inline]
  pub fn changed(&self) -> bool {
    self.fused + self.carved > 0
  }
}

/// Apply a block's observations in one write. Bumps the integration
/// generation if any voxel changed; refreshes last-observed if the frame saw
/// the block at all.
pub fn commit_block(
  block: &mut VoxelBlock,
  updates: &[(u16, Observation)],
  timestamp: f64,
  config: &WeightingConfig,
) -> CommitCounts {
  let mut counts = CommitCounts::default();
  for &(index, observation) in updates {
    let Some(voxel) = block.voxels.get_mut(index as usize) else {
      continue;
    };
    match apply_observation(voxel, observation, config) {
      VoxelChange::Fused => counts.fused += 1,
      VoxelChange::Carved => counts.carved += 1,
      VoxelChange::Unchanged => {}
    }
  }
  if counts.changed() {
    block.mark_integrated();
  }
  if !updates.is_empty() && timestamp > block.last_observed {
    block.last_observed = timestamp;
  }
  counts
}

/// Resolve the active set into observation targets. Pairs whose key no
/// longer maps to the slot are skipped.
pub fn resolve_targets(active: &[(BlockIndex, SlotId)], volume: &dyn VolumeAccessor) -> Vec<BlockTarget> {
  active
    .iter()
    .filter(|(key, slot)| volume.lookup(*key) == Some(*slot))
    .filter_map(|&(key, slot)| {
      volume.block(slot).map(|block| BlockTarget {
        key,
        slot,
        voxel_size: block.voxel_size,
      })
    })
    .collect()
}

/// Totals of a frame commit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameCommit {
  pub blocks_updated: usize,
  pub voxels_fused: usize,
  pub voxels_carved: usize,
  pub blocks_dropped: usize,
}

/// Commit every block's observations. A block whose key was removed or
/// re-keyed since observation is dropped on its own; the rest still commit.
pub fn commit_frame(
  blocks: &[BlockObservations],
  timestamp: f64,
  volume: &mut dyn VolumeAccessor,
  config: &WeightingConfig,
) -> FrameCommit {
  let mut total = FrameCommit::default();
  for observed in blocks {
    if observed.updates.is_empty() {
      continue;
    }
    if volume.lookup(observed.key) != Some(observed.slot) {
      total.blocks_dropped += 1;
      continue;
    }
    let mut counts = CommitCounts::default();
    let written = volume.write_block(observed.slot, &mut |block: &mut VoxelBlock| {
      counts = commit_block(block, &observed.updates, timestamp, config);
    });
    if !written {
      total.blocks_dropped += 1;
      continue;
    }
    if counts.changed() {
      total.blocks_updated += 1;
    }
    total.voxels_fused += counts.fused;
    total.voxels_carved += counts.carved;
  }
  total
}

#[cfg(test)]
#[path = "fusion_test.rs"]
mod fusion_test;
