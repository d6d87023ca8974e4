//! Core data types for sparse TSDF storage and mesh output.

use std::fmt;
use std::ops::Range;

use bytemuck::{Pod, Zeroable};
use glam::{Mat3, Vec3};

use crate::constants::{coord_to_index, BLOCK_EDGE, VOXELS_PER_BLOCK};

/// Integer coordinates of one 8×8×8 block in the world-aligned block grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockIndex {
  pub x: i32,
  pub y: i32,
  pub z: i32,
}

impl BlockIndex {
  /// Face-adjacent offsets (-X, +X, -Y, +Y, -Z, +Z).
  pub const FACE_NEIGHBORS: [[i32; 3]; 6] = [
    [-1, 0, 0],
    [1, 0, 0],
    [0, -1, 0],
    [0, 1, 0],
    [0, 0, -1],
    [0, 0, 1],
  ];

  #[inline(always)]
  pub const fn new(x: i32, y: i32, z: i32) -> Self {
    Self { x, y, z }
  }

  /// Neighbor at the given offset. Saturates at the i32 range so extreme keys
  /// never wrap around to the opposite side of the grid.
  #[inline]
  pub fn offset(self, dx: i32, dy: i32, dz: i32) -> Self {
    Self {
      x: self.x.saturating_add(dx),
      y: self.y.saturating_add(dy),
      z: self.z.saturating_add(dz),
    }
  }

  /// World-space position of the block's minimum corner.
  #[inline]
  pub fn origin(self, voxel_size: f32) -> Vec3 {
    let extent = voxel_size * BLOCK_EDGE as f32;
    Vec3::new(self.x as f32, self.y as f32, self.z as f32) * extent
  }
}

impl fmt::Display for BlockIndex {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "({}, {}, {})", self.x, self.y, self.z)
  }
}

/// Index of a slot inside the voxel block pool.
///
/// This is the only reference from index metadata into block storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SlotId(pub u32);

impl SlotId {
  #[inline(always)]
  pub const fn index(self) -> usize {
    self.0 as usize
  }
}

impl fmt::Display for SlotId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "slot#{}", self.0)
  }
}

/// SDF conversion utilities for quantized voxel storage.
///
/// Voxels store the signed distance normalized by the block's truncation
/// distance, so the stored range is always [-1, +1] regardless of voxel size.
/// Precision: 1/32767 of the truncation band per level.
pub mod sdf_conversion {
  /// Scale factor: normalized ±1.0 maps to ±32767.
  pub const SCALE: f32 = i16::MAX as f32;

  /// Inverse scale for converting back to float.
  pub const INV_SCALE: f32 = 1.0 / SCALE;

  /// Convert a normalized SDF to quantized i16 storage.
  #[inline(always)]
  pub fn to_storage(sdf: f32) -> i16 {
    (sdf * SCALE).clamp(-SCALE, SCALE).round() as i16
  }

  /// Convert quantized i16 storage back to a normalized SDF.
  #[inline(always)]
  pub fn to_float(value: i16) -> f32 {
    (value as f32 * INV_SCALE).clamp(-1.0, 1.0)
  }
}

/// One fused sample.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct Voxel {
  /// Normalized signed distance, quantized (see [`sdf_conversion`]).
  /// Negative = behind the observed surface, Positive = free space.
  pub sdf: i16,
  /// Accumulated observation weight (0 = never observed).
  pub weight: u8,
  /// Highest confidence level that contributed to this voxel.
  pub confidence: u8,
}

impl Voxel {
  /// Empty sentinel: free space, no weight, no confidence.
  pub const EMPTY: Self = Self {
    sdf: i16::MAX,
    weight: 0,
    confidence: 0,
  };

  #[inline(always)]
  pub fn sdf_normalized(&self) -> f32 {
    sdf_conversion::to_float(self.sdf)
  }

  #[inline(always)]
  pub fn is_observed(&self) -> bool {
    self.weight > 0
  }
}

impl Default for Voxel {
  fn default() -> Self {
    Self::EMPTY
  }
}

/// Storage unit of 512 voxels plus lifecycle metadata.
///
/// Plain-old-data so the whole pool can be viewed as bytes by a zero-copy
/// consumer.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct VoxelBlock {
  pub voxels: [Voxel; VOXELS_PER_BLOCK],
  /// Edge length of one voxel in metres.
  pub voxel_size: f32,
  /// Bumped whenever a commit changes any voxel.
  pub integration_generation: u32,
  /// Integration generation the current mesh was built from.
  pub mesh_generation: u32,
  /// Resolution tier the block was allocated for (0 = finest).
  pub resolution_tier: u32,
  /// Timestamp (seconds) of the last frame that observed this block.
  pub last_observed: f64,
  /// Pool allocation serial. Differs between two lives of the same slot or key.
  pub allocation: u64,
}

impl VoxelBlock {
  pub const EMPTY: Self = Self {
    voxels: [Voxel::EMPTY; VOXELS_PER_BLOCK],
    voxel_size: 0.0,
    integration_generation: 0,
    mesh_generation: 0,
    resolution_tier: 0,
    last_observed: 0.0,
    allocation: 0,
  };

  /// Reset to the empty sentinel for a fresh allocation.
  pub fn reset(&mut self, voxel_size: f32) {
    *self = Self::EMPTY;
    self.voxel_size = voxel_size;
  }

  #[inline(always)]
  pub fn voxel(&self, x: usize, y: usize, z: usize) -> &Voxel {
    &self.voxels[coord_to_index(x, y, z)]
  }

  /// True when voxel data changed since the last extracted mesh.
  #[inline]
  pub fn is_dirty(&self) -> bool {
    self.integration_generation != self.mesh_generation
  }

  #[inline]
  pub fn mark_integrated(&mut self) {
    self.integration_generation = self.integration_generation.wrapping_add(1);
  }

  pub fn observed_voxel_count(&self) -> usize {
    self.voxels.iter().filter(|v| v.is_observed()).count()
  }
}

/// Camera tracking state reported by the external tracker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TrackingQuality {
  #[default]
  Normal,
  Limited,
  NotAvailable,
}

/// Device thermal state, ordered from coolest to hottest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ThermalState {
  #[default]
  Nominal,
  Fair,
  Serious,
  Critical,
}

/// Pinhole intrinsics with the resolution they were calibrated for.
///
/// The matrix is column-major: `x_axis.x = fx`, `y_axis.y = fy`,
/// `z_axis.x = cx`, `z_axis.y = cy`.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Intrinsics {
  pub matrix: Mat3,
  pub width: u32,
  pub height: u32,
}

impl Intrinsics {
  pub fn new(fx: f32, fy: f32, cx: f32, cy: f32, width: u32, height: u32) -> Self {
    Self {
      matrix: Mat3::from_cols(
        Vec3::new(fx, 0.0, 0.0),
        Vec3::new(0.0, fy, 0.0),
        Vec3::new(cx, cy, 1.0),
      ),
      width,
      height,
    }
  }

  #[inline]
  pub fn fx(&self) -> f32 {
    self.matrix.x_axis.x
  }

  #[inline]
  pub fn fy(&self) -> f32 {
    self.matrix.y_axis.y
  }

  #[inline]
  pub fn cx(&self) -> f32 {
    self.matrix.z_axis.x
  }

  #[inline]
  pub fn cy(&self) -> f32 {
    self.matrix.z_axis.y
  }

  /// Rescale to another image resolution (e.g. color intrinsics applied to
  /// a lower-resolution depth map).
  pub fn scaled_to(&self, width: u32, height: u32) -> Self {
    if self.width == 0 || self.height == 0 {
      return Self { width, height, ..*self };
    }
    let sx = width as f32 / self.width as f32;
    let sy = height as f32 / self.height as f32;
    Self::new(
      self.fx() * sx,
      self.fy() * sy,
      self.cx() * sx,
      self.cy() * sy,
      width,
      height,
    )
  }

  pub fn is_finite(&self) -> bool {
    self.matrix.is_finite() && self.fx() > 0.0 && self.fy() > 0.0
  }
}

/// Output vertex with all mesh attributes.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
  /// World-space position.
  pub position: [f32; 3],

  /// Surface normal (unit vector, pointing into free space).
  pub normal: [f32; 3],

  /// Observation weight mapped to [0, 1] for fade-in.
  pub alpha: f32,

  /// Observation confidence mapped to [0, 1].
  pub quality: f32,
}

impl Default for Vertex {
  fn default() -> Self {
    Self {
      position: [0.0; 3],
      normal: [0.0, 1.0, 0.0],
      alpha: 1.0,
      quality: 1.0,
    }
  }
}

/// Axis-aligned bounding box.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MinMaxAABB {
  pub min: [f32; 3],
  pub max: [f32; 3],
}

impl MinMaxAABB {
  /// Create AABB with inverted extents (ready for encapsulation).
  pub fn empty() -> Self {
    Self {
      min: [f32::INFINITY; 3],
      max: [f32::NEG_INFINITY; 3],
    }
  }

  /// Expand AABB to include a point.
  #[inline]
  pub fn encapsulate(&mut self, point: [f32; 3]) {
    for i in 0..3 {
      self.min[i] = self.min[i].min(point[i]);
      self.max[i] = self.max[i].max(point[i]);
    }
  }

  /// Check if AABB is valid (min <= max on all axes).
  pub fn is_valid(&self) -> bool {
    self.min[0] <= self.max[0] && self.min[1] <= self.max[1] && self.min[2] <= self.max[2]
  }
}

impl Default for MinMaxAABB {
  fn default() -> Self {
    Self::empty()
  }
}

/// Where one block's geometry lives inside a [`MeshOutput`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockMeshRange {
  pub block: BlockIndex,
  pub vertices: Range<u32>,
  pub indices: Range<u32>,
}

/// Result of one extraction cycle.
///
/// Each entry in `blocks` replaces that block's previous mesh. Blocks that
/// produced no triangles still get an (empty) entry so stale geometry is
/// cleared. `retired` lists blocks whose previous mesh no longer matches a
/// live block: removed, or removed and allocated again. Apply `retired`
/// before `blocks`, since a reallocated block can appear in both.
#[derive(Default, Debug)]
pub struct MeshOutput {
  /// Output vertices with positions, normals, alpha and quality.
  pub vertices: Vec<Vertex>,

  /// Triangle indices (3 indices per triangle), global into `vertices`.
  pub indices: Vec<u32>,

  /// Per-block ranges into `vertices` / `indices`.
  pub blocks: Vec<BlockMeshRange>,

  /// Blocks whose meshes must be dropped by the consumer.
  pub retired: Vec<BlockIndex>,

  /// Bounding box encompassing all vertices.
  pub bounds: MinMaxAABB,
}

impl MeshOutput {
  pub fn new() -> Self {
    Self::default()
  }

  /// Clear all buffers, preserving capacity.
  pub fn clear(&mut self) {
    self.vertices.clear();
    self.indices.clear();
    self.blocks.clear();
    self.retired.clear();
    self.bounds = MinMaxAABB::empty();
  }

  /// Returns true if no geometry was generated.
  pub fn is_empty(&self) -> bool {
    self.vertices.is_empty()
  }

  pub fn vertex_count(&self) -> usize {
    self.vertices.len()
  }

  /// Number of triangles in the mesh.
  pub fn triangle_count(&self) -> usize {
    self.indices.len() / 3
  }

  /// Vertex buffer as raw bytes for upload.
  pub fn vertex_bytes(&self) -> &[u8] {
    bytemuck::cast_slice(&self.vertices)
  }

  /// Index buffer as raw bytes for upload.
  pub fn index_bytes(&self) -> &[u8] {
    bytemuck::cast_slice(&self.indices)
  }
}

#[cfg(test)]
#[path = "types_test.rs"]
mod types_test;
