//! Per-block marching cubes.
//!
//! A block owns the 8×8×8 cells whose lower corner is one of its voxel
//! centres. Cells on the +X/+Y/+Z faces reach one voxel into the
//! neighbouring blocks, and corner gradients reach one further on every
//! side, so meshing reads the block plus its 26 neighbours:
//!
//! ```text
//!   voxel lattice (one axis)
//!
//!   -1 │ 0  1  2  3  4  5  6  7 │ 8
//!   ───┼────────────────────────┼───
//!    ▲ │◄──── this block ──────►│ ▲
//!    │                            └─ +1 neighbour: closes the last cell,
//!    │                               central-difference gradient
//!    └─ -1 neighbour: gradient only
//! ```
//!
//! A corner without an observation (zero weight, missing block, or a
//! neighbour at another resolution) makes its cell unobservable, and the
//! cell is skipped.

use glam::Vec3A;

use super::tables::{CORNER_OFFSETS, EDGE_CORNERS, EDGE_ORIGIN_AXIS, EDGE_TABLE, TRI_TABLE};
use crate::config::{ExtractionConfig, CONFIDENCE_LEVELS};
use crate::constants::{coord_to_index, BLOCK_EDGE, CELLS_PER_AXIS};
use crate::hash_table::SpatialHashTable;
use crate::types::{BlockIndex, BlockMeshRange, MeshOutput, Vertex, Voxel, VoxelBlock};

const EDGE_LATTICE: usize = CELLS_PER_AXIS + 1;
const EDGE_SLOTS: usize = EDGE_LATTICE * EDGE_LATTICE * EDGE_LATTICE * 3;
const NO_VERTEX: u32 = u32::MAX;

/// A block and the 26 blocks around it.
pub struct BlockNeighborhood<'a> {
  key: BlockIndex,
  voxel_size: f32,
  blocks: [Option<&'a VoxelBlock>; 27],
}

impl<'a> BlockNeighborhood<'a> {
  /// `None` if `key` is not in the table.
  pub fn gather(table: &'a SpatialHashTable, key: BlockIndex) -> Option<Self> {
    let center = table.block_at(key)?;
    let blocks = std::array::from_fn(|i| {
      let (dx, dy, dz) = (i as i32 / 9 - 1, (i as i32 / 3) % 3 - 1, i as i32 % 3 - 1);
      if (dx, dy, dz) == (0, 0, 0) {
        Some(center)
      } else {
        table.block_at(key.offset(dx, dy, dz))
      }
    });
    Some(Self {
      key,
      voxel_size: center.voxel_size,
      blocks,
    })
  }

  #[inline]
  pub fn key(&self) -> BlockIndex {
    self.key
  }

  #[inline]
  pub fn voxel_size(&self) -> f32 {
    self.voxel_size
  }

  /// Observed voxel at lattice coordinate (x, y, z) relative to this
  /// block's first voxel. Valid for -8..16 on each axis.
  #[inline]
  pub fn sample(&self, x: i32, y: i32, z: i32) -> Option<Voxel> {
    let edge = BLOCK_EDGE as i32;
    let (bx, by, bz) = (x.div_euclid(edge), y.div_euclid(edge), z.div_euclid(edge));
    if !(-1..=1).contains(&bx) || !(-1..=1).contains(&by) || !(-1..=1).contains(&bz) {
      return None;
    }
    let block = self.blocks[((bx + 1) * 9 + (by + 1) * 3 + (bz + 1)) as usize]?;
    if block.voxel_size != self.voxel_size {
      return None;
    }
    let voxel = block.voxels[coord_to_index(
      x.rem_euclid(edge) as usize,
      y.rem_euclid(edge) as usize,
      z.rem_euclid(edge) as usize,
    )];
    voxel.is_observed().then_some(voxel)
  }

  #[inline]
  fn value(&self, x: i32, y: i32, z: i32) -> Option<f32> {
    self.sample(x, y, z).map(|v| v.sdf_normalized())
  }

  /// SDF gradient at a lattice point: central differences, one-sided where
  /// a neighbour is unobserved.
  fn gradient(&self, p: [i32; 3], center: f32) -> Vec3A {
    let mut g = [0.0f32; 3];
    for (axis, out) in g.iter_mut().enumerate() {
      let mut lo = p;
      let mut hi = p;
      lo[axis] -= 1;
      hi[axis] += 1;
      *out = match (self.value(lo[0], lo[1], lo[2]), self.value(hi[0], hi[1], hi[2])) {
        (Some(a), Some(b)) => (b - a) * 0.5,
        (None, Some(b)) => b - center,
        (Some(a), None) => center - a,
        (None, None) => 0.0,
      };
    }
    Vec3A::from_array(g)
  }

  #[inline]
  fn lattice_position(&self, p: [i32; 3]) -> Vec3A {
    let origin = Vec3A::from(self.key.origin(self.voxel_size));
    origin + (Vec3A::new(p[0] as f32, p[1] as f32, p[2] as f32) + 0.5) * self.voxel_size
  }
}

/// Outcome of meshing one block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeshedBlock {
  pub range: BlockMeshRange,
  pub triangles: usize,
  /// Triangles dropped as degenerate.
  pub rejected: usize,
}

/// Crossing on one cell edge, before it becomes a vertex.
#[derive(Clone, Copy)]
struct EdgePoint {
  position: Vec3A,
  normal: Vec3A,
  weight: f32,
  confidence: f32,
}

/// Mesh one block into `out`, appending vertices and global indices.
pub fn mesh_block(hood: &BlockNeighborhood<'_>, config: &ExtractionConfig, out: &mut MeshOutput) -> MeshedBlock {
  let vertex_start = out.vertices.len() as u32;
  let index_start = out.indices.len() as u32;
  let voxel_area = hood.voxel_size * hood.voxel_size;
  let min_area = config.min_triangle_area_factor * voxel_area;
  let mut cache = vec![NO_VERTEX; EDGE_SLOTS];
  let mut triangles = 0;
  let mut rejected = 0;

  for x in 0..CELLS_PER_AXIS {
    for y in 0..CELLS_PER_AXIS {
      for z in 0..CELLS_PER_AXIS {
        let cell = [x as i32, y as i32, z as i32];
        let Some(corners) = cell_corners(hood, cell) else {
          continue;
        };

        let mut cube = 0usize;
        for (i, voxel) in corners.iter().enumerate() {
          if voxel.sdf < 0 {
            cube |= 1 << i;
          }
        }
        let edge_mask = EDGE_TABLE[cube];
        if edge_mask == 0 {
          continue;
        }

        let mut points = [None; 12];
        for (edge, point) in points.iter_mut().enumerate() {
          if edge_mask & (1 << edge) != 0 {
            *point = Some(edge_point(hood, cell, &corners, edge));
          }
        }

        for tri in TRI_TABLE[cube].chunks_exact(3).take_while(|t| t[0] >= 0) {
          let edges = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
          let (Some(a), Some(b), Some(c)) = (points[edges[0]], points[edges[1]], points[edges[2]]) else {
            continue;
          };
          if is_degenerate(a.position, b.position, c.position, min_area, config.max_aspect_ratio) {
            rejected += 1;
            continue;
          }

          let mut ids = [
            vertex_id(&mut cache, cell, edges[0], a, config, out),
            vertex_id(&mut cache, cell, edges[1], b, config, out),
            vertex_id(&mut cache, cell, edges[2], c, config, out),
          ];
          // Counter-clockwise seen from free space.
          let face = (b.position - a.position).cross(c.position - a.position);
          if face.dot(a.normal + b.normal + c.normal) < 0.0 {
            ids.swap(1, 2);
          }
          out.indices.extend_from_slice(&ids);
          triangles += 1;
        }
      }
    }
  }

  MeshedBlock {
    range: BlockMeshRange {
      block: hood.key,
      vertices: vertex_start..out.vertices.len() as u32,
      indices: index_start..out.indices.len() as u32,
    },
    triangles,
    rejected,
  }
}

fn cell_corners(hood: &BlockNeighborhood<'_>, cell: [i32; 3]) -> Option<[Voxel; 8]> {
  let mut corners = [Voxel::EMPTY; 8];
  for (i, offset) in CORNER_OFFSETS.iter().enumerate() {
    corners[i] = hood.sample(
      cell[0] + offset[0] as i32,
      cell[1] + offset[1] as i32,
      cell[2] + offset[2] as i32,
    )?;
  }
  Some(corners)
}

fn corner_lattice(cell: [i32; 3], corner: usize) -> [i32; 3] {
  let offset = CORNER_OFFSETS[corner];
  [
    cell[0] + offset[0] as i32,
    cell[1] + offset[1] as i32,
    cell[2] + offset[2] as i32,
  ]
}

fn edge_point(hood: &BlockNeighborhood<'_>, cell: [i32; 3], corners: &[Voxel; 8], edge: usize) -> EdgePoint {
  let [c0, c1] = EDGE_CORNERS[edge];
  let (c0, c1) = (c0 as usize, c1 as usize);
  let (v0, v1) = (corners[c0], corners[c1]);
  let (s0, s1) = (v0.sdf_normalized(), v1.sdf_normalized());
  let denom = s0 - s1;
  let t = if denom.abs() > f32::EPSILON {
    (s0 / denom).clamp(0.0, 1.0)
  } else {
    0.5
  };

  let p0 = corner_lattice(cell, c0);
  let p1 = corner_lattice(cell, c1);
  let position = hood.lattice_position(p0).lerp(hood.lattice_position(p1), t);

  let g = hood.gradient(p0, s0).lerp(hood.gradient(p1, s1), t);
  let normal = g.try_normalize().unwrap_or_else(|| cell_gradient(corners));

  let lerp = |a: u8, b: u8| a as f32 + (b as f32 - a as f32) * t;
  EdgePoint {
    position,
    normal,
    weight: lerp(v0.weight, v1.weight),
    confidence: lerp(v0.confidence, v1.confidence),
  }
}

/// Whole-cell gradient from the eight corner values.
fn cell_gradient(corners: &[Voxel; 8]) -> Vec3A {
  let mut g = Vec3A::ZERO;
  for (i, offset) in CORNER_OFFSETS.iter().enumerate() {
    let s = corners[i].sdf_normalized();
    let sign = Vec3A::new(
      offset[0] as f32 * 2.0 - 1.0,
      offset[1] as f32 * 2.0 - 1.0,
      offset[2] as f32 * 2.0 - 1.0,
    );
    g += sign * s;
  }
  g.try_normalize().unwrap_or(Vec3A::Y)
}

fn vertex_id(
  cache: &mut [u32],
  cell: [i32; 3],
  edge: usize,
  point: EdgePoint,
  config: &ExtractionConfig,
  out: &mut MeshOutput,
) -> u32 {
  let (origin, axis) = EDGE_ORIGIN_AXIS[edge];
  let o = [
    cell[0] as usize + origin[0],
    cell[1] as usize + origin[1],
    cell[2] as usize + origin[2],
  ];
  let slot = ((o[0] * EDGE_LATTICE + o[1]) * EDGE_LATTICE + o[2]) * 3 + axis as usize;
  if cache[slot] != NO_VERTEX {
    return cache[slot];
  }

  let id = out.vertices.len() as u32;
  out.vertices.push(Vertex {
    position: point.position.to_array(),
    normal: point.normal.to_array(),
    alpha: (point.weight / config.alpha_saturation_weight).clamp(0.0, 1.0),
    quality: (point.confidence / (CONFIDENCE_LEVELS - 1) as f32).clamp(0.0, 1.0),
  });
  cache[slot] = id;
  id
}

/// Near-zero area or a sliver: longest edge² / (2 × area) above the limit.
pub fn is_degenerate(a: Vec3A, b: Vec3A, c: Vec3A, min_area: f32, max_aspect: f32) -> bool {
  let area = 0.5 * (b - a).cross(c - a).length();
  if !area.is_finite() || area <= min_area {
    return true;
  }
  let longest = (b - a)
    .length_squared()
    .max((c - b).length_squared())
    .max((a - c).length_squared());
  longest / (2.0 * area) > max_aspect
}

#[cfg(test)]
#[path = "mesher_test.rs"]
mod mesher_test;
