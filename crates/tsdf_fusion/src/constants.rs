//! Block layout constants for 8³ voxel blocks.
//!
//! Every block is a fixed cube of 8 voxels per axis. Blocks are the unit of
//! allocation, hashing, integration and meshing.
//!
//! # Block Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           VOXEL BLOCK (8³)                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Voxel index:  0    1    2    3    4    5    6    7  │ 8 (neighbor)     │
//! │                │                                  │ │                   │
//! │                └──────── 8 owned voxels ──────────┘ └─ +1 sample read   │
//! │                                                        from the next    │
//! │                                                        block to close   │
//! │                                                        boundary cells   │
//! │                                                                         │
//! │  World extent of a block = BLOCK_EDGE × voxel_size                      │
//! │  Voxel centres sit at (i + 0.5) × voxel_size from the block origin      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Memory Layout
//!
//! ```text
//! Voxel memory layout (row-major, Z innermost):
//!
//! Address:  0    1   ...   7    8    9  ...  63   64  ...
//! Content: [0,0,0][0,0,1]...[0,0,7][0,1,0]...[0,7,7][1,0,0]...
//!          └──────── Z ────────┘
//! ```
//!
//! # 3D Indexing
//!
//! ```text
//! index = x << 6 | y << 3 | z
//!       = x * 64 + y * 8 + z
//! ```

/// Voxels per block axis (must be 8 for bit-shift indexing)
pub const BLOCK_EDGE: usize = 8;

/// Voxels per block face (8² = 64)
pub const BLOCK_EDGE_SQ: usize = BLOCK_EDGE * BLOCK_EDGE;

/// Voxels per block (8³ = 512)
pub const VOXELS_PER_BLOCK: usize = BLOCK_EDGE * BLOCK_EDGE * BLOCK_EDGE;

/// Bit shift for Y coordinate indexing (log2(8) = 3)
pub const Y_SHIFT: u32 = 3;

/// Bit shift for X coordinate indexing (log2(64) = 6)
pub const X_SHIFT: u32 = 6;

/// Mask for extracting single axis from index (0x7 = 7)
pub const INDEX_MASK: usize = 0x7;

/// Marching-cubes cells per block axis. The last cell reads its +1 corner
/// from the neighboring block.
pub const CELLS_PER_AXIS: usize = BLOCK_EDGE;

/// Upper bound on triangles one block can emit (5 per cell).
pub const MAX_TRIANGLES_PER_BLOCK: usize = CELLS_PER_AXIS * CELLS_PER_AXIS * CELLS_PER_AXIS * 5;

/// Convert 3D voxel coordinates to linear index using bit shifts.
///
/// Layout: X is major axis (stride 64), Y is middle (stride 8), Z is minor
/// (stride 1)
#[inline(always)]
pub const fn coord_to_index(x: usize, y: usize, z: usize) -> usize {
  (x << X_SHIFT) | (y << Y_SHIFT) | z
}

/// Convert linear index to 3D voxel coordinates.
#[inline(always)]
pub const fn index_to_coord(idx: usize) -> (usize, usize, usize) {
  let x = idx >> X_SHIFT;
  let y = (idx >> Y_SHIFT) & INDEX_MASK;
  let z = idx & INDEX_MASK;
  (x, y, z)
}

#[cfg(test)]
#[path = "constants_test.rs"]
mod constants_test;
