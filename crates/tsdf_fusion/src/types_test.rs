use sdf_conversion::*;

use super::*;

// SDF conversion tests
#[test]
fn test_roundtrip_zero() {
  assert_eq!(to_float(to_storage(0.0)), 0.0);
}

#[test]
fn test_roundtrip_fraction() {
  for sdf in [-0.75f32, -0.1, 0.33, 0.9] {
    let recovered = to_float(to_storage(sdf));
    assert!((sdf - recovered).abs() <= INV_SCALE, "{sdf} -> {recovered}");
  }
}

#[test]
fn test_clamping() {
  assert_eq!(to_storage(4.0), i16::MAX);
  assert_eq!(to_storage(-4.0), -i16::MAX);
  assert_eq!(to_float(i16::MIN), -1.0);
}

#[test]
fn test_empty_voxel_is_free_space() {
  let voxel = Voxel::EMPTY;
  assert_eq!(voxel.sdf_normalized(), 1.0);
  assert_eq!(voxel.weight, 0);
  assert_eq!(voxel.confidence, 0);
  assert!(!voxel.is_observed());
}

#[test]
fn test_voxel_layout_is_compact() {
  assert_eq!(std::mem::size_of::<Voxel>(), 4);
  // Voxels plus four 4-byte fields plus two 8-byte fields, no padding.
  assert_eq!(std::mem::size_of::<VoxelBlock>(), 512 * 4 + 16 + 16);
}

#[test]
fn test_block_reset_and_generations() {
  let mut block = VoxelBlock::EMPTY;
  block.voxels[3].weight = 9;
  block.mark_integrated();
  assert!(block.is_dirty());

  block.reset(0.008);
  assert_eq!(block.voxel_size, 0.008);
  assert!(!block.is_dirty());
  assert_eq!(block.observed_voxel_count(), 0);
}

#[test]
fn test_generation_wraps() {
  let mut block = VoxelBlock::EMPTY;
  block.integration_generation = u32::MAX;
  block.mesh_generation = u32::MAX;
  block.mark_integrated();
  assert_eq!(block.integration_generation, 0);
  assert!(block.is_dirty());
}

#[test]
fn test_block_index_origin_and_offset() {
  let key = BlockIndex::new(-1, 2, 0);
  let origin = key.origin(0.01);
  assert!((origin.x + 0.08).abs() < 1e-6);
  assert!((origin.y - 0.16).abs() < 1e-6);
  assert_eq!(key.offset(1, -2, 3), BlockIndex::new(0, 0, 3));
  assert_eq!(BlockIndex::new(i32::MAX, 0, 0).offset(1, 0, 0).x, i32::MAX);
}

#[test]
fn test_intrinsics_scaling() {
  let color = Intrinsics::new(1400.0, 1400.0, 960.0, 720.0, 1920, 1440);
  let depth = color.scaled_to(256, 192);
  assert!((depth.fx() - 1400.0 * 256.0 / 1920.0).abs() < 1e-3);
  assert!((depth.cy() - 96.0).abs() < 1e-3);
  assert_eq!((depth.width, depth.height), (256, 192));
  assert!(depth.is_finite());
}

// General types tests
#[test]
fn test_aabb_encapsulate() {
  let mut aabb = MinMaxAABB::empty();
  assert!(!aabb.is_valid());
  aabb.encapsulate([1.0, 2.0, 3.0]);
  aabb.encapsulate([-1.0, -2.0, -3.0]);

  assert_eq!(aabb.min, [-1.0, -2.0, -3.0]);
  assert_eq!(aabb.max, [1.0, 2.0, 3.0]);
  assert!(aabb.is_valid());
}

#[test]
fn test_mesh_output_clear() {
  let mut output = MeshOutput::new();
  output.vertices.push(Vertex::default());
  output.indices.extend([0, 0, 0]);
  output.retired.push(BlockIndex::default());
  assert_eq!(output.vertex_bytes().len(), std::mem::size_of::<Vertex>());
  assert_eq!(output.index_bytes().len(), 12);
  output.clear();

  assert!(output.is_empty());
  assert!(output.retired.is_empty());
  assert_eq!(output.triangle_count(), 0);
}
