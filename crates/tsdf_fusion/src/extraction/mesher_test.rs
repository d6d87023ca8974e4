use glam::Vec3A;

use super::*;
use crate::test_utils::{test_config, test_table};
use crate::types::sdf_conversion;

const VOXEL: f32 = 0.02;

fn observed(sdf: f32) -> Voxel {
  Voxel {
    sdf: sdf_conversion::to_storage(sdf),
    weight: 10,
    confidence: 2,
  }
}

fn fill(table: &mut SpatialHashTable, key: BlockIndex, voxel_size: f32, f: impl Fn(usize, usize, usize) -> Voxel) {
  let slot = table.insert_or_get(key, voxel_size).unwrap();
  table.update_block(slot, |block| {
    for x in 0..BLOCK_EDGE {
      for y in 0..BLOCK_EDGE {
        for z in 0..BLOCK_EDGE {
          block.voxels[coord_to_index(x, y, z)] = f(x, y, z);
        }
      }
    }
  });
}

fn z_ramp(_: usize, _: usize, z: usize) -> Voxel {
  observed((z as f32 - 3.5) / 8.0)
}

#[test]
fn test_gather_requires_center_block() {
  let table = test_table(&test_config());
  assert!(BlockNeighborhood::gather(&table, BlockIndex::new(0, 0, 0)).is_none());
}

#[test]
fn test_sample_crosses_into_neighbors() {
  let mut table = test_table(&test_config());
  let key = BlockIndex::new(2, -1, 0);
  fill(&mut table, key, VOXEL, |_, _, _| observed(0.25));
  fill(&mut table, key.offset(1, 0, 0), VOXEL, |_, _, _| observed(-0.5));
  fill(&mut table, key.offset(-1, -1, -1), VOXEL, |_, _, _| observed(0.75));

  let hood = BlockNeighborhood::gather(&table, key).unwrap();
  assert_eq!(hood.key(), key);
  assert_eq!(hood.voxel_size(), VOXEL);

  let sdf = |x, y, z| hood.sample(x, y, z).map(|v| v.sdf_normalized());
  assert!((sdf(7, 7, 7).unwrap() - 0.25).abs() < 1e-3);
  assert!((sdf(8, 0, 0).unwrap() + 0.5).abs() < 1e-3);
  assert!((sdf(15, 7, 7).unwrap() + 0.5).abs() < 1e-3);
  assert!((sdf(-1, -1, -1).unwrap() - 0.75).abs() < 1e-3);
  assert!((sdf(-8, -8, -8).unwrap() - 0.75).abs() < 1e-3);

  // Missing neighbours and anything past the 27-block window.
  assert_eq!(sdf(0, 8, 0), None);
  assert_eq!(sdf(16, 0, 0), None);
  assert_eq!(sdf(-9, 0, 0), None);
}

#[test]
fn test_sample_hides_unobserved_and_mismatched_voxels() {
  let mut table = test_table(&test_config());
  let key = BlockIndex::new(0, 0, 0);
  fill(&mut table, key, VOXEL, |x, _, _| {
    if x == 0 {
      Voxel::EMPTY
    } else {
      observed(0.1)
    }
  });
  fill(&mut table, key.offset(0, 0, 1), 2.0 * VOXEL, |_, _, _| observed(0.1));

  let hood = BlockNeighborhood::gather(&table, key).unwrap();
  assert!(hood.sample(0, 3, 3).is_none());
  assert!(hood.sample(1, 3, 3).is_some());
  assert!(hood.sample(3, 3, 8).is_none());
}

#[test]
fn test_gradient_of_ramp() {
  let mut table = test_table(&test_config());
  let key = BlockIndex::new(0, 0, 0);
  fill(&mut table, key, VOXEL, z_ramp);
  let hood = BlockNeighborhood::gather(&table, key).unwrap();

  // Interior: central difference.
  let center = hood.value(4, 4, 4).unwrap();
  let g = hood.gradient([4, 4, 4], center);
  assert!(g.x.abs() < 1e-3 && g.y.abs() < 1e-3);
  assert!((g.z - 0.125).abs() < 1e-3, "{g:?}");

  // No -Z neighbour: one-sided difference still sees the slope.
  let center = hood.value(4, 4, 0).unwrap();
  let g = hood.gradient([4, 4, 0], center);
  assert!((g.z - 0.125).abs() < 1e-3, "{g:?}");

  // Corner of the block: unobserved on the -X side, one-sided on +X.
  let center = hood.value(0, 0, 4).unwrap();
  let g = hood.gradient([0, 0, 4], center);
  assert!(g.x.abs() < 1e-3);
}

#[test]
fn test_lattice_position_is_voxel_center() {
  let mut table = test_table(&test_config());
  let key = BlockIndex::new(-1, 0, 2);
  fill(&mut table, key, VOXEL, z_ramp);
  let hood = BlockNeighborhood::gather(&table, key).unwrap();

  let origin = Vec3A::from(key.origin(VOXEL));
  let p = hood.lattice_position([0, 0, 0]);
  assert!((p - (origin + Vec3A::splat(0.5 * VOXEL))).length() < 1e-6);
  let q = hood.lattice_position([8, 0, 0]);
  assert!((q.x - p.x - 8.0 * VOXEL).abs() < 1e-6);
}

#[test]
fn test_mesh_block_ranges_are_offsets_into_output() {
  let mut table = test_table(&test_config());
  let first = BlockIndex::new(0, 0, 0);
  let second = BlockIndex::new(5, 0, 0);
  fill(&mut table, first, VOXEL, z_ramp);
  fill(&mut table, second, VOXEL, z_ramp);

  let config = ExtractionConfig::default();
  let mut out = MeshOutput::new();
  let a = mesh_block(&BlockNeighborhood::gather(&table, first).unwrap(), &config, &mut out);
  let b = mesh_block(&BlockNeighborhood::gather(&table, second).unwrap(), &config, &mut out);

  assert_eq!(a.range.block, first);
  assert_eq!(b.range.block, second);
  assert_eq!(a.range.vertices.start, 0);
  assert_eq!(a.range.vertices.end, b.range.vertices.start);
  assert_eq!(a.range.indices.end, b.range.indices.start);
  assert_eq!(b.range.vertices.end as usize, out.vertices.len());
  assert_eq!(b.range.indices.end as usize, out.indices.len());
  assert_eq!(a.triangles, b.triangles);
  assert_eq!(a.triangles + b.triangles, out.triangle_count());

  // Each block's indices stay inside its own vertex range.
  for range in [&a.range, &b.range] {
    let indices = &out.indices[range.indices.start as usize..range.indices.end as usize];
    assert!(indices.iter().all(|i| range.vertices.contains(i)));
  }
}
