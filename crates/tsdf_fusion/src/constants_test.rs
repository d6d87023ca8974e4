use super::*;

#[test]
fn test_block_edge_is_power_of_two() {
  assert!(BLOCK_EDGE.is_power_of_two());
  assert_eq!(VOXELS_PER_BLOCK, 512);
  assert_eq!(1usize << X_SHIFT, BLOCK_EDGE_SQ);
}

#[test]
fn test_coord_to_index_roundtrip() {
  for x in 0..BLOCK_EDGE {
    for y in 0..BLOCK_EDGE {
      for z in 0..BLOCK_EDGE {
        let idx = coord_to_index(x, y, z);
        assert!(idx < VOXELS_PER_BLOCK);
        assert_eq!((x, y, z), index_to_coord(idx), "Roundtrip failed for ({x}, {y}, {z})");
      }
    }
  }
}

#[test]
fn test_z_is_minor_axis() {
  assert_eq!(coord_to_index(0, 0, 1), 1);
  assert_eq!(coord_to_index(0, 1, 0), BLOCK_EDGE);
  assert_eq!(coord_to_index(1, 0, 0), BLOCK_EDGE_SQ);
}
