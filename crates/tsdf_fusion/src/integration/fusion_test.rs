use glam::{Mat4, Vec3};

use super::*;
use crate::config::WeightingConfig;
use crate::resolution::block_index;
use crate::test_utils::{frame_input, plane_depth, pose_at, test_config, test_table, HEIGHT, WIDTH};
use crate::types::sdf_conversion;

const QUANTUM: f32 = 1.0 / sdf_conversion::SCALE;

fn voxel(sdf: f32, weight: u8) -> Voxel {
  Voxel {
    sdf: sdf_conversion::to_storage(sdf),
    weight,
    confidence: 1,
  }
}

fn fuse(sdf: f32, weight: f32) -> Observation {
  Observation::Fuse {
    sdf,
    weight,
    confidence: 2,
  }
}

fn projection() -> FrameProjection {
  let config = test_config();
  FrameProjection::new(&frame_input(0.0, Mat4::IDENTITY), WIDTH, HEIGHT, &config.resolution).unwrap()
}

fn target_at(point: Vec3, voxel_size: f32) -> BlockTarget {
  BlockTarget {
    key: block_index(point, voxel_size).unwrap(),
    slot: SlotId(0),
    voxel_size,
  }
}

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

#[test]
fn test_principal_point_projects_to_centre() {
  let frame = projection();
  let (u, v, p) = frame.project(Vec3::new(0.0, 0.0, 2.0)).unwrap();
  assert_eq!((u, v), (32, 24));
  assert_eq!(p.z, 2.0);
}

#[test]
fn test_project_back_project_agree() {
  let frame = projection();
  let world = frame.back_project(10.0, 7.0, 1.5);
  let (u, v, p) = frame.project(world).unwrap();
  assert_eq!((u, v), (10, 7));
  assert!((p.z - 1.5).abs() < 1e-5);
}

#[test]
fn test_project_rejects_behind_and_outside() {
  let frame = projection();
  assert!(frame.project(Vec3::new(0.0, 0.0, -1.0)).is_none());
  assert!(frame.project(Vec3::new(5.0, 0.0, 1.0)).is_none());
}

#[test]
fn test_intrinsics_rescaled_to_depth_resolution() {
  let config = test_config();
  let input = frame_input(0.0, Mat4::IDENTITY);
  let half = FrameProjection::new(&input, WIDTH / 2, HEIGHT / 2, &config.resolution).unwrap();
  let (u, v, _) = half.project(Vec3::new(0.0, 0.0, 1.0)).unwrap();
  assert_eq!((u, v), (16, 12));
}

#[test]
fn test_singular_pose_has_no_projection() {
  let config = test_config();
  let input = frame_input(0.0, Mat4::ZERO);
  assert!(FrameProjection::new(&input, WIDTH, HEIGHT, &config.resolution).is_none());
}

#[test]
fn test_plane_normal_faces_camera_axis() {
  let frame = projection();
  let depth = plane_depth(1.0);
  let n = frame.surface_normal(&depth, 10, 10).normalize();
  assert!(n.z.abs() > 0.999, "normal {n:?}");
  // Missing neighbor on the image border.
  assert_eq!(frame.surface_normal(&depth, WIDTH - 1, 0), Vec3::ZERO);
}

// ---------------------------------------------------------------------------
// Per-voxel update
// ---------------------------------------------------------------------------

#[test]
fn test_fuse_into_empty_voxel() {
  let config = WeightingConfig::default();
  let mut v = Voxel::EMPTY;
  assert_eq!(apply_observation(&mut v, fuse(-0.25, 6.0), &config), VoxelChange::Fused);
  assert_eq!(v.weight, 6);
  assert!((v.sdf_normalized() + 0.25).abs() <= QUANTUM);
  assert_eq!(v.confidence, 2);
}

#[test]
fn test_weighted_running_average() {
  let config = WeightingConfig::default();
  let mut v = voxel(0.5, 10);
  apply_observation(&mut v, fuse(-0.5, 10.0), &config);
  assert_eq!(v.weight, 20);
  assert!(v.sdf_normalized().abs() <= QUANTUM);

  let mut v = voxel(0.6, 30);
  apply_observation(&mut v, fuse(0.0, 10.0), &config);
  assert_eq!(v.weight, 40);
  assert!((v.sdf_normalized() - 0.45).abs() <= 2.0 * QUANTUM);
}

#[test]
fn test_weight_saturates_and_blend_uses_clamped_previous() {
  let config = WeightingConfig::default();
  let max = config.weight_max as f32;
  let mut v = voxel(1.0, config.weight_max as u8);
  apply_observation(&mut v, fuse(-1.0, 8.0), &config);
  assert_eq!(v.weight as u32, config.weight_max);
  let previous = max - 8.0;
  let expected = (previous - 8.0) / max;
  assert!((v.sdf_normalized() - expected).abs() <= 2.0 * QUANTUM);
}

#[test]
fn test_fused_sdf_stays_convex() {
  let config = WeightingConfig::default();
  let mut v = voxel(0.9, 200);
  for _ in 0..50 {
    apply_observation(&mut v, fuse(0.9, 40.0), &config);
    assert!(v.sdf_normalized() <= 0.9 + 2.0 * QUANTUM);
    assert!(v.weight as u32 <= config.weight_max);
  }
}

#[test]
fn test_carve_decays_weight() {
  let config = WeightingConfig::default();
  let mut v = voxel(-0.3, 10);
  assert_eq!(
    apply_observation(&mut v, Observation::Carve { weight: 4.0 }, &config),
    VoxelChange::Carved
  );
  assert_eq!(v.weight, 6);
  assert!((v.sdf_normalized() + 0.3).abs() <= QUANTUM);

  let mut v = voxel(-0.3, 10);
  apply_observation(&mut v, Observation::Carve { weight: 0.25 }, &config);
  assert_eq!(v.weight, 9, "every carve removes at least one unit");
}

#[test]
fn test_carve_to_empty() {
  let config = WeightingConfig::default();
  let mut v = voxel(-0.3, 2);
  apply_observation(&mut v, Observation::Carve { weight: 4.0 }, &config);
  assert_eq!(v, Voxel::EMPTY);
}

#[test]
fn test_carve_ignores_free_and_unobserved_voxels() {
  let config = WeightingConfig::default();
  let carve = Observation::Carve { weight: 4.0 };

  let mut positive = voxel(0.4, 10);
  assert_eq!(apply_observation(&mut positive, carve, &config), VoxelChange::Unchanged);
  assert_eq!(positive.weight, 10);

  let mut empty = Voxel::EMPTY;
  assert_eq!(apply_observation(&mut empty, carve, &config), VoxelChange::Unchanged);
}

#[test]
fn test_non_finite_observation_ignored() {
  let config = WeightingConfig::default();
  let mut v = voxel(0.1, 5);
  let before = v;
  assert_eq!(apply_observation(&mut v, fuse(f32::NAN, 3.0), &config), VoxelChange::Unchanged);
  assert_eq!(
    apply_observation(&mut v, Observation::Carve { weight: f32::INFINITY }, &config),
    VoxelChange::Unchanged
  );
  assert_eq!(v, before);
}

// ---------------------------------------------------------------------------
// Block observation
// ---------------------------------------------------------------------------

#[test]
fn test_block_on_plane_gets_fuse_observations() {
  let config = test_config();
  let frame = projection();
  let depth = plane_depth(1.0);
  let target = target_at(Vec3::new(0.0, 0.0, 1.0), 0.02);

  let observed = observe_block(&target, &frame, &depth, &config);
  assert!(!observed.updates.is_empty());
  for (_, observation) in &observed.updates {
    match *observation {
      Observation::Fuse { sdf, weight, .. } => {
        assert!((-1.0..=1.0).contains(&sdf));
        assert!(weight >= 1.0);
      }
      Observation::Carve { .. } => {}
    }
  }
  let fused = observed
    .updates
    .iter()
    .filter(|(_, o)| matches!(o, Observation::Fuse { .. }))
    .count();
  assert!(fused > 0);
}

#[test]
fn test_block_in_front_of_surface_is_carved() {
  let config = test_config();
  let frame = projection();
  let depth = plane_depth(1.0);
  let target = target_at(Vec3::new(0.0, 0.0, 0.5), 0.02);

  let observed = observe_block(&target, &frame, &depth, &config);
  assert!(!observed.updates.is_empty());
  assert!(observed
    .updates
    .iter()
    .all(|(_, o)| matches!(o, Observation::Carve { .. })));
}

#[test]
fn test_occluded_and_unseen_blocks_have_no_observations() {
  let config = test_config();
  let frame = projection();
  let depth = plane_depth(1.0);

  let behind = target_at(Vec3::new(0.0, 0.0, 1.6), 0.02);
  assert!(observe_block(&behind, &frame, &depth, &config).updates.is_empty());

  let aside = target_at(Vec3::new(10.0, 0.0, 1.0), 0.02);
  assert!(observe_block(&aside, &frame, &depth, &config).updates.is_empty());
}

// ---------------------------------------------------------------------------
// Commit
// ---------------------------------------------------------------------------

#[test]
fn test_commit_bumps_generation_only_on_change() {
  let config = WeightingConfig::default();
  let mut block = VoxelBlock::EMPTY;
  let counts = commit_block(&mut block, &[(3, fuse(0.2, 4.0))], 1.5, &config);
  assert_eq!(counts.fused, 1);
  assert_eq!(block.integration_generation, 1);
  assert_eq!(block.last_observed, 1.5);

  // Carving empty voxels changes nothing but still counts as seen.
  let counts = commit_block(&mut block, &[(9, Observation::Carve { weight: 2.0 })], 2.0, &config);
  assert!(!counts.changed());
  assert_eq!(block.integration_generation, 1);
  assert_eq!(block.last_observed, 2.0);
}

#[test]
fn test_commit_ignores_out_of_range_index() {
  let config = WeightingConfig::default();
  let mut block = VoxelBlock::EMPTY;
  let counts = commit_block(&mut block, &[(u16::MAX, fuse(0.2, 4.0))], 1.0, &config);
  assert_eq!(counts, CommitCounts::default());
}

#[test]
fn test_commit_frame_drops_rekeyed_blocks() {
  let config = test_config();
  let mut table = test_table(&config);
  let a = BlockIndex::new(0, 0, 0);
  let b = BlockIndex::new(1, 0, 0);
  let slot_a = table.insert_or_get(a, 0.02).unwrap();
  let slot_b = table.insert_or_get(b, 0.02).unwrap();

  let blocks = vec![
    BlockObservations {
      key: a,
      slot: slot_a,
      updates: vec![(0, fuse(0.1, 2.0))],
    },
    BlockObservations {
      key: b,
      slot: slot_b,
      updates: vec![(0, fuse(0.1, 2.0))],
    },
  ];
  table.remove(b);

  let commit = commit_frame(&blocks, 1.0, &mut table, &config.weighting);
  assert_eq!(commit.blocks_updated, 1);
  assert_eq!(commit.blocks_dropped, 1);
  assert_eq!(table.block(slot_a).unwrap().integration_generation, 1);
}

#[test]
fn test_resolve_targets_skips_stale_pairs() {
  let config = test_config();
  let mut table = test_table(&config);
  let a = BlockIndex::new(0, 0, 0);
  let slot = table.insert_or_get(a, 0.04).unwrap();
  let active = [(a, slot), (BlockIndex::new(5, 5, 5), slot)];
  let targets = resolve_targets(&active, &table);
  assert_eq!(targets.len(), 1);
  assert_eq!(targets[0].voxel_size, 0.04);
}

#[test]
fn test_observation_ignores_stored_values() {
  let config = test_config();
  let mut table = test_table(&config);
  let frame = FrameProjection::new(
    &frame_input(0.0, pose_at(Vec3::ZERO)),
    WIDTH,
    HEIGHT,
    &config.resolution,
  )
  .unwrap();
  let depth = plane_depth(1.0);
  let key = block_index(Vec3::new(0.0, 0.0, 1.0), 0.02).unwrap();
  let slot = table.insert_or_get(key, 0.02).unwrap();
  let target = BlockTarget {
    key,
    slot,
    voxel_size: 0.02,
  };

  let first = observe_block(&target, &frame, &depth, &config);
  commit_frame(std::slice::from_ref(&first), 0.0, &mut table, &config.weighting);
  let second = observe_block(&target, &frame, &depth, &config);
  assert_eq!(first.updates, second.updates);
}
