use std::collections::HashSet;

use glam::{Mat4, Vec3};

use super::*;
use crate::config::ConfigError;
use crate::integration::SkipReason;
use crate::test_utils::{frame_input, plane_depth, pose_at, test_config};

const DT: f64 = 1.0 / 30.0;

fn volume(config: FusionConfig) -> TsdfVolume {
  TsdfVolume::new(config, BackendKind::Cpu).unwrap()
}

fn assert_bijection(table: &SpatialHashTable) {
  let pairs = table.all_blocks();
  assert_eq!(pairs.len(), table.len());
  assert_eq!(table.pool().allocated_count(), table.len());
  let slots: HashSet<SlotId> = pairs.iter().map(|(_, slot)| *slot).collect();
  assert_eq!(slots.len(), pairs.len(), "two keys share a slot");
  for (key, slot) in pairs {
    assert!(table.pool().is_allocated(slot));
    assert_eq!(table.lookup(key), Some(slot));
  }
}

fn generations(table: &SpatialHashTable) -> Vec<(BlockIndex, u32)> {
  let mut out = Vec::new();
  table.for_each_block(|key, _, block| out.push((key, block.integration_generation)));
  out.sort_unstable();
  out
}

#[test]
fn test_rejects_invalid_config() {
  let mut config = test_config();
  config.resolution.truncation_multiplier = 1.0;
  let result = TsdfVolume::new(config, BackendKind::Cpu);
  assert!(matches!(
    result,
    Err(FusionError::InvalidConfig(ConfigError::TruncationTooNarrow(_)))
  ));
}

#[test]
fn test_surface_band_covers_plane() {
  let config = test_config();
  let input = frame_input(0.0, pose_at(Vec3::ZERO));
  let depth = plane_depth(1.0);
  let frame = FrameProjection::new(&input, depth.width(), depth.height(), &config.resolution).unwrap();

  let blocks = surface_band_blocks(&frame, &depth, &config, usize::MAX);
  assert!(!blocks.is_empty());
  // Band [0.92, 1.08] with 0.16 m blocks spans z = 5 and z = 6.
  assert!(blocks.iter().all(|(key, size)| (key.z == 5 || key.z == 6) && *size == 0.02));
  assert!(blocks.windows(2).all(|w| w[0].0 < w[1].0));

  let limited = surface_band_blocks(&frame, &depth, &config, 10);
  assert_eq!(limited.len(), 10);
  assert!(limited.windows(2).all(|w| w[0].0 < w[1].0));
  assert!(limited.iter().all(|b| blocks.contains(b)));

  let eye = frame.camera_origin();
  let distance = |(key, size): &(BlockIndex, f32)| {
    (key.origin(*size) + Vec3::splat(block_extent(*size) * 0.5)).distance_squared(eye)
  };
  let kept = limited.iter().map(distance).fold(0.0f32, f32::max);
  let dropped = blocks
    .iter()
    .filter(|b| !limited.contains(b))
    .map(distance)
    .fold(f32::INFINITY, f32::min);
  assert!(kept <= dropped);
}

#[test]
fn test_plane_frame_allocates_and_records() {
  let mut volume = volume(test_config());
  let stats = volume
    .integrate_frame(&frame_input(0.0, pose_at(Vec3::ZERO)), &plane_depth(1.0))
    .unwrap();

  assert!(!stats.deferred);
  assert_eq!(stats.blocks_submitted, volume.table().len());
  assert!(stats.voxels_fused > 0);
  assert_eq!(volume.metrics().frames_integrated, 1);
  assert_eq!(volume.metrics().blocks_allocated, volume.table().len() as u64);
  assert_bijection(volume.table());

  let record = volume.audit().last().unwrap();
  assert_eq!(record.frame_index, 0);
  assert_eq!(record.outcome, RecordOutcome::Integrated);
  assert!(record.keyframe);
  assert_eq!(record.blocks.len(), stats.blocks_submitted);
  assert!(record.blocks.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_skipped_frame_releases_new_blocks() {
  let mut volume = volume(test_config());
  let hot = frame_input(0.0, pose_at(Vec3::ZERO)).with_thermal(ThermalState::Critical);
  assert_eq!(
    volume.integrate_frame(&hot, &plane_depth(1.0)),
    Err(SkipReason::ThermalThrottle)
  );
  assert!(volume.table().is_empty());
  assert_eq!(volume.metrics().blocks_allocated, 0);
  assert_eq!(volume.metrics().skip_count(SkipReason::ThermalThrottle), 1);

  let record = volume.audit().last().unwrap();
  assert_eq!(record.outcome, RecordOutcome::Skipped(SkipReason::ThermalThrottle));
  assert!(record.blocks.is_empty());
  assert!(!record.keyframe);

  volume
    .integrate_frame(&frame_input(DT, pose_at(Vec3::ZERO)), &plane_depth(1.0))
    .unwrap();
  let before = generations(volume.table());

  let moved = frame_input(2.0 * DT, pose_at(Vec3::new(0.2, 0.0, 0.0))).with_thermal(ThermalState::Critical);
  assert!(volume.integrate_frame(&moved, &plane_depth(1.0)).is_err());
  assert_eq!(generations(volume.table()), before);
  assert_bijection(volume.table());
}

#[test]
fn test_tracking_lost_touches_nothing() {
  let mut volume = volume(test_config());
  let lost = frame_input(0.0, pose_at(Vec3::ZERO)).with_tracking(TrackingQuality::NotAvailable);
  assert_eq!(
    volume.integrate_frame(&lost, &plane_depth(1.0)),
    Err(SkipReason::TrackingLost)
  );
  assert!(volume.table().is_empty());
  assert_eq!(volume.audit().len(), 1);
}

#[test]
fn test_anticipation_target_guards() {
  let position = Vec3::new(1.0, 2.0, 3.0);
  assert_eq!(anticipation_target(position, Vec3::ZERO, 0.5, 0.05), None);
  assert_eq!(anticipation_target(position, Vec3::splat(0.01), 0.5, 0.05), None);
  assert_eq!(anticipation_target(position, Vec3::new(f32::NAN, 0.0, 0.0), 0.5, 0.05), None);
  assert_eq!(anticipation_target(position, Vec3::new(f32::INFINITY, 0.0, 0.0), 0.5, 0.05), None);
  // Tiny but nonzero speed with a zero floor must not divide to infinity.
  assert_eq!(anticipation_target(position, Vec3::new(1e-30, 0.0, 0.0), 0.5, 0.0), None);

  let target = anticipation_target(position, Vec3::new(0.0, 0.0, 2.0), 0.5, 0.05).unwrap();
  assert!((target - Vec3::new(1.0, 2.0, 3.5)).length() < 1e-6);
}

#[test]
fn test_stationary_camera_anticipates_nothing() {
  let mut volume = volume(test_config());
  volume
    .integrate_frame(&frame_input(0.0, pose_at(Vec3::ZERO)), &plane_depth(1.0))
    .unwrap();
  let after_first = volume.table().len();
  volume
    .integrate_frame(&frame_input(DT, pose_at(Vec3::ZERO)), &plane_depth(1.0))
    .unwrap();
  assert_eq!(volume.metrics().blocks_anticipated, 0);
  assert_eq!(volume.table().len(), after_first);
}

#[test]
fn test_moving_camera_preallocates_ahead() {
  let mut volume = volume(test_config());
  volume
    .integrate_frame(&frame_input(0.0, pose_at(Vec3::ZERO)), &plane_depth(1.0))
    .unwrap();
  assert_eq!(volume.metrics().blocks_anticipated, 0);

  // 0.9 m/s along +X: look-ahead point (0.53, 0, 0) lies in block (3, 0, 0).
  volume
    .integrate_frame(&frame_input(DT, pose_at(Vec3::new(0.03, 0.0, 0.0))), &plane_depth(1.0))
    .unwrap();
  assert_eq!(volume.metrics().blocks_anticipated, 27);
  for key in [
    BlockIndex::new(3, 0, 0),
    BlockIndex::new(2, -1, -1),
    BlockIndex::new(4, 1, 1),
  ] {
    assert!(volume.table().contains(key), "{key} not preallocated");
  }
  assert_bijection(volume.table());
}

#[test]
fn test_non_finite_pose_rejected_without_touching_table() {
  let mut volume = volume(test_config());
  volume
    .integrate_frame(&frame_input(0.0, pose_at(Vec3::ZERO)), &plane_depth(1.0))
    .unwrap();
  let before = generations(volume.table());

  let broken = frame_input(DT, Mat4::from_translation(Vec3::new(f32::NAN, 0.0, 0.0)));
  assert_eq!(
    volume.integrate_frame(&broken, &plane_depth(1.0)),
    Err(SkipReason::PoseTeleport)
  );
  assert_eq!(generations(volume.table()), before);

  // The broken sample breaks the motion estimate instead of poisoning it.
  volume
    .integrate_frame(&frame_input(2.0 * DT, pose_at(Vec3::new(0.03, 0.0, 0.0))), &plane_depth(1.0))
    .unwrap();
  assert_eq!(volume.metrics().blocks_anticipated, 0);
  assert_bijection(volume.table());
}

#[test]
fn test_reset_tracking_accepts_relocalized_pose() {
  for kind in [BackendKind::Cpu, BackendKind::Accelerator] {
    let mut volume = TsdfVolume::new(test_config(), kind).unwrap();
    volume
      .integrate_frame(&frame_input(0.0, pose_at(Vec3::ZERO)), &plane_depth(1.0))
      .unwrap();

    volume.reset_tracking();
    let relocalized = frame_input(DT, pose_at(Vec3::new(5.0, 0.0, 0.0)));
    assert!(volume.integrate_frame(&relocalized, &plane_depth(1.0)).is_ok(), "{kind:?}");
    let record = volume.audit().last().unwrap();
    assert!(record.keyframe);
    assert_eq!(volume.metrics().blocks_anticipated, 0);
  }
}

#[test]
fn test_same_timestamp_gives_no_velocity() {
  let mut volume = volume(test_config());
  volume
    .integrate_frame(&frame_input(1.0, pose_at(Vec3::ZERO)), &plane_depth(1.0))
    .unwrap();
  volume
    .integrate_frame(&frame_input(1.0, pose_at(Vec3::new(0.05, 0.0, 0.0))), &plane_depth(1.0))
    .unwrap();
  assert_eq!(volume.metrics().blocks_anticipated, 0);
}

#[test]
fn test_eviction_removes_only_stale_blocks() {
  let mut volume = volume(test_config());
  volume
    .integrate_frame(&frame_input(0.0, pose_at(Vec3::ZERO)), &plane_depth(1.0))
    .unwrap();
  let old = volume.table().len();
  volume
    .integrate_frame(&frame_input(10.0, pose_at(Vec3::ZERO)), &plane_depth(1.3))
    .unwrap();
  let total = volume.table().len();
  assert!(total > old);

  // stale_age 30: only the blocks last seen at t = 0 are old enough.
  assert_eq!(volume.evict_stale(31.0, false), old);
  assert_eq!(volume.table().len(), total - old);
  volume.table().for_each_block(|_, _, block| assert_eq!(block.last_observed, 10.0));
  assert_eq!(volume.metrics().blocks_evicted, old as u64);
  assert_bijection(volume.table());
}

#[test]
fn test_force_age_applies_only_when_forced() {
  let mut volume = volume(test_config());
  volume
    .integrate_frame(&frame_input(0.0, pose_at(Vec3::ZERO)), &plane_depth(1.0))
    .unwrap();
  let allocated = volume.table().len();

  assert_eq!(volume.evict_stale(6.0, false), 0);
  assert_eq!(volume.evict_stale(6.0, true), allocated);
  assert!(volume.table().is_empty());
  assert_eq!(volume.table().pool().allocated_count(), 0);
}

#[test]
fn test_pool_exhaustion_and_memory_pressure() {
  let mut config = test_config();
  config.storage.pool_capacity = 32;
  config.integration.max_active_blocks_per_frame = 20;
  config.lifecycle.memory_pressure_occupancy = 0.9;
  let mut volume = volume(config);

  volume
    .integrate_frame(&frame_input(0.0, pose_at(Vec3::ZERO)), &plane_depth(1.0))
    .unwrap();
  assert_eq!(volume.table().len(), 20);

  // Twenty new blocks wanted, twelve free, nothing old enough to force out.
  let stats = volume
    .integrate_frame(&frame_input(1.0, pose_at(Vec3::ZERO)), &plane_depth(1.3))
    .unwrap();
  assert_eq!(stats.blocks_submitted, 12);
  assert_eq!(volume.table().len(), 32);
  assert_eq!(volume.metrics().allocation_failures, 1);
  assert_bijection(volume.table());

  // Full pool and nothing evictable: refused.
  assert_eq!(
    volume.integrate_frame(&frame_input(2.0, pose_at(Vec3::ZERO)), &plane_depth(1.3)),
    Err(SkipReason::MemoryPressure)
  );
  assert_eq!(volume.table().len(), 32);

  // Later, the force age frees everything and the frame goes through.
  volume
    .integrate_frame(&frame_input(20.0, pose_at(Vec3::ZERO)), &plane_depth(1.3))
    .unwrap();
  assert_eq!(volume.metrics().blocks_evicted, 32);
  assert_eq!(volume.table().len(), 20);
  assert_bijection(volume.table());
}

#[test]
fn test_keyframes_follow_motion() {
  let mut volume = volume(test_config());
  let depth = plane_depth(1.0);
  volume.integrate_frame(&frame_input(0.0, pose_at(Vec3::ZERO)), &depth).unwrap();
  volume.integrate_frame(&frame_input(DT, pose_at(Vec3::ZERO)), &depth).unwrap();
  volume
    .integrate_frame(&frame_input(2.0 * DT, pose_at(Vec3::new(0.15, 0.0, 0.0))), &depth)
    .unwrap();

  let flags: Vec<bool> = volume.audit().iter().map(|r| r.keyframe).collect();
  assert_eq!(flags, vec![true, false, true]);
  assert_eq!(volume.audit().last_keyframe().map(|r| r.frame_index), Some(2));
}

#[test]
fn test_audit_ring_is_bounded() {
  let mut config = test_config();
  config.lifecycle.audit_capacity = 4;
  let mut volume = volume(config);
  let depth = plane_depth(1.0);
  for i in 0..6 {
    volume
      .integrate_frame(&frame_input(i as f64 * DT, pose_at(Vec3::ZERO)), &depth)
      .unwrap();
  }
  assert_eq!(volume.audit().len(), 4);
  let indices: Vec<u64> = volume.audit().iter().map(|r| r.frame_index).collect();
  assert_eq!(indices, vec![2, 3, 4, 5]);
  // The only keyframe (frame 0) has rotated out.
  assert_eq!(volume.audit().keyframes().count(), 0);
}

#[test]
fn test_extraction_drains_dirty_blocks() {
  let mut volume = volume(test_config());
  volume
    .integrate_frame(&frame_input(0.0, pose_at(Vec3::ZERO)), &plane_depth(1.0))
    .unwrap();

  let budget = volume.config().extraction.max_triangles_per_cycle;
  let mut triangles = 0;
  for _ in 0..500 {
    let (mesh, stats) = volume.extract(budget);
    assert!(mesh.indices.iter().all(|&i| (i as usize) < mesh.vertices.len()));
    triangles += stats.triangles;
    if stats.pending == 0 {
      break;
    }
  }
  assert!(triangles > 0);

  let mut dirty = 0;
  volume.table().for_each_block(|_, _, block| dirty += block.is_dirty() as usize);
  assert_eq!(dirty, 0);

  let (_, stats) = volume.extract(budget);
  assert_eq!(stats.blocks_meshed, 0);
  assert_eq!(volume.metrics().triangles_emitted, triangles as u64);
}

#[test]
fn test_maybe_extract_honours_interval() {
  let mut volume = volume(test_config());
  assert!(volume.maybe_extract(0.0).is_some());
  assert!(volume.maybe_extract(0.05).is_none());
  assert!(volume.maybe_extract(0.2).is_some());

  // Running hot stretches the 0.1 s interval to 0.3 s.
  let warm = frame_input(0.2, pose_at(Vec3::ZERO)).with_thermal(ThermalState::Serious);
  volume.integrate_frame(&warm, &plane_depth(1.0)).unwrap();
  assert!(volume.maybe_extract(0.4).is_none());
  assert!(volume.maybe_extract(0.6).is_some());
}

#[test]
fn test_accelerator_volume_defers_then_flushes() {
  let mut volume = TsdfVolume::new(test_config(), BackendKind::Accelerator).unwrap();
  assert_eq!(volume.backend_kind(), BackendKind::Accelerator);
  let depth = plane_depth(1.0);
  for i in 0..3 {
    let stats = volume
      .integrate_frame(&frame_input(i as f64 * DT, pose_at(Vec3::ZERO)), &depth)
      .unwrap();
    assert!(stats.deferred);
    assert!(volume.in_flight() <= volume.config().integration.max_in_flight);
  }
  assert!(volume
    .audit()
    .iter()
    .all(|r| r.outcome == RecordOutcome::Deferred));

  let budget = volume.config().extraction.max_triangles_per_cycle;
  let mut triangles = 0;
  for _ in 0..500 {
    let (_, stats) = volume.extract(budget);
    assert_eq!(volume.in_flight(), 0);
    triangles += stats.triangles;
    if stats.pending == 0 {
      break;
    }
  }
  assert!(triangles > 0);
  assert_eq!(volume.metrics().frames_integrated, 3);
  assert_bijection(volume.table());
}
