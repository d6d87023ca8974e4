//! TsdfVolume - drives frame ingestion, block lifecycle and extraction.
//!
//! ```text
//!   integrate_frame(input, depth)
//!     │
//!     ├─ evict        interval sweep, or force age under memory pressure
//!     ├─ allocate     surface band of the depth image → insert_or_get
//!     │               (pool exhausted: force-evict, retry once, stop)
//!     ├─ anticipate   blocks around position + velocity × look-ahead
//!     ├─ dispatch     backend.process_frame(active blocks)
//!     ├─ release      a skipped frame gives back what it allocated
//!     └─ audit        one IntegrationRecord per frame
//!
//!   maybe_extract(now) ── interval elapsed? ──► extract(max_triangles)
//! ```
//!
//! Structural mutation of the table only happens inside these calls, so a
//! frame is fully ingested before extraction sees its dirty blocks.

use std::collections::BTreeMap;
use std::sync::Arc;

use glam::{Mat4, Quat, Vec3};
// WASM compat: use web_time::Instant, NOT std::time::Instant
use web_time::Instant;

use crate::audit::{AuditLog, IntegrationRecord, RecordOutcome};
use crate::config::{DerivedLimits, FusionConfig, TIER_COUNT};
use crate::error::FusionError;
use crate::extraction::{ExtractionStats, MeshExtractor};
use crate::hash_table::{HashTableParams, SpatialHashTable};
use crate::integration::fusion::FrameProjection;
use crate::integration::{
  create_backend, BackendKind, DepthProvider, FrameConditions, FrameInput, FrameOutcome, FrameRequest,
  IntegrationBackend,
};
use crate::metrics::VolumeMetrics;
use crate::resolution::{block_extent, block_index, truncation_distance, voxel_size};
use crate::types::{BlockIndex, MeshOutput, SlotId, ThermalState, TrackingQuality};

/// Blocks whose voxels lie within the truncation band of the observed
/// surface, sampled on a pixel stride. Each block carries the voxel size of
/// the first sample that reached it.
///
/// When more than `limit` blocks are found, the ones nearest the camera are
/// kept. The result is sorted by block index.
pub fn surface_band_blocks(
  frame: &FrameProjection,
  depth: &dyn DepthProvider,
  config: &FusionConfig,
  limit: usize,
) -> Vec<(BlockIndex, f32)> {
  let res = &config.resolution;
  let stride = config.integration.allocation_pixel_stride.max(1);
  let mut found: BTreeMap<BlockIndex, f32> = BTreeMap::new();

  for y in (0..frame.height()).step_by(stride) {
    for x in (0..frame.width()).step_by(stride) {
      if depth.confidence_at(x, y) < config.weighting.min_confidence {
        continue;
      }
      let Some(d) = depth.valid_depth_at(x, y, res.min_depth, res.max_depth) else {
        continue;
      };
      let size = voxel_size(d, res);
      let trunc = truncation_distance(size, res);
      let step = block_extent(size) * 0.5;
      let near = (d - trunc).max(res.min_depth);
      let far = (d + trunc).min(res.max_depth);

      let mut z = near;
      loop {
        let point = frame.back_project(x as f32, y as f32, z);
        if let Ok(key) = block_index(point, size) {
          found.entry(key).or_insert(size);
        }
        if z >= far {
          break;
        }
        z = (z + step).min(far);
      }
    }
  }

  let mut blocks: Vec<(BlockIndex, f32)> = found.into_iter().collect();
  if blocks.len() > limit {
    let eye = frame.camera_origin();
    let distance = |&(key, size): &(BlockIndex, f32)| {
      let center = key.origin(size) + Vec3::splat(block_extent(size) * 0.5);
      center.distance_squared(eye)
    };
    blocks.sort_by(|a, b| distance(a).total_cmp(&distance(b)));
    blocks.truncate(limit);
    blocks.sort_unstable_by_key(|(key, _)| *key);
  }
  blocks
}

/// Look-ahead point for anticipatory allocation, or `None` when the camera
/// is too slow or the motion estimate is not finite.
pub fn anticipation_target(position: Vec3, velocity: Vec3, look_ahead: f32, min_speed: f32) -> Option<Vec3> {
  let speed = velocity.length();
  if !speed.is_finite() || speed < min_speed.max(f32::EPSILON) {
    return None;
  }
  let target = position + velocity * (look_ahead / speed);
  target.is_finite().then_some(target)
}

#[derive(Clone, Copy, Debug)]
struct MotionSample {
  position: Vec3,
  timestamp: f64,
}

#[derive(Clone, Copy, Debug)]
struct KeyframePose {
  translation: Vec3,
  rotation: Quat,
}

impl KeyframePose {
  fn from_matrix(camera_to_world: &Mat4) -> Self {
    let (_, rotation, translation) = camera_to_world.to_scale_rotation_translation();
    Self { translation, rotation }
  }
}

/// Blocks allocated while preparing one frame.
#[derive(Default)]
struct Allocation {
  active: Vec<(BlockIndex, SlotId)>,
  fresh: Vec<BlockIndex>,
  anticipated: Vec<BlockIndex>,
}

pub struct TsdfVolume {
  config: Arc<FusionConfig>,
  limits: DerivedLimits,
  table: SpatialHashTable,
  backend: Box<dyn IntegrationBackend>,
  extractor: MeshExtractor,
  audit: AuditLog,
  metrics: VolumeMetrics,
  frames_since_eviction: u32,
  motion: Option<MotionSample>,
  last_keyframe: Option<KeyframePose>,
  last_extraction: Option<f64>,
  thermal: ThermalState,
}

impl TsdfVolume {
  pub fn new(config: FusionConfig, backend: BackendKind) -> Result<Self, FusionError> {
    let limits = config.validate()?;
    let config = Arc::new(config);
    let table = SpatialHashTable::new(HashTableParams {
      pool_capacity: config.storage.pool_capacity,
      initial_buckets: limits.initial_buckets,
      max_load_factor: config.storage.max_load_factor,
      max_probe_length: config.storage.max_probe_length,
    });
    tracing::info!(
      ?backend,
      pool_capacity = config.storage.pool_capacity,
      buckets = limits.initial_buckets,
      pool_bytes = table.pool().byte_len(),
      "tsdf volume created"
    );
    Ok(Self {
      backend: create_backend(backend, Arc::clone(&config), &limits),
      extractor: MeshExtractor::new(&config.extraction, limits.target_cycle),
      audit: AuditLog::new(config.lifecycle.audit_capacity),
      metrics: VolumeMetrics::new(),
      table,
      limits,
      config,
      frames_since_eviction: 0,
      motion: None,
      last_keyframe: None,
      last_extraction: None,
      thermal: ThermalState::Nominal,
    })
  }

  #[inline]
  pub fn table(&self) -> &SpatialHashTable {
    &self.table
  }

  #[inline]
  pub fn audit(&self) -> &AuditLog {
    &self.audit
  }

  #[inline]
  pub fn metrics(&self) -> &VolumeMetrics {
    &self.metrics
  }

  #[inline]
  pub fn config(&self) -> &FusionConfig {
    &self.config
  }

  #[inline]
  pub fn limits(&self) -> &DerivedLimits {
    &self.limits
  }

  #[inline]
  pub fn backend_kind(&self) -> BackendKind {
    self.backend.kind()
  }

  #[inline]
  pub fn extractor(&self) -> &MeshExtractor {
    &self.extractor
  }

  /// Submissions the backend has not committed yet.
  #[inline]
  pub fn in_flight(&self) -> usize {
    self.backend.in_flight()
  }

  /// Ingest one frame. Skips are expected outcomes and leave every voxel
  /// untouched.
  pub fn integrate_frame(&mut self, input: &FrameInput, depth: &dyn DepthProvider) -> FrameOutcome {
    let frame_index = self.metrics.frames_received;
    let _span = tracing::info_span!("integrate_frame", frame = frame_index).entered();
    let started = Instant::now();
    self.metrics.frames_received += 1;
    self.thermal = input.thermal;
    let now = input.timestamp;

    // Eviction first so this frame's allocations see the freed slots.
    let pressure = self.table.pool().occupancy() >= self.config.lifecycle.memory_pressure_occupancy;
    self.frames_since_eviction += 1;
    if pressure {
      self.evict_stale(now, true);
    } else if self.frames_since_eviction >= self.config.lifecycle.eviction_interval {
      self.evict_stale(now, false);
    }
    let conditions = FrameConditions {
      memory_pressure: self.table.pool().occupancy() > self.config.gate.memory_pressure_skip_occupancy,
    };

    let velocity = self.update_motion(input);
    let mut allocation = Allocation::default();
    if !conditions.memory_pressure && input.tracking != TrackingQuality::NotAvailable {
      self.allocate_frame_blocks(input, depth, &mut allocation);
      if let Some(velocity) = velocity {
        self.anticipate(input, velocity, &mut allocation);
      }
    }

    let request = FrameRequest {
      input,
      conditions,
      depth,
      active_blocks: &allocation.active,
    };
    let outcome = self.backend.process_frame(&request, &mut self.table);
    self.absorb_reports();

    match &outcome {
      Ok(stats) => {
        self.metrics.frames_integrated += 1;
        self.metrics.blocks_allocated += allocation.fresh.len() as u64;
        self.metrics.blocks_anticipated += allocation.anticipated.len() as u64;
        self.metrics.record_integration_timing(started.elapsed().as_micros() as u64);
        tracing::trace!(
          blocks = stats.blocks_submitted,
          fresh = allocation.fresh.len(),
          anticipated = allocation.anticipated.len(),
          deferred = stats.deferred,
          "frame dispatched"
        );
      }
      Err(reason) => {
        self.metrics.record_skip(*reason);
        for key in allocation.fresh.iter().chain(&allocation.anticipated) {
          self.table.remove(*key);
        }
        tracing::debug!(%reason, released = allocation.fresh.len() + allocation.anticipated.len(), "frame skipped");
      }
    }

    let keyframe = outcome.is_ok() && self.take_keyframe(&input.camera_to_world);
    self.audit.push(IntegrationRecord {
      frame_index,
      timestamp: input.timestamp,
      camera_to_world: input.camera_to_world,
      intrinsics: input.intrinsics,
      blocks: match &outcome {
        Ok(_) => allocation.active.iter().map(|(key, _)| *key).collect(),
        Err(_) => Vec::new(),
      },
      keyframe,
      outcome: match &outcome {
        Ok(stats) if stats.deferred => RecordOutcome::Deferred,
        Ok(_) => RecordOutcome::Integrated,
        Err(reason) => RecordOutcome::Skipped(*reason),
      },
    });

    self.metrics.rehashes = self.table.rehash_count();
    self.metrics.pool_occupancy = self.table.pool().occupancy();
    outcome
  }

  /// Commit outstanding submissions, then run one extraction cycle.
  pub fn extract(&mut self, max_triangles: usize) -> (MeshOutput, ExtractionStats) {
    let _span = tracing::info_span!("extract", quota = self.extractor.quota()).entered();
    self.backend.flush(&mut self.table);
    self.absorb_reports();
    let (mesh, stats) = self.extractor.extract_incremental(&mut self.table, max_triangles);
    self.metrics.record_extraction(stats.triangles, stats.elapsed_us);
    (mesh, stats)
  }

  /// Run an extraction cycle if the extraction interval has passed since
  /// the last one. The interval stretches while the device runs hot.
  pub fn maybe_extract(&mut self, now: f64) -> Option<(MeshOutput, ExtractionStats)> {
    let extraction = &self.config.extraction;
    let mut interval = extraction.extraction_interval as f64;
    if self.thermal >= ThermalState::Serious {
      interval *= extraction.thermal_interval_factor as f64;
    }
    if let Some(last) = self.last_extraction {
      if now - last < interval {
        return None;
      }
    }
    self.last_extraction = Some(now);
    let max_triangles = self.config.extraction.max_triangles_per_cycle;
    Some(self.extract(max_triangles))
  }

  /// Remove blocks not observed for longer than the stale age (the force
  /// age when `force` is set). Returns the number removed.
  pub fn evict_stale(&mut self, now: f64, force: bool) -> usize {
    self.frames_since_eviction = 0;
    let lifecycle = &self.config.lifecycle;
    let max_age = if force { lifecycle.force_age } else { lifecycle.stale_age };

    let mut stale = Vec::new();
    self.table.for_each_block(|key, _, block| {
      if now - block.last_observed > max_age {
        stale.push(key);
      }
    });
    let removed = stale
      .iter()
      .filter(|key| self.table.remove(**key).is_some())
      .count();

    self.metrics.blocks_evicted += removed as u64;
    if removed > 0 {
      tracing::info!(removed, force, remaining = self.table.len(), "evicted stale blocks");
    }
    removed
  }

  /// Forget pose history, e.g. after the tracker relocalizes.
  pub fn reset_tracking(&mut self) {
    self.motion = None;
    self.last_keyframe = None;
    self.backend.reset();
  }

  // ==========================================================================
  // Frame preparation
  // ==========================================================================

  /// Allocate one block, stamping it as observed now so fresh blocks are not
  /// evicted before their first frame lands.
  fn allocate(&mut self, key: BlockIndex, size: f32, now: f64) -> Result<SlotId, FusionError> {
    let slot = self.table.insert_or_get(key, size)?;
    let tier = self
      .config
      .resolution
      .tier_voxel_sizes
      .iter()
      .position(|s| *s == size)
      .unwrap_or(TIER_COUNT - 1);
    self.table.update_block(slot, |block| {
      block.resolution_tier = tier as u32;
      if now.is_finite() {
        block.last_observed = now;
      }
    });
    Ok(slot)
  }

  fn allocate_frame_blocks(&mut self, input: &FrameInput, depth: &dyn DepthProvider, allocation: &mut Allocation) {
    let Some(frame) = FrameProjection::new(input, depth.width(), depth.height(), &self.config.resolution) else {
      return;
    };
    let candidates = surface_band_blocks(&frame, depth, &self.config, self.limits.max_active_blocks);
    let now = input.timestamp;
    let mut retried = false;

    for (key, size) in candidates {
      if let Some(slot) = self.table.lookup(key) {
        allocation.active.push((key, slot));
        continue;
      }
      let slot = match self.allocate(key, size, now) {
        Ok(slot) => slot,
        Err(FusionError::PoolExhausted { capacity }) if !retried => {
          retried = true;
          tracing::warn!(capacity, "voxel pool exhausted, forcing eviction");
          self.evict_stale(now, true);
          // Eviction may have taken blocks this frame already looked up.
          let table = &self.table;
          allocation.active.retain(|(k, s)| table.lookup(*k) == Some(*s));
          allocation.fresh.retain(|k| table.contains(*k));
          match self.allocate(key, size, now) {
            Ok(slot) => slot,
            Err(err) => {
              self.metrics.allocation_failures += 1;
              tracing::warn!(%err, "allocation still failing after eviction");
              break;
            }
          }
        }
        Err(FusionError::PoolExhausted { .. }) => {
          self.metrics.allocation_failures += 1;
          break;
        }
        Err(err) => {
          tracing::debug!(%key, %err, "block not allocated");
          continue;
        }
      };
      allocation.active.push((key, slot));
      allocation.fresh.push(key);
    }
  }

  /// Velocity from the previous tracked pose, if there is one.
  fn update_motion(&mut self, input: &FrameInput) -> Option<Vec3> {
    if input.tracking == TrackingQuality::NotAvailable {
      return None;
    }
    let position = input.camera_to_world.w_axis.truncate();
    if !position.is_finite() || !input.timestamp.is_finite() {
      self.motion = None;
      return None;
    }
    let velocity = self.motion.and_then(|previous| {
      let dt = (input.timestamp - previous.timestamp) as f32;
      (dt > 0.0).then(|| (position - previous.position) / dt)
    });
    self.motion = Some(MotionSample {
      position,
      timestamp: input.timestamp,
    });
    velocity
  }

  fn anticipate(&mut self, input: &FrameInput, velocity: Vec3, allocation: &mut Allocation) {
    let lifecycle = &self.config.lifecycle;
    let position = input.camera_to_world.w_axis.truncate();
    if !velocity.is_finite() {
      tracing::warn!(?velocity, "non-finite camera velocity, anticipation skipped");
      return;
    }
    let Some(target) = anticipation_target(
      position,
      velocity,
      lifecycle.look_ahead_distance,
      lifecycle.min_anticipation_speed,
    ) else {
      return;
    };
    let size = voxel_size(lifecycle.look_ahead_distance, &self.config.resolution);
    let center = match block_index(target, size) {
      Ok(center) => center,
      Err(err) => {
        tracing::warn!(%err, "anticipation target rejected");
        return;
      }
    };

    let radius = lifecycle.anticipation_radius.max(0);
    let now = input.timestamp;
    for dz in -radius..=radius {
      for dy in -radius..=radius {
        for dx in -radius..=radius {
          let key = center.offset(dx, dy, dz);
          if self.table.contains(key) {
            continue;
          }
          match self.allocate(key, size, now) {
            Ok(_) => allocation.anticipated.push(key),
            Err(FusionError::PoolExhausted { .. }) => return,
            Err(_) => {}
          }
        }
      }
    }
  }

  /// True (and the keyframe baseline moves) when the pose moved far enough
  /// from the last keyframe, or there is none yet.
  fn take_keyframe(&mut self, camera_to_world: &Mat4) -> bool {
    let pose = KeyframePose::from_matrix(camera_to_world);
    let lifecycle = &self.config.lifecycle;
    let is_keyframe = match self.last_keyframe {
      None => true,
      Some(last) => {
        pose.translation.distance(last.translation) > lifecycle.keyframe_translation
          || pose.rotation.angle_between(last.rotation) > lifecycle.keyframe_rotation
      }
    };
    if is_keyframe {
      self.last_keyframe = Some(pose);
    }
    is_keyframe
  }

  /// Fold completed deferred submissions into the metrics.
  fn absorb_reports(&mut self) {
    for report in self.backend.drain_reports() {
      if let Err(reason) = report.outcome {
        // Counted as integrated at submission; the device result was dropped.
        self.metrics.frames_integrated = self.metrics.frames_integrated.saturating_sub(1);
        self.metrics.record_skip(reason);
      }
    }
  }
}

impl std::fmt::Debug for TsdfVolume {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TsdfVolume")
      .field("backend", &self.backend.kind())
      .field("blocks", &self.table.len())
      .field("in_flight", &self.backend.in_flight())
      .field("pending_extraction", &self.extractor.pending())
      .finish()
  }
}

#[cfg(test)]
#[path = "volume_test.rs"]
mod volume_test;
