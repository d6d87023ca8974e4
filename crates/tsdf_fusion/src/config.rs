//! FusionConfig - every tunable threshold of the fusion core in one immutable
//! value.
//!
//! Build it once (from `Default`, or deserialized with the `serde` feature),
//! call [`FusionConfig::validate`] to obtain the [`DerivedLimits`], and pass
//! both explicitly to the components that need them.

use std::time::Duration;

use thiserror::Error;

use crate::constants::MAX_TRIANGLES_PER_BLOCK;
use crate::types::ThermalState;

/// Smallest bucket array the hash table will use.
pub const MIN_BUCKETS: usize = 8;

/// Number of resolution tiers.
pub const TIER_COUNT: usize = 3;

/// Number of depth confidence levels reported by the sensor (0 = low).
pub const CONFIDENCE_LEVELS: usize = 3;

/// Resolution tiers and truncation band.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(default))]
pub struct ResolutionConfig {
  /// Voxel edge length per tier, finest first (metres).
  pub tier_voxel_sizes: [f32; TIER_COUNT],
  /// Depths at which tier 1 and tier 2 begin (metres).
  pub tier_depth_thresholds: [f32; TIER_COUNT - 1],
  /// Truncation distance = max(multiplier × voxel_size, floor).
  pub truncation_multiplier: f32,
  pub truncation_floor: f32,
  /// Valid depth range for integration. `max_depth` is the far-depth
  /// threshold for block allocation.
  pub min_depth: f32,
  pub max_depth: f32,
}

impl Default for ResolutionConfig {
  fn default() -> Self {
    Self {
      tier_voxel_sizes: [0.004, 0.008, 0.016],
      tier_depth_thresholds: [1.0, 2.5],
      truncation_multiplier: 4.0,
      truncation_floor: 0.02,
      min_depth: 0.1,
      max_depth: 5.0,
    }
  }
}

/// Per-observation weighting and blending.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(default))]
pub struct WeightingConfig {
  /// Depth up to which observations get full distance weight.
  pub distance_reference_depth: f32,
  pub distance_weight_floor: f32,
  /// Weight per sensor confidence level (low, medium, high).
  pub confidence_weights: [f32; CONFIDENCE_LEVELS],
  pub confidence_weight_floor: f32,
  /// Pixels below this confidence level are ignored.
  pub min_confidence: u8,
  pub angle_weight_floor: f32,
  /// Weight units added by one full-quality observation.
  pub observation_weight_scale: f32,
  /// Saturation point of the accumulated weight (≤ 255).
  pub weight_max: u32,
  /// Fraction of an observation's weight removed from a carved voxel.
  pub carve_rate: f32,
}

impl Default for WeightingConfig {
  fn default() -> Self {
    Self {
      distance_reference_depth: 1.0,
      distance_weight_floor: 0.1,
      confidence_weights: [0.25, 0.6, 1.0],
      confidence_weight_floor: 0.1,
      min_confidence: 1,
      angle_weight_floor: 0.2,
      observation_weight_scale: 8.0,
      weight_max: 128,
      carve_rate: 0.5,
    }
  }
}

/// Pool and hash table sizing.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(default))]
pub struct StorageConfig {
  /// Fixed number of voxel blocks.
  pub pool_capacity: usize,
  /// Bucket count at construction. Raised to hold the whole pool under
  /// `max_load_factor`, then rounded up to a power of two.
  pub initial_buckets: usize,
  /// Rehash when occupied / buckets reaches this ratio.
  pub max_load_factor: f32,
  pub max_probe_length: usize,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      pool_capacity: 8192,
      initial_buckets: 4096,
      max_load_factor: 0.75,
      max_probe_length: 64,
    }
  }
}

/// Frame admission thresholds, checked in skip-reason priority order.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(default))]
pub struct GateConfig {
  /// Treat `TrackingQuality::Limited` as lost.
  pub skip_limited_tracking: bool,
  /// Pose teleport bounds per frame.
  pub max_translation_per_frame: f32,
  pub max_rotation_per_frame: f32,
  /// Jitter band: translation deltas in [min, max] that reverse direction
  /// with rotation below `jitter_max_rotation`.
  pub jitter_min_translation: f32,
  pub jitter_max_translation: f32,
  pub jitter_max_rotation: f32,
  pub thermal_skip_level: ThermalState,
  /// Seconds. Applies to capture latency and to backend processing time.
  pub frame_timeout: f32,
  pub min_valid_depth_fraction: f32,
  /// Pixel stride of the valid-depth census.
  pub depth_sample_stride: usize,
  /// Pool occupancy above which frames are refused.
  pub memory_pressure_skip_occupancy: f32,
}

impl Default for GateConfig {
  fn default() -> Self {
    Self {
      skip_limited_tracking: false,
      max_translation_per_frame: 0.25,
      max_rotation_per_frame: 0.5,
      jitter_min_translation: 0.0005,
      jitter_max_translation: 0.003,
      jitter_max_rotation: 0.005,
      thermal_skip_level: ThermalState::Critical,
      frame_timeout: 0.1,
      min_valid_depth_fraction: 0.1,
      depth_sample_stride: 4,
      memory_pressure_skip_occupancy: 0.98,
    }
  }
}

/// Backend dispatch.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(default))]
pub struct IntegrationConfig {
  /// Accelerator submissions allowed in flight before blocking.
  pub max_in_flight: usize,
  /// Pixel stride of the back-projection used to find active blocks.
  pub allocation_pixel_stride: usize,
  pub max_active_blocks_per_frame: usize,
}

impl Default for IntegrationConfig {
  fn default() -> Self {
    Self {
      max_in_flight: 2,
      allocation_pixel_stride: 4,
      max_active_blocks_per_frame: 4096,
    }
  }
}

/// Incremental extraction budget and mesh filtering.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(default))]
pub struct ExtractionConfig {
  /// Wall-time target of one extraction cycle (milliseconds).
  pub target_cycle_ms: f32,
  /// Blocks per cycle.
  pub initial_quota: usize,
  pub min_quota: usize,
  pub max_quota: usize,
  pub additive_step: usize,
  pub multiplicative_cut: f32,
  /// Consecutive under-budget cycles before the quota ramps.
  pub ramp_streak: u32,
  /// Cycles after a cut during which no further cut happens.
  pub forgiveness_cycles: u32,
  pub max_triangles_per_cycle: usize,
  /// Triangles with area below factor × voxel_size² are dropped.
  pub min_triangle_area_factor: f32,
  /// Triangles with longest_edge² / (2 × area) above this are dropped.
  pub max_aspect_ratio: f32,
  /// Average corner weight at which vertex alpha reaches 1.
  pub alpha_saturation_weight: f32,
  /// Seconds between extraction cycles.
  pub extraction_interval: f32,
  /// Interval multiplier at `ThermalState::Serious` and above.
  pub thermal_interval_factor: f32,
}

impl Default for ExtractionConfig {
  fn default() -> Self {
    Self {
      target_cycle_ms: 8.0,
      initial_quota: 64,
      min_quota: 4,
      max_quota: 1024,
      additive_step: 8,
      multiplicative_cut: 0.5,
      ramp_streak: 3,
      forgiveness_cycles: 4,
      max_triangles_per_cycle: 65536,
      min_triangle_area_factor: 1e-6,
      max_aspect_ratio: 50.0,
      alpha_saturation_weight: 32.0,
      extraction_interval: 0.1,
      thermal_interval_factor: 3.0,
    }
  }
}

/// Block lifecycle, anticipation and audit.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(default))]
pub struct LifecycleConfig {
  /// Seconds without observation before a block is evicted.
  pub stale_age: f64,
  /// Shorter age applied under memory pressure.
  pub force_age: f64,
  /// Pool occupancy that counts as memory pressure.
  pub memory_pressure_occupancy: f32,
  /// Frames between opportunistic eviction sweeps.
  pub eviction_interval: u32,
  pub look_ahead_distance: f32,
  /// Camera speed (m/s) below which no anticipation happens.
  pub min_anticipation_speed: f32,
  /// Block radius preallocated around the look-ahead point.
  pub anticipation_radius: i32,
  pub keyframe_translation: f32,
  pub keyframe_rotation: f32,
  /// Integration records kept in the audit ring.
  pub audit_capacity: usize,
}

impl Default for LifecycleConfig {
  fn default() -> Self {
    Self {
      stale_age: 30.0,
      force_age: 5.0,
      memory_pressure_occupancy: 0.85,
      eviction_interval: 30,
      look_ahead_distance: 0.5,
      min_anticipation_speed: 0.05,
      anticipation_radius: 1,
      keyframe_translation: 0.1,
      keyframe_rotation: 0.26,
      audit_capacity: 256,
    }
  }
}

/// Root configuration.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(default))]
pub struct FusionConfig {
  pub resolution: ResolutionConfig,
  pub weighting: WeightingConfig,
  pub storage: StorageConfig,
  pub gate: GateConfig,
  pub integration: IntegrationConfig,
  pub extraction: ExtractionConfig,
  pub lifecycle: LifecycleConfig,
}

/// Constants computed once from a validated [`FusionConfig`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DerivedLimits {
  /// min(configured max active blocks, pool capacity).
  pub max_active_blocks: usize,
  /// Initial bucket count: a power of two, never below [`MIN_BUCKETS`], and
  /// large enough that a full pool stays under the max load factor.
  pub initial_buckets: usize,
  /// Triangles a single block can emit.
  pub block_triangle_limit: usize,
  pub target_cycle: Duration,
  pub frame_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
  #[error("`{0}` must be finite")]
  NonFinite(&'static str),

  #[error("`{0}` must be positive")]
  NotPositive(&'static str),

  #[error("tier voxel sizes must be strictly increasing, got {0:?}")]
  TiersNotIncreasing([f32; TIER_COUNT]),

  #[error("tier depth thresholds must increase within ({min}, {max}), got {thresholds:?}")]
  ThresholdsInvalid {
    thresholds: [f32; TIER_COUNT - 1],
    min: f32,
    max: f32,
  },

  #[error("depth range [{min}, {max}] is empty")]
  DepthRangeInvalid { min: f32, max: f32 },

  #[error("truncation multiplier {0} must be at least 2")]
  TruncationTooNarrow(f32),

  #[error("`{name}` = {value} must lie in {range}")]
  OutOfRange {
    name: &'static str,
    value: f32,
    range: &'static str,
  },

  #[error("weight max {0} must be in 1..=255")]
  WeightMaxInvalid(u32),

  #[error("quota bounds must satisfy 0 < min <= initial <= max, got {min}/{initial}/{max}")]
  QuotaBoundsInvalid { min: usize, initial: usize, max: usize },

  #[error("force age {force} must not exceed stale age {stale}")]
  AgesInconsistent { stale: f64, force: f64 },

  #[error("triangle budget {budget} is smaller than one block ({per_block})")]
  TriangleBudgetTooSmall { budget: usize, per_block: usize },
}

fn check_unit(name: &'static str, value: f32) -> Result<(), ConfigError> {
  if !value.is_finite() {
    return Err(ConfigError::NonFinite(name));
  }
  if value <= 0.0 || value > 1.0 {
    return Err(ConfigError::OutOfRange {
      name,
      value,
      range: "(0, 1]",
    });
  }
  Ok(())
}

fn check_positive(name: &'static str, value: f32) -> Result<(), ConfigError> {
  if !value.is_finite() {
    return Err(ConfigError::NonFinite(name));
  }
  if value <= 0.0 {
    return Err(ConfigError::NotPositive(name));
  }
  Ok(())
}

fn check_nonzero(name: &'static str, value: usize) -> Result<(), ConfigError> {
  if value == 0 {
    return Err(ConfigError::NotPositive(name));
  }
  Ok(())
}

impl FusionConfig {
  /// Check internal consistency and compute the derived constants.
  pub fn validate(&self) -> Result<DerivedLimits, ConfigError> {
    self.validate_resolution()?;
    self.validate_weighting()?;
    self.validate_storage()?;
    self.validate_gate()?;
    self.validate_extraction()?;
    self.validate_lifecycle()?;
    check_nonzero("integration.max_in_flight", self.integration.max_in_flight)?;
    check_nonzero(
      "integration.allocation_pixel_stride",
      self.integration.allocation_pixel_stride,
    )?;
    check_nonzero(
      "integration.max_active_blocks_per_frame",
      self.integration.max_active_blocks_per_frame,
    )?;

    Ok(DerivedLimits {
      max_active_blocks: self
        .integration
        .max_active_blocks_per_frame
        .min(self.storage.pool_capacity),
      initial_buckets: self.initial_buckets(),
      block_triangle_limit: MAX_TRIANGLES_PER_BLOCK,
      target_cycle: Duration::from_secs_f32(self.extraction.target_cycle_ms / 1000.0),
      frame_timeout: Duration::from_secs_f32(self.gate.frame_timeout),
    })
  }

  fn initial_buckets(&self) -> usize {
    let s = &self.storage;
    // Validated: load factor in (0, 1).
    let full_pool = (s.pool_capacity as f64 / s.max_load_factor as f64).ceil() as usize;
    s.initial_buckets.max(full_pool).max(MIN_BUCKETS).next_power_of_two()
  }

  fn validate_resolution(&self) -> Result<(), ConfigError> {
    let r = &self.resolution;
    for size in r.tier_voxel_sizes {
      check_positive("resolution.tier_voxel_sizes", size)?;
    }
    if r.tier_voxel_sizes.windows(2).any(|w| w[0] >= w[1]) {
      return Err(ConfigError::TiersNotIncreasing(r.tier_voxel_sizes));
    }
    check_positive("resolution.min_depth", r.min_depth)?;
    check_positive("resolution.max_depth", r.max_depth)?;
    if r.min_depth >= r.max_depth {
      return Err(ConfigError::DepthRangeInvalid {
        min: r.min_depth,
        max: r.max_depth,
      });
    }
    let [near, far] = r.tier_depth_thresholds;
    if !(near.is_finite() && far.is_finite() && r.min_depth < near && near < far && far < r.max_depth)
    {
      return Err(ConfigError::ThresholdsInvalid {
        thresholds: r.tier_depth_thresholds,
        min: r.min_depth,
        max: r.max_depth,
      });
    }
    check_positive("resolution.truncation_floor", r.truncation_floor)?;
    if !r.truncation_multiplier.is_finite() {
      return Err(ConfigError::NonFinite("resolution.truncation_multiplier"));
    }
    if r.truncation_multiplier < 2.0 {
      return Err(ConfigError::TruncationTooNarrow(r.truncation_multiplier));
    }
    Ok(())
  }

  fn validate_weighting(&self) -> Result<(), ConfigError> {
    let w = &self.weighting;
    check_positive("weighting.distance_reference_depth", w.distance_reference_depth)?;
    check_unit("weighting.distance_weight_floor", w.distance_weight_floor)?;
    check_unit("weighting.confidence_weight_floor", w.confidence_weight_floor)?;
    check_unit("weighting.angle_weight_floor", w.angle_weight_floor)?;
    for weight in w.confidence_weights {
      check_unit("weighting.confidence_weights", weight)?;
    }
    check_positive("weighting.observation_weight_scale", w.observation_weight_scale)?;
    check_unit("weighting.carve_rate", w.carve_rate)?;
    if w.weight_max == 0 || w.weight_max > u8::MAX as u32 {
      return Err(ConfigError::WeightMaxInvalid(w.weight_max));
    }
    if w.observation_weight_scale > w.weight_max as f32 {
      return Err(ConfigError::OutOfRange {
        name: "weighting.observation_weight_scale",
        value: w.observation_weight_scale,
        range: "(0, weight_max]",
      });
    }
    Ok(())
  }

  fn validate_storage(&self) -> Result<(), ConfigError> {
    let s = &self.storage;
    check_nonzero("storage.pool_capacity", s.pool_capacity)?;
    check_nonzero("storage.initial_buckets", s.initial_buckets)?;
    check_nonzero("storage.max_probe_length", s.max_probe_length)?;
    if !s.max_load_factor.is_finite() || s.max_load_factor <= 0.0 || s.max_load_factor >= 1.0 {
      return Err(ConfigError::OutOfRange {
        name: "storage.max_load_factor",
        value: s.max_load_factor,
        range: "(0, 1)",
      });
    }
    Ok(())
  }

  fn validate_gate(&self) -> Result<(), ConfigError> {
    let g = &self.gate;
    check_positive("gate.max_translation_per_frame", g.max_translation_per_frame)?;
    check_positive("gate.max_rotation_per_frame", g.max_rotation_per_frame)?;
    check_positive("gate.jitter_max_translation", g.jitter_max_translation)?;
    if !g.jitter_min_translation.is_finite() || g.jitter_min_translation < 0.0 {
      return Err(ConfigError::NonFinite("gate.jitter_min_translation"));
    }
    if g.jitter_min_translation >= g.jitter_max_translation
      || g.jitter_max_translation >= g.max_translation_per_frame
    {
      return Err(ConfigError::OutOfRange {
        name: "gate.jitter_max_translation",
        value: g.jitter_max_translation,
        range: "(jitter_min_translation, max_translation_per_frame)",
      });
    }
    check_positive("gate.jitter_max_rotation", g.jitter_max_rotation)?;
    check_positive("gate.frame_timeout", g.frame_timeout)?;
    check_unit("gate.min_valid_depth_fraction", g.min_valid_depth_fraction)?;
    check_unit(
      "gate.memory_pressure_skip_occupancy",
      g.memory_pressure_skip_occupancy,
    )?;
    check_nonzero("gate.depth_sample_stride", g.depth_sample_stride)?;
    Ok(())
  }

  fn validate_extraction(&self) -> Result<(), ConfigError> {
    let e = &self.extraction;
    check_positive("extraction.target_cycle_ms", e.target_cycle_ms)?;
    if e.min_quota == 0 || e.min_quota > e.initial_quota || e.initial_quota > e.max_quota {
      return Err(ConfigError::QuotaBoundsInvalid {
        min: e.min_quota,
        initial: e.initial_quota,
        max: e.max_quota,
      });
    }
    check_nonzero("extraction.additive_step", e.additive_step)?;
    if !e.multiplicative_cut.is_finite() || e.multiplicative_cut <= 0.0 || e.multiplicative_cut >= 1.0
    {
      return Err(ConfigError::OutOfRange {
        name: "extraction.multiplicative_cut",
        value: e.multiplicative_cut,
        range: "(0, 1)",
      });
    }
    if e.max_triangles_per_cycle < MAX_TRIANGLES_PER_BLOCK {
      return Err(ConfigError::TriangleBudgetTooSmall {
        budget: e.max_triangles_per_cycle,
        per_block: MAX_TRIANGLES_PER_BLOCK,
      });
    }
    check_positive("extraction.min_triangle_area_factor", e.min_triangle_area_factor)?;
    check_positive("extraction.max_aspect_ratio", e.max_aspect_ratio)?;
    check_positive("extraction.alpha_saturation_weight", e.alpha_saturation_weight)?;
    check_positive("extraction.extraction_interval", e.extraction_interval)?;
    if !e.thermal_interval_factor.is_finite() || e.thermal_interval_factor < 1.0 {
      return Err(ConfigError::OutOfRange {
        name: "extraction.thermal_interval_factor",
        value: e.thermal_interval_factor,
        range: "[1, inf)",
      });
    }
    Ok(())
  }

  fn validate_lifecycle(&self) -> Result<(), ConfigError> {
    let l = &self.lifecycle;
    if !(l.stale_age.is_finite() && l.force_age.is_finite()) {
      return Err(ConfigError::NonFinite("lifecycle.stale_age"));
    }
    if l.force_age <= 0.0 || l.force_age > l.stale_age {
      return Err(ConfigError::AgesInconsistent {
        stale: l.stale_age,
        force: l.force_age,
      });
    }
    check_unit("lifecycle.memory_pressure_occupancy", l.memory_pressure_occupancy)?;
    if l.memory_pressure_occupancy > self.gate.memory_pressure_skip_occupancy {
      return Err(ConfigError::OutOfRange {
        name: "lifecycle.memory_pressure_occupancy",
        value: l.memory_pressure_occupancy,
        range: "(0, gate.memory_pressure_skip_occupancy]",
      });
    }
    check_positive("lifecycle.look_ahead_distance", l.look_ahead_distance)?;
    check_positive("lifecycle.min_anticipation_speed", l.min_anticipation_speed)?;
    if l.anticipation_radius < 0 {
      return Err(ConfigError::OutOfRange {
        name: "lifecycle.anticipation_radius",
        value: l.anticipation_radius as f32,
        range: "[0, inf)",
      });
    }
    check_positive("lifecycle.keyframe_translation", l.keyframe_translation)?;
    check_positive("lifecycle.keyframe_rotation", l.keyframe_rotation)?;
    if l.eviction_interval == 0 {
      return Err(ConfigError::NotPositive("lifecycle.eviction_interval"));
    }
    check_nonzero("lifecycle.audit_capacity", l.audit_capacity)?;
    Ok(())
  }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
