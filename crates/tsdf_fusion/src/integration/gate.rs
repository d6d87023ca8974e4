//! Frame admission gate shared by both backends.
//!
//! Checks run in [`SkipReason`] priority order and the first failure wins,
//! so the reasons are mutually exclusive. The gate remembers the previous
//! tracked pose and translation step; that history advances for every frame
//! with tracking, whether or not it is admitted.

use std::sync::Arc;

use glam::{Quat, Vec3};

use super::{FrameRequest, SkipReason};
use crate::config::FusionConfig;
use crate::types::TrackingQuality;

#[derive(Clone, Copy, Debug)]
struct PoseSample {
  translation: Vec3,
  rotation: Quat,
}

/// Result of an admitted frame's depth census.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DepthCensus {
  pub sampled: usize,
  pub valid: usize,
}

pub struct FrameGate {
  config: Arc<FusionConfig>,
  previous: Option<PoseSample>,
  previous_step: Option<Vec3>,
}

impl FrameGate {
  pub fn new(config: Arc<FusionConfig>) -> Self {
    Self {
      config,
      previous: None,
      previous_step: None,
    }
  }

  /// Forget pose history (e.g. after relocalization).
  pub fn reset(&mut self) {
    self.previous = None;
    self.previous_step = None;
  }

  pub fn admit(&mut self, request: &FrameRequest<'_>) -> Result<DepthCensus, SkipReason> {
    let input = request.input;
    let tracking_lost = match input.tracking {
      TrackingQuality::NotAvailable => return Err(SkipReason::TrackingLost),
      TrackingQuality::Limited => self.config.gate.skip_limited_tracking,
      TrackingQuality::Normal => false,
    };

    // A limited pose still counts as tracked history.
    let pose = self.check_pose(request);
    if tracking_lost {
      return Err(SkipReason::TrackingLost);
    }
    pose?;

    let gate = &self.config.gate;

    if input.thermal >= gate.thermal_skip_level {
      return Err(SkipReason::ThermalThrottle);
    }

    if !input.capture_latency.is_finite() || input.capture_latency > gate.frame_timeout {
      return Err(SkipReason::FrameTimeout);
    }

    let census = self.depth_census(request);
    let fraction = if census.sampled == 0 {
      0.0
    } else {
      census.valid as f32 / census.sampled as f32
    };
    if fraction < gate.min_valid_depth_fraction {
      return Err(SkipReason::InsufficientDepth);
    }

    if request.conditions.memory_pressure {
      return Err(SkipReason::MemoryPressure);
    }

    Ok(census)
  }

  fn check_pose(&mut self, request: &FrameRequest<'_>) -> Result<(), SkipReason> {
    let gate = &self.config.gate;
    let pose = request.input.camera_to_world;
    if !pose.is_finite() {
      return Err(SkipReason::PoseTeleport);
    }
    let (_, rotation, translation) = pose.to_scale_rotation_translation();
    if !rotation.is_finite() || !translation.is_finite() {
      return Err(SkipReason::PoseTeleport);
    }

    let current = PoseSample {
      translation,
      rotation,
    };
    let Some(previous) = self.previous.replace(current) else {
      return Ok(());
    };

    let step = translation - previous.translation;
    let distance = step.length();
    let angle = previous.rotation.angle_between(rotation);
    let previous_step = self.previous_step.replace(step);

    if distance > gate.max_translation_per_frame || angle > gate.max_rotation_per_frame {
      // The jump becomes the new baseline; no oscillation spans it.
      self.previous_step = None;
      return Err(SkipReason::PoseTeleport);
    }

    let in_band = |d: f32| d >= gate.jitter_min_translation && d <= gate.jitter_max_translation;
    if let Some(previous_step) = previous_step {
      let reversing = step.dot(previous_step) < 0.0;
      if reversing
        && in_band(distance)
        && in_band(previous_step.length())
        && angle < gate.jitter_max_rotation
      {
        return Err(SkipReason::PoseJitter);
      }
    }

    Ok(())
  }

  fn depth_census(&self, request: &FrameRequest<'_>) -> DepthCensus {
    let depth = request.depth;
    let input = request.input;
    if depth.width() == 0
      || depth.height() == 0
      || depth.width() != input.depth_width as usize
      || depth.height() != input.depth_height as usize
    {
      return DepthCensus::default();
    }

    let stride = self.config.gate.depth_sample_stride.max(1);
    let resolution = &self.config.resolution;
    let min_confidence = self.config.weighting.min_confidence;
    let mut census = DepthCensus::default();
    for y in (0..depth.height()).step_by(stride) {
      for x in (0..depth.width()).step_by(stride) {
        census.sampled += 1;
        if depth
          .valid_depth_at(x, y, resolution.min_depth, resolution.max_depth)
          .is_some()
          && depth.confidence_at(x, y) >= min_confidence
        {
          census.valid += 1;
        }
      }
    }
    census
  }
}

#[cfg(test)]
#[path = "gate_test.rs"]
mod gate_test;
