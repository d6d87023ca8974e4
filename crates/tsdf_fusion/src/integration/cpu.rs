//! CPU reference backend.
//!
//! Observes all active blocks in parallel on the rayon pool, then commits
//! them on the calling thread. If the observation pass overruns the frame
//! timeout, nothing is committed.

use std::sync::Arc;
use std::time::Duration;

use rayon::prelude::*;
// WASM compat: use web_time::Instant, NOT std::time::Instant
use web_time::Instant;

use super::fusion::{commit_frame, observe_block, resolve_targets, BlockObservations, FrameProjection};
use super::gate::FrameGate;
use super::{BackendKind, FrameOutcome, FrameRequest, IntegrationBackend, IntegrationStats, SkipReason, VolumeAccessor};
use crate::config::{DerivedLimits, FusionConfig};

pub struct CpuBackend {
  config: Arc<FusionConfig>,
  gate: FrameGate,
  timeout: Duration,
}

impl CpuBackend {
  pub fn new(config: Arc<FusionConfig>, limits: &DerivedLimits) -> Self {
    Self {
      gate: FrameGate::new(Arc::clone(&config)),
      config,
      timeout: limits.frame_timeout,
    }
  }
}

impl IntegrationBackend for CpuBackend {
  fn kind(&self) -> BackendKind {
    BackendKind::Cpu
  }

  fn reset(&mut self) {
    self.gate.reset();
  }

  #[cfg_attr(feature = "profiling", tracing::instrument(skip_all, name = "integrate::cpu"))]
  fn process_frame(&mut self, request: &FrameRequest<'_>, volume: &mut dyn VolumeAccessor) -> FrameOutcome {
    let started = Instant::now();
    let census = self.gate.admit(request)?;
    let frame = FrameProjection::new(
      request.input,
      request.depth.width(),
      request.depth.height(),
      &self.config.resolution,
    )
    .ok_or(SkipReason::PoseTeleport)?;

    let targets = resolve_targets(request.active_blocks, volume);
    let config = &self.config;
    let depth = request.depth;
    let observed: Vec<BlockObservations> = targets
      .par_iter()
      .map(|target| observe_block(target, &frame, depth, config))
      .collect();

    if started.elapsed() > self.timeout {
      tracing::debug!(blocks = targets.len(), "frame overran its timeout, discarded");
      return Err(SkipReason::FrameTimeout);
    }

    let commit = commit_frame(&observed, request.input.timestamp, volume, &self.config.weighting);
    Ok(IntegrationStats {
      blocks_submitted: targets.len(),
      blocks_updated: commit.blocks_updated,
      voxels_fused: commit.voxels_fused,
      voxels_carved: commit.voxels_carved,
      valid_depth_samples: census.valid,
      blocks_dropped: commit.blocks_dropped,
      elapsed_us: started.elapsed().as_micros() as u64,
      deferred: false,
    })
  }
}
