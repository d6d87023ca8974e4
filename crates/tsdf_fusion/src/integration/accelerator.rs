//! Accelerator backend - asynchronous producer with bounded in-flight
//! submissions.
//!
//! ```text
//!   process_frame(N)                       device worker
//!   ────────────────                       ─────────────
//!   gate ─► commit finished ─► full? ──┐
//!                                      │ yes: block on oldest completion
//!                                      ▼
//!   upload depth + block list ───────────► observe_block × blocks
//!   return (deferred)                           │
//!                                               ▼
//!   next call / flush ◄──────── bounded completion channel
//!   commit in submission order
//! ```
//!
//! The upload copies the depth image into an owned staging buffer, so the
//! caller may reuse its provider as soon as `process_frame` returns. Results
//! are committed strictly in submission order, one write per block. A
//! submission whose device time exceeded the frame timeout is discarded
//! whole.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use rayon::prelude::*;
// WASM compat: use web_time::Instant, NOT std::time::Instant
use web_time::Instant;

use super::depth::DepthImage;
use super::fusion::{commit_frame, observe_block, resolve_targets, BlockObservations, FrameProjection};
use super::gate::FrameGate;
use super::{
  BackendKind, FrameOutcome, FrameRequest, IntegrationBackend, IntegrationStats, SkipReason, SubmissionReport,
  VolumeAccessor,
};
use crate::config::{DerivedLimits, FusionConfig};

/// Finished device work for one submission.
struct DeviceCompletion {
  id: u64,
  timestamp: f64,
  device_time: Duration,
  valid_depth_samples: usize,
  blocks: Vec<BlockObservations>,
}

pub struct AcceleratorBackend {
  config: Arc<FusionConfig>,
  gate: FrameGate,
  timeout: Duration,
  max_in_flight: usize,
  sender: Sender<DeviceCompletion>,
  receiver: Receiver<DeviceCompletion>,
  /// Submission ids not yet committed, oldest first.
  pending: VecDeque<u64>,
  /// Completions that arrived ahead of an older submission.
  parked: BTreeMap<u64, DeviceCompletion>,
  next_id: u64,
  reports: Vec<SubmissionReport>,
  peak_in_flight: usize,
}

impl AcceleratorBackend {
  pub fn new(config: Arc<FusionConfig>, limits: &DerivedLimits) -> Self {
    let max_in_flight = config.integration.max_in_flight.max(1);
    let (sender, receiver) = crossbeam_channel::bounded(max_in_flight);
    Self {
      gate: FrameGate::new(Arc::clone(&config)),
      config,
      timeout: limits.frame_timeout,
      max_in_flight,
      sender,
      receiver,
      pending: VecDeque::with_capacity(max_in_flight),
      parked: BTreeMap::new(),
      next_id: 0,
      reports: Vec::new(),
      peak_in_flight: 0,
    }
  }

  #[inline]
  pub fn max_in_flight(&self) -> usize {
    self.max_in_flight
  }

  /// Highest number of simultaneously outstanding submissions seen.
  #[inline]
  pub fn peak_in_flight(&self) -> usize {
    self.peak_in_flight
  }

  /// Commit every completion that is ready, without blocking.
  fn collect_ready(&mut self, volume: &mut dyn VolumeAccessor) {
    while let Ok(completion) = self.receiver.try_recv() {
      self.parked.insert(completion.id, completion);
    }
    self.commit_in_order(volume);
  }

  /// Block until the oldest submission has completed, then commit it (and
  /// anything queued behind it that is also done).
  fn wait_for_oldest(&mut self, volume: &mut dyn VolumeAccessor) {
    let Some(&oldest) = self.pending.front() else {
      return;
    };
    while !self.parked.contains_key(&oldest) {
      match self.receiver.recv() {
        Ok(completion) => {
          self.parked.insert(completion.id, completion);
        }
        Err(_) => {
          // Unreachable while we hold a sender; give up on the stragglers.
          tracing::error!(pending = self.pending.len(), "device completion channel closed");
          self.pending.clear();
          return;
        }
      }
    }
    self.commit_in_order(volume);
  }

  fn commit_in_order(&mut self, volume: &mut dyn VolumeAccessor) {
    while let Some(&next) = self.pending.front() {
      let Some(completion) = self.parked.remove(&next) else {
        break;
      };
      self.pending.pop_front();
      let report = self.commit(completion, volume);
      self.reports.push(report);
    }
  }

  fn commit(&self, completion: DeviceCompletion, volume: &mut dyn VolumeAccessor) -> SubmissionReport {
    if completion.device_time > self.timeout {
      tracing::warn!(
        timestamp = completion.timestamp,
        device_ms = completion.device_time.as_secs_f64() * 1000.0,
        "late device submission discarded"
      );
      return SubmissionReport {
        timestamp: completion.timestamp,
        outcome: Err(SkipReason::FrameTimeout),
      };
    }

    let commit = commit_frame(
      &completion.blocks,
      completion.timestamp,
      volume,
      &self.config.weighting,
    );
    SubmissionReport {
      timestamp: completion.timestamp,
      outcome: Ok(IntegrationStats {
        blocks_submitted: completion.blocks.len(),
        blocks_updated: commit.blocks_updated,
        voxels_fused: commit.voxels_fused,
        voxels_carved: commit.voxels_carved,
        valid_depth_samples: completion.valid_depth_samples,
        blocks_dropped: commit.blocks_dropped,
        elapsed_us: completion.device_time.as_micros() as u64,
        deferred: false,
      }),
    }
  }
}

impl IntegrationBackend for AcceleratorBackend {
  fn kind(&self) -> BackendKind {
    BackendKind::Accelerator
  }

  /// Submissions already in flight still commit; only the pose history goes.
  fn reset(&mut self) {
    self.gate.reset();
  }

  #[cfg_attr(feature = "profiling", tracing::instrument(skip_all, name = "integrate::accelerator"))]
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

    self.collect_ready(volume);
    // Backpressure: never more than `max_in_flight` outstanding.
    while self.pending.len() >= self.max_in_flight {
      self.wait_for_oldest(volume);
    }

    let staging = DepthImage::capture(request.depth);
    let targets = resolve_targets(request.active_blocks, volume);
    let blocks_submitted = targets.len();

    let id = self.next_id;
    self.next_id += 1;
    self.pending.push_back(id);
    self.peak_in_flight = self.peak_in_flight.max(self.pending.len());

    let sender = self.sender.clone();
    let config = Arc::clone(&self.config);
    let timestamp = request.input.timestamp;
    let valid_depth_samples = census.valid;
    rayon::spawn(move || {
      let device_start = Instant::now();
      let blocks: Vec<BlockObservations> = targets
        .par_iter()
        .map(|target| observe_block(target, &frame, &staging, &config))
        .collect();
      // Capacity equals the in-flight bound, so this never blocks.
      let _ = sender.send(DeviceCompletion {
        id,
        timestamp,
        device_time: device_start.elapsed(),
        valid_depth_samples,
        blocks,
      });
    });

    Ok(IntegrationStats {
      blocks_submitted,
      valid_depth_samples,
      elapsed_us: started.elapsed().as_micros() as u64,
      deferred: true,
      ..IntegrationStats::default()
    })
  }

  fn flush(&mut self, volume: &mut dyn VolumeAccessor) {
    while !self.pending.is_empty() {
      self.wait_for_oldest(volume);
    }
  }

  fn drain_reports(&mut self) -> Vec<SubmissionReport> {
    std::mem::take(&mut self.reports)
  }

  fn in_flight(&self) -> usize {
    self.pending.len()
  }
}
