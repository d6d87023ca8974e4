//! Counters and timing histories for a volume.
//!
//! Counters are plain integers and always maintained. Timing histories are
//! compiled in with the `metrics` feature and can be switched off at runtime
//! through [`COLLECT_METRICS`].
//!
//! ```ignore
//! use std::sync::atomic::Ordering;
//! use tsdf_fusion::metrics::COLLECT_METRICS;
//!
//! COLLECT_METRICS.store(false, Ordering::Relaxed);
//! let metrics = volume.metrics();
//! println!("{} frames, {:.0} us avg", metrics.frames_integrated, metrics.avg_integration_us());
//! ```

#[cfg(feature = "metrics")]
use std::sync::atomic::Ordering;
use std::sync::atomic::AtomicBool;

use crate::integration::SkipReason;

/// Runtime switch for timing histories. Has no effect without the `metrics`
/// feature.
pub static COLLECT_METRICS: AtomicBool = AtomicBool::new(true);

#[inline]
pub fn timings_enabled() -> bool {
  #[cfg(feature = "metrics")]
  {
    COLLECT_METRICS.load(Ordering::Relaxed)
  }
  #[cfg(not(feature = "metrics"))]
  {
    false
  }
}

/// Samples kept per timing history, about four seconds at 30 fps.
pub const TIMING_HISTORY_LEN: usize = 128;

/// Fixed-size ring of recent durations in microseconds with a running total.
#[derive(Debug, Clone)]
pub struct TimingHistory {
  samples: Box<[u64; TIMING_HISTORY_LEN]>,
  /// Next write position.
  head: usize,
  filled: usize,
  total: u64,
  peak: u64,
}

impl Default for TimingHistory {
  fn default() -> Self {
    Self {
      samples: Box::new([0; TIMING_HISTORY_LEN]),
      head: 0,
      filled: 0,
      total: 0,
      peak: 0,
    }
  }
}

impl TimingHistory {
  pub fn record(&mut self, micros: u64) {
    if self.filled == TIMING_HISTORY_LEN {
      self.total -= self.samples[self.head];
    } else {
      self.filled += 1;
    }
    self.samples[self.head] = micros;
    self.total += micros;
    self.peak = self.peak.max(micros);
    self.head = (self.head + 1) % TIMING_HISTORY_LEN;
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.filled
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.filled == 0
  }

  /// Mean over the retained samples, 0 when empty.
  pub fn mean(&self) -> f64 {
    if self.filled == 0 {
      0.0
    } else {
      self.total as f64 / self.filled as f64
    }
  }

  /// Largest duration seen since creation, including evicted samples.
  #[inline]
  pub fn peak(&self) -> u64 {
    self.peak
  }

  pub fn latest(&self) -> Option<u64> {
    if self.filled == 0 {
      return None;
    }
    let index = (self.head + TIMING_HISTORY_LEN - 1) % TIMING_HISTORY_LEN;
    Some(self.samples[index])
  }
}

/// Volume-level statistics.
#[derive(Debug, Clone, Default)]
pub struct VolumeMetrics {
  // Frames
  /// Frames handed to `integrate_frame`.
  pub frames_received: u64,
  /// Frames fused (for deferred backends: submitted).
  pub frames_integrated: u64,
  /// Skipped frames per reason, indexed by `SkipReason::priority()`.
  pub skips: [u64; 7],

  // Storage
  pub blocks_allocated: u64,
  /// Blocks allocated ahead of the camera.
  pub blocks_anticipated: u64,
  pub blocks_evicted: u64,
  /// Insertions that failed even after forced eviction.
  pub allocation_failures: u64,
  /// Table growths seen so far.
  pub rehashes: u32,
  pub pool_occupancy: f32,

  // Extraction
  pub extraction_cycles: u64,
  pub triangles_emitted: u64,

  // Timing
  pub integration_timings: TimingHistory,
  pub extraction_timings: TimingHistory,
}

impl VolumeMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn record_skip(&mut self, reason: SkipReason) {
    self.skips[reason.priority()] += 1;
  }

  pub fn skip_count(&self, reason: SkipReason) -> u64 {
    self.skips[reason.priority()]
  }

  pub fn total_skips(&self) -> u64 {
    self.skips.iter().sum()
  }

  pub fn record_integration_timing(&mut self, micros: u64) {
    if timings_enabled() {
      self.integration_timings.record(micros);
    }
  }

  /// Record one extraction cycle.
  pub fn record_extraction(&mut self, triangles: usize, micros: u64) {
    self.extraction_cycles += 1;
    self.triangles_emitted += triangles as u64;
    if timings_enabled() {
      self.extraction_timings.record(micros);
    }
  }

  pub fn avg_integration_us(&self) -> f64 {
    self.integration_timings.mean()
  }

  pub fn avg_extraction_us(&self) -> f64 {
    self.extraction_timings.mean()
  }
}
