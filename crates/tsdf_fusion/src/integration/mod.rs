//! Integration backends - fuse one depth frame into the active voxel blocks.
//!
//! Two interchangeable variants share the frame gate and the per-voxel
//! fusion math:
//!
//! ```text
//!              ┌──────────────┐
//!   frame ───► │  FrameGate   │── SkipReason (no writes)
//!              └──────┬───────┘
//!                     │ admitted
//!          ┌──────────┴───────────┐
//!          ▼                      ▼
//!   ┌─────────────┐      ┌──────────────────┐
//!   │ CpuBackend  │      │AcceleratorBackend│  bounded in-flight queue
//!   │ (rayon)     │      │ upload → kernel  │  (blocks when full)
//!   └──────┬──────┘      └────────┬─────────┘
//!          │ observe_block        │ observe_block (worker)
//!          ▼                      ▼
//!      commit_block: one write per block, all-or-nothing
//! ```
//!
//! The variant is chosen once per volume via [`BackendKind`].

pub mod accelerator;
pub mod cpu;
pub mod depth;
pub mod fusion;
pub mod gate;

use std::fmt;
use std::sync::Arc;

use glam::Mat4;

pub use accelerator::AcceleratorBackend;
pub use cpu::CpuBackend;
pub use depth::{DepthImage, DepthProvider};
pub use gate::FrameGate;

use crate::config::{DerivedLimits, FusionConfig};
use crate::hash_table::SpatialHashTable;
use crate::types::{BlockIndex, Intrinsics, SlotId, ThermalState, TrackingQuality, VoxelBlock};

/// Per-frame data supplied by the external tracker.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameInput {
  /// Capture time in seconds.
  pub timestamp: f64,
  pub intrinsics: Intrinsics,
  /// Column-major camera-to-world transform. Camera space is +X right,
  /// +Y down, +Z forward.
  pub camera_to_world: Mat4,
  pub depth_width: u32,
  pub depth_height: u32,
  pub tracking: TrackingQuality,
  pub thermal: ThermalState,
  /// Seconds between capture and hand-off to the volume.
  pub capture_latency: f32,
}

impl FrameInput {
  pub fn new(
    timestamp: f64,
    intrinsics: Intrinsics,
    camera_to_world: Mat4,
    depth_width: u32,
    depth_height: u32,
  ) -> Self {
    Self {
      timestamp,
      intrinsics,
      camera_to_world,
      depth_width,
      depth_height,
      tracking: TrackingQuality::Normal,
      thermal: ThermalState::Nominal,
      capture_latency: 0.0,
    }
  }

  pub fn with_tracking(mut self, tracking: TrackingQuality) -> Self {
    self.tracking = tracking;
    self
  }

  pub fn with_thermal(mut self, thermal: ThermalState) -> Self {
    self.thermal = thermal;
    self
  }

  pub fn with_capture_latency(mut self, seconds: f32) -> Self {
    self.capture_latency = seconds;
    self
  }
}

/// Volume-side conditions the orchestrator reports with each frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameConditions {
  /// Pool occupancy above the skip threshold even after eviction.
  pub memory_pressure: bool,
}

/// Everything a backend needs to process one frame.
#[derive(Clone, Copy)]
pub struct FrameRequest<'a> {
  pub input: &'a FrameInput,
  pub conditions: FrameConditions,
  pub depth: &'a dyn DepthProvider,
  /// The only slots the backend may write.
  pub active_blocks: &'a [(BlockIndex, SlotId)],
}

/// Why a frame was not integrated. Variants are listed in check priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SkipReason {
  TrackingLost,
  PoseTeleport,
  PoseJitter,
  ThermalThrottle,
  FrameTimeout,
  InsufficientDepth,
  MemoryPressure,
}

impl SkipReason {
  pub const ALL: [Self; 7] = [
    Self::TrackingLost,
    Self::PoseTeleport,
    Self::PoseJitter,
    Self::ThermalThrottle,
    Self::FrameTimeout,
    Self::InsufficientDepth,
    Self::MemoryPressure,
  ];

  /// Position in the check order (0 = checked first).
  #[inline]
  pub const fn priority(self) -> usize {
    self as usize
  }
}

impl fmt::Display for SkipReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let text = match self {
      Self::TrackingLost => "tracking lost",
      Self::PoseTeleport => "pose teleport",
      Self::PoseJitter => "pose jitter",
      Self::ThermalThrottle => "thermal throttle",
      Self::FrameTimeout => "frame timeout",
      Self::InsufficientDepth => "too few valid depth pixels",
      Self::MemoryPressure => "memory pressure",
    };
    f.write_str(text)
  }
}

/// Counters for one integrated frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IntegrationStats {
  pub blocks_submitted: usize,
  /// Blocks whose voxels changed (integration generation bumped).
  pub blocks_updated: usize,
  pub voxels_fused: usize,
  pub voxels_carved: usize,
  /// Valid samples found by the gate's depth census.
  pub valid_depth_samples: usize,
  /// Results dropped because their block left the volume meanwhile.
  pub blocks_dropped: usize,
  pub elapsed_us: u64,
  /// Submitted to an asynchronous backend; voxel counts arrive later in a
  /// [`SubmissionReport`].
  pub deferred: bool,
}

pub type FrameOutcome = Result<IntegrationStats, SkipReason>;

/// Completion of a deferred submission.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SubmissionReport {
  pub timestamp: f64,
  pub outcome: FrameOutcome,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BackendKind {
  #[default]
  Cpu,
  Accelerator,
}

/// Block storage as seen by a backend.
pub trait VolumeAccessor {
  fn lookup(&self, key: BlockIndex) -> Option<SlotId>;
  fn block(&self, slot: SlotId) -> Option<&VoxelBlock>;
  /// Run `writer` on the block in `slot`. Returns false if the slot is free.
  fn write_block(&mut self, slot: SlotId, writer: &mut dyn FnMut(&mut VoxelBlock)) -> bool;
}

impl VolumeAccessor for SpatialHashTable {
  #[inline]
  fn lookup(&self, key: BlockIndex) -> Option<SlotId> {
    SpatialHashTable::lookup(self, key)
  }

  #[inline]
  fn block(&self, slot: SlotId) -> Option<&VoxelBlock> {
    SpatialHashTable::block(self, slot)
  }

  fn write_block(&mut self, slot: SlotId, writer: &mut dyn FnMut(&mut VoxelBlock)) -> bool {
    self.update_block(slot, |block| writer(block)).is_some()
  }
}

/// Capability-polymorphic frame processor.
pub trait IntegrationBackend: Send {
  fn kind(&self) -> BackendKind;

  /// Gate the frame, then fuse it into `request.active_blocks`.
  fn process_frame(&mut self, request: &FrameRequest<'_>, volume: &mut dyn VolumeAccessor) -> FrameOutcome;

  /// Forget the gate's pose history.
  fn reset(&mut self);

  /// Wait for and commit every outstanding submission.
  fn flush(&mut self, _volume: &mut dyn VolumeAccessor) {}

  /// Reports of deferred submissions completed since the last call.
  fn drain_reports(&mut self) -> Vec<SubmissionReport> {
    Vec::new()
  }

  /// Submissions not yet committed.
  fn in_flight(&self) -> usize {
    0
  }
}

/// Build the backend variant for a volume.
pub fn create_backend(
  kind: BackendKind,
  config: Arc<FusionConfig>,
  limits: &DerivedLimits,
) -> Box<dyn IntegrationBackend> {
  match kind {
    BackendKind::Cpu => Box::new(CpuBackend::new(config, limits)),
    BackendKind::Accelerator => Box::new(AcceleratorBackend::new(config, limits)),
  }
}
