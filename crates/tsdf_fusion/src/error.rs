//! Structural failures of the fusion core.
//!
//! Per-frame outcomes are not errors: see
//! [`SkipReason`](crate::integration::SkipReason).

use thiserror::Error;

use crate::config::ConfigError;
use crate::types::{BlockIndex, SlotId};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FusionError {
  /// Every pool slot is in use. Evict stale blocks and retry.
  #[error("voxel block pool exhausted (capacity {capacity})")]
  PoolExhausted { capacity: usize },

  /// A probe chain ran past its bound even after the table grew.
  #[error("probe chain for block {key} exceeded {limit} buckets")]
  ProbeLimitExceeded { key: BlockIndex, limit: usize },

  #[error("non-finite world coordinate")]
  NonFiniteCoordinate,

  #[error("invalid voxel size {0}")]
  InvalidVoxelSize(f32),

  #[error("{0} is not allocated")]
  SlotNotAllocated(SlotId),

  #[error("invalid configuration: {0}")]
  InvalidConfig(#[from] ConfigError),
}
