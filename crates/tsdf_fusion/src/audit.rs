//! Bounded record of recent integration decisions.
//!
//! One [`IntegrationRecord`] per frame handed to the volume, admitted or
//! not, so a session can be replayed or inspected after the fact. Only the
//! most recent `capacity` records are kept.

use std::collections::VecDeque;

use glam::Mat4;

use crate::integration::SkipReason;
use crate::types::{BlockIndex, Intrinsics};

/// What happened to a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum RecordOutcome {
  Integrated,
  /// Submitted to an asynchronous backend; voxels land on a later call.
  Deferred,
  Skipped(SkipReason),
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct IntegrationRecord {
  /// Sequence number of the frame within the volume's lifetime.
  pub frame_index: u64,
  pub timestamp: f64,
  pub camera_to_world: Mat4,
  pub intrinsics: Intrinsics,
  /// Blocks the frame was dispatched to, sorted. Empty when skipped.
  pub blocks: Vec<BlockIndex>,
  pub keyframe: bool,
  pub outcome: RecordOutcome,
}

impl IntegrationRecord {
  #[inline]
  pub fn was_integrated(&self) -> bool {
    !matches!(self.outcome, RecordOutcome::Skipped(_))
  }
}

#[derive(Debug, Clone)]
pub struct AuditLog {
  records: VecDeque<IntegrationRecord>,
  capacity: usize,
}

impl AuditLog {
  pub fn new(capacity: usize) -> Self {
    Self {
      records: VecDeque::with_capacity(capacity),
      capacity,
    }
  }

  /// Append a record, dropping the oldest once full.
  pub fn push(&mut self, record: IntegrationRecord) {
    if self.capacity == 0 {
      return;
    }
    if self.records.len() == self.capacity {
      self.records.pop_front();
    }
    self.records.push_back(record);
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.records.len()
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  #[inline]
  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Oldest to newest.
  pub fn iter(&self) -> impl DoubleEndedIterator<Item = &IntegrationRecord> + ExactSizeIterator {
    self.records.iter()
  }

  pub fn last(&self) -> Option<&IntegrationRecord> {
    self.records.back()
  }

  pub fn keyframes(&self) -> impl Iterator<Item = &IntegrationRecord> {
    self.records.iter().filter(|r| r.keyframe)
  }

  /// Most recent keyframe still in the log.
  pub fn last_keyframe(&self) -> Option<&IntegrationRecord> {
    self.records.iter().rev().find(|r| r.keyframe)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record(frame_index: u64, keyframe: bool, outcome: RecordOutcome) -> IntegrationRecord {
    IntegrationRecord {
      frame_index,
      timestamp: frame_index as f64 / 30.0,
      camera_to_world: Mat4::IDENTITY,
      intrinsics: Intrinsics::new(500.0, 500.0, 320.0, 240.0, 640, 480),
      blocks: Vec::new(),
      keyframe,
      outcome,
    }
  }

  #[test]
  fn test_ring_keeps_most_recent() {
    let mut log = AuditLog::new(4);
    for i in 0..10 {
      log.push(record(i, i % 3 == 0, RecordOutcome::Integrated));
    }
    assert_eq!(log.len(), 4);
    let indices: Vec<_> = log.iter().map(|r| r.frame_index).collect();
    assert_eq!(indices, vec![6, 7, 8, 9]);
    assert_eq!(log.last().map(|r| r.frame_index), Some(9));
    assert_eq!(log.keyframes().count(), 2);
    assert_eq!(log.last_keyframe().map(|r| r.frame_index), Some(9));
  }

  #[test]
  fn test_skipped_records_are_not_integrated() {
    let skipped = record(0, false, RecordOutcome::Skipped(SkipReason::PoseJitter));
    assert!(!skipped.was_integrated());
    assert!(record(1, false, RecordOutcome::Deferred).was_integrated());
  }
}
