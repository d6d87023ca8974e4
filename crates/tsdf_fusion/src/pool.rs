//! VoxelBlockPool - fixed-capacity arena of voxel blocks with a free list of
//! slot indices.
//!
//! ```text
//!   storage:   [ B0 ][ B1 ][ B2 ][ B3 ] ... [ Bn-1 ]   one allocation, never moves
//!                 ▲           ▲
//!   free list:  [ ... , 2, 0 ]   (pop from the back, push on deallocate)
//!   allocated:  [ 0, 1, 0, 1, ... ]
//! ```
//!
//! Capacity is fixed at construction. The backing array is allocated once, so
//! [`VoxelBlockPool::base_ptr`] and [`VoxelBlockPool::byte_len`] stay valid
//! for the pool's lifetime and an external consumer may alias them.

use crate::error::FusionError;
use crate::types::{SlotId, VoxelBlock};

pub struct VoxelBlockPool {
  blocks: Box<[VoxelBlock]>,
  free: Vec<u32>,
  allocated: Vec<bool>,
  /// Serial of the most recent allocation.
  serial: u64,
}

impl VoxelBlockPool {
  pub fn new(capacity: usize) -> Self {
    let capacity = capacity.min(u32::MAX as usize);
    Self {
      blocks: vec![VoxelBlock::EMPTY; capacity].into_boxed_slice(),
      // Reversed so slot 0 is handed out first.
      free: (0..capacity as u32).rev().collect(),
      allocated: vec![false; capacity],
      serial: 0,
    }
  }

  #[inline]
  pub fn capacity(&self) -> usize {
    self.blocks.len()
  }

  #[inline]
  pub fn allocated_count(&self) -> usize {
    self.blocks.len() - self.free.len()
  }

  #[inline]
  pub fn free_count(&self) -> usize {
    self.free.len()
  }

  /// Allocated fraction in [0, 1].
  pub fn occupancy(&self) -> f32 {
    if self.blocks.is_empty() {
      return 1.0;
    }
    self.allocated_count() as f32 / self.blocks.len() as f32
  }

  /// Pop a free slot, reset it to the empty sentinel and stamp it with a
  /// fresh allocation serial. Returns `None` when every slot is in use.
  pub fn allocate(&mut self, voxel_size: f32) -> Option<SlotId> {
    let index = self.free.pop()?;
    let slot = SlotId(index);
    self.serial += 1;
    let block = &mut self.blocks[slot.index()];
    block.reset(voxel_size);
    block.allocation = self.serial;
    self.allocated[slot.index()] = true;
    Some(slot)
  }

  /// Reset the slot's contents and return it to the free list.
  pub fn deallocate(&mut self, slot: SlotId) -> Result<(), FusionError> {
    if !self.is_allocated(slot) {
      return Err(FusionError::SlotNotAllocated(slot));
    }
    self.blocks[slot.index()] = VoxelBlock::EMPTY;
    self.allocated[slot.index()] = false;
    self.free.push(slot.0);
    Ok(())
  }

  #[inline]
  pub fn is_allocated(&self, slot: SlotId) -> bool {
    self.allocated.get(slot.index()).copied().unwrap_or(false)
  }

  /// Allocated block at `slot`.
  #[inline]
  pub fn get(&self, slot: SlotId) -> Option<&VoxelBlock> {
    if self.is_allocated(slot) {
      self.blocks.get(slot.index())
    } else {
      None
    }
  }

  #[inline]
  pub fn get_mut(&mut self, slot: SlotId) -> Option<&mut VoxelBlock> {
    if self.is_allocated(slot) {
      self.blocks.get_mut(slot.index())
    } else {
      None
    }
  }

  /// Start of the backing array. Stable for the pool's lifetime.
  pub fn base_ptr(&self) -> *const u8 {
    self.blocks.as_ptr().cast()
  }

  /// Size of the whole backing array in bytes.
  pub fn byte_len(&self) -> usize {
    std::mem::size_of_val::<[VoxelBlock]>(&self.blocks)
  }

  /// Backing array as bytes (free slots read as the empty sentinel).
  pub fn as_bytes(&self) -> &[u8] {
    bytemuck::cast_slice(&self.blocks)
  }
}

impl std::fmt::Debug for VoxelBlockPool {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("VoxelBlockPool")
      .field("capacity", &self.capacity())
      .field("allocated", &self.allocated_count())
      .finish()
  }
}

#[cfg(test)]
#[path = "pool_test.rs"]
mod pool_test;
