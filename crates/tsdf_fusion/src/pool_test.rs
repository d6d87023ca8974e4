use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::*;
use crate::types::Voxel;

#[test]
fn test_allocate_until_exhausted() {
  let mut pool = VoxelBlockPool::new(4);
  let mut slots = HashSet::new();
  for _ in 0..4 {
    assert!(pool.free_count() > 0);
    slots.insert(pool.allocate(0.004).expect("free slot available"));
  }
  assert_eq!(slots.len(), 4, "slots must be distinct");
  assert_eq!(pool.allocated_count(), pool.capacity());
  assert_eq!(pool.allocate(0.004), None);
  assert_eq!(pool.occupancy(), 1.0);
}

#[test]
fn test_deallocate_then_allocate_reuses_slot() {
  let mut pool = VoxelBlockPool::new(3);
  let a = pool.allocate(0.004).unwrap();
  let b = pool.allocate(0.004).unwrap();
  let _c = pool.allocate(0.004).unwrap();

  pool.deallocate(b).unwrap();
  assert_eq!(pool.allocate(0.008), Some(b));
  pool.deallocate(a).unwrap();
  assert_eq!(pool.allocate(0.008), Some(a));
}

#[test]
fn test_reused_slot_gets_new_allocation_serial() {
  let mut pool = VoxelBlockPool::new(2);
  let slot = pool.allocate(0.004).unwrap();
  let first = pool.get(slot).unwrap().allocation;
  pool.deallocate(slot).unwrap();
  assert_eq!(pool.allocate(0.004), Some(slot));
  let second = pool.get(slot).unwrap().allocation;
  assert_ne!(first, second);
  assert!(second > first);
}

#[test]
fn test_allocate_resets_contents() {
  let mut pool = VoxelBlockPool::new(1);
  let slot = pool.allocate(0.004).unwrap();
  {
    let block = pool.get_mut(slot).unwrap();
    block.voxels[10] = Voxel {
      sdf: -100,
      weight: 40,
      confidence: 2,
    };
    block.mark_integrated();
  }
  pool.deallocate(slot).unwrap();

  let again = pool.allocate(0.016).unwrap();
  let block = pool.get(again).unwrap();
  assert_eq!(block.voxels[10], Voxel::EMPTY);
  assert_eq!(block.voxel_size, 0.016);
  assert!(!block.is_dirty());
}

#[test]
fn test_double_free_rejected() {
  let mut pool = VoxelBlockPool::new(2);
  let slot = pool.allocate(0.004).unwrap();
  pool.deallocate(slot).unwrap();
  assert_eq!(pool.deallocate(slot), Err(FusionError::SlotNotAllocated(slot)));
  assert_eq!(
    pool.deallocate(SlotId(99)),
    Err(FusionError::SlotNotAllocated(SlotId(99)))
  );
  assert_eq!(pool.free_count(), 2);
}

#[test]
fn test_free_slot_not_accessible() {
  let mut pool = VoxelBlockPool::new(2);
  assert!(pool.get(SlotId(0)).is_none());
  let slot = pool.allocate(0.004).unwrap();
  assert!(pool.get(slot).is_some());
  assert!(pool.get_mut(SlotId(1)).is_none());
}

#[test]
fn test_base_pointer_stable() {
  let mut pool = VoxelBlockPool::new(8);
  let base = pool.base_ptr();
  let len = pool.byte_len();
  assert_eq!(len, 8 * std::mem::size_of::<VoxelBlock>());
  assert_eq!(pool.as_bytes().len(), len);

  let slots: Vec<_> = (0..8).map(|_| pool.allocate(0.004).unwrap()).collect();
  for slot in &slots[..4] {
    pool.deallocate(*slot).unwrap();
  }
  assert_eq!(pool.base_ptr(), base);
  assert_eq!(pool.byte_len(), len);
}

#[test]
fn test_randomized_alloc_dealloc_stress() {
  let capacity = 16;
  let mut pool = VoxelBlockPool::new(capacity);
  let mut live: Vec<SlotId> = Vec::new();
  let mut rng = StdRng::seed_from_u64(0x5EED);

  for cycle in 0..200 {
    if rng.random_bool(0.55) {
      match pool.allocate(0.004) {
        Some(slot) => {
          assert!(!live.contains(&slot), "cycle {cycle}: slot {slot} handed out twice");
          live.push(slot);
        }
        None => assert_eq!(live.len(), capacity, "cycle {cycle}: spurious exhaustion"),
      }
    } else if !live.is_empty() {
      let victim = live.swap_remove(rng.random_range(0..live.len()));
      pool.deallocate(victim).unwrap();
    }

    assert_eq!(pool.allocated_count(), live.len(), "cycle {cycle}");
    for slot in &live {
      assert!(pool.is_allocated(*slot));
    }
  }
}
