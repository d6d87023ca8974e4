//! SpatialHashTable - open-addressing index from block coordinates to pool
//! slots.
//!
//! The table owns the [`VoxelBlockPool`]: inserting a new key allocates a
//! slot, removing a key frees it. Buckets only hold `(key, slot)` metadata.
//!
//! # Probing
//!
//! ```text
//!   ideal = hash(key) mod buckets
//!
//!   buckets: [ . ][ A ][ B ][ C ][ . ][ D ] ...
//!                   ▲ideal(A)=1
//!                   │    ideal(B)=1, probed one step
//!                   │         ideal(C)=2, probed one step
//!                   └── cluster ends at the first empty bucket
//! ```
//!
//! Every entry sits at most `max_probe_length - 1` steps past its ideal
//! bucket, so a lookup stops at the first empty bucket or after
//! `max_probe_length` steps.
//!
//! # Backward-shift deletion
//!
//! Removing B above leaves a hole at 2. Walking forward, C (ideal 2) may move
//! into the hole because the hole lies between its ideal bucket and its
//! current bucket; the hole advances to 3; the walk stops at the empty bucket
//! at 4. No tombstones are left behind, so probe chains stay intact.
//!
//! # Rehash
//!
//! Doubling the bucket array re-places the existing `(key, slot)` pairs only.
//! It never touches the pool. Growth happens when the load factor trips, or
//! when a probe chain overflows and a doubled array would give the new key a
//! bucket. Probe-driven growth stops at twice the bucket count the pool needs
//! at the max load factor.

use crate::error::FusionError;
use crate::pool::VoxelBlockPool;
use crate::types::{BlockIndex, SlotId, VoxelBlock};

/// Large odd per-axis multipliers for the spatial hash.
const HASH_PRIMES: [u32; 3] = [73_856_093, 19_349_663, 83_492_791];

/// Multiplicative spatial hash: each axis times its prime, XORed.
#[inline(always)]
pub fn spatial_hash(key: BlockIndex) -> u32 {
  (key.x as u32).wrapping_mul(HASH_PRIMES[0])
    ^ (key.y as u32).wrapping_mul(HASH_PRIMES[1])
    ^ (key.z as u32).wrapping_mul(HASH_PRIMES[2])
}

/// Index record stored in a bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HashEntry {
  pub key: BlockIndex,
  pub slot: SlotId,
}

/// Sizing parameters taken from the storage configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HashTableParams {
  pub pool_capacity: usize,
  pub initial_buckets: usize,
  pub max_load_factor: f32,
  pub max_probe_length: usize,
}

pub struct SpatialHashTable {
  buckets: Vec<Option<HashEntry>>,
  pool: VoxelBlockPool,
  len: usize,
  max_load_factor: f32,
  max_probe_length: usize,
  /// Ceiling for probe-driven growth.
  max_buckets: usize,
  rehash_count: u32,
}

impl SpatialHashTable {
  pub fn new(params: HashTableParams) -> Self {
    let buckets = params.initial_buckets.max(1);
    let needed = (params.pool_capacity as f32 / params.max_load_factor.max(f32::EPSILON)).ceil() as usize;
    let max_buckets = needed
      .max(buckets)
      .checked_next_power_of_two()
      .map_or(usize::MAX, |n| n.saturating_mul(2));
    Self {
      buckets: vec![None; buckets],
      pool: VoxelBlockPool::new(params.pool_capacity),
      len: 0,
      max_load_factor: params.max_load_factor,
      max_probe_length: params.max_probe_length.max(1),
      max_buckets,
      rehash_count: 0,
    }
  }

  /// Number of live keys (equals the pool's allocated count).
  #[inline]
  pub fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  #[inline]
  pub fn bucket_count(&self) -> usize {
    self.buckets.len()
  }

  #[inline]
  pub fn load_factor(&self) -> f32 {
    self.len as f32 / self.buckets.len() as f32
  }

  /// Number of rehashes performed since construction.
  #[inline]
  pub fn rehash_count(&self) -> u32 {
    self.rehash_count
  }

  #[inline]
  pub fn pool(&self) -> &VoxelBlockPool {
    &self.pool
  }

  /// Bucket a key would occupy with no collisions.
  #[inline]
  pub fn ideal_bucket(&self, key: BlockIndex) -> usize {
    ideal_bucket(key, self.buckets.len())
  }

  /// Slot of `key`, allocating a new block if the key is absent.
  pub fn insert_or_get(&mut self, key: BlockIndex, voxel_size: f32) -> Result<SlotId, FusionError> {
    if !voxel_size.is_finite() || voxel_size <= 0.0 {
      return Err(FusionError::InvalidVoxelSize(voxel_size));
    }
    if let Some(slot) = self.lookup(key) {
      return Ok(slot);
    }

    if self.pool.free_count() == 0 {
      return Err(FusionError::PoolExhausted {
        capacity: self.pool.capacity(),
      });
    }

    self.rehash_if_needed();
    let bucket = match self.free_bucket_for(key) {
      Some(bucket) => bucket,
      None => self.grow_for(key)?,
    };

    let slot = self
      .pool
      .allocate(voxel_size)
      .ok_or(FusionError::PoolExhausted {
        capacity: self.pool.capacity(),
      })?;
    self.buckets[bucket] = Some(HashEntry { key, slot });
    self.len += 1;
    Ok(slot)
  }

  /// Slot of `key`, if present. Read-only.
  pub fn lookup(&self, key: BlockIndex) -> Option<SlotId> {
    self.find_bucket(key).and_then(|b| self.buckets[b].map(|e| e.slot))
  }

  #[inline]
  pub fn contains(&self, key: BlockIndex) -> bool {
    self.find_bucket(key).is_some()
  }

  /// Remove `key`, free its pool slot, and close the hole by backward
  /// shifting the rest of its cluster. Returns the freed slot.
  pub fn remove(&mut self, key: BlockIndex) -> Option<SlotId> {
    let found = self.find_bucket(key)?;
    let entry = self.buckets[found].take()?;
    if let Err(err) = self.pool.deallocate(entry.slot) {
      // Index and pool disagree; keep the entry rather than lose the slot.
      tracing::error!(%key, %err, "hash entry referenced a free slot");
      self.buckets[found] = Some(entry);
      return None;
    }
    self.len -= 1;
    self.backward_shift(found);
    Some(entry.slot)
  }

  /// Double the bucket array when the load factor is at or above the
  /// threshold. Returns true if a rehash happened.
  pub fn rehash_if_needed(&mut self) -> bool {
    if self.load_factor() >= self.max_load_factor {
      self.rehash(self.buckets.len() * 2);
      true
    } else {
      false
    }
  }

  /// Visit every live block in bucket order.
  pub fn for_each_block(&self, mut visit: impl FnMut(BlockIndex, SlotId, &VoxelBlock)) {
    for entry in self.buckets.iter().flatten() {
      if let Some(block) = self.pool.get(entry.slot) {
        visit(entry.key, entry.slot, block);
      }
    }
  }

  /// Snapshot of every `(key, slot)` pair.
  pub fn all_blocks(&self) -> Vec<(BlockIndex, SlotId)> {
    self.buckets.iter().flatten().map(|e| (e.key, e.slot)).collect()
  }

  #[inline]
  pub fn block(&self, slot: SlotId) -> Option<&VoxelBlock> {
    self.pool.get(slot)
  }

  /// Block stored under `key`.
  pub fn block_at(&self, key: BlockIndex) -> Option<&VoxelBlock> {
    self.lookup(key).and_then(|slot| self.pool.get(slot))
  }

  /// In-place read-modify-write of an allocated block.
  pub fn update_block<R>(&mut self, slot: SlotId, mutator: impl FnOnce(&mut VoxelBlock) -> R) -> Option<R> {
    self.pool.get_mut(slot).map(mutator)
  }

  // ==========================================================================
  // Probing internals
  // ==========================================================================

  fn find_bucket(&self, key: BlockIndex) -> Option<usize> {
    let n = self.buckets.len();
    let start = ideal_bucket(key, n);
    for step in 0..self.max_probe_length.min(n) {
      let bucket = (start + step) % n;
      match self.buckets[bucket] {
        None => return None,
        Some(entry) if entry.key == key => return Some(bucket),
        Some(_) => {}
      }
    }
    None
  }

  fn free_bucket_for(&self, key: BlockIndex) -> Option<usize> {
    free_bucket(&self.buckets, key, self.max_probe_length)
  }

  fn backward_shift(&mut self, mut hole: usize) {
    let n = self.buckets.len();
    let mut next = (hole + 1) % n;
    for _ in 1..n {
      let Some(entry) = self.buckets[next] else {
        break;
      };
      let ideal = ideal_bucket(entry.key, n);
      // Movable iff the hole lies on the path from the entry's ideal bucket
      // to where it currently sits.
      if probe_distance(ideal, hole, n) < probe_distance(ideal, next, n) {
        self.buckets[hole] = Some(entry);
        self.buckets[next] = None;
        hole = next;
      }
      next = (next + 1) % n;
    }
  }

  /// A saturated cluster can overflow the probe bound before the load factor
  /// trips. Double the array once if that gives `key` a bucket; otherwise
  /// leave the table as it is.
  fn grow_for(&mut self, key: BlockIndex) -> Result<usize, FusionError> {
    let limit = self.max_probe_length;
    let size = self.buckets.len().saturating_mul(2);
    let grown = if size <= self.max_buckets {
      let entries: Vec<HashEntry> = self.buckets.iter().flatten().copied().collect();
      place_all(&entries, size, limit)
        .and_then(|fresh| free_bucket(&fresh, key, limit).map(|bucket| (fresh, bucket)))
    } else {
      None
    };

    match grown {
      Some((fresh, bucket)) => {
        self.install(fresh);
        Ok(bucket)
      }
      None => {
        tracing::error!(%key, limit, buckets = self.buckets.len(), "probe chain overflow, growth would not help");
        Err(FusionError::ProbeLimitExceeded { key, limit })
      }
    }
  }

  /// Re-place every entry into a larger bucket array. Metadata only.
  fn rehash(&mut self, target: usize) {
    let entries: Vec<HashEntry> = self.buckets.iter().flatten().copied().collect();
    let mut size = target.max(self.buckets.len() + 1);
    let buckets = loop {
      if let Some(fresh) = place_all(&entries, size, self.max_probe_length) {
        break fresh;
      }
      size *= 2;
    };
    self.install(buckets);
  }

  fn install(&mut self, buckets: Vec<Option<HashEntry>>) {
    let old = self.buckets.len();
    let allocated_before = self.pool.allocated_count();
    self.buckets = buckets;
    self.rehash_count += 1;
    debug_assert_eq!(self.pool.allocated_count(), allocated_before);
    tracing::info!(from = old, to = self.buckets.len(), entries = self.len, "rehashed block index");
  }
}

impl std::fmt::Debug for SpatialHashTable {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SpatialHashTable")
      .field("len", &self.len)
      .field("buckets", &self.buckets.len())
      .field("rehashes", &self.rehash_count)
      .field("pool", &self.pool)
      .finish()
  }
}

#[inline(always)]
fn ideal_bucket(key: BlockIndex, buckets: usize) -> usize {
  spatial_hash(key) as usize % buckets
}

/// Steps from `from` forward to `to`, wrapping.
#[inline(always)]
fn probe_distance(from: usize, to: usize, buckets: usize) -> usize {
  (to + buckets - from) % buckets
}

/// Place `entries` into a fresh array of `size` buckets, or `None` if one
/// of them would exceed the probe bound.
fn place_all(entries: &[HashEntry], size: usize, max_probe: usize) -> Option<Vec<Option<HashEntry>>> {
  let mut fresh = vec![None; size];
  for entry in entries {
    let bucket = free_bucket(&fresh, entry.key, max_probe)?;
    fresh[bucket] = Some(*entry);
  }
  Some(fresh)
}

fn free_bucket(buckets: &[Option<HashEntry>], key: BlockIndex, max_probe: usize) -> Option<usize> {
  let n = buckets.len();
  let start = ideal_bucket(key, n);
  (0..max_probe.min(n))
    .map(|step| (start + step) % n)
    .find(|&bucket| buckets[bucket].is_none())
}

#[cfg(test)]
#[path = "hash_table_test.rs"]
mod hash_table_test;
