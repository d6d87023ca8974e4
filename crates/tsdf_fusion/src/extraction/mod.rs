//! Incremental mesh extraction.
//!
//! Each cycle meshes a bounded number of dirty blocks and reports per-block
//! replacements:
//!
//! ```text
//!   table scan ──► dirty blocks (+ lower neighbours) ──► persistent queue
//!                                                            │
//!                         quota (AIMD) + triangle budget ◄───┤
//!                                                            ▼
//!                            mesh_block (27-block neighbourhood)
//!                                                            │
//!            mark clean with the generation read before meshing
//! ```
//!
//! Blocks left over when the quota or triangle budget runs out stay queued
//! for the next cycle. A block's mesh generation is set to the integration
//! generation observed *before* it was meshed, so anything integrated in
//! between keeps it dirty.

pub mod cadence;
pub mod mesher;
pub mod tables;

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use smallvec::SmallVec;
// WASM compat: use web_time::Instant, NOT std::time::Instant
use web_time::Instant;

pub use cadence::{AimdController, QuotaChange};
pub use mesher::{mesh_block, BlockNeighborhood, MeshedBlock};

use crate::config::ExtractionConfig;
use crate::hash_table::SpatialHashTable;
use crate::types::{BlockIndex, MeshOutput, MinMaxAABB};

/// Offsets of the blocks whose +X/+Y/+Z boundary cells read this block.
const LOWER_NEIGHBORS: [[i32; 3]; 7] = [
  [-1, 0, 0],
  [0, -1, 0],
  [0, 0, -1],
  [-1, -1, 0],
  [-1, 0, -1],
  [0, -1, -1],
  [-1, -1, -1],
];

/// Counters for one extraction cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtractionStats {
  pub blocks_meshed: usize,
  pub triangles: usize,
  pub rejected_triangles: usize,
  /// Blocks still queued after the cycle.
  pub pending: usize,
  pub retired: usize,
  /// Stopped early because the next block would exceed the triangle budget.
  pub budget_exhausted: bool,
  pub elapsed_us: u64,
  /// Quota the cycle ran with.
  pub quota: usize,
  pub quota_change: QuotaChange,
}

pub struct MeshExtractor {
  config: ExtractionConfig,
  cadence: AimdController,
  queue: VecDeque<BlockIndex>,
  queued: HashSet<BlockIndex>,
  /// Blocks the consumer currently holds a mesh for, with the allocation
  /// serial the mesh was built from.
  meshed: HashMap<BlockIndex, u64>,
}

impl MeshExtractor {
  pub fn new(config: &ExtractionConfig, target_cycle: Duration) -> Self {
    Self {
      cadence: AimdController::new(config, target_cycle),
      config: config.clone(),
      queue: VecDeque::new(),
      queued: HashSet::new(),
      meshed: HashMap::new(),
    }
  }

  #[inline]
  pub fn quota(&self) -> usize {
    self.cadence.quota()
  }

  #[inline]
  pub fn pending(&self) -> usize {
    self.queue.len()
  }

  #[inline]
  pub fn cadence(&self) -> &AimdController {
    &self.cadence
  }

  /// Whether the consumer holds a mesh for `key`.
  #[inline]
  pub fn is_meshed(&self, key: BlockIndex) -> bool {
    self.meshed.contains_key(&key)
  }

  fn enqueue(&mut self, key: BlockIndex) -> bool {
    if self.queued.insert(key) {
      self.queue.push_back(key);
      true
    } else {
      false
    }
  }

  fn scan(&mut self, table: &SpatialHashTable) {
    let mut dirty = Vec::new();
    table.for_each_block(|key, _, block| {
      if block.is_dirty() {
        dirty.push(key);
      }
    });
    dirty.sort_unstable();

    for key in dirty {
      if !self.enqueue(key) {
        continue;
      }
      let neighbors: SmallVec<[BlockIndex; 7]> = LOWER_NEIGHBORS
        .iter()
        .map(|&[dx, dy, dz]| key.offset(dx, dy, dz))
        .filter(|neighbor| table.contains(*neighbor))
        .collect();
      for neighbor in neighbors {
        self.enqueue(neighbor);
      }
    }
  }

  /// Retire meshes whose block was removed, including blocks removed and
  /// allocated again under the same key since they were meshed.
  fn retire_stale(&mut self, table: &SpatialHashTable, output: &mut MeshOutput) {
    let mut gone: Vec<BlockIndex> = self
      .meshed
      .iter()
      .filter(|(key, serial)| table.block_at(**key).map(|b| b.allocation) != Some(**serial))
      .map(|(key, _)| *key)
      .collect();
    gone.sort_unstable();
    for key in &gone {
      self.meshed.remove(key);
    }
    output.retired = gone;
  }

  /// Run one cycle: mesh up to `quota` queued blocks, stopping before the
  /// output would exceed `max_triangles`. The first block of a cycle is
  /// always emitted.
  #[cfg_attr(feature = "profiling", tracing::instrument(skip_all, name = "extract::cycle"))]
  pub fn extract_incremental(&mut self, table: &mut SpatialHashTable, max_triangles: usize) -> (MeshOutput, ExtractionStats) {
    let started = Instant::now();
    let mut output = MeshOutput::new();
    self.scan(table);
    self.retire_stale(table, &mut output);

    let quota = self.cadence.quota();
    let mut rejected = 0;
    let mut budget_exhausted = false;

    while output.blocks.len() < quota {
      let Some(key) = self.queue.pop_front() else {
        break;
      };
      self.queued.remove(&key);
      let Some(slot) = table.lookup(key) else {
        continue;
      };

      let vertex_mark = output.vertices.len();
      let index_mark = output.indices.len();
      let (meshed, generation, serial) = {
        let Some(hood) = BlockNeighborhood::gather(table, key) else {
          continue;
        };
        let (generation, serial) = table
          .block(slot)
          .map_or((0, 0), |b| (b.integration_generation, b.allocation));
        (mesh_block(&hood, &self.config, &mut output), generation, serial)
      };

      let first = output.blocks.is_empty();
      if !first && output.triangle_count() > max_triangles {
        output.vertices.truncate(vertex_mark);
        output.indices.truncate(index_mark);
        self.queued.insert(key);
        self.queue.push_front(key);
        budget_exhausted = true;
        break;
      }

      rejected += meshed.rejected;
      output.blocks.push(meshed.range);
      self.meshed.insert(key, serial);
      table.update_block(slot, |block| block.mesh_generation = generation);
    }

    let mut bounds = MinMaxAABB::empty();
    for vertex in &output.vertices {
      bounds.encapsulate(vertex.position);
    }
    output.bounds = bounds;

    let elapsed = started.elapsed();
    let quota_change = self.cadence.record_cycle(elapsed);
    let stats = ExtractionStats {
      blocks_meshed: output.blocks.len(),
      triangles: output.triangle_count(),
      rejected_triangles: rejected,
      pending: self.queue.len(),
      retired: output.retired.len(),
      budget_exhausted,
      elapsed_us: elapsed.as_micros() as u64,
      quota,
      quota_change,
    };
    tracing::debug!(
      blocks = stats.blocks_meshed,
      triangles = stats.triangles,
      pending = stats.pending,
      next_quota = self.cadence.quota(),
      "extraction cycle"
    );
    (output, stats)
  }
}
