//! tsdf_fusion - Sparse volumetric depth fusion with live mesh extraction
//!
//! This crate incrementally integrates posed depth frames into a sparse
//! truncated-signed-distance (TSDF) volume and extracts a triangle mesh from
//! it under a time budget. Storage is a fixed pool of 8×8×8 voxel blocks
//! indexed by an open-addressing spatial hash.
//!
//! # Features
//!
//! - **Adaptive resolution**: three voxel-size tiers chosen by observation
//!   depth, floor-based block coordinates
//! - **Two integration backends**: a rayon CPU reference and an
//!   asynchronous accelerator variant with bounded in-flight submissions
//! - **Frame gate**: typed skip reasons (tracking, pose teleport and jitter,
//!   thermal, timeout, depth coverage, memory pressure)
//! - **Incremental marching cubes**: the full 256-case table over dirty
//!   blocks only, paced by an AIMD quota controller
//! - **Block lifecycle**: on-demand allocation, anticipatory preallocation
//!   ahead of the camera, staleness eviction, and an audit ring
//!
//! # Example
//!
//! ```ignore
//! use tsdf_fusion::{BackendKind, FrameInput, FusionConfig, TsdfVolume};
//!
//! let mut volume = TsdfVolume::new(FusionConfig::default(), BackendKind::Cpu)?;
//!
//! // For each frame from the tracker:
//! match volume.integrate_frame(&input, &depth) {
//!     Ok(stats) => println!("fused {} blocks", stats.blocks_updated),
//!     Err(reason) => println!("skipped: {reason}"),
//! }
//!
//! if let Some((mesh, stats)) = volume.maybe_extract(input.timestamp) {
//!     println!("{} triangles from {} blocks", mesh.triangle_count(), stats.blocks_meshed);
//! }
//! ```

pub mod constants;
pub mod types;

// Re-export commonly used items
pub use constants::{coord_to_index, index_to_coord, BLOCK_EDGE, VOXELS_PER_BLOCK};
pub use types::{
  sdf_conversion, BlockIndex, BlockMeshRange, Intrinsics, MeshOutput, MinMaxAABB, SlotId, ThermalState,
  TrackingQuality, Vertex, Voxel, VoxelBlock,
};

// Configuration and structural errors
pub mod config;
pub mod error;
pub use config::{ConfigError, DerivedLimits, FusionConfig};
pub use error::FusionError;

// Depth → resolution tier, block coordinates, weights
pub mod resolution;

// Block storage
pub mod hash_table;
pub mod pool;
pub use hash_table::SpatialHashTable;
pub use pool::VoxelBlockPool;

// Frame gate, fusion math and the two backends
pub mod integration;
pub use integration::{
  BackendKind, DepthImage, DepthProvider, FrameInput, FrameOutcome, IntegrationBackend, IntegrationStats,
  SkipReason,
};

// Incremental marching cubes
pub mod extraction;
pub use extraction::{ExtractionStats, MeshExtractor};

// Orchestrator
pub mod volume;
pub use volume::TsdfVolume;

// Integration records
pub mod audit;
pub use audit::{AuditLog, IntegrationRecord, RecordOutcome};

// Engine-agnostic metrics
pub mod metrics;
pub use metrics::VolumeMetrics;

#[cfg(test)]
mod test_utils;
