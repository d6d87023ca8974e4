//! Configuration parsing for a replay run.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use tsdf_fusion::{BackendKind, FusionConfig};

/// Root configuration for a replay run.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
	/// Integration backend ("Cpu" or "Accelerator").
	pub backend: BackendKind,
	/// Synthetic scene and camera path.
	pub scene: SceneConfig,
	/// Fusion core settings. Missing keys keep their defaults.
	pub fusion: FusionConfig,
}

/// A sphere resting on a floor, seen by a camera orbiting it.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
	/// Sphere centre in world space (Y up).
	pub sphere_center: [f32; 3],
	pub sphere_radius: f32,
	/// Height of the floor plane.
	pub floor_height: f32,
	/// Camera distance from the sphere axis.
	pub orbit_radius: f32,
	/// Camera height above the floor.
	pub orbit_height: f32,
	/// Fraction of a full orbit covered by the run.
	pub orbit_fraction: f32,
	pub frames: usize,
	pub fps: f64,
	/// Depth image size and focal length in pixels.
	pub width: usize,
	pub height: usize,
	pub focal_length: f32,
	/// Frames (by index) reported with lost tracking.
	pub tracking_dropouts: Vec<usize>,
}

impl Default for SceneConfig {
	fn default() -> Self {
		Self {
			sphere_center: [0.0, 0.3, 0.0],
			sphere_radius: 0.3,
			floor_height: 0.0,
			orbit_radius: 1.2,
			orbit_height: 0.6,
			orbit_fraction: 1.0,
			frames: 180,
			fps: 30.0,
			width: 160,
			height: 120,
			focal_length: 140.0,
			tracking_dropouts: Vec::new(),
		}
	}
}

impl ReplayConfig {
	/// Load configuration from a TOML file.
	pub fn load(path: &Path) -> Result<Self> {
		let content = std::fs::read_to_string(path)
			.with_context(|| format!("Failed to read config file: {}", path.display()))?;
		let config: ReplayConfig =
			toml::from_str(&content).with_context(|| "Failed to parse config TOML")?;
		config.check()?;
		Ok(config)
	}

	/// Reject settings the fusion core or the scene cannot run with.
	pub fn check(&self) -> Result<()> {
		self.fusion
			.validate()
			.context("Invalid [fusion] section")?;

		let scene = &self.scene;
		if scene.frames == 0 {
			anyhow::bail!("scene.frames must be at least 1");
		}
		if scene.width == 0 || scene.height == 0 {
			anyhow::bail!(
				"scene image size must be non-zero, got {}x{}",
				scene.width,
				scene.height
			);
		}
		if !(scene.fps.is_finite() && scene.fps > 0.0) {
			anyhow::bail!("scene.fps must be positive, got {}", scene.fps);
		}
		if !(scene.focal_length.is_finite() && scene.focal_length > 0.0) {
			anyhow::bail!("scene.focal_length must be positive, got {}", scene.focal_length);
		}
		if scene.orbit_radius <= scene.sphere_radius {
			anyhow::bail!(
				"camera orbit ({}) must stay outside the sphere ({})",
				scene.orbit_radius,
				scene.sphere_radius
			);
		}
		Ok(())
	}
}
