//! Synthetic replay driver for the TSDF fusion core.
//!
//! Renders depth frames of an analytic scene (a sphere on a floor) from a
//! camera orbiting it, feeds them through `TsdfVolume`, and prints per-cycle
//! extraction statistics plus a session summary.
//!
//! Run with `RUST_LOG=tsdf_fusion=debug` to see the library's frame and
//! eviction events.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use glam::{Mat4, Vec3};
use std::path::PathBuf;

use config::{ReplayConfig, SceneConfig};
use tsdf_fusion::{
	BackendKind, DepthImage, FrameInput, Intrinsics, SkipReason, TrackingQuality, TsdfVolume,
};

/// Replays a synthetic depth sequence through the fusion core.
#[derive(Parser, Debug)]
#[command(name = "tsdf_replay")]
#[command(about = "Replays a synthetic orbit through the TSDF fusion core")]
struct Args {
	/// Path to a configuration TOML file (defaults are used without one).
	#[arg(short, long)]
	config: Option<PathBuf>,

	/// Override the integration backend.
	#[arg(short, long, value_enum)]
	backend: Option<Backend>,

	/// Override the number of frames.
	#[arg(short, long)]
	frames: Option<usize>,

	/// Print the audit ring when done.
	#[arg(long)]
	audit: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Backend {
	Cpu,
	Accelerator,
}

impl From<Backend> for BackendKind {
	fn from(backend: Backend) -> Self {
		match backend {
			Backend::Cpu => BackendKind::Cpu,
			Backend::Accelerator => BackendKind::Accelerator,
		}
	}
}

fn main() -> Result<()> {
	env_logger::init();
	let args = Args::parse();

	let mut config = match &args.config {
		Some(path) => {
			println!("Loading config from: {}", path.display());
			ReplayConfig::load(path)?
		}
		None => ReplayConfig::default(),
	};
	if let Some(backend) = args.backend {
		config.backend = backend.into();
	}
	if let Some(frames) = args.frames {
		config.scene.frames = frames;
	}
	config.check()?;

	let scene = &config.scene;
	let mut volume = TsdfVolume::new(config.fusion.clone(), config.backend)
		.context("Failed to create volume")?;
	log::info!(
		"replaying {} frames at {}x{} on the {:?} backend",
		scene.frames,
		scene.width,
		scene.height,
		config.backend
	);

	let intrinsics = Intrinsics::new(
		scene.focal_length,
		scene.focal_length,
		scene.width as f32 * 0.5,
		scene.height as f32 * 0.5,
		scene.width as u32,
		scene.height as u32,
	);

	let mut total_triangles = 0usize;
	for index in 0..scene.frames {
		let timestamp = index as f64 / scene.fps;
		let camera_to_world = orbit_pose(scene, index);
		let depth = render_depth(scene, &intrinsics, &camera_to_world);

		let mut input = FrameInput::new(
			timestamp,
			intrinsics,
			camera_to_world,
			scene.width as u32,
			scene.height as u32,
		);
		if scene.tracking_dropouts.contains(&index) {
			input = input.with_tracking(TrackingQuality::NotAvailable);
		}

		if let Err(reason) = volume.integrate_frame(&input, &depth) {
			log::debug!("frame {index} skipped: {reason}");
		}

		if let Some((mesh, stats)) = volume.maybe_extract(timestamp) {
			total_triangles += stats.triangles;
			println!(
				"t={:6.2}s  blocks={:4}  meshed={:3}  tris={:6}  pending={:4}  quota={:4} ({:?})  {:.2} ms",
				timestamp,
				volume.table().len(),
				stats.blocks_meshed,
				mesh.triangle_count(),
				stats.pending,
				stats.quota,
				stats.quota_change,
				stats.elapsed_us as f64 / 1000.0
			);
		}
	}

	// Drain whatever is still dirty.
	let budget = volume.config().extraction.max_triangles_per_cycle;
	loop {
		let (_, stats) = volume.extract(budget);
		total_triangles += stats.triangles;
		if stats.pending == 0 {
			break;
		}
	}

	print_summary(&volume, total_triangles);
	if args.audit {
		print_audit(&volume);
	}
	Ok(())
}

/// Camera on a circle around the sphere, looking at its centre.
fn orbit_pose(scene: &SceneConfig, index: usize) -> Mat4 {
	let angle = std::f32::consts::TAU * scene.orbit_fraction * index as f32 / scene.frames as f32;
	let center = Vec3::from(scene.sphere_center);
	let eye = Vec3::new(
		center.x + scene.orbit_radius * angle.cos(),
		scene.floor_height + scene.orbit_height,
		center.z + scene.orbit_radius * angle.sin(),
	);
	look_at(eye, center)
}

/// Camera-to-world transform with camera +X right, +Y down, +Z forward.
fn look_at(eye: Vec3, target: Vec3) -> Mat4 {
	let forward = (target - eye).normalize();
	let right = forward.cross(Vec3::Y).normalize();
	let down = forward.cross(right);
	Mat4::from_cols(
		right.extend(0.0),
		down.extend(0.0),
		forward.extend(0.0),
		eye.extend(1.0),
	)
}

/// Ray-cast z-depth of the scene. Pixels that hit nothing are invalid.
fn render_depth(scene: &SceneConfig, intrinsics: &Intrinsics, camera_to_world: &Mat4) -> DepthImage {
	let origin = camera_to_world.w_axis.truncate();
	let center = Vec3::from(scene.sphere_center);
	let radius_sq = scene.sphere_radius * scene.sphere_radius;

	DepthImage::from_fn(scene.width, scene.height, |x, y| {
		// Camera-space z is 1, so the ray parameter is the z-depth.
		let ray = Vec3::new(
			(x as f32 - intrinsics.cx()) / intrinsics.fx(),
			(y as f32 - intrinsics.cy()) / intrinsics.fy(),
			1.0,
		);
		let dir = camera_to_world.transform_vector3(ray);

		let mut hit = f32::INFINITY;

		let oc = origin - center;
		let a = dir.length_squared();
		let b = 2.0 * dir.dot(oc);
		let c = oc.length_squared() - radius_sq;
		let disc = b * b - 4.0 * a * c;
		if disc >= 0.0 {
			let t = (-b - disc.sqrt()) / (2.0 * a);
			if t > 0.0 {
				hit = hit.min(t);
			}
		}

		if dir.y.abs() > f32::EPSILON {
			let t = (scene.floor_height - origin.y) / dir.y;
			if t > 0.0 {
				hit = hit.min(t);
			}
		}

		if hit.is_finite() {
			(hit, 2)
		} else {
			(0.0, 0)
		}
	})
}

fn print_summary(volume: &TsdfVolume, total_triangles: usize) {
	let metrics = volume.metrics();
	let pool = volume.table().pool();

	println!("\nSession summary");
	println!(
		"  frames:      {} received, {} integrated",
		metrics.frames_received, metrics.frames_integrated
	);
	for reason in SkipReason::ALL {
		let count = metrics.skip_count(reason);
		if count > 0 {
			println!("  skipped:     {count} ({reason})");
		}
	}
	println!(
		"  blocks:      {} live ({:.1}% of pool), {} allocated, {} anticipated, {} evicted",
		volume.table().len(),
		pool.occupancy() * 100.0,
		metrics.blocks_allocated,
		metrics.blocks_anticipated,
		metrics.blocks_evicted
	);
	println!(
		"  index:       {} buckets, {} rehashes, {} allocation failures",
		volume.table().bucket_count(),
		metrics.rehashes,
		metrics.allocation_failures
	);
	println!(
		"  extraction:  {} cycles, {} triangles",
		metrics.extraction_cycles, total_triangles
	);
	println!(
		"  timing:      {:.0} us/frame, {:.0} us/cycle",
		metrics.avg_integration_us(),
		metrics.avg_extraction_us()
	);
	println!(
		"  keyframes:   {} in the last {} records",
		volume.audit().keyframes().count(),
		volume.audit().len()
	);
}

fn print_audit(volume: &TsdfVolume) {
	println!("\nAudit ring");
	for record in volume.audit().iter() {
		println!(
			"  #{:<5} t={:6.2}s  {:<10} blocks={:<5}{}",
			record.frame_index,
			record.timestamp,
			format!("{:?}", record.outcome),
			record.blocks.len(),
			if record.keyframe { "  keyframe" } else { "" }
		);
	}
}
