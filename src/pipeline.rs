//! Pipeline orchestration: preprocess → ICP odometry → (loop detection) →
//! pose graph optimization → map fusion → waypoint extraction, streaming or
//! batch, plus artifact serialization.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use nalgebra::{Vector2, Vector3};
use ndarray::Array1;

use crate::config::{Config, LoopStrategy};
use crate::error::Error;
use crate::graph::{FactorKind, PoseGraph};
use crate::io;
use crate::loop_closure::{ScanContextDetector, SpatialLoopDetector, VerifiedLoop};
use crate::map_builder::MapBuilder;
use crate::odometry::{IcpOdometry, OdometryEstimate};
use crate::pointcloud::PointCloud;
use crate::preprocess::FramePreprocessor;
use crate::trajectory::Trajectory;
use crate::transform::Transform;
use crate::waypoints::WaypointExtractor;

/// Cooperative cancellation flag, observed at component boundaries only.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Summary of the pose graph solve carried into the artifacts.
#[derive(Clone, Debug)]
pub struct GraphSummary {
    pub converged: bool,
    pub iterations: usize,
    pub final_cost: f64,
    pub num_odometry_factors: usize,
    pub num_loop_factors: usize,
}

/// Everything a finished run produces.
pub struct MappingArtifacts {
    /// Pre-optimization pose chain.
    pub odometry: Vec<Transform>,
    /// Per-frame registration status; fitness zero marks frames where the
    /// motion model or the empty-frame rule stood in.
    pub estimates: Vec<OdometryEstimate>,
    /// Optimized trajectory.
    pub trajectory: Trajectory,
    pub loops: Vec<VerifiedLoop>,
    pub map: PointCloud,
    pub waypoints: Vec<Vector2<f32>>,
    pub graph: GraphSummary,
}

impl MappingArtifacts {
    /// Serializes map, trajectory, and waypoints into `directory`, plus the
    /// raw odometry tensor when requested.
    pub fn save(&self, directory: &Path, save_odometry: bool) -> Result<(), Error> {
        std::fs::create_dir_all(directory)?;
        io::write_map(directory, &self.map)?;
        io::write_trajectory(directory.join("trajectory.txt"), &self.trajectory)?;
        io::write_waypoints(directory.join("waypoints.txt"), &self.waypoints)?;
        if save_odometry {
            io::write_pose_tensor_npy(directory.join("odometry_poses.npy"), &self.odometry)?;
        }
        info!("artifacts written to {}", directory.display());
        Ok(())
    }
}

/// The mapping pipeline. Feed frames with [`MappingPipeline::push_frame`],
/// then call [`MappingPipeline::finish`]; or use the batch entry points.
///
/// Preprocessed frames are retained for loop verification and map fusion;
/// the odometry's full-resolution window buffers are released as the window
/// slides.
pub struct MappingPipeline {
    config: Config,
    preprocessor: FramePreprocessor,
    odometry: IcpOdometry,
    frames: Vec<PointCloud>,
    estimates: Vec<OdometryEstimate>,
    scan_context: Option<ScanContextDetector>,
    cancel: CancelToken,
}

impl MappingPipeline {
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;
        let scan_context = (config.loop_closure.enabled
            && config.loop_closure.strategy == LoopStrategy::Descriptor)
            .then(|| ScanContextDetector::new(config.scan_context_params()));

        Ok(Self {
            preprocessor: FramePreprocessor::new(config.preprocessor_params()),
            odometry: IcpOdometry::new(config.odometry_params()),
            frames: Vec::new(),
            estimates: Vec::new(),
            scan_context,
            cancel: CancelToken::new(),
            config,
        })
    }

    /// Token to cancel this run from another thread. Cancellation is
    /// observed between frames and between stages.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Streams one raw frame through preprocessing and odometry.
    pub fn push_frame(&mut self, points: &Array1<Vector3<f32>>) -> Result<OdometryEstimate, Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let filtered = self.preprocessor.filter(points);
        let estimate = self.odometry.register(&filtered);
        if let Some(scan_context) = self.scan_context.as_mut() {
            scan_context.add_frame(&filtered);
        }
        self.frames.push(filtered);
        self.estimates.push(estimate.clone());
        Ok(estimate)
    }

    /// Runs the back end over everything pushed so far and produces the
    /// artifacts.
    pub fn finish(self) -> Result<MappingArtifacts, Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.frames.is_empty() {
            return Err(Error::EmptyInput);
        }

        let config = &self.config;
        let odometry: Vec<Transform> = self.odometry.poses().to_vec();

        // Odometry chain into the factor graph; the first solve must
        // succeed structurally.
        let mut graph = PoseGraph::from_odometry(
            &odometry,
            &config.graph.sigma_odom,
            &config.graph.sigma_prior,
        );
        let mut report = graph.optimize(config.graph.max_iters)?;

        // Loop closures run on the optimized estimate, then a re-optimize
        // folds them in.
        let mut loops = Vec::new();
        if config.loop_closure.enabled && config.loop_closure.strategy != LoopStrategy::None {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let optimized: Vec<Transform> = report.poses.values().cloned().collect();
            loops = self.detect_loops(&optimized);
            if !loops.is_empty() {
                for closure in &loops {
                    graph.add_between(
                        closure.from,
                        closure.to,
                        &closure.transform,
                        &config.graph.sigma_loop,
                        FactorKind::Loop,
                    );
                }
                report = graph.optimize(config.graph.max_iters)?;
                if !report.converged {
                    warn!("re-optimization with loops did not converge; keeping best estimate");
                }
            }
        }

        let trajectory =
            Trajectory::from_poses(report.poses.values().cloned().collect());

        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // Map fusion over the optimized poses.
        let mut map_builder = MapBuilder::new(config.map_params());
        map_builder.extend(&self.frames, &trajectory.sensor_to_world);
        let map = map_builder.finalize();

        let waypoints =
            WaypointExtractor::new(config.waypoint_params()).extract(&trajectory);

        Ok(MappingArtifacts {
            odometry,
            estimates: self.estimates,
            trajectory,
            loops,
            map,
            waypoints,
            graph: GraphSummary {
                converged: report.converged,
                iterations: report.iterations,
                final_cost: report.final_cost,
                num_odometry_factors: graph.num_factors_of(FactorKind::Odometry),
                num_loop_factors: graph.num_factors_of(FactorKind::Loop),
            },
        })
    }

    fn detect_loops(&self, poses: &[Transform]) -> Vec<VerifiedLoop> {
        let detector = SpatialLoopDetector::new(self.config.loop_params());
        match (&self.scan_context, self.config.loop_closure.strategy) {
            (Some(scan_context), LoopStrategy::Descriptor) => {
                let candidates = scan_context.candidates(self.config.loop_closure.g_min);
                info!("loop detector: {} descriptor candidates", candidates.len());
                detector.verify_candidates(&candidates, poses, &self.frames)
            }
            _ => detector.detect(poses, &self.frames),
        }
    }

    /// Batch entry point over in-memory frames.
    pub fn run_frames(
        config: Config,
        frames: &[Array1<Vector3<f32>>],
    ) -> Result<MappingArtifacts, Error> {
        let mut pipeline = Self::new(config)?;
        for frame in frames {
            pipeline.push_frame(frame)?;
        }
        pipeline.finish()
    }

    /// Batch entry point over a sequence directory of PCD/PLY/BIN files.
    pub fn run_directory(config: Config, directory: &Path) -> Result<MappingArtifacts, Error> {
        if !directory.is_dir() {
            return Err(Error::InputMissing(directory.to_path_buf()));
        }
        let paths = io::discover_frames(directory)?;
        if paths.is_empty() {
            return Err(Error::InputMissing(directory.to_path_buf()));
        }

        let mut pipeline = Self::new(config)?;
        for path in &paths {
            let points = io::load_points(path)?;
            pipeline.push_frame(&points)?;
        }
        pipeline.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::Transform;
    use nalgebra::Vector6;

    fn world_points() -> Vec<Vector3<f32>> {
        let mut points = Vec::new();
        for i in 0..120 {
            for j in 0..8 {
                let (x, z) = (i as f32 * 0.1, j as f32 * 0.25);
                points.push(Vector3::new(x, 3.0, z));
                points.push(Vector3::new(x, -3.0, z));
            }
        }
        for p in 0..4 {
            for a in 0..10 {
                for k in 0..8 {
                    let angle = a as f32 * std::f32::consts::TAU / 10.0;
                    points.push(Vector3::new(
                        p as f32 * 3.0 + 0.2 * angle.cos(),
                        1.5 * if p % 2 == 0 { 1.0 } else { -1.0 } + 0.2 * angle.sin(),
                        k as f32 * 0.25,
                    ));
                }
            }
        }
        points
    }

    fn scan_at(x: f32) -> Array1<Vector3<f32>> {
        let pose = Transform::exp(&Vector6::new(x, 0.0, 0.0, 0.0, 0.0, 0.0));
        let inverse = pose.inverse();
        Array1::from_iter(
            world_points()
                .into_iter()
                .map(|p| inverse.transform_vector(&p))
                .filter(|p| p.norm() < 10.0),
        )
    }

    #[test]
    fn single_frame_run_produces_minimal_artifacts() {
        let artifacts = MappingPipeline::run_frames(Config::default(), &[scan_at(0.0)]).unwrap();
        assert_eq!(artifacts.trajectory.len(), 1);
        assert!(artifacts.trajectory.get(0).unwrap().translation().norm() < 1e-6);
        assert_eq!(artifacts.waypoints.len(), 1);
        assert!(!artifacts.map.is_empty());
        assert!(artifacts.loops.is_empty());
    }

    #[test]
    fn short_sequence_tracks_and_builds_a_map() {
        let frames: Vec<_> = (0..8).map(|i| scan_at(i as f32 * 0.25)).collect();
        let artifacts = MappingPipeline::run_frames(Config::default(), &frames).unwrap();

        assert_eq!(artifacts.trajectory.len(), 8);
        let length = artifacts.trajectory.length();
        assert!(
            (length - 1.75).abs() < 0.5,
            "trajectory length {length} far from truth"
        );
        assert_eq!(artifacts.graph.num_odometry_factors, 7);
        assert!(!artifacts.map.is_empty());
        // The fused map spans the corridor that was observed.
        let max_x = artifacts
            .map
            .points
            .iter()
            .map(|p| p.x)
            .fold(f32::MIN, f32::max);
        assert!(max_x > 8.0);
    }

    #[test]
    fn empty_run_is_an_error() {
        let pipeline = MappingPipeline::new(Config::default()).unwrap();
        assert!(matches!(pipeline.finish(), Err(Error::EmptyInput)));
    }

    #[test]
    fn cancellation_aborts_without_artifacts() {
        let mut pipeline = MappingPipeline::new(Config::default()).unwrap();
        pipeline.push_frame(&scan_at(0.0)).unwrap();
        pipeline.cancel_token().cancel();
        assert!(matches!(pipeline.push_frame(&scan_at(0.25)), Err(Error::Cancelled)));
        assert!(matches!(pipeline.finish(), Err(Error::Cancelled)));
    }

    #[test]
    fn missing_directory_is_input_error() {
        let result =
            MappingPipeline::run_directory(Config::default(), Path::new("/nonexistent/scans"));
        assert!(matches!(result, Err(Error::InputMissing(_))));
    }

    #[test]
    fn empty_directory_is_input_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = MappingPipeline::run_directory(Config::default(), dir.path());
        assert!(matches!(result, Err(Error::InputMissing(_))));
    }
}
