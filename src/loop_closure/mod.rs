//! Loop-closure detection: spatial revisit candidates, the optional
//! scan-context descriptor matcher, and ICP verification shared by both.

mod scan_context;

pub use scan_context::{ScanContextDetector, ScanContextParams};

use log::{debug, info};
use rayon::prelude::*;

use crate::icp::{Icp, IcpEstimator, IcpParams};
use crate::pointcloud::PointCloud;
use crate::sampling::Downsample;
use crate::transform::Transform;

#[derive(Debug, Clone, Copy)]
pub struct LoopParams {
    /// Maximum distance between poses for a spatial candidate.
    pub distance_threshold: f32,
    /// Minimum index gap between the two frames of a candidate.
    pub min_frame_gap: usize,
    /// Voxel size applied to both clouds before verification.
    pub voxel_size: f32,
    /// Minimum ICP fitness for acceptance.
    pub fitness_threshold: f32,
    pub max_correspondence_distance: f32,
    pub max_iterations: usize,
}

impl Default for LoopParams {
    fn default() -> Self {
        Self {
            distance_threshold: 5.0,
            min_frame_gap: 50,
            voxel_size: 0.2,
            fitness_threshold: 0.3,
            max_correspondence_distance: 0.5,
            max_iterations: 50,
        }
    }
}

/// An accepted revisit constraint between two non-adjacent frames.
#[derive(Clone, Debug)]
pub struct VerifiedLoop {
    pub from: usize,
    pub to: usize,
    /// Relative pose mapping frame `to` coordinates into frame `from`,
    /// i.e. the between-factor measurement.
    pub transform: Transform,
    pub fitness: f32,
}

/// How far ICP verification moved a candidate away from its odometry seed.
/// Large corrections on a loop that still verified are exactly the drift
/// the closure will remove.
struct SeedCorrection {
    angle: f32,
    translation: f32,
}

impl SeedCorrection {
    fn new(seed: &Transform, refined: &Transform) -> Self {
        let difference = &seed.inverse() * refined;
        Self {
            angle: difference.angle(),
            translation: difference.translation().norm(),
        }
    }
}

impl std::fmt::Display for SeedCorrection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.2}° / {:.3} m off the seed",
            self.angle.to_degrees(),
            self.translation
        )
    }
}

/// Distance-based loop detection with ICP verification.
pub struct SpatialLoopDetector {
    params: LoopParams,
}

impl SpatialLoopDetector {
    pub fn new(params: LoopParams) -> Self {
        Self { params }
    }

    /// Proposes all pairs (i, j), j - i >= gap, whose pose translations are
    /// within the distance threshold.
    pub fn candidates(&self, poses: &[Transform]) -> Vec<(usize, usize)> {
        let mut candidates = Vec::new();
        for i in 0..poses.len() {
            for j in (i + self.params.min_frame_gap)..poses.len() {
                let distance = (poses[i].translation() - poses[j].translation()).norm();
                if distance < self.params.distance_threshold {
                    candidates.push((i, j));
                }
            }
        }
        candidates
    }

    /// Verifies one candidate by point-to-point ICP seeded with the current
    /// pose difference. The source is the later frame so the accepted
    /// transform is directly `pose_from^-1 * pose_to`.
    pub fn verify(
        &self,
        cloud_from: &PointCloud,
        cloud_to: &PointCloud,
        initial_guess: &Transform,
    ) -> Option<(Transform, f32)> {
        let target = cloud_from.downsample(self.params.voxel_size);
        let source = cloud_to.downsample(self.params.voxel_size);
        if target.is_empty() || source.is_empty() {
            return None;
        }

        let icp_params = IcpParams {
            max_iterations: self.params.max_iterations,
            max_correspondence_distance: self.params.max_correspondence_distance,
            estimator: IcpEstimator::PointToPoint,
            ..Default::default()
        };
        let result = Icp::new(icp_params, &target)
            .with_initial_transform(initial_guess.clone())
            .align(&source);

        if result.fitness > self.params.fitness_threshold {
            Some((result.transform, result.fitness))
        } else {
            None
        }
    }

    /// Detects and verifies all loops. Verification runs in parallel over
    /// candidates; results come back sorted by ascending (from, to).
    pub fn detect(&self, poses: &[Transform], clouds: &[PointCloud]) -> Vec<VerifiedLoop> {
        let candidates = self.candidates(poses);
        info!("loop detector: {} spatial candidates", candidates.len());
        self.verify_candidates(&candidates, poses, clouds)
    }

    /// ICP-verifies an externally proposed candidate list (spatial or
    /// descriptor-based).
    pub fn verify_candidates(
        &self,
        candidates: &[(usize, usize)],
        poses: &[Transform],
        clouds: &[PointCloud],
    ) -> Vec<VerifiedLoop> {
        let mut verified: Vec<VerifiedLoop> = candidates
            .par_iter()
            .filter(|(from, to)| *from < clouds.len() && *to < clouds.len())
            .filter_map(|(from, to)| {
                let initial_guess = &poses[*from].inverse() * &poses[*to];
                let (transform, fitness) =
                    self.verify(&clouds[*from], &clouds[*to], &initial_guess)?;
                let correction = SeedCorrection::new(&initial_guess, &transform);
                debug!(
                    "loop detector: verified {from} -> {to} (fitness {fitness:.3}, {correction})"
                );
                Some(VerifiedLoop {
                    from: *from,
                    to: *to,
                    transform,
                    fitness,
                })
            })
            .collect();

        verified.sort_by_key(|found| (found.from, found.to));
        info!("loop detector: {} verified loops", verified.len());
        verified
    }
}
