use std::collections::VecDeque;

use log::{debug, warn};

use crate::icp::{Icp, IcpEstimator, IcpParams};
use crate::normals::estimate_normals;
use crate::pointcloud::PointCloud;
use crate::sampling::{stride_decimate, Downsample};
use crate::transform::{Transform, Transformable};

/// Per-cloud budget when concatenating the local map target.
const LOCAL_MAP_POINT_CAP: usize = 5_000;
/// Hybrid normal search keeps at most this many neighbors.
const NORMAL_MAX_NN: usize = 30;

#[derive(Debug, Clone, Copy)]
pub struct OdometryParams {
    /// Voxel size applied to both registration clouds.
    pub voxel_size: f32,
    /// Base correspondence distance; registration runs at twice this.
    pub max_correspondence_distance: f32,
    /// Base iteration budget; registration runs at twice this.
    pub max_iterations: usize,
    /// Number of recent frames kept in the local map.
    pub window_size: usize,
    /// Expected per-frame motion in meters. Registrations that move the
    /// pose more than three times this are rejected.
    pub expected_step: f32,
}

impl Default for OdometryParams {
    fn default() -> Self {
        Self {
            voxel_size: 0.1,
            max_correspondence_distance: 0.5,
            max_iterations: 50,
            window_size: 5,
            expected_step: 0.25,
        }
    }
}

/// Registration outcome for one frame.
#[derive(Clone, Debug)]
pub struct OdometryEstimate {
    pub index: usize,
    /// Absolute pose, sensor frame to world.
    pub pose: Transform,
    /// Inlier fraction reported by the registration, or zero when the
    /// motion model stood in for it.
    pub fitness: f32,
    pub rmse: f32,
}

/// Frame-to-local-map ICP odometry.
///
/// Each incoming frame is registered point-to-plane against a sliding window
/// of recent frames in world coordinates. Implausible registrations fall
/// back to a constant-velocity motion model that zeroes angular velocity.
pub struct IcpOdometry {
    params: OdometryParams,
    poses: Vec<Transform>,
    window: VecDeque<PointCloud>,
}

impl IcpOdometry {
    pub fn new(params: OdometryParams) -> Self {
        Self {
            params,
            poses: Vec::new(),
            window: VecDeque::new(),
        }
    }

    pub fn poses(&self) -> &[Transform] {
        &self.poses
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }

    /// Registers the next frame (sensor-local coordinates) and returns its
    /// absolute pose with the registration quality.
    ///
    /// Frames must arrive in acquisition order. An empty frame keeps the
    /// previous pose and reports zero fitness.
    pub fn register(&mut self, points: &PointCloud) -> OdometryEstimate {
        let index = self.poses.len();

        if index == 0 {
            let fitness = if points.is_empty() { 0.0 } else { 1.0 };
            self.poses.push(Transform::eye());
            if !points.is_empty() {
                self.push_window(points.clone());
            }
            return OdometryEstimate {
                index,
                pose: Transform::eye(),
                fitness,
                rmse: 0.0,
            };
        }

        let previous = self.poses[index - 1].clone();
        if points.is_empty() {
            debug!("frame {index}: empty after preprocessing, holding pose");
            self.poses.push(previous.clone());
            return OdometryEstimate {
                index,
                pose: previous,
                fitness: 0.0,
                rmse: 0.0,
            };
        }

        let (pose, fitness, rmse) = match self.register_against_local_map(points, &previous) {
            Some((candidate, fitness, rmse)) => {
                let delta = (candidate.translation() - previous.translation()).norm();
                let jump_limit = 3.0 * self.params.expected_step;
                if fitness > 0.0 && delta.is_finite() && delta <= jump_limit {
                    (candidate, fitness, rmse)
                } else {
                    warn!(
                        "frame {index}: implausible registration (delta {delta:.2} m, \
                         fitness {fitness:.3}), using motion model"
                    );
                    (self.motion_model(&previous), 0.0, 0.0)
                }
            }
            None => {
                warn!("frame {index}: registration failed, using motion model");
                (self.motion_model(&previous), 0.0, 0.0)
            }
        };

        self.poses.push(pose.clone());
        self.push_window(pose.transform(points));

        OdometryEstimate {
            index,
            pose,
            fitness,
            rmse,
        }
    }

    /// Point-to-plane registration of the frame against the window target.
    /// Returns `None` when no target geometry is available.
    fn register_against_local_map(
        &self,
        points: &PointCloud,
        previous: &Transform,
    ) -> Option<(Transform, f32, f32)> {
        let target = self.build_target()?;

        let mut source = points.downsample(self.params.voxel_size);
        estimate_normals(
            &mut source,
            2.0 * self.params.voxel_size,
            NORMAL_MAX_NN,
        );
        // Warp into the predicted world frame so the correction starts at
        // the identity.
        let source = previous.transform(&source);

        let icp_params = IcpParams {
            max_iterations: 2 * self.params.max_iterations,
            max_correspondence_distance: 2.0 * self.params.max_correspondence_distance,
            estimator: IcpEstimator::PointToPlane,
            ..Default::default()
        };
        let result = Icp::new(icp_params, &target).align(&source);

        let candidate = &result.transform * previous;
        Some((candidate, result.fitness, result.rmse))
    }

    /// Concatenates the window clouds, each capped to the local-map budget,
    /// voxelizes the union, and estimates normals.
    fn build_target(&self) -> Option<PointCloud> {
        if self.window.is_empty() {
            return None;
        }

        let capped: Vec<PointCloud> = self
            .window
            .iter()
            .map(|cloud| PointCloud::new(stride_decimate(&cloud.points, LOCAL_MAP_POINT_CAP)))
            .collect();
        let mut target = PointCloud::concat(&capped.iter().collect::<Vec<_>>())
            .downsample(self.params.voxel_size);
        if target.is_empty() {
            return None;
        }
        estimate_normals(&mut target, 2.0 * self.params.voxel_size, NORMAL_MAX_NN);
        Some(target)
    }

    /// Constant translational velocity, zero angular velocity.
    fn motion_model(&self, previous: &Transform) -> Transform {
        if self.poses.len() >= 2 {
            let velocity =
                previous.translation() - self.poses[self.poses.len() - 2].translation();
            previous.translated(&velocity)
        } else {
            previous.clone()
        }
    }

    fn push_window(&mut self, world_cloud: PointCloud) {
        self.window.push_back(world_cloud);
        while self.window.len() > self.params.window_size {
            self.window.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    /// Scan of two corridor walls and pillars, as seen from `pose`.
    fn scan_from(pose: &Transform) -> PointCloud {
        let mut world = Vec::new();
        for i in 0..240 {
            for j in 0..8 {
                let (x, z) = (i as f32 * 0.1, j as f32 * 0.25);
                world.push(Vector3::new(x, 3.0, z));
                world.push(Vector3::new(x, -3.0, z));
            }
        }
        for p in 0..8 {
            for a in 0..10 {
                for k in 0..10 {
                    let angle = a as f32 * std::f32::consts::TAU / 10.0;
                    world.push(Vector3::new(
                        p as f32 * 3.0 + 0.2 * angle.cos(),
                        1.5 * if p % 2 == 0 { 1.0 } else { -1.0 } + 0.2 * angle.sin(),
                        k as f32 * 0.2,
                    ));
                }
            }
        }

        let inverse = pose.inverse();
        PointCloud::from_vec(
            world
                .into_iter()
                .map(|point| inverse.transform_vector(&point))
                .filter(|point| point.norm() < 12.0)
                .collect(),
        )
    }

    fn pose_at(x: f32) -> Transform {
        Transform::exp(&nalgebra::Vector6::new(x, 0.0, 0.0, 0.0, 0.0, 0.0))
    }

    #[test]
    fn first_frame_anchors_at_identity() {
        let mut odometry = IcpOdometry::new(OdometryParams::default());
        let estimate = odometry.register(&scan_from(&Transform::eye()));
        assert_eq!(estimate.index, 0);
        assert_eq!(estimate.fitness, 1.0);
        assert!(estimate.pose.translation().norm() == 0.0);
    }

    #[test]
    fn identical_frames_stay_in_place() {
        let mut odometry = IcpOdometry::new(OdometryParams::default());
        let scan = scan_from(&Transform::eye());
        odometry.register(&scan);
        let estimate = odometry.register(&scan);
        // Recovered motion stays below twice the registration voxel.
        assert!(estimate.pose.translation().norm() < 0.2, "{estimate:?}");
        assert!(estimate.fitness > 0.5);
    }

    #[test]
    fn tracks_forward_motion() {
        let mut odometry = IcpOdometry::new(OdometryParams::default());
        for i in 0..6 {
            let truth = pose_at(i as f32 * 0.25);
            let estimate = odometry.register(&scan_from(&truth));
            assert!(
                (estimate.pose.translation() - truth.translation()).norm() < 0.25,
                "frame {i}: {estimate:?}"
            );
        }
    }

    #[test]
    fn per_frame_delta_is_bounded_unless_fallback() {
        let mut odometry = IcpOdometry::new(OdometryParams::default());
        let limit = 3.0 * OdometryParams::default().expected_step;
        let mut last = Vector3::zeros();
        for i in 0..5 {
            let estimate = odometry.register(&scan_from(&pose_at(i as f32 * 0.25)));
            let delta = (estimate.pose.translation() - last).norm();
            assert!(estimate.fitness == 0.0 || delta <= limit + 1e-4);
            last = estimate.pose.translation();
        }
    }

    #[test]
    fn jump_engages_motion_model() {
        let mut odometry = IcpOdometry::new(OdometryParams::default());
        for i in 0..4 {
            odometry.register(&scan_from(&pose_at(i as f32 * 0.25)));
        }
        // Frame content jumps 5 m off the corridor floor, far beyond the
        // correspondence radius: no inliers, so the constant-velocity model
        // must stand in.
        let jumped = Transform::exp(&nalgebra::Vector6::new(1.0, 0.0, 5.0, 0.0, 0.0, 0.0));
        let estimate = odometry.register(&scan_from(&jumped));
        assert_eq!(estimate.fitness, 0.0);
        let expected = pose_at(4.0 * 0.25).translation();
        assert!(
            (estimate.pose.translation() - expected).norm() < 0.3,
            "{estimate:?}"
        );

        // The next in-sequence frame recovers without divergence.
        let estimate = odometry.register(&scan_from(&pose_at(5.0 * 0.25)));
        assert!(
            (estimate.pose.translation() - Vector3::new(1.25, 0.0, 0.0)).norm() < 0.5,
            "{estimate:?}"
        );
    }

    #[test]
    fn empty_frame_holds_pose() {
        let mut odometry = IcpOdometry::new(OdometryParams::default());
        odometry.register(&scan_from(&Transform::eye()));
        let estimate = odometry.register(&PointCloud::empty());
        assert_eq!(estimate.fitness, 0.0);
        assert!(estimate.pose.translation().norm() == 0.0);
        assert_eq!(odometry.len(), 2);
    }
}
