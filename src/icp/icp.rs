use super::cost_function::CorrespondenceCost;
use super::icp_params::{IcpEstimator, IcpParams};
use crate::{kdtree::R3dTree, optim::GaussNewton, pointcloud::PointCloud, transform::Transform};
use log::debug;
use nalgebra::Vector3;
use num::Float;

/// Outcome of one registration call.
#[derive(Clone, Debug)]
pub struct IcpResult {
    /// Transform mapping the source cloud onto the target cloud.
    pub transform: Transform,
    /// Fraction of source points with a correspondence inside the
    /// correspondence radius at the final transform.
    pub fitness: f32,
    /// Root-mean-square distance over those inlier correspondences.
    pub rmse: f32,
}

impl IcpResult {
    fn failed() -> Self {
        Self {
            transform: Transform::eye(),
            fitness: 0.0,
            rmse: 0.0,
        }
    }
}

/// Iterative Closest Point alignment of a source cloud onto a target cloud.
///
/// The estimator is selectable: point-to-plane for odometry, point-to-point
/// for loop verification.
pub struct Icp<'target_lt> {
    pub params: IcpParams,
    /// Initial transformation to start the algorithm. Default is the identity.
    pub initial_transform: Transform,
    target: &'target_lt PointCloud,
    kdtree: R3dTree,
}

impl<'target_lt> Icp<'target_lt> {
    pub fn new(params: IcpParams, target: &'target_lt PointCloud) -> Self {
        Self {
            params,
            initial_transform: Transform::eye(),
            target,
            kdtree: R3dTree::new(&target.points.view()),
        }
    }

    pub fn with_initial_transform(mut self, initial_transform: Transform) -> Self {
        self.initial_transform = initial_transform;
        self
    }

    /// Aligns the source point cloud to the target point cloud.
    ///
    /// Singular normal equations or an empty correspondence set end the
    /// refinement early; the returned fitness then reflects whatever
    /// transform was best so far (zero when nothing ever matched).
    pub fn align(&self, source: &PointCloud) -> IcpResult {
        if source.is_empty() || self.target.is_empty() {
            return IcpResult::failed();
        }

        let target_normals = match self.params.estimator {
            IcpEstimator::PointToPlane => Some(
                self.target
                    .normals
                    .as_ref()
                    .expect("point-to-plane ICP requires target normals"),
            ),
            IcpEstimator::PointToPoint => None,
        };

        let max_distance_sqr =
            self.params.max_correspondence_distance * self.params.max_correspondence_distance;
        let min_normal_dot = self.params.max_normal_angle.cos().max(0.0);

        let cost = CorrespondenceCost::new(self.params.estimator);
        let mut optim = GaussNewton::<6>::new();

        let mut optim_transform = self.initial_transform.clone();
        let mut best_residual = Float::infinity();
        let mut best_transform = optim_transform.clone();

        for iteration in 0..self.params.max_iterations {
            optim.reset();
            for (index, source_point) in source.points.iter().enumerate() {
                let source_point = optim_transform.transform_vector(source_point);

                let (found_index, found_sqr_distance) = match self.kdtree.nearest(&source_point) {
                    Some(found) => found,
                    None => break,
                };
                if found_sqr_distance > max_distance_sqr {
                    continue;
                }

                let target_point = self.target.points[found_index];
                match self.params.estimator {
                    IcpEstimator::PointToPlane => {
                        let target_normal = target_normals.unwrap()[found_index];
                        if target_normal.norm_squared() == 0.0 {
                            continue;
                        }
                        if let Some(source_normals) = source.normals.as_ref() {
                            let source_normal =
                                optim_transform.transform_normal(&source_normals[index]);
                            if normal_agreement(&source_normal, &target_normal) < min_normal_dot {
                                continue;
                            }
                        }

                        cost.accumulate(
                            &mut optim,
                            &source_point,
                            &target_point,
                            Some(&target_normal),
                        );
                    }
                    IcpEstimator::PointToPoint => {
                        cost.accumulate(&mut optim, &source_point, &target_point, None);
                    }
                }
            }

            let residual = optim.mean_squared_residual();
            if optim.count() > 0 && residual < best_residual {
                best_residual = residual;
                best_transform = optim_transform.clone();
            }

            let update = match optim.solve() {
                Some(update) => update,
                None => {
                    debug!("icp: singular system at iteration {iteration}, stopping");
                    break;
                }
            };
            optim_transform = &Transform::exp(&update) * &optim_transform;

            if update.norm() < 1e-6 {
                best_residual = residual;
                best_transform = optim_transform.clone();
                break;
            }
        }

        let (fitness, rmse) = self.evaluate(source, &best_transform, max_distance_sqr);
        IcpResult {
            transform: best_transform,
            fitness,
            rmse,
        }
    }

    /// Correspondence statistics of `transform` against the target.
    fn evaluate(
        &self,
        source: &PointCloud,
        transform: &Transform,
        max_distance_sqr: f32,
    ) -> (f32, f32) {
        let mut inliers = 0usize;
        let mut squared_sum = 0.0f32;
        for source_point in source.points.iter() {
            let source_point = transform.transform_vector(source_point);
            if let Some((_, sqr_distance)) = self.kdtree.nearest(&source_point) {
                if sqr_distance <= max_distance_sqr {
                    inliers += 1;
                    squared_sum += sqr_distance;
                }
            }
        }

        if inliers == 0 {
            (0.0, 0.0)
        } else {
            (
                inliers as f32 / source.len() as f32,
                (squared_sum / inliers as f32).sqrt(),
            )
        }
    }
}

fn normal_agreement(a: &Vector3<f32>, b: &Vector3<f32>) -> f32 {
    let norms = a.norm() * b.norm();
    if norms == 0.0 {
        // Degenerate normals pass; the residual handles them.
        return 1.0;
    }
    (a.dot(b) / norms).abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normals::estimate_normals;
    use crate::sampling::Downsample;
    use crate::transform::TransformBuilder;
    use nalgebra::{Vector3, Vector6};
    use rstest::*;

    /// Two walls and a pillar: enough structure to lock all six degrees of
    /// freedom.
    #[fixture]
    fn structured_cloud() -> PointCloud {
        let mut points = Vec::new();
        for i in 0..60 {
            for j in 0..20 {
                let (x, z) = (i as f32 * 0.1, j as f32 * 0.1);
                points.push(Vector3::new(x, 2.0, z));
                points.push(Vector3::new(x, -2.0, z));
            }
        }
        for k in 0..40 {
            for a in 0..12 {
                let angle = a as f32 * std::f32::consts::TAU / 12.0;
                points.push(Vector3::new(
                    4.0 + 0.3 * angle.cos(),
                    0.5 + 0.3 * angle.sin(),
                    k as f32 * 0.05,
                ));
            }
        }
        PointCloud::from_vec(points)
    }

    fn with_normals(mut cloud: PointCloud) -> PointCloud {
        estimate_normals(&mut cloud, 0.4, 30);
        cloud
    }

    #[rstest]
    fn point_to_plane_recovers_small_motion(structured_cloud: PointCloud) {
        let target = with_normals(structured_cloud.downsample(0.1));
        let truth = Transform::exp(&Vector6::new(0.08, -0.05, 0.02, 0.0, 0.0, 0.03));
        let source = with_normals(PointCloud::new(
            truth.inverse().transform_vectors(target.points.clone()),
        ));

        let params = IcpParams::default().max_correspondence_distance(1.0);
        let result = Icp::new(params, &target).align(&source);

        let error = &truth.inverse() * &result.transform;
        assert!(error.translation().norm() < 0.05, "{result:?}");
        assert!(error.angle().to_degrees() < 0.5);
        assert!(result.fitness > 0.8);
    }

    #[rstest]
    fn seeded_icp_refines_large_rotation(structured_cloud: PointCloud) {
        let target = structured_cloud.downsample(0.1);
        let truth = TransformBuilder::default()
            .translation(Vector3::new(0.5, 0.0, 0.0))
            .axis_angle(Vector3::z_axis(), std::f32::consts::FRAC_PI_2)
            .build();
        let source = PointCloud::new(truth.inverse().transform_vectors(target.points.clone()));

        // Seed near the truth the way the loop verifier seeds with the pose
        // difference, and let point-to-point ICP tighten it.
        let seed = TransformBuilder::default()
            .translation(Vector3::new(0.45, 0.05, 0.0))
            .axis_angle(Vector3::z_axis(), std::f32::consts::FRAC_PI_2 - 0.03)
            .build();
        let params = IcpParams::default()
            .estimator(IcpEstimator::PointToPoint)
            .max_correspondence_distance(0.5);
        let result = Icp::new(params, &target)
            .with_initial_transform(seed)
            .align(&source);

        let error = &truth.inverse() * &result.transform;
        assert!(error.translation().norm() < 0.05, "{result:?}");
        assert!(error.angle().to_degrees() < 0.5);
    }

    #[rstest]
    fn identical_clouds_align_at_identity(structured_cloud: PointCloud) {
        let target = with_normals(structured_cloud.downsample(0.1));
        let result = Icp::new(IcpParams::default(), &target).align(&target);
        assert!(result.transform.translation().norm() < 1e-3);
        assert!(result.fitness > 0.99);
        assert!(result.rmse < 1e-3);
    }

    #[rstest]
    fn disjoint_clouds_have_zero_fitness(structured_cloud: PointCloud) {
        let target = with_normals(structured_cloud.downsample(0.1));
        let source = PointCloud::new(
            Transform::exp(&Vector6::new(100.0, 0.0, 0.0, 0.0, 0.0, 0.0))
                .transform_vectors(target.points.clone()),
        );
        let result = Icp::new(IcpParams::default(), &target).align(&source);
        assert_eq!(result.fitness, 0.0);
    }

    #[test]
    fn empty_source_fails_cleanly() {
        let target = PointCloud::from_vec(vec![Vector3::zeros()]);
        let result = Icp::new(IcpParams::default(), &target).align(&PointCloud::empty());
        assert_eq!(result.fitness, 0.0);
    }
}
