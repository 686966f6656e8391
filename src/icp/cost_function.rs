use nalgebra::Vector3;

use super::icp_params::IcpEstimator;
use crate::optim::GaussNewton;

/// Accumulates correspondence residuals into the normal equations for the
/// active estimator.
///
/// Both estimators reduce to the same row shape: a signed offset along a
/// direction `n`, whose Jacobian with respect to a left-multiplied se(3)
/// increment is `[n, p × n]` for a source point `p`. Point-to-plane emits
/// one row along the target normal; point-to-point emits three rows along
/// the coordinate axes.
pub struct CorrespondenceCost {
    estimator: IcpEstimator,
}

impl CorrespondenceCost {
    pub fn new(estimator: IcpEstimator) -> Self {
        Self { estimator }
    }

    /// Adds one source/target correspondence. `source_point` is the source
    /// point already mapped by the current transform; `target_normal` is
    /// required by the point-to-plane estimator and ignored otherwise.
    pub fn accumulate(
        &self,
        optim: &mut GaussNewton<6>,
        source_point: &Vector3<f32>,
        target_point: &Vector3<f32>,
        target_normal: Option<&Vector3<f32>>,
    ) {
        let offset = target_point - source_point;
        match self.estimator {
            IcpEstimator::PointToPlane => {
                let normal = match target_normal {
                    Some(normal) => normal,
                    None => return,
                };
                let (residual, jacobian) = residual_row(normal, &offset, source_point);
                optim.step(residual, &jacobian);
            }
            IcpEstimator::PointToPoint => {
                for axis in [Vector3::x(), Vector3::y(), Vector3::z()] {
                    let (residual, jacobian) = residual_row(&axis, &offset, source_point);
                    optim.step(residual, &jacobian);
                }
            }
        }
    }
}

/// One scalar row: the offset component along `direction`, with the se(3)
/// Jacobian `[n, p × n]`.
fn residual_row(
    direction: &Vector3<f32>,
    offset: &Vector3<f32>,
    source_point: &Vector3<f32>,
) -> (f32, [f32; 6]) {
    let twist = source_point.cross(direction);
    (
        offset.dot(direction),
        [
            direction[0],
            direction[1],
            direction[2],
            twist[0],
            twist[1],
            twist[2],
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plane_row_is_signed_plane_distance() {
        let source = Vector3::new(0.0, 0.0, 1.0);
        let target = Vector3::new(0.0, 0.0, 3.0);
        let normal = Vector3::new(0.0, 0.0, 1.0);
        let (residual, jacobian) = residual_row(&normal, &(target - source), &source);
        assert!((residual - 2.0).abs() < 1e-6);
        assert_eq!(&jacobian[0..3], &[0.0, 0.0, 1.0]);
    }

    #[test]
    fn axis_rows_carry_the_cross_product_twist() {
        let source = Vector3::new(1.0, 0.0, 0.0);
        let offset = Vector3::new(1.0, 1.0, -1.0);

        let (residual_x, jacobian_x) = residual_row(&Vector3::x(), &offset, &source);
        assert!((residual_x - 1.0).abs() < 1e-6);
        assert_eq!(&jacobian_x[3..6], &[0.0, 0.0, 0.0]);

        // Rotation part of the y-axis row is p × e_y.
        let (residual_y, jacobian_y) = residual_row(&Vector3::y(), &offset, &source);
        assert!((residual_y - 1.0).abs() < 1e-6);
        assert_eq!(&jacobian_y[3..6], &[0.0, 0.0, 1.0]);
    }

    #[test]
    fn point_to_plane_without_normal_contributes_nothing() {
        let mut optim = GaussNewton::<6>::new();
        let cost = CorrespondenceCost::new(IcpEstimator::PointToPlane);
        cost.accumulate(&mut optim, &Vector3::zeros(), &Vector3::x(), None);
        assert_eq!(optim.count(), 0);
    }

    #[test]
    fn estimators_emit_one_and_three_rows() {
        let source = Vector3::new(0.5, -0.25, 2.0);
        let target = Vector3::new(0.75, 0.0, 2.0);
        let normal = Vector3::new(1.0, 0.0, 0.0);

        let mut optim = GaussNewton::<6>::new();
        CorrespondenceCost::new(IcpEstimator::PointToPlane).accumulate(
            &mut optim,
            &source,
            &target,
            Some(&normal),
        );
        assert_eq!(optim.count(), 1);

        let mut optim = GaussNewton::<6>::new();
        CorrespondenceCost::new(IcpEstimator::PointToPoint).accumulate(
            &mut optim,
            &source,
            &target,
            None,
        );
        assert_eq!(optim.count(), 3);
    }
}
