//! f64 exp/log maps used inside the optimizer. The public `Transform` type
//! stays f32; the solver promotes to f64 at its boundary the same way the
//! Gauss-Newton accumulator promotes before factorizing.

use nalgebra::{Isometry3, Matrix3, Translation3, UnitQuaternion, Vector3, Vector6};

const EPSILON: f64 = 1e-12;

pub fn exp(tangent: &Vector6<f64>) -> Isometry3<f64> {
    let omega = Vector3::new(tangent[3], tangent[4], tangent[5]);
    let theta_sq = omega.norm_squared();
    let rotation = UnitQuaternion::from_scaled_axis(omega);

    let big_omega = omega.cross_matrix();
    let left_jacobian = if theta_sq < EPSILON {
        Matrix3::identity() + big_omega * 0.5
    } else {
        let theta = theta_sq.sqrt();
        Matrix3::identity()
            + big_omega * ((1.0 - theta.cos()) / theta_sq)
            + big_omega * big_omega * ((theta - theta.sin()) / (theta_sq * theta))
    };

    let xyz = left_jacobian * Vector3::new(tangent[0], tangent[1], tangent[2]);
    Isometry3::from_parts(Translation3::from(xyz), rotation)
}

pub fn log(isometry: &Isometry3<f64>) -> Vector6<f64> {
    let omega = isometry.rotation.scaled_axis();
    let theta_sq = omega.norm_squared();
    let big_omega = omega.cross_matrix();

    let inv_left_jacobian = if theta_sq < EPSILON {
        Matrix3::identity() - big_omega * 0.5 + big_omega * big_omega * (1.0 / 12.0)
    } else {
        let theta = theta_sq.sqrt();
        let half_theta = 0.5 * theta;
        let a = 1.0 / theta_sq - half_theta.cos() / (2.0 * theta * half_theta.sin());
        Matrix3::identity() - big_omega * 0.5 + big_omega * big_omega * a
    };

    let xyz = inv_left_jacobian * isometry.translation.vector;
    Vector6::new(xyz[0], xyz[1], xyz[2], omega[0], omega[1], omega[2])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_inverts_exp() {
        for tangent in [
            Vector6::new(1.0, -2.0, 0.5, 0.3, -0.2, 0.9),
            Vector6::new(0.0, 0.0, 0.0, 0.0, 0.0, 0.0),
            Vector6::new(1e-9, 0.0, 1e-9, 1e-10, 0.0, 0.0),
            Vector6::new(2.0, 1.0, -3.0, 0.0, 0.0, 3.0),
        ] {
            let recovered = log(&exp(&tangent));
            assert!(
                (recovered - tangent).norm() < 1e-9,
                "tangent {tangent:?} recovered as {recovered:?}"
            );
        }
    }
}
