use nalgebra::{
    Isometry3, Matrix3, Matrix4, Quaternion, Rotation3, Translation3, UnitQuaternion, UnitVector3,
    Vector3, Vector6,
};
use ndarray::Array1;

use std::ops;

/// A rigid body transform in 3D space.
/// This wraps Isometry3 from nalgebra and provides methods for working with
/// the crate's point cloud and pose graph data structures.
///
/// Poses follow the sensor-to-world convention: `pose[i]` maps coordinates
/// in the sensor frame of frame `i` into the world frame.
#[derive(Clone, Debug)]
pub struct Transform(pub Isometry3<f32>);

impl Default for Transform {
    fn default() -> Self {
        Self::eye()
    }
}

impl Transform {
    /// Create a new transform with zero translation and zero rotation.
    pub fn eye() -> Self {
        Self(Isometry3::<f32>::from_parts(
            Translation3::new(0.0, 0.0, 0.0),
            UnitQuaternion::new(Vector3::<f32>::zeros()),
        ))
    }

    /// Create a new transform from a translation vector and a rotation quaternion.
    pub fn new(xyz: &Vector3<f32>, rotation: &Quaternion<f32>) -> Self {
        Self(Isometry3::<f32>::from_parts(
            Translation3::new(xyz[0], xyz[1], xyz[2]),
            UnitQuaternion::from_quaternion(*rotation),
        ))
    }

    fn exp_so3(omega: &Vector3<f32>) -> (f32, UnitQuaternion<f32>) {
        // https://github.com/strasdat/Sophus/blob/main-1.x/sophus/so3.hpp
        const EPSILON: f32 = 1e-8;
        let theta_sq = omega.norm_squared();

        let (theta, imag_factor, real_factor) = if theta_sq < EPSILON * EPSILON {
            let theta_po4 = theta_sq * theta_sq;
            (
                0.0,
                0.5 - (1.0 / 48.0) * theta_sq + (1.0 / 3840.0) * theta_po4,
                1.0 - (1.0 / 8.0) * theta_sq + (1.0 / 384.0) * theta_po4,
            )
        } else {
            let theta = theta_sq.sqrt();
            let half_theta = 0.5 * theta;
            (theta, half_theta.sin() / theta, half_theta.cos())
        };

        (
            theta,
            UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
                real_factor,
                imag_factor * omega[0],
                imag_factor * omega[1],
                imag_factor * omega[2],
            )),
        )
    }

    /// Exponential map from se(3). The 6D vector is `[x, y, z, rx, ry, rz]`
    /// where x, y, and z are the translation part and rx, ry, and rz are the
    /// rotation part in the form of a scaled axis.
    pub fn exp(xyz_so3: &Vector6<f32>) -> Self {
        const EPSILON: f32 = 1e-8;

        let omega = Vector3::new(xyz_so3[3], xyz_so3[4], xyz_so3[5]);
        let (theta, quat) = Self::exp_so3(&omega);
        let theta_sq = theta * theta;
        let xyz = {
            let left_jacobian = {
                let big_omega = omega.cross_matrix();

                if theta_sq < EPSILON {
                    Matrix3::identity() + (big_omega * 0.5)
                } else {
                    let big_omega_squared = big_omega * big_omega;
                    Matrix3::identity()
                        + (1.0 - theta.cos()) / theta_sq * big_omega
                        + (theta - theta.sin()) / (theta_sq * theta) * big_omega_squared
                }
            };

            left_jacobian * Vector3::new(xyz_so3[0], xyz_so3[1], xyz_so3[2])
        };
        Self(Isometry3::<f32>::from_parts(xyz.into(), quat))
    }

    /// Logarithm map into se(3), the inverse of [`Transform::exp`]. Returns
    /// `[x, y, z, rx, ry, rz]` with the same layout `exp` consumes.
    pub fn log(&self) -> Vector6<f32> {
        const EPSILON: f32 = 1e-8;

        let omega = self.0.rotation.scaled_axis();
        let theta_sq = omega.norm_squared();
        let big_omega = omega.cross_matrix();

        // Inverse of the left Jacobian used in `exp`:
        // V^-1 = I - Omega/2 + a * Omega^2, a = 1/theta^2 - cot(theta/2)/(2 theta).
        let inv_left_jacobian = if theta_sq < EPSILON {
            Matrix3::identity() - big_omega * 0.5 + big_omega * big_omega * (1.0 / 12.0)
        } else {
            let theta = theta_sq.sqrt();
            let half_theta = 0.5 * theta;
            let a = 1.0 / theta_sq - half_theta.cos() / (2.0 * theta * half_theta.sin());
            Matrix3::identity() - big_omega * 0.5 + big_omega * big_omega * a
        };

        let xyz = inv_left_jacobian * self.0.translation.vector;
        Vector6::new(xyz[0], xyz[1], xyz[2], omega[0], omega[1], omega[2])
    }

    /// Create a transform from a 4x4 homogeneous matrix.
    pub fn from_matrix4(matrix: &Matrix4<f32>) -> Self {
        let translation = Translation3::new(matrix[(0, 3)], matrix[(1, 3)], matrix[(2, 3)]);
        let so3 = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix(
            &matrix.fixed_slice::<3, 3>(0, 0).into_owned(),
        ));
        Self(Isometry3::<f32>::from_parts(translation, so3))
    }

    /// Transforms a 3D point.
    pub fn transform_vector(&self, rhs: &Vector3<f32>) -> Vector3<f32> {
        self.0.rotation * rhs + self.0.translation.vector
    }

    /// Transforms a 3D normal, using only the rotation part of the transform.
    pub fn transform_normal(&self, rhs: &Vector3<f32>) -> Vector3<f32> {
        self.0.rotation * rhs
    }

    /// Transforms an array of 3D points of shape (N,). Reuses the array as
    /// the result's storage.
    pub fn transform_vectors(&self, mut rhs: Array1<Vector3<f32>>) -> Array1<Vector3<f32>> {
        for point in rhs.iter_mut() {
            *point = self.transform_vector(point);
        }

        rhs
    }

    /// Transforms an array of 3D normals, i.e., it only uses the rotation
    /// part of the transform.
    pub fn transform_normals(&self, mut rhs: Array1<Vector3<f32>>) -> Array1<Vector3<f32>> {
        for point in rhs.iter_mut() {
            *point = self.transform_normal(point);
        }

        rhs
    }

    /// Inverts the transform.
    pub fn inverse(&self) -> Self {
        Self(self.0.inverse())
    }

    /// Returns the rotation angle in radians.
    pub fn angle(&self) -> f32 {
        self.0.rotation.angle()
    }

    /// Returns the translation part.
    pub fn translation(&self) -> Vector3<f32> {
        self.0.translation.vector
    }

    /// Returns the rotation part.
    pub fn rotation(&self) -> UnitQuaternion<f32> {
        self.0.rotation
    }

    /// Returns a transform with the same rotation and the translation moved
    /// by `offset` in the world frame. Used by the constant-velocity motion
    /// model, which holds angular velocity at zero.
    pub fn translated(&self, offset: &Vector3<f32>) -> Self {
        Self(Isometry3::from_parts(
            Translation3::from(self.0.translation.vector + offset),
            self.0.rotation,
        ))
    }
}

impl ops::Mul<&Transform> for &Transform {
    type Output = Transform;

    /// Composes two transforms, i.e. self * rhs, where rhs is applied first.
    fn mul(self, rhs: &Transform) -> Self::Output {
        Transform(self.0 * rhs.0)
    }
}

impl From<&Transform> for Matrix4<f32> {
    fn from(transform: &Transform) -> Self {
        transform.0.into()
    }
}

impl From<&Matrix4<f32>> for Transform {
    fn from(matrix: &Matrix4<f32>) -> Self {
        Transform::from_matrix4(matrix)
    }
}

pub struct TransformBuilder {
    pub translation: Vector3<f32>,
    pub rotation: UnitQuaternion<f32>,
}

impl Default for TransformBuilder {
    fn default() -> Self {
        Self {
            translation: Vector3::new(0.0, 0.0, 0.0),
            rotation: UnitQuaternion::default(),
        }
    }
}

/// Easy to use builder for transforms.
impl TransformBuilder {
    /// Sets the translation.
    pub fn translation(&mut self, translation: Vector3<f32>) -> &mut Self {
        self.translation = translation;
        self
    }

    /// Sets the rotation from an axis and an angle in radians.
    pub fn axis_angle(&mut self, axis: UnitVector3<f32>, angle: f32) -> &mut Self {
        self.rotation = UnitQuaternion::from_axis_angle(&axis, angle);
        self
    }

    /// Generates a transform from the builder.
    pub fn build(&self) -> Transform {
        Transform(Isometry3::from_parts(
            Translation3::from(self.translation),
            self.rotation,
        ))
    }
}

/// A trait for any object that a transform can map (point clouds, bounds).
pub trait Transformable<Type> {
    fn transform(&self, value: &Type) -> Type;
}

#[cfg(test)]
mod tests {
    use super::Transform;
    use nalgebra::{Isometry3, Matrix4, Translation3, UnitQuaternion, Vector3, Vector4, Vector6};
    use ndarray::array;

    #[test]
    fn test_transform_points() {
        let transform = Transform::eye();
        let points = array![
            Vector3::new(1., 2., 3.),
            Vector3::new(4., 5., 6.),
            Vector3::new(7., 8., 9.)
        ];
        let mult_result = transform.transform_vectors(points.clone());

        assert_eq!(mult_result, points);

        let transform = Transform(Isometry3::from_parts(
            Translation3::<f32>::new(0., 0., 3.),
            UnitQuaternion::<f32>::from_scaled_axis(Vector3::y() * std::f32::consts::PI),
        ));

        let points = transform.transform_vectors(array![Vector3::new(1.0, 2.0, 3.0)]);
        assert!((points[0] - Vector3::new(-1.0, 2.0, 0.0)).norm() < 1e-5);
    }

    #[test]
    fn test_exp() {
        let se3 = Transform::exp(&Vector6::new(1.0, 2.0, 3.0, 0.4, 0.5, 0.3));
        let matrix = Matrix4::from(&se3);
        let test_mult = matrix * Vector4::new(1.0, 2.0, 3.0, 1.0);
        assert!((test_mult - Vector4::new(3.5280778, 2.8378963, 5.8994026, 1.0000)).norm() < 1e-4);
        let test_mult = se3.transform_vector(&Vector3::new(1.0, 2.0, 3.0));
        assert!(
            (test_mult - Vector3::new(3.5280778, 2.8378963, 5.8994026))
                .norm()
                .abs()
                < 1e-5
        );
    }

    #[test]
    fn test_log_inverts_exp() {
        for tangent in [
            Vector6::new(1.0, 2.0, 3.0, 0.4, 0.5, 0.3),
            Vector6::new(0.1, -0.2, 0.05, 0.0, 0.0, 0.0),
            Vector6::new(0.0, 0.0, 0.0, 0.0, 0.0, 1.5),
            Vector6::new(-0.5, 1.0, 0.25, 1e-5, -1e-5, 1e-6),
            Vector6::new(0.0, 0.0, 0.0, 0.0, 0.0, 0.0),
        ] {
            let recovered = Transform::exp(&tangent).log();
            assert!(
                (recovered - tangent).norm() < 1e-4,
                "tangent {tangent:?} recovered as {recovered:?}"
            );
        }
    }

    #[test]
    fn test_quaternion_matrix_round_trip() {
        let pose = Transform::exp(&Vector6::new(0.3, -1.2, 4.0, 0.2, -0.7, 1.1));
        let matrix = Matrix4::from(&pose);
        let back = Matrix4::from(&Transform::from_matrix4(&matrix));
        assert!((matrix - back).norm() < 1e-5);
    }

    #[test]
    fn test_compose() {
        let transform1 = Transform(Isometry3::from_parts(
            Translation3::<f32>::new(0., 0., 3.),
            UnitQuaternion::<f32>::identity(),
        ));
        let transform2 = Transform(Isometry3::from_parts(
            Translation3::<f32>::new(0., 0., 3.),
            UnitQuaternion::<f32>::from_scaled_axis(Vector3::y() * std::f32::consts::PI / 2.0),
        ));

        let transform = &transform1 * &transform2;
        let points = transform.transform_vectors(array![Vector3::new(1.0, 2.0, 3.0)]);
        assert!((points[0] - Vector3::new(3.0, 2.0, 5.0)).norm() < 1e-5);
    }

    #[test]
    fn test_translated_keeps_rotation() {
        let pose = Transform::exp(&Vector6::new(1.0, 0.0, 0.0, 0.0, 0.0, 0.5));
        let moved = pose.translated(&Vector3::new(0.25, 0.0, 0.0));
        assert_eq!(moved.rotation(), pose.rotation());
        assert!(
            (moved.translation() - pose.translation() - Vector3::new(0.25, 0.0, 0.0)).norm() < 1e-6
        );
    }
}
