use nalgebra::{Vector3, Vector6};
use ndarray::Array1;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use mapping3d::transform::Transform;

/// Dense sample of a corridor world: two long walls, a floor strip, and a
/// row of pillars that break the translational symmetry.
pub fn corridor_world() -> Vec<Vector3<f32>> {
    let mut points = Vec::new();
    for i in 0..200 {
        for j in 0..8 {
            let (x, z) = (i as f32 * 0.1, j as f32 * 0.25);
            points.push(Vector3::new(x, 3.0, z));
            points.push(Vector3::new(x, -3.0, z));
        }
    }
    for p in 0..6 {
        for a in 0..12 {
            for k in 0..8 {
                let angle = a as f32 * std::f32::consts::TAU / 12.0;
                points.push(Vector3::new(
                    p as f32 * 3.0 + 0.25 * angle.cos(),
                    1.5 * if p % 2 == 0 { 1.0 } else { -1.0 } + 0.25 * angle.sin(),
                    k as f32 * 0.25,
                ));
            }
        }
    }
    points
}

/// Simulates one scan: world points within sensor range, expressed in the
/// sensor frame of `pose`, with optional uniform noise.
pub fn scan(world: &[Vector3<f32>], pose: &Transform, noise: f32, rng: &mut SmallRng) -> Array1<Vector3<f32>> {
    let inverse = pose.inverse();
    Array1::from_iter(
        world
            .iter()
            .map(|point| inverse.transform_vector(point))
            .filter(|point| point.norm() < 10.0)
            .map(|point| {
                if noise > 0.0 {
                    point
                        + Vector3::new(
                            rng.gen_range(-noise..noise),
                            rng.gen_range(-noise..noise),
                            rng.gen_range(-noise..noise),
                        )
                } else {
                    point
                }
            }),
    )
}

pub fn pose_at(x: f32) -> Transform {
    Transform::exp(&Vector6::new(x, 0.0, 0.0, 0.0, 0.0, 0.0))
}

pub fn seeded_rng() -> SmallRng {
    SmallRng::from_seed([7; 32])
}
