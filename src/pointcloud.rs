use nalgebra::Vector3;
use ndarray::Array1;

use crate::transform::{Transform, Transformable};

/// An unordered point set, optionally carrying per-point normals.
///
/// Points are stored as an `Array1` of `Vector3<f32>` in whatever frame the
/// producer used: sensor-local for raw frames, world for local-map and
/// global-map clouds.
#[derive(Clone, Debug)]
pub struct PointCloud {
    pub points: Array1<Vector3<f32>>,
    pub normals: Option<Array1<Vector3<f32>>>,
}

impl PointCloud {
    pub fn new(points: Array1<Vector3<f32>>) -> Self {
        Self {
            points,
            normals: None,
        }
    }

    pub fn empty() -> Self {
        Self::new(Array1::from_vec(Vec::new()))
    }

    pub fn from_vec(points: Vec<Vector3<f32>>) -> Self {
        Self::new(Array1::from_vec(points))
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Concatenates the given clouds into one. Normals are dropped; the
    /// consumers that need them re-estimate on the merged geometry.
    pub fn concat(clouds: &[&PointCloud]) -> Self {
        let total = clouds.iter().map(|cloud| cloud.len()).sum();
        let mut points = Vec::with_capacity(total);
        for cloud in clouds {
            points.extend(cloud.points.iter().cloned());
        }
        Self::from_vec(points)
    }
}

impl Transformable<PointCloud> for Transform {
    /// Maps a cloud into another frame: points by the full transform,
    /// normals by the rotation only.
    fn transform(&self, value: &PointCloud) -> PointCloud {
        PointCloud {
            points: self.transform_vectors(value.points.clone()),
            normals: value
                .normals
                .as_ref()
                .map(|normals| self.transform_normals(normals.clone())),
        }
    }
}
