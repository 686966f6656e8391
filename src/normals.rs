use nalgebra::{Matrix3, Vector3};
use ndarray::Array1;
use rayon::prelude::*;

use crate::kdtree::R3dTree;
use crate::pointcloud::PointCloud;

/// Minimum neighborhood size for a meaningful plane fit.
const MIN_NEIGHBORS: usize = 3;

/// Estimates per-point normals by PCA over a hybrid radius/KNN neighborhood:
/// at most `max_nn` neighbors within `radius` of each point.
///
/// The normal is the eigenvector of the neighborhood covariance with the
/// smallest eigenvalue. Signs are not made globally consistent; the
/// point-to-plane cost is invariant to them. Points with fewer than three
/// neighbors get a zero normal, which contributes nothing to registration.
pub fn estimate_normals(cloud: &mut PointCloud, radius: f32, max_nn: usize) {
    if cloud.is_empty() {
        cloud.normals = Some(Array1::from_vec(Vec::new()));
        return;
    }

    let tree = R3dTree::new(&cloud.points.view());
    let points = &cloud.points;

    let normals: Vec<Vector3<f32>> = (0..points.len())
        .into_par_iter()
        .map(|i| {
            let neighbors = tree.radius_knearest(&points[i], radius, max_nn);
            if neighbors.len() < MIN_NEIGHBORS {
                return Vector3::zeros();
            }

            let mut centroid = Vector3::zeros();
            for (j, _) in &neighbors {
                centroid += points[*j];
            }
            centroid /= neighbors.len() as f32;

            let mut covariance = Matrix3::zeros();
            for (j, _) in &neighbors {
                let d = points[*j] - centroid;
                covariance += d * d.transpose();
            }

            smallest_eigenvector(&covariance)
        })
        .collect();

    cloud.normals = Some(Array1::from_vec(normals));
}

fn smallest_eigenvector(matrix: &Matrix3<f32>) -> Vector3<f32> {
    let eigen = matrix.symmetric_eigen();
    let mut min_index = 0;
    for i in 1..3 {
        if eigen.eigenvalues[i] < eigen.eigenvalues[min_index] {
            min_index = i;
        }
    }
    let normal = eigen.eigenvectors.column(min_index).into_owned();
    let norm = normal.norm();
    if norm > 0.0 {
        normal / norm
    } else {
        Vector3::zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointcloud::PointCloud;
    use nalgebra::Vector3;

    fn grid_plane() -> PointCloud {
        let mut points = Vec::new();
        for x in 0..20 {
            for y in 0..20 {
                points.push(Vector3::new(x as f32 * 0.05, y as f32 * 0.05, 0.0));
            }
        }
        PointCloud::from_vec(points)
    }

    #[test]
    fn plane_normals_point_along_z() {
        let mut cloud = grid_plane();
        estimate_normals(&mut cloud, 0.2, 30);
        let normals = cloud.normals.as_ref().unwrap();
        assert_eq!(normals.len(), cloud.len());
        for normal in normals.iter() {
            assert!(
                normal[2].abs() > 0.99,
                "expected +-Z normal, got {normal:?}"
            );
        }
    }

    #[test]
    fn sparse_points_get_zero_normals() {
        let mut cloud = PointCloud::from_vec(vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(100.0, 0.0, 0.0),
        ]);
        estimate_normals(&mut cloud, 0.5, 30);
        let normals = cloud.normals.as_ref().unwrap();
        assert!(normals.iter().all(|n| n.norm() == 0.0));
    }

    #[test]
    fn empty_cloud_gets_empty_normals() {
        let mut cloud = PointCloud::empty();
        estimate_normals(&mut cloud, 0.2, 30);
        assert!(cloud.normals.as_ref().unwrap().is_empty());
    }
}
