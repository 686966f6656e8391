use nalgebra::Vector3;
use ndarray::Array1;
use std::collections::BTreeMap;

use crate::pointcloud::PointCloud;

/// Voxel-grid downsampling: partitions space into cubes of `voxel_size` and
/// keeps the centroid of each occupied cell.
///
/// Cells are emitted in sorted key order, so the output is deterministic for
/// a given input. A non-positive `voxel_size` returns the input unchanged.
pub fn voxel_downsample(points: &Array1<Vector3<f32>>, voxel_size: f32) -> Array1<Vector3<f32>> {
    if voxel_size <= 0.0 || points.is_empty() {
        return points.clone();
    }

    let mut cells: BTreeMap<(i32, i32, i32), (Vector3<f32>, u32)> = BTreeMap::new();
    for point in points.iter() {
        let key = (
            (point[0] / voxel_size).floor() as i32,
            (point[1] / voxel_size).floor() as i32,
            (point[2] / voxel_size).floor() as i32,
        );
        let cell = cells.entry(key).or_insert((Vector3::zeros(), 0));
        cell.0 += point;
        cell.1 += 1;
    }

    Array1::from_iter(cells.values().map(|(sum, count)| sum / *count as f32))
}

/// Keeps every n-th point so that at most `max_points` survive. Cheap
/// decimation for clouds that only feed a registration target.
pub fn stride_decimate(points: &Array1<Vector3<f32>>, max_points: usize) -> Array1<Vector3<f32>> {
    if max_points == 0 || points.len() <= max_points {
        return points.clone();
    }
    let step = (points.len() + max_points - 1) / max_points;
    Array1::from_iter(points.iter().step_by(step).cloned())
}

pub trait Downsample {
    type Output;
    fn downsample(&self, voxel_size: f32) -> Self::Output;
}

impl Downsample for PointCloud {
    type Output = PointCloud;

    /// Voxel-downsamples the cloud. Normals are dropped since the centroid
    /// representatives no longer correspond to the original surface samples.
    fn downsample(&self, voxel_size: f32) -> PointCloud {
        PointCloud::new(voxel_downsample(&self.points, voxel_size))
    }
}
