use log::{debug, info};
use nalgebra::Vector3;
use ndarray::Array1;
use rayon::prelude::*;

use crate::kdtree::R3dTree;
use crate::pointcloud::PointCloud;
use crate::sampling::voxel_downsample;
use crate::transform::Transform;

#[derive(Debug, Clone, Copy)]
pub struct MapParams {
    /// Voxel size applied to each frame before merging. Non-positive
    /// disables the per-frame downsampling.
    pub frame_voxel_size: f32,
    /// Voxel size of the fused map.
    pub map_voxel_size: f32,
    /// Neighborhood size for statistical outlier removal.
    pub nb_neighbors: usize,
    /// Points whose mean neighbor distance exceeds mean + ratio * stddev
    /// are removed.
    pub std_ratio: f32,
    /// The accumulated cloud is re-voxelized every this many frames to keep
    /// memory bounded. Zero disables the periodic fuse.
    pub fuse_every: usize,
}

impl Default for MapParams {
    fn default() -> Self {
        Self {
            frame_voxel_size: 0.1,
            map_voxel_size: 0.05,
            nb_neighbors: 20,
            std_ratio: 2.0,
            fuse_every: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MapStatistics {
    pub num_points: usize,
    pub num_frames: usize,
    pub bounds: Option<(Vector3<f32>, Vector3<f32>)>,
}

/// Accumulates posed frames into a single world-frame cloud.
///
/// The global cloud is owned exclusively by the builder; downsampling
/// replaces it by move. `finalize` fuses at the map voxel size and strips
/// statistical outliers.
pub struct MapBuilder {
    params: MapParams,
    global: Vec<Vector3<f32>>,
    frames_added: usize,
    frames_since_fuse: usize,
}

impl MapBuilder {
    pub fn new(params: MapParams) -> Self {
        Self {
            params,
            global: Vec::new(),
            frames_added: 0,
            frames_since_fuse: 0,
        }
    }

    /// Downsamples, transforms, and merges one frame.
    pub fn add_frame(&mut self, cloud: &PointCloud, pose: &Transform) {
        let points = voxel_downsample(&cloud.points, self.params.frame_voxel_size);
        self.merge(pose.transform_vectors(points));
    }

    /// Batch construction: frame transforms run in parallel, the merge is
    /// sequential in frame-index order so results are reproducible.
    pub fn extend(&mut self, clouds: &[PointCloud], poses: &[Transform]) {
        let frame_voxel_size = self.params.frame_voxel_size;
        let transformed: Vec<Array1<Vector3<f32>>> = clouds
            .par_iter()
            .zip(poses.par_iter())
            .map(|(cloud, pose)| {
                pose.transform_vectors(voxel_downsample(&cloud.points, frame_voxel_size))
            })
            .collect();

        for points in transformed {
            self.merge(points);
        }
    }

    fn merge(&mut self, points: Array1<Vector3<f32>>) {
        self.global.extend(points.iter().cloned());
        self.frames_added += 1;
        self.frames_since_fuse += 1;

        if self.params.fuse_every > 0 && self.frames_since_fuse >= self.params.fuse_every {
            self.fuse();
        }
    }

    /// Replaces the global cloud by its voxel downsampling.
    fn fuse(&mut self) {
        let before = self.global.len();
        let fused = voxel_downsample(
            &Array1::from_vec(std::mem::take(&mut self.global)),
            self.params.map_voxel_size,
        );
        self.global = fused.into_raw_vec();
        self.frames_since_fuse = 0;
        debug!("map builder: fused {} points down to {}", before, self.global.len());
    }

    pub fn len(&self) -> usize {
        self.global.len()
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_empty()
    }

    pub fn statistics(&self) -> MapStatistics {
        let bounds = self.global.iter().fold(None, |bounds, point| {
            let (mut low, mut high) =
                bounds.unwrap_or((*point, *point));
            for c in 0..3 {
                low[c] = low[c].min(point[c]);
                high[c] = high[c].max(point[c]);
            }
            Some((low, high))
        });

        MapStatistics {
            num_points: self.global.len(),
            num_frames: self.frames_added,
            bounds,
        }
    }

    /// Final processing: voxel downsample at the map resolution, then drop
    /// statistical outliers. Consumes the builder; the map is done.
    pub fn finalize(self) -> PointCloud {
        let params = self.params;
        let fused = voxel_downsample(&Array1::from_vec(self.global), params.map_voxel_size);
        let cleaned = remove_statistical_outliers(&fused, params.nb_neighbors, params.std_ratio);
        info!(
            "map builder: finalized {} points from {} frames",
            cleaned.len(),
            self.frames_added
        );
        PointCloud::new(cleaned)
    }
}

/// Drops points whose mean distance to their `nb_neighbors` nearest
/// neighbors exceeds the population mean by more than `std_ratio` standard
/// deviations.
pub fn remove_statistical_outliers(
    points: &Array1<Vector3<f32>>,
    nb_neighbors: usize,
    std_ratio: f32,
) -> Array1<Vector3<f32>> {
    if points.len() <= nb_neighbors || nb_neighbors == 0 {
        return points.clone();
    }

    let tree = R3dTree::new(&points.view());
    let mean_distances: Vec<f32> = (0..points.len())
        .into_par_iter()
        .map(|index| {
            // The query point itself comes back at distance zero; skip it.
            let neighbors = tree.knearest(&points[index], nb_neighbors + 1);
            let sum: f32 = neighbors
                .iter()
                .filter(|(found, _)| *found != index)
                .map(|(_, sqr_distance)| sqr_distance.sqrt())
                .sum();
            sum / nb_neighbors as f32
        })
        .collect();

    let mean = mean_distances.iter().sum::<f32>() / mean_distances.len() as f32;
    let variance = mean_distances
        .iter()
        .map(|value| (value - mean) * (value - mean))
        .sum::<f32>()
        / mean_distances.len() as f32;
    let threshold = mean + std_ratio * variance.sqrt();

    Array1::from_iter(
        points
            .iter()
            .zip(mean_distances.iter())
            .filter(|(_, mean_distance)| **mean_distance <= threshold)
            .map(|(point, _)| *point),
    )
}
