use nalgebra::Vector3;
use ndarray::Array1;

use crate::pointcloud::PointCloud;
use crate::sampling::voxel_downsample;

/// Parameters of the per-frame filter chain.
#[derive(Debug, Clone, Copy)]
pub struct PreprocessorParams {
    /// Voxel size for the final downsampling. Non-positive disables it.
    pub voxel_size: f32,
    /// Points closer than this to the sensor are dropped.
    pub min_range: f32,
    /// Points farther than this from the sensor are dropped.
    pub max_range: f32,
    pub remove_ground: bool,
    /// Points with z below this are dropped when `remove_ground` is set.
    pub ground_z: f32,
}

impl Default for PreprocessorParams {
    fn default() -> Self {
        Self {
            voxel_size: 0.1,
            min_range: 0.5,
            max_range: 100.0,
            remove_ground: false,
            ground_z: -1.5,
        }
    }
}

/// Filters one raw frame: drops non-finite points, gates by range, applies
/// the optional ground cut, then voxel-downsamples.
///
/// The output stays in the input's frame of reference. Empty frames are
/// legal and produce empty outputs.
pub struct FramePreprocessor {
    params: PreprocessorParams,
}

impl FramePreprocessor {
    pub fn new(params: PreprocessorParams) -> Self {
        Self { params }
    }

    pub fn filter(&self, points: &Array1<Vector3<f32>>) -> PointCloud {
        let params = &self.params;
        let kept: Vec<Vector3<f32>> = points
            .iter()
            .filter(|point| {
                point.iter().all(|value| value.is_finite()) && {
                    let range = point.norm();
                    range >= params.min_range && range <= params.max_range
                }
            })
            .filter(|point| !params.remove_ground || point[2] > params.ground_z)
            .cloned()
            .collect();

        PointCloud::new(voxel_downsample(&Array1::from_vec(kept), params.voxel_size))
    }
}
