use ndarray::{Array2, Axis};
use ordered_float::OrderedFloat;

use crate::pointcloud::PointCloud;

/// Scan-context descriptor parameters: a polar grid of `num_rings` radial
/// bins within `max_range`, split into `num_sectors` angular bins.
#[derive(Debug, Clone, Copy)]
pub struct ScanContextParams {
    pub num_sectors: usize,
    pub num_rings: usize,
    pub max_range: f32,
    pub similarity_threshold: f32,
}

impl Default for ScanContextParams {
    fn default() -> Self {
        Self {
            num_sectors: 60,
            num_rings: 20,
            max_range: 80.0,
            similarity_threshold: 0.1,
        }
    }
}

/// Descriptor-based place recognition: each frame is summarized by the
/// maximum point height per polar bin, and frames match when their
/// descriptors are cosine-similar under some sector rotation.
pub struct ScanContextDetector {
    params: ScanContextParams,
    descriptors: Vec<Array2<f32>>,
}

impl ScanContextDetector {
    pub fn new(params: ScanContextParams) -> Self {
        Self {
            params,
            descriptors: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Computes and stores the descriptor of the next frame. Frames must be
    /// added in index order.
    pub fn add_frame(&mut self, cloud: &PointCloud) {
        self.descriptors.push(self.descriptor(cloud));
    }

    /// The (rings x sectors) max-height polar histogram of a cloud.
    pub fn descriptor(&self, cloud: &PointCloud) -> Array2<f32> {
        let params = &self.params;
        let mut descriptor = Array2::<f32>::zeros((params.num_rings, params.num_sectors));

        for point in cloud.points.iter() {
            let range = point.fixed_rows::<2>(0).norm();
            let angle = point[1].atan2(point[0]);

            let ring = ((range / params.max_range * params.num_rings as f32) as usize)
                .min(params.num_rings - 1);
            let sector = (((angle + std::f32::consts::PI) / std::f32::consts::TAU
                * params.num_sectors as f32) as usize)
                .min(params.num_sectors - 1);

            let bin = &mut descriptor[(ring, sector)];
            *bin = bin.max(point[2]);
        }

        descriptor
    }

    /// Maximum cosine similarity over all cyclic sector shifts, making the
    /// match invariant to the sensor's heading at the revisit.
    pub fn similarity(&self, a: &Array2<f32>, b: &Array2<f32>) -> f32 {
        let norm_a = frobenius(a);
        let norm_b = frobenius(b);
        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }

        let sectors = self.params.num_sectors;
        let mut best = 0.0f32;
        for shift in 0..sectors {
            let mut dot = 0.0;
            for (row_a, row_b) in a.axis_iter(Axis(0)).zip(b.axis_iter(Axis(0))) {
                for s in 0..sectors {
                    dot += row_a[s] * row_b[(s + shift) % sectors];
                }
            }
            best = best.max(dot / (norm_a * norm_b));
        }
        best
    }

    /// Frames similar to `query` (descending similarity), at least `min_gap`
    /// indices away.
    pub fn matches(&self, query: usize, min_gap: usize) -> Vec<(usize, f32)> {
        let query_descriptor = match self.descriptors.get(query) {
            Some(descriptor) => descriptor,
            None => return Vec::new(),
        };

        let mut found: Vec<(usize, f32)> = self
            .descriptors
            .iter()
            .enumerate()
            .filter(|(index, _)| index.abs_diff(query) >= min_gap)
            .filter_map(|(index, descriptor)| {
                let similarity = self.similarity(query_descriptor, descriptor);
                (similarity > self.params.similarity_threshold).then_some((index, similarity))
            })
            .collect();

        found.sort_by_key(|(_, similarity)| std::cmp::Reverse(OrderedFloat(*similarity)));
        found
    }

    /// All candidate pairs (i, j) with j > i whose descriptors match above
    /// the threshold, for downstream ICP verification.
    pub fn candidates(&self, min_gap: usize) -> Vec<(usize, usize)> {
        let mut candidates = Vec::new();
        for i in 0..self.descriptors.len() {
            for j in (i + min_gap.max(1))..self.descriptors.len() {
                let similarity = self.similarity(&self.descriptors[i], &self.descriptors[j]);
                if similarity > self.params.similarity_threshold {
                    candidates.push((i, j));
                }
            }
        }
        candidates
    }
}

fn frobenius(matrix: &Array2<f32>) -> f32 {
    matrix.iter().map(|value| value * value).sum::<f32>().sqrt()
}
