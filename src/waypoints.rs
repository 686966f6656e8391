use nalgebra::{Vector2, Vector3};

use crate::trajectory::Trajectory;

#[derive(Debug, Clone, Copy)]
pub struct WaypointParams {
    /// Minimum 2D spacing between consecutive waypoints.
    pub min_distance: f32,
    /// When set, poses whose z deviates from the median z by more than this
    /// are dropped (ground-vehicle filter).
    pub z_band: Option<f32>,
    pub simplify: bool,
    /// Douglas-Peucker tolerance.
    pub tolerance: f32,
}

impl Default for WaypointParams {
    fn default() -> Self {
        Self {
            min_distance: 0.5,
            z_band: None,
            simplify: true,
            tolerance: 0.1,
        }
    }
}

/// Projects an optimized trajectory to a sparse 2D waypoint path.
pub struct WaypointExtractor {
    params: WaypointParams,
}

impl WaypointExtractor {
    pub fn new(params: WaypointParams) -> Self {
        Self { params }
    }

    /// Runs the full chain: spacing filter, optional z-band filter,
    /// optional Douglas-Peucker simplification, then 2D projection.
    ///
    /// The output is non-empty iff the trajectory is non-empty, consecutive
    /// waypoints are distinct, and the endpoints survive every stage except
    /// the z-band filter.
    pub fn extract(&self, trajectory: &Trajectory) -> Vec<Vector2<f32>> {
        let positions: Vec<Vector3<f32>> =
            trajectory.iter().map(|pose| pose.translation()).collect();
        if positions.is_empty() {
            return Vec::new();
        }

        let mut kept = self.filter_by_distance(&positions);
        if let Some(z_band) = self.params.z_band {
            kept = filter_by_z(&kept, z_band);
        }
        if self.params.simplify && kept.len() >= 3 {
            let projected: Vec<Vector2<f32>> = kept.iter().map(|p| p.xy()).collect();
            let indices = douglas_peucker(&projected, self.params.tolerance);
            kept = indices.into_iter().map(|index| kept[index]).collect();
        }

        let mut waypoints: Vec<Vector2<f32>> = Vec::with_capacity(kept.len());
        for position in kept {
            let projected = position.xy();
            if waypoints.last() != Some(&projected) {
                waypoints.push(projected);
            }
        }
        waypoints
    }

    /// Keeps the first position, every position at least `min_distance` (in
    /// 2D) from the last kept one, and always the terminal position.
    fn filter_by_distance(&self, positions: &[Vector3<f32>]) -> Vec<Vector3<f32>> {
        let mut kept = vec![positions[0]];
        for position in &positions[1..] {
            let distance = (position.xy() - kept.last().unwrap().xy()).norm();
            if distance >= self.params.min_distance {
                kept.push(*position);
            }
        }

        // The terminal projection is part of the contract even when it
        // lands inside the spacing radius.
        let terminal = positions[positions.len() - 1];
        if kept.last().map(|last| last.xy()) != Some(terminal.xy()) {
            kept.push(terminal);
        }
        kept
    }
}

fn filter_by_z(positions: &[Vector3<f32>], z_band: f32) -> Vec<Vector3<f32>> {
    if positions.is_empty() {
        return Vec::new();
    }
    let mut heights: Vec<f32> = positions.iter().map(|p| p.z).collect();
    heights.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let median = heights[heights.len() / 2];

    positions
        .iter()
        .filter(|position| (position.z - median).abs() < z_band)
        .cloned()
        .collect()
}

/// Douglas-Peucker polyline simplification. Returns the indices of the kept
/// points, endpoints always included, in ascending order.
pub fn douglas_peucker(points: &[Vector2<f32>], tolerance: f32) -> Vec<usize> {
    if points.len() < 3 {
        return (0..points.len()).collect();
    }

    fn rec(points: &[Vector2<f32>], first: usize, last: usize, tolerance: f32, keep: &mut Vec<usize>) {
        let (mut max_distance, mut max_index) = (0.0f32, first);
        for index in (first + 1)..last {
            let distance = perpendicular_distance(&points[index], &points[first], &points[last]);
            if distance > max_distance {
                max_distance = distance;
                max_index = index;
            }
        }

        if max_distance > tolerance {
            rec(points, first, max_index, tolerance, keep);
            keep.push(max_index);
            rec(points, max_index, last, tolerance, keep);
        }
    }

    let mut keep = vec![0];
    rec(points, 0, points.len() - 1, tolerance, &mut keep);
    keep.push(points.len() - 1);
    keep
}

fn perpendicular_distance(point: &Vector2<f32>, start: &Vector2<f32>, end: &Vector2<f32>) -> f32 {
    let chord = end - start;
    let length = chord.norm();
    if length < 1e-6 {
        return (point - start).norm();
    }
    let offset = point - start;
    (chord.x * offset.y - chord.y * offset.x).abs() / length
}
