use crate::transform::Transform;

/// An ordered pose chain indexed by frame number.
///
/// Indices are contiguous starting at zero: `poses[i]` maps sensor frame `i`
/// into the world frame. Frame 0 is the anchor at the identity.
#[derive(Clone, Debug, Default)]
pub struct Trajectory {
    pub sensor_to_world: Vec<Transform>,
}

impl Trajectory {
    pub fn new() -> Self {
        Self {
            sensor_to_world: Vec::new(),
        }
    }

    pub fn from_poses(poses: Vec<Transform>) -> Self {
        Self {
            sensor_to_world: poses,
        }
    }

    pub fn push(&mut self, sensor_to_world: Transform) {
        self.sensor_to_world.push(sensor_to_world);
    }

    pub fn len(&self) -> usize {
        self.sensor_to_world.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensor_to_world.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Transform> {
        self.sensor_to_world.get(index)
    }

    pub fn last(&self) -> Option<&Transform> {
        self.sensor_to_world.last()
    }

    /// Relative transform mapping frame `to` coordinates into frame `from`,
    /// i.e. `pose_from^-1 * pose_to`.
    pub fn relative(&self, from: usize, to: usize) -> Option<Transform> {
        let pose_from = self.sensor_to_world.get(from)?;
        let pose_to = self.sensor_to_world.get(to)?;
        Some(&pose_from.inverse() * pose_to)
    }

    /// Sum of consecutive translation deltas.
    pub fn length(&self) -> f32 {
        self.sensor_to_world
            .windows(2)
            .map(|pair| (pair[1].translation() - pair[0].translation()).norm())
            .sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transform> {
        self.sensor_to_world.iter()
    }
}
