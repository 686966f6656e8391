/// Residual model used by the registration loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcpEstimator {
    /// Distance from the source point to the tangent plane at its target
    /// correspondence. Needs target normals; used by the odometry path.
    PointToPlane,
    /// Euclidean distance between corresponding points. Used by the loop
    /// verification path.
    PointToPoint,
}

#[derive(Debug, Clone, Copy)]
pub struct IcpParams {
    pub max_iterations: usize,
    /// Correspondences farther than this are discarded.
    pub max_correspondence_distance: f32,
    /// Pairs whose normals disagree by more than this angle (radians) are
    /// discarded. Only meaningful for the point-to-plane estimator when both
    /// clouds carry normals.
    pub max_normal_angle: f32,
    pub estimator: IcpEstimator,
}

impl Default for IcpParams {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            max_correspondence_distance: 0.5,
            max_normal_angle: 1.4,
            estimator: IcpEstimator::PointToPlane,
        }
    }
}

impl IcpParams {
    pub fn max_iterations(mut self, value: usize) -> Self {
        self.max_iterations = value;
        self
    }

    pub fn max_correspondence_distance(mut self, value: f32) -> Self {
        self.max_correspondence_distance = value;
        self
    }

    pub fn estimator(mut self, value: IcpEstimator) -> Self {
        self.estimator = value;
        self
    }
}
