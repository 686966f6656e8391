mod cost_function;
mod icp;
mod icp_params;

pub use icp::{Icp, IcpResult};
pub use icp_params::{IcpEstimator, IcpParams};
