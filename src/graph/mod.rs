//! Pose graph over SE(3) with prior, odometry, and loop-closure factors,
//! optimized by damped Gauss-Newton (Levenberg-Marquardt).

mod se3;

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};
use nalgebra::{Cholesky, DMatrix, DVector, Isometry3, Matrix6, Vector6};

use crate::transform::Transform;

/// Source of a between constraint; only affects bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactorKind {
    Odometry,
    Loop,
}

#[derive(Debug)]
pub enum GraphError {
    /// No prior factor: the graph gauge is free.
    MissingPrior,
    /// A factor references a vertex without an initial estimate.
    MissingInitial(usize),
    /// A vertex has an initial estimate but no factor constrains it.
    IsolatedVertex(usize),
}

impl std::fmt::Display for GraphError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            GraphError::MissingPrior => write!(f, "pose graph has no prior factor"),
            GraphError::MissingInitial(vertex) => {
                write!(f, "vertex {vertex} appears in a factor but has no initial estimate")
            }
            GraphError::IsolatedVertex(vertex) => {
                write!(f, "vertex {vertex} is not constrained by any factor")
            }
        }
    }
}

impl std::error::Error for GraphError {}

struct BetweenFactor {
    from: usize,
    to: usize,
    /// Measured relative pose mapping frame `to` coordinates into `from`.
    measurement: Isometry3<f64>,
    information: Vector6<f64>,
    kind: FactorKind,
}

struct PriorFactor {
    vertex: usize,
    pose: Isometry3<f64>,
    information: Vector6<f64>,
}

/// Result of an optimization run. Non-convergence is not fatal: the best
/// estimates so far are returned with `converged` unset.
#[derive(Clone, Debug)]
pub struct OptimizeReport {
    pub poses: BTreeMap<usize, Transform>,
    pub converged: bool,
    pub iterations: usize,
    pub final_cost: f64,
}

/// Default sigmas, rotation xyz in radians then translation xyz in meters.
pub const DEFAULT_ODOMETRY_SIGMAS: [f32; 6] = [0.1, 0.1, 0.1, 0.05, 0.05, 0.05];
pub const DEFAULT_LOOP_SIGMAS: [f32; 6] = [0.2, 0.2, 0.2, 0.1, 0.1, 0.1];
pub const DEFAULT_PRIOR_SIGMAS: [f32; 6] = [0.01, 0.01, 0.01, 0.01, 0.01, 0.01];

pub struct PoseGraph {
    initial: BTreeMap<usize, Isometry3<f64>>,
    betweens: Vec<BetweenFactor>,
    prior: Option<PriorFactor>,
}

impl Default for PoseGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl PoseGraph {
    pub fn new() -> Self {
        Self {
            initial: BTreeMap::new(),
            betweens: Vec::new(),
            prior: None,
        }
    }

    /// Pins `vertex` to `pose`. Expected exactly once, at vertex 0.
    pub fn add_prior(&mut self, vertex: usize, pose: &Transform, sigmas: &[f32; 6]) {
        if self.prior.is_some() {
            warn!("replacing existing prior factor");
        }
        self.prior = Some(PriorFactor {
            vertex,
            pose: pose.0.cast::<f64>(),
            information: information_from_sigmas(sigmas),
        });
    }

    /// Registers the initial estimate for a vertex. Later calls for the same
    /// vertex are ignored.
    pub fn add_initial(&mut self, vertex: usize, pose: &Transform) {
        self.initial.entry(vertex).or_insert_with(|| pose.0.cast::<f64>());
    }

    /// Adds a between constraint: `measurement` is the relative pose
    /// `pose_from^-1 * pose_to`.
    pub fn add_between(
        &mut self,
        from: usize,
        to: usize,
        measurement: &Transform,
        sigmas: &[f32; 6],
        kind: FactorKind,
    ) {
        self.betweens.push(BetweenFactor {
            from,
            to,
            measurement: measurement.0.cast::<f64>(),
            information: information_from_sigmas(sigmas),
            kind,
        });
    }

    /// Builds the standard odometry graph: prior at vertex 0, one initial
    /// estimate per pose, and a chain of consecutive between factors.
    pub fn from_odometry(
        poses: &[Transform],
        odometry_sigmas: &[f32; 6],
        prior_sigmas: &[f32; 6],
    ) -> Self {
        let mut graph = Self::new();
        if poses.is_empty() {
            return graph;
        }

        graph.add_prior(0, &poses[0], prior_sigmas);
        graph.add_initial(0, &poses[0]);
        for (index, pair) in poses.windows(2).enumerate() {
            let relative = &pair[0].inverse() * &pair[1];
            graph.add_between(index, index + 1, &relative, odometry_sigmas, FactorKind::Odometry);
            graph.add_initial(index + 1, &pair[1]);
        }
        graph
    }

    pub fn len(&self) -> usize {
        self.initial.len()
    }

    pub fn is_empty(&self) -> bool {
        self.initial.is_empty()
    }

    pub fn num_factors_of(&self, kind: FactorKind) -> usize {
        self.betweens.iter().filter(|f| f.kind == kind).count()
    }

    /// Optimizes all vertices and returns the estimates.
    ///
    /// Fails only on structural defects (no prior, missing initial,
    /// isolated vertex); hitting the iteration cap returns the current
    /// estimates with `converged: false`.
    pub fn optimize(&self, max_iterations: usize) -> Result<OptimizeReport, GraphError> {
        self.validate()?;
        let prior = self.prior.as_ref().expect("validated above");

        let offsets: BTreeMap<usize, usize> = self
            .initial
            .keys()
            .enumerate()
            .map(|(slot, vertex)| (*vertex, slot))
            .collect();
        let mut states: Vec<Isometry3<f64>> = self.initial.values().cloned().collect();
        let dim = 6 * states.len();

        let mut cost = self.cost(&states, &offsets, prior);
        let mut lambda = 1e-4;
        let mut converged = cost < 1e-18;
        let mut iterations = 0;

        while iterations < max_iterations && !converged {
            iterations += 1;
            let (hessian, gradient) = self.assemble(&states, &offsets, prior, dim);

            // Retry the step with stronger damping until the factorization
            // succeeds and the cost drops.
            let mut stepped = false;
            while lambda <= 1e12 {
                let mut damped = hessian.clone();
                for i in 0..dim {
                    let diagonal = hessian[(i, i)].max(1e-12);
                    damped[(i, i)] += lambda * diagonal;
                }

                let factorization = match Cholesky::new(damped) {
                    Some(factorization) => factorization,
                    None => {
                        lambda *= 10.0;
                        continue;
                    }
                };
                let delta = factorization.solve(&(-&gradient));

                let candidates: Vec<Isometry3<f64>> = states
                    .iter()
                    .enumerate()
                    .map(|(slot, state)| {
                        let tangent = delta.fixed_rows::<6>(slot * 6).into_owned();
                        state * se3::exp(&tangent)
                    })
                    .collect();
                let new_cost = self.cost(&candidates, &offsets, prior);

                let relative = (cost - new_cost).abs() / cost.max(1e-30);
                if new_cost < cost {
                    states = candidates;
                    cost = new_cost;
                    lambda = (lambda * 0.5).max(1e-12);
                    stepped = true;
                    if relative < 1e-6 {
                        converged = true;
                    }
                    break;
                }
                if relative < 1e-6 {
                    // The cost cannot improve further: the step neither
                    // helps nor hurts beyond the termination tolerance.
                    converged = true;
                    stepped = true;
                    break;
                }
                lambda *= 10.0;
            }

            if !stepped {
                debug!("optimizer stalled at cost {cost:.6e} after {iterations} iterations");
                break;
            }
        }

        if !converged {
            warn!("pose graph optimization stopped without convergence (cost {cost:.6e})");
        }

        let poses = offsets
            .iter()
            .map(|(vertex, slot)| (*vertex, Transform(states[*slot].cast::<f32>())))
            .collect();
        Ok(OptimizeReport {
            poses,
            converged,
            iterations,
            final_cost: cost,
        })
    }

    fn validate(&self) -> Result<(), GraphError> {
        let prior = self.prior.as_ref().ok_or(GraphError::MissingPrior)?;
        if !self.initial.contains_key(&prior.vertex) {
            return Err(GraphError::MissingInitial(prior.vertex));
        }

        let mut constrained: BTreeSet<usize> = BTreeSet::new();
        constrained.insert(prior.vertex);
        for factor in &self.betweens {
            for vertex in [factor.from, factor.to] {
                if !self.initial.contains_key(&vertex) {
                    return Err(GraphError::MissingInitial(vertex));
                }
                constrained.insert(vertex);
            }
        }
        for vertex in self.initial.keys() {
            if !constrained.contains(vertex) {
                return Err(GraphError::IsolatedVertex(*vertex));
            }
        }
        Ok(())
    }

    fn cost(
        &self,
        states: &[Isometry3<f64>],
        offsets: &BTreeMap<usize, usize>,
        prior: &PriorFactor,
    ) -> f64 {
        let mut cost = 0.0;
        for factor in &self.betweens {
            let residual = between_residual(
                &states[offsets[&factor.from]],
                &states[offsets[&factor.to]],
                &factor.measurement,
            );
            cost += weighted_norm(&residual, &factor.information);
        }
        let residual = prior_residual(&states[offsets[&prior.vertex]], &prior.pose);
        cost += weighted_norm(&residual, &prior.information);
        cost
    }

    fn assemble(
        &self,
        states: &[Isometry3<f64>],
        offsets: &BTreeMap<usize, usize>,
        prior: &PriorFactor,
        dim: usize,
    ) -> (DMatrix<f64>, DVector<f64>) {
        let mut hessian = DMatrix::<f64>::zeros(dim, dim);
        let mut gradient = DVector::<f64>::zeros(dim);

        for factor in &self.betweens {
            let slot_i = offsets[&factor.from];
            let slot_j = offsets[&factor.to];
            let x_i = &states[slot_i];
            let x_j = &states[slot_j];

            let residual = between_residual(x_i, x_j, &factor.measurement);
            let jacobian_i =
                numeric_jacobian(x_i, |x| between_residual(x, x_j, &factor.measurement));
            let jacobian_j =
                numeric_jacobian(x_j, |x| between_residual(x_i, x, &factor.measurement));

            scatter(
                &mut hessian,
                &mut gradient,
                &[(slot_i, jacobian_i), (slot_j, jacobian_j)],
                &residual,
                &factor.information,
            );
        }

        let slot = offsets[&prior.vertex];
        let x = &states[slot];
        let residual = prior_residual(x, &prior.pose);
        let jacobian = numeric_jacobian(x, |x| prior_residual(x, &prior.pose));
        scatter(
            &mut hessian,
            &mut gradient,
            &[(slot, jacobian)],
            &residual,
            &prior.information,
        );

        (hessian, gradient)
    }
}

/// `log((x_i^-1 x_j) * measurement^-1)`: zero when the estimated relative
/// pose matches the measurement.
fn between_residual(
    x_i: &Isometry3<f64>,
    x_j: &Isometry3<f64>,
    measurement: &Isometry3<f64>,
) -> Vector6<f64> {
    se3::log(&(x_i.inverse() * x_j * measurement.inverse()))
}

fn prior_residual(x: &Isometry3<f64>, prior: &Isometry3<f64>) -> Vector6<f64> {
    se3::log(&(prior.inverse() * x))
}

/// Central-difference Jacobian with respect to a right perturbation of `x`.
fn numeric_jacobian<F>(x: &Isometry3<f64>, residual: F) -> Matrix6<f64>
where
    F: Fn(&Isometry3<f64>) -> Vector6<f64>,
{
    const STEP: f64 = 1e-6;
    let mut jacobian = Matrix6::zeros();
    for k in 0..6 {
        let mut tangent = Vector6::zeros();
        tangent[k] = STEP;
        let plus = residual(&(x * se3::exp(&tangent)));
        tangent[k] = -STEP;
        let minus = residual(&(x * se3::exp(&tangent)));
        jacobian.set_column(k, &((plus - minus) / (2.0 * STEP)));
    }
    jacobian
}

fn weighted_norm(residual: &Vector6<f64>, information: &Vector6<f64>) -> f64 {
    residual.component_mul(information).dot(residual)
}

/// Scatters one factor's contribution into the normal equations.
fn scatter(
    hessian: &mut DMatrix<f64>,
    gradient: &mut DVector<f64>,
    blocks: &[(usize, Matrix6<f64>)],
    residual: &Vector6<f64>,
    information: &Vector6<f64>,
) {
    let weight = Matrix6::from_diagonal(information);
    for (slot_a, jacobian_a) in blocks {
        let weighted = jacobian_a.transpose() * weight;
        for (slot_b, jacobian_b) in blocks {
            let mut block = hessian.slice_mut((slot_a * 6, slot_b * 6), (6, 6));
            block += weighted * jacobian_b;
        }
        let mut rows = gradient.rows_mut(slot_a * 6, 6);
        rows += weighted * residual;
    }
}

fn information_from_sigmas(sigmas: &[f32; 6]) -> Vector6<f64> {
    // Configuration order is rotation xyz then translation xyz; the residual
    // tangent is translation first.
    let inv_sq = |sigma: f32| 1.0 / (sigma as f64 * sigma as f64);
    Vector6::new(
        inv_sq(sigmas[3]),
        inv_sq(sigmas[4]),
        inv_sq(sigmas[5]),
        inv_sq(sigmas[0]),
        inv_sq(sigmas[1]),
        inv_sq(sigmas[2]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::Transform;
    use nalgebra::Vector6 as V6;

    fn pose(x: f32, y: f32, yaw: f32) -> Transform {
        &Transform::exp(&V6::new(x, y, 0.0, 0.0, 0.0, 0.0))
            * &Transform::exp(&V6::new(0.0, 0.0, 0.0, 0.0, 0.0, yaw))
    }

    #[test]
    fn consistent_odometry_stays_put() {
        let poses: Vec<Transform> = (0..10).map(|i| pose(i as f32, 0.0, 0.0)).collect();
        let graph = PoseGraph::from_odometry(
            &poses,
            &DEFAULT_ODOMETRY_SIGMAS,
            &DEFAULT_PRIOR_SIGMAS,
        );
        let report = graph.optimize(50).unwrap();

        assert!(report.converged);
        for (index, original) in poses.iter().enumerate() {
            let optimized = &report.poses[&index];
            assert!(
                (optimized.translation() - original.translation()).norm() < 1e-3,
                "vertex {index} moved"
            );
        }
    }

    #[test]
    fn loop_closure_pulls_drifted_chain_together() {
        // Ten poses around a square revisiting the start, with translation
        // drift injected into the odometry.
        let n = 20;
        let truth: Vec<Transform> = (0..n)
            .map(|i| {
                let angle = i as f32 / n as f32 * std::f32::consts::TAU;
                pose(2.0 * angle.cos(), 2.0 * angle.sin(), 0.0)
            })
            .collect();

        let mut drifted = vec![truth[0].clone()];
        for i in 1..n {
            let relative = &truth[i - 1].inverse() * &truth[i];
            // 2 cm of forward drift per step.
            let noisy = &relative * &Transform::exp(&V6::new(0.02, 0.0, 0.0, 0.0, 0.0, 0.0));
            drifted.push(&drifted[i - 1].clone() * &noisy);
        }
        let end_error_before =
            (drifted[n - 1].translation() - truth[n - 1].translation()).norm();

        let mut graph = PoseGraph::from_odometry(
            &drifted,
            &DEFAULT_ODOMETRY_SIGMAS,
            &DEFAULT_PRIOR_SIGMAS,
        );
        let measured = &truth[0].inverse() * &truth[n - 1];
        graph.add_between(0, n - 1, &measured, &DEFAULT_LOOP_SIGMAS, FactorKind::Loop);
        assert_eq!(graph.num_factors_of(FactorKind::Loop), 1);

        let report = graph.optimize(100).unwrap();
        let end_error_after = (report.poses[&(n - 1)].translation()
            - truth[n - 1].translation())
        .norm();

        assert!(report.final_cost.is_finite());
        assert!(
            end_error_after < 0.1 && end_error_after < end_error_before / 2.0,
            "before {end_error_before}, after {end_error_after}"
        );
    }

    #[test]
    fn missing_prior_is_an_error() {
        let mut graph = PoseGraph::new();
        graph.add_initial(0, &Transform::eye());
        graph.add_initial(1, &pose(1.0, 0.0, 0.0));
        graph.add_between(
            0,
            1,
            &pose(1.0, 0.0, 0.0),
            &DEFAULT_ODOMETRY_SIGMAS,
            FactorKind::Odometry,
        );
        assert!(matches!(graph.optimize(10), Err(GraphError::MissingPrior)));
    }

    #[test]
    fn factor_without_initial_is_an_error() {
        let mut graph = PoseGraph::new();
        graph.add_prior(0, &Transform::eye(), &DEFAULT_PRIOR_SIGMAS);
        graph.add_initial(0, &Transform::eye());
        graph.add_between(
            0,
            1,
            &pose(1.0, 0.0, 0.0),
            &DEFAULT_ODOMETRY_SIGMAS,
            FactorKind::Odometry,
        );
        assert!(matches!(
            graph.optimize(10),
            Err(GraphError::MissingInitial(1))
        ));
    }

    #[test]
    fn isolated_vertex_is_an_error() {
        let mut graph = PoseGraph::new();
        graph.add_prior(0, &Transform::eye(), &DEFAULT_PRIOR_SIGMAS);
        graph.add_initial(0, &Transform::eye());
        graph.add_initial(5, &pose(1.0, 0.0, 0.0));
        assert!(matches!(
            graph.optimize(10),
            Err(GraphError::IsolatedVertex(5))
        ));
    }

    #[test]
    fn rotational_drift_is_corrected() {
        let truth: Vec<Transform> = (0..12).map(|i| pose(i as f32 * 0.5, 0.0, 0.0)).collect();
        let mut drifted = vec![truth[0].clone()];
        for i in 1..12 {
            let relative = &truth[i - 1].inverse() * &truth[i];
            let noisy = &relative * &Transform::exp(&V6::new(0.0, 0.0, 0.0, 0.0, 0.0, 0.01));
            drifted.push(&drifted[i - 1].clone() * &noisy);
        }

        let mut graph = PoseGraph::from_odometry(
            &drifted,
            &DEFAULT_ODOMETRY_SIGMAS,
            &DEFAULT_PRIOR_SIGMAS,
        );
        let measured = &truth[0].inverse() * &truth[11];
        graph.add_between(0, 11, &measured, &DEFAULT_LOOP_SIGMAS, FactorKind::Loop);
        let report = graph.optimize(100).unwrap();

        let optimized = &report.poses[&11];
        assert!((optimized.translation() - truth[11].translation()).norm() < 0.15);
    }
}
