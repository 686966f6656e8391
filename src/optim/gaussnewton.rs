use nalgebra::{ArrayStorage, Cholesky, Const, SMatrix, SVector};
use num::Zero;

/// Accumulates scalar residual rows into Gauss-Newton normal equations.
pub struct GaussNewton<const DIM: usize> {
    hessian: SMatrix<f32, DIM, DIM>,
    gradient: SVector<f32, DIM>,
    squared_residual_sum: f32,
    count: usize,
}

impl<const DIM: usize> Default for GaussNewton<DIM> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const DIM: usize> GaussNewton<DIM> {
    pub fn new() -> Self {
        Self {
            hessian: SMatrix::zeros(),
            gradient: SVector::zeros(),
            squared_residual_sum: 0.0,
            count: 0,
        }
    }

    pub fn reset(&mut self) {
        self.hessian.set_zero();
        self.gradient.set_zero();
        self.squared_residual_sum = 0.0;
        self.count = 0;
    }

    pub fn step(&mut self, residual: f32, jacobian: &[f32]) {
        self.squared_residual_sum += residual * residual;

        let jt_r = SMatrix::from_row_slice(jacobian) * residual;

        let mut jt_j = [[0.0; DIM]; DIM];
        for i in 0..DIM {
            for j in 0..DIM {
                jt_j[i][j] += jacobian[i] * jacobian[j];
            }
        }

        self.hessian += SMatrix::from_data(ArrayStorage(jt_j));
        self.gradient += jt_r;
        self.count += 1;
    }

    /// Solves the accumulated normal equations. Returns `None` when nothing
    /// was accumulated or the system is singular, so callers can treat the
    /// iteration as failed instead of panicking.
    pub fn solve(&self) -> Option<SVector<f32, DIM>> {
        if self.count == 0 {
            return None;
        }
        let hessian: SMatrix<f64, DIM, DIM> = nalgebra::convert(self.hessian);
        let gradient: SVector<f64, DIM> = nalgebra::convert(self.gradient);

        let update = Cholesky::<f64, Const<DIM>>::new(hessian)?.solve(&gradient);
        Some(nalgebra::convert(update))
    }

    pub fn mean_squared_residual(&self) -> f32 {
        if self.count == 0 {
            return 0.0;
        }
        self.squared_residual_sum / self.count as f32
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauss_newton_accumulation() {
        let mut gn = GaussNewton::<6>::new();
        let jacobian = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        gn.step(1.0, &jacobian);
        gn.step(2.0, &jacobian);
        gn.step(3.0, &jacobian);

        // H[0][1] = 3 * (1 * 2); g[0] = 1*(1+2+3).
        assert_eq!(gn.hessian[(0, 1)], 6.0);
        assert_eq!(gn.gradient[0], 6.0);
        assert_eq!(gn.count(), 3);
        assert!((gn.mean_squared_residual() - 14.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_solve_recovers_linear_fit() {
        // Residuals r = b - x for the single unknown x, data b in {1, 2, 3}.
        let mut gn = GaussNewton::<1>::new();
        for b in [1.0f32, 2.0, 3.0] {
            gn.step(b, &[1.0]);
        }
        let update = gn.solve().unwrap();
        assert!((update[0] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_system_has_no_solution() {
        let gn = GaussNewton::<6>::new();
        assert!(gn.solve().is_none());
    }
}
