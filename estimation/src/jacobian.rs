//! Central-difference Jacobian of a [`Dynamics`] model with respect to state.

use nalgebra::{DMatrix, DVector};

use crate::error::{FilterError, Result};
use crate::model::Dynamics;

/// Default relative perturbation.
pub const DEFAULT_EPSILON: f64 = 1e-8;

/// Numerical Jacobian `J[i, j] = d f_i / d x_j` with a fixed state dimension.
///
/// The N×N output buffer is allocated once in [`NumericalJacobian::new`] and
/// overwritten on every [`evaluate`](NumericalJacobian::evaluate).
#[derive(Debug, Clone)]
pub struct NumericalJacobian {
    epsilon: f64,
    jacobian: DMatrix<f64>,
}

impl NumericalJacobian {
    pub fn new(dim: usize) -> Self {
        Self {
            epsilon: DEFAULT_EPSILON,
            jacobian: DMatrix::zeros(dim, dim),
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn dim(&self) -> usize {
        self.jacobian.nrows()
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Evaluates the Jacobian of `dynamics` at `(time, state, control)`.
    ///
    /// Each column `j` uses the step `|x_j|·ε`, or `ε` when `x_j == 0`, so the
    /// perturbation scales with the magnitude of the component.
    pub fn evaluate(
        &mut self,
        dynamics: &dyn Dynamics,
        time: f64,
        state: &DVector<f64>,
        control: &DVector<f64>,
    ) -> Result<&DMatrix<f64>> {
        let n = self.dim();
        if state.len() != n {
            return Err(FilterError::DimensionMismatch {
                context: "jacobian state",
                expected: n,
                actual: state.len(),
            });
        }

        let mut plus = state.clone();
        let mut minus = state.clone();

        for col in 0..n {
            let xj = state[col];
            let delta = if xj != 0.0 { xj.abs() * self.epsilon } else { self.epsilon };

            plus[col] = xj + delta;
            minus[col] = xj - delta;

            let f_plus = dynamics.derivative(time, &plus, control);
            let f_minus = dynamics.derivative(time, &minus, control);
            if f_plus.len() != n || f_minus.len() != n {
                return Err(FilterError::DimensionMismatch {
                    context: "dynamics output",
                    expected: n,
                    actual: f_plus.len().min(f_minus.len()),
                });
            }

            let column = (f_plus - f_minus) / (2.0 * delta);
            self.jacobian.set_column(col, &column);

            plus[col] = xj;
            minus[col] = xj;
        }

        Ok(&self.jacobian)
    }
}
