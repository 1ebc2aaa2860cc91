//! System and measurement models consumed by the estimators.
//!
//! The integrator, the Jacobian and the EKF only see these traits, so a
//! closure, a struct with parameters, or a hand-derived model can be swapped
//! in without touching the filter.

use nalgebra::{DMatrix, DVector};

/// Continuous-time dynamics `dx/dt = f(t, x, u)`.
///
/// Implementations must be pure: the numerical Jacobian evaluates them twice
/// per state component and expects identical inputs to give identical output.
pub trait Dynamics {
    fn derivative(&self, time: f64, state: &DVector<f64>, control: &DVector<f64>) -> DVector<f64>;
}

impl<F> Dynamics for F
where
    F: Fn(f64, &DVector<f64>, &DVector<f64>) -> DVector<f64>,
{
    fn derivative(
        &self,
        time: f64,
        state: &DVector<f64>,
        control: &DVector<f64>,
    ) -> DVector<f64> {
        self(time, state, control)
    }
}

/// Measurement model `z = h(x)` with its Jacobian `H = dh/dx`.
pub trait Observation {
    /// Length of the measurement vector `z`.
    fn measurement_dim(&self) -> usize;

    fn observe(&self, state: &DVector<f64>) -> DVector<f64>;

    fn jacobian(&self, state: &DVector<f64>) -> DMatrix<f64>;
}

/// Direct observation of the full state, `H = I`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityObservation {
    dim: usize,
}

impl IdentityObservation {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl Observation for IdentityObservation {
    fn measurement_dim(&self) -> usize {
        self.dim
    }

    fn observe(&self, state: &DVector<f64>) -> DVector<f64> {
        state.clone()
    }

    fn jacobian(&self, _state: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::identity(self.dim, self.dim)
    }
}

/// Constant linear observation `z = H·x` for an M×N matrix `H`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearObservation {
    h: DMatrix<f64>,
}

impl LinearObservation {
    pub fn new(h: DMatrix<f64>) -> Self {
        Self { h }
    }

    /// Number of state components the model expects.
    pub fn state_dim(&self) -> usize {
        self.h.ncols()
    }
}

impl Observation for LinearObservation {
    fn measurement_dim(&self) -> usize {
        self.h.nrows()
    }

    fn observe(&self, state: &DVector<f64>) -> DVector<f64> {
        &self.h * state
    }

    fn jacobian(&self, _state: &DVector<f64>) -> DMatrix<f64> {
        self.h.clone()
    }
}
