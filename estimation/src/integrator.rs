//! Fixed-step classical Runge-Kutta integration.
//!
//! The control input is held constant across the four stages (zero-order
//! hold). Non-finite derivatives propagate into the result unchecked; callers
//! validate the output.

use nalgebra::DVector;

use crate::error::{FilterError, Result};
use crate::model::Dynamics;

/// Advances `state` by one step of size `h` with 4th-order Runge-Kutta.
pub fn rk4_step(
    dynamics: &dyn Dynamics,
    time: f64,
    state: &DVector<f64>,
    control: &DVector<f64>,
    h: f64,
) -> DVector<f64> {
    let half = 0.5 * h;

    let k1 = dynamics.derivative(time, state, control) * h;
    let k2 = dynamics.derivative(time + half, &(state + &k1 * 0.5), control) * h;
    let k3 = dynamics.derivative(time + half, &(state + &k2 * 0.5), control) * h;
    let k4 = dynamics.derivative(time + h, &(state + &k3), control) * h;

    state + (k1 + k2 * 2.0 + k3 * 2.0 + k4) / 6.0
}

/// Checked variant of [`rk4_step`]. Every stage derivative must have the
/// length of `state`; a model that returns anything else is rejected before
/// any arithmetic mixes the two.
pub fn try_rk4_step(
    dynamics: &dyn Dynamics,
    time: f64,
    state: &DVector<f64>,
    control: &DVector<f64>,
    h: f64,
) -> Result<DVector<f64>> {
    let stage = |t: f64, x: &DVector<f64>| -> Result<DVector<f64>> {
        let dx = dynamics.derivative(t, x, control);
        if dx.len() != state.len() {
            return Err(FilterError::DimensionMismatch {
                context: "dynamics output",
                expected: state.len(),
                actual: dx.len(),
            });
        }
        Ok(dx * h)
    };
    let half = 0.5 * h;

    let k1 = stage(time, state)?;
    let k2 = stage(time + half, &(state + &k1 * 0.5))?;
    let k3 = stage(time + half, &(state + &k2 * 0.5))?;
    let k4 = stage(time + h, &(state + &k3))?;

    Ok(state + (k1 + k2 * 2.0 + k3 * 2.0 + k4) / 6.0)
}

/// Applies [`rk4_step`] `steps` times starting at `t0`.
pub fn integrate(
    dynamics: &dyn Dynamics,
    t0: f64,
    state: &DVector<f64>,
    control: &DVector<f64>,
    h: f64,
    steps: usize,
) -> DVector<f64> {
    let mut x = state.clone();
    for i in 0..steps {
        x = rk4_step(dynamics, t0 + i as f64 * h, &x, control, h);
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;

    fn decay(_t: f64, x: &DVector<f64>, _u: &DVector<f64>) -> DVector<f64> {
        -x
    }

    fn decay_error(h: f64) -> f64 {
        let horizon = 2.0;
        let steps = (horizon / h).round() as usize;
        let x0 = DVector::from_vec(vec![1.0]);
        let x = integrate(&decay, 0.0, &x0, &DVector::zeros(0), h, steps);
        (x[0] - (-horizon).exp()).abs()
    }

    #[rstest]
    #[case(0.1)]
    #[case(0.05)]
    #[case(0.01)]
    fn test_exponential_decay_matches_closed_form(#[case] h: f64) {
        assert!(decay_error(h) < 10.0 * h.powi(4));
    }

    #[test]
    fn test_error_shrinks_at_fourth_order() {
        let coarse = decay_error(0.2);
        let fine = decay_error(0.1);
        // Halving h cuts the global error by roughly 2^4.
        let ratio = coarse / fine;
        assert!(ratio > 12.0 && ratio < 20.0, "ratio {ratio}");
    }

    #[test]
    fn test_time_dependent_dynamics() {
        // dx/dt = t, x(0) = 0 -> x(t) = t^2 / 2, exact for RK4.
        let f = |t: f64, x: &DVector<f64>, _u: &DVector<f64>| DVector::from_element(x.len(), t);
        let x = integrate(&f, 0.0, &DVector::zeros(1), &DVector::zeros(0), 0.25, 8);
        assert_relative_eq!(x[0], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_control_is_held_constant() {
        // dx/dt = u -> x = u * t
        let f = |_t: f64, _x: &DVector<f64>, u: &DVector<f64>| u.clone();
        let u = DVector::from_vec(vec![3.0, -1.0]);
        let x = rk4_step(&f, 0.0, &DVector::zeros(2), &u, 0.5);
        assert_relative_eq!(x, DVector::from_vec(vec![1.5, -0.5]), epsilon = 1e-12);
    }

    #[test]
    fn test_checked_step_matches_unchecked() {
        let x0 = DVector::from_vec(vec![1.0, -0.5]);
        let u = DVector::zeros(0);
        let checked = try_rk4_step(&decay, 0.0, &x0, &u, 0.1).unwrap();
        assert_eq!(checked, rk4_step(&decay, 0.0, &x0, &u, 0.1));
    }

    #[test]
    fn test_checked_step_rejects_wrong_derivative_length() {
        let f = |_t: f64, _x: &DVector<f64>, _u: &DVector<f64>| DVector::zeros(3);
        let err = try_rk4_step(&f, 0.0, &DVector::zeros(2), &DVector::zeros(0), 0.1).unwrap_err();
        assert_eq!(
            err,
            FilterError::DimensionMismatch {
                context: "dynamics output",
                expected: 2,
                actual: 3
            }
        );
    }

    #[test]
    fn test_non_finite_derivative_propagates() {
        let f = |_t: f64, x: &DVector<f64>, _u: &DVector<f64>| x.map(|_| f64::NAN);
        let x = rk4_step(&f, 0.0, &DVector::from_vec(vec![1.0]), &DVector::zeros(0), 0.1);
        assert!(x[0].is_nan());
    }
}
