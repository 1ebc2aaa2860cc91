#![allow(non_snake_case)]

use nalgebra::{DMatrix, DVector};
use tracing::{debug, warn};

use crate::error::{FilterError, Result};
use crate::integrator::try_rk4_step;
use crate::jacobian::{NumericalJacobian, DEFAULT_EPSILON};
use crate::model::{Dynamics, IdentityObservation, Observation};

/// Relative asymmetry of `P` above which a warning is logged.
const ASYMMETRY_TOLERANCE: f64 = 1e-9;

/// How the state-transition Jacobian enters the covariance prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CovariancePropagation {
    /// `P ← F·P·Fᵗ + Q`, with `F = df/dx` of the derivative function.
    #[default]
    Continuous,
    /// `Φ = I + F·dt`, `P ← Φ·P·Φᵗ + Q`.
    Discretized,
}

/// Optional settings for [`ExtendedKalmanFilter::with_options`].
#[derive(Debug, Clone, PartialEq)]
pub struct EkfOptions {
    /// Length of the control vector passed to `predict`.
    pub control_dim: usize,
    /// Initial `P`. Identity when `None`.
    pub initial_covariance: Option<DMatrix<f64>>,
    pub jacobian_epsilon: f64,
    /// Innovation covariances with a larger condition number are rejected.
    pub max_condition_number: f64,
    pub start_time: f64,
    pub propagation: CovariancePropagation,
}

impl Default for EkfOptions {
    fn default() -> Self {
        Self {
            control_dim: 0,
            initial_covariance: None,
            jacobian_epsilon: DEFAULT_EPSILON,
            max_condition_number: 1e12,
            start_time: 0.0,
            propagation: CovariancePropagation::default(),
        }
    }
}

/// Extended Kalman filter over a continuous-time [`Dynamics`] model.
///
/// `predict` integrates the dynamics with RK4 and linearizes them with a
/// central-difference Jacobian; `update` applies the configured
/// [`Observation`] model, `H = I` unless replaced with
/// [`with_observation`](Self::with_observation). Both steps are atomic: on
/// error the previous `(x, P)` is kept.
pub struct ExtendedKalmanFilter {
    /// Filter clock, advanced by `dt` on every successful predict
    time: f64,
    /// State estimate
    x: DVector<f64>,
    /// Estimate covariance
    P: DMatrix<f64>,
    /// Process noise covariance
    Q: DMatrix<f64>,
    /// Measurement noise covariance
    R: DMatrix<f64>,
    /// State-transition Jacobian from the last predict
    F: DMatrix<f64>,
    I: DMatrix<f64>,
    control_dim: usize,
    max_condition_number: f64,
    propagation: CovariancePropagation,
    /// Asymmetry of `P` observed before the last re-symmetrization
    asymmetry: f64,
    dynamics: Box<dyn Dynamics>,
    observation: Box<dyn Observation>,
    jacobian: NumericalJacobian,
}

impl std::fmt::Debug for ExtendedKalmanFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtendedKalmanFilter")
            .field("time", &self.time)
            .field("x", &self.x)
            .field("P", &self.P)
            .field("control_dim", &self.control_dim)
            .field("propagation", &self.propagation)
            .finish_non_exhaustive()
    }
}

impl ExtendedKalmanFilter {
    pub fn new(
        x0: DVector<f64>,
        dynamics: impl Dynamics + 'static,
        R: DMatrix<f64>,
        Q: DMatrix<f64>,
    ) -> Result<Self> {
        Self::with_options(x0, dynamics, R, Q, EkfOptions::default())
    }

    pub fn with_options(
        x0: DVector<f64>,
        dynamics: impl Dynamics + 'static,
        R: DMatrix<f64>,
        Q: DMatrix<f64>,
        options: EkfOptions,
    ) -> Result<Self> {
        let n = x0.len();
        check_square("process noise", &Q, n)?;
        check_square("measurement noise", &R, n)?;
        let P = match options.initial_covariance {
            Some(P0) => {
                check_square("initial covariance", &P0, n)?;
                P0
            }
            None => DMatrix::identity(n, n),
        };
        if !all_finite(x0.iter()) || !all_finite(P.iter()) {
            return Err(FilterError::NonFiniteResult {
                stage: "initialization",
            });
        }

        debug!(state_dim = n, control_dim = options.control_dim, "EKF initialized");

        Ok(Self {
            time: options.start_time,
            x: x0,
            P,
            Q,
            R,
            F: DMatrix::identity(n, n),
            I: DMatrix::identity(n, n),
            control_dim: options.control_dim,
            max_condition_number: options.max_condition_number,
            propagation: options.propagation,
            asymmetry: 0.0,
            dynamics: Box::new(dynamics),
            observation: Box::new(IdentityObservation::new(n)),
            jacobian: NumericalJacobian::new(n).with_epsilon(options.jacobian_epsilon),
        })
    }

    /// Replaces the observation model. `R` must be sized for its measurement.
    pub fn with_observation(
        mut self,
        observation: impl Observation + 'static,
        R: DMatrix<f64>,
    ) -> Result<Self> {
        check_square("measurement noise", &R, observation.measurement_dim())?;
        self.observation = Box::new(observation);
        self.R = R;
        Ok(self)
    }

    /// Re-initializes the filter in place. Control dimension, Jacobian step,
    /// conditioning threshold and propagation mode are kept; `P` returns to
    /// identity and the observation model to `H = I`.
    pub fn reset(
        &mut self,
        x0: DVector<f64>,
        dynamics: impl Dynamics + 'static,
        R: DMatrix<f64>,
        Q: DMatrix<f64>,
    ) -> Result<()> {
        let options = EkfOptions {
            control_dim: self.control_dim,
            initial_covariance: None,
            jacobian_epsilon: self.jacobian.epsilon(),
            max_condition_number: self.max_condition_number,
            start_time: 0.0,
            propagation: self.propagation,
        };
        self.reset_with_options(x0, dynamics, R, Q, options)
    }

    pub fn reset_with_options(
        &mut self,
        x0: DVector<f64>,
        dynamics: impl Dynamics + 'static,
        R: DMatrix<f64>,
        Q: DMatrix<f64>,
        options: EkfOptions,
    ) -> Result<()> {
        *self = Self::with_options(x0, dynamics, R, Q, options)?;
        Ok(())
    }

    pub fn state(&self) -> &DVector<f64> {
        &self.x
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.P
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn dim(&self) -> usize {
        self.x.len()
    }

    pub fn transition_jacobian(&self) -> &DMatrix<f64> {
        &self.F
    }

    /// Largest `|P[i,j] - P[j,i]|` seen before the last covariance write was
    /// re-symmetrized, relative to the largest entry of `P`.
    pub fn covariance_asymmetry(&self) -> f64 {
        self.asymmetry
    }

    /// Propagates the state over `dt` and predicts its covariance.
    ///
    /// The state is integrated from the filter clock; the Jacobian is taken at
    /// `(time, x_new, control)`.
    pub fn predict(
        &mut self,
        time: f64,
        control: &DVector<f64>,
        dt: f64,
    ) -> Result<&DVector<f64>> {
        if control.len() != self.control_dim {
            return Err(FilterError::DimensionMismatch {
                context: "control",
                expected: self.control_dim,
                actual: control.len(),
            });
        }

        let x = try_rk4_step(self.dynamics.as_ref(), self.time, &self.x, control, dt)?;
        if !all_finite(x.iter()) {
            warn!(time = self.time, "Rejected predict: non-finite propagated state");
            return Err(FilterError::NonFiniteResult {
                stage: "state propagation",
            });
        }

        let F = self
            .jacobian
            .evaluate(self.dynamics.as_ref(), time, &x, control)?
            .clone();
        if !all_finite(F.iter()) {
            warn!(time = self.time, "Rejected predict: non-finite Jacobian");
            return Err(FilterError::NonFiniteResult { stage: "linearization" });
        }

        let Phi = match self.propagation {
            CovariancePropagation::Continuous => F.clone(),
            CovariancePropagation::Discretized => &self.I + &F * dt,
        };
        let (P, asymmetry) = symmetrize(&Phi * &self.P * Phi.transpose() + &self.Q);
        if !all_finite(P.iter()) {
            warn!(time = self.time, "Rejected predict: non-finite covariance");
            return Err(FilterError::NonFiniteResult {
                stage: "covariance propagation",
            });
        }

        self.x = x;
        self.F = F;
        self.P = P;
        self.time += dt;
        self.note_asymmetry(asymmetry);
        debug!(time = self.time, trace = self.P.trace(), "EKF predict");

        Ok(&self.x)
    }

    /// Corrects the state with measurement `z`.
    pub fn update(&mut self, z: &DVector<f64>) -> Result<&DVector<f64>> {
        let m = self.observation.measurement_dim();
        let n = self.x.len();
        if z.len() != m {
            return Err(FilterError::DimensionMismatch {
                context: "measurement",
                expected: m,
                actual: z.len(),
            });
        }

        let H = self.observation.jacobian(&self.x);
        if H.nrows() != m || H.ncols() != n {
            return Err(FilterError::DimensionMismatch {
                context: "observation jacobian",
                expected: m * n,
                actual: H.nrows() * H.ncols(),
            });
        }

        let S = &H * &self.P * H.transpose() + &self.R;
        let condition_number = condition_of(&S);
        if condition_number.is_nan() || condition_number > self.max_condition_number {
            warn!(
                condition_number,
                "Rejected update: ill-conditioned innovation covariance"
            );
            return Err(FilterError::SingularInnovationCovariance { condition_number });
        }
        let S_inv = S
            .try_inverse()
            .ok_or(FilterError::SingularInnovationCovariance { condition_number })?;

        let predicted = self.observation.observe(&self.x);
        if predicted.len() != m {
            return Err(FilterError::DimensionMismatch {
                context: "observation output",
                expected: m,
                actual: predicted.len(),
            });
        }

        // Kalman gain
        let K = &self.P * H.transpose() * S_inv;
        // Innovation
        let y = z - predicted;

        let x = &self.x + &K * y;
        let (P, asymmetry) = symmetrize((&self.I - &K * &H) * &self.P);
        if !all_finite(x.iter()) || !all_finite(P.iter()) {
            warn!(time = self.time, "Rejected update: non-finite result");
            return Err(FilterError::NonFiniteResult {
                stage: "measurement update",
            });
        }

        self.x = x;
        self.P = P;
        self.note_asymmetry(asymmetry);
        debug!(time = self.time, condition_number, trace = self.P.trace(), "EKF update");

        Ok(&self.x)
    }

    fn note_asymmetry(&mut self, asymmetry: f64) {
        if asymmetry > ASYMMETRY_TOLERANCE {
            warn!(asymmetry, "Covariance drifted from symmetry");
        }
        self.asymmetry = asymmetry;
    }
}

fn check_square(context: &'static str, m: &DMatrix<f64>, n: usize) -> Result<()> {
    if m.nrows() != n || m.ncols() != n {
        return Err(FilterError::DimensionMismatch {
            context,
            expected: n,
            actual: if m.nrows() != n { m.nrows() } else { m.ncols() },
        });
    }
    Ok(())
}

fn all_finite<'a>(mut values: impl Iterator<Item = &'a f64>) -> bool {
    values.all(|v| v.is_finite())
}

/// Returns `(P + Pᵗ)/2` and the relative asymmetry of the input.
fn symmetrize(P: DMatrix<f64>) -> (DMatrix<f64>, f64) {
    let scale = P.amax();
    let asymmetry = if scale > 0.0 {
        (&P - P.transpose()).amax() / scale
    } else {
        0.0
    };
    let symmetric = (&P + P.transpose()) * 0.5;
    (symmetric, asymmetry)
}

/// Ratio of the largest to the smallest singular value. Infinite for a
/// singular matrix, NaN when the matrix is not finite.
fn condition_of(m: &DMatrix<f64>) -> f64 {
    if !all_finite(m.iter()) {
        return f64::NAN;
    }
    let sv = m.singular_values();
    let max = sv.max();
    let min = sv.min();
    if min <= 0.0 {
        f64::INFINITY
    } else {
        max / min
    }
}
