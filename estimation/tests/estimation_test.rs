use approx::assert_abs_diff_eq;
use nalgebra::{DMatrix, DVector, UnitQuaternion, Vector3};
use nav_estimation::integrator::rk4_step;
use nav_estimation::{
    orientation_accel_mag, AhrsFilter, CovariancePropagation, Dynamics, EkfOptions,
    ExtendedKalmanFilter, FilterError, TiltCompensatedCompass,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rstest::rstest;

struct Pendulum;

impl Dynamics for Pendulum {
    fn derivative(
        &self,
        _time: f64,
        state: &DVector<f64>,
        _control: &DVector<f64>,
    ) -> DVector<f64> {
        DVector::from_vec(vec![state[1], -9.81 * state[0].sin() - 0.2 * state[1]])
    }
}

/// Cart with force input, state `[position, velocity]`, control `[force]`.
fn cart(_t: f64, x: &DVector<f64>, u: &DVector<f64>) -> DVector<f64> {
    DVector::from_vec(vec![x[1], u[0] - 0.1 * x[1]])
}

fn rms(errors: &[f64]) -> f64 {
    (errors.iter().map(|e| e * e).sum::<f64>() / errors.len() as f64).sqrt()
}

#[test]
fn test_ekf_tracks_pendulum_better_than_measurements() {
    let dt = 0.01;
    let sigma = 0.05;
    let noise = Normal::new(0.0, sigma).unwrap();
    let mut rng = StdRng::seed_from_u64(42);
    let no_control = DVector::zeros(0);

    let mut ekf = ExtendedKalmanFilter::with_options(
        DVector::from_vec(vec![0.8, 0.0]),
        Pendulum,
        DMatrix::<f64>::identity(2, 2) * sigma * sigma,
        DMatrix::<f64>::identity(2, 2) * 1e-6,
        EkfOptions {
            propagation: CovariancePropagation::Discretized,
            initial_covariance: Some(DMatrix::<f64>::identity(2, 2) * 0.01),
            ..Default::default()
        },
    )
    .unwrap();

    let mut truth = DVector::from_vec(vec![0.8, 0.0]);
    let mut raw_errors = Vec::new();
    let mut filtered_errors = Vec::new();
    for step in 0..500 {
        let t = step as f64 * dt;
        truth = rk4_step(&Pendulum, t, &truth, &no_control, dt);
        let z = truth.map(|v| v + noise.sample(&mut rng));

        ekf.predict(t + dt, &no_control, dt).unwrap();
        ekf.update(&z).unwrap();

        // Skip the initial transient.
        if step >= 100 {
            raw_errors.push((&z - &truth)[0]);
            filtered_errors.push((ekf.state() - &truth)[0]);
        }
        assert!(ekf.covariance_asymmetry() < 1e-9);
    }

    assert!(rms(&filtered_errors) < 0.5 * rms(&raw_errors));
    assert_abs_diff_eq!(ekf.time(), 5.0, epsilon = 1e-9);
}

#[test]
fn test_ekf_with_control_input() {
    let mut ekf = ExtendedKalmanFilter::with_options(
        DVector::zeros(2),
        cart,
        DMatrix::<f64>::identity(2, 2) * 0.01,
        DMatrix::<f64>::identity(2, 2) * 1e-4,
        EkfOptions {
            control_dim: 1,
            ..Default::default()
        },
    )
    .unwrap();

    let force = DVector::from_vec(vec![1.0]);
    let x = ekf.predict(0.0, &force, 0.1).unwrap().clone();
    assert!(x[0] > 0.0 && x[1] > 0.0);

    let err = ekf.predict(0.1, &DVector::zeros(2), 0.1).unwrap_err();
    assert_eq!(
        err,
        FilterError::DimensionMismatch {
            context: "control",
            expected: 1,
            actual: 2
        }
    );
}

#[test]
fn test_failed_update_can_be_retried() {
    // A rejected step keeps the prior estimate; the next valid call proceeds.
    let mut ekf = ExtendedKalmanFilter::new(
        DVector::from_vec(vec![1.0, 1.0]),
        |_t: f64, x: &DVector<f64>, _u: &DVector<f64>| DVector::zeros(x.len()),
        DMatrix::<f64>::identity(2, 2),
        DMatrix::<f64>::identity(2, 2) * 0.1,
    )
    .unwrap();
    let before = ekf.state().clone();
    assert!(ekf.update(&DVector::from_vec(vec![f64::NAN, 0.0])).is_err());
    assert_eq!(ekf.state(), &before);

    let x = ekf.update(&DVector::from_vec(vec![2.0, 2.0])).unwrap();
    assert!(x[0] > 1.0 && x[0] < 2.0);
}

#[rstest]
#[case(0.0, 0.0, 0.8)]
#[case(0.2, -0.1, -1.4)]
fn test_seeded_ahrs_agrees_with_compass(#[case] roll: f32, #[case] pitch: f32, #[case] yaw: f32) {
    let truth = UnitQuaternion::from_euler_angles(roll, pitch, yaw);
    let dip = 55f32.to_radians();
    let accel = truth.inverse() * Vector3::new(0.0, 0.0, 9.81);
    let mag = truth.inverse() * Vector3::new(dip.cos(), 0.0, dip.sin()) * 50.0;

    let seed = orientation_accel_mag(accel, mag).unwrap();
    let mut ahrs = AhrsFilter::with_orientation(seed);
    for _ in 0..200 {
        ahrs.update(accel, mag, Vector3::zeros(), 0.05, 0.01).unwrap();
    }

    let attitude = TiltCompensatedCompass.heading(accel, mag).unwrap();
    assert!(ahrs.orientation().angle_to(&truth) < 1e-2);
    assert!(attitude.to_quaternion().angle_to(&truth) < 1e-3);
}
