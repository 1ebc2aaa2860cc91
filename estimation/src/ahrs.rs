//! Gradient-descent AHRS (Madgwick-style) orientation filter.
//!
//! The filter fuses gyroscope rates with the directions of gravity and of the
//! Earth's magnetic field. The objective function measures the difference
//! between the reference field directions, rotated into the sensor frame by
//! the current estimate, and the normalized accelerometer/magnetometer
//! readings. One normalized gradient step of size `beta` is subtracted from
//! the gyroscope quaternion rate before integrating over `dt`.
//!
//! Larger `beta` tracks the reference vectors faster but passes more sensor
//! noise through; it is supplied per call.
//!
//! The orientation is stored as a (w, x, y, z) 4-vector and rotates sensor
//! frame vectors into the Earth frame.

use nalgebra::{Matrix3x4, Matrix6x4, UnitQuaternion, Vector3, Vector6};
use tracing::warn;

use crate::error::{FilterError, Result, Sensor};
use crate::{omega, quat_to_vec4, vec4_to_quat, Vec4};

/// Readings with a smaller magnitude are treated as degenerate.
pub const DEFAULT_MIN_SENSOR_NORM: f32 = 1e-6;

/// Gradient step gain suited to a consumer-grade MEMS IMU.
pub const DEFAULT_BETA: f32 = 0.04;

#[derive(Debug, Clone, PartialEq)]
pub struct AhrsFilter {
    q: Vec4<f32>,
    min_sensor_norm: f32,
}

impl Default for AhrsFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl AhrsFilter {
    /// Starts at the identity orientation.
    pub fn new() -> Self {
        Self::with_orientation(UnitQuaternion::identity())
    }

    pub fn with_orientation(orientation: UnitQuaternion<f32>) -> Self {
        Self {
            q: quat_to_vec4(&orientation),
            min_sensor_norm: DEFAULT_MIN_SENSOR_NORM,
        }
    }

    pub fn with_min_sensor_norm(mut self, min_sensor_norm: f32) -> Self {
        self.min_sensor_norm = min_sensor_norm;
        self
    }

    pub fn orientation(&self) -> UnitQuaternion<f32> {
        vec4_to_quat(&self.q)
    }

    pub fn set_orientation(&mut self, orientation: UnitQuaternion<f32>) {
        self.q = quat_to_vec4(&orientation);
    }

    /// Fuses one accelerometer, magnetometer and gyroscope (rad/s) sample.
    pub fn update(
        &mut self,
        accel: Vector3<f32>,
        mag: Vector3<f32>,
        gyro: Vector3<f32>,
        beta: f32,
        dt: f32,
    ) -> Result<UnitQuaternion<f32>> {
        check_inputs(&[accel, mag, gyro], beta, dt)?;
        let accel = self.normalize(accel, Sensor::Accelerometer)?;
        let mag = self.normalize(mag, Sensor::Magnetometer)?;

        let (qw, qx, qy, qz) = (self.q[0], self.q[1], self.q[2], self.q[3]);
        let (ax, ay, az) = (accel.x, accel.y, accel.z);
        let (mx, my, mz) = (mag.x, mag.y, mag.z);

        // Rotate the measured field into the Earth frame, then drop its east
        // component so only the inclination remains.
        let h = vec4_to_quat(&self.q) * mag;
        let bx = (h.x * h.x + h.y * h.y).sqrt();
        let bz = h.z;

        // Gravity
        let f1 = 2.0 * (qx * qz - qw * qy) - ax;
        let f2 = 2.0 * (qw * qx + qy * qz) - ay;
        let f3 = 2.0 * (0.5 - qx * qx - qy * qy) - az;
        // Magnetic field
        let f4 = 2.0 * bx * (0.5 - qy * qy - qz * qz) + 2.0 * bz * (qx * qz - qw * qy) - mx;
        let f5 = 2.0 * bx * (qx * qy - qw * qz) + 2.0 * bz * (qw * qx + qy * qz) - my;
        let f6 = 2.0 * bx * (qw * qy + qx * qz) + 2.0 * bz * (0.5 - qx * qx - qy * qy) - mz;
        let f = Vector6::new(f1, f2, f3, f4, f5, f6);

        #[rustfmt::skip]
        let jacobian = Matrix6x4::new(
            -2.0 * qy, 2.0 * qz, -2.0 * qw, 2.0 * qx,
            2.0 * qx, 2.0 * qw, 2.0 * qz, 2.0 * qy,
            0.0, -4.0 * qx, -4.0 * qy, 0.0,
            -2.0 * bz * qy, 2.0 * bz * qz, -4.0 * bx * qy - 2.0 * bz * qw, -4.0 * bx * qz + 2.0 * bz * qx,
            -2.0 * bx * qz + 2.0 * bz * qx, 2.0 * bx * qy + 2.0 * bz * qw, 2.0 * bx * qx + 2.0 * bz * qz, -2.0 * bx * qw + 2.0 * bz * qy,
            2.0 * bx * qy, 2.0 * bx * qz - 4.0 * bz * qx, 2.0 * bx * qw - 4.0 * bz * qy, 2.0 * bx * qx,
        );

        self.step(jacobian.transpose() * f, gyro, beta, dt)
    }

    /// Gravity-only variant of [`update`](Self::update); heading is driven by
    /// the gyroscope alone.
    pub fn update_imu(
        &mut self,
        accel: Vector3<f32>,
        gyro: Vector3<f32>,
        beta: f32,
        dt: f32,
    ) -> Result<UnitQuaternion<f32>> {
        check_inputs(&[accel, gyro], beta, dt)?;
        let accel = self.normalize(accel, Sensor::Accelerometer)?;

        let (qw, qx, qy, qz) = (self.q[0], self.q[1], self.q[2], self.q[3]);
        let f = Vector3::new(
            2.0 * (qx * qz - qw * qy) - accel.x,
            2.0 * (qw * qx + qy * qz) - accel.y,
            2.0 * (0.5 - qx * qx - qy * qy) - accel.z,
        );

        #[rustfmt::skip]
        let jacobian = Matrix3x4::new(
            -2.0 * qy, 2.0 * qz, -2.0 * qw, 2.0 * qx,
            2.0 * qx, 2.0 * qw, 2.0 * qz, 2.0 * qy,
            0.0, -4.0 * qx, -4.0 * qy, 0.0,
        );

        self.step(jacobian.transpose() * f, gyro, beta, dt)
    }

    fn normalize(&self, v: Vector3<f32>, sensor: Sensor) -> Result<Vector3<f32>> {
        v.try_normalize(self.min_sensor_norm).ok_or_else(|| {
            warn!(%sensor, norm = v.norm(), "Rejected AHRS update: degenerate reading");
            FilterError::DegenerateSensorReading { sensor }
        })
    }

    /// Integrates `q̇ = ½·q⊗ω − β·∇f/|∇f|` and commits the normalized result.
    fn step(
        &mut self,
        gradient: Vec4<f32>,
        gyro: Vector3<f32>,
        beta: f32,
        dt: f32,
    ) -> Result<UnitQuaternion<f32>> {
        let mut q_dot = 0.5 * omega(&gyro) * self.q;
        // A zero gradient means the estimate already fits both references.
        if let Some(s) = gradient.try_normalize(f32::EPSILON) {
            q_dot -= beta * s;
        }

        let q = (self.q + q_dot * dt)
            .try_normalize(f32::EPSILON)
            .filter(|q| q.iter().all(|v| v.is_finite()))
            .ok_or(FilterError::NonFiniteResult {
                stage: "orientation integration",
            })?;

        self.q = q;
        Ok(self.orientation())
    }
}

fn check_inputs(vectors: &[Vector3<f32>], beta: f32, dt: f32) -> Result<()> {
    let finite = beta.is_finite()
        && dt.is_finite()
        && vectors.iter().all(|v| v.iter().all(|c| c.is_finite()));
    if finite {
        Ok(())
    } else {
        Err(FilterError::NonFiniteResult { stage: "sensor input" })
    }
}
