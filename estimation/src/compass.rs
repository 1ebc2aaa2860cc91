//! Attitude directly from one accelerometer and magnetometer reading.

use core::f32::consts::PI;

use nalgebra::{UnitQuaternion, Vector3};

use crate::error::{FilterError, Result, Sensor};

/// Smallest reading magnitude the compass accepts.
const MIN_NORM: f32 = 1e-6;

/// Roll, pitch and yaw in radians (yaw about z, then pitch about y, then roll
/// about x).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Attitude {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

impl Attitude {
    pub fn to_quaternion(&self) -> UnitQuaternion<f32> {
        UnitQuaternion::from_euler_angles(self.roll, self.pitch, self.yaw)
    }
}

/// Tilt-compensated magnetic compass: roll and pitch from gravity, heading
/// from the magnetic field projected onto the horizontal plane.
#[derive(Debug, Clone, Copy, Default)]
pub struct TiltCompensatedCompass;

impl TiltCompensatedCompass {
    pub fn heading(&self, accel: Vector3<f32>, mag: Vector3<f32>) -> Result<Attitude> {
        let (roll, pitch) = roll_pitch_from_gravity(accel)?;
        let yaw = heading_from_mag(mag, roll, pitch)?;
        Ok(Attitude { roll, pitch, yaw })
    }
}

pub(crate) fn normalize_reading(v: Vector3<f32>, sensor: Sensor) -> Result<Vector3<f32>> {
    if !v.iter().all(|c| c.is_finite()) {
        return Err(FilterError::NonFiniteResult { stage: "sensor input" });
    }
    v.try_normalize(MIN_NORM)
        .ok_or(FilterError::DegenerateSensorReading { sensor })
}

/// Returns (roll, pitch) in radians, estimated from accelerometer measurements only.
pub fn roll_pitch_from_gravity(accel: Vector3<f32>) -> Result<(f32, f32)> {
    let acc = normalize_reading(accel, Sensor::Accelerometer)?;
    let roll = acc.y.atan2(acc.z);
    let pitch = -acc.x.atan2((acc.y.powi(2) + acc.z.powi(2)).sqrt());
    Ok((roll, pitch))
}

/// Returns the yaw (heading) angle in `(-π, π]` from the magnetic field,
/// given a roll and pitch value (in radians).
pub fn heading_from_mag(mag: Vector3<f32>, roll: f32, pitch: f32) -> Result<f32> {
    let mag = normalize_reading(mag, Sensor::Magnetometer)?;
    let by = mag.y * roll.cos() - mag.z * roll.sin();
    let bx = mag.x * pitch.cos() + pitch.sin() * (mag.y * roll.sin() + mag.z * roll.cos());
    let yaw = -by.atan2(bx);
    Ok(if yaw <= -PI { yaw + 2.0 * PI } else { yaw })
}
