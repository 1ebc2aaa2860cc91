pub mod ahrs;
pub mod calibration;
pub mod compass;
pub mod ekf;
pub mod error;
pub mod integrator;
pub mod jacobian;
pub mod model;

pub use ahrs::{AhrsFilter, DEFAULT_BETA};
pub use compass::{Attitude, TiltCompensatedCompass};
pub use ekf::{CovariancePropagation, EkfOptions, ExtendedKalmanFilter};
pub use error::{FilterError, Sensor};
pub use jacobian::NumericalJacobian;
pub use model::{Dynamics, IdentityObservation, LinearObservation, Observation};

use anyhow::Error;
use csv::WriterBuilder;
use nalgebra::{Matrix, Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Struct holding raw imu measurements
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct RawImuData {
    #[serde(
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub time: Duration,
    pub ax: f32,
    pub ay: f32,
    pub az: f32,
    // Angular velocities in deg/s
    pub gx: f32,
    pub gy: f32,
    pub gz: f32,
    pub mx: f32,
    pub my: f32,
    pub mz: f32,
}

fn serialize_duration<S>(
    duration: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let secs = duration.as_secs_f64();
    serializer.serialize_f64(secs)
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

impl RawImuData {
    pub fn accel(&self) -> Vector3<f32> {
        Vector3::new(self.ax, self.ay, self.az)
    }

    /// Returns a vector of angular velocities in rads/s
    pub fn gyro(&self) -> Vector3<f32> {
        Vector3::new(
            self.gx.to_radians(),
            self.gy.to_radians(),
            self.gz.to_radians(),
        )
    }

    pub fn mag(&self) -> Vector3<f32> {
        Vector3::new(self.mx, self.my, self.mz)
    }
}

/// One orientation estimate, as written by the CLI.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct OrientationRecord {
    pub time: f64,
    pub qw: f32,
    pub qx: f32,
    pub qy: f32,
    pub qz: f32,
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

impl OrientationRecord {
    pub fn new(time: Duration, q: &UnitQuaternion<f32>) -> Self {
        let (roll, pitch, yaw) = q.euler_angles();
        Self {
            time: time.as_secs_f64(),
            qw: q.w,
            qx: q.i,
            qy: q.j,
            qz: q.k,
            roll,
            pitch,
            yaw,
        }
    }
}

pub fn read_csv<T: DeserializeOwned>(file_path: &Path) -> std::result::Result<Vec<T>, Error> {
    let file = File::open(file_path)?;
    let mut rdr = csv::Reader::from_reader(file);

    let mut data = Vec::new();
    for result in rdr.deserialize() {
        let record: T = result?;
        data.push(record);
    }

    Ok(data)
}

pub fn write_csv<T: Serialize>(file_path: &Path, data: &[T]) -> std::result::Result<(), Error> {
    let file = File::create(file_path)?;
    let mut writer = WriterBuilder::new().has_headers(true).from_writer(file);
    for record in data {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Orientation implied by a single accelerometer and magnetometer reading,
/// used to seed the filters from the first sample of a log.
pub fn orientation_accel_mag(
    accel: Vector3<f32>,
    mag: Vector3<f32>,
) -> Result<UnitQuaternion<f32>> {
    let acc = compass::normalize_reading(accel, Sensor::Accelerometer)?;
    let mag = compass::normalize_reading(mag, Sensor::Magnetometer)?;

    // Down x Mag = East
    // East x Down = North
    let y_axis = acc
        .cross(&mag)
        .try_normalize(f32::EPSILON)
        .ok_or(FilterError::DegenerateSensorReading {
            sensor: Sensor::Magnetometer,
        })?;
    let x_axis = y_axis.cross(&acc).normalize();

    let rot = Rotation3::from_matrix_unchecked(Matrix3::from_columns(&[x_axis, y_axis, acc]));
    Ok(UnitQuaternion::from_rotation_matrix(&rot).inverse())
}

/// Type alias for a 4x1 column vector with a generic scalar type `T`, used to
/// represent a quaternion. Quaternion elements are ordered as (w, i, j, k).
///
/// Note: Using this rather than nalgebra's built-in Vector4 alias because
/// nalgebra's alias uses labels (x,y,z,w) which follow a different ordering
/// scheme than ours, so this avoids confusion.
pub type Vec4<T> =
    Matrix<T, nalgebra::Const<4>, nalgebra::Const<1>, nalgebra::ArrayStorage<T, 4, 1>>;

/// Converts a `UnitQuaternion<T>` to a `Vec4<T>` in (w, i, j, k) ordering.
pub fn quat_to_vec4<T: nalgebra::RealField + Copy>(q: &UnitQuaternion<T>) -> Vec4<T> {
    Vec4::new(q.w, q.i, q.j, q.k)
}

/// Converts a `Vec4<T>` in (w, i, j, k) ordering back to a `UnitQuaternion<T>`,
/// normalizing it.
pub fn vec4_to_quat<T: nalgebra::RealField + Copy>(v: &Vec4<T>) -> UnitQuaternion<T> {
    UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(v[0], v[1], v[2], v[3]))
}

/// Returns the 4x4 matrix needed to map angular rate w to a delta quaternion update.
/// The bottom right is a 3x3 skew-symmetric matrix.
///
/// OMEGA = | 0  -w^T   |
///         | w  -|w|_x |
pub fn omega(w: &Vector3<f32>) -> Matrix4<f32> {
    Matrix4::new(
        0., -w.x, -w.y, -w.z, // r0
        w.x, 0., w.z, -w.y, // r1
        w.y, -w.z, 0., w.x, // r2
        w.z, w.y, -w.x, 0., // r3
    )
}
