//! Per-axis sensor bias estimation and removal.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::error::{FilterError, Result};
use crate::RawImuData;

/// Constant per-axis offset of a sensor triplet, in the sensor's raw units.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Bias {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Bias {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn as_vector(&self) -> Vector3<f32> {
        Vector3::new(self.x, self.y, self.z)
    }
}

impl From<Vector3<f32>> for Bias {
    fn from(v: Vector3<f32>) -> Self {
        Self::new(v.x, v.y, v.z)
    }
}

/// Subtracts `bias` from every sample.
pub fn apply_bias(samples: &[Vector3<f32>], bias: Bias) -> Vec<Vector3<f32>> {
    let b = bias.as_vector();
    samples.iter().map(|s| s - b).collect()
}

/// Mean of a window recorded while the sensor was standing still. For a
/// gyroscope this is its zero-rate offset.
pub fn still_bias(samples: &[Vector3<f32>]) -> Result<Bias> {
    if samples.is_empty() {
        return Err(FilterError::EmptyInput);
    }
    let sum = samples.iter().fold(Vector3::<f32>::zeros(), |acc, s| acc + s);
    Ok(Bias::from(sum / samples.len() as f32))
}

/// Hard-iron offset of a magnetometer: the midpoint of the per-axis min/max
/// seen while the sensor was rotated through all orientations.
pub fn hard_iron_offset(samples: &[Vector3<f32>]) -> Result<Bias> {
    let first = samples.first().ok_or(FilterError::EmptyInput)?;
    let (min, max) = samples
        .iter()
        .fold((*first, *first), |(min, max), s| (min.inf(s), max.sup(s)));
    Ok(Bias::from((min + max) * 0.5))
}

/// Biases for all three sensor triplets of a [`RawImuData`] log.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ImuBiases {
    pub accel: Bias,
    /// deg/s, matching the raw gyro columns
    pub gyro: Bias,
    pub mag: Bias,
}

impl ImuBiases {
    /// Returns `raw` with every triplet corrected.
    pub fn correct(&self, raw: &RawImuData) -> RawImuData {
        RawImuData {
            time: raw.time,
            ax: raw.ax - self.accel.x,
            ay: raw.ay - self.accel.y,
            az: raw.az - self.accel.z,
            gx: raw.gx - self.gyro.x,
            gy: raw.gy - self.gyro.y,
            gz: raw.gz - self.gyro.z,
            mx: raw.mx - self.mag.x,
            my: raw.my - self.mag.y,
            mz: raw.mz - self.mag.z,
        }
    }
}
