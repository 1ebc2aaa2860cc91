/// Errors produced by the estimators. Every variant is recoverable: the filter
/// that raised it keeps its previous estimate.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FilterError {
    #[error("Dimension mismatch for {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Innovation covariance is ill-conditioned (condition number {condition_number:e})")]
    SingularInnovationCovariance { condition_number: f64 },

    #[error("Degenerate {sensor} reading: magnitude is (near) zero")]
    DegenerateSensorReading { sensor: Sensor },

    #[error("Non-finite value produced during {stage}")]
    NonFiniteResult { stage: &'static str },

    #[error("Empty input")]
    EmptyInput,
}

/// Sensor triplets fed to the orientation filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensor {
    Accelerometer,
    Magnetometer,
}

impl std::fmt::Display for Sensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sensor::Accelerometer => write!(f, "accelerometer"),
            Sensor::Magnetometer => write!(f, "magnetometer"),
        }
    }
}

pub type Result<T> = std::result::Result<T, FilterError>;
