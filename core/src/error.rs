//! Error type for the localization toolbox.
//!
//! None of these conditions are fatal. Each is local to a single filter instance or a single load call and the
//! caller can recover, typically by fixing the input or re-initializing the filter.

use thiserror::Error;

/// Errors reported by the particle filter, configuration and data loaders.
#[derive(Debug, Error)]
pub enum FilterError {
    /// Prediction, update or resampling was requested before [crate::ParticleFilter::initialize].
    #[error("particle filter used before initialization")]
    NotInitialized,
    /// The particle count must be at least one.
    #[error("invalid particle count: {0} (must be at least 1)")]
    InvalidParticleCount(usize),
    /// A standard deviation was negative, non-finite, or zero where a strictly positive value is required.
    #[error("invalid noise parameter `{name}`: {value}")]
    InvalidNoise { name: &'static str, value: f64 },
    #[error("invalid time step: {0} s")]
    InvalidTimeStep(f64),
    /// Velocity and yaw rate must both be finite.
    #[error("invalid control input: velocity {velocity} m/s, yaw rate {yaw_rate} rad/s")]
    InvalidControl { velocity: f64, yaw_rate: f64 },
    #[error("invalid sensor range: {0} m")]
    InvalidSensorRange(f64),
    /// Configuration could not be parsed or written.
    #[error("configuration error: {0}")]
    Config(String),
    /// Input data is well-formed but inconsistent (e.g. mismatched table lengths).
    #[error("data error: {0}")]
    Data(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FilterError>;

/// Check that a standard deviation is finite and non-negative.
pub(crate) fn check_std(name: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(FilterError::InvalidNoise { name, value })
    }
}

/// Check that a standard deviation is finite and strictly positive.
pub(crate) fn check_positive_std(name: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(FilterError::InvalidNoise { name, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_std() {
        assert!(check_std("sigma", 0.0).is_ok());
        assert!(check_std("sigma", 1.5).is_ok());
        assert!(matches!(
            check_std("sigma", -1.0),
            Err(FilterError::InvalidNoise { name: "sigma", .. })
        ));
        assert!(check_std("sigma", f64::NAN).is_err());
        assert!(check_positive_std("sigma", 0.0).is_err());
        assert!(check_positive_std("sigma", f64::INFINITY).is_err());
    }
    #[test]
    fn test_display() {
        let err = FilterError::InvalidNoise {
            name: "std_landmark[0]",
            value: -0.3,
        };
        assert_eq!(err.to_string(), "invalid noise parameter `std_landmark[0]`: -0.3");
        assert_eq!(
            FilterError::NotInitialized.to_string(),
            "particle filter used before initialization"
        );
        assert_eq!(
            FilterError::InvalidControl {
                velocity: f64::NAN,
                yaw_rate: 0.5
            }
            .to_string(),
            "invalid control input: velocity NaN m/s, yaw rate 0.5 rad/s"
        );
    }
}
