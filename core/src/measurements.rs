//! Landmark observations and the measurement model used to weight particles.
//!
//! Observations are point detections in the vehicle frame (x forward, y left). To score a particle, the
//! observations are moved into the map frame using the particle's pose, each one is associated with the nearest
//! landmark the particle expects to see, and the residuals are scored with a zero-correlation bivariate Gaussian.
//!
//! Association is plain nearest neighbour with no gating: an observation whose nearest predicted landmark is far
//! away is still matched to it and simply contributes a very small likelihood. This keeps the update cheap and is
//! adequate when the map is sparse relative to the measurement noise.

use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt::{self, Display};

use crate::Pose;
use crate::error::{Result, check_positive_std};
use crate::map::{Landmark, Map};

/// A single landmark detection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// x coordinate in meters (vehicle frame unless stated otherwise)
    pub x: f64,
    /// y coordinate in meters
    pub y: f64,
    /// Identifier of the associated landmark, filled in by [associate]
    #[serde(default)]
    pub id: Option<u32>,
}
impl Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "Observation {{ x: {:.3}, y: {:.3}, id: {} }}", self.x, self.y, id),
            None => write!(f, "Observation {{ x: {:.3}, y: {:.3} }}", self.x, self.y),
        }
    }
}
impl Observation {
    pub fn new(x: f64, y: f64) -> Self {
        Observation { x, y, id: None }
    }
    pub fn point(&self) -> Point2<f64> {
        Point2::new(self.x, self.y)
    }
    /// Transform a vehicle-frame observation into the map frame given the vehicle pose.
    ///
    /// Rotation by `pose.theta` followed by translation by `(pose.x, pose.y)`.
    pub fn to_map_frame(&self, pose: &Pose) -> Observation {
        let p = pose.isometry().transform_point(&self.point());
        Observation {
            x: p.x,
            y: p.y,
            id: self.id,
        }
    }
    /// Inverse of [Observation::to_map_frame].
    pub fn to_vehicle_frame(&self, pose: &Pose) -> Observation {
        let p = pose.isometry().inverse_transform_point(&self.point());
        Observation {
            x: p.x,
            y: p.y,
            id: self.id,
        }
    }
}

/// Nearest landmark to a point and its distance.
///
/// Written as an explicit minimum reduction. On equal distances the landmark that appears first in `predicted`
/// is kept. Returns `None` when `predicted` is empty.
pub fn nearest_landmark<'a>(predicted: &'a [Landmark], x: f64, y: f64) -> Option<(&'a Landmark, f64)> {
    predicted.iter().fold(None, |best, landmark| {
        let distance = (landmark.x - x).hypot(landmark.y - y);
        match best {
            Some((_, best_distance)) if best_distance <= distance => best,
            _ => Some((landmark, distance)),
        }
    })
}

/// Associate each map-frame observation with its nearest predicted landmark.
///
/// Sets `id` on every observation to the identifier of its match, or to `None` when `predicted` is empty, and
/// returns the matched landmarks in observation order.
pub fn associate<'a>(predicted: &'a [Landmark], observations: &mut [Observation]) -> Vec<Option<&'a Landmark>> {
    observations
        .iter_mut()
        .map(|observation| {
            let matched = nearest_landmark(predicted, observation.x, observation.y).map(|(lm, _)| lm);
            observation.id = matched.map(|lm| lm.id);
            matched
        })
        .collect()
}

/// Zero-correlation bivariate Gaussian density evaluated at the residual `(dx, dy)`.
pub fn bivariate_gaussian(dx: f64, dy: f64, std_x: f64, std_y: f64) -> f64 {
    let normalizer = 1.0 / (2.0 * PI * std_x * std_y);
    let exponent = dx * dx / (2.0 * std_x * std_x) + dy * dy / (2.0 * std_y * std_y);
    normalizer * (-exponent).exp()
}

/// Natural logarithm of [bivariate_gaussian], finite for any finite residual.
pub fn log_bivariate_gaussian(dx: f64, dy: f64, std_x: f64, std_y: f64) -> f64 {
    let exponent = dx * dx / (2.0 * std_x * std_x) + dy * dy / (2.0 * std_y * std_y);
    -(2.0 * PI * std_x * std_y).ln() - exponent
}

/// Result of scoring one particle against the current observations.
///
/// The likelihood is carried as a logarithm: a product of many sharp densities leaves the range of `f64` long
/// before its logarithm does.
#[derive(Clone, Debug, PartialEq)]
pub struct WeightUpdate {
    /// Log of the new (unnormalized) importance weight, `-inf` for a pose that cannot explain the observations
    pub log_weight: f64,
    /// Identifiers of the landmarks matched to each observation, in observation order
    pub associations: Vec<u32>,
    /// Map-frame x of each associated observation
    pub sense_x: Vec<f64>,
    /// Map-frame y of each associated observation
    pub sense_y: Vec<f64>,
}
impl Default for WeightUpdate {
    fn default() -> Self {
        WeightUpdate {
            log_weight: f64::NEG_INFINITY,
            associations: Vec::new(),
            sense_x: Vec::new(),
            sense_y: Vec::new(),
        }
    }
}
impl WeightUpdate {
    /// The weight itself, which may overflow to `inf` or underflow to zero.
    pub fn weight(&self) -> f64 {
        self.log_weight.exp()
    }
}

/// Range-limited landmark measurement model.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LandmarkMeasurementModel {
    /// Maximum distance (m) at which a landmark can be observed
    pub sensor_range: f64,
    /// Measurement noise standard deviation along x and y (m)
    pub std_landmark: [f64; 2],
}
impl LandmarkMeasurementModel {
    pub fn new(sensor_range: f64, std_landmark: [f64; 2]) -> Self {
        LandmarkMeasurementModel {
            sensor_range,
            std_landmark,
        }
    }
    /// Check the sensor range and noise parameters before use.
    pub fn validate(&self) -> Result<()> {
        if !(self.sensor_range.is_finite() && self.sensor_range >= 0.0) {
            return Err(crate::FilterError::InvalidSensorRange(self.sensor_range));
        }
        check_positive_std("std_landmark[0]", self.std_landmark[0])?;
        check_positive_std("std_landmark[1]", self.std_landmark[1])
    }
    /// Score a single pose hypothesis.
    ///
    /// The weight is the product of per-observation likelihoods, assuming observations are conditionally
    /// independent given the pose, accumulated as a sum of log densities. A pose with no landmark in range cannot
    /// explain any observation and scores zero. An empty observation list scores one.
    pub fn evaluate(&self, pose: &Pose, observations: &[Observation], map: &Map) -> WeightUpdate {
        if observations.is_empty() {
            return WeightUpdate {
                log_weight: 0.0,
                ..Default::default()
            };
        }
        let predicted = map.within_range(pose, self.sensor_range);
        if predicted.is_empty() {
            return WeightUpdate::default();
        }
        let [std_x, std_y] = self.std_landmark;
        let mut transformed: Vec<Observation> = observations.iter().map(|o| o.to_map_frame(pose)).collect();
        let matches = associate(&predicted, &mut transformed);
        let mut update = WeightUpdate {
            log_weight: 0.0,
            associations: Vec::with_capacity(observations.len()),
            sense_x: Vec::with_capacity(observations.len()),
            sense_y: Vec::with_capacity(observations.len()),
        };
        // predicted is non-empty so every observation has a match
        for (observation, landmark) in transformed.iter().zip(matches) {
            let Some(landmark) = landmark else { continue };
            update.log_weight += log_bivariate_gaussian(
                observation.x - landmark.x,
                observation.y - landmark.y,
                std_x,
                std_y,
            );
            update.associations.push(landmark.id);
            update.sense_x.push(observation.x);
            update.sense_y.push(observation.y);
        }
        update
    }
}
