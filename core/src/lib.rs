//! Monte Carlo localization toolbox for planar vehicles
//!
//! This crate provides a landmark-based particle filter for estimating the pose (position and heading) of a
//! vehicle moving in a plane. A population of weighted pose hypotheses ("particles") is propagated through a
//! motion model, reweighted against landmark observations matched to a known map, and resampled to concentrate
//! probability mass on likely poses. The filter is a per-timestep, in-memory computation driven by an external
//! control loop. It does not talk to sensors and it does not persist its state between runs. Observations and
//! the map are assumed to be supplied by the caller, although the [sim] module contains CSV loaders and a replay
//! driver for recorded or synthetic runs.
//!
//! This crate is primarily built off of three additional dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the planar rigid transforms between the vehicle and map frames.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): Provides random number generation for process noise, initialization and resampling.
//! - [`serde`](https://crates.io/crates/serde) and [`csv`](https://crates.io/crates/csv): Provides configuration and data file I/O.
//!
//! ## Crate overview
//!
//! This crate is organized into several modules:
//! - [config]: Serializable filter and simulation configuration (JSON/YAML/TOML).
//! - [diagnostics]: Per-particle association reporting and its text rendering.
//! - [error]: The [FilterError] type returned by fallible operations.
//! - [map]: Known landmark map.
//! - [measurements]: Observation frame transforms, data association, and the landmark measurement likelihood.
//! - [particle]: The particle filter itself: initialization, prediction, weight update, resampling and estimation.
//! - [sim]: Data loading, synthetic observations and the replay driver.
//!
//! ## Coordinate and state definitions
//!
//! The pose of the vehicle is the three-element state
//!
//! $$
//! x = [p_x, p_y, \theta]
//! $$
//!
//! where $p_x$ and $p_y$ are map-frame coordinates (meters) and $\theta$ is the heading (radians) measured
//! counter-clockwise from the map $x$ axis. Headings are not wrapped by the filter; wrapping is applied only when
//! comparing headings (see [wrap_to_pi]).
//!
//! ## Motion model
//!
//! Prediction uses a constant turn rate and velocity (CTRV) model driven by a control input of forward velocity
//! $v$ and yaw rate $\dot\psi$ over a time step $t$:
//!
//! $$
//! \theta(+) = \theta(-) + \dot\psi t
//! $$
//!
//! $$
//! p_x(+) = p_x(-) + \frac{v}{\dot\psi} \left( \sin\theta(+) - \sin\theta(-) \right)
//! $$
//!
//! $$
//! p_y(+) = p_y(-) + \frac{v}{\dot\psi} \left( \cos\theta(-) - \cos\theta(+) \right)
//! $$
//!
//! The turning form is singular as $\dot\psi \rightarrow 0$. Below [YAW_RATE_EPSILON] the straight-line limit is
//! used instead:
//!
//! $$
//! p_x(+) = p_x(-) + v t \cos\theta, \quad p_y(+) = p_y(-) + v t \sin\theta, \quad \theta(+) = \theta(-)
//! $$
//!
//! The choice between the two is made once per call by [MotionModel::from_control] so the division hazard never
//! reaches the arithmetic.
//!
//! ## Measurement model
//!
//! Observations arrive in the vehicle frame. For each particle they are rotated by the particle heading and
//! translated by its position to land in the map frame, associated with the nearest landmark that lies within
//! sensor range of the particle, and scored with a zero-correlation bivariate Gaussian:
//!
//! $$
//! p(z \mid x) = \prod_i \frac{1}{2 \pi \sigma_x \sigma_y} \exp\left( -\frac{(z_{x,i} - \mu_{x,i})^2}{2 \sigma_x^2} - \frac{(z_{y,i} - \mu_{y,i})^2}{2 \sigma_y^2} \right)
//! $$
//!
//! See [measurements] for details.

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod map;
pub mod measurements;
pub mod particle;
pub mod sim;

pub use error::{FilterError, Result};
pub use map::{Landmark, Map};
pub use measurements::Observation;
pub use particle::{Particle, ParticleFilter};

use nalgebra::{Isometry2, Point2, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt::{self, Display};

/// Yaw rates with a magnitude below this threshold (rad/s) are propagated with the straight-line motion model.
pub const YAW_RATE_EPSILON: f64 = 1e-5;

/// Planar pose of the vehicle (or of a single particle) in map coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// Map-frame x coordinate in meters
    pub x: f64,
    /// Map-frame y coordinate in meters
    pub y: f64,
    /// Heading in radians, counter-clockwise from the map x axis
    pub theta: f64,
}
impl Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pose {{ x: {:.4} m, y: {:.4} m, theta: {:.4} rad }}",
            self.x, self.y, self.theta
        )
    }
}
impl From<[f64; 3]> for Pose {
    fn from(v: [f64; 3]) -> Self {
        Pose::new(v[0], v[1], v[2])
    }
}
impl From<Pose> for Vector3<f64> {
    fn from(pose: Pose) -> Self {
        Vector3::new(pose.x, pose.y, pose.theta)
    }
}
impl From<Vector3<f64>> for Pose {
    fn from(v: Vector3<f64>) -> Self {
        Pose::new(v[0], v[1], v[2])
    }
}
impl Pose {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Pose { x, y, theta }
    }
    /// Map-frame position as a point
    pub fn position(&self) -> Point2<f64> {
        Point2::new(self.x, self.y)
    }
    /// Rigid transform taking vehicle-frame coordinates into the map frame.
    pub fn isometry(&self) -> Isometry2<f64> {
        Isometry2::new(Vector2::new(self.x, self.y), self.theta)
    }
    /// Euclidean distance from this pose's position to a map-frame point
    pub fn distance_to(&self, x: f64, y: f64) -> f64 {
        (self.x - x).hypot(self.y - y)
    }
    /// `true` when every component is finite
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.theta.is_finite()
    }
}

/// Control signals applied over one prediction step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlInput {
    /// Forward velocity in m/s
    pub velocity: f64,
    /// Yaw rate in rad/s
    pub yaw_rate: f64,
}
impl Display for ControlInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ControlInput {{ velocity: {:.3} m/s, yaw_rate: {:.4} rad/s }}",
            self.velocity, self.yaw_rate
        )
    }
}
impl ControlInput {
    pub fn new(velocity: f64, yaw_rate: f64) -> Self {
        ControlInput { velocity, yaw_rate }
    }
}

/// Deterministic part of the vehicle motion model.
///
/// The two variants are the CTRV model proper and its zero-yaw-rate limit. Construct with
/// [MotionModel::from_control] so the selection is always made against [YAW_RATE_EPSILON].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MotionModel {
    /// Constant turn rate and velocity
    Turning { velocity: f64, yaw_rate: f64 },
    /// Constant heading and velocity
    Straight { velocity: f64 },
}
impl MotionModel {
    /// Select the motion model variant appropriate for the given control input.
    ///
    /// # Example
    /// ```rust
    /// use mcl::{ControlInput, MotionModel};
    /// let model = MotionModel::from_control(ControlInput::new(10.0, 0.0));
    /// assert_eq!(model, MotionModel::Straight { velocity: 10.0 });
    /// ```
    pub fn from_control(control: ControlInput) -> Self {
        if control.yaw_rate.abs() < YAW_RATE_EPSILON {
            MotionModel::Straight {
                velocity: control.velocity,
            }
        } else {
            MotionModel::Turning {
                velocity: control.velocity,
                yaw_rate: control.yaw_rate,
            }
        }
    }
    /// Propagate a pose over `dt` seconds without noise.
    pub fn propagate(&self, pose: &Pose, dt: f64) -> Pose {
        match *self {
            MotionModel::Turning { velocity, yaw_rate } => {
                let theta = pose.theta + yaw_rate * dt;
                let radius = velocity / yaw_rate;
                Pose {
                    x: pose.x + radius * (theta.sin() - pose.theta.sin()),
                    y: pose.y + radius * (pose.theta.cos() - theta.cos()),
                    theta,
                }
            }
            MotionModel::Straight { velocity } => Pose {
                x: pose.x + velocity * dt * pose.theta.cos(),
                y: pose.y + velocity * dt * pose.theta.sin(),
                theta: pose.theta,
            },
        }
    }
}

/// Noise-free forward propagation of a pose under a control input.
///
/// This is the deterministic half of the particle filter's prediction step. Process noise is added by
/// [ParticleFilter::predict].
///
/// # Example
/// ```rust
/// use mcl::{ControlInput, Pose, forward};
/// let mut pose = Pose::new(0.0, 0.0, 0.0);
/// forward(&mut pose, ControlInput::new(1.0, 0.0), 2.0);
/// assert!((pose.x - 2.0).abs() < 1e-12);
/// ```
pub fn forward(pose: &mut Pose, control: ControlInput, dt: f64) {
    *pose = MotionModel::from_control(control).propagate(pose, dt);
}

/// Wrap an angle to the range $[-\pi, \pi]$ radians
///
/// Computed with a single Euclidean remainder, so arbitrarily large angles take constant time. Non-finite input
/// gives NaN.
///
/// # Example
/// ```rust
/// use mcl::wrap_to_pi;
/// use std::f64::consts::PI;
/// let wrapped_angle = wrap_to_pi(3.0 * PI / 2.0);
/// assert!((wrapped_angle + PI / 2.0).abs() < 1e-12);
/// ```
pub fn wrap_to_pi(angle: f64) -> f64 {
    (angle + PI).rem_euclid(2.0 * PI) - PI
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::{FRAC_PI_2, PI};

    #[test]
    fn test_motion_model_selection() {
        assert_eq!(
            MotionModel::from_control(ControlInput::new(5.0, 0.0)),
            MotionModel::Straight { velocity: 5.0 }
        );
        assert_eq!(
            MotionModel::from_control(ControlInput::new(5.0, 1e-9)),
            MotionModel::Straight { velocity: 5.0 }
        );
        assert_eq!(
            MotionModel::from_control(ControlInput::new(5.0, -0.2)),
            MotionModel::Turning {
                velocity: 5.0,
                yaw_rate: -0.2
            }
        );
    }
    #[test]
    fn test_zero_yaw_rate_matches_straight_line() {
        let start = Pose::new(102.0, 65.0, 5.0 * PI / 8.0);
        let (v, dt) = (110.0, 0.1);
        let mut pose = start;
        forward(&mut pose, ControlInput::new(v, 0.0), dt);
        assert!(pose.is_finite());
        assert_eq!(pose.x, start.x + v * dt * start.theta.cos());
        assert_eq!(pose.y, start.y + v * dt * start.theta.sin());
        assert_eq!(pose.theta, start.theta);
    }
    #[test]
    fn test_turning_motion() {
        // Values from the classic CTRV worked example
        let mut pose = Pose::new(102.0, 65.0, 5.0 * PI / 8.0);
        forward(&mut pose, ControlInput::new(110.0, PI / 8.0), 0.1);
        assert_approx_eq!(pose.x, 97.59, 1e-2);
        assert_approx_eq!(pose.y, 75.08, 1e-2);
        assert_approx_eq!(pose.theta, 51.0 * PI / 80.0, 1e-9);
    }
    #[test]
    fn test_quarter_circle() {
        // v = 1 m/s, yaw rate = pi/2 rad/s for 1 s traces a unit-radius quarter circle
        let mut pose = Pose::new(0.0, 0.0, 0.0);
        forward(&mut pose, ControlInput::new(1.0, FRAC_PI_2), 1.0);
        let radius = 1.0 / FRAC_PI_2;
        assert_approx_eq!(pose.x, radius, 1e-12);
        assert_approx_eq!(pose.y, radius, 1e-12);
        assert_approx_eq!(pose.theta, FRAC_PI_2, 1e-12);
    }
    #[test]
    fn test_zero_velocity_keeps_position() {
        let mut pose = Pose::new(3.0, -4.0, 1.0);
        forward(&mut pose, ControlInput::new(0.0, 0.5), 2.0);
        assert_approx_eq!(pose.x, 3.0, 1e-12);
        assert_approx_eq!(pose.y, -4.0, 1e-12);
        assert_approx_eq!(pose.theta, 2.0, 1e-12);
    }
    #[test]
    fn test_pose_conversions() {
        let pose = Pose::from([1.0, 2.0, 0.5]);
        let v: Vector3<f64> = pose.into();
        assert_eq!(Pose::from(v), pose);
        assert_approx_eq!(pose.distance_to(4.0, 6.0), 5.0, 1e-12);
        let iso = pose.isometry();
        assert_approx_eq!(iso.translation.vector[0], 1.0, 1e-12);
        assert_approx_eq!(iso.rotation.angle(), 0.5, 1e-12);
    }
    #[test]
    fn test_wrap_to_pi() {
        // Odd multiples of pi sit on the seam and may land on either end
        assert_approx_eq!(wrap_to_pi(3.0 * PI).abs(), PI, 1e-12);
        assert_approx_eq!(wrap_to_pi(-3.0 * PI).abs(), PI, 1e-12);
        assert_approx_eq!(wrap_to_pi(-2.5 * PI), -0.5 * PI, 1e-12);
        assert_eq!(wrap_to_pi(0.0), 0.0);
        assert_approx_eq!(wrap_to_pi(2.5 * PI), 0.5 * PI, 1e-12);
    }
    #[test]
    fn test_wrap_to_pi_extreme_angles() {
        for angle in [1e17, -1e17, 3.7e300, f64::MAX] {
            let wrapped = wrap_to_pi(angle);
            assert!((-PI..=PI).contains(&wrapped), "{angle} -> {wrapped}");
        }
        assert!(wrap_to_pi(f64::INFINITY).is_nan());
        assert!(wrap_to_pi(f64::NEG_INFINITY).is_nan());
        assert!(wrap_to_pi(f64::NAN).is_nan());
    }
}
