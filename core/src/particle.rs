//! Landmark particle filter.
//!
//! The filter owns a fixed-size population of [Particle]s, each a pose hypothesis carrying its own importance
//! weight, together with a seeded random number generator that is advanced across calls. A run looks like:
//!
//! 1. [ParticleFilter::initialize] once, from a coarse pose estimate and its uncertainty.
//! 2. Each timestep: [ParticleFilter::predict] with the control input, [ParticleFilter::update_weights] with the
//!    observations and map, then [ParticleFilter::resample].
//! 3. On demand: [ParticleFilter::best_particle] or [ParticleFilter::get_estimate].
//!
//! Weights are unnormalized. The weight update replaces the previous weight rather than accumulating it, so the
//! resampling step after every update is what carries information forward in time. When the largest new weight
//! would overflow or fall below the normal `f64` range, all weights of that update are divided by it, so the best
//! particle scores exactly 1.0 and the ratios between particles are kept.
//!
//! # Example
//!
//! ```rust
//! use mcl::{Landmark, Map, Observation, ParticleFilter};
//!
//! let map = Map::new(vec![Landmark::new(1, 5.0, 0.0), Landmark::new(2, 0.0, 5.0)]);
//! let mut pf = ParticleFilter::new_with_seed(200, 42).unwrap();
//! pf.initialize(0.0, 0.0, 0.0, [0.3, 0.3, 0.01]).unwrap();
//!
//! pf.predict(0.1, [0.3, 0.3, 0.01], 1.0, 0.0).unwrap();
//! let observations = vec![Observation::new(4.9, 0.0), Observation::new(-0.1, 5.0)];
//! pf.update_weights(50.0, [0.3, 0.3], &observations, &map).unwrap();
//! pf.resample().unwrap();
//!
//! let estimate = pf.get_estimate().unwrap();
//! assert!(estimate.x.abs() < 1.0);
//! ```

use log::{debug, trace, warn};
use nalgebra::Matrix3;
use rand::distr::weighted::WeightedIndex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt::{self, Debug, Display};
use std::str::FromStr;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::config::FilterConfig;
use crate::error::{FilterError, Result, check_std};
use crate::map::Map;
use crate::measurements::{LandmarkMeasurementModel, Observation, WeightUpdate};
use crate::{ControlInput, MotionModel, Pose, wrap_to_pi};

/// A single pose hypothesis.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Particle {
    /// Index of the particle within its generation
    pub id: usize,
    pub pose: Pose,
    /// Unnormalized importance weight
    pub weight: f64,
    /// Landmark identifiers matched during the last weight update
    pub associations: Vec<u32>,
    /// Map-frame x of each associated observation
    pub sense_x: Vec<f64>,
    /// Map-frame y of each associated observation
    pub sense_y: Vec<f64>,
}
impl Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("id", &self.id)
            .field("x", &self.pose.x)
            .field("y", &self.pose.y)
            .field("theta", &self.pose.theta)
            .field("weight", &self.weight)
            .field("associations", &self.associations.len())
            .finish()
    }
}
impl Particle {
    pub fn new(id: usize, pose: Pose, weight: f64) -> Particle {
        Particle {
            id,
            pose,
            weight,
            ..Default::default()
        }
    }
    /// Drop association diagnostics from a previous update.
    pub fn clear_diagnostics(&mut self) {
        self.associations.clear();
        self.sense_x.clear();
        self.sense_y.clear();
    }
    /// Take the weight and diagnostics of a fresh update, dividing the weight by `exp(log_offset)`.
    fn apply(&mut self, update: WeightUpdate, log_offset: f64) {
        self.weight = (update.log_weight - log_offset).exp();
        self.associations = update.associations;
        self.sense_x = update.sense_x;
        self.sense_y = update.sense_y;
    }
}

/// How the particle population is reduced to a single pose estimate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticleAveragingStrategy {
    #[default]
    WeightedAverage,
    UnweightedAverage,
    HighestWeight,
}
impl FromStr for ParticleAveragingStrategy {
    type Err = FilterError;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "weighted_average" | "weighted" => Ok(ParticleAveragingStrategy::WeightedAverage),
            "unweighted_average" | "unweighted" => Ok(ParticleAveragingStrategy::UnweightedAverage),
            "highest_weight" | "best" => Ok(ParticleAveragingStrategy::HighestWeight),
            other => Err(FilterError::Config(format!("unknown averaging strategy '{other}'"))),
        }
    }
}

/// How a new generation is drawn from the weighted population.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticleResamplingStrategy {
    /// Independent draws with replacement, probability proportional to weight
    #[default]
    Multinomial,
    /// A single uniform offset and evenly spaced positions over the cumulative weights
    Systematic,
    /// One uniform draw inside each of `n` equal strata of the cumulative weights
    Stratified,
    /// Deterministic copies of the integer part of `n * w`, systematic draws over the remainders
    Residual,
}
impl FromStr for ParticleResamplingStrategy {
    type Err = FilterError;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "multinomial" => Ok(ParticleResamplingStrategy::Multinomial),
            "systematic" => Ok(ParticleResamplingStrategy::Systematic),
            "stratified" => Ok(ParticleResamplingStrategy::Stratified),
            "residual" => Ok(ParticleResamplingStrategy::Residual),
            other => Err(FilterError::Config(format!("unknown resampling strategy '{other}'"))),
        }
    }
}

impl ParticleResamplingStrategy {
    /// Draw `n` source indices from a weight sequence.
    ///
    /// Weights need not be normalized. When the weights carry no usable mass (empty, all zero, negative or NaN)
    /// every index is drawn uniformly instead. Infinite weights are drawn uniformly among themselves.
    pub fn resample_indices<R: Rng + ?Sized>(&self, weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
        if weights.is_empty() || n == 0 {
            return Vec::new();
        }
        if is_degenerate(weights) {
            return (0..n).map(|_| rng.random_range(0..weights.len())).collect();
        }
        let weights = finite_weights(weights);
        let weights: &[f64] = &weights;
        match self {
            ParticleResamplingStrategy::Multinomial => Self::multinomial_resample(weights, n, rng),
            ParticleResamplingStrategy::Systematic => {
                let offset: f64 = rng.random();
                let step = weights.iter().sum::<f64>() / n as f64;
                select_sorted(weights, (0..n).map(|j| (j as f64 + offset) * step))
            }
            ParticleResamplingStrategy::Stratified => {
                let step = weights.iter().sum::<f64>() / n as f64;
                let positions: Vec<f64> = (0..n).map(|j| (j as f64 + rng.random::<f64>()) * step).collect();
                select_sorted(weights, positions.into_iter())
            }
            ParticleResamplingStrategy::Residual => Self::residual_resample(weights, n, rng),
        }
    }
    fn multinomial_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
        match WeightedIndex::new(weights) {
            Ok(dist) => (0..n).map(|_| dist.sample(rng)).collect(),
            Err(e) => {
                warn!("Weighted draw unavailable ({e}), falling back to uniform resampling");
                (0..n).map(|_| rng.random_range(0..weights.len())).collect()
            }
        }
    }
    fn residual_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
        let total: f64 = weights.iter().sum();
        let mut indices = Vec::<usize>::with_capacity(n);
        let mut residual: Vec<f64> = vec![0.0; weights.len()];
        for (i, &w) in weights.iter().enumerate() {
            let scaled = w / total * n as f64;
            let copies = scaled.floor() as usize;
            indices.extend(std::iter::repeat_n(i, copies));
            residual[i] = scaled - copies as f64;
        }
        indices.truncate(n);
        let remaining = n - indices.len();
        if remaining > 0 {
            let sum_residual: f64 = residual.iter().sum();
            if sum_residual > 0.0 {
                let step = sum_residual / remaining as f64;
                let offset: f64 = rng.random();
                indices.extend(select_sorted(
                    &residual,
                    (0..remaining).map(|j| (j as f64 + offset) * step),
                ));
            } else {
                indices.extend((0..remaining).map(|_| rng.random_range(0..weights.len())));
            }
        }
        indices
    }
}

/// `true` when a weight sequence cannot be used as a sampling distribution.
///
/// That is an empty sequence, any negative or NaN weight, or all weights zero. Infinite weights are usable, see
/// [finite_weights].
pub fn is_degenerate(weights: &[f64]) -> bool {
    weights.is_empty() || weights.iter().any(|w| !(*w >= 0.0)) || weights.iter().all(|w| *w == 0.0)
}

/// Bring a non-degenerate weight sequence into a range where its sum is finite.
///
/// Infinite weights outrank every finite one, so they become 1.0 and everything else 0.0. Finite weights whose
/// sum overflows are divided by the largest weight.
fn finite_weights(weights: &[f64]) -> Cow<'_, [f64]> {
    let max = weights.iter().copied().fold(0.0, f64::max);
    if max == f64::INFINITY {
        Cow::Owned(weights.iter().map(|&w| if w == f64::INFINITY { 1.0 } else { 0.0 }).collect())
    } else if !weights.iter().sum::<f64>().is_finite() {
        Cow::Owned(weights.iter().map(|w| w / max).collect())
    } else {
        Cow::Borrowed(weights)
    }
}

/// Offset subtracted from every log weight before exponentiating.
///
/// Zero while the largest weight is a normal `f64`, so weights keep their absolute scale. Otherwise the largest
/// log weight, which puts the best particle at exactly 1.0 and keeps every ratio between particles.
fn log_weight_offset(log_weights: impl Iterator<Item = f64>) -> f64 {
    let max = log_weights.fold(f64::NEG_INFINITY, f64::max);
    if max.is_finite() && !max.exp().is_normal() { max } else { 0.0 }
}

/// Walk the cumulative weights once for an ascending sequence of positions in `[0, sum(weights))`.
fn select_sorted(weights: &[f64], positions: impl Iterator<Item = f64>) -> Vec<usize> {
    let last = weights.len() - 1;
    let mut i = 0;
    let mut cumsum = weights[0];
    let mut out = Vec::with_capacity(weights.len());
    for u in positions {
        while u >= cumsum && i < last {
            i += 1;
            cumsum += weights[i];
        }
        out.push(i);
    }
    out
}

/// Monte Carlo localization filter over planar poses.
#[derive(Clone)]
pub struct ParticleFilter {
    particles: Vec<Particle>,
    num_particles: usize,
    rng: StdRng,
    is_initialized: bool,
    pub resampling_strategy: ParticleResamplingStrategy,
    pub averaging_strategy: ParticleAveragingStrategy,
}
impl Debug for ParticleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let min_weight = self.particles.iter().map(|p| p.weight).fold(f64::INFINITY, f64::min);
        let max_weight = self.particles.iter().map(|p| p.weight).fold(0.0, f64::max);
        let mut s = f.debug_struct("ParticleFilter");
        s.field("num_particles", &self.num_particles)
            .field("initialized", &self.is_initialized)
            .field("effective_particles", &self.effective_sample_size())
            .field(
                "weight_range",
                &format_args!("[{:.4e}, {:.4e}]", min_weight, max_weight),
            );
        if let Ok(mean) = self.get_estimate() {
            s.field(
                "estimate",
                &format_args!("({:.3} m, {:.3} m, {:.4} rad)", mean.x, mean.y, mean.theta),
            );
        }
        s.finish()
    }
}
impl ParticleFilter {
    /// Create an uninitialized filter with an entropy-seeded generator.
    pub fn new(num_particles: usize) -> Result<Self> {
        Self::new_with_seed(num_particles, rand::random())
    }
    /// Create an uninitialized filter with a specific random seed.
    ///
    /// Two filters built with the same seed and driven with the same inputs produce identical particles.
    pub fn new_with_seed(num_particles: usize, seed: u64) -> Result<Self> {
        if num_particles == 0 {
            return Err(FilterError::InvalidParticleCount(num_particles));
        }
        Ok(ParticleFilter {
            particles: Vec::with_capacity(num_particles),
            num_particles,
            rng: StdRng::seed_from_u64(seed),
            is_initialized: false,
            resampling_strategy: ParticleResamplingStrategy::default(),
            averaging_strategy: ParticleAveragingStrategy::default(),
        })
    }
    /// Create an uninitialized filter from a [FilterConfig].
    pub fn from_config(config: &FilterConfig) -> Result<Self> {
        let pf = match config.seed {
            Some(seed) => Self::new_with_seed(config.num_particles, seed)?,
            None => Self::new(config.num_particles)?,
        };
        Ok(pf.with_strategies(config.resampling, config.averaging))
    }
    pub fn with_strategies(
        mut self,
        resampling: ParticleResamplingStrategy,
        averaging: ParticleAveragingStrategy,
    ) -> Self {
        self.resampling_strategy = resampling;
        self.averaging_strategy = averaging;
        self
    }

    /// Seed the particle population around a prior pose estimate.
    ///
    /// Each pose component is sampled independently from a Gaussian centered on that component of the estimate.
    /// All weights start at 1.0. Calling this again discards the current population.
    ///
    /// # Arguments
    /// * `x`, `y`, `theta` - Prior pose estimate (m, m, rad).
    /// * `std` - Standard deviation of the estimate for x, y and theta.
    pub fn initialize(&mut self, x: f64, y: f64, theta: f64, std: [f64; 3]) -> Result<()> {
        let dist_x = normal("std[0]", x, std[0])?;
        let dist_y = normal("std[1]", y, std[1])?;
        let dist_theta = normal("std[2]", theta, std[2])?;
        let rng = &mut self.rng;
        self.particles = (0..self.num_particles)
            .map(|id| {
                let pose = Pose::new(dist_x.sample(rng), dist_y.sample(rng), dist_theta.sample(rng));
                Particle::new(id, pose, 1.0)
            })
            .collect();
        self.is_initialized = true;
        debug!(
            "Initialized {} particles around ({:.3}, {:.3}, {:.4})",
            self.num_particles, x, y, theta
        );
        Ok(())
    }

    /// Propagate every particle through the motion model and add process noise.
    ///
    /// # Arguments
    /// * `delta_t` - Elapsed time (s).
    /// * `std_pos` - Process noise standard deviation for x, y and theta.
    /// * `velocity` - Forward velocity (m/s).
    /// * `yaw_rate` - Yaw rate (rad/s). Magnitudes below [crate::YAW_RATE_EPSILON] use the straight-line model.
    pub fn predict(&mut self, delta_t: f64, std_pos: [f64; 3], velocity: f64, yaw_rate: f64) -> Result<()> {
        self.ensure_initialized()?;
        if !(delta_t.is_finite() && delta_t >= 0.0) {
            return Err(FilterError::InvalidTimeStep(delta_t));
        }
        if !(velocity.is_finite() && yaw_rate.is_finite()) {
            return Err(FilterError::InvalidControl { velocity, yaw_rate });
        }
        let noise_x = normal("std_pos[0]", 0.0, std_pos[0])?;
        let noise_y = normal("std_pos[1]", 0.0, std_pos[1])?;
        let noise_theta = normal("std_pos[2]", 0.0, std_pos[2])?;
        let model = MotionModel::from_control(ControlInput::new(velocity, yaw_rate));
        // One independent stream per particle keeps results identical whether or not the loop runs in parallel.
        let seeds: Vec<u64> = (0..self.particles.len()).map(|_| self.rng.random()).collect();
        let step = |particle: &mut Particle, seed: u64| {
            let mut rng = StdRng::seed_from_u64(seed);
            let pose = model.propagate(&particle.pose, delta_t);
            particle.pose = Pose {
                x: pose.x + noise_x.sample(&mut rng),
                y: pose.y + noise_y.sample(&mut rng),
                theta: pose.theta + noise_theta.sample(&mut rng),
            };
        };
        #[cfg(feature = "parallel")]
        self.particles
            .par_iter_mut()
            .zip(seeds.par_iter())
            .for_each(|(particle, &seed)| step(particle, seed));
        #[cfg(not(feature = "parallel"))]
        self.particles
            .iter_mut()
            .zip(seeds)
            .for_each(|(particle, seed)| step(particle, seed));
        trace!("Predicted {} particles with {:?} over {} s", self.particles.len(), model, delta_t);
        Ok(())
    }

    /// Reweight every particle against the current observations.
    ///
    /// # Arguments
    /// * `sensor_range` - Maximum landmark distance (m) considered observable from a particle.
    /// * `std_landmark` - Measurement noise standard deviation for x and y (m).
    /// * `observations` - Observations in the vehicle frame.
    /// * `map` - Known landmarks.
    pub fn update_weights(
        &mut self,
        sensor_range: f64,
        std_landmark: [f64; 2],
        observations: &[Observation],
        map: &Map,
    ) -> Result<()> {
        let model = LandmarkMeasurementModel::new(sensor_range, std_landmark);
        self.update(&model, observations, map)
    }

    /// Reweight every particle with an explicit measurement model.
    pub fn update(
        &mut self,
        model: &LandmarkMeasurementModel,
        observations: &[Observation],
        map: &Map,
    ) -> Result<()> {
        self.ensure_initialized()?;
        model.validate()?;
        let score = |particle: &Particle| model.evaluate(&particle.pose, observations, map);
        #[cfg(feature = "parallel")]
        let updates: Vec<WeightUpdate> = self.particles.par_iter().map(score).collect();
        #[cfg(not(feature = "parallel"))]
        let updates: Vec<WeightUpdate> = self.particles.iter().map(score).collect();

        let log_offset = log_weight_offset(updates.iter().map(|u| u.log_weight));
        if log_offset != 0.0 {
            debug!("Weights rescaled by exp({:.1}) to stay representable", -log_offset);
        }
        for (particle, update) in self.particles.iter_mut().zip(updates) {
            particle.apply(update, log_offset);
        }

        let blind = self
            .particles
            .iter()
            .filter(|p| p.weight == 0.0 && !observations.is_empty())
            .count();
        if blind == self.particles.len() {
            warn!(
                "No particle can explain the {} observations; weights are all zero",
                observations.len()
            );
        } else if blind > 0 {
            debug!("{blind} particles scored zero");
        }
        debug!(
            "Updated weights against {} observations, effective sample size {:.1}",
            observations.len(),
            self.effective_sample_size()
        );
        Ok(())
    }

    /// Replace the population with `num_particles` draws proportional to weight.
    ///
    /// The new generation consists of independent copies of the selected poses with identifiers `0..n`, weight
    /// 1.0, and no diagnostics. If the weights are degenerate (see [ParticleFilter::is_degenerate]) the draw is
    /// uniform.
    pub fn resample(&mut self) -> Result<()> {
        self.ensure_initialized()?;
        let weights = self.weights();
        if is_degenerate(&weights) {
            warn!("Degenerate particle weights, resampling uniformly");
        }
        let indices = self
            .resampling_strategy
            .resample_indices(&weights, self.num_particles, &mut self.rng);
        self.particles = indices
            .iter()
            .enumerate()
            .map(|(id, &i)| Particle::new(id, self.particles[i].pose, 1.0))
            .collect();
        trace!("Resampled with {:?}", self.resampling_strategy);
        Ok(())
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }
    pub fn particles_mut(&mut self) -> &mut [Particle] {
        &mut self.particles
    }
    pub fn num_particles(&self) -> usize {
        self.num_particles
    }
    pub fn is_initialized(&self) -> bool {
        self.is_initialized
    }
    /// Current weights in particle order.
    pub fn weights(&self) -> Vec<f64> {
        self.particles.iter().map(|p| p.weight).collect()
    }
    /// Weights scaled to sum to one, or uniform when the weights are degenerate.
    pub fn normalized_weights(&self) -> Vec<f64> {
        let weights = self.weights();
        if is_degenerate(&weights) {
            let uniform = 1.0 / weights.len().max(1) as f64;
            return vec![uniform; weights.len()];
        }
        let weights = finite_weights(&weights);
        let sum: f64 = weights.iter().sum();
        weights.iter().map(|w| w / sum).collect()
    }
    /// `true` when the current weights cannot drive a proportional draw.
    pub fn is_degenerate(&self) -> bool {
        is_degenerate(&self.weights())
    }
    /// Effective sample size, $(\sum w)^2 / \sum w^2$, or zero when the weights are degenerate.
    pub fn effective_sample_size(&self) -> f64 {
        let weights = self.weights();
        if is_degenerate(&weights) {
            return 0.0;
        }
        // Scaled by the largest weight so the squares neither overflow nor underflow
        let weights = finite_weights(&weights);
        let max = weights.iter().copied().fold(0.0, f64::max);
        let sum: f64 = weights.iter().map(|w| w / max).sum();
        let sum_of_squares: f64 = weights.iter().map(|w| (w / max).powi(2)).sum();
        sum * sum / sum_of_squares
    }
    /// Particle with the highest weight (first on ties).
    pub fn best_particle(&self) -> Result<&Particle> {
        self.ensure_initialized()?;
        self.particles
            .iter()
            .reduce(|best, p| if p.weight > best.weight { p } else { best })
            .ok_or(FilterError::NotInitialized)
    }
    /// Pose estimate according to [ParticleFilter::averaging_strategy].
    pub fn get_estimate(&self) -> Result<Pose> {
        self.ensure_initialized()?;
        Ok(match self.averaging_strategy {
            ParticleAveragingStrategy::WeightedAverage => self.mean_pose(&self.normalized_weights()),
            ParticleAveragingStrategy::UnweightedAverage => {
                let n = self.particles.len() as f64;
                self.mean_pose(&vec![1.0 / n; self.particles.len()])
            }
            ParticleAveragingStrategy::HighestWeight => self.best_particle()?.pose,
        })
    }
    /// Weighted sample covariance of the population about the current estimate.
    ///
    /// Heading residuals are wrapped to $[-\pi, \pi]$ before accumulation.
    pub fn get_certainty(&self) -> Result<Matrix3<f64>> {
        let mean = self.get_estimate()?;
        let weights = self.normalized_weights();
        let mut cov = Matrix3::<f64>::zeros();
        for (particle, w) in self.particles.iter().zip(weights) {
            let diff = nalgebra::Vector3::new(
                particle.pose.x - mean.x,
                particle.pose.y - mean.y,
                wrap_to_pi(particle.pose.theta - mean.theta),
            );
            cov += w * diff * diff.transpose();
        }
        Ok(cov)
    }
    fn mean_pose(&self, weights: &[f64]) -> Pose {
        let (mut x, mut y, mut sin, mut cos) = (0.0, 0.0, 0.0, 0.0);
        for (particle, w) in self.particles.iter().zip(weights) {
            x += w * particle.pose.x;
            y += w * particle.pose.y;
            sin += w * particle.pose.theta.sin();
            cos += w * particle.pose.theta.cos();
        }
        Pose::new(x, y, sin.atan2(cos))
    }
    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized {
            Ok(())
        } else {
            Err(FilterError::NotInitialized)
        }
    }
}

fn normal(name: &'static str, mean: f64, std: f64) -> Result<Normal<f64>> {
    check_std(name, std)?;
    Normal::new(mean, std).map_err(|_| FilterError::InvalidNoise { name, value: std })
}
