//! Data loading, synthetic data generation and the replay driver.
//!
//! This module provides:
//! - Record types for the control, observation and ground-truth tables and CSV import/export for each
//! - [Dataset], a validated bundle of per-step inputs
//! - [synthesize], which drives a noise-free vehicle through a map and produces noisy observations
//! - [run_simulation], which replays a [Dataset] through a [ParticleFilter] and collects a [NavigationResult]
//!
//! All tables are delimited text with a header row. The delimiter is configurable so tab separated files work as
//! well as comma separated ones.

use log::{debug, info, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::{FilterConfig, SimulationConfig};
use crate::diagnostics::{ParticleReport, get_associations, get_sense_x, get_sense_y};
use crate::error::{FilterError, Result, check_std};
use crate::map::Map;
use crate::measurements::Observation;
use crate::particle::ParticleFilter;
use crate::{ControlInput, Pose, forward, wrap_to_pi};

fn read_records<T: DeserializeOwned, P: AsRef<Path>>(path: P, delimiter: u8) -> Result<Vec<T>> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let mut records = Vec::new();
    for result in rdr.deserialize() {
        let record: T = result?;
        records.push(record);
    }
    Ok(records)
}

fn write_records<T: Serialize, P: AsRef<Path>>(records: &[T], path: P) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

/// One row of the control table.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlRecord {
    /// Forward velocity in m/s
    pub velocity: f64,
    /// Yaw rate in rad/s
    pub yaw_rate: f64,
}
impl From<ControlRecord> for ControlInput {
    fn from(record: ControlRecord) -> Self {
        ControlInput::new(record.velocity, record.yaw_rate)
    }
}
impl From<ControlInput> for ControlRecord {
    fn from(control: ControlInput) -> Self {
        ControlRecord {
            velocity: control.velocity,
            yaw_rate: control.yaw_rate,
        }
    }
}
impl ControlRecord {
    pub fn from_csv<P: AsRef<Path>>(path: P, delimiter: u8) -> Result<Vec<Self>> {
        read_records(path, delimiter)
    }
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> Result<()> {
        write_records(records, path)
    }
}

/// One row of the ground-truth table.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthRecord {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}
impl From<GroundTruthRecord> for Pose {
    fn from(record: GroundTruthRecord) -> Self {
        Pose::new(record.x, record.y, record.theta)
    }
}
impl From<Pose> for GroundTruthRecord {
    fn from(pose: Pose) -> Self {
        GroundTruthRecord {
            x: pose.x,
            y: pose.y,
            theta: pose.theta,
        }
    }
}
impl GroundTruthRecord {
    pub fn from_csv<P: AsRef<Path>>(path: P, delimiter: u8) -> Result<Vec<Self>> {
        read_records(path, delimiter)
    }
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> Result<()> {
        write_records(records, path)
    }
}

/// One row of the observation table: a vehicle-frame detection at a given step.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    /// Zero-based step index
    pub step: usize,
    pub x: f64,
    pub y: f64,
}
impl ObservationRecord {
    pub fn from_csv<P: AsRef<Path>>(path: P, delimiter: u8) -> Result<Vec<Self>> {
        read_records(path, delimiter)
    }
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> Result<()> {
        write_records(records, path)
    }
    /// Group records into per-step observation lists, preserving row order within a step.
    ///
    /// Steps with no rows get an empty list. A record whose step is `>= steps` is an error.
    pub fn group_by_step(records: &[Self], steps: usize) -> Result<Vec<Vec<Observation>>> {
        let mut grouped = vec![Vec::new(); steps];
        for record in records {
            let slot = grouped.get_mut(record.step).ok_or_else(|| {
                FilterError::Data(format!(
                    "observation at step {} but only {} steps of control data",
                    record.step, steps
                ))
            })?;
            slot.push(Observation::new(record.x, record.y));
        }
        Ok(grouped)
    }
    /// Flatten per-step observation lists back into records.
    pub fn flatten(observations: &[Vec<Observation>]) -> Vec<Self> {
        observations
            .iter()
            .enumerate()
            .flat_map(|(step, obs)| {
                obs.iter().map(move |o| ObservationRecord {
                    step,
                    x: o.x,
                    y: o.y,
                })
            })
            .collect()
    }
}

/// Per-step inputs for a replay run.
///
/// `controls[i]` is the control applied between step `i` and step `i + 1`. `observations[i]` and
/// `ground_truth[i]` belong to step `i`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Dataset {
    pub controls: Vec<ControlInput>,
    pub observations: Vec<Vec<Observation>>,
    pub ground_truth: Option<Vec<Pose>>,
}
impl Dataset {
    /// Build a dataset, checking that the tables line up.
    pub fn new(
        controls: Vec<ControlInput>,
        observations: Vec<Vec<Observation>>,
        ground_truth: Option<Vec<Pose>>,
    ) -> Result<Self> {
        if observations.len() != controls.len() {
            return Err(FilterError::Data(format!(
                "{} observation steps for {} control steps",
                observations.len(),
                controls.len()
            )));
        }
        match &ground_truth {
            Some(gt) if gt.len() != controls.len() => {
                return Err(FilterError::Data(format!(
                    "{} ground truth rows for {} control steps",
                    gt.len(),
                    controls.len()
                )));
            }
            _ => {}
        }
        Ok(Dataset {
            controls,
            observations,
            ground_truth,
        })
    }
    /// Load the control, observation and (optional) ground-truth tables named in a [SimulationConfig].
    pub fn load(config: &SimulationConfig) -> Result<Self> {
        let delimiter = config.delimiter_byte()?;
        let controls: Vec<ControlInput> = ControlRecord::from_csv(&config.controls, delimiter)?
            .into_iter()
            .map(ControlInput::from)
            .collect();
        let records = ObservationRecord::from_csv(&config.observations, delimiter)?;
        let observations = ObservationRecord::group_by_step(&records, controls.len())?;
        let ground_truth = match &config.ground_truth {
            Some(path) => Some(
                GroundTruthRecord::from_csv(path, delimiter)?
                    .into_iter()
                    .map(Pose::from)
                    .collect(),
            ),
            None => None,
        };
        debug!(
            "Loaded {} steps and {} observations",
            controls.len(),
            records.len()
        );
        Dataset::new(controls, observations, ground_truth)
    }
    /// Write `controls.csv`, `observations.csv` and (if present) `ground_truth.csv` into a directory.
    pub fn to_csv_dir<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let controls: Vec<ControlRecord> = self.controls.iter().map(|&c| c.into()).collect();
        ControlRecord::to_csv(&controls, dir.join("controls.csv"))?;
        ObservationRecord::to_csv(
            &ObservationRecord::flatten(&self.observations),
            dir.join("observations.csv"),
        )?;
        if let Some(gt) = &self.ground_truth {
            let records: Vec<GroundTruthRecord> = gt.iter().map(|&p| p.into()).collect();
            GroundTruthRecord::to_csv(&records, dir.join("ground_truth.csv"))?;
        }
        Ok(())
    }
    pub fn len(&self) -> usize {
        self.controls.len()
    }
    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
    }
    /// First ground-truth pose, or the origin when no ground truth is available.
    pub fn initial_pose(&self) -> Pose {
        self.ground_truth
            .as_ref()
            .and_then(|gt| gt.first().copied())
            .unwrap_or_default()
    }
}

/// Vehicle-frame observations of every landmark within `sensor_range` of `pose`, with additive Gaussian noise.
pub fn simulate_observations<R: Rng + ?Sized>(
    map: &Map,
    pose: &Pose,
    sensor_range: f64,
    noise: [f64; 2],
    rng: &mut R,
) -> Result<Vec<Observation>> {
    check_std("noise[0]", noise[0])?;
    check_std("noise[1]", noise[1])?;
    let noise_x = Normal::new(0.0, noise[0]).map_err(|_| FilterError::InvalidNoise {
        name: "noise[0]",
        value: noise[0],
    })?;
    let noise_y = Normal::new(0.0, noise[1]).map_err(|_| FilterError::InvalidNoise {
        name: "noise[1]",
        value: noise[1],
    })?;
    Ok(map
        .within_range(pose, sensor_range)
        .iter()
        .map(|lm| {
            let local = Observation::new(lm.x, lm.y).to_vehicle_frame(pose);
            Observation::new(local.x + noise_x.sample(rng), local.y + noise_y.sample(rng))
        })
        .collect())
}

/// Drive a noise-free vehicle through `map` and record what it would observe at each step.
///
/// The vehicle starts at `start` and applies `controls[i]` for `delta_t` after step `i`. Observation noise uses
/// `noise` (m) and a generator seeded with `seed`.
pub fn synthesize(
    map: &Map,
    start: Pose,
    controls: &[ControlInput],
    delta_t: f64,
    sensor_range: f64,
    noise: [f64; 2],
    seed: u64,
) -> Result<Dataset> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut pose = start;
    let mut ground_truth = Vec::with_capacity(controls.len());
    let mut observations = Vec::with_capacity(controls.len());
    for control in controls {
        ground_truth.push(pose);
        observations.push(simulate_observations(map, &pose, sensor_range, noise, &mut rng)?);
        forward(&mut pose, *control, delta_t);
    }
    Dataset::new(controls.to_vec(), observations, Some(ground_truth))
}

/// Absolute error of a pose estimate; heading error is wrapped to $[0, \pi]$.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PoseError {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}
impl PoseError {
    /// Euclidean position error
    pub fn position(&self) -> f64 {
        self.x.hypot(self.y)
    }
}

/// Compare an estimate against ground truth.
pub fn pose_error(ground_truth: &Pose, estimate: &Pose) -> PoseError {
    PoseError {
        x: (estimate.x - ground_truth.x).abs(),
        y: (estimate.y - ground_truth.y).abs(),
        theta: wrap_to_pi(estimate.theta - ground_truth.theta).abs(),
    }
}

/// Filter output for a single step, recorded after the weight update and before resampling.
#[derive(Clone, Debug, PartialEq)]
pub struct StepResult {
    pub step: usize,
    pub estimate: Pose,
    pub error: Option<PoseError>,
    /// Diagnostics of the highest-weight particle
    pub best: ParticleReport,
    pub effective_sample_size: f64,
}

#[derive(Serialize)]
struct StepRow<'a> {
    step: usize,
    x: f64,
    y: f64,
    theta: f64,
    err_x: Option<f64>,
    err_y: Option<f64>,
    err_theta: Option<f64>,
    weight: f64,
    n_eff: f64,
    associations: &'a str,
    sense_x: &'a str,
    sense_y: &'a str,
}

/// Sequence of per-step filter outputs for one run.
#[derive(Clone, Debug, Default)]
pub struct NavigationResult {
    pub name: String,
    pub steps: Vec<StepResult>,
}
impl NavigationResult {
    pub fn new(name: &str) -> Self {
        NavigationResult {
            name: name.to_string(),
            steps: Vec::new(),
        }
    }
    /// Mean absolute error over the steps that have ground truth.
    pub fn mean_error(&self) -> Option<PoseError> {
        let errors: Vec<&PoseError> = self.steps.iter().filter_map(|s| s.error.as_ref()).collect();
        if errors.is_empty() {
            return None;
        }
        let n = errors.len() as f64;
        Some(PoseError {
            x: errors.iter().map(|e| e.x).sum::<f64>() / n,
            y: errors.iter().map(|e| e.y).sum::<f64>() / n,
            theta: errors.iter().map(|e| e.theta).sum::<f64>() / n,
        })
    }
    pub fn last(&self) -> Option<&StepResult> {
        self.steps.last()
    }
    /// Write the result table.
    ///
    /// Columns: `step,x,y,theta,err_x,err_y,err_theta,weight,n_eff,associations,sense_x,sense_y`. Error columns are
    /// empty when the run had no ground truth.
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for s in &self.steps {
            writer.serialize(StepRow {
                step: s.step,
                x: s.estimate.x,
                y: s.estimate.y,
                theta: s.estimate.theta,
                err_x: s.error.map(|e| e.x),
                err_y: s.error.map(|e| e.y),
                err_theta: s.error.map(|e| e.theta),
                weight: s.best.weight,
                n_eff: s.effective_sample_size,
                associations: &s.best.associations,
                sense_x: &s.best.sense_x,
                sense_y: &s.best.sense_y,
            })?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Replay a dataset through a particle filter.
///
/// The filter is initialized at `initial` with `config.sigma_init`. At every step after the first it predicts with
/// the previous step's control; at every step it updates against that step's observations, records the estimate and
/// the best particle, then resamples.
pub fn run_simulation(
    config: &FilterConfig,
    map: &Map,
    dataset: &Dataset,
    initial: Pose,
) -> Result<NavigationResult> {
    config.validate()?;
    let model = config.measurement_model();
    let mut pf = ParticleFilter::from_config(config)?;
    pf.initialize(initial.x, initial.y, initial.theta, config.sigma_init)?;
    info!(
        "Running {} steps with {} particles ({:?} resampling)",
        dataset.len(),
        config.num_particles,
        config.resampling
    );
    let mut result = NavigationResult::new("particle filter");
    for (step, observations) in dataset.observations.iter().enumerate() {
        if let Some(control) = step.checked_sub(1).and_then(|i| dataset.controls.get(i)) {
            pf.predict(config.delta_t, config.sigma_pos, control.velocity, control.yaw_rate)?;
        }
        pf.update(&model, observations, map)?;
        let estimate = pf.get_estimate()?;
        let best = pf.best_particle()?;
        let error = dataset
            .ground_truth
            .as_ref()
            .and_then(|gt| gt.get(step))
            .map(|gt| pose_error(gt, &estimate));
        debug!(
            "Step {step}: estimate {estimate}, best weight {:.3e}, associations [{}]",
            best.weight,
            get_associations(best)
        );
        trace!("Step {step}: sense_x [{}] sense_y [{}]", get_sense_x(best), get_sense_y(best));
        result.steps.push(StepResult {
            step,
            estimate,
            error,
            best: ParticleReport::from(best),
            effective_sample_size: pf.effective_sample_size(),
        });
        pf.resample()?;
    }
    if let Some(err) = result.mean_error() {
        info!(
            "Mean error: x {:.4} m, y {:.4} m, theta {:.4} rad",
            err.x, err.y, err.theta
        );
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::Landmark;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    fn grid_map() -> Map {
        let mut id = 0;
        let mut landmarks = Vec::new();
        for i in -2..=6 {
            for j in -2..=6 {
                id += 1;
                landmarks.push(Landmark::new(id, i as f64 * 15.0, j as f64 * 15.0 + 3.0));
            }
        }
        Map::new(landmarks)
    }

    #[test]
    fn test_pose_error() {
        let err = pose_error(&Pose::new(1.0, 2.0, PI - 0.05), &Pose::new(1.5, 1.0, -PI + 0.05));
        assert_approx_eq!(err.x, 0.5, 1e-12);
        assert_approx_eq!(err.y, 1.0, 1e-12);
        assert_approx_eq!(err.theta, 0.1, 1e-9);
        assert_approx_eq!(err.position(), 1.25_f64.sqrt(), 1e-12);
    }
    #[test]
    fn test_simulate_observations_without_noise() {
        let map = Map::new(vec![Landmark::new(1, 10.0, 0.0), Landmark::new(2, 100.0, 0.0)]);
        let pose = Pose::new(0.0, 0.0, PI / 2.0);
        let mut rng = StdRng::seed_from_u64(0);
        let obs = simulate_observations(&map, &pose, 50.0, [0.0, 0.0], &mut rng).unwrap();
        assert_eq!(obs.len(), 1);
        // Landmark dead ahead on the map x axis is to the right of a vehicle facing +y
        assert_approx_eq!(obs[0].x, 0.0, 1e-9);
        assert_approx_eq!(obs[0].y, -10.0, 1e-9);
        assert_eq!(obs[0].id, None);
    }
    #[test]
    fn test_group_by_step() {
        let records = vec![
            ObservationRecord { step: 0, x: 1.0, y: 2.0 },
            ObservationRecord { step: 2, x: 3.0, y: 4.0 },
            ObservationRecord { step: 0, x: 5.0, y: 6.0 },
        ];
        let grouped = ObservationRecord::group_by_step(&records, 3).unwrap();
        assert_eq!(grouped.len(), 3);
        assert_eq!(grouped[0], vec![Observation::new(1.0, 2.0), Observation::new(5.0, 6.0)]);
        assert!(grouped[1].is_empty());
        assert_eq!(grouped[2], vec![Observation::new(3.0, 4.0)]);
        assert!(matches!(
            ObservationRecord::group_by_step(&records, 2),
            Err(FilterError::Data(_))
        ));
    }
    #[test]
    fn test_dataset_checks_lengths() {
        let controls = vec![ControlInput::new(1.0, 0.0); 3];
        assert!(Dataset::new(controls.clone(), vec![Vec::new(); 2], None).is_err());
        assert!(Dataset::new(controls.clone(), vec![Vec::new(); 3], Some(vec![Pose::default(); 4])).is_err());
        let ds = Dataset::new(controls, vec![Vec::new(); 3], None).unwrap();
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.initial_pose(), Pose::default());
    }
    #[test]
    fn test_dataset_csv_roundtrip() {
        let map = grid_map();
        let controls = vec![ControlInput::new(5.0, 0.1); 5];
        let ds = synthesize(&map, Pose::new(10.0, 10.0, 0.3), &controls, 0.1, 30.0, [0.1, 0.1], 3).unwrap();
        let dir = std::env::temp_dir().join("mcl_dataset_roundtrip");
        ds.to_csv_dir(&dir).unwrap();
        map.to_csv(dir.join("map.csv")).unwrap();
        let mut config = SimulationConfig::new(
            dir.join("map.csv"),
            dir.join("controls.csv"),
            dir.join("observations.csv"),
        );
        config.ground_truth = Some(dir.join("ground_truth.csv"));
        let read = Dataset::load(&config).unwrap();
        assert_eq!(read.len(), ds.len());
        assert_eq!(read.controls, ds.controls);
        assert_eq!(read.observations.len(), ds.observations.len());
        for (a, b) in read.observations.iter().zip(&ds.observations) {
            assert_eq!(a.len(), b.len());
        }
        assert_eq!(read.initial_pose(), Pose::new(10.0, 10.0, 0.3));
        let _ = std::fs::remove_dir_all(&dir);
    }
    #[test]
    fn test_run_simulation_tracks_vehicle() {
        let map = grid_map();
        let controls: Vec<ControlInput> = (0..60)
            .map(|i| ControlInput::new(8.0, if i < 30 { 0.0 } else { 0.15 }))
            .collect();
        let start = Pose::new(5.0, 5.0, 0.4);
        let dataset = synthesize(&map, start, &controls, 0.1, 40.0, [0.3, 0.3], 21).unwrap();
        let config = FilterConfig {
            num_particles: 200,
            seed: Some(5),
            ..Default::default()
        };
        let result = run_simulation(&config, &map, &dataset, start).unwrap();
        assert_eq!(result.steps.len(), 60);
        let mean = result.mean_error().unwrap();
        assert!(mean.x < 0.5, "{mean:?}");
        assert!(mean.y < 0.5, "{mean:?}");
        assert!(mean.theta < 0.05, "{mean:?}");
        let last = result.last().unwrap();
        assert!(!last.best.associations.is_empty());
        assert!(last.effective_sample_size > 0.0);

        let path = std::env::temp_dir().join("mcl_run_result.csv");
        result.to_csv(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "step,x,y,theta,err_x,err_y,err_theta,weight,n_eff,associations,sense_x,sense_y"
        );
        assert_eq!(lines.count(), 60);
        let _ = std::fs::remove_file(&path);
    }
    #[test]
    fn test_run_without_ground_truth() {
        let map = grid_map();
        let controls = vec![ControlInput::new(1.0, 0.0); 4];
        let mut dataset = synthesize(&map, Pose::default(), &controls, 0.1, 30.0, [0.1, 0.1], 1).unwrap();
        dataset.ground_truth = None;
        let config = FilterConfig {
            num_particles: 20,
            seed: Some(2),
            ..Default::default()
        };
        let result = run_simulation(&config, &map, &dataset, dataset.initial_pose()).unwrap();
        assert_eq!(result.steps.len(), 4);
        assert!(result.mean_error().is_none());
        assert!(result.steps.iter().all(|s| s.error.is_none()));
    }
}
