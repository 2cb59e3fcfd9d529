//! Filter and simulation configuration.
//!
//! Both [FilterConfig] and [SimulationConfig] can be written to and read from JSON, YAML or TOML. The generic
//! `to_file`/`from_file` pick the format from the file extension (`.json`, `.yaml`/`.yml`, `.toml`).
//!
//! ```
//! use mcl::config::FilterConfig;
//!
//! let config = FilterConfig { num_particles: 500, seed: Some(7), ..Default::default() };
//! let path = std::env::temp_dir().join("mcl_doc_filter.toml");
//! config.to_file(&path).unwrap();
//! assert_eq!(FilterConfig::from_file(&path).unwrap(), config);
//! # let _ = std::fs::remove_file(&path);
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{FilterError, Result, check_positive_std, check_std};
use crate::measurements::LandmarkMeasurementModel;
use crate::particle::{ParticleAveragingStrategy, ParticleResamplingStrategy};

/// Particle filter tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Number of particles, fixed for the lifetime of the filter
    pub num_particles: usize,
    /// Standard deviation of the initial pose estimate [x (m), y (m), theta (rad)]
    pub sigma_init: [f64; 3],
    /// Process noise standard deviation [x (m), y (m), theta (rad)]
    pub sigma_pos: [f64; 3],
    /// Landmark measurement noise standard deviation [x (m), y (m)]
    pub sigma_landmark: [f64; 2],
    /// Sensor range (m)
    pub sensor_range: f64,
    /// Time between control/observation samples (s)
    pub delta_t: f64,
    /// Random seed; `None` seeds from system entropy
    pub seed: Option<u64>,
    pub resampling: ParticleResamplingStrategy,
    pub averaging: ParticleAveragingStrategy,
}
impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            num_particles: 100,
            sigma_init: [0.3, 0.3, 0.01],
            sigma_pos: [0.3, 0.3, 0.01],
            sigma_landmark: [0.3, 0.3],
            sensor_range: 50.0,
            delta_t: 0.1,
            seed: None,
            resampling: ParticleResamplingStrategy::default(),
            averaging: ParticleAveragingStrategy::default(),
        }
    }
}
impl FilterConfig {
    /// Check every parameter before a filter is built from this configuration.
    pub fn validate(&self) -> Result<()> {
        if self.num_particles == 0 {
            return Err(FilterError::InvalidParticleCount(self.num_particles));
        }
        if !(self.delta_t.is_finite() && self.delta_t >= 0.0) {
            return Err(FilterError::InvalidTimeStep(self.delta_t));
        }
        for (name, value) in ["sigma_init[0]", "sigma_init[1]", "sigma_init[2]"]
            .into_iter()
            .zip(self.sigma_init)
        {
            check_std(name, value)?;
        }
        for (name, value) in ["sigma_pos[0]", "sigma_pos[1]", "sigma_pos[2]"]
            .into_iter()
            .zip(self.sigma_pos)
        {
            check_std(name, value)?;
        }
        check_positive_std("sigma_landmark[0]", self.sigma_landmark[0])?;
        check_positive_std("sigma_landmark[1]", self.sigma_landmark[1])?;
        self.measurement_model().validate()
    }
    pub fn measurement_model(&self) -> LandmarkMeasurementModel {
        LandmarkMeasurementModel::new(self.sensor_range, self.sigma_landmark)
    }
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_config(self, path.as_ref())
    }
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        read_config(path.as_ref())
    }
}

/// Logging preferences for the simulation binary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (off, error, warn, info, debug, trace)
    pub level: String,
    /// Optional log file; logs go to stderr when unset
    pub file: Option<String>,
}
impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file: None,
        }
    }
}

fn default_delimiter() -> char {
    ','
}

/// Complete description of a replay run: input tables, outputs and filter tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Landmark map (`id,x,y`)
    pub map: PathBuf,
    /// Control inputs per step (`velocity,yaw_rate`)
    pub controls: PathBuf,
    /// Vehicle-frame observations (`step,x,y`)
    pub observations: PathBuf,
    /// Optional ground truth per step (`x,y,theta`); also supplies the initial pose estimate
    #[serde(default)]
    pub ground_truth: Option<PathBuf>,
    /// Optional per-step result table
    #[serde(default)]
    pub output: Option<PathBuf>,
    /// Optional JSON report of the best particle after the last step
    #[serde(default)]
    pub report: Option<PathBuf>,
    /// Field delimiter of the input tables
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub filter: FilterConfig,
}
impl SimulationConfig {
    pub fn new<P: Into<PathBuf>>(map: P, controls: P, observations: P) -> Self {
        SimulationConfig {
            map: map.into(),
            controls: controls.into(),
            observations: observations.into(),
            ground_truth: None,
            output: None,
            report: None,
            delimiter: default_delimiter(),
            logging: LoggingConfig::default(),
            filter: FilterConfig::default(),
        }
    }
    /// Input delimiter as a byte, rejecting non-ASCII characters.
    pub fn delimiter_byte(&self) -> Result<u8> {
        if self.delimiter.is_ascii() {
            Ok(self.delimiter as u8)
        } else {
            Err(FilterError::Config(format!(
                "delimiter must be a single ASCII character, got '{}'",
                self.delimiter
            )))
        }
    }
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_config(self, path.as_ref())
    }
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        read_config(path.as_ref())
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

fn write_config<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let text = match extension(path).as_deref() {
        Some("json") => serde_json::to_string_pretty(value).map_err(|e| FilterError::Config(e.to_string()))?,
        Some("yaml") | Some("yml") => {
            serde_yaml::to_string(value).map_err(|e| FilterError::Config(e.to_string()))?
        }
        Some("toml") => toml::to_string(value).map_err(|e| FilterError::Config(e.to_string()))?,
        _ => {
            return Err(FilterError::Config(format!(
                "unsupported config file extension: {}",
                path.display()
            )));
        }
    };
    let mut file = File::create(path)?;
    file.write_all(text.as_bytes())?;
    Ok(())
}

fn read_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let ext = extension(path);
    if !matches!(ext.as_deref(), Some("json" | "yaml" | "yml" | "toml")) {
        return Err(FilterError::Config(format!(
            "unsupported config file extension: {}",
            path.display()
        )));
    }
    let mut text = String::new();
    File::open(path)?.read_to_string(&mut text)?;
    match ext.as_deref() {
        Some("json") => serde_json::from_str(&text).map_err(|e| FilterError::Config(e.to_string())),
        Some("toml") => toml::from_str(&text).map_err(|e| FilterError::Config(e.to_string())),
        _ => serde_yaml::from_str(&text).map_err(|e| FilterError::Config(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SimulationConfig {
        let mut config = SimulationConfig::new("data/map.csv", "data/controls.csv", "data/observations.csv");
        config.ground_truth = Some(PathBuf::from("data/gt.csv"));
        config.output = Some(PathBuf::from("out/result.csv"));
        config.delimiter = '\t';
        config.filter.num_particles = 250;
        config.filter.seed = Some(1234);
        config.filter.resampling = ParticleResamplingStrategy::Systematic;
        config
    }

    #[test]
    fn test_defaults_validate() {
        assert!(FilterConfig::default().validate().is_ok());
    }
    #[test]
    fn test_validate_rejects_bad_values() {
        let config = FilterConfig {
            num_particles: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(FilterError::InvalidParticleCount(0))));
        let config = FilterConfig {
            sigma_pos: [0.3, -0.3, 0.01],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(FilterError::InvalidNoise { name: "sigma_pos[1]", .. })
        ));
        let config = FilterConfig {
            sigma_landmark: [0.3, 0.0],
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = FilterConfig {
            sensor_range: f64::INFINITY,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(FilterError::InvalidSensorRange(_))));
    }
    #[test]
    fn test_roundtrip_all_formats() {
        let config = sample();
        for ext in ["json", "yaml", "yml", "toml"] {
            let path = std::env::temp_dir().join(format!("mcl_sim_config_roundtrip.{ext}"));
            config.to_file(&path).expect("Failed to write config");
            let read = SimulationConfig::from_file(&path).expect("Failed to read config");
            assert_eq!(read, config, "format {ext}");
            let _ = std::fs::remove_file(&path);
        }
    }
    #[test]
    fn test_unsupported_extension() {
        let path = std::env::temp_dir().join("mcl_config.ini");
        assert!(matches!(sample().to_file(&path), Err(FilterError::Config(_))));
        assert!(matches!(
            SimulationConfig::from_file(&path),
            Err(FilterError::Config(_))
        ));
    }
    #[test]
    fn test_partial_config_uses_defaults() {
        let text = r#"
map = "map.csv"
controls = "controls.csv"
observations = "obs.csv"

[filter]
num_particles = 42
resampling = "residual"
"#;
        let config: SimulationConfig = toml::from_str(text).unwrap();
        assert_eq!(config.delimiter, ',');
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.filter.num_particles, 42);
        assert_eq!(config.filter.resampling, ParticleResamplingStrategy::Residual);
        assert_eq!(config.filter.sensor_range, 50.0);
        assert_eq!(config.filter.seed, None);
    }
    #[test]
    fn test_delimiter_byte() {
        let mut config = sample();
        assert_eq!(config.delimiter_byte().unwrap(), b'\t');
        config.delimiter = 'é';
        assert!(config.delimiter_byte().is_err());
    }
}
