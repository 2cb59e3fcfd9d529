//! MCL SIM: replay and synthesis tool for the landmark particle filter.
//!
//! The tool reads a landmark map, per-step control inputs and vehicle-frame landmark observations, runs the
//! particle filter over them and writes a per-step result table. When ground truth is supplied the table also
//! carries the absolute pose error at every step.
//!
//! You can run a replay either by:
//!   1. Loading all parameters from a configuration file (TOML/JSON/YAML) with `--config`
//!   2. Specifying parameters via the `run` subcommand flags
//!
//! The `synth` subcommand generates a synthetic dataset for a map, which is handy for trying out filter settings.

mod common;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use common::{ensure_parent_dir, init_logger, validate_input_file};
use log::{info, warn};
use mcl::config::{FilterConfig, SimulationConfig};
use mcl::particle::{ParticleAveragingStrategy, ParticleResamplingStrategy};
use mcl::sim::{Dataset, run_simulation, synthesize};
use mcl::{ControlInput, Map, Pose};
use std::path::{Path, PathBuf};

const LONG_ABOUT: &str = "MCL SIM: replay and synthesis tool for the landmark particle filter.

The filter localizes a vehicle against a known map of point landmarks. Each step it propagates every particle with
the previous control input (velocity, yaw rate), reweights the particles against the observations of that step and
resamples.

Input tables are delimited text with a header row:
  map           id,x,y
  controls      velocity,yaw_rate
  observations  step,x,y   (vehicle frame, step is the 0-based row of the controls table)
  ground truth  x,y,theta  (optional, one row per step)

You can run a replay either by:
  1. Loading all parameters from a configuration file (TOML/JSON/YAML) with --config
  2. Specifying parameters via the `run` subcommand flags";

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "Replay and synthesis tool for the landmark particle filter.", long_about = LONG_ABOUT)]
struct Cli {
    /// Run a replay from a configuration file (TOML/JSON/YAML)
    /// This option overrides any subcommand arguments
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Command to execute (ignored if --config is provided)
    #[command(subcommand)]
    command: Option<Command>,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

/// Top-level commands
#[derive(Subcommand, Clone)]
enum Command {
    #[command(
        name = "run",
        about = "Replay a dataset through the particle filter",
        long_about = "Replay recorded controls and landmark observations through the particle filter. The filter is initialized at the first ground-truth pose when ground truth is supplied, otherwise at the origin."
    )]
    Run(RunArgs),
    #[command(
        name = "synth",
        about = "Generate a synthetic dataset for a map",
        long_about = "Drive a noise-free vehicle through a landmark map with constant controls and write the controls, noisy vehicle-frame observations and ground truth as CSV tables."
    )]
    Synth(SynthArgs),
    #[command(name = "create-config", about = "Write a template configuration file")]
    CreateConfig(CreateConfigArgs),
}

/// Filter tuning flags shared by `run`
#[derive(Args, Clone, Debug)]
struct FilterArgs {
    /// Number of particles
    #[arg(long, default_value_t = 100)]
    particles: usize,
    /// Random seed (system entropy if omitted)
    #[arg(long)]
    seed: Option<u64>,
    /// Sensor range in meters
    #[arg(long, default_value_t = 50.0)]
    sensor_range: f64,
    /// Time between steps in seconds
    #[arg(long, default_value_t = 0.1)]
    delta_t: f64,
    /// Initial pose standard deviation: x,y,theta
    #[arg(long, value_delimiter = ',', default_value = "0.3,0.3,0.01")]
    sigma_init: Vec<f64>,
    /// Process noise standard deviation: x,y,theta
    #[arg(long, value_delimiter = ',', default_value = "0.3,0.3,0.01")]
    sigma_pos: Vec<f64>,
    /// Landmark measurement standard deviation: x,y
    #[arg(long, value_delimiter = ',', default_value = "0.3,0.3")]
    sigma_landmark: Vec<f64>,
    /// Resampling strategy (multinomial, systematic, stratified, residual)
    #[arg(long, default_value = "multinomial")]
    resampling: ParticleResamplingStrategy,
    /// Pose estimate (weighted_average, unweighted_average, highest_weight)
    #[arg(long, default_value = "weighted_average")]
    averaging: ParticleAveragingStrategy,
}
impl FilterArgs {
    fn to_config(&self) -> Result<FilterConfig> {
        Ok(FilterConfig {
            num_particles: self.particles,
            sigma_init: triple("sigma-init", &self.sigma_init)?,
            sigma_pos: triple("sigma-pos", &self.sigma_pos)?,
            sigma_landmark: pair("sigma-landmark", &self.sigma_landmark)?,
            sensor_range: self.sensor_range,
            delta_t: self.delta_t,
            seed: self.seed,
            resampling: self.resampling,
            averaging: self.averaging,
        })
    }
}

fn triple(name: &str, values: &[f64]) -> Result<[f64; 3]> {
    match values {
        [a, b, c] => Ok([*a, *b, *c]),
        _ => bail!("--{name} expects 3 values, got {}", values.len()),
    }
}

fn pair(name: &str, values: &[f64]) -> Result<[f64; 2]> {
    match values {
        [a, b] => Ok([*a, *b]),
        _ => bail!("--{name} expects 2 values, got {}", values.len()),
    }
}

#[derive(Args, Clone, Debug)]
struct RunArgs {
    /// Landmark map (id,x,y)
    #[arg(long)]
    map: PathBuf,
    /// Control inputs (velocity,yaw_rate)
    #[arg(long)]
    controls: PathBuf,
    /// Observations (step,x,y)
    #[arg(long)]
    observations: PathBuf,
    /// Optional ground truth (x,y,theta)
    #[arg(long)]
    ground_truth: Option<PathBuf>,
    /// Output CSV path for the per-step result table
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Output JSON path for the best particle after the last step
    #[arg(long)]
    report: Option<PathBuf>,
    /// Field delimiter of the input tables
    #[arg(long, default_value_t = ',')]
    delimiter: char,
    #[command(flatten)]
    filter: FilterArgs,
}
impl RunArgs {
    fn to_config(&self) -> Result<SimulationConfig> {
        let mut config = SimulationConfig::new(&self.map, &self.controls, &self.observations);
        config.ground_truth = self.ground_truth.clone();
        config.output = self.output.clone();
        config.report = self.report.clone();
        config.delimiter = self.delimiter;
        config.filter = self.filter.to_config()?;
        Ok(config)
    }
}

#[derive(Args, Clone, Debug)]
struct SynthArgs {
    /// Landmark map (id,x,y)
    #[arg(long)]
    map: PathBuf,
    /// Directory for controls.csv, observations.csv and ground_truth.csv
    #[arg(short, long)]
    output_dir: PathBuf,
    /// Number of steps
    #[arg(long, default_value_t = 100)]
    steps: usize,
    /// Constant velocity in m/s
    #[arg(long, default_value_t = 5.0)]
    velocity: f64,
    /// Constant yaw rate in rad/s
    #[arg(long, default_value_t = 0.0)]
    yaw_rate: f64,
    /// Start pose: x,y,theta
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true, default_value = "0,0,0")]
    start: Vec<f64>,
    /// Time between steps in seconds
    #[arg(long, default_value_t = 0.1)]
    delta_t: f64,
    /// Sensor range in meters
    #[arg(long, default_value_t = 50.0)]
    sensor_range: f64,
    /// Observation noise standard deviation: x,y
    #[arg(long, value_delimiter = ',', default_value = "0.3,0.3")]
    noise: Vec<f64>,
    /// Random seed for observation noise
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Field delimiter of the map table
    #[arg(long, default_value_t = ',')]
    delimiter: char,
}

#[derive(Args, Clone, Debug)]
struct CreateConfigArgs {
    /// Path of the configuration file; the extension selects the format (.toml, .json, .yaml, .yml)
    output: PathBuf,
}

fn delimiter_byte(delimiter: char) -> Result<u8> {
    if delimiter.is_ascii() {
        Ok(delimiter as u8)
    } else {
        bail!("delimiter must be a single ASCII character, got '{delimiter}'")
    }
}

fn run(config: &SimulationConfig) -> Result<()> {
    validate_input_file(&config.map)?;
    validate_input_file(&config.controls)?;
    validate_input_file(&config.observations)?;
    if let Some(gt) = &config.ground_truth {
        validate_input_file(gt)?;
    }
    let delimiter = config.delimiter_byte()?;
    let map = Map::from_csv(&config.map, delimiter)
        .with_context(|| format!("reading map {}", config.map.display()))?;
    let dataset = Dataset::load(config).context("loading dataset")?;
    if dataset.is_empty() {
        warn!("Dataset has no steps, nothing to do");
        return Ok(());
    }
    info!(
        "Loaded {} landmarks and {} steps",
        map.len(),
        dataset.len()
    );
    let result = run_simulation(&config.filter, &map, &dataset, dataset.initial_pose())?;

    if let Some(output) = &config.output {
        ensure_parent_dir(output)?;
        result
            .to_csv(output)
            .with_context(|| format!("writing results to {}", output.display()))?;
        info!("Results written to {}", output.display());
    }
    if let Some(report) = &config.report {
        ensure_parent_dir(report)?;
        if let Some(last) = result.last() {
            last.best
                .to_json(report)
                .with_context(|| format!("writing report to {}", report.display()))?;
            info!("Best particle report written to {}", report.display());
        }
    }
    match result.mean_error() {
        Some(err) => println!(
            "{} steps, mean error x {:.4} m, y {:.4} m, theta {:.4} rad",
            result.steps.len(),
            err.x,
            err.y,
            err.theta
        ),
        None => println!("{} steps, no ground truth supplied", result.steps.len()),
    }
    Ok(())
}

fn synth(args: &SynthArgs) -> Result<()> {
    validate_input_file(&args.map)?;
    let map = Map::from_csv(&args.map, delimiter_byte(args.delimiter)?)
        .with_context(|| format!("reading map {}", args.map.display()))?;
    let start = Pose::from(triple("start", &args.start)?);
    let controls = vec![ControlInput::new(args.velocity, args.yaw_rate); args.steps];
    let dataset = synthesize(
        &map,
        start,
        &controls,
        args.delta_t,
        args.sensor_range,
        pair("noise", &args.noise)?,
        args.seed,
    )?;
    dataset
        .to_csv_dir(&args.output_dir)
        .with_context(|| format!("writing dataset to {}", args.output_dir.display()))?;
    info!(
        "Wrote {} steps with {} observations to {}",
        dataset.len(),
        dataset.observations.iter().map(Vec::len).sum::<usize>(),
        args.output_dir.display()
    );
    Ok(())
}

fn create_config(path: &Path) -> Result<()> {
    ensure_parent_dir(path)?;
    let mut config = SimulationConfig::new("map.csv", "controls.csv", "observations.csv");
    config.ground_truth = Some(PathBuf::from("ground_truth.csv"));
    config.output = Some(PathBuf::from("result.csv"));
    config
        .to_file(path)
        .with_context(|| format!("writing config to {}", path.display()))?;
    println!("Template configuration written to {}", path.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(ref config_path) = cli.config {
        let config = SimulationConfig::from_file(config_path)
            .with_context(|| format!("reading config {}", config_path.display()))?;
        // CLI log file takes precedence over the one in the config
        let config_log_file = config.logging.file.as_ref().map(PathBuf::from);
        let log_file = cli.log_file.as_ref().or(config_log_file.as_ref());
        init_logger(&config.logging.level, log_file.map(PathBuf::as_path))?;
        info!("Running from config {}", config_path.display());
        return run(&config);
    }

    init_logger(&cli.log_level, cli.log_file.as_deref())?;

    match cli.command {
        Some(Command::Run(args)) => run(&args.to_config()?),
        Some(Command::Synth(args)) => synth(&args),
        Some(Command::CreateConfig(args)) => create_config(&args.output),
        None => {
            eprintln!("Error: No command provided. Use -h or --help for usage information.");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_args_to_config() {
        let cli = Cli::try_parse_from([
            "mcl-sim",
            "run",
            "--map",
            "map.csv",
            "--controls",
            "controls.csv",
            "--observations",
            "obs.csv",
            "--particles",
            "250",
            "--seed",
            "9",
            "--sigma-pos",
            "0.1,0.2,0.05",
            "--resampling",
            "systematic",
        ])
        .unwrap();
        let Some(Command::Run(args)) = cli.command else {
            panic!("expected run subcommand");
        };
        let config = args.to_config().unwrap();
        assert_eq!(config.filter.num_particles, 250);
        assert_eq!(config.filter.seed, Some(9));
        assert_eq!(config.filter.sigma_pos, [0.1, 0.2, 0.05]);
        assert_eq!(config.filter.sigma_landmark, [0.3, 0.3]);
        assert_eq!(config.filter.resampling, ParticleResamplingStrategy::Systematic);
        assert_eq!(config.delimiter, ',');
        assert!(config.ground_truth.is_none());
    }

    #[test]
    fn test_rejects_unknown_strategy() {
        let parsed = Cli::try_parse_from([
            "mcl-sim",
            "run",
            "--map",
            "m.csv",
            "--controls",
            "c.csv",
            "--observations",
            "o.csv",
            "--resampling",
            "lottery",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_create_config_roundtrip() {
        let path = std::env::temp_dir().join("mcl_sim_template.yaml");
        create_config(&path).unwrap();
        let config = SimulationConfig::from_file(&path).unwrap();
        assert_eq!(config.filter, FilterConfig::default());
        assert_eq!(config.ground_truth, Some(PathBuf::from("ground_truth.csv")));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_synth_then_run() {
        let dir = std::env::temp_dir().join("mcl_sim_synth_then_run");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let map: Map = (0..25)
            .map(|i| mcl::Landmark::new(i, (i % 5) as f64 * 10.0, (i / 5) as f64 * 10.0))
            .collect();
        map.to_csv(dir.join("map.csv")).unwrap();
        let args = SynthArgs {
            map: dir.join("map.csv"),
            output_dir: dir.clone(),
            steps: 20,
            velocity: 4.0,
            yaw_rate: 0.05,
            start: vec![5.0, 5.0, 0.2],
            delta_t: 0.1,
            sensor_range: 30.0,
            noise: vec![0.1, 0.1],
            seed: 4,
            delimiter: ',',
        };
        synth(&args).unwrap();

        let mut config = SimulationConfig::new(
            dir.join("map.csv"),
            dir.join("controls.csv"),
            dir.join("observations.csv"),
        );
        config.ground_truth = Some(dir.join("ground_truth.csv"));
        config.output = Some(dir.join("out").join("result.csv"));
        config.report = Some(dir.join("out").join("best.json"));
        config.filter.seed = Some(11);
        run(&config).unwrap();
        assert!(dir.join("out").join("result.csv").is_file());
        assert!(dir.join("out").join("best.json").is_file());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
