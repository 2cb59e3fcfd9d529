//! Per-particle association diagnostics.
//!
//! During the weight update every particle records which landmark each observation was matched to and where that
//! observation landed in the map frame. These helpers attach the same fields explicitly (e.g. to the best-estimate
//! particle before handing it to a visualizer) and render them as space separated text. Coordinates are rendered
//! with six significant digits in the style of C's `%g`. None of them touch filter state.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::Path;

use crate::error::{FilterError, Result};
use crate::{Particle, Pose};

/// Attach association diagnostics to a particle and return it.
///
/// # Arguments
/// * `particle` - The particle to annotate.
/// * `associations` - Landmark identifier for each association.
/// * `sense_x` - Map-frame x coordinate of each association.
/// * `sense_y` - Map-frame y coordinate of each association.
pub fn set_associations(
    mut particle: Particle,
    associations: Vec<u32>,
    sense_x: Vec<f64>,
    sense_y: Vec<f64>,
) -> Particle {
    particle.associations = associations;
    particle.sense_x = sense_x;
    particle.sense_y = sense_y;
    particle
}

/// Associated landmark identifiers as space separated text, e.g. `"1 4 12"`.
pub fn get_associations(particle: &Particle) -> String {
    join(particle.associations.iter())
}

/// Map-frame x coordinates of the associations as space separated text, e.g. `"97.5912 -6.28319"`.
pub fn get_sense_x(particle: &Particle) -> String {
    join(particle.sense_x.iter().map(|&v| format_significant(v)))
}

/// Map-frame y coordinates of the associations as space separated text.
pub fn get_sense_y(particle: &Particle) -> String {
    join(particle.sense_y.iter().map(|&v| format_significant(v)))
}

fn join<T: Display>(values: impl Iterator<Item = T>) -> String {
    values.map(|v| v.to_string()).collect::<Vec<_>>().join(" ")
}

/// Six significant digits with trailing zeros dropped, switching to exponent form when the decimal exponent is
/// below -4 or at least 6.
pub fn format_significant(value: f64) -> String {
    if value == 0.0 || !value.is_finite() {
        return value.to_string();
    }
    let scientific = format!("{value:.5e}");
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return scientific;
    };
    let Ok(exponent) = exponent.parse::<i32>() else {
        return scientific;
    };
    if (-4..6).contains(&exponent) {
        let decimals = (5 - exponent) as usize;
        trim_fraction(&format!("{value:.decimals$}")).to_string()
    } else {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", trim_fraction(mantissa), sign, exponent.abs())
    }
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

/// Serializable snapshot of one particle, typically the best one after an update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticleReport {
    pub id: usize,
    pub pose: Pose,
    pub weight: f64,
    pub associations: String,
    pub sense_x: String,
    pub sense_y: String,
}
impl From<&Particle> for ParticleReport {
    fn from(particle: &Particle) -> Self {
        ParticleReport {
            id: particle.id,
            pose: particle.pose,
            weight: particle.weight,
            associations: get_associations(particle),
            sense_x: get_sense_x(particle),
            sense_y: get_sense_y(particle),
        }
    }
}
impl ParticleReport {
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| FilterError::Config(e.to_string()))
    }
    /// Write the report to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(|e| FilterError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotated() -> Particle {
        set_associations(
            Particle::new(3, Pose::new(1.0, 2.0, 0.1), 0.5),
            vec![1, 4, 12],
            vec![1.5, -2.25, 10.0],
            vec![0.0, 3.125, -7.5],
        )
    }

    #[test]
    fn test_renderings() {
        let particle = annotated();
        assert_eq!(get_associations(&particle), "1 4 12");
        assert_eq!(get_sense_x(&particle), "1.5 -2.25 10");
        assert_eq!(get_sense_y(&particle), "0 3.125 -7.5");
    }
    #[test]
    fn test_coordinates_render_six_significant_digits() {
        let particle = set_associations(
            Particle::new(0, Pose::default(), 1.0),
            vec![1, 2],
            vec![97.5912345678, -6.283185307],
            vec![1234567.89, 0.000123456789],
        );
        assert_eq!(get_sense_x(&particle), "97.5912 -6.28319");
        assert_eq!(get_sense_y(&particle), "1.23457e+06 0.000123457");
    }
    #[test]
    fn test_format_significant() {
        assert_eq!(format_significant(0.0), "0");
        assert_eq!(format_significant(100.0), "100");
        assert_eq!(format_significant(6.0), "6");
        assert_eq!(format_significant(999999.0), "999999");
        assert_eq!(format_significant(999999.7), "1e+06");
        assert_eq!(format_significant(-0.5), "-0.5");
        assert_eq!(format_significant(1e-7), "1e-07");
        assert_eq!(format_significant(2.5e-5), "2.5e-05");
        assert_eq!(format_significant(1.0001e-4), "0.00010001");
        assert_eq!(format_significant(6.5e123), "6.5e+123");
    }
    #[test]
    fn test_empty_renderings() {
        let particle = Particle::new(0, Pose::default(), 1.0);
        assert_eq!(get_associations(&particle), "");
        assert_eq!(get_sense_x(&particle), "");
        assert_eq!(get_sense_y(&particle), "");
    }
    #[test]
    fn test_no_trailing_separator() {
        let particle = annotated();
        assert!(!get_associations(&particle).ends_with(' '));
        assert!(!get_sense_x(&particle).ends_with(' '));
        assert!(!get_sense_y(&particle).ends_with(' '));
    }
    #[test]
    fn test_idempotent() {
        let particle = annotated();
        assert_eq!(get_associations(&particle), get_associations(&particle));
        assert_eq!(get_sense_x(&particle), get_sense_x(&particle));
    }
    #[test]
    fn test_set_associations_keeps_pose_and_weight() {
        let particle = annotated();
        assert_eq!(particle.id, 3);
        assert_eq!(particle.pose, Pose::new(1.0, 2.0, 0.1));
        assert_eq!(particle.weight, 0.5);
    }
    #[test]
    fn test_report() {
        let report = ParticleReport::from(&annotated());
        assert_eq!(report.associations, "1 4 12");
        let json = report.to_json_string().unwrap();
        let parsed: ParticleReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, report);
    }
}
