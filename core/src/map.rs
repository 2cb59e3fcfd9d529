//! Known landmark map.
//!
//! The map is an immutable input to the filter: a list of point landmarks with an identifier and a fixed map-frame
//! position. Landmark identifiers are expected to be unique but the filter does not rely on it; association works
//! on positions within the predicted set and only reports the identifier.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::path::Path;

use crate::Pose;
use crate::error::Result;

/// A single map landmark.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    /// Landmark identifier
    pub id: u32,
    /// Map-frame x coordinate in meters
    pub x: f64,
    /// Map-frame y coordinate in meters
    pub y: f64,
}
impl Display for Landmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Landmark {{ id: {}, x: {:.3}, y: {:.3} }}", self.id, self.x, self.y)
    }
}
impl Landmark {
    pub fn new(id: u32, x: f64, y: f64) -> Self {
        Landmark { id, x, y }
    }
}

/// Collection of known landmarks in map coordinates.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Map {
    pub landmarks: Vec<Landmark>,
}
impl From<Vec<Landmark>> for Map {
    fn from(landmarks: Vec<Landmark>) -> Self {
        Map { landmarks }
    }
}
impl FromIterator<Landmark> for Map {
    fn from_iter<I: IntoIterator<Item = Landmark>>(iter: I) -> Self {
        Map {
            landmarks: iter.into_iter().collect(),
        }
    }
}
impl Map {
    pub fn new(landmarks: Vec<Landmark>) -> Self {
        Map { landmarks }
    }
    pub fn len(&self) -> usize {
        self.landmarks.len()
    }
    pub fn is_empty(&self) -> bool {
        self.landmarks.is_empty()
    }
    pub fn iter(&self) -> std::slice::Iter<'_, Landmark> {
        self.landmarks.iter()
    }
    /// Look up a landmark by identifier (first match).
    pub fn get(&self, id: u32) -> Option<&Landmark> {
        self.landmarks.iter().find(|lm| lm.id == id)
    }
    /// Landmarks within `sensor_range` (inclusive) of the given pose, in map order.
    ///
    /// This is the set of landmarks a particle at `pose` expects to be able to see.
    pub fn within_range(&self, pose: &Pose, sensor_range: f64) -> Vec<Landmark> {
        self.landmarks
            .iter()
            .filter(|lm| pose.distance_to(lm.x, lm.y) <= sensor_range)
            .copied()
            .collect()
    }
    /// Read a map from a delimited file with an `id,x,y` header.
    ///
    /// # Arguments
    /// * `path` - Path to the map file.
    /// * `delimiter` - Field delimiter, e.g. `b','` or `b'\t'`.
    pub fn from_csv<P: AsRef<Path>>(path: P, delimiter: u8) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .trim(csv::Trim::All)
            .from_path(path)?;
        let mut landmarks = Vec::new();
        for result in rdr.deserialize() {
            let landmark: Landmark = result?;
            landmarks.push(landmark);
        }
        log::debug!("Loaded map with {} landmarks", landmarks.len());
        Ok(Map { landmarks })
    }
    /// Write the map as a comma separated file with an `id,x,y` header.
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for landmark in &self.landmarks {
            writer.serialize(landmark)?;
        }
        writer.flush()?;
        Ok(())
    }
}
