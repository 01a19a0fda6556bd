//! Tunable thresholds for the whole pipeline, loadable from JSON.
//!
//! Every field has a default so a config file only needs the values it changes:
//!
//! ```json
//! { "ransac": { "inlier_threshold": 2.5, "seed": 7 }, "bundle": { "maximum_iterations": 50 } }
//! ```
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::gray_code::{DEFAULT_CONTRAST_THRESHOLD, DEFAULT_UNVALIDATED_LOW_BITS};
use crate::lm::SolverConfig;
use crate::ransac::RansacConfig;
use crate::Result;

/// Gray code decoding thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    pub contrast_threshold: u8,
    pub unvalidated_low_bits: u32,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        DecodeConfig {
            contrast_threshold: DEFAULT_CONTRAST_THRESHOLD,
            unvalidated_low_bits: DEFAULT_UNVALIDATED_LOW_BITS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub ransac: RansacConfig,
    /// Solver used inside each robust fit.
    pub solver: SolverConfig,
    /// Solver used for the global bundle adjustment.
    pub bundle: SolverConfig,
    pub decode: DecodeConfig,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        CalibrationConfig {
            ransac: RansacConfig::default(),
            solver: SolverConfig::default(),
            bundle: SolverConfig {
                maximum_iterations: 200,
                ..SolverConfig::default()
            },
            decode: DecodeConfig::default(),
        }
    }
}

impl CalibrationConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let f = std::fs::File::open(path)?;
        let config = serde_json::from_reader(std::io::BufReader::new(f))?;
        Ok(config)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}
