//! Geometric calibration of rooms full of projectors and depth cameras.
//!
//! Each projector shows Gray code patterns that the cameras decode into projector pixel
//! coordinates. Paired with depth, every decoded pixel becomes a 3D point in the camera frame
//! matched to a 2D projector pixel. From these correspondences the crate estimates the
//! intrinsics of every projector and the pose of every device in a frame anchored on camera 0.
//!
//! Example usage:
//! ```
//! use procam::*;
//! use procam::synthetic::*;
//! use rand::SeedableRng;
//!
//! let mut rng = rand::rngs::StdRng::seed_from_u64(1);
//! let config = SyntheticConfig { depth_stride: 12, ..SyntheticConfig::default() };
//! let mut room = synthetic_room(&config, &mut rng).unwrap();
//! let mut calibration = CalibrationConfig::default();
//! calibration.ransac.min_inliers = 50;
//! calibration.ransac.max_trials = 10;
//! let report = calibrate(&mut room.ensemble, &calibration, false);
//! println!("{}", report.resolution);
//! ```

extern crate cgmath;
extern crate indicatif;
extern crate nalgebra as na;
extern crate rayon;

use indicatif::{ProgressBar, ProgressStyle};

pub mod acquisition;
pub mod camera_model;
pub mod config;
pub mod correspondence;
pub mod dlt;
pub mod ensemble;
pub mod error;
pub mod gray_code;
pub mod io;
pub mod lm;
pub mod pose;
pub mod pose_graph;
pub mod ransac;
pub mod synthetic;

pub use camera_model::CameraModel;
pub use config::CalibrationConfig;
pub use ensemble::{CalibrationPointSet, Camera, Ensemble, Projector};
pub use error::{Error, FailureReason, Result};
pub use pose::Pose;
pub use pose_graph::{BundleReport, Resolution};
pub use ransac::ProjectorFit;

pub(crate) fn progress_bar(length: u64, message: &str, verbose: bool) -> ProgressBar {
    if !verbose {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(length);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40}] {percent}% ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#-"),
    );
    pb.set_message(message.to_string());
    pb
}

/// Outcome of [calibrate].
#[derive(Debug)]
pub struct CalibrationReport {
    /// One entry per projector, in projector order.
    pub fits: Vec<Result<ProjectorFit>>,
    pub resolution: Resolution,
    /// `None` when no pair was calibrated, so there was nothing to refine.
    pub bundle: Option<BundleReport>,
}

impl CalibrationReport {
    pub fn num_calibrated(&self) -> usize {
        self.fits.iter().filter(|f| f.is_ok()).count()
    }
}

/// Full calibration of an ensemble with point sets: robust per projector fits, pose graph
/// unification and bundle adjustment over the connected devices.
///
/// Projectors that fail to calibrate are reported in `fits` and stay unresolved along with any
/// devices only reachable through them.
pub fn calibrate(ensemble: &mut Ensemble, config: &CalibrationConfig, verbose: bool) -> CalibrationReport {
    let fits = ransac::calibrate_projectors(ensemble, config, verbose);
    let calibrated = fits.iter().filter(|f| f.is_ok()).count();
    log::info!("Calibrated {}/{} projectors", calibrated, fits.len());

    let resolution = pose_graph::unify(ensemble);

    let bundle = if ensemble.point_sets().iter().any(|s| s.is_calibrated()) {
        Some(pose_graph::optimize_pose(ensemble, &config.bundle))
    } else {
        None
    };

    CalibrationReport {
        fits,
        resolution,
        bundle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config() -> CalibrationConfig {
        let mut config = CalibrationConfig::default();
        config.ransac.min_inliers = 100;
        config.ransac.max_trials = 15;
        config
    }

    #[test]
    fn test_calibrate_synthetic_room() {
        let mut rng = StdRng::seed_from_u64(7);
        let synthetic = SyntheticConfig {
            depth_stride: 6,
            outlier_fraction: 0.0,
            ..SyntheticConfig::default()
        };
        let mut room = synthetic_room(&synthetic, &mut rng).unwrap();
        let report = calibrate(&mut room.ensemble, &config(), false);

        assert_eq!(report.num_calibrated(), 2);
        assert!(report.resolution.is_complete());
        let bundle = report.bundle.unwrap();
        assert!(bundle.final_rms <= bundle.initial_rms + 1e-9);
        assert!(bundle.final_rms < 1.0);

        let error = room.pose_error(&room.ensemble);
        assert!(error.rotation < 0.03, "rotation error {}", error.rotation);
        assert!(error.translation < 0.1, "translation error {}", error.translation);
    }

    #[test]
    fn test_calibrate_without_point_sets() {
        let mut rng = StdRng::seed_from_u64(7);
        let synthetic = SyntheticConfig {
            depth_stride: 12,
            ..SyntheticConfig::default()
        };
        let mut room = synthetic_room(&synthetic, &mut rng).unwrap();
        room.ensemble.clear_point_sets();
        let report = calibrate(&mut room.ensemble, &config(), false);
        assert_eq!(report.num_calibrated(), 0);
        assert!(report.bundle.is_none());
        assert_eq!(report.resolution.resolved_cameras, 1);
        assert_eq!(report.resolution.resolved_projectors, 0);
    }
}
