extern crate procam;
extern crate rand;
extern crate structopt;

use procam::io::*;
use procam::pose_graph::{components, reprojection_rms};
use procam::synthetic::*;
use procam::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
struct SyntheticOpt {
    /// Number of depth cameras. Camera 0 is the anchor.
    #[structopt(long = "cameras", default_value = "2")]
    num_cameras: usize,

    /// Number of projectors.
    #[structopt(long = "projectors", default_value = "2")]
    num_projectors: usize,

    /// Standard deviation of the Gaussian noise added to projector pixels.
    #[structopt(long = "noise", default_value = "0.3")]
    noise: f64,

    /// Fraction of correspondences replaced by random projector pixels.
    #[structopt(long = "outliers", default_value = "0.01")]
    outlier_fraction: f64,

    /// Use every <depth-stride>th depth pixel in each direction.
    #[structopt(long = "depth-stride", default_value = "3")]
    depth_stride: u32,

    /// Give projectors their true intrinsics as a starting point.
    #[structopt(long = "seed-intrinsics")]
    seed_intrinsics: bool,

    #[structopt(long = "seed", default_value = "0")]
    seed: u64,

    /// Measure correspondences by rendering and decoding Gray code captures instead of sampling
    /// them directly. Noise and outlier settings are ignored.
    #[structopt(long = "scan")]
    scan: bool,

    /// Decoding thresholds for --scan, in the calibration config format.
    #[structopt(long = "config", parse(from_os_str), requires = "scan")]
    config: Option<PathBuf>,

    /// Show progress bars.
    #[structopt(short = "v", long = "verbose")]
    verbose: bool,

    /// Also write the ground truth poses and lenses to this file.
    #[structopt(long = "truth", parse(from_os_str))]
    truth: Option<PathBuf>,

    /// Output ensemble in .json format.
    #[structopt(name = "OUT", parse(from_os_str))]
    output: PathBuf,
}

#[derive(StructOpt, Debug)]
struct CalibrateOpt {
    /// Input ensemble in .json format.
    #[structopt(name = "FILE", parse(from_os_str))]
    input: PathBuf,

    /// Output ensemble with calibrated lenses and poses.
    #[structopt(name = "OUT", parse(from_os_str))]
    output: PathBuf,

    /// Calibration settings in .json format. Missing fields take their defaults.
    #[structopt(long = "config", parse(from_os_str))]
    config: Option<PathBuf>,

    /// Replace the ensemble's correspondences with a .cps or .bcps dump.
    #[structopt(long = "correspondences", parse(from_os_str))]
    correspondences: Option<PathBuf>,

    /// Seed for the robust fits. Overrides the config file.
    #[structopt(long = "seed")]
    seed: Option<u64>,

    /// Reprojection error in pixels below which a correspondence is an inlier.
    #[structopt(long = "inlier-threshold")]
    inlier_threshold: Option<f64>,

    /// Inliers required in every view for a fit to be accepted.
    #[structopt(long = "min-inliers")]
    min_inliers: Option<usize>,

    /// Upper bound on robust fit trials per projector.
    #[structopt(long = "max-trials")]
    max_trials: Option<usize>,

    /// Show progress bars.
    #[structopt(short = "v", long = "verbose")]
    verbose: bool,
}

#[derive(StructOpt, Debug)]
struct CheckOpt {
    /// Ensemble in .json format.
    #[structopt(name = "FILE", parse(from_os_str))]
    input: PathBuf,
}

#[derive(StructOpt, Debug)]
struct ExportOpt {
    /// Ensemble in .json format.
    #[structopt(name = "FILE", parse(from_os_str))]
    input: PathBuf,

    /// Output correspondences. Written in binary if the ending is .bcps, text if .cps.
    #[structopt(name = "OUT", parse(from_os_str))]
    output: PathBuf,
}

#[derive(StructOpt, Debug)]
#[structopt(
    name = "procam",
    about = "Calibrate rooms of projectors and depth cameras from structured light correspondences."
)]
enum Opt {
    /// Generate a synthetic room with noisy correspondences.
    Synthetic(SyntheticOpt),
    /// Fit projector lenses and the poses of every device.
    Calibrate(CalibrateOpt),
    /// Summarize an ensemble and its reprojection error.
    Check(CheckOpt),
    /// Dump an ensemble's correspondences.
    Export(ExportOpt),
}

fn print_rms(ensemble: &Ensemble) {
    match reprojection_rms(ensemble) {
        Some(rms) => println!("Reprojection RMS: {:.4} px", rms),
        None => println!("Reprojection RMS: n/a"),
    }
}

fn run_synthetic(opt: SyntheticOpt) -> Result<()> {
    let config = SyntheticConfig {
        num_cameras: opt.num_cameras,
        num_projectors: opt.num_projectors,
        noise: opt.noise,
        outlier_fraction: opt.outlier_fraction,
        depth_stride: opt.depth_stride,
        seed_intrinsics: opt.seed_intrinsics,
    };
    let mut rng = StdRng::seed_from_u64(opt.seed);
    let mut room = synthetic_room(&config, &mut rng)?;
    if opt.scan {
        let calibration = match opt.config {
            Some(path) => CalibrationConfig::from_file(&path)?,
            None => CalibrationConfig::default(),
        };
        room.scan(&calibration.decode, opt.depth_stride, opt.verbose)?;
    }
    println!("{}", room.ensemble);
    write_ensemble(&room.ensemble, &opt.output)?;

    if let Some(path) = opt.truth {
        let mut truth = room.ensemble.clone();
        for (camera, pose) in truth.cameras.iter_mut().zip(room.camera_poses.iter()) {
            camera.pose = Some(*pose);
        }
        for ((projector, pose), model) in truth
            .projectors
            .iter_mut()
            .zip(room.projector_poses.iter())
            .zip(room.projector_models.iter())
        {
            projector.pose = Some(*pose);
            projector.model = Some(*model);
        }
        write_ensemble(&truth, &path)?;
    }
    Ok(())
}

fn run_calibrate(opt: CalibrateOpt) -> Result<()> {
    let mut config = match opt.config {
        Some(path) => CalibrationConfig::from_file(&path)?,
        None => CalibrationConfig::default(),
    };
    if let Some(seed) = opt.seed {
        config.ransac.seed = seed;
    }
    if let Some(threshold) = opt.inlier_threshold {
        config.ransac.inlier_threshold = threshold;
    }
    if let Some(min_inliers) = opt.min_inliers {
        config.ransac.min_inliers = min_inliers;
    }
    if let Some(max_trials) = opt.max_trials {
        config.ransac.max_trials = max_trials;
    }

    let mut ensemble = read_ensemble(&opt.input)?;
    if let Some(path) = opt.correspondences {
        load_correspondences(&mut ensemble, &path)?;
    }
    println!("{}", ensemble);

    let report = calibrate(&mut ensemble, &config, opt.verbose);
    for fit in report.fits.iter() {
        match fit {
            Ok(fit) => println!(
                "Projector {}: rms {:.4} px, {} inliers, f = ({:.1}, {:.1}), c = ({:.1}, {:.1})",
                fit.projector,
                fit.rms,
                fit.num_inliers(),
                fit.model.fx,
                fit.model.fy,
                fit.model.cx,
                fit.model.cy
            ),
            Err(e) => println!("{}", e),
        }
    }
    println!("{}", report.resolution);
    if let Some(bundle) = report.bundle {
        println!("{}", bundle);
    }
    print_rms(&ensemble);

    write_ensemble(&ensemble, &opt.output)
}

fn run_check(opt: CheckOpt) -> Result<()> {
    let ensemble = read_ensemble(&opt.input)?;
    println!("{}", ensemble);
    println!("{}", Resolution::of(&ensemble));
    let components = components(&ensemble);
    println!("{} connected components", components.len());
    for (i, projector) in ensemble.projectors.iter().enumerate() {
        let sets = ensemble.point_sets_for_projector(i).collect::<Vec<_>>();
        println!(
            "  {} ({}x{}): {} views, {} calibrated, {}",
            projector.name,
            projector.width,
            projector.height,
            sets.len(),
            sets.iter().filter(|s| s.is_calibrated()).count(),
            if projector.model.is_some() { "has intrinsics" } else { "no intrinsics" }
        );
    }
    print_rms(&ensemble);
    Ok(())
}

fn run_export(opt: ExportOpt) -> Result<()> {
    let ensemble = read_ensemble(&opt.input)?;
    write_correspondences(&ensemble, &opt.output)?;
    println!(
        "Wrote {} point sets with {} correspondences",
        ensemble.point_sets().len(),
        ensemble.num_observations()
    );
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match Opt::from_args() {
        Opt::Synthetic(opt) => run_synthetic(opt),
        Opt::Calibrate(opt) => run_calibrate(opt),
        Opt::Check(opt) => run_check(opt),
        Opt::Export(opt) => run_export(opt),
    }
}
