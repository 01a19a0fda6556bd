//! Robust per-projector calibration.
//!
//! Each trial samples a subset of every view's correspondences, initializes the projector lens and
//! the per-view poses linearly, refines them jointly with [LevenbergMarquardt], then scores the fit
//! against every correspondence. Fits where every view has enough inliers are refit on their
//! inliers; the lowest error refit wins.
use cgmath::prelude::*;
use cgmath::{Matrix3, Point2, Point3, Rad, Vector3};
use indicatif::ParallelProgressIterator;
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::camera_model::CameraModel;
use crate::config::CalibrationConfig;
use crate::dlt::{calibrate_dlt, extrinsics_init, is_coplanar};
use crate::ensemble::{CalibrationPointSet, CameraId, Ensemble, ProjectorId};
use crate::lm::{LevenbergMarquardt, Residuals, SolverConfig};
use crate::pose::{self, Pose};
use crate::{progress_bar, Error, FailureReason, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacConfig {
    /// Trials per projector.
    pub max_trials: usize,
    /// Stop early after this many accepted fits.
    pub target_fits: usize,
    /// Correspondences sampled from each view per trial.
    pub sample_size: usize,
    /// Redraws of a coplanar sample when intrinsics are being estimated.
    pub coplanar_retries: usize,
    /// Samples whose smallest to middle covariance eigenvalue ratio is below this are coplanar.
    pub coplanarity_ratio: f64,
    /// Reprojection error in projector pixels below which a correspondence is an inlier.
    pub inlier_threshold: f64,
    /// Inliers every view needs for a fit to be accepted.
    pub min_inliers: usize,
    /// Half width in radians of the random yaw added to initial poses when solving intrinsics.
    pub yaw_jitter: f64,
    pub seed: u64,
}

impl Default for RansacConfig {
    fn default() -> Self {
        RansacConfig {
            max_trials: 40,
            target_fits: 4,
            sample_size: 100,
            coplanar_retries: 10,
            coplanarity_ratio: 1e-3,
            inlier_threshold: 4.0,
            min_inliers: 500,
            yaw_jitter: 0.05,
            seed: 0,
        }
    }
}

/// Fitted camera to projector pose of one view and the indices of its inliers.
#[derive(Debug, Clone)]
pub struct ViewFit {
    pub camera: CameraId,
    pub pose: Pose,
    pub inliers: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct ProjectorFit {
    pub projector: ProjectorId,
    pub model: CameraModel,
    pub views: Vec<ViewFit>,
    /// RMS reprojection error of the inlier refit, in pixels.
    pub rms: f64,
    pub solved_intrinsics: bool,
    /// Trials run and trials accepted.
    pub trials: usize,
    pub accepted: usize,
}

impl ProjectorFit {
    pub fn num_inliers(&self) -> usize {
        self.views.iter().map(|v| v.inliers.len()).sum()
    }
}

/// Joint reprojection error of a projector over several views. Parameters are `[fx, fy, cx, cy]`
/// when intrinsics are free, followed by a rotation vector and translation per view.
struct ProjectorProblem<'a> {
    model: CameraModel,
    solve_intrinsics: bool,
    views: Vec<(&'a [Point3<f64>], &'a [Point2<f64>])>,
}

impl<'a> ProjectorProblem<'a> {
    fn offset(&self) -> usize {
        if self.solve_intrinsics {
            4
        } else {
            0
        }
    }

    fn pack(&self, model: &CameraModel, poses: &[Pose]) -> DVector<f64> {
        let mut p = Vec::with_capacity(self.offset() + 6 * poses.len());
        if self.solve_intrinsics {
            p.extend_from_slice(&model.intrinsics());
        }
        for pose in poses {
            let (r, t) = pose::to_rt(pose);
            p.extend_from_slice(&[r.x, r.y, r.z, t.x, t.y, t.z]);
        }
        DVector::from_vec(p)
    }

    fn unpack(&self, p: &DVector<f64>) -> (CameraModel, Vec<Pose>) {
        let model = if self.solve_intrinsics {
            self.model.with_intrinsics(&p.as_slice()[0..4])
        } else {
            self.model
        };
        let poses = (0..self.views.len())
            .map(|v| {
                let i = self.offset() + 6 * v;
                pose::from_rt(
                    Vector3::new(p[i], p[i + 1], p[i + 2]),
                    Vector3::new(p[i + 3], p[i + 4], p[i + 5]),
                )
            })
            .collect();
        (model, poses)
    }
}

impl<'a> Residuals for ProjectorProblem<'a> {
    fn num_residuals(&self) -> usize {
        2 * self.views.iter().map(|(w, _)| w.len()).sum::<usize>()
    }

    fn residuals(&self, p: &DVector<f64>) -> DVector<f64> {
        let (model, poses) = self.unpack(p);
        let mut e = Vec::with_capacity(self.num_residuals());
        for ((world, image), pose) in self.views.iter().zip(poses.iter()) {
            for (w, uv) in world.iter().zip(image.iter()) {
                let predicted = model.project(pose::transform_point(pose, *w));
                e.push(uv.x - predicted.x);
                e.push(uv.y - predicted.y);
            }
        }
        DVector::from_vec(e)
    }
}

fn reprojection_error(model: &CameraModel, pose: &Pose, w: Point3<f64>, uv: Point2<f64>) -> f64 {
    let local = pose::transform_point(pose, w);
    if local.z <= 0.0 {
        return std::f64::INFINITY;
    }
    (model.project(local) - uv).magnitude()
}

fn gather<T: Copy>(points: &[T], indices: &[usize]) -> Vec<T> {
    indices.iter().map(|i| points[*i]).collect()
}

/// Sample of one view for a trial.
struct Sample {
    world: Vec<Point3<f64>>,
    image: Vec<Point2<f64>>,
    coplanar: bool,
}

fn draw_sample<R: Rng>(
    set: &CalibrationPointSet,
    config: &RansacConfig,
    avoid_coplanar: bool,
    rng: &mut R,
) -> Sample {
    let n = config.sample_size.min(set.len());
    let mut retries = 0;
    loop {
        let indices = sample(rng, set.len(), n).into_vec();
        let world = gather(&set.world_points, &indices);
        let coplanar = is_coplanar(&world, config.coplanarity_ratio);
        if !coplanar || !avoid_coplanar || retries >= config.coplanar_retries {
            return Sample {
                world,
                image: gather(&set.image_points, &indices),
                coplanar,
            };
        }
        retries += 1;
    }
}

/// Rotate a pose about the device's vertical axis.
fn jitter_yaw(pose: &Pose, angle: f64) -> Pose {
    let r = Matrix3::from_angle_y(Rad(angle)) * pose::rotation(pose);
    pose::from_parts(r, pose::translation(pose))
}

/// Outcome of a single trial.
enum Trial {
    Accepted(ProjectorFit),
    Rejected,
    Coplanar,
}

fn run_trial<R: Rng>(
    ensemble: &Ensemble,
    projector: ProjectorId,
    sets: &[&CalibrationPointSet],
    config: &RansacConfig,
    solver: &SolverConfig,
    rng: &mut R,
) -> Result<Trial> {
    let proj = &ensemble.projectors[projector];
    let samples = sets
        .iter()
        .map(|s| draw_sample(s, config, !proj.lock_intrinsics, rng))
        .collect::<Vec<_>>();

    let non_coplanar = samples.iter().position(|s| !s.coplanar);
    let solve_intrinsics = !proj.lock_intrinsics && non_coplanar.is_some();

    let model = match (non_coplanar, proj.model) {
        (Some(v), prior) if solve_intrinsics => {
            let (linear, _) = calibrate_dlt(&samples[v].world, &samples[v].image)?;
            match prior {
                Some(m) => m.with_intrinsics(&linear.intrinsics()),
                None => linear,
            }
        }
        (_, Some(m)) => m,
        (_, None) => return Ok(Trial::Coplanar),
    };

    let mut poses = Vec::with_capacity(samples.len());
    for s in samples.iter() {
        let mut pose = extrinsics_init(&model, &s.world, &s.image, config.coplanarity_ratio)?;
        if solve_intrinsics && config.yaw_jitter > 0.0 {
            pose = jitter_yaw(&pose, rng.gen_range(-config.yaw_jitter..config.yaw_jitter));
        }
        poses.push(pose);
    }

    let problem = ProjectorProblem {
        model,
        solve_intrinsics,
        views: samples
            .iter()
            .map(|s| (s.world.as_slice(), s.image.as_slice()))
            .collect(),
    };
    let mut lm = LevenbergMarquardt::new(&problem, problem.pack(&model, &poses), *solver);
    let sample_rms = lm.minimize();
    let (model, poses) = problem.unpack(&lm.parameters);

    // score against every correspondence
    let mut inliers = Vec::with_capacity(sets.len());
    for (set, pose) in sets.iter().zip(poses.iter()) {
        let view_inliers = set
            .world_points
            .par_iter()
            .zip(set.image_points.par_iter())
            .enumerate()
            .filter(|(_, (w, uv))| {
                reprojection_error(&model, pose, **w, **uv) < config.inlier_threshold
            })
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        if view_inliers.len() < config.min_inliers {
            log::debug!(
                "projector {}: camera {} has {} inliers (sample rms {:.3})",
                projector,
                set.camera,
                view_inliers.len(),
                sample_rms
            );
            return Ok(Trial::Rejected);
        }
        inliers.push(view_inliers);
    }

    let worlds = sets
        .iter()
        .zip(inliers.iter())
        .map(|(s, i)| gather(&s.world_points, i))
        .collect::<Vec<_>>();
    let images = sets
        .iter()
        .zip(inliers.iter())
        .map(|(s, i)| gather(&s.image_points, i))
        .collect::<Vec<_>>();
    let refit = ProjectorProblem {
        model,
        solve_intrinsics,
        views: worlds
            .iter()
            .zip(images.iter())
            .map(|(w, i)| (w.as_slice(), i.as_slice()))
            .collect(),
    };
    let mut lm = LevenbergMarquardt::new(&refit, refit.pack(&model, &poses), *solver);
    let rms = lm.minimize();
    let (model, poses) = refit.unpack(&lm.parameters);

    Ok(Trial::Accepted(ProjectorFit {
        projector,
        model,
        views: sets
            .iter()
            .zip(poses)
            .zip(inliers)
            .map(|((s, pose), inliers)| ViewFit {
                camera: s.camera,
                pose,
                inliers,
            })
            .collect(),
        rms,
        solved_intrinsics: solve_intrinsics,
        trials: 0,
        accepted: 0,
    }))
}

/// Fit the lens of `projector` and its pose relative to every camera that observes it.
///
/// The ensemble is not modified; use [apply_fit] to store the result. Randomness comes only from
/// `rng`, so a seeded generator gives reproducible fits.
pub fn calibrate_projector<R: Rng>(
    ensemble: &Ensemble,
    projector: ProjectorId,
    config: &RansacConfig,
    solver: &SolverConfig,
    rng: &mut R,
) -> Result<ProjectorFit> {
    if projector >= ensemble.num_projectors() {
        return Err(Error::InvalidInput(format!("no projector {}", projector)));
    }
    let sets = ensemble
        .point_sets_for_projector(projector)
        .collect::<Vec<_>>();
    if sets.is_empty() {
        return Err(Error::CalibrationFailed {
            projector,
            reason: FailureReason::NoObservations,
        });
    }

    let mut best: Option<ProjectorFit> = None;
    let mut trials = 0;
    let mut accepted = 0;
    let mut coplanar = 0;
    while trials < config.max_trials && accepted < config.target_fits {
        trials += 1;
        match run_trial(ensemble, projector, &sets, config, solver, rng) {
            Ok(Trial::Accepted(fit)) => {
                accepted += 1;
                log::debug!(
                    "projector {}: trial {} accepted, rms {:.4}, {} inliers",
                    projector,
                    trials,
                    fit.rms,
                    fit.num_inliers()
                );
                if best.as_ref().map_or(true, |b| fit.rms < b.rms) {
                    best = Some(fit);
                }
            }
            Ok(Trial::Rejected) => {}
            Ok(Trial::Coplanar) => coplanar += 1,
            Err(e) => log::debug!("projector {}: trial {} failed: {}", projector, trials, e),
        }
    }

    match best {
        Some(mut fit) => {
            fit.trials = trials;
            fit.accepted = accepted;
            log::info!(
                "projector {}: rms {:.4} px over {} inliers ({} of {} trials accepted)",
                projector,
                fit.rms,
                fit.num_inliers(),
                accepted,
                trials
            );
            Ok(fit)
        }
        None => {
            let reason = if coplanar == trials {
                FailureReason::Coplanar
            } else {
                FailureReason::NoConsensus { trials }
            };
            Err(Error::CalibrationFailed { projector, reason })
        }
    }
}

/// Store a fit: the projector's lens and, for every point set of the projector, the view pose and
/// inliers. Sets without a view in `fit` lose any previous fit.
pub fn apply_fit(ensemble: &mut Ensemble, fit: &ProjectorFit) {
    if let Some(p) = ensemble.projectors.get_mut(fit.projector) {
        p.model = Some(fit.model);
    }
    let cameras = (0..ensemble.num_cameras()).collect::<Vec<_>>();
    for camera in cameras {
        if let Some(set) = ensemble.point_set_mut(fit.projector, camera) {
            match fit.views.iter().find(|v| v.camera == camera) {
                Some(view) => set.set_fit(view.pose, &view.inliers),
                None => set.clear_fit(),
            }
        }
    }
}

/// Drop the view poses and inliers of every point set of `projector`. Its lens is left alone.
pub fn clear_fits(ensemble: &mut Ensemble, projector: ProjectorId) {
    for camera in 0..ensemble.num_cameras() {
        if let Some(set) = ensemble.point_set_mut(projector, camera) {
            set.clear_fit();
        }
    }
}

/// Calibrate every projector in parallel and store the successful fits.
///
/// Projector `i` draws from a generator seeded with `config.ransac.seed + i`, so results do not
/// depend on scheduling. Failures are returned alongside the successes; they do not stop the
/// other projectors. A failed projector loses the view fits of any earlier run, so it stays
/// unresolved, but keeps its lens as the starting point for the next run.
pub fn calibrate_projectors(
    ensemble: &mut Ensemble,
    config: &CalibrationConfig,
    verbose: bool,
) -> Vec<Result<ProjectorFit>> {
    let results = {
        let ensemble = &*ensemble;
        (0..ensemble.num_projectors())
            .into_par_iter()
            .progress_with(progress_bar(
                ensemble.num_projectors() as u64,
                "Calibrating projectors",
                verbose,
            ))
            .map(|projector| {
                let mut rng = StdRng::seed_from_u64(config.ransac.seed.wrapping_add(projector as u64));
                calibrate_projector(ensemble, projector, &config.ransac, &config.solver, &mut rng)
            })
            .collect::<Vec<_>>()
    };

    for (projector, result) in results.iter().enumerate() {
        match result {
            Ok(fit) => apply_fit(ensemble, fit),
            Err(e) => {
                log::warn!("{}", e);
                clear_fits(ensemble, projector);
            }
        }
    }
    results
}
