//! Synthetic projector-camera rooms with known ground truth.
//!
//! Devices stand inside an axis aligned box room. Cameras hang near the middle of a wall looking at
//! the opposite wall; projectors hang near a corner and light the opposite corner, so every lit
//! area spans two walls. With two cameras and two projectors the correspondence graph is
//! `projector0 - camera0, projector0 - camera1, projector1 - camera1`; more devices wrap around the
//! room and close the loop.
use cgmath::prelude::*;
use cgmath::{Point2, Point3, Vector3};
use image::GrayImage;
use indicatif::ProgressIterator;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use std::cell::RefCell;
use std::rc::Rc;

use crate::acquisition::{acquire_gray_code, FrameSource, PatternDisplay};
use crate::camera_model::CameraModel;
use crate::config::DecodeConfig;
use crate::correspondence::{point_set_from_decoded, DepthImage, DepthLookupTable, DEFAULT_DEPTH_SCALE};
use crate::ensemble::{CalibrationPointSet, Camera, CameraId, Ensemble, Projector, ProjectorId};
use crate::gray_code::GrayCode;
use crate::pose::{self, Pose};
use crate::{progress_bar, Error, Result};

/// Point sets with fewer correspondences than this are dropped.
const MIN_POINTS: usize = 50;

/// Brightness of dark and lit surfaces in rendered captures.
const AMBIENT: u8 = 20;
const LIT: u8 = 230;

/// Axis aligned box, floor at `min.y`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Room {
    pub min: Point3<f64>,
    pub max: Point3<f64>,
}

impl Room {
    /// Room centred on the origin in x and z with the floor at y = 0.
    pub fn new(width: f64, height: f64, depth: f64) -> Self {
        Room {
            min: Point3::new(-width / 2.0, 0.0, -depth / 2.0),
            max: Point3::new(width / 2.0, height, depth / 2.0),
        }
    }

    pub fn contains(&self, p: Point3<f64>) -> bool {
        (0..3).all(|i| p[i] > self.min[i] && p[i] < self.max[i])
    }

    /// Where a ray starting inside the room hits a wall, the floor or the ceiling.
    pub fn intersect(&self, origin: Point3<f64>, dir: Vector3<f64>) -> Option<Point3<f64>> {
        let t = (0..3)
            .filter_map(|i| {
                if dir[i] > 0.0 {
                    Some((self.max[i] - origin[i]) / dir[i])
                } else if dir[i] < 0.0 {
                    Some((self.min[i] - origin[i]) / dir[i])
                } else {
                    None
                }
            })
            .fold(std::f64::INFINITY, f64::min);
        if t.is_finite() && t > 0.0 {
            Some(origin + dir * t)
        } else {
            None
        }
    }
}

/// Parameters of [synthetic_room].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub num_cameras: usize,
    pub num_projectors: usize,
    /// Standard deviation of the Gaussian noise added to projector pixels.
    pub noise: f64,
    /// Fraction of correspondences replaced by uniformly random projector pixels.
    pub outlier_fraction: f64,
    /// Sample every `depth_stride`th depth pixel in each direction.
    pub depth_stride: u32,
    /// Give projectors their true intrinsics up front.
    pub seed_intrinsics: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        SyntheticConfig {
            num_cameras: 2,
            num_projectors: 2,
            noise: 0.3,
            outlier_fraction: 0.01,
            depth_stride: 3,
            seed_intrinsics: false,
        }
    }
}

/// Depth camera with a mildly distorted lens.
pub fn camera_model() -> CameraModel {
    CameraModel::new(365.0, 365.0, 256.0, 212.0).with_distortion(0.05, -0.1)
}

pub const CAMERA_SIZE: (u32, u32) = (512, 424);

/// Projector with the usual upward lens shift.
pub fn projector_model() -> CameraModel {
    CameraModel::new(1400.0, 1400.0, 512.0, 700.0)
}

pub const PROJECTOR_SIZE: (u32, u32) = (1024, 768);

/// A generated room. `ensemble` holds the devices and correspondences but no poses except the
/// anchor camera's; the true poses and lenses are kept alongside.
#[derive(Debug, Clone)]
pub struct SyntheticRoom {
    pub room: Room,
    pub ensemble: Ensemble,
    pub camera_poses: Vec<Pose>,
    pub projector_poses: Vec<Pose>,
    pub projector_models: Vec<CameraModel>,
}

/// Largest rotation (radians) and translation (metres) error over resolved devices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseError {
    pub rotation: f64,
    pub translation: f64,
}

fn pose_difference(truth: &Pose, estimate: &Pose) -> (f64, f64) {
    let (r, t) = pose::to_rt(&(pose::invert_rigid(truth) * estimate));
    (r.magnitude(), t.magnitude())
}

/// Build a room with the given device counts and fill in noisy correspondences for every
/// projector-camera pair that sees enough common surface.
pub fn synthetic_room<R: Rng>(config: &SyntheticConfig, rng: &mut R) -> Result<SyntheticRoom> {
    if config.num_cameras == 0 {
        return Err(Error::InvalidInput("a room needs at least one camera".to_string()));
    }
    let room = Room::new(6.0, 3.0, 6.0);
    let up = Vector3::unit_y();

    let camera_poses = (0..config.num_cameras)
        .map(|j| {
            let a = j as f64 * std::f64::consts::FRAC_PI_2 + 0.2 * (j / 4) as f64;
            let (s, c) = a.sin_cos();
            pose::look_at(
                Point3::new(2.4 * c, 1.5, 2.4 * s),
                Point3::new(-3.0 * c, 1.3, -3.0 * s),
                up,
            )
        })
        .collect::<Vec<_>>();
    let projector_poses = (0..config.num_projectors)
        .map(|i| {
            let a = std::f64::consts::FRAC_PI_4
                + i as f64 * std::f64::consts::FRAC_PI_2
                + 0.15 * (i / 4) as f64;
            let (s, c) = a.sin_cos();
            let r = 2.9 * std::f64::consts::SQRT_2;
            pose::look_at(
                Point3::new(2.0 * c, 1.2, 2.0 * s),
                Point3::new(-r * c, 0.3, -r * s),
                up,
            )
        })
        .collect::<Vec<_>>();

    let mut ensemble = Ensemble::new();
    for j in 0..config.num_cameras {
        ensemble.add_camera(Camera::new(&format!("camera{}", j), camera_model(), CAMERA_SIZE));
    }
    for i in 0..config.num_projectors {
        let mut p = Projector::new(&format!("projector{}", i), PROJECTOR_SIZE.0, PROJECTOR_SIZE.1);
        if config.seed_intrinsics {
            p = p.with_model(projector_model());
        }
        ensemble.add_projector(p);
    }
    ensemble.cameras[crate::ensemble::ANCHOR].pose = Some(camera_poses[crate::ensemble::ANCHOR]);

    let mut synthetic = SyntheticRoom {
        room,
        ensemble,
        camera_poses,
        projector_poses,
        projector_models: vec![projector_model(); config.num_projectors],
    };

    for i in 0..config.num_projectors {
        for j in 0..config.num_cameras {
            let (world, mut image) = synthetic.observe(i, j, config.depth_stride);
            if world.len() < MIN_POINTS {
                continue;
            }
            add_noise(&mut image, config.noise, rng)?;
            add_outliers(&mut image, config.outlier_fraction, PROJECTOR_SIZE, rng);
            synthetic
                .ensemble
                .insert_point_set(CalibrationPointSet::new(i, j, world, image)?)?;
        }
    }
    log::info!("{}", synthetic.ensemble);
    Ok(synthetic)
}

/// Perturb every point with isotropic Gaussian noise of standard deviation `std`.
pub fn add_noise<R: Rng>(points: &mut [Point2<f64>], std: f64, rng: &mut R) -> Result<()> {
    if std == 0.0 {
        return Ok(());
    }
    let normal = Normal::new(0.0, std)
        .map_err(|e| Error::InvalidInput(format!("bad noise level {}: {}", std, e)))?;
    for p in points.iter_mut() {
        p.x += normal.sample(rng);
        p.y += normal.sample(rng);
    }
    Ok(())
}

/// Replace a `fraction` of the points with uniformly random pixels of an image of `size`.
/// Returns how many were replaced.
pub fn add_outliers<R: Rng>(
    points: &mut [Point2<f64>],
    fraction: f64,
    size: (u32, u32),
    rng: &mut R,
) -> usize {
    let fraction = fraction.max(0.0).min(1.0);
    let mut replaced = 0;
    for p in points.iter_mut() {
        if rng.gen_bool(fraction) {
            *p = Point2::new(
                rng.gen_range(0.0..size.0 as f64),
                rng.gen_range(0.0..size.1 as f64),
            );
            replaced += 1;
        }
    }
    replaced
}

/// The wall every projector draws on, shared between the display and the simulated cameras.
#[derive(Debug, Clone, Default)]
pub struct SimulatedScreen(Rc<RefCell<Option<(ProjectorId, GrayImage)>>>);

impl PatternDisplay for SimulatedScreen {
    fn display(&mut self, projector: ProjectorId, pattern: &GrayImage) -> Result<()> {
        *self.0.borrow_mut() = Some((projector, pattern.clone()));
        Ok(())
    }
}

/// Color sensor of a synthetic camera. Created by [SyntheticRoom::simulated_camera].
#[derive(Debug, Clone)]
pub struct SimulatedCamera {
    screen: SimulatedScreen,
    size: (u32, u32),
    /// Per projector, the projector pixel lighting each color pixel.
    lit: Vec<Vec<Option<(u32, u32)>>>,
}

impl FrameSource for SimulatedCamera {
    fn acquire_latest_frame(&mut self) -> Result<GrayImage> {
        let shown = self.screen.0.borrow();
        let (projector, pattern) = match shown.as_ref() {
            Some(x) => x,
            None => return Err(Error::InvalidInput("nothing is displayed".to_string())),
        };
        let lit = self.lit.get(*projector).ok_or_else(|| {
            Error::InvalidInput(format!("projector {} is not in the room", projector))
        })?;
        let w = self.size.0;
        Ok(GrayImage::from_fn(self.size.0, self.size.1, |x, y| {
            match lit[(y * w + x) as usize] {
                Some((px, py))
                    if px < pattern.width() && py < pattern.height() && pattern.get_pixel(px, py)[0] > 0 =>
                {
                    image::Luma([LIT])
                }
                _ => image::Luma([AMBIENT]),
            }
        }))
    }
}

impl SyntheticRoom {
    /// World point seen through depth pixel `(x, y)` of `camera`, if any.
    fn depth_hit(&self, camera: CameraId, x: u32, y: u32) -> Option<Point3<f64>> {
        let model = &self.ensemble.cameras[camera].depth_model;
        let n = model.undistort(Point2::new(x as f64, y as f64));
        let pose = &self.camera_poses[camera];
        let dir = pose::rotation(pose) * Vector3::new(n.x, n.y, 1.0);
        self.room.intersect(Point3::from_vec(pose::translation(pose)), dir)
    }

    /// Projector pixel (continuous) that lights world point `p`, if any.
    fn projector_pixel(&self, projector: ProjectorId, p: Point3<f64>) -> Option<Point2<f64>> {
        let local = pose::transform_point(&pose::invert_rigid(&self.projector_poses[projector]), p);
        if local.z <= 0.1 {
            return None;
        }
        let uv = self.projector_models[projector].project(local);
        if self.ensemble.projectors[projector].contains(uv) {
            Some(uv)
        } else {
            None
        }
    }

    /// Exact correspondences for a pair: depth-frame points and the projector pixels lighting them.
    pub fn observe(
        &self,
        projector: ProjectorId,
        camera: CameraId,
        stride: u32,
    ) -> (Vec<Point3<f64>>, Vec<Point2<f64>>) {
        let stride = stride.max(1) as usize;
        let (w, h) = self.ensemble.cameras[camera].depth_size;
        let to_local = pose::invert_rigid(&self.camera_poses[camera]);
        (0..h)
            .into_par_iter()
            .step_by(stride)
            .flat_map_iter(|y| {
                let to_local = &to_local;
                (0..w).step_by(stride).filter_map(move |x| {
                    let hit = self.depth_hit(camera, x, y)?;
                    let uv = self.projector_pixel(projector, hit)?;
                    Some((pose::transform_point(to_local, hit), uv))
                })
            })
            .unzip()
    }

    /// Depth frame of `camera` in millimetres.
    pub fn render_depth(&self, camera: CameraId) -> DepthImage {
        let (w, h) = self.ensemble.cameras[camera].depth_size;
        let to_local = pose::invert_rigid(&self.camera_poses[camera]);
        let depths = (0..w * h)
            .into_par_iter()
            .map(|i| match self.depth_hit(camera, i % w, i / w) {
                Some(hit) => {
                    let z = pose::transform_point(&to_local, hit).z * 1000.0;
                    z.round().max(0.0).min(std::u16::MAX as f64) as u16
                }
                None => 0,
            })
            .collect::<Vec<_>>();
        DepthImage::from_fn(w, h, |x, y| image::Luma([depths[(y * w + x) as usize]]))
    }

    /// Projector pixel lighting each color pixel of `camera`, row major. Pixels outside a
    /// `width` x `height` pattern count as unlit.
    fn lit_pixels(
        &self,
        projector: ProjectorId,
        camera: CameraId,
        width: u32,
        height: u32,
    ) -> Vec<Option<(u32, u32)>> {
        let device = &self.ensemble.cameras[camera];
        let (w, h) = device.color_size;
        let color_to_world = self.camera_poses[camera] * pose::invert_rigid(&device.depth_to_color);
        let origin = Point3::from_vec(pose::translation(&color_to_world));
        let rotation = pose::rotation(&color_to_world);
        (0..w * h)
            .into_par_iter()
            .map(|i| {
                let n = device
                    .color_model
                    .undistort(Point2::new((i % w) as f64, (i / w) as f64));
                let hit = self.room.intersect(origin, rotation * Vector3::new(n.x, n.y, 1.0))?;
                let uv = self.projector_pixel(projector, hit)?;
                let (px, py) = (uv.x.round() as u32, uv.y.round() as u32);
                if px < width && py < height {
                    Some((px, py))
                } else {
                    None
                }
            })
            .collect()
    }

    /// What the color sensor of `camera` records while `projector` shows each pattern of `codec`.
    pub fn render_captures(
        &self,
        projector: ProjectorId,
        camera: CameraId,
        codec: &GrayCode,
    ) -> Vec<GrayImage> {
        let (w, h) = self.ensemble.cameras[camera].color_size;
        let lit = self.lit_pixels(projector, camera, codec.width, codec.height);
        (0..codec.num_patterns())
            .into_par_iter()
            .map(|pattern| {
                GrayImage::from_fn(w, h, |x, y| match lit[(y * w + x) as usize] {
                    Some((px, py)) if codec.pattern_value(pattern, px, py) > 0 => image::Luma([LIT]),
                    _ => image::Luma([AMBIENT]),
                })
            })
            .collect()
    }

    /// A color sensor of `camera` that films whatever `screen` shows.
    pub fn simulated_camera(&self, camera: CameraId, screen: &SimulatedScreen) -> SimulatedCamera {
        SimulatedCamera {
            screen: screen.clone(),
            size: self.ensemble.cameras[camera].color_size,
            lit: (0..self.ensemble.num_projectors())
                .map(|p| {
                    let projector = &self.ensemble.projectors[p];
                    self.lit_pixels(p, camera, projector.width, projector.height)
                })
                .collect(),
        }
    }

    /// Measure correspondences through the full structured light path and replace the point
    /// sets of the ensemble with them.
    ///
    /// Every projector in turn shows its Gray code sequence on a [SimulatedScreen]; each camera's
    /// captures are decoded with the thresholds in `decode` and paired with a rendered depth frame.
    /// Only every `stride * stride`th correspondence is kept. Returns the number of point sets.
    pub fn scan(&mut self, decode: &DecodeConfig, stride: u32, verbose: bool) -> Result<usize> {
        let mut screen = SimulatedScreen::default();
        let mut cameras = (0..self.ensemble.num_cameras())
            .map(|c| self.simulated_camera(c, &screen))
            .collect::<Vec<_>>();
        let depth = (0..self.ensemble.num_cameras())
            .map(|c| self.render_depth(c))
            .collect::<Vec<_>>();
        let luts = self
            .ensemble
            .cameras
            .iter()
            .map(|c| DepthLookupTable::from_camera_model(&c.depth_model, c.depth_size.0, c.depth_size.1))
            .collect::<Vec<_>>();
        let keep = (stride.max(1) * stride.max(1)) as usize;

        self.ensemble.clear_point_sets();
        let num_projectors = self.ensemble.num_projectors() as u64;
        for projector in (0..self.ensemble.num_projectors())
            .progress_with(progress_bar(num_projectors, "Scanning projectors", verbose))
        {
            let (w, h) = (
                self.ensemble.projectors[projector].width,
                self.ensemble.projectors[projector].height,
            );
            let codec = GrayCode::new(w, h).with_thresholds(decode.contrast_threshold, decode.unvalidated_low_bits);
            let captures = acquire_gray_code(&codec, projector, &mut screen, &mut cameras, 1)?;
            for (camera, sequence) in captures.iter().enumerate() {
                let decoded = codec.decode(sequence)?;
                let set = point_set_from_decoded(
                    projector,
                    camera,
                    &self.ensemble.cameras[camera],
                    &decoded,
                    &depth[camera],
                    &luts[camera],
                    DEFAULT_DEPTH_SCALE,
                )?;
                let (world, image) = set
                    .world_points
                    .into_iter()
                    .zip(set.image_points)
                    .step_by(keep)
                    .unzip::<_, _, Vec<_>, Vec<_>>();
                if world.len() < MIN_POINTS {
                    continue;
                }
                self.ensemble
                    .insert_point_set(CalibrationPointSet::new(projector, camera, world, image)?)?;
            }
        }
        log::info!("{}", self.ensemble);
        Ok(self.ensemble.point_sets().len())
    }

    /// How far the poses in `ensemble` are from the truth. Unresolved devices are ignored.
    pub fn pose_error(&self, ensemble: &Ensemble) -> PoseError {
        let cameras = ensemble
            .cameras
            .iter()
            .zip(self.camera_poses.iter())
            .filter_map(|(c, truth)| c.pose.map(|p| pose_difference(truth, &p)));
        let projectors = ensemble
            .projectors
            .iter()
            .zip(self.projector_poses.iter())
            .filter_map(|(c, truth)| c.pose.map(|p| pose_difference(truth, &p)));
        cameras
            .chain(projectors)
            .fold(PoseError { rotation: 0.0, translation: 0.0 }, |e, (r, t)| PoseError {
                rotation: e.rotation.max(r),
                translation: e.translation.max(t),
            })
    }
}
