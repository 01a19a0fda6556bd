//! Cameras, projectors and the correspondences between them.
//!
//! Devices are addressed by their index in [Ensemble::cameras] or [Ensemble::projectors].
//! Correspondences form a bipartite graph whose edges are [CalibrationPointSet]s, kept sorted by
//! `(projector, camera)` so iteration order is deterministic.
use cgmath::prelude::*;
use cgmath::{Matrix4, Point2, Point3};
use serde::{Deserialize, Serialize};

use crate::camera_model::CameraModel;
use crate::pose::Pose;
use crate::{Error, Result};

pub type CameraId = usize;
pub type ProjectorId = usize;

/// The camera whose pose defines the world frame.
pub const ANCHOR: CameraId = 0;

/// A depth + color camera. The camera's local frame is the frame of its depth sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Camera {
    pub name: String,
    /// Camera to world transform. `None` until resolved.
    pub pose: Option<Pose>,
    pub depth_model: CameraModel,
    pub depth_size: (u32, u32),
    pub color_model: CameraModel,
    pub color_size: (u32, u32),
    /// Depth frame to color frame transform.
    pub depth_to_color: Pose,
}

impl Camera {
    /// Camera whose color and depth sensors coincide.
    pub fn new(name: &str, model: CameraModel, size: (u32, u32)) -> Self {
        Camera {
            name: name.to_string(),
            pose: None,
            depth_model: model,
            depth_size: size,
            color_model: model,
            color_size: size,
            depth_to_color: Matrix4::identity(),
        }
    }

    pub fn with_color(mut self, model: CameraModel, size: (u32, u32), depth_to_color: Pose) -> Self {
        self.color_model = model;
        self.color_size = size;
        self.depth_to_color = depth_to_color;
        self
    }
}

/// A projector, modelled as an inverse camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Projector {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Lens intrinsics. `None` when nothing is known yet.
    pub model: Option<CameraModel>,
    /// Keep `model` fixed during calibration.
    pub lock_intrinsics: bool,
    /// Projector to world transform. `None` until resolved.
    pub pose: Option<Pose>,
}

impl Projector {
    pub fn new(name: &str, width: u32, height: u32) -> Self {
        Projector {
            name: name.to_string(),
            width,
            height,
            model: None,
            lock_intrinsics: false,
            pose: None,
        }
    }

    pub fn with_model(mut self, model: CameraModel) -> Self {
        self.model = Some(model);
        self
    }

    pub fn locked(mut self) -> Self {
        self.lock_intrinsics = true;
        self
    }

    /// Rough intrinsics for a projector with no prior: 90 degree horizontal field of view,
    /// centered principal point.
    pub fn default_model(&self) -> CameraModel {
        let f = self.width as f64 / 2.0;
        CameraModel::new(f, f, self.width as f64 / 2.0, self.height as f64 / 2.0)
    }

    pub fn contains(&self, p: Point2<f64>) -> bool {
        p.x >= 0.0 && p.y >= 0.0 && p.x < self.width as f64 && p.y < self.height as f64
    }
}

/// Correspondences between one projector and one camera.
///
/// `world_points[i]` is a point in the camera's local frame that was lit by projector pixel
/// `image_points[i]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationPointSet {
    pub projector: ProjectorId,
    pub camera: CameraId,
    pub world_points: Vec<Point3<f64>>,
    pub image_points: Vec<Point2<f64>>,
    pub world_point_inliers: Vec<Point3<f64>>,
    pub image_point_inliers: Vec<Point2<f64>>,
    /// Camera to projector transform, set by a successful robust fit.
    pub pose: Option<Pose>,
}

impl CalibrationPointSet {
    pub fn new(
        projector: ProjectorId,
        camera: CameraId,
        world_points: Vec<Point3<f64>>,
        image_points: Vec<Point2<f64>>,
    ) -> Result<Self> {
        if world_points.len() != image_points.len() {
            return Err(Error::InvalidInput(format!(
                "point set ({}, {}) has {} world points but {} image points",
                projector,
                camera,
                world_points.len(),
                image_points.len()
            )));
        }
        Ok(CalibrationPointSet {
            projector,
            camera,
            world_points,
            image_points,
            world_point_inliers: Vec::new(),
            image_point_inliers: Vec::new(),
            pose: None,
        })
    }

    pub fn len(&self) -> usize {
        self.world_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.world_points.is_empty()
    }

    /// Record an accepted fit: the camera to projector pose and the indices of inlier points.
    pub fn set_fit(&mut self, pose: Pose, inliers: &[usize]) {
        self.world_point_inliers = inliers.iter().map(|i| self.world_points[*i]).collect();
        self.image_point_inliers = inliers.iter().map(|i| self.image_points[*i]).collect();
        self.pose = Some(pose);
    }

    /// Forget any previous fit.
    pub fn clear_fit(&mut self) {
        self.world_point_inliers.clear();
        self.image_point_inliers.clear();
        self.pose = None;
    }

    /// Whether this set links its camera and projector in the pose graph.
    pub fn is_calibrated(&self) -> bool {
        self.pose.is_some() && !self.world_point_inliers.is_empty()
    }
}

/// All devices of a room and their correspondences.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ensemble {
    pub cameras: Vec<Camera>,
    pub projectors: Vec<Projector>,
    point_sets: Vec<CalibrationPointSet>,
}

impl Ensemble {
    pub fn new() -> Self {
        Ensemble::default()
    }

    pub fn add_camera(&mut self, camera: Camera) -> CameraId {
        self.cameras.push(camera);
        self.cameras.len() - 1
    }

    pub fn add_projector(&mut self, projector: Projector) -> ProjectorId {
        self.projectors.push(projector);
        self.projectors.len() - 1
    }

    pub fn num_cameras(&self) -> usize {
        self.cameras.len()
    }

    pub fn num_projectors(&self) -> usize {
        self.projectors.len()
    }

    /// Insert or replace the point set for `(set.projector, set.camera)`.
    pub fn insert_point_set(&mut self, set: CalibrationPointSet) -> Result<()> {
        if set.projector >= self.projectors.len() || set.camera >= self.cameras.len() {
            return Err(Error::InvalidInput(format!(
                "point set refers to projector {} and camera {}, ensemble has {} projectors and {} cameras",
                set.projector,
                set.camera,
                self.projectors.len(),
                self.cameras.len()
            )));
        }
        match self.search(set.projector, set.camera) {
            Ok(i) => self.point_sets[i] = set,
            Err(i) => self.point_sets.insert(i, set),
        }
        Ok(())
    }

    fn search(&self, projector: ProjectorId, camera: CameraId) -> std::result::Result<usize, usize> {
        self.point_sets
            .binary_search_by_key(&(projector, camera), |s| (s.projector, s.camera))
    }

    pub fn point_set(&self, projector: ProjectorId, camera: CameraId) -> Option<&CalibrationPointSet> {
        self.search(projector, camera).ok().map(|i| &self.point_sets[i])
    }

    pub fn point_set_mut(
        &mut self,
        projector: ProjectorId,
        camera: CameraId,
    ) -> Option<&mut CalibrationPointSet> {
        match self.search(projector, camera) {
            Ok(i) => Some(&mut self.point_sets[i]),
            Err(_) => None,
        }
    }

    /// Every point set, ordered by `(projector, camera)`.
    pub fn point_sets(&self) -> &[CalibrationPointSet] {
        &self.point_sets
    }

    /// Point sets of one projector, ordered by camera.
    pub fn point_sets_for_projector(
        &self,
        projector: ProjectorId,
    ) -> impl Iterator<Item = &CalibrationPointSet> {
        self.point_sets
            .iter()
            .filter(move |s| s.projector == projector && !s.is_empty())
    }

    pub fn point_sets_for_camera(&self, camera: CameraId) -> impl Iterator<Item = &CalibrationPointSet> {
        self.point_sets
            .iter()
            .filter(move |s| s.camera == camera && !s.is_empty())
    }

    /// Re-establish the point set invariants after deserialization: ids in range, parallel lists of
    /// equal length, sorted by `(projector, camera)` with no duplicates.
    pub fn validate(&mut self) -> Result<()> {
        let sets = std::mem::take(&mut self.point_sets);
        for set in sets {
            if set.world_points.len() != set.image_points.len()
                || set.world_point_inliers.len() != set.image_point_inliers.len()
            {
                return Err(Error::InvalidInput(format!(
                    "point set ({}, {}) has mismatched point lists",
                    set.projector, set.camera
                )));
            }
            if self.search(set.projector, set.camera).is_ok() {
                return Err(Error::InvalidInput(format!(
                    "duplicate point set ({}, {})",
                    set.projector, set.camera
                )));
            }
            self.insert_point_set(set)?;
        }
        Ok(())
    }

    /// Drop every point set, e.g. before loading fresh correspondences.
    pub fn clear_point_sets(&mut self) {
        self.point_sets.clear();
    }

    pub fn num_observations(&self) -> usize {
        self.point_sets.iter().map(|s| s.len()).sum()
    }

    pub fn num_inliers(&self) -> usize {
        self.point_sets
            .iter()
            .map(|s| s.world_point_inliers.len())
            .sum()
    }
}

impl std::fmt::Display for Ensemble {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Ensemble with {} cameras, {} projectors, {} point sets, and {} correspondences",
            self.num_cameras(),
            self.num_projectors(),
            self.point_sets.len(),
            self.num_observations()
        )
    }
}
