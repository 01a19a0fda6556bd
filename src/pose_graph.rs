//! Merge per-projector fits into one world frame and refine every pose jointly.
//!
//! Cameras and projectors form a bipartite graph whose edges are calibrated
//! [CalibrationPointSet]s. [unify] walks the graph outward from the anchor camera composing edge
//! poses; [optimize_pose] then minimizes the reprojection error of every inlier over all poses at
//! once.
use cgmath::prelude::*;
use cgmath::{Matrix4, Point2, Point3, Vector3};
use disjoint_sets::UnionFind;
use itertools::Itertools;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use std::collections::HashMap;

use crate::camera_model::CameraModel;
use crate::ensemble::{CameraId, Ensemble, ProjectorId, ANCHOR};
use crate::lm::{LevenbergMarquardt, Residuals, SolverConfig, State};
use crate::pose::{self, Pose};

/// How much of the graph [unify] could place in the world frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub resolved_cameras: usize,
    pub total_cameras: usize,
    pub resolved_projectors: usize,
    pub total_projectors: usize,
}

impl Resolution {
    pub fn of(ensemble: &Ensemble) -> Self {
        Resolution {
            resolved_cameras: ensemble.cameras.iter().filter(|c| c.pose.is_some()).count(),
            total_cameras: ensemble.num_cameras(),
            resolved_projectors: ensemble
                .projectors
                .iter()
                .filter(|p| p.pose.is_some())
                .count(),
            total_projectors: ensemble.num_projectors(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.resolved_cameras == self.total_cameras
            && self.resolved_projectors == self.total_projectors
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} cameras and {}/{} projectors resolved",
            self.resolved_cameras,
            self.total_cameras,
            self.resolved_projectors,
            self.total_projectors
        )
    }
}

/// Place every device reachable from the anchor camera in the world frame.
///
/// The anchor keeps its pose (identity if it has none). All other poses are recomputed from the
/// calibrated point sets; devices with no calibrated path to the anchor end up with `None`.
pub fn unify(ensemble: &mut Ensemble) -> Resolution {
    if ensemble.cameras.is_empty() {
        return Resolution::of(ensemble);
    }
    for (i, camera) in ensemble.cameras.iter_mut().enumerate() {
        if i == ANCHOR {
            if camera.pose.is_none() {
                camera.pose = Some(Matrix4::identity());
            }
        } else {
            camera.pose = None;
        }
    }
    for projector in ensemble.projectors.iter_mut() {
        projector.pose = None;
    }

    let mut unfixed = (0..ensemble.num_projectors()).collect::<Vec<ProjectorId>>();
    loop {
        // first unfixed projector with a calibrated edge to a placed camera
        let next = unfixed.iter().enumerate().find_map(|(i, &p)| {
            ensemble
                .point_sets_for_projector(p)
                .filter(|s| s.is_calibrated())
                .find_map(|s| match (ensemble.cameras[s.camera].pose, s.pose) {
                    (Some(camera), Some(edge)) => Some((i, p, camera * pose::invert_rigid(&edge))),
                    _ => None,
                })
        });
        let (i, projector, projector_pose) = match next {
            Some(x) => x,
            None => break,
        };
        unfixed.remove(i);
        ensemble.projectors[projector].pose = Some(projector_pose);

        let placed = ensemble
            .point_sets_for_projector(projector)
            .filter(|s| s.is_calibrated() && ensemble.cameras[s.camera].pose.is_none())
            .filter_map(|s| s.pose.map(|edge| (s.camera, projector_pose * edge)))
            .collect::<Vec<_>>();
        for (camera, camera_pose) in placed {
            log::debug!("camera {} placed through projector {}", camera, projector);
            ensemble.cameras[camera].pose = Some(camera_pose);
        }
    }

    for p in unfixed.iter() {
        log::warn!("projector {} ({}) is not connected to the anchor camera", p, ensemble.projectors[*p].name);
    }
    for (i, c) in ensemble.cameras.iter().enumerate() {
        if c.pose.is_none() {
            log::warn!("camera {} ({}) is not connected to the anchor camera", i, c.name);
        }
    }
    let resolution = Resolution::of(ensemble);
    log::info!("{}", resolution);
    resolution
}

/// Where a camera's pose comes from during bundle adjustment.
#[derive(Debug, Clone, Copy)]
enum CameraParam {
    Fixed(Pose),
    Block(usize),
}

/// Inlier correspondences of one calibrated point set.
struct Edge {
    camera: CameraParam,
    projector: usize,
    model: CameraModel,
    world: Vec<Point3<f64>>,
    image: Vec<Point2<f64>>,
    /// First residual row of this edge.
    row: usize,
}

/// Reprojection error of every inlier over all resolved poses. Parameters are six per block
/// (rotation vector, translation): non-anchor cameras first, then projectors.
struct BundleProblem {
    cameras: Vec<CameraId>,
    projectors: Vec<ProjectorId>,
    edges: Vec<Edge>,
    num_residuals: usize,
}

impl BundleProblem {
    fn build(ensemble: &Ensemble) -> Self {
        let cameras = (0..ensemble.num_cameras())
            .filter(|c| *c != ANCHOR && ensemble.cameras[*c].pose.is_some())
            .collect::<Vec<_>>();
        let projectors = (0..ensemble.num_projectors())
            .filter(|p| ensemble.projectors[*p].pose.is_some() && ensemble.projectors[*p].model.is_some())
            .collect::<Vec<_>>();
        let camera_block = cameras.iter().enumerate().map(|(b, c)| (*c, b)).collect::<HashMap<_, _>>();
        let projector_block = projectors
            .iter()
            .enumerate()
            .map(|(b, p)| (*p, cameras.len() + b))
            .collect::<HashMap<_, _>>();

        let mut edges = Vec::new();
        let mut row = 0;
        for set in ensemble.point_sets().iter().filter(|s| s.is_calibrated()) {
            let camera = match (set.camera == ANCHOR, ensemble.cameras[set.camera].pose) {
                (true, Some(p)) => CameraParam::Fixed(p),
                (false, Some(_)) => CameraParam::Block(camera_block[&set.camera]),
                _ => continue,
            };
            let (projector, model) = match (projector_block.get(&set.projector), ensemble.projectors[set.projector].model) {
                (Some(b), Some(m)) => (*b, m),
                _ => continue,
            };
            edges.push(Edge {
                camera,
                projector,
                model,
                world: set.world_point_inliers.clone(),
                image: set.image_point_inliers.clone(),
                row,
            });
            row += 2 * set.world_point_inliers.len();
        }

        BundleProblem {
            cameras,
            projectors,
            edges,
            num_residuals: row,
        }
    }

    fn num_blocks(&self) -> usize {
        self.cameras.len() + self.projectors.len()
    }

    fn pack(&self, ensemble: &Ensemble) -> DVector<f64> {
        let poses = self
            .cameras
            .iter()
            .filter_map(|c| ensemble.cameras[*c].pose)
            .chain(self.projectors.iter().filter_map(|p| ensemble.projectors[*p].pose));
        let mut x = Vec::with_capacity(6 * self.num_blocks());
        for pose in poses {
            let (r, t) = pose::to_rt(&pose);
            x.extend_from_slice(&[r.x, r.y, r.z, t.x, t.y, t.z]);
        }
        DVector::from_vec(x)
    }

    fn block(p: &DVector<f64>, b: usize) -> Pose {
        let i = 6 * b;
        pose::from_rt(
            Vector3::new(p[i], p[i + 1], p[i + 2]),
            Vector3::new(p[i + 3], p[i + 4], p[i + 5]),
        )
    }

    fn unpack(&self, p: &DVector<f64>, ensemble: &mut Ensemble) {
        for (b, c) in self.cameras.iter().enumerate() {
            ensemble.cameras[*c].pose = Some(Self::block(p, b));
        }
        for (b, pr) in self.projectors.iter().enumerate() {
            ensemble.projectors[*pr].pose = Some(Self::block(p, self.cameras.len() + b));
        }
    }

    fn edge_residuals(&self, edge: &Edge, p: &DVector<f64>) -> Vec<f64> {
        let camera = match edge.camera {
            CameraParam::Fixed(pose) => pose,
            CameraParam::Block(b) => Self::block(p, b),
        };
        let projector = Self::block(p, edge.projector);
        // camera local -> world -> projector local
        let to_projector = pose::invert_rigid(&projector) * camera;
        edge.world
            .iter()
            .zip(edge.image.iter())
            .flat_map(|(w, uv)| {
                let predicted = edge.model.project(pose::transform_point(&to_projector, *w));
                vec![uv.x - predicted.x, uv.y - predicted.y]
            })
            .collect()
    }

    fn touches(edge: &Edge, b: usize) -> bool {
        edge.projector == b
            || match edge.camera {
                CameraParam::Block(c) => c == b,
                CameraParam::Fixed(_) => false,
            }
    }
}

impl Residuals for BundleProblem {
    fn num_residuals(&self) -> usize {
        self.num_residuals
    }

    fn residuals(&self, p: &DVector<f64>) -> DVector<f64> {
        let mut e = DVector::zeros(self.num_residuals);
        for edge in self.edges.iter() {
            for (i, v) in self.edge_residuals(edge, p).into_iter().enumerate() {
                e[edge.row + i] = v;
            }
        }
        e
    }

    /// Forward differences, re-evaluating only the edges a parameter touches.
    fn jacobian(&self, p: &DVector<f64>) -> DMatrix<f64> {
        let base = self
            .edges
            .iter()
            .map(|e| self.edge_residuals(e, p))
            .collect::<Vec<_>>();
        let columns = (0..p.len())
            .into_par_iter()
            .map(|j| {
                let step = (p[j].abs() * 1e-6).max(1e-6);
                let mut x = p.clone();
                x[j] += step;
                let mut column = DVector::zeros(self.num_residuals);
                for (edge, e0) in self.edges.iter().zip(base.iter()) {
                    if !Self::touches(edge, j / 6) {
                        continue;
                    }
                    for (i, (v, v0)) in self.edge_residuals(edge, &x).iter().zip(e0.iter()).enumerate() {
                        column[edge.row + i] = (v - v0) / step;
                    }
                }
                column
            })
            .collect::<Vec<_>>();
        DMatrix::from_columns(&columns)
    }
}

/// Result of [optimize_pose].
#[derive(Debug, Clone, Copy)]
pub struct BundleReport {
    pub initial_rms: f64,
    pub final_rms: f64,
    pub state: State,
    pub iterations: usize,
    pub observations: usize,
}

impl std::fmt::Display for BundleReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Bundle adjustment over {} observations: rms {:.4} -> {:.4} px in {} iterations ({:?})",
            self.observations, self.initial_rms, self.final_rms, self.iterations, self.state
        )
    }
}

/// Jointly refine the pose of every resolved device except the anchor camera to minimize the
/// reprojection error of all inliers. Intrinsics are held fixed.
///
/// The Jacobian is dense, two rows per inlier by six columns per free device, so memory grows
/// with inliers times devices. Thin out the inliers before adjusting very large rooms.
pub fn optimize_pose(ensemble: &mut Ensemble, config: &SolverConfig) -> BundleReport {
    let problem = BundleProblem::build(ensemble);
    let mut lm = LevenbergMarquardt::new(&problem, problem.pack(ensemble), *config);
    let initial_rms = lm.rms_error();
    let final_rms = lm.minimize();
    problem.unpack(&lm.parameters, ensemble);
    let report = BundleReport {
        initial_rms,
        final_rms,
        state: lm.state,
        iterations: lm.iterations(),
        observations: problem.num_residuals / 2,
    };
    log::info!("{}", report);
    report
}

/// RMS reprojection error (per coordinate) of every inlier whose camera and projector are both
/// resolved. `None` when there is nothing to measure.
pub fn reprojection_rms(ensemble: &Ensemble) -> Option<f64> {
    let (sum, count) = ensemble
        .point_sets()
        .iter()
        .filter(|s| s.is_calibrated())
        .filter_map(|s| {
            let camera = ensemble.cameras[s.camera].pose?;
            let projector = &ensemble.projectors[s.projector];
            let to_projector = pose::invert_rigid(&projector.pose?) * camera;
            let model = projector.model?;
            Some(
                s.world_point_inliers
                    .iter()
                    .zip(s.image_point_inliers.iter())
                    .map(|(w, uv)| {
                        let predicted = model.project(pose::transform_point(&to_projector, *w));
                        ((predicted - *uv).magnitude2(), 2)
                    })
                    .fold((0.0, 0), |(a, n), (b, m)| (a + b, n + m)),
            )
        })
        .fold((0.0, 0), |(a, n), (b, m)| (a + b, n + m));
    if count == 0 {
        None
    } else {
        Some((sum / count as f64).sqrt())
    }
}

/// A connected component of the correspondence graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    pub cameras: Vec<CameraId>,
    pub projectors: Vec<ProjectorId>,
}

/// Connected components over nonempty point sets, largest first. Devices without any
/// correspondences form their own components.
pub fn components(ensemble: &Ensemble) -> Vec<Component> {
    let num_cameras = ensemble.num_cameras();
    // projector node index is num_cameras + projector id
    let mut uf = UnionFind::new(num_cameras + ensemble.num_projectors());
    for set in ensemble.point_sets().iter().filter(|s| !s.is_empty()) {
        let p = num_cameras + set.projector;
        if !uf.equiv(set.camera, p) {
            uf.union(set.camera, p);
        }
    }

    let sets = uf.to_vec();
    let mut groups: Vec<(usize, Component)> = Vec::new();
    for (node, root) in sets.iter().enumerate() {
        let i = match groups.iter().position(|(r, _)| r == root) {
            Some(i) => i,
            None => {
                groups.push((
                    *root,
                    Component {
                        cameras: Vec::new(),
                        projectors: Vec::new(),
                    },
                ));
                groups.len() - 1
            }
        };
        if node < num_cameras {
            groups[i].1.cameras.push(node);
        } else {
            groups[i].1.projectors.push(node - num_cameras);
        }
    }
    groups
        .into_iter()
        .map(|(_, c)| c)
        .sorted_by(|a, b| {
            (b.cameras.len() + b.projectors.len()).cmp(&(a.cameras.len() + a.projectors.len()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::{CalibrationPointSet, Camera, Projector};
    use crate::pose::{from_rt, max_abs_difference, transform_point};

    fn lens() -> CameraModel {
        CameraModel::new(1000.0, 1000.0, 512.0, 384.0)
    }

    fn world_poses() -> (Vec<Pose>, Vec<Pose>) {
        let cameras = vec![
            Matrix4::identity(),
            from_rt(Vector3::new(0.0, 0.6, 0.0), Vector3::new(2.0, 0.1, -0.5)),
        ];
        let projectors = vec![
            from_rt(Vector3::new(0.02, 0.3, 0.0), Vector3::new(1.0, 0.3, -0.8)),
            from_rt(Vector3::new(-0.05, 0.9, 0.01), Vector3::new(2.5, 0.2, 0.3)),
        ];
        (cameras, projectors)
    }

    /// Exact correspondences of a grid of world points in front of both devices.
    fn edge(ensemble: &mut Ensemble, projector: ProjectorId, camera: CameraId, truth: &(Vec<Pose>, Vec<Pose>)) {
        let (cameras, projectors) = truth;
        let camera_to_projector = pose::invert_rigid(&projectors[projector]) * cameras[camera];
        let projector_to_camera = pose::invert_rigid(&camera_to_projector);
        let mut world = Vec::new();
        let mut image = Vec::new();
        for i in 0..10 {
            for j in 0..10 {
                // sample in the projector frame so every point is in front of it
                let local = Point3::new(-1.0 + 0.2 * i as f64, -0.8 + 0.16 * j as f64, 3.0 + 0.1 * ((i * j) % 5) as f64);
                world.push(transform_point(&projector_to_camera, local));
                image.push(lens().project(local));
            }
        }
        let inliers = (0..world.len()).collect::<Vec<_>>();
        let mut set = CalibrationPointSet::new(projector, camera, world, image).unwrap();
        set.set_fit(camera_to_projector, &inliers);
        ensemble.insert_point_set(set).unwrap();
    }

    fn room() -> (Ensemble, (Vec<Pose>, Vec<Pose>)) {
        let truth = world_poses();
        let mut e = Ensemble::new();
        e.add_camera(Camera::new("cam0", lens(), (512, 424)));
        e.add_camera(Camera::new("cam1", lens(), (512, 424)));
        e.add_projector(Projector::new("proj0", 1024, 768).with_model(lens()));
        e.add_projector(Projector::new("proj1", 1024, 768).with_model(lens()));
        edge(&mut e, 0, 0, &truth);
        edge(&mut e, 0, 1, &truth);
        edge(&mut e, 1, 1, &truth);
        (e, truth)
    }

    #[test]
    fn test_unify_propagates_through_chain() {
        let (mut e, (cameras, projectors)) = room();
        let resolution = unify(&mut e);
        assert!(resolution.is_complete());
        assert_eq!(resolution.to_string(), "2/2 cameras and 2/2 projectors resolved");

        assert!(max_abs_difference(&e.cameras[0].pose.unwrap(), &cameras[0]) < 1e-12);
        assert!(max_abs_difference(&e.projectors[0].pose.unwrap(), &projectors[0]) < 1e-9);
        assert!(max_abs_difference(&e.cameras[1].pose.unwrap(), &cameras[1]) < 1e-9);
        assert!(max_abs_difference(&e.projectors[1].pose.unwrap(), &projectors[1]) < 1e-9);

        // T_camera = T_projector * T_(camera in projector) on every edge
        for set in e.point_sets() {
            let composed = e.projectors[set.projector].pose.unwrap() * set.pose.unwrap();
            assert!(max_abs_difference(&composed, &e.cameras[set.camera].pose.unwrap()) < 1e-9);
        }
        assert!(reprojection_rms(&e).unwrap() < 1e-6);
    }

    #[test]
    fn test_unify_keeps_anchor_and_clears_others() {
        let (mut e, _) = room();
        let anchor = from_rt(Vector3::new(0.0, 0.1, 0.0), Vector3::new(5.0, 0.0, 0.0));
        e.cameras[0].pose = Some(anchor);
        e.cameras[1].pose = Some(Matrix4::identity());
        unify(&mut e);
        assert_eq!(e.cameras[0].pose, Some(anchor));
        assert!(max_abs_difference(&e.cameras[1].pose.unwrap(), &Matrix4::identity()) > 1.0);
    }

    #[test]
    fn test_disconnected_projector_stays_unresolved() {
        let (mut e, truth) = room();
        e.add_camera(Camera::new("cam2", lens(), (512, 424)));
        e.add_projector(Projector::new("proj2", 1024, 768).with_model(lens()));
        let mut far = truth.clone();
        far.0.push(from_rt(Vector3::new(0.0, 0.0, 0.0), Vector3::new(10.0, 0.0, 0.0)));
        far.1.push(from_rt(Vector3::new(0.0, 0.0, 0.0), Vector3::new(10.0, 0.0, -1.0)));
        edge(&mut e, 2, 2, &far);

        let resolution = unify(&mut e);
        assert!(!resolution.is_complete());
        assert_eq!(resolution.resolved_cameras, 2);
        assert_eq!(resolution.resolved_projectors, 2);
        assert_eq!(e.projectors[2].pose, None);
        assert_eq!(e.cameras[2].pose, None);

        let parts = components(&e);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].cameras, vec![0, 1]);
        assert_eq!(parts[0].projectors, vec![0, 1]);
        assert_eq!(parts[1].cameras, vec![2]);
        assert_eq!(parts[1].projectors, vec![2]);
    }

    #[test]
    fn test_uncalibrated_edge_does_not_link() {
        let (mut e, _) = room();
        e.point_set_mut(1, 1).unwrap().clear_fit();
        let resolution = unify(&mut e);
        assert_eq!(resolution.resolved_projectors, 1);
        assert_eq!(e.projectors[1].pose, None);
        // still connected as far as correspondences go
        assert_eq!(components(&e).len(), 1);
    }

    #[test]
    fn test_bundle_adjustment_reduces_error() {
        let (mut e, (cameras, projectors)) = room();
        // perturb the edge poses so the unified graph is inconsistent
        for (k, set) in [(0usize, 1usize), (1, 1)].iter().enumerate() {
            let s = e.point_set_mut(set.0, set.1).unwrap();
            let noise = from_rt(Vector3::new(0.004 * (k as f64 + 1.0), -0.003, 0.002), Vector3::new(0.02, -0.01, 0.015));
            s.pose = Some(noise * s.pose.unwrap());
        }
        unify(&mut e);
        let before = reprojection_rms(&e).unwrap();
        assert!(before > 1.0);

        let report = optimize_pose(&mut e, &SolverConfig::default());
        let after = reprojection_rms(&e).unwrap();
        assert!(after <= before);
        assert!(after < 1e-3);
        assert!((report.initial_rms - before).abs() < 1e-9);
        assert!((report.final_rms - after).abs() < 1e-9);
        assert_eq!(report.observations, 300);

        // the anchor never moves and the rest returns to the truth
        assert_eq!(e.cameras[0].pose, Some(cameras[0]));
        assert!(max_abs_difference(&e.cameras[1].pose.unwrap(), &cameras[1]) < 1e-4);
        assert!(max_abs_difference(&e.projectors[1].pose.unwrap(), &projectors[1]) < 1e-4);
    }
}
