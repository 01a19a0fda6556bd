//! Linear pose and intrinsics estimates from 3D-2D correspondences.
//!
//! These provide starting points for the nonlinear refinement in [crate::ransac]. All estimates
//! ignore lens distortion except [extrinsics_init], which undistorts image points with the known
//! model first.
use cgmath::{Point2, Point3};
use nalgebra as na;
use nalgebra::{DMatrix, DVector, Matrix3, Matrix3x4, Matrix4, SymmetricEigen, Vector3};

use crate::camera_model::CameraModel;
use crate::pose::{self, Pose};
use crate::{Error, Result};

/// Unit vector minimizing `|A x|`: the eigenvector of `A^T A` with the smallest eigenvalue.
fn null_vector(a: &DMatrix<f64>) -> DVector<f64> {
    let eigen = SymmetricEigen::new(a.tr_mul(a));
    eigen.eigenvectors.column(eigen.eigenvalues.imin()).into_owned()
}

fn centroid(points: &[Point3<f64>]) -> Vector3<f64> {
    points
        .iter()
        .fold(Vector3::zeros(), |acc, p| acc + Vector3::new(p.x, p.y, p.z))
        / points.len() as f64
}

pub(crate) fn to_cgmath(r: &Matrix3<f64>) -> cgmath::Matrix3<f64> {
    cgmath::Matrix3::new(
        r[(0, 0)],
        r[(1, 0)],
        r[(2, 0)],
        r[(0, 1)],
        r[(1, 1)],
        r[(2, 1)],
        r[(0, 2)],
        r[(1, 2)],
        r[(2, 2)],
    )
}

fn pose_from(r: &Matrix3<f64>, t: &Vector3<f64>) -> Pose {
    pose::from_parts(to_cgmath(r), cgmath::Vector3::new(t.x, t.y, t.z))
}

/// Closest rotation matrix in the Frobenius sense.
fn nearest_rotation(m: &Matrix3<f64>) -> Matrix3<f64> {
    let svd = m.svd(true, true);
    match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => {
            let r = u * v_t;
            if r.determinant() < 0.0 {
                let mut u = u;
                u.column_mut(2).neg_mut();
                u * v_t
            } else {
                r
            }
        }
        _ => Matrix3::identity(),
    }
}

/// Ratio of the smallest to the middle eigenvalue of the points' covariance. Near zero for
/// coplanar (or collinear) points.
pub fn coplanarity(points: &[Point3<f64>]) -> f64 {
    if points.len() < 4 {
        return 0.0;
    }
    let c = centroid(points);
    let cov = points.iter().fold(Matrix3::zeros(), |acc, p| {
        let d = Vector3::new(p.x, p.y, p.z) - c;
        acc + d * d.transpose()
    }) / points.len() as f64;
    let mut eigenvalues = SymmetricEigen::new(cov).eigenvalues.iter().cloned().collect::<Vec<_>>();
    eigenvalues.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if eigenvalues[1] <= 0.0 {
        0.0
    } else {
        eigenvalues[0].max(0.0) / eigenvalues[1]
    }
}

pub fn is_coplanar(points: &[Point3<f64>], ratio: f64) -> bool {
    coplanarity(points) < ratio
}

/// Estimate the 3x4 projection matrix `P ~ K [R | t]` with the normalized direct linear transform.
/// Needs at least 6 non-coplanar points.
pub fn projection_dlt(world: &[Point3<f64>], image: &[Point2<f64>]) -> Result<Matrix3x4<f64>> {
    let n = world.len();
    if n < 6 || image.len() != n {
        return Err(Error::Degenerate(format!(
            "projection DLT needs at least 6 correspondences, got {}",
            n.min(image.len())
        )));
    }

    // Hartley normalization of both point sets
    let wc = centroid(world);
    let w_dist = world
        .iter()
        .map(|p| (Vector3::new(p.x, p.y, p.z) - wc).norm())
        .sum::<f64>()
        / n as f64;
    let (ic_x, ic_y) = image
        .iter()
        .fold((0.0, 0.0), |(x, y), p| (x + p.x, y + p.y));
    let (ic_x, ic_y) = (ic_x / n as f64, ic_y / n as f64);
    let i_dist = image
        .iter()
        .map(|p| ((p.x - ic_x).powi(2) + (p.y - ic_y).powi(2)).sqrt())
        .sum::<f64>()
        / n as f64;
    if w_dist <= f64::EPSILON || i_dist <= f64::EPSILON {
        return Err(Error::Degenerate(
            "points collapse to a single location".to_string(),
        ));
    }
    let ws = 3f64.sqrt() / w_dist;
    let is = 2f64.sqrt() / i_dist;

    let mut a = DMatrix::zeros(2 * n, 12);
    for (i, (w, p)) in world.iter().zip(image).enumerate() {
        let x = (w.x - wc.x) * ws;
        let y = (w.y - wc.y) * ws;
        let z = (w.z - wc.z) * ws;
        let u = (p.x - ic_x) * is;
        let v = (p.y - ic_y) * is;
        let r0 = [x, y, z, 1.0, 0.0, 0.0, 0.0, 0.0, -u * x, -u * y, -u * z, -u];
        let r1 = [0.0, 0.0, 0.0, 0.0, x, y, z, 1.0, -v * x, -v * y, -v * z, -v];
        for j in 0..12 {
            a[(2 * i, j)] = r0[j];
            a[(2 * i + 1, j)] = r1[j];
        }
    }

    let h = null_vector(&a);
    let p_n = Matrix3x4::from_row_slice(h.as_slice());

    #[rustfmt::skip]
    let t_world = Matrix4::new(
        ws, 0.0, 0.0, -ws * wc.x,
        0.0, ws, 0.0, -ws * wc.y,
        0.0, 0.0, ws, -ws * wc.z,
        0.0, 0.0, 0.0, 1.0,
    );
    #[rustfmt::skip]
    let t_image_inv = Matrix3::new(
        1.0 / is, 0.0, ic_x,
        0.0, 1.0 / is, ic_y,
        0.0, 0.0, 1.0,
    );
    Ok(t_image_inv * p_n * t_world)
}

/// Split `P = K [R | t]` with an RQ decomposition. Skew is dropped from the returned model.
pub fn decompose_projection(p: &Matrix3x4<f64>) -> Result<(CameraModel, Pose)> {
    let mut p = *p;
    let mut m: Matrix3<f64> = p.fixed_view::<3, 3>(0, 0).into_owned();
    if m.determinant().abs() < f64::EPSILON {
        return Err(Error::Degenerate("projection matrix is singular".to_string()));
    }
    // choose the scale sign that puts points in front of the device
    if m.determinant() < 0.0 {
        p = -p;
        m = -m;
    }

    #[rustfmt::skip]
    let flip = Matrix3::new(
        0.0, 0.0, 1.0,
        0.0, 1.0, 0.0,
        1.0, 0.0, 0.0,
    );
    let qr = (flip * m).transpose().qr();
    let mut k = flip * qr.r().transpose() * flip;
    let mut r = flip * qr.q().transpose();
    for i in 0..3 {
        if k[(i, i)] < 0.0 {
            k.column_mut(i).neg_mut();
            r.row_mut(i).neg_mut();
        }
    }

    let k_inv = k
        .try_inverse()
        .ok_or_else(|| Error::Degenerate("intrinsic matrix is singular".to_string()))?;
    let t = k_inv * p.column(3);
    let k = k / k[(2, 2)];
    let model = CameraModel::new(k[(0, 0)], k[(1, 1)], k[(0, 2)], k[(1, 2)]);
    Ok((model, pose_from(&r, &t)))
}

/// Intrinsics and camera-to-device pose from non-coplanar correspondences.
pub fn calibrate_dlt(world: &[Point3<f64>], image: &[Point2<f64>]) -> Result<(CameraModel, Pose)> {
    decompose_projection(&projection_dlt(world, image)?)
}

/// Pose estimate when the intrinsics are known. Image points are undistorted with `model`;
/// coplanar points (by `coplanarity_ratio`) use a plane induced homography, everything else a
/// direct linear transform on normalized coordinates.
pub fn extrinsics_init(
    model: &CameraModel,
    world: &[Point3<f64>],
    image: &[Point2<f64>],
    coplanarity_ratio: f64,
) -> Result<Pose> {
    let normalized = image.iter().map(|p| model.undistort(*p)).collect::<Vec<_>>();
    if is_coplanar(world, coplanarity_ratio) {
        return planar_pose(world, &normalized);
    }

    let mut p = projection_dlt(world, &normalized)?;
    let mut m: Matrix3<f64> = p.fixed_view::<3, 3>(0, 0).into_owned();
    if m.determinant() < 0.0 {
        p = -p;
        m = -m;
    }
    let scale = m.singular_values().sum() / 3.0;
    if scale <= f64::EPSILON {
        return Err(Error::Degenerate("projection matrix is singular".to_string()));
    }
    let r = nearest_rotation(&m);
    let t: Vector3<f64> = p.column(3) / scale;
    Ok(pose_from(&r, &t))
}

/// Pose of a plane of points from a homography to normalized image coordinates.
fn planar_pose(world: &[Point3<f64>], normalized: &[Point2<f64>]) -> Result<Pose> {
    let n = world.len();
    if n < 4 || normalized.len() != n {
        return Err(Error::Degenerate(format!(
            "planar pose needs at least 4 correspondences, got {}",
            n.min(normalized.len())
        )));
    }

    // plane frame: in-plane axes from the two largest principal directions
    let c = centroid(world);
    let cov = world.iter().fold(Matrix3::zeros(), |acc, p| {
        let d = Vector3::new(p.x, p.y, p.z) - c;
        acc + d * d.transpose()
    });
    let eigen = SymmetricEigen::new(cov);
    let mut order = [0usize, 1, 2];
    order.sort_by(|a, b| {
        eigen.eigenvalues[*b]
            .partial_cmp(&eigen.eigenvalues[*a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut basis = Matrix3::from_columns(&[
        eigen.eigenvectors.column(order[0]).into_owned(),
        eigen.eigenvectors.column(order[1]).into_owned(),
        eigen.eigenvectors.column(order[2]).into_owned(),
    ]);
    if basis.determinant() < 0.0 {
        basis.column_mut(2).neg_mut();
    }
    let to_plane = basis.transpose();

    let mut a = DMatrix::zeros(2 * n, 9);
    for (i, (w, q)) in world.iter().zip(normalized).enumerate() {
        let local = to_plane * (Vector3::new(w.x, w.y, w.z) - c);
        let (x, y) = (local.x, local.y);
        let (u, v) = (q.x, q.y);
        let r0 = [x, y, 1.0, 0.0, 0.0, 0.0, -u * x, -u * y, -u];
        let r1 = [0.0, 0.0, 0.0, x, y, 1.0, -v * x, -v * y, -v];
        for j in 0..9 {
            a[(2 * i, j)] = r0[j];
            a[(2 * i + 1, j)] = r1[j];
        }
    }
    let h = na::Matrix3::from_row_slice(null_vector(&a).as_slice());

    let h1 = h.column(0).into_owned();
    let h2 = h.column(1).into_owned();
    let h3 = h.column(2).into_owned();
    let norm = (h1.norm() + h2.norm()) / 2.0;
    if norm <= f64::EPSILON {
        return Err(Error::Degenerate("homography is singular".to_string()));
    }
    let mut lambda = 1.0 / norm;
    if h3.z * lambda < 0.0 {
        lambda = -lambda;
    }
    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let t = h3 * lambda;
    let r = nearest_rotation(&Matrix3::from_columns(&[r1, r2, r1.cross(&r2)]));

    let rotation = r * to_plane;
    Ok(pose_from(&rotation, &(t - rotation * c)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pose::{from_rt, max_abs_difference, transform_point};
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Points scattered through a box in front of the device.
    pub(crate) fn box_points(n: usize, seed: u64) -> Vec<Point3<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                Point3::new(
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(-0.8..0.8),
                    rng.gen_range(2.0..4.0),
                )
            })
            .collect()
    }

    fn projector() -> CameraModel {
        CameraModel::new(1400.0, 1380.0, 512.0, 700.0)
    }

    fn camera_to_projector() -> Pose {
        from_rt(
            cgmath::Vector3::new(0.05, -0.2, 0.03),
            cgmath::Vector3::new(0.3, -0.1, 0.4),
        )
    }

    fn observe(model: &CameraModel, pose: &Pose, world: &[Point3<f64>]) -> Vec<Point2<f64>> {
        world
            .iter()
            .map(|p| model.project(transform_point(pose, *p)))
            .collect()
    }

    #[test]
    fn test_dlt_recovers_intrinsics_and_pose() {
        let world = box_points(50, 1);
        let image = observe(&projector(), &camera_to_projector(), &world);
        let (model, pose) = calibrate_dlt(&world, &image).unwrap();
        let truth = projector();
        assert_abs_diff_eq!(model.fx, truth.fx, epsilon = 1e-5);
        assert_abs_diff_eq!(model.fy, truth.fy, epsilon = 1e-5);
        assert_abs_diff_eq!(model.cx, truth.cx, epsilon = 1e-5);
        assert_abs_diff_eq!(model.cy, truth.cy, epsilon = 1e-5);
        assert!(max_abs_difference(&pose, &camera_to_projector()) < 1e-7);
    }

    #[test]
    fn test_dlt_needs_six_points() {
        let world = box_points(5, 2);
        let image = observe(&projector(), &camera_to_projector(), &world);
        assert!(matches!(
            calibrate_dlt(&world, &image),
            Err(Error::Degenerate(_))
        ));
    }

    #[test]
    fn test_extrinsics_init_general_points() {
        let model = projector().with_distortion(0.05, -0.02);
        let world = box_points(40, 3);
        let image = observe(&model, &camera_to_projector(), &world);
        let pose = extrinsics_init(&model, &world, &image, 1e-3).unwrap();
        assert!(max_abs_difference(&pose, &camera_to_projector()) < 1e-5);
    }

    #[test]
    fn test_extrinsics_init_planar_points() {
        // a tilted wall
        let mut rng = StdRng::seed_from_u64(4);
        let world = (0..40)
            .map(|_| {
                let a: f64 = rng.gen_range(-1.0..1.0);
                let b: f64 = rng.gen_range(-1.0..1.0);
                Point3::new(a, b, 3.0 + 0.3 * a - 0.2 * b)
            })
            .collect::<Vec<_>>();
        assert!(is_coplanar(&world, 1e-3));
        let model = projector();
        let image = observe(&model, &camera_to_projector(), &world);
        let pose = extrinsics_init(&model, &world, &image, 1e-3).unwrap();
        assert!(max_abs_difference(&pose, &camera_to_projector()) < 1e-7);
    }

    #[test]
    fn test_coplanarity() {
        assert!(coplanarity(&box_points(100, 5)) > 0.1);
        let flat = box_points(100, 6)
            .into_iter()
            .map(|p| Point3::new(p.x, p.y, 2.0))
            .collect::<Vec<_>>();
        assert!(coplanarity(&flat) < 1e-12);
        assert_eq!(coplanarity(&flat[..3]), 0.0);
    }
}
