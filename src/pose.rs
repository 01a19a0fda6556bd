//! Rigid transforms between device frames.
//!
//! A [Pose] is a homogeneous 4x4 matrix. Device poses map device-local coordinates into the world
//! frame, and calibration poses map camera-local coordinates into projector-local coordinates.
//! Composition reads right to left: `a * b` applies `b` first.
use cgmath::prelude::*;
use cgmath::{Matrix3, Matrix4, Point3, Quaternion, Rad, Vector3};

/// Homogeneous rigid transform.
pub type Pose = Matrix4<f64>;

/// Convert a Rodrigues vector (axis scaled by angle) to a rotation matrix.
pub fn from_rodrigues(x: Vector3<f64>) -> Matrix3<f64> {
    let theta2 = x.dot(x);
    if theta2 > f64::EPSILON {
        let angle = Rad(theta2.sqrt());
        let axis = x.normalize();
        Matrix3::from_axis_angle(axis, angle)
    } else {
        // first order expansion, columns of I + [x]_x
        Matrix3::new(1.0, x[2], -x[1], -x[2], 1.0, x[0], x[1], -x[0], 1.0)
    }
}

/// Convert a rotation matrix to a Rodrigues vector. The returned angle lies in `[0, pi]`.
pub fn to_rodrigues(r: Matrix3<f64>) -> Vector3<f64> {
    let q = Quaternion::from(r);
    // both q and -q represent the same rotation, pick the one with the short angle
    let (s, v) = if q.s < 0.0 { (-q.s, -q.v) } else { (q.s, q.v) };
    let sin_half = v.magnitude();
    if sin_half < 1e-12 {
        return v * 2.0;
    }
    let angle = 2.0 * sin_half.atan2(s);
    v * (angle / sin_half)
}

/// Rotation block of a pose.
pub fn rotation(pose: &Pose) -> Matrix3<f64> {
    Matrix3::from_cols(pose.x.truncate(), pose.y.truncate(), pose.z.truncate())
}

/// Translation column of a pose.
pub fn translation(pose: &Pose) -> Vector3<f64> {
    pose.w.truncate()
}

/// Assemble a pose from a rotation matrix and a translation.
pub fn from_parts(r: Matrix3<f64>, t: Vector3<f64>) -> Pose {
    let mut pose = Matrix4::from(r);
    pose.w = t.extend(1.0);
    pose
}

/// Assemble a pose from a Rodrigues vector and a translation.
pub fn from_rt(r: Vector3<f64>, t: Vector3<f64>) -> Pose {
    from_parts(from_rodrigues(r), t)
}

/// Split a pose into a Rodrigues vector and a translation.
pub fn to_rt(pose: &Pose) -> (Vector3<f64>, Vector3<f64>) {
    (to_rodrigues(rotation(pose)), translation(pose))
}

/// Inverse of a rigid transform. Uses the transpose of the rotation block, so the input must be
/// rigid.
pub fn invert_rigid(pose: &Pose) -> Pose {
    let rt = rotation(pose).transpose();
    from_parts(rt, -(rt * translation(pose)))
}

/// Apply a pose to a point.
pub fn transform_point(pose: &Pose, p: Point3<f64>) -> Point3<f64> {
    Point3::from_vec(rotation(pose) * p.to_vec() + translation(pose))
}

/// Device-to-world pose of a device at `eye` looking at `target`. The device looks down its
/// positive z axis with y pointing down in the image.
pub fn look_at(eye: Point3<f64>, target: Point3<f64>, up: Vector3<f64>) -> Pose {
    let forward = (target - eye).normalize();
    let right = forward.cross(up).normalize();
    let down = forward.cross(right);
    from_parts(Matrix3::from_cols(right, down, forward), eye.to_vec())
}

/// Largest absolute elementwise difference between two poses.
pub fn max_abs_difference(a: &Pose, b: &Pose) -> f64 {
    let a: &[f64; 16] = a.as_ref();
    let b: &[f64; 16] = b.as_ref();
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_rodrigues_round_trip() {
        let vs = [
            Vector3::new(0.3, -0.2, 0.1),
            Vector3::new(1.5, 0.0, -2.0),
            Vector3::new(0.0, 3.0, 0.0),
            Vector3::new(1e-10, 0.0, 0.0),
        ];
        for v in vs.iter() {
            let back = to_rodrigues(from_rodrigues(*v));
            assert_abs_diff_eq!(back.x, v.x, epsilon = 1e-9);
            assert_abs_diff_eq!(back.y, v.y, epsilon = 1e-9);
            assert_abs_diff_eq!(back.z, v.z, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_rodrigues_axis_convention() {
        // quarter turn about +z sends +x to +y
        let r = from_rodrigues(Vector3::new(0.0, 0.0, std::f64::consts::FRAC_PI_2));
        let x = r * Vector3::new(1.0, 0.0, 0.0);
        assert_abs_diff_eq!(x.x, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x.y, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(r.determinant(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_identity_has_zero_rotation_vector() {
        let v = to_rodrigues(Matrix3::identity());
        assert_eq!(v, Vector3::new(0.0, 0.0, 0.0));
    }

    #[test]
    fn test_invert_rigid() {
        let pose = from_rt(Vector3::new(0.4, -1.1, 0.3), Vector3::new(1.0, 2.0, -3.0));
        let prod = pose * invert_rigid(&pose);
        assert!(max_abs_difference(&prod, &Matrix4::identity()) < 1e-12);
        let p = Point3::new(0.5, -0.25, 2.0);
        let back = transform_point(&invert_rigid(&pose), transform_point(&pose, p));
        assert_abs_diff_eq!(back.x, p.x, epsilon = 1e-12);
        assert_abs_diff_eq!(back.y, p.y, epsilon = 1e-12);
        assert_abs_diff_eq!(back.z, p.z, epsilon = 1e-12);
    }

    #[test]
    fn test_look_at_points_forward() {
        let eye = Point3::new(1.0, 2.0, 3.0);
        let target = Point3::new(0.0, 0.0, 0.0);
        let pose = look_at(eye, target, Vector3::new(0.0, 1.0, 0.0));
        let local = transform_point(&invert_rigid(&pose), target);
        assert_abs_diff_eq!(local.x, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(local.y, 0.0, epsilon = 1e-12);
        assert!(local.z > 0.0);
        assert_abs_diff_eq!(rotation(&pose).determinant(), 1.0, epsilon = 1e-12);
    }
}
