//! Pinhole camera with two term radial distortion.
//!
//! The same model describes the color and depth sensors of a camera and the lens of a projector
//! (a projector is treated as a camera running backwards).
use cgmath::prelude::*;
use cgmath::{Matrix3, Point2, Point3, Vector2};
use serde::{Deserialize, Serialize};

const UNDISTORT_ITERATIONS: usize = 100;
const UNDISTORT_TOLERANCE: f64 = 1e-4;

/// Focal lengths `fx`, `fy` and principal point `cx`, `cy` in pixels; radial distortion
/// coefficients `k1` (on r^2) and `k2` (on r^4) in normalized coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub k1: f64,
    pub k2: f64,
}

impl CameraModel {
    /// Distortion free model.
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        CameraModel {
            fx,
            fy,
            cx,
            cy,
            k1: 0.0,
            k2: 0.0,
        }
    }

    pub fn with_distortion(self, k1: f64, k2: f64) -> Self {
        CameraModel { k1, k2, ..self }
    }

    /// Project a point in the device frame into pixel coordinates.
    pub fn project(&self, p: Point3<f64>) -> Point2<f64> {
        let d = self.distort(Point2::new(p.x / p.z, p.y / p.z));
        Point2::new(self.fx * d.x + self.cx, self.fy * d.y + self.cy)
    }

    /// Apply radial distortion to normalized coordinates.
    pub fn distort(&self, n: Point2<f64>) -> Point2<f64> {
        let r2 = n.to_vec().magnitude2();
        let scale = 1.0 + self.k1 * r2 + self.k2 * r2 * r2;
        Point2::from_vec(n.to_vec() * scale)
    }

    /// Invert [CameraModel::project] up to depth: returns the normalized, undistorted coordinates
    /// `(X/Z, Y/Z)` that project to pixel `uv`.
    ///
    /// The distorted radius is inverted with Newton-Raphson. If the iteration does not converge
    /// the last estimate is returned.
    pub fn undistort(&self, uv: Point2<f64>) -> Point2<f64> {
        let d = Vector2::new((uv.x - self.cx) / self.fx, (uv.y - self.cy) / self.fy);
        let rd = d.magnitude();
        if rd == 0.0 {
            return Point2::from_vec(d);
        }

        let mut r = rd;
        for _ in 0..UNDISTORT_ITERATIONS {
            let r2 = r * r;
            let num = r * (1.0 + self.k1 * r2 + self.k2 * r2 * r2) - rd;
            let denom = 1.0 + 3.0 * self.k1 * r2 + 5.0 * self.k2 * r2 * r2;
            if denom == 0.0 || !denom.is_finite() {
                break;
            }
            let step = num / denom;
            r -= step;
            if step.abs() < UNDISTORT_TOLERANCE {
                break;
            }
        }
        Point2::from_vec(d * (r / rd))
    }

    /// Upper triangular intrinsic matrix.
    pub fn camera_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, 0.0, //
            0.0, self.fy, 0.0, //
            self.cx, self.cy, 1.0,
        )
    }

    /// `[fx, fy, cx, cy]`, the parameters estimated during projector calibration.
    pub fn intrinsics(&self) -> [f64; 4] {
        [self.fx, self.fy, self.cx, self.cy]
    }

    /// Replace `fx, fy, cx, cy` keeping the distortion coefficients.
    pub fn with_intrinsics(self, x: &[f64]) -> Self {
        CameraModel {
            fx: x[0],
            fy: x[1],
            cx: x[2],
            cy: x[3],
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn kinect_like() -> CameraModel {
        CameraModel::new(365.0, 365.0, 256.0, 212.0).with_distortion(0.09, -0.27)
    }

    #[test]
    fn test_project_principal_point() {
        let c = kinect_like();
        let uv = c.project(Point3::new(0.0, 0.0, 2.0));
        assert_eq!(uv, Point2::new(256.0, 212.0));
    }

    #[test]
    fn test_undistort_project_round_trip() {
        let c = kinect_like();
        for &(x, y, z) in [
            (0.1, 0.2, 1.0),
            (-0.5, 0.3, 2.0),
            (0.9, -0.7, 3.0),
            (-0.4, -0.4, 1.2),
        ]
        .iter()
        {
            let n = c.undistort(c.project(Point3::new(x, y, z)));
            assert_abs_diff_eq!(n.x, x / z, epsilon = 1e-4);
            assert_abs_diff_eq!(n.y, y / z, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_undistort_without_distortion() {
        let c = CameraModel::new(1000.0, 1100.0, 512.0, 700.0);
        let n = c.undistort(Point2::new(612.0, 480.0));
        assert_abs_diff_eq!(n.x, 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(n.y, -0.2, epsilon = 1e-12);
    }

    #[test]
    fn test_undistort_never_panics_on_divergence() {
        // strongly negative k1 folds the distortion curve over; result need not be accurate
        let c = CameraModel::new(100.0, 100.0, 0.0, 0.0).with_distortion(-5.0, 0.0);
        let n = c.undistort(Point2::new(1000.0, 1000.0));
        assert!(!n.x.is_infinite());
    }
}
