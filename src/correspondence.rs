//! Turn decoded Gray code maps and a depth frame into a [CalibrationPointSet].
use cgmath::{Point2, Point3, Vector2};
use image::{ImageBuffer, Luma};
use rayon::prelude::*;

use crate::camera_model::CameraModel;
use crate::ensemble::{CalibrationPointSet, Camera, CameraId, ProjectorId};
use crate::gray_code::DecodedCorrespondences;
use crate::pose;
use crate::{Error, Result};

/// Depth frame with one distance sample per pixel, in sensor units.
pub type DepthImage = ImageBuffer<Luma<u16>, Vec<u16>>;

/// Millimetre depth units.
pub const DEFAULT_DEPTH_SCALE: f64 = 1e-3;

/// Undistorted ray `(x/z, y/z)` through every depth pixel.
#[derive(Debug, Clone)]
pub struct DepthLookupTable {
    pub width: u32,
    pub height: u32,
    rays: Vec<Vector2<f64>>,
}

impl DepthLookupTable {
    pub fn from_camera_model(model: &CameraModel, width: u32, height: u32) -> Self {
        let rays = (0..width * height)
            .into_par_iter()
            .map(|i| {
                let n = model.undistort(Point2::new((i % width) as f64, (i / width) as f64));
                Vector2::new(n.x, n.y)
            })
            .collect();
        DepthLookupTable {
            width,
            height,
            rays,
        }
    }

    /// Point in the depth camera frame at pixel `(x, y)` with depth `z`.
    pub fn point(&self, x: u32, y: u32, z: f64) -> Point3<f64> {
        let r = self.rays[(y * self.width + x) as usize];
        Point3::new(r.x * z, r.y * z, z)
    }
}

/// Correspondences between `projector` and the camera for every depth pixel whose color pixel
/// decoded.
///
/// Each valid depth sample is lifted to 3D with `lut`, moved into the color sensor frame and
/// projected with the color model. The nearest color pixel's decoded projector pixel pairs with
/// the 3D point, which stays in the depth frame.
pub fn point_set_from_decoded(
    projector: ProjectorId,
    camera_id: CameraId,
    camera: &Camera,
    decoded: &DecodedCorrespondences,
    depth: &DepthImage,
    lut: &DepthLookupTable,
    depth_scale: f64,
) -> Result<CalibrationPointSet> {
    if depth.dimensions() != (lut.width, lut.height) {
        return Err(Error::InvalidInput(format!(
            "depth frame is {}x{} but the lookup table is {}x{}",
            depth.width(),
            depth.height(),
            lut.width,
            lut.height
        )));
    }

    let (w, h) = (decoded.width() as f64, decoded.height() as f64);
    let (world_points, image_points): (Vec<_>, Vec<_>) = (0..depth.height())
        .into_par_iter()
        .flat_map_iter(|y| {
            (0..depth.width()).filter_map(move |x| {
                let d = depth.get_pixel(x, y)[0];
                if d == 0 {
                    return None;
                }
                let p = lut.point(x, y, d as f64 * depth_scale);
                let in_color = pose::transform_point(&camera.depth_to_color, p);
                if in_color.z <= 0.0 {
                    return None;
                }
                let uv = camera.color_model.project(in_color);
                let (u, v) = (uv.x.round(), uv.y.round());
                if u < 0.0 || v < 0.0 || u >= w || v >= h {
                    return None;
                }
                decoded
                    .get(u as u32, v as u32)
                    .map(|(px, py)| (p, Point2::new(px as f64, py as f64)))
            })
        })
        .unzip();

    log::debug!(
        "projector {} camera {}: {} correspondences",
        projector,
        camera_id,
        world_points.len()
    );
    CalibrationPointSet::new(projector, camera_id, world_points, image_points)
}
