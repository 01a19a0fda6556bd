//! Structured light capture sequencing.
//!
//! Hardware is reached only through [PatternDisplay] and [FrameSource], so the sequence can run
//! against real devices, a renderer or a test double.
use image::GrayImage;

use crate::ensemble::ProjectorId;
use crate::gray_code::GrayCode;
use crate::{Error, Result};

/// Puts images on projectors.
pub trait PatternDisplay {
    /// Show `pattern` full screen on `projector`. Returns once the pattern is visible.
    fn display(&mut self, projector: ProjectorId, pattern: &GrayImage) -> Result<()>;
}

/// A camera delivering grayscale color frames.
pub trait FrameSource {
    /// Most recent frame captured after the last displayed pattern settled.
    fn acquire_latest_frame(&mut self) -> Result<GrayImage>;
}

/// Mean of several frames of the same scene.
fn average_frames(frames: &[GrayImage]) -> Result<GrayImage> {
    let (w, h) = match frames.first() {
        Some(f) => f.dimensions(),
        None => return Err(Error::InvalidInput("no frames to average".to_string())),
    };
    if frames.iter().any(|f| f.dimensions() != (w, h)) {
        return Err(Error::InvalidInput(
            "frames changed size during acquisition".to_string(),
        ));
    }
    let count = frames.len() as u32;
    Ok(GrayImage::from_fn(w, h, |x, y| {
        let sum: u32 = frames.iter().map(|f| f.get_pixel(x, y)[0] as u32).sum();
        image::Luma([(sum / count) as u8])
    }))
}

/// Project every Gray code pattern of `codec` on `projector` and record each camera's view.
///
/// Other projectors should be dark for the duration. `frames_per_pattern` frames are averaged per
/// pattern. The result holds one capture sequence per camera, in pattern order, ready for
/// [GrayCode::decode].
pub fn acquire_gray_code<D, F>(
    codec: &GrayCode,
    projector: ProjectorId,
    display: &mut D,
    cameras: &mut [F],
    frames_per_pattern: usize,
) -> Result<Vec<Vec<GrayImage>>>
where
    D: PatternDisplay + ?Sized,
    F: FrameSource,
{
    let frames_per_pattern = frames_per_pattern.max(1);
    let patterns = codec.generate();
    let mut captures = vec![Vec::with_capacity(patterns.len()); cameras.len()];
    for (i, pattern) in patterns.iter().enumerate() {
        display.display(projector, pattern)?;
        for (camera, sequence) in cameras.iter_mut().zip(captures.iter_mut()) {
            let frames = (0..frames_per_pattern)
                .map(|_| camera.acquire_latest_frame())
                .collect::<Result<Vec<_>>>()?;
            sequence.push(average_frames(&frames)?);
        }
        log::debug!("projector {}: captured pattern {}/{}", projector, i + 1, patterns.len());
    }
    Ok(captures)
}
