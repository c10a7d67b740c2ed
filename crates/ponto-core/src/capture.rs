//! Enrollment capture: find the face in a frame and crop it for the dataset.

use crate::detector::FaceDetector;
use crate::types::Rect;
use image::RgbImage;
use ponto_frame::{gray, FrameError, CANONICAL_FACE_SIZE};
use thiserror::Error;

/// Margin added around the detected box, as a fraction of its size.
const CAPTURE_MARGIN: f32 = 0.15;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("{0} faces detected, expected one")]
    MultipleFaces(usize),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Which face to take when the detector reports several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapturePolicy {
    #[default]
    Largest,
    RequireSingle,
}

#[derive(Debug, Clone)]
pub struct CapturedFace {
    /// Colour crop at the canonical face size.
    pub face: RgbImage,
    /// Detected box, without the margin.
    pub bbox: Rect,
}

/// Largest box by area; the first one wins ties.
pub fn largest(boxes: &[Rect]) -> Option<Rect> {
    boxes.iter().copied().fold(None, |best: Option<Rect>, r| match best {
        Some(b) if b.area() >= r.area() => Some(b),
        _ => Some(r),
    })
}

pub fn capture_face(
    frame: &RgbImage,
    detector: &dyn FaceDetector,
    min_size: u32,
    policy: CapturePolicy,
) -> Result<CapturedFace, CaptureError> {
    let boxes = detector.detect(&gray::to_gray(frame), min_size);
    let bbox = match (policy, boxes.len()) {
        (_, 0) => return Err(CaptureError::NoFaceDetected),
        (CapturePolicy::RequireSingle, n) if n > 1 => return Err(CaptureError::MultipleFaces(n)),
        _ => largest(&boxes).ok_or(CaptureError::NoFaceDetected)?,
    };

    let region = bbox
        .expand(CAPTURE_MARGIN, frame.width(), frame.height())
        .unwrap_or(bbox);
    let face = gray::color_patch(frame, region, CANONICAL_FACE_SIZE)?;
    tracing::debug!(?bbox, ?region, "face captured");
    Ok(CapturedFace { face, bbox })
}
