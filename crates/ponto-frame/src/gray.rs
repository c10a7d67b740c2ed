//! Grayscale normalization: histogram equalization and canonical face patches.

use crate::frame::{FrameError, Rect};
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};

/// Side length of the square face patch the classifier works on.
pub const CANONICAL_FACE_SIZE: u32 = 200;

/// Convert an RGB frame to 8-bit luma.
pub fn to_gray(frame: &RgbImage) -> GrayImage {
    imageops::grayscale(frame)
}

/// Global histogram equalization, in place.
///
/// Builds the 256-bin histogram, skips the leading empty bins and maps each
/// intensity through the normalized CDF so the output spans 0 to 255. A
/// single-valued image is left unchanged.
pub fn equalize_hist(gray: &mut GrayImage) {
    let total = gray.as_raw().len();
    if total == 0 {
        return;
    }

    let mut hist = [0usize; 256];
    for &p in gray.as_raw() {
        hist[p as usize] += 1;
    }

    let first = hist.iter().position(|&c| c > 0).unwrap_or(0);
    if hist[first] == total {
        return;
    }

    let scale = 255.0 / (total - hist[first]) as f32;
    let mut lut = [0u8; 256];
    let mut sum = 0usize;
    for i in (first + 1)..256 {
        sum += hist[i];
        lut[i] = (sum as f32 * scale).round().clamp(0.0, 255.0) as u8;
    }

    for p in gray.iter_mut() {
        *p = lut[*p as usize];
    }
}

/// Resize to a `size` × `size` square with bilinear filtering.
/// Images already at the target size are returned untouched.
pub fn resize_square(gray: &GrayImage, size: u32) -> GrayImage {
    if gray.dimensions() == (size, size) {
        return gray.clone();
    }
    imageops::resize(gray, size, size, FilterType::Triangle)
}

/// Resize then equalize: the normalization applied to every training image
/// and every query face.
pub fn normalize(gray: &GrayImage) -> GrayImage {
    let mut patch = resize_square(gray, CANONICAL_FACE_SIZE);
    equalize_hist(&mut patch);
    patch
}

/// Crop `region` out of a grayscale frame and normalize it.
pub fn face_patch(gray: &GrayImage, region: Rect) -> Result<GrayImage, FrameError> {
    let r = clamp(region, gray.width(), gray.height())?;
    let crop = imageops::crop_imm(gray, r.x, r.y, r.width, r.height).to_image();
    Ok(normalize(&crop))
}

/// Crop `region` out of a colour frame and resize it to a `size` × `size` square.
pub fn color_patch(frame: &RgbImage, region: Rect, size: u32) -> Result<RgbImage, FrameError> {
    let r = clamp(region, frame.width(), frame.height())?;
    let crop = imageops::crop_imm(frame, r.x, r.y, r.width, r.height).to_image();
    if crop.dimensions() == (size, size) {
        return Ok(crop);
    }
    Ok(imageops::resize(&crop, size, size, FilterType::Triangle))
}

fn clamp(region: Rect, width: u32, height: u32) -> Result<Rect, FrameError> {
    region
        .clamp_to(width, height)
        .ok_or(FrameError::EmptyRegion {
            region,
            width,
            height,
        })
}
