//! Shared fixtures for unit tests: synthetic faces, datasets and a fixed-box detector.

use crate::detector::FaceDetector;
use crate::types::Rect;
use image::{GrayImage, Luma, Rgb, RgbImage};
use ponto_frame::CANONICAL_FACE_SIZE;
use std::path::Path;

/// Detector that reports the same boxes for every frame.
pub(crate) struct FixedDetector(pub Vec<Rect>);

impl FaceDetector for FixedDetector {
    fn detect(&self, _gray: &GrayImage, min_size: u32) -> Vec<Rect> {
        self.0
            .iter()
            .copied()
            .filter(|r| r.width >= min_size && r.height >= min_size)
            .collect()
    }
}

/// Deterministic high-frequency texture, distinct per seed.
pub(crate) fn noise_face(seed: u32) -> GrayImage {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(0x9e37_79b9) | 1;
    GrayImage::from_fn(CANONICAL_FACE_SIZE, CANONICAL_FACE_SIZE, |_, _| {
        // xorshift32
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        Luma([(state >> 24) as u8])
    })
}

/// Smooth horizontal ramp: LBP codes collapse onto a handful of patterns.
pub(crate) fn gradient_face() -> GrayImage {
    GrayImage::from_fn(CANONICAL_FACE_SIZE, CANONICAL_FACE_SIZE, |x, _| {
        Luma([(x * 255 / (CANONICAL_FACE_SIZE - 1)) as u8])
    })
}

/// Write `<root>/<identity>/<identity>_<i>.jpg` for every seed.
pub(crate) fn write_dataset(root: &Path, people: &[(&str, &[u32])]) {
    for (identity, seeds) in people {
        let dir = root.join(identity);
        std::fs::create_dir_all(&dir).unwrap();
        for (i, seed) in seeds.iter().enumerate() {
            noise_face(*seed)
                .save(dir.join(format!("{identity}_{i}.jpg")))
                .unwrap();
        }
    }
}

/// Grey frame with `face` pasted at `at` (replicated into all three channels).
pub(crate) fn frame_with_face(width: u32, height: u32, face: &GrayImage, at: Rect) -> RgbImage {
    let mut frame = RgbImage::from_pixel(width, height, Rgb([128, 128, 128]));
    for (x, y, p) in face.enumerate_pixels() {
        if x < at.width && y < at.height {
            let v = p.0[0];
            frame.put_pixel(at.x + x, at.y + y, Rgb([v, v, v]));
        }
    }
    frame
}
