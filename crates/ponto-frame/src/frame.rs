//! Frame decoding and pixel-space rectangles.

use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Intersect with a `width` × `height` image. Returns `None` when nothing remains.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Rect> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.width.min(width - self.x);
        let h = self.height.min(height - self.y);
        if w == 0 || h == 0 {
            return None;
        }
        Some(Rect::new(self.x, self.y, w, h))
    }

    /// Grow by `margin` (fraction of width/height) on every side, clamped to the image.
    pub fn expand(&self, margin: f32, width: u32, height: u32) -> Option<Rect> {
        let mw = (self.width as f32 * margin) as u32;
        let mh = (self.height as f32 * margin) as u32;
        let x1 = self.x.saturating_sub(mw);
        let y1 = self.y.saturating_sub(mh);
        let x2 = (self.x + self.width + mw).min(width);
        let y2 = (self.y + self.height + mh).min(height);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some(Rect::new(x1, y1, x2 - x1, y2 - y1))
    }
}

/// Decode an encoded image (JPEG, PNG, ...) into an RGB frame.
pub fn decode_frame(bytes: &[u8]) -> Result<RgbImage, FrameError> {
    if bytes.is_empty() {
        return Err(FrameError::Decode("empty buffer".into()));
    }
    let img = image::load_from_memory(bytes).map_err(|e| FrameError::Decode(e.to_string()))?;
    Ok(img.to_rgb8())
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame could not be decoded: {0}")]
    Decode(String),
    #[error("region {region:?} lies outside the {width}x{height} frame")]
    EmptyRegion { region: Rect, width: u32, height: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;

    #[test]
    fn test_clamp_inside() {
        let r = Rect::new(10, 10, 20, 20);
        assert_eq!(r.clamp_to(100, 100), Some(r));
    }

    #[test]
    fn test_clamp_overhanging() {
        let r = Rect::new(90, 95, 20, 20);
        assert_eq!(r.clamp_to(100, 100), Some(Rect::new(90, 95, 10, 5)));
    }

    #[test]
    fn test_clamp_outside() {
        assert_eq!(Rect::new(100, 0, 5, 5).clamp_to(100, 100), None);
    }

    #[test]
    fn test_expand_margin_clamped() {
        let r = Rect::new(5, 5, 100, 100);
        // 15% of 100 = 15 px; left/top clamp at 0, right/bottom at 110.
        let e = r.expand(0.15, 110, 110).unwrap();
        assert_eq!(e, Rect::new(0, 0, 110, 110));
    }

    #[test]
    fn test_decode_png_roundtrip() {
        let img = RgbImage::from_pixel(4, 3, Rgb([10, 20, 30]));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
        let decoded = decode_frame(&buf).unwrap();
        assert_eq!(decoded.dimensions(), (4, 3));
        assert_eq!(decoded.get_pixel(0, 0), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(decode_frame(b"not an image"), Err(FrameError::Decode(_))));
        assert!(matches!(decode_frame(&[]), Err(FrameError::Decode(_))));
    }
}
