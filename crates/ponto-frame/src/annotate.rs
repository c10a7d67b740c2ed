//! Verdict boxes drawn onto the caller's frame buffer.

use crate::frame::Rect;
use image::{Rgb, RgbImage};

/// Box colour for a face matched to an enrolled identity.
pub const RECOGNIZED: Rgb<u8> = Rgb([0, 180, 0]);
/// Box colour for an unknown face, or any face while no model is trained.
pub const UNKNOWN: Rgb<u8> = Rgb([255, 0, 0]);

const BOX_THICKNESS: u32 = 2;

/// Draw a hollow rectangle in place. Parts outside the frame are clipped.
pub fn draw_box(frame: &mut RgbImage, rect: Rect, color: Rgb<u8>) {
    let Some(r) = rect.clamp_to(frame.width(), frame.height()) else {
        return;
    };
    let t = BOX_THICKNESS.min(r.width).min(r.height);
    let (x2, y2) = (r.x + r.width, r.y + r.height);

    for y in r.y..y2 {
        for x in r.x..x2 {
            let on_edge = x < r.x + t || x >= x2 - t || y < r.y + t || y >= y2 - t;
            if on_edge {
                frame.put_pixel(x, y, color);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_draw_box_edges_only() {
        let mut frame = RgbImage::new(20, 20);
        draw_box(&mut frame, Rect::new(5, 5, 10, 10), RECOGNIZED);

        assert_eq!(frame.get_pixel(5, 5), &RECOGNIZED);
        assert_eq!(frame.get_pixel(14, 14), &RECOGNIZED);
        assert_eq!(frame.get_pixel(6, 10), &RECOGNIZED);
        // Interior and exterior untouched
        assert_eq!(frame.get_pixel(10, 10), &Rgb([0, 0, 0]));
        assert_eq!(frame.get_pixel(4, 4), &Rgb([0, 0, 0]));
        assert_eq!(frame.get_pixel(15, 15), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_draw_box_clipped() {
        let mut frame = RgbImage::new(10, 10);
        draw_box(&mut frame, Rect::new(6, 6, 20, 20), UNKNOWN);
        assert_eq!(frame.get_pixel(6, 6), &UNKNOWN);
        assert_eq!(frame.get_pixel(9, 9), &UNKNOWN);
    }

    #[test]
    fn test_draw_box_outside_is_noop() {
        let mut frame = RgbImage::new(10, 10);
        draw_box(&mut frame, Rect::new(50, 50, 5, 5), UNKNOWN);
        assert!(frame.pixels().all(|p| *p == Rgb([0, 0, 0])));
    }
}
