//! Latest-frame slot shared between the submitting handler and readers.

use image::RgbImage;
use parking_lot::Mutex;
use std::time::Instant;

/// Single most-recent frame, overwritten by every submission.
///
/// Readers take a clone and never wait for a fresher frame.
#[derive(Default)]
pub struct FrameSlot {
    inner: Mutex<Option<(RgbImage, Instant)>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store_at(&self, frame: RgbImage, at: Instant) {
        *self.inner.lock() = Some((frame, at));
    }

    /// Clone of the newest frame, if any was stored.
    pub fn latest(&self) -> Option<RgbImage> {
        self.inner.lock().as_ref().map(|(f, _)| f.clone())
    }

    /// When the newest frame was stored.
    pub fn updated_at(&self) -> Option<Instant> {
        self.inner.lock().as_ref().map(|(_, at)| *at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_empty_slot() {
        let slot = FrameSlot::new();
        assert!(slot.latest().is_none());
        assert!(slot.updated_at().is_none());
    }

    #[test]
    fn test_newest_frame_wins() {
        let slot = FrameSlot::new();
        let t0 = Instant::now();
        slot.store_at(RgbImage::from_pixel(2, 2, Rgb([1, 1, 1])), t0);
        let t1 = t0 + std::time::Duration::from_millis(40);
        slot.store_at(RgbImage::from_pixel(3, 3, Rgb([9, 9, 9])), t1);
        let latest = slot.latest().unwrap();
        assert_eq!(latest.dimensions(), (3, 3));
        assert_eq!(latest.get_pixel(0, 0), &Rgb([9, 9, 9]));
        assert_eq!(slot.updated_at(), Some(t1));
    }
}
