//! Per-session frame processing.
//!
//! Each camera session owns one [`RecognitionPipeline`]: its own candidate
//! tracker and last-detection marker, on top of the shared [`Recognizer`].
//! Frames from unrelated sources must not share a pipeline; the tracker
//! follows a single identity at a time.

use crate::recognizer::Recognizer;
use crate::settings::Tuning;
use crate::tracker::{Sighting, StabilityTracker};
use crate::types::{DetectionNotice, FaceReport, Verdict};
use image::RgbImage;
use parking_lot::Mutex;
use ponto_frame::annotate::{self, RECOGNIZED, UNKNOWN};
use ponto_frame::{decode_frame, gray, FrameError, CANONICAL_FACE_SIZE};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// What one frame produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameReport {
    /// Every detected face, in detector order.
    pub faces: Vec<FaceReport>,
    /// Set when this frame confirmed a candidate.
    pub detection: Option<DetectionNotice>,
}

/// Snapshot for progress displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub tracking: bool,
    pub identity: Option<String>,
    /// Fraction of the stability window covered, `0.0..=1.0`.
    pub progress: f64,
    pub seconds_left: f64,
    pub stable_seconds: f64,
    /// Faces found in the most recent frame.
    pub faces_detected: usize,
    /// The tracked identity is inside its cooldown.
    pub cooldown_active: bool,
    /// Time until the tracked identity may confirm again.
    pub cooldown_seconds_left: f64,
}

pub struct RecognitionPipeline {
    recognizer: Arc<Recognizer>,
    tracker: Mutex<StabilityTracker>,
    last_detection: Mutex<Option<DetectionNotice>>,
    faces_detected: AtomicUsize,
}

impl RecognitionPipeline {
    pub fn new(recognizer: Arc<Recognizer>) -> Self {
        Self {
            recognizer,
            tracker: Mutex::new(StabilityTracker::new()),
            last_detection: Mutex::new(None),
            faces_detected: AtomicUsize::new(0),
        }
    }

    pub fn recognizer(&self) -> &Arc<Recognizer> {
        &self.recognizer
    }

    /// Detect, classify, track and annotate `frame` in place.
    pub fn process_frame(&self, frame: &mut RgbImage) -> FrameReport {
        self.process_frame_at(frame, Instant::now())
    }

    pub fn process_frame_at(&self, frame: &mut RgbImage, now: Instant) -> FrameReport {
        let tuning = self.recognizer.tuning();
        let model = self.recognizer.model();

        let luma = gray::to_gray(frame);
        let boxes = self.recognizer.detect(&luma);
        self.faces_detected.store(boxes.len(), Ordering::Relaxed);

        let mut report = FrameReport::default();
        let mut tracker = self.tracker.lock();
        tracker.expire(now, tuning.max_gap());

        for bbox in boxes {
            let verdict = match &model {
                None => Verdict::Untrained,
                Some(model) => {
                    let prediction = match gray::face_patch(&luma, bbox) {
                        Ok(patch) => model.classify(&patch),
                        Err(e) => {
                            tracing::debug!(error = %e, "face box outside frame");
                            None
                        }
                    };
                    match prediction {
                        Some(p) => match model.recognize(p, tuning.threshold) {
                            Some(identity) => Verdict::Recognized {
                                identity: identity.to_string(),
                                distance: p.distance,
                            },
                            None => Verdict::Unknown {
                                label: Some(p.label),
                                distance: Some(p.distance),
                            },
                        },
                        None => Verdict::Unknown {
                            label: None,
                            distance: None,
                        },
                    }
                }
            };

            if let Verdict::Recognized { identity, distance } = &verdict {
                tracing::trace!(identity = %identity, distance, "face recognized");
                // Crop before any box is drawn onto the frame.
                match gray::color_patch(frame, bbox, CANONICAL_FACE_SIZE) {
                    Ok(face) => {
                        let sighting = Sighting {
                            identity: identity.clone(),
                            distance: *distance,
                            bbox,
                            face,
                        };
                        if let Some(notice) = self.track(&mut tracker, sighting, now, &tuning) {
                            report.detection = Some(notice);
                        }
                    }
                    Err(e) => tracing::debug!(error = %e, "face box outside frame"),
                }
            }

            report.faces.push(FaceReport { bbox, verdict });
        }
        drop(tracker);

        for face in &report.faces {
            let color = if face.verdict.identity().is_some() {
                RECOGNIZED
            } else {
                UNKNOWN
            };
            annotate::draw_box(frame, face.bbox, color);
        }

        tracing::trace!(faces = report.faces.len(), "frame processed");
        report
    }

    /// Feed a sighting to the tracker. On confirmation the cooldown is
    /// started under the same ledger lock that was checked, then the pending
    /// detection and marker are written.
    fn track(
        &self,
        tracker: &mut StabilityTracker,
        sighting: Sighting,
        now: Instant,
        tuning: &Tuning,
    ) -> Option<DetectionNotice> {
        let mut marker = self.last_detection.lock();
        let mut cooldowns = self.recognizer.cooldowns();
        let confirmation = tracker.observe(
            sighting,
            now,
            tuning.stable(),
            tuning.max_gap(),
            &cooldowns,
            marker.is_some(),
        )?;
        cooldowns.start_cooldown(&confirmation.identity, now, tuning.cooldown());
        drop(cooldowns);

        let notice = self.recognizer.emit_pending(confirmation, now);
        *marker = Some(notice.clone());
        Some(notice)
    }

    /// Decode and process an encoded frame. Undecodable input is rejected
    /// without touching the tracker.
    pub fn process_encoded(&self, bytes: &[u8]) -> Result<(RgbImage, FrameReport), FrameError> {
        let mut frame = decode_frame(bytes)?;
        let report = self.process_frame(&mut frame);
        Ok((frame, report))
    }

    /// Read and clear the most recent confirmation notice.
    pub fn pop_last_detection(&self) -> Option<DetectionNotice> {
        self.last_detection.lock().take()
    }

    pub fn status(&self) -> PipelineStatus {
        self.status_at(Instant::now())
    }

    pub fn status_at(&self, now: Instant) -> PipelineStatus {
        let tuning = self.recognizer.tuning();
        let stable = tuning.stable();
        let tracker = self.tracker.lock();
        let faces_detected = self.faces_detected.load(Ordering::Relaxed);

        let Some(c) = tracker
            .candidate()
            .filter(|c| now.saturating_duration_since(c.last_seen()) <= tuning.max_gap())
        else {
            return PipelineStatus {
                tracking: false,
                identity: None,
                progress: 0.0,
                seconds_left: tuning.stable_seconds,
                stable_seconds: tuning.stable_seconds,
                faces_detected,
                cooldown_active: false,
                cooldown_seconds_left: 0.0,
            };
        };

        let elapsed = c.elapsed(now).as_secs_f64();
        let cooldown_left = self.recognizer.cooldowns().remaining(c.identity(), now);
        PipelineStatus {
            tracking: true,
            identity: Some(c.identity().to_string()),
            progress: c.progress(now, stable),
            seconds_left: (tuning.stable_seconds - elapsed).max(0.0),
            stable_seconds: tuning.stable_seconds,
            faces_detected,
            cooldown_active: cooldown_left.is_some(),
            cooldown_seconds_left: cooldown_left.map_or(0.0, |d| d.as_secs_f64()),
        }
    }
}
