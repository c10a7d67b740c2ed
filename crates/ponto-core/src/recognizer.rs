//! Process-wide recognition service shared by every camera session.
//!
//! Owns the detector, the installed model, runtime tuning, the cooldown
//! ledger and the pending-detection store. Per-session state (the candidate
//! tracker and last-detection marker) lives in
//! [`RecognitionPipeline`](crate::pipeline::RecognitionPipeline).
//!
//! Lock order, outermost first: pipeline tracker, pipeline marker,
//! `cooldowns`, `pending`. The model lock is only held long enough to clone
//! the `Arc`; training runs under `train_guard` and swaps the model in at the
//! end.

use crate::capture::{capture_face, largest, CaptureError, CapturePolicy, CapturedFace};
use crate::cooldown::CooldownLedger;
use crate::dataset::{self, DatasetStore, TrainError, TrainSummary, TrainedModel};
use crate::detector::FaceDetector;
use crate::lbph::LbphParams;
use crate::pending::{DetectionId, PendingDetection, PendingStore};
use crate::settings::{self, EngineSettings, SettingsError, Tuning};
use crate::tracker::Confirmation;
use crate::types::{DebugPrediction, DetectionNotice, Rect};
use image::{GrayImage, RgbImage};
use parking_lot::{Mutex, MutexGuard, RwLock};
use ponto_frame::gray;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

pub struct Recognizer {
    detector: Arc<dyn FaceDetector>,
    dataset: DatasetStore,
    lbph: LbphParams,
    model: RwLock<Option<Arc<TrainedModel>>>,
    train_guard: Mutex<()>,
    tuning: Mutex<Tuning>,
    cooldowns: Mutex<CooldownLedger>,
    pending: Mutex<PendingStore>,
    min_face_size: u32,
    capture_min_face_size: u32,
}

impl Recognizer {
    /// Build an untrained service. Call [`train`](Self::train) (or
    /// [`spawn_retrain`](Self::spawn_retrain)) to install a model.
    pub fn new(
        detector: Arc<dyn FaceDetector>,
        dataset_root: impl AsRef<Path>,
        settings: &EngineSettings,
    ) -> Self {
        let settings = settings.clone().sanitized();
        Self {
            detector,
            dataset: DatasetStore::new(dataset_root.as_ref()),
            lbph: LbphParams::default(),
            model: RwLock::new(None),
            train_guard: Mutex::new(()),
            tuning: Mutex::new(settings.tuning()),
            cooldowns: Mutex::new(CooldownLedger::new()),
            pending: Mutex::new(PendingStore::new(settings.pending_ttl())),
            min_face_size: settings.min_face_size,
            capture_min_face_size: settings.capture_min_face_size,
        }
    }

    pub fn detector(&self) -> &dyn FaceDetector {
        self.detector.as_ref()
    }

    pub fn dataset(&self) -> &DatasetStore {
        &self.dataset
    }

    pub fn min_face_size(&self) -> u32 {
        self.min_face_size
    }

    // --- Model ---

    /// Retrain from the dataset tree and install the result.
    ///
    /// Frames keep being served by the previous model until the swap. An
    /// empty dataset uninstalls the model; I/O failures keep the old one.
    pub fn train(&self) -> Result<TrainSummary, TrainError> {
        let _training = self.train_guard.lock();
        match dataset::train(self.dataset.root(), self.lbph) {
            Ok(model) => {
                let summary = model.summary();
                *self.model.write() = Some(Arc::new(model));
                Ok(summary)
            }
            Err(e @ TrainError::EmptyDataset { .. }) => {
                tracing::warn!(error = %e, "training found no images; running untrained");
                *self.model.write() = None;
                Err(e)
            }
            Err(e) => {
                tracing::error!(error = %e, "training failed; keeping previous model");
                Err(e)
            }
        }
    }

    /// Run [`train`](Self::train) on a background thread.
    pub fn spawn_retrain(
        self: &Arc<Self>,
    ) -> std::io::Result<JoinHandle<Result<TrainSummary, TrainError>>> {
        let service = Arc::clone(self);
        std::thread::Builder::new()
            .name("ponto-trainer".into())
            .spawn(move || {
                tracing::info!("retrain started");
                service.train()
            })
    }

    pub fn is_trained(&self) -> bool {
        self.model.read().is_some()
    }

    /// Snapshot of the installed model; the lock is released on return.
    pub fn model(&self) -> Option<Arc<TrainedModel>> {
        self.model.read().clone()
    }

    // --- Tuning ---

    pub fn tuning(&self) -> Tuning {
        *self.tuning.lock()
    }

    pub fn threshold(&self) -> f64 {
        self.tuning.lock().threshold
    }

    /// Clamp and apply a new threshold; returns the effective value.
    pub fn set_threshold(&self, value: f64) -> Result<f64, SettingsError> {
        let effective = match settings::clamp_threshold(value) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "threshold rejected");
                return Err(e);
            }
        };
        self.tuning.lock().threshold = effective;
        tracing::info!(requested = value, effective, "threshold updated");
        Ok(effective)
    }

    /// Clamp and apply stability and cooldown durations. Both values are
    /// validated before either is applied.
    pub fn set_timing(
        &self,
        stable_seconds: Option<f64>,
        cooldown_seconds: Option<f64>,
    ) -> Result<Tuning, SettingsError> {
        let stable = stable_seconds.map(settings::clamp_stable).transpose();
        let cooldown = cooldown_seconds.map(settings::clamp_cooldown).transpose();
        let (stable, cooldown) = match (stable, cooldown) {
            (Ok(s), Ok(c)) => (s, c),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(error = %e, "timing rejected");
                return Err(e);
            }
        };

        let mut tuning = self.tuning.lock();
        if let Some(s) = stable {
            tuning.stable_seconds = s;
        }
        if let Some(c) = cooldown {
            tuning.cooldown_seconds = c;
        }
        tracing::info!(
            stable_secs = tuning.stable_seconds,
            cooldown_secs = tuning.cooldown_seconds,
            "timing updated"
        );
        Ok(*tuning)
    }

    // --- Detection ---

    pub fn detect(&self, gray: &GrayImage) -> Vec<Rect> {
        self.detector.detect(gray, self.min_face_size)
    }

    /// Crop the face for enrollment, using the stricter capture minimum size.
    pub fn capture(&self, frame: &RgbImage, policy: CapturePolicy) -> Result<CapturedFace, CaptureError> {
        capture_face(frame, self.detector.as_ref(), self.capture_min_face_size, policy)
    }

    /// Raw classifier output for the largest face. Touches no tracker,
    /// cooldown or pending state.
    pub fn debug_predict(&self, frame: &RgbImage) -> DebugPrediction {
        let luma = gray::to_gray(frame);
        let Some(bbox) = largest(&self.detect(&luma)) else {
            return DebugPrediction::NoFace;
        };
        let Some(model) = self.model() else {
            return DebugPrediction::Untrained { bbox };
        };
        let prediction = gray::face_patch(&luma, bbox)
            .ok()
            .and_then(|patch| model.classify(&patch));
        let Some(p) = prediction else {
            return DebugPrediction::Untrained { bbox };
        };

        let threshold = self.threshold();
        let identity = model.identity(p.label).map(str::to_string);
        DebugPrediction::Predicted {
            bbox,
            label: p.label,
            recognized: model.recognize(p, threshold).is_some(),
            identity,
            confidence: p.distance,
            threshold,
        }
    }

    // --- Cooldown and pending detections ---

    pub(crate) fn cooldowns(&self) -> MutexGuard<'_, CooldownLedger> {
        self.cooldowns.lock()
    }

    /// Store a confirmed candidate as a pending detection.
    pub(crate) fn emit_pending(&self, confirmation: Confirmation, now: Instant) -> DetectionNotice {
        let mut pending = self.pending.lock();
        let entry = pending.create(
            &confirmation.identity,
            confirmation.face,
            confirmation.confidence,
            confirmation.bbox,
            now,
        );
        tracing::info!(
            detection_id = %entry.id,
            identity = %entry.identity,
            confidence = entry.confidence,
            "pending detection created"
        );
        entry.notice()
    }

    /// Take a pending detection for confirmation. Unknown, consumed and
    /// expired ids all return `None`.
    pub fn consume_pending(&self, id: &DetectionId) -> Option<PendingDetection> {
        self.consume_pending_at(id, Instant::now())
    }

    pub fn consume_pending_at(&self, id: &DetectionId, now: Instant) -> Option<PendingDetection> {
        let entry = self.pending.lock().consume(id, now);
        match &entry {
            Some(e) => tracing::info!(detection_id = %id, identity = %e.identity, "pending detection consumed"),
            None => tracing::debug!(detection_id = %id, "pending detection not found"),
        }
        entry
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
