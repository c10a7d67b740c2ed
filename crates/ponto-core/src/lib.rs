//! ponto-core: Stability-gated face recognition for attendance events.
//!
//! A Haar-cascade detector finds faces, an LBPH classifier matches them
//! against the enrolled dataset, and a per-session stability tracker turns
//! a steady match into a pending detection that an external collaborator
//! confirms (or abandons) before anything is recorded.

pub mod capture;
pub mod cooldown;
pub mod dataset;
pub mod detector;
pub mod lbph;
pub mod pending;
pub mod pipeline;
pub mod recognizer;
pub mod session;
pub mod settings;
pub mod tracker;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use capture::{capture_face, CaptureError, CapturePolicy, CapturedFace};
pub use dataset::{DatasetError, DatasetStore, IdentitySummary, TrainError, TrainSummary, TrainedModel};
pub use detector::{CascadeDetector, DetectorParams, FaceDetector, HaarCascade};
pub use pending::{DetectionId, PendingDetection};
pub use pipeline::{FrameReport, PipelineStatus, RecognitionPipeline};
pub use recognizer::Recognizer;
pub use session::{CameraSession, SessionError, SessionId, SessionInfo, SessionRegistry, SourceKind};
pub use settings::{EngineSettings, SettingsError, Tuning};
pub use types::{DebugPrediction, DetectionNotice, FaceReport, IdentityMap, Prediction, Rect, Verdict};
