//! Camera sessions: one pipeline and one latest-frame slot per source.

use crate::pipeline::{FrameReport, PipelineStatus, RecognitionPipeline};
use crate::recognizer::Recognizer;
use chrono::{DateTime, Utc};
use image::RgbImage;
use parking_lot::{Mutex, RwLock};
use ponto_frame::{decode_frame, FrameError, FrameSlot};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// Sessions with no frame for this long are dropped by [`SessionRegistry::sweep_inactive`].
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Where a session's frames come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Frames uploaded by a browser tab.
    Browser,
    /// A locally attached camera.
    Device,
    /// An IP camera stream.
    Network,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

pub struct CameraSession {
    id: SessionId,
    source: SourceKind,
    created_at: DateTime<Utc>,
    pipeline: RecognitionPipeline,
    frame: FrameSlot,
    last_active: Mutex<Instant>,
}

impl CameraSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn source(&self) -> SourceKind {
        self.source
    }

    pub fn pipeline(&self) -> &RecognitionPipeline {
        &self.pipeline
    }

    /// Latest annotated frame.
    pub fn latest_frame(&self) -> Option<RgbImage> {
        self.frame.latest()
    }

    pub fn status(&self) -> PipelineStatus {
        self.pipeline.status()
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            source: self.source,
            created_at: self.created_at,
            has_frame: self.frame.updated_at().is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub source: SourceKind,
    pub created_at: DateTime<Utc>,
    pub has_frame: bool,
}

/// All live sessions, sharing one [`Recognizer`].
pub struct SessionRegistry {
    recognizer: Arc<Recognizer>,
    sessions: RwLock<HashMap<SessionId, Arc<CameraSession>>>,
    idle_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(recognizer: Arc<Recognizer>) -> Self {
        Self::with_idle_timeout(recognizer, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(recognizer: Arc<Recognizer>, idle_timeout: Duration) -> Self {
        Self {
            recognizer,
            sessions: RwLock::new(HashMap::new()),
            idle_timeout,
        }
    }

    pub fn recognizer(&self) -> &Arc<Recognizer> {
        &self.recognizer
    }

    pub fn create_session(&self, source: SourceKind) -> Arc<CameraSession> {
        self.create_session_at(source, Instant::now())
    }

    pub fn create_session_at(&self, source: SourceKind, now: Instant) -> Arc<CameraSession> {
        let session = Arc::new(CameraSession {
            id: SessionId(Uuid::new_v4()),
            source,
            created_at: Utc::now(),
            pipeline: RecognitionPipeline::new(Arc::clone(&self.recognizer)),
            frame: FrameSlot::new(),
            last_active: Mutex::new(now),
        });
        self.sessions.write().insert(session.id, Arc::clone(&session));
        tracing::info!(session = %session.id, source = ?source, "camera session created");
        session
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<CameraSession>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn remove(&self, id: &SessionId) -> bool {
        let removed = self.sessions.write().remove(id).is_some();
        if removed {
            tracing::info!(session = %id, "camera session closed");
        }
        removed
    }

    /// Run recognition on `frame` and keep the annotated result as the
    /// session's latest frame.
    pub fn submit_frame(&self, id: &SessionId, frame: RgbImage) -> Result<FrameReport, SessionError> {
        self.submit_frame_at(id, frame, Instant::now())
    }

    pub fn submit_frame_at(
        &self,
        id: &SessionId,
        mut frame: RgbImage,
        now: Instant,
    ) -> Result<FrameReport, SessionError> {
        let session = self.get(id).ok_or(SessionError::UnknownSession(*id))?;
        let report = session.pipeline.process_frame_at(&mut frame, now);
        session.frame.store_at(frame, now);
        *session.last_active.lock() = now;
        Ok(report)
    }

    /// Decode and submit an encoded frame. Undecodable bytes leave the
    /// session untouched.
    pub fn submit_encoded(&self, id: &SessionId, bytes: &[u8]) -> Result<FrameReport, SessionError> {
        if self.get(id).is_none() {
            return Err(SessionError::UnknownSession(*id));
        }
        let frame = decode_frame(bytes)?;
        self.submit_frame(id, frame)
    }

    /// Latest annotated frame, or `None` for unknown sessions and sessions
    /// that have not received a frame yet.
    pub fn latest_frame(&self, id: &SessionId) -> Option<RgbImage> {
        self.get(id)?.latest_frame()
    }

    /// Drop sessions idle for longer than the timeout; returns how many.
    pub fn sweep_inactive(&self, now: Instant) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|id, s| {
            let idle = now.saturating_duration_since(*s.last_active.lock());
            let keep = idle <= self.idle_timeout;
            if !keep {
                tracing::info!(session = %id, idle_secs = idle.as_secs(), "dropping idle camera session");
            }
            keep
        });
        before - sessions.len()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.sessions.read().values().map(|s| s.info()).collect();
        infos.sort_by_key(|i| i.created_at);
        infos
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::EngineSettings;
    use crate::testing::{frame_with_face, write_dataset, FixedDetector};
    use crate::types::{Rect, Verdict};
    use ponto_frame::annotate::UNKNOWN;
    use tempfile::TempDir;

    const FACE_AT: Rect = Rect { x: 10, y: 10, width: 200, height: 200 };

    fn registry(root: &std::path::Path) -> SessionRegistry {
        let recognizer = Recognizer::new(
            Arc::new(FixedDetector(vec![FACE_AT])),
            root,
            &EngineSettings::default(),
        );
        SessionRegistry::with_idle_timeout(Arc::new(recognizer), Duration::from_secs(300))
    }

    #[test]
    fn test_submit_stores_annotated_frame() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(tmp.path());
        let s = reg.create_session(SourceKind::Browser);
        assert!(reg.latest_frame(&s.id()).is_none());

        let report = reg.submit_frame(&s.id(), RgbImage::new(240, 240)).unwrap();
        assert_eq!(report.faces[0].verdict, Verdict::Untrained);

        let latest = reg.latest_frame(&s.id()).unwrap();
        assert_eq!(*latest.get_pixel(FACE_AT.x, FACE_AT.y), UNKNOWN);
    }

    #[test]
    fn test_unknown_session() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(tmp.path());
        let other = registry(tmp.path()).create_session(SourceKind::Device).id();

        assert!(matches!(
            reg.submit_frame(&other, RgbImage::new(8, 8)),
            Err(SessionError::UnknownSession(_))
        ));
        assert!(reg.latest_frame(&other).is_none());
    }

    #[test]
    fn test_undecodable_frame_keeps_previous() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(tmp.path());
        let s = reg.create_session(SourceKind::Network);
        reg.submit_frame(&s.id(), RgbImage::new(240, 240)).unwrap();

        assert!(matches!(reg.submit_encoded(&s.id(), b"\x00\x01"), Err(SessionError::Frame(_))));
        assert_eq!(reg.latest_frame(&s.id()).unwrap().dimensions(), (240, 240));
    }

    #[test]
    fn test_sessions_track_independently() {
        let tmp = TempDir::new().unwrap();
        write_dataset(tmp.path(), &[("A", &[1, 2])]);
        let face = image::open(tmp.path().join("A").join("A_0.jpg")).unwrap().to_luma8();
        let frame = frame_with_face(240, 240, &face, FACE_AT);

        let reg = registry(tmp.path());
        reg.recognizer().train().unwrap();
        let (a, b) = (reg.create_session(SourceKind::Browser), reg.create_session(SourceKind::Device));

        let t0 = Instant::now();
        reg.submit_frame_at(&a.id(), frame.clone(), t0).unwrap();
        assert!(a.pipeline().status_at(t0).tracking);
        assert!(!b.pipeline().status_at(t0).tracking);
    }

    #[test]
    fn test_sweep_inactive() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(tmp.path());
        let t0 = Instant::now();
        let idle = reg.create_session_at(SourceKind::Browser, t0);
        let busy = reg.create_session_at(SourceKind::Browser, t0);
        reg.submit_frame_at(&busy.id(), RgbImage::new(240, 240), t0 + Duration::from_secs(200))
            .unwrap();

        assert_eq!(reg.sweep_inactive(t0 + Duration::from_secs(301)), 1);
        assert!(reg.get(&idle.id()).is_none());
        assert!(reg.get(&busy.id()).is_some());
    }

    #[test]
    fn test_list_and_remove() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(tmp.path());
        let s = reg.create_session(SourceKind::Device);
        let infos = reg.list();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].source, SourceKind::Device);
        assert!(!infos[0].has_frame);

        assert!(reg.remove(&s.id()));
        assert!(!reg.remove(&s.id()));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_session_id_parse() {
        let tmp = TempDir::new().unwrap();
        let id = registry(tmp.path()).create_session(SourceKind::Browser).id();
        assert_eq!(id.to_string().parse::<SessionId>().unwrap(), id);
    }
}
