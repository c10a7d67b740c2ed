//! Pending detections awaiting external confirmation.
//!
//! A pending detection is created when a candidate reaches stability and is
//! consumed exactly once by the collaborator that records the attendance
//! event. Entries nobody confirms expire after the configured TTL.

use crate::types::{DetectionNotice, Rect};
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Caller-opaque token for one pending detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectionId(Uuid);

impl DetectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for DetectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DetectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A tentative match, owned by the store until consumed.
#[derive(Debug, Clone)]
pub struct PendingDetection {
    pub id: DetectionId,
    pub identity: String,
    /// Colour face crop (canonical size) captured at the best sighting.
    pub face: RgbImage,
    /// Best (lowest) dissimilarity of the session.
    pub confidence: f64,
    pub bbox: Rect,
    pub timestamp: DateTime<Utc>,
    created: Instant,
}

impl PendingDetection {
    pub fn notice(&self) -> DetectionNotice {
        DetectionNotice {
            detection_id: self.id,
            identity: self.identity.clone(),
            confidence: self.confidence,
            timestamp: self.timestamp,
            bbox: self.bbox,
        }
    }
}

#[derive(Debug)]
pub struct PendingStore {
    entries: HashMap<DetectionId, PendingDetection>,
    ttl: Option<Duration>,
}

impl PendingStore {
    /// `ttl = None` keeps entries until consumed.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    pub fn create(
        &mut self,
        identity: &str,
        face: RgbImage,
        confidence: f64,
        bbox: Rect,
        now: Instant,
    ) -> &PendingDetection {
        self.sweep(now);
        let id = DetectionId::new();
        let entry = PendingDetection {
            id,
            identity: identity.to_string(),
            face,
            confidence,
            bbox,
            timestamp: Utc::now(),
            created: now,
        };
        self.entries.entry(id).or_insert(entry)
    }

    /// Remove and return the entry. Unknown, already-consumed and expired ids
    /// all yield `None`.
    pub fn consume(&mut self, id: &DetectionId, now: Instant) -> Option<PendingDetection> {
        self.sweep(now);
        self.entries.remove(id)
    }

    /// Drop expired entries; returns how many were dropped.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };
        let before = self.entries.len();
        self.entries.retain(|id, entry| {
            let alive = now.saturating_duration_since(entry.created) < ttl;
            if !alive {
                tracing::debug!(detection_id = %id, identity = %entry.identity, "pending detection expired");
            }
            alive
        });
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
