//! Engine settings and runtime tuning bounds.
//!
//! Out-of-range values are clamped, never rejected, so a bad request cannot
//! leave the engine unusable. Values that are not numbers at all (NaN,
//! infinities, unparseable text) are rejected and the previous value stays.

use crate::detector::DetectorParams;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_THRESHOLD: f64 = 85.0;
pub const THRESHOLD_RANGE: (f64, f64) = (30.0, 150.0);

pub const DEFAULT_STABLE_SECONDS: f64 = 5.0;
pub const STABLE_RANGE: (f64, f64) = (0.5, 15.0);

pub const DEFAULT_COOLDOWN_SECONDS: f64 = 5.0;
pub const COOLDOWN_RANGE: (f64, f64) = (0.0, 30.0);

/// Longest gap between sightings before a candidate session is dropped.
pub const DEFAULT_MAX_GAP_SECONDS: f64 = 1.5;
pub const MAX_GAP_RANGE: (f64, f64) = (0.1, 10.0);

pub const DEFAULT_PENDING_TTL_SECONDS: f64 = 120.0;
/// Zero disables expiry; the upper bound is one day.
pub const PENDING_TTL_RANGE: (f64, f64) = (0.0, 86_400.0);

pub const DEFAULT_MIN_FACE_SIZE: u32 = 60;
pub const DEFAULT_CAPTURE_MIN_FACE_SIZE: u32 = 80;

#[derive(Error, Debug, PartialEq)]
pub enum SettingsError {
    #[error("{name} must be a finite number, got {value}")]
    NotFinite { name: &'static str, value: f64 },
    #[error("{name}: {raw:?} is not a number")]
    Parse { name: &'static str, raw: String },
}

/// Static engine configuration, typically read from the `[engine]` table of
/// the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Maximum accepted LBPH distance (lower = stricter).
    pub threshold: f64,
    /// Continuous-sighting time before a match becomes a pending detection.
    pub stable_seconds: f64,
    /// Per-identity suppression after a pending detection is emitted.
    pub cooldown_seconds: f64,
    pub max_gap_seconds: f64,
    /// Unconsumed pending detections are discarded after this long.
    pub pending_ttl_seconds: f64,
    pub min_face_size: u32,
    pub capture_min_face_size: u32,
    pub scale_factor: f32,
    pub min_neighbors: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let detector = DetectorParams::default();
        Self {
            threshold: DEFAULT_THRESHOLD,
            stable_seconds: DEFAULT_STABLE_SECONDS,
            cooldown_seconds: DEFAULT_COOLDOWN_SECONDS,
            max_gap_seconds: DEFAULT_MAX_GAP_SECONDS,
            pending_ttl_seconds: DEFAULT_PENDING_TTL_SECONDS,
            min_face_size: DEFAULT_MIN_FACE_SIZE,
            capture_min_face_size: DEFAULT_CAPTURE_MIN_FACE_SIZE,
            scale_factor: detector.scale_factor,
            min_neighbors: detector.min_neighbors,
        }
    }
}

impl EngineSettings {
    /// Clamp every tunable into its bounds; non-finite values fall back to defaults.
    pub fn sanitized(self) -> Self {
        let d = Self::default();
        let or_default = |v: f64, dflt: f64| if v.is_finite() { v } else { dflt };
        Self {
            threshold: clamp(or_default(self.threshold, d.threshold), THRESHOLD_RANGE),
            stable_seconds: clamp(or_default(self.stable_seconds, d.stable_seconds), STABLE_RANGE),
            cooldown_seconds: clamp(
                or_default(self.cooldown_seconds, d.cooldown_seconds),
                COOLDOWN_RANGE,
            ),
            max_gap_seconds: clamp(
                or_default(self.max_gap_seconds, d.max_gap_seconds),
                MAX_GAP_RANGE,
            ),
            pending_ttl_seconds: clamp(
                or_default(self.pending_ttl_seconds, d.pending_ttl_seconds),
                PENDING_TTL_RANGE,
            ),
            min_face_size: self.min_face_size.max(1),
            capture_min_face_size: self.capture_min_face_size.max(1),
            scale_factor: if self.scale_factor.is_finite() && self.scale_factor > 1.0 {
                self.scale_factor
            } else {
                d.scale_factor
            },
            min_neighbors: self.min_neighbors,
        }
    }

    pub fn detector_params(&self) -> DetectorParams {
        DetectorParams {
            scale_factor: self.scale_factor,
            min_neighbors: self.min_neighbors,
        }
    }

    pub fn tuning(&self) -> Tuning {
        Tuning {
            threshold: self.threshold,
            stable_seconds: self.stable_seconds,
            cooldown_seconds: self.cooldown_seconds,
            max_gap_seconds: self.max_gap_seconds,
        }
    }

    /// `None` when expiry is disabled (TTL of zero).
    pub fn pending_ttl(&self) -> Option<Duration> {
        (self.pending_ttl_seconds > 0.0).then(|| {
            seconds(
                self.pending_ttl_seconds,
                Duration::from_secs_f64(DEFAULT_PENDING_TTL_SECONDS),
            )
        })
    }
}

/// Runtime-adjustable policy, read once per frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Tuning {
    pub threshold: f64,
    pub stable_seconds: f64,
    pub cooldown_seconds: f64,
    pub max_gap_seconds: f64,
}

impl Tuning {
    pub fn stable(&self) -> Duration {
        seconds(self.stable_seconds, Duration::from_secs_f64(DEFAULT_STABLE_SECONDS))
    }

    pub fn cooldown(&self) -> Duration {
        seconds(self.cooldown_seconds, Duration::from_secs_f64(DEFAULT_COOLDOWN_SECONDS))
    }

    pub fn max_gap(&self) -> Duration {
        seconds(self.max_gap_seconds, Duration::from_secs_f64(DEFAULT_MAX_GAP_SECONDS))
    }
}

/// Values `Duration` cannot hold (negative, NaN, overflowing) use `fallback`.
fn seconds(value: f64, fallback: Duration) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(fallback)
}

fn clamp(v: f64, (lo, hi): (f64, f64)) -> f64 {
    v.clamp(lo, hi)
}

fn finite(name: &'static str, value: f64) -> Result<f64, SettingsError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(SettingsError::NotFinite { name, value })
    }
}

pub fn clamp_threshold(value: f64) -> Result<f64, SettingsError> {
    finite("threshold", value).map(|v| clamp(v, THRESHOLD_RANGE))
}

pub fn clamp_stable(value: f64) -> Result<f64, SettingsError> {
    finite("stable_seconds", value).map(|v| clamp(v, STABLE_RANGE))
}

pub fn clamp_cooldown(value: f64) -> Result<f64, SettingsError> {
    finite("cooldown_seconds", value).map(|v| clamp(v, COOLDOWN_RANGE))
}

/// Parse a numeric setting supplied as text (form field, env var, CLI flag).
pub fn parse_setting(name: &'static str, raw: &str) -> Result<f64, SettingsError> {
    let value: f64 = raw.trim().parse().map_err(|_| SettingsError::Parse {
        name,
        raw: raw.to_string(),
    })?;
    finite(name, value)
}
