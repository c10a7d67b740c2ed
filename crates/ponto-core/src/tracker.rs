//! Candidate stability tracker.
//!
//! One candidate slot per pipeline. A recognized identity must be sighted
//! continuously (gaps no longer than `max_gap`) for `stable` before the
//! tracker hands back a [`Confirmation`]; the caller turns that into a
//! pending detection and starts the identity's cooldown.

use crate::cooldown::CooldownLedger;
use crate::types::Rect;
use image::RgbImage;
use std::time::{Duration, Instant};

/// A recognized face in one frame.
#[derive(Debug, Clone)]
pub struct Sighting {
    pub identity: String,
    pub distance: f64,
    pub bbox: Rect,
    /// Colour crop handed on to the pending detection if this turns out to
    /// be the best sighting of the session.
    pub face: RgbImage,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    identity: String,
    started: Instant,
    last_seen: Instant,
    best: Sighting,
}

impl Candidate {
    fn start(sighting: Sighting, now: Instant) -> Self {
        Self {
            identity: sighting.identity.clone(),
            started: now,
            last_seen: now,
            best: sighting,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Lowest distance seen so far.
    pub fn best_distance(&self) -> f64 {
        self.best.distance
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    /// Fraction of the stability window already covered, in `0.0..=1.0`.
    pub fn progress(&self, now: Instant, stable: Duration) -> f64 {
        if stable.is_zero() {
            return 1.0;
        }
        (self.elapsed(now).as_secs_f64() / stable.as_secs_f64()).min(1.0)
    }
}

#[derive(Debug, Clone, Default)]
pub enum TrackerState {
    #[default]
    Idle,
    Tracking(Candidate),
}

/// Output of a candidate that reached stability.
#[derive(Debug, Clone)]
pub struct Confirmation {
    pub identity: String,
    pub confidence: f64,
    pub bbox: Rect,
    pub face: RgbImage,
}

#[derive(Debug, Default)]
pub struct StabilityTracker {
    state: TrackerState,
}

impl StabilityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &TrackerState {
        &self.state
    }

    pub fn candidate(&self) -> Option<&Candidate> {
        match &self.state {
            TrackerState::Tracking(c) => Some(c),
            TrackerState::Idle => None,
        }
    }

    /// Drop the candidate if it has not been seen for longer than `max_gap`.
    pub fn expire(&mut self, now: Instant, max_gap: Duration) {
        if let TrackerState::Tracking(c) = &self.state {
            let gap = now.saturating_duration_since(c.last_seen);
            if gap > max_gap {
                tracing::debug!(
                    identity = %c.identity,
                    gap_secs = gap.as_secs_f64(),
                    "candidate lost"
                );
                self.state = TrackerState::Idle;
            }
        }
    }

    /// Feed one recognized sighting.
    ///
    /// Returns a confirmation when the candidate has been stable for
    /// `stable`, its session did not begin inside the identity's cooldown,
    /// and no earlier confirmation is still waiting to be read
    /// (`marker_pending`). The tracker returns to idle on confirmation.
    pub fn observe(
        &mut self,
        sighting: Sighting,
        now: Instant,
        stable: Duration,
        max_gap: Duration,
        cooldowns: &CooldownLedger,
        marker_pending: bool,
    ) -> Option<Confirmation> {
        self.expire(now, max_gap);

        match &mut self.state {
            TrackerState::Tracking(c) if c.identity == sighting.identity => {
                c.last_seen = now;
                if sighting.distance < c.best.distance {
                    c.best = sighting;
                }
            }
            state => {
                if let TrackerState::Tracking(prev) = &*state {
                    tracing::debug!(
                        from = %prev.identity,
                        to = %sighting.identity,
                        "candidate switched"
                    );
                } else {
                    tracing::debug!(identity = %sighting.identity, "tracking started");
                }
                *state = TrackerState::Tracking(Candidate::start(sighting, now));
            }
        }

        let TrackerState::Tracking(c) = &mut self.state else {
            return None;
        };

        // A session opened during cooldown restarts its clock once the
        // cooldown has run out.
        if cooldowns.is_blocked(&c.identity, c.started) && !cooldowns.is_blocked(&c.identity, now) {
            tracing::debug!(identity = %c.identity, "cooldown over; restarting stability clock");
            c.started = now;
        }

        if c.elapsed(now) < stable
            || cooldowns.is_blocked(&c.identity, c.started)
            || marker_pending
        {
            return None;
        }

        let TrackerState::Tracking(c) = std::mem::take(&mut self.state) else {
            return None;
        };
        tracing::debug!(
            identity = %c.identity,
            elapsed_secs = c.elapsed(now).as_secs_f64(),
            distance = c.best.distance,
            "candidate stable"
        );
        Some(Confirmation {
            identity: c.identity,
            confidence: c.best.distance,
            bbox: c.best.bbox,
            face: c.best.face,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STABLE: Duration = Duration::from_secs(2);
    const MAX_GAP: Duration = Duration::from_millis(1500);
    const COOLDOWN: Duration = Duration::from_secs(5);

    fn sighting(identity: &str, distance: f64) -> Sighting {
        Sighting {
            identity: identity.to_string(),
            distance,
            bbox: Rect::new(10, 10, 80, 80),
            face: RgbImage::new(2, 2),
        }
    }

    fn at(t0: Instant, ms: u64) -> Instant {
        t0 + Duration::from_millis(ms)
    }

    /// Feed `identity` at each offset; return the offsets that confirmed.
    fn feed(
        tracker: &mut StabilityTracker,
        ledger: &mut CooldownLedger,
        t0: Instant,
        identity: &str,
        offsets_ms: &[u64],
    ) -> Vec<u64> {
        let mut fired = Vec::new();
        for &ms in offsets_ms {
            let now = at(t0, ms);
            if let Some(c) = tracker.observe(sighting(identity, 50.0), now, STABLE, MAX_GAP, ledger, false) {
                ledger.start_cooldown(&c.identity, now, COOLDOWN);
                fired.push(ms);
            }
        }
        fired
    }

    #[test]
    fn test_confirms_once_at_stability() {
        let t0 = Instant::now();
        let mut tracker = StabilityTracker::new();
        let mut ledger = CooldownLedger::new();

        let fired = feed(&mut tracker, &mut ledger, t0, "alice", &[0, 500, 1000, 1500, 2000]);
        assert_eq!(fired, vec![2000], "exactly one confirmation, at t=2.0");
        assert!(tracker.candidate().is_none(), "tracker returns to idle");
    }

    #[test]
    fn test_no_repeat_confirmation_per_frame() {
        let t0 = Instant::now();
        let mut tracker = StabilityTracker::new();
        let mut ledger = CooldownLedger::new();

        let offsets: Vec<u64> = (0..=8).map(|i| i * 500).collect();
        let fired = feed(&mut tracker, &mut ledger, t0, "alice", &offsets);
        assert_eq!(fired, vec![2000]);
        // Tracking resumes for the UI even though alice is cooling down.
        assert_eq!(tracker.candidate().map(Candidate::identity), Some("alice"));
    }

    #[test]
    fn test_best_sighting_kept() {
        let t0 = Instant::now();
        let mut tracker = StabilityTracker::new();
        let ledger = CooldownLedger::new();

        let mut best = sighting("alice", 40.0);
        best.bbox = Rect::new(1, 1, 90, 90);
        assert!(tracker.observe(sighting("alice", 70.0), t0, STABLE, MAX_GAP, &ledger, false).is_none());
        assert!(tracker.observe(best, at(t0, 500), STABLE, MAX_GAP, &ledger, false).is_none());
        let c = tracker
            .observe(sighting("alice", 60.0), at(t0, 2000), STABLE, MAX_GAP, &ledger, false)
            .unwrap();
        assert_eq!(c.confidence, 40.0);
        assert_eq!(c.bbox, Rect::new(1, 1, 90, 90));
    }

    #[test]
    fn test_interruption_resets_clock() {
        let t0 = Instant::now();
        let mut tracker = StabilityTracker::new();
        let mut ledger = CooldownLedger::new();

        // 1.5 s of progress, then a 2 s gap.
        let fired = feed(&mut tracker, &mut ledger, t0, "alice", &[0, 500, 1000, 1500, 3500, 4000, 5000]);
        assert!(fired.is_empty(), "stable time must not carry over the gap");

        let c = tracker.candidate().unwrap();
        assert_eq!(c.started(), at(t0, 3500));
        let fired = feed(&mut tracker, &mut ledger, t0, "alice", &[5500]);
        assert_eq!(fired, vec![5500]);
    }

    #[test]
    fn test_gap_at_limit_keeps_candidate() {
        let t0 = Instant::now();
        let mut tracker = StabilityTracker::new();
        let mut ledger = CooldownLedger::new();

        let fired = feed(&mut tracker, &mut ledger, t0, "alice", &[0, 1500]);
        assert!(fired.is_empty());
        assert_eq!(tracker.candidate().unwrap().started(), t0);
    }

    #[test]
    fn test_expire_drops_stale_candidate() {
        let t0 = Instant::now();
        let mut tracker = StabilityTracker::new();
        let ledger = CooldownLedger::new();
        tracker.observe(sighting("alice", 50.0), t0, STABLE, MAX_GAP, &ledger, false);

        tracker.expire(at(t0, 1600), MAX_GAP);
        assert!(matches!(tracker.state(), TrackerState::Idle));
    }

    #[test]
    fn test_identity_switch_starts_fresh() {
        let t0 = Instant::now();
        let mut tracker = StabilityTracker::new();
        let mut ledger = CooldownLedger::new();

        feed(&mut tracker, &mut ledger, t0, "alice", &[0, 500, 1000, 1500]);
        let fired = feed(&mut tracker, &mut ledger, t0, "bob", &[1800, 2000, 3000]);
        assert!(fired.is_empty(), "bob gets no credit for alice's time");
        assert_eq!(tracker.candidate().unwrap().started(), at(t0, 1800));

        let fired = feed(&mut tracker, &mut ledger, t0, "bob", &[3800]);
        assert_eq!(fired, vec![3800]);
    }

    #[test]
    fn test_cooldown_blocks_sessions_started_inside_it() {
        let t0 = Instant::now();
        let mut tracker = StabilityTracker::new();
        let mut ledger = CooldownLedger::new();

        // Confirmed at T = 2.0 s, cooldown until 7.0 s.
        let offsets: Vec<u64> = (0..=4).map(|i| i * 500).collect();
        assert_eq!(feed(&mut tracker, &mut ledger, t0, "alice", &offsets), vec![2000]);

        // Continuous sightings through the cooldown: nothing may fire
        // before the clock restarts at 7.0 s and runs a full window.
        let offsets: Vec<u64> = (5..=20).map(|i| i * 500).collect();
        let fired = feed(&mut tracker, &mut ledger, t0, "alice", &offsets);
        assert_eq!(fired, vec![9000]);
        assert!(fired.iter().all(|&ms| ms >= 7000 + STABLE.as_millis() as u64));
    }

    #[test]
    fn test_cooldown_is_per_identity() {
        let t0 = Instant::now();
        let mut tracker = StabilityTracker::new();
        let mut ledger = CooldownLedger::new();
        ledger.start_cooldown("alice", t0, COOLDOWN);

        let fired = feed(&mut tracker, &mut ledger, t0, "bob", &[0, 1000, 2000]);
        assert_eq!(fired, vec![2000]);
    }

    #[test]
    fn test_pending_marker_defers_confirmation() {
        let t0 = Instant::now();
        let mut tracker = StabilityTracker::new();
        let ledger = CooldownLedger::new();

        for ms in [0, 1000, 2000, 2500] {
            let r = tracker.observe(sighting("alice", 50.0), at(t0, ms), STABLE, MAX_GAP, &ledger, true);
            assert!(r.is_none(), "marker unread at {ms} ms");
        }
        let r = tracker.observe(sighting("alice", 50.0), at(t0, 3000), STABLE, MAX_GAP, &ledger, false);
        assert!(r.is_some(), "fires once the marker has been read");
    }

    #[test]
    fn test_progress() {
        let t0 = Instant::now();
        let mut tracker = StabilityTracker::new();
        let ledger = CooldownLedger::new();
        tracker.observe(sighting("alice", 50.0), t0, STABLE, MAX_GAP, &ledger, false);

        let c = tracker.candidate().unwrap();
        assert_eq!(c.progress(at(t0, 1000), STABLE), 0.5);
        assert_eq!(c.progress(at(t0, 9000), STABLE), 1.0);
    }
}
