use std::time::{Duration, Instant};

use pt_proto::{AngleBounds, StartupInfo, TrackMode};
use tracing::{debug, info, warn};

use crate::marker::MarkerGate;
use crate::{Detection, MarkerConfig, TargetingConfig};

/// One qualifying observation, frame pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetState {
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
    pub observed_at: Instant,
}

impl TargetState {
    pub fn from_detection(d: &Detection, observed_at: Instant) -> Self {
        let (x, y) = d.center();
        Self { x, y, confidence: d.confidence, observed_at }
    }

    fn distance_to(&self, (x, y): (f32, f32)) -> f32 {
        ((self.x - x).powi(2) + (self.y - y).powi(2)).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Relative move, degrees.
    MoveBy { pan: i32, tilt: i32 },
    /// Back to the park angles (`HOME`).
    Recenter,
    Mark(bool),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockState {
    pub mode: TrackMode,
    pub locked_position: Option<(f32, f32)>,
    pub locked_at: Option<Instant>,
    pub last_seen_at: Option<Instant>,
}

impl LockState {
    fn monitoring() -> Self {
        Self { mode: TrackMode::Monitoring, locked_position: None, locked_at: None, last_seen_at: None }
    }
}

/// Outcome of one detection cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub actions: Vec<Action>,
    pub mode: TrackMode,
    pub target: Option<TargetState>,
    pub note: String,
}

/// Detection-to-motion state machine. Single owner of the lock; never
/// touches the link itself.
#[derive(Debug)]
pub struct Targeting {
    cfg: TargetingConfig,
    lock: LockState,
    gate: MarkerGate,
    marker_on: bool,
    failures: u32,
    angles: Option<(i32, i32)>,
    bounds: Option<(AngleBounds, AngleBounds)>,
}

impl Targeting {
    pub fn new(cfg: TargetingConfig, marker: &MarkerConfig) -> Self {
        Self {
            cfg,
            lock: LockState::monitoring(),
            gate: MarkerGate::new(marker.enable, Duration::from_millis(marker.cooldown_ms)),
            marker_on: false,
            failures: 0,
            angles: None,
            bounds: None,
        }
    }

    pub fn mode(&self) -> TrackMode {
        self.lock.mode
    }

    pub fn lock(&self) -> &LockState {
        &self.lock
    }

    pub fn marker_on(&self) -> bool {
        self.marker_on
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    pub fn angles(&self) -> Option<(i32, i32)> {
        self.angles
    }

    pub fn set_bounds(&mut self, info: &StartupInfo) {
        self.bounds = Some((info.pan, info.tilt));
    }

    /// Angles the controller last reported.
    pub fn observe_angles(&mut self, pan: i32, tilt: i32) {
        self.angles = Some((pan, tilt));
    }

    /// Controller is unusable; no further commands are issued.
    pub fn enter_fault(&mut self, reason: &str) {
        warn!("targeting: FAULT ({})", reason);
        self.lock = LockState { mode: TrackMode::Fault, ..LockState::monitoring() };
        self.marker_on = false;
    }

    pub fn on_command_ok(&mut self) {
        self.failures = 0;
    }

    /// Counts a failed command. The lock survives until the failures pile
    /// up, then the machine falls back to MONITORING and returns what is
    /// needed to get there.
    pub fn on_command_failed(&mut self) -> Vec<Action> {
        self.failures += 1;
        if self.failures < self.cfg.max_consecutive_failures || self.lock.mode == TrackMode::Fault {
            return Vec::new();
        }
        warn!("targeting: {} consecutive command failures, back to monitoring", self.failures);
        self.failures = 0;
        self.release()
    }

    fn release(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.marker_on {
            self.marker_on = false;
            actions.push(Action::Mark(false));
        }
        actions.push(Action::Recenter);
        self.lock = LockState::monitoring();
        actions
    }

    pub fn step(&mut self, targets: &[TargetState], now: Instant) -> Step {
        if self.lock.mode == TrackMode::Fault {
            return self.finish(Vec::new(), None, "fault".into());
        }
        // stale lock: recenter now, re-acquire on a later cycle
        if self.lock.mode != TrackMode::Monitoring && self.lock_expired(now) {
            return self.lose(now);
        }

        let candidates: Vec<&TargetState> =
            targets.iter().filter(|t| t.confidence >= self.cfg.min_confidence).collect();

        if candidates.is_empty() {
            return self.quiet_cycle(now);
        }

        let (chosen, note) = self.select(&candidates);
        // ARMED is only reachable from a lock held since an earlier cycle
        let may_arm = note == "lock kept" && matches!(self.lock.mode, TrackMode::Tracking | TrackMode::Armed);
        if self.lock.locked_position.is_none() || note != "lock kept" {
            info!(x = chosen.x, y = chosen.y, conf = chosen.confidence, "targeting: {}", note);
            self.lock.locked_at = Some(now);
        }
        self.lock.locked_position = Some((chosen.x, chosen.y));
        self.lock.last_seen_at = Some(now);

        let mut actions = Vec::new();
        let (cx, cy) = self.cfg.frame_center();
        let (dx, dy) = (chosen.x - cx, chosen.y - cy);

        let pan = (dx * self.cfg.pan_gain).round() as i32;
        // image y grows downward
        let tilt = -(dy * self.cfg.tilt_gain).round() as i32;
        if pan.abs() > self.cfg.move_threshold_deg || tilt.abs() > self.cfg.move_threshold_deg {
            let (pan, tilt) = self.clamp_delta(pan, tilt);
            if pan != 0 || tilt != 0 {
                actions.push(Action::MoveBy { pan, tilt });
            }
        }

        let centered = dx.abs() <= self.cfg.deadband_px && dy.abs() <= self.cfg.deadband_px;
        if may_arm && centered && chosen.confidence > self.cfg.arm_confidence {
            if self.lock.mode != TrackMode::Armed {
                debug!("targeting: armed");
            }
            self.lock.mode = TrackMode::Armed;
            if !self.marker_on && self.gate.allow_on(now) {
                self.marker_on = true;
                actions.push(Action::Mark(true));
            }
        } else {
            self.lock.mode = TrackMode::Tracking;
            if self.marker_on {
                self.marker_on = false;
                actions.push(Action::Mark(false));
            }
        }

        let target = *chosen;
        self.finish(actions, Some(target), note.into())
    }

    /// No qualifying detection this cycle.
    fn quiet_cycle(&mut self, now: Instant) -> Step {
        if self.lock.mode == TrackMode::Monitoring {
            return self.finish(Vec::new(), None, String::new());
        }

        if self.lock_expired(now) {
            return self.lose(now);
        }

        // keep the lock; an unseen target is not centered
        let mut actions = Vec::new();
        if self.lock.mode == TrackMode::Armed {
            self.lock.mode = TrackMode::Tracking;
        }
        if self.marker_on {
            self.marker_on = false;
            actions.push(Action::Mark(false));
        }
        self.finish(actions, None, "holding lock".into())
    }

    fn lock_expired(&self, now: Instant) -> bool {
        let timeout = Duration::from_secs_f32(self.cfg.no_detection_timeout_s);
        self.lock.last_seen_at.map_or(true, |t| now.saturating_duration_since(t) >= timeout)
    }

    fn lose(&mut self, now: Instant) -> Step {
        let silent_for = self.lock.last_seen_at.map(|t| now.saturating_duration_since(t)).unwrap_or_default();
        info!("targeting: no detection for {:?}, recentering", silent_for);
        let actions = self.release();
        self.finish(actions, None, "target lost".into())
    }

    /// Continuity first: the nearest candidate within the lock distance of
    /// the held lock (confidence breaks distance ties). Otherwise the most
    /// confident candidate (nearest to frame center breaks ties).
    fn select<'a>(&self, candidates: &[&'a TargetState]) -> (&'a TargetState, &'static str) {
        if let Some(pos) = self.lock.locked_position {
            let near = candidates
                .iter()
                .copied()
                .filter(|t| t.distance_to(pos) < self.cfg.lock_distance_px)
                .min_by(|a, b| {
                    a.distance_to(pos)
                        .total_cmp(&b.distance_to(pos))
                        .then(b.confidence.total_cmp(&a.confidence))
                });
            if let Some(t) = near {
                return (t, "lock kept");
            }
        }

        let center = self.cfg.frame_center();
        let best = candidates
            .iter()
            .copied()
            .max_by(|a, b| {
                a.confidence
                    .total_cmp(&b.confidence)
                    .then(b.distance_to(center).total_cmp(&a.distance_to(center)))
            });
        // callers never pass an empty slice
        match best {
            Some(t) if self.lock.locked_position.is_some() => (t, "lock switched"),
            Some(t) => (t, "lock acquired"),
            None => (candidates[0], "lock acquired"),
        }
    }

    fn clamp_delta(&self, pan: i32, tilt: i32) -> (i32, i32) {
        match (self.angles, self.bounds) {
            (Some((p, t)), Some((pb, tb))) => (pb.clamp(p + pan) - p, tb.clamp(t + tilt) - t),
            _ => (pan, tilt),
        }
    }

    fn finish(&self, actions: Vec<Action>, target: Option<TargetState>, note: String) -> Step {
        Step { actions, mode: self.lock.mode, target, note }
    }
}
