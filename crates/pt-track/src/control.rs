use std::time::Duration;

use anyhow::{Context, Result};
use pt_link::{ControllerLink, LinkError};
use pt_proto::{TrackEvent, TrackMode};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::targeting::{Action, TargetState, Targeting};
use crate::{Detector, MarkerConfig, TargetingConfig};

/// One detection cycle at a time: pull detections, step the targeting
/// machine, then issue its commands in order, each awaited before the next.
pub struct ControlLoop<S, D> {
    link: ControllerLink<S>,
    detector: D,
    targeting: Targeting,
    cycle: Duration,
}

impl<S, D> ControlLoop<S, D>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    D: Detector,
{
    pub fn new(link: ControllerLink<S>, detector: D, cfg: TargetingConfig, marker: &MarkerConfig) -> Self {
        let cycle = Duration::from_millis(cfg.cycle_ms.max(1));
        Self { link, detector, targeting: Targeting::new(cfg, marker), cycle }
    }

    pub fn targeting(&self) -> &Targeting {
        &self.targeting
    }

    pub fn link(&self) -> &ControllerLink<S> {
        &self.link
    }

    /// Handshake and learn where the axes are. A controller stuck in
    /// discovery failure is not an error here: targeting just stays in FAULT.
    pub async fn start(&mut self) -> Result<()> {
        let info = match self.link.handshake().await {
            Ok(info) => info,
            Err(LinkError::DiscoveryFault { found }) => {
                self.targeting.enter_fault(&format!("controller discovery failed, found {:?}", found));
                return Ok(());
            }
            Err(e) => return Err(e).context("controller handshake"),
        };
        self.targeting.set_bounds(&info);

        match self.link.position().await {
            Ok((pan, tilt, stale)) => {
                if stale {
                    warn!("controller reports stale angles at start");
                }
                self.targeting.observe_angles(pan, tilt);
            }
            Err(e) => warn!("initial position unknown: {}", e),
        }
        info!(pan_id = info.pan_id, tilt_id = info.tilt_id, "track: started");
        Ok(())
    }

    pub async fn cycle(&mut self) -> Result<TrackEvent> {
        let detections = match self.detector.detect() {
            Ok(d) => d,
            Err(e) => {
                warn!("detector failed: {:#}", e);
                Vec::new()
            }
        };
        let now = Instant::now().into_std();
        let targets: Vec<TargetState> = detections.iter().map(|d| TargetState::from_detection(d, now)).collect();

        let step = self.targeting.step(&targets, now);
        let mut note = step.note.clone();
        for action in step.actions {
            match self.execute(action).await {
                Ok(()) => self.targeting.on_command_ok(),
                Err(LinkError::Closed) => return Err(LinkError::Closed).context("controller link"),
                Err(LinkError::DiscoveryFault { found }) => {
                    self.targeting.enter_fault(&format!("controller reports discovery failure, found {:?}", found));
                    note = "controller fault".into();
                    break;
                }
                Err(e) => {
                    warn!(?action, "command failed: {}", e);
                    let fallback = self.targeting.on_command_failed();
                    if fallback.is_empty() {
                        continue;
                    }
                    note = "too many failures, monitoring".into();
                    for action in fallback {
                        // best effort; the machine already moved on
                        if let Err(e) = self.execute(action).await {
                            warn!(?action, "fallback command failed: {}", e);
                        }
                    }
                    break;
                }
            }
        }

        let ev = self.event(detections.len(), step.target.as_ref(), note);
        let line = serde_json::to_string(&ev)?;
        if ev.mode == TrackMode::Monitoring && ev.msg.is_empty() {
            debug!(target: "track", "{}", line);
        } else {
            info!(target: "track", "{}", line);
        }
        Ok(ev)
    }

    async fn execute(&mut self, action: Action) -> Result<(), LinkError> {
        match action {
            Action::MoveBy { pan, tilt } => {
                let (p, t) = self.link.move_by(pan, tilt).await?;
                self.targeting.observe_angles(p, t);
            }
            Action::Recenter => {
                let (p, t) = self.link.home().await?;
                self.targeting.observe_angles(p, t);
            }
            Action::Mark(on) => self.link.laser(on).await?,
        }
        Ok(())
    }

    fn event(&self, detections: usize, target: Option<&TargetState>, msg: String) -> TrackEvent {
        let angles = self.targeting.angles();
        TrackEvent {
            ts_unix_ms: (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64,
            mode: self.targeting.mode(),
            detections,
            target_x: target.map(|t| t.x),
            target_y: target.map(|t| t.y),
            confidence: target.map(|t| t.confidence),
            pan: angles.map(|a| a.0),
            tilt: angles.map(|a| a.1),
            marker_on: self.targeting.marker_on(),
            consecutive_failures: self.targeting.consecutive_failures(),
            msg,
        }
    }

    /// Runs cycles on a fixed period; `max_cycles` of `None` runs until the
    /// link closes.
    pub async fn run(&mut self, max_cycles: Option<u64>) -> Result<()> {
        let mut tick = interval(self.cycle);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut done = 0u64;
        while max_cycles.map_or(true, |m| done < m) {
            tick.tick().await;
            self.cycle().await?;
            done += 1;
        }
        info!("track: {} cycles, final mode {:?}", done, self.targeting.mode());
        Ok(())
    }
}
