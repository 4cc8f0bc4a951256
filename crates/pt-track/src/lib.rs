pub mod control;
pub mod doctor;
pub mod marker;
pub mod replay;
pub mod targeting;

pub use control::ControlLoop;
pub use marker::MarkerGate;
pub use replay::ReplayDetector;
pub use targeting::{Action, LockState, Step, TargetState, Targeting};

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Top-left x, top-left y, width, height in frame pixels.
    pub bbox: [f32; 4],
    pub confidence: f32,
    #[serde(default)]
    pub class_id: i32,
}

impl Detection {
    pub fn center(&self) -> (f32, f32) {
        let [x, y, w, h] = self.bbox;
        (x + w / 2.0, y + h / 2.0)
    }
}

/// Source of detections, polled once per control cycle.
pub trait Detector: Send {
    fn detect(&mut self) -> Result<Vec<Detection>>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TargetingConfig {
    pub frame_width: u32,
    pub frame_height: u32,
    /// Degrees per pixel of offset from frame center.
    pub pan_gain: f32,
    pub tilt_gain: f32,
    pub min_confidence: f32,
    /// Stricter threshold for ARMED.
    pub arm_confidence: f32,
    pub lock_distance_px: f32,
    pub deadband_px: f32,
    pub no_detection_timeout_s: f32,
    /// Smaller corrections are not sent.
    pub move_threshold_deg: i32,
    pub max_consecutive_failures: u32,
    pub cycle_ms: u64,
}

impl Default for TargetingConfig {
    fn default() -> Self {
        Self {
            frame_width: 640,
            frame_height: 480,
            pan_gain: 0.15,
            tilt_gain: 0.15,
            min_confidence: 0.4,
            arm_confidence: 0.6,
            lock_distance_px: 100.0,
            deadband_px: 30.0,
            no_detection_timeout_s: 3.0,
            move_threshold_deg: 2,
            max_consecutive_failures: 3,
            cycle_ms: 100,
        }
    }
}

impl TargetingConfig {
    pub fn frame_center(&self) -> (f32, f32) {
        (self.frame_width as f32 / 2.0, self.frame_height as f32 / 2.0)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    pub enable: bool,
    pub cooldown_ms: u64,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self { enable: true, cooldown_ms: 500 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// JSON-lines file, one array of detections per cycle.
    pub replay_path: Option<String>,
    pub loop_replay: bool,
}
