use serde::{Deserialize, Serialize};

/// Host targeting mode, as recorded in telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackMode {
    Monitoring,
    Tracking,
    Armed,
    Fault,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackEvent {
    pub ts_unix_ms: i64,
    pub mode: TrackMode,
    pub detections: usize,
    // frame pixels
    pub target_x: Option<f32>,
    pub target_y: Option<f32>,
    pub confidence: Option<f32>,
    // last known actuator angles
    pub pan: Option<i32>,
    pub tilt: Option<i32>,
    pub marker_on: bool,
    pub consecutive_failures: u32,
    pub msg: String,
}
