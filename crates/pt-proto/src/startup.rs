use serde::{Deserialize, Serialize};

use crate::response::{Response, Status};

pub const STARTUP_MESSAGE: &str = "servo ids assigned";
pub const DISCOVERY_FAILED_MESSAGE: &str = "servo discovery failed";

/// Inclusive angle range of one axis, degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AngleBounds {
    pub min: i32,
    pub max: i32,
}

impl AngleBounds {
    pub fn clamp(&self, angle: i32) -> i32 {
        angle.clamp(self.min, self.max)
    }

    pub fn contains(&self, angle: i32) -> bool {
        (self.min..=self.max).contains(&angle)
    }
}

/// Axis identities and bounds announced once discovery succeeds (and by `GETINFO`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartupInfo {
    pub pan_id: u8,
    pub tilt_id: u8,
    pub pan: AngleBounds,
    pub tilt: AngleBounds,
}

impl StartupInfo {
    pub fn to_response(&self, message: &str) -> Response {
        Response::ok_message(message)
            .with("pan_id", self.pan_id)
            .with("tilt_id", self.tilt_id)
            .with("pan_min", self.pan.min)
            .with("pan_max", self.pan.max)
            .with("tilt_min", self.tilt.min)
            .with("tilt_max", self.tilt.max)
    }

    pub fn from_response(r: &Response) -> Option<Self> {
        if r.status != Status::Ok {
            return None;
        }
        let id = |k: &str| r.get_i64(k).and_then(|v| u8::try_from(v).ok());
        let deg = |k: &str| r.get_i64(k).and_then(|v| i32::try_from(v).ok());
        Some(Self {
            pan_id: id("pan_id")?,
            tilt_id: id("tilt_id")?,
            pan: AngleBounds { min: deg("pan_min")?, max: deg("pan_max")? },
            tilt: AngleBounds { min: deg("tilt_min")?, max: deg("tilt_max")? },
        })
    }
}

/// Error record repeated by a controller stuck in FAULT.
pub fn discovery_failed(found: &[u8]) -> Response {
    Response::error(DISCOVERY_FAILED_MESSAGE)
        .with("found_ids", found.to_vec())
        .with("hint", "check servo wiring and reset the controller")
}

pub fn is_discovery_failure(r: &Response) -> bool {
    r.status == Status::Error && r.message() == Some(DISCOVERY_FAILED_MESSAGE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_record_round_trips_through_text() {
        let info = StartupInfo {
            pan_id: 1,
            tilt_id: 2,
            pan: AngleBounds { min: 0, max: 270 },
            tilt: AngleBounds { min: 15, max: 165 },
        };
        let line = info.to_response(STARTUP_MESSAGE).to_line();
        assert!(line.starts_with(r#"{"status":"ok","message":"servo ids assigned","pan_id":1,"tilt_id":2"#));
        let back = Response::parse(&line).and_then(|r| StartupInfo::from_response(&r));
        assert_eq!(back, Some(info));
    }

    #[test]
    fn failure_record_is_recognised() {
        let r = Response::parse(&discovery_failed(&[3]).to_line()).unwrap();
        assert!(is_discovery_failure(&r));
        assert!(StartupInfo::from_response(&r).is_none());
    }
}
