pub mod client;
pub mod doctor;
pub mod state;

pub use client::{ControllerLink, LinkError};
pub use state::LinkStatus;

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Serial port of the motion controller.
    pub device: Option<String>,
    pub baud: u32,

    /// How long to wait for the unsolicited startup record.
    pub startup_timeout_ms: u64,
    /// Lines read while waiting for it before giving up.
    pub startup_max_lines: usize,

    /// Longer than the controller's aggregate deadline, so a slow STATUS
    /// still counts as an answer.
    pub response_timeout_ms: u64,
    /// Reply budget for `CAL`, which answers after the whole sweep.
    pub calibrate_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device: None,
            baud: 115_200,
            startup_timeout_ms: 3000,
            startup_max_lines: 20,
            response_timeout_ms: 2500,
            calibrate_timeout_ms: 15_000,
        }
    }
}

impl LinkConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}
