use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Default)]
pub struct LinkStatus {
    pub connected: bool,
    pub port: Option<String>,
    pub baud: Option<u32>,
    pub last_response: Option<Instant>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl LinkStatus {
    pub fn response_age(&self) -> Option<Duration> {
        self.last_response.map(|t| t.elapsed())
    }

    pub(crate) fn record_ok(&mut self) {
        self.connected = true;
        self.last_response = Some(Instant::now());
        self.consecutive_failures = 0;
    }

    pub(crate) fn record_failure(&mut self, err: &str) {
        self.consecutive_failures += 1;
        self.last_error = Some(err.to_string());
    }
}
