use std::time::Duration;

use pt_servo::discovery::default_candidate_ids;
use pt_servo::{AxisLimits, DiscoveryConfig};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FirmwareConfig {
    /// Serial port facing the host. `None` means stdin/stdout.
    pub host_device: Option<String>,
    pub host_baud: u32,
    /// Serial port of the servo bus.
    pub bus_device: Option<String>,
    pub bus_baud: u32,

    pub candidate_ids: Vec<u8>,
    pub detect_timeout_ms: u64,
    pub detect_retries: u32,
    pub retry_delay_ms: u64,
    pub startup_delay_ms: u64,

    /// Single bus exchange.
    pub exchange_timeout_ms: u64,
    /// Whole STATUS/TEMP/VOLT sequence.
    pub aggregate_timeout_ms: u64,
    pub watchdog_ms: u64,
    pub fault_repeat_ms: u64,
    /// Pause after each pose of the `CAL` sweep.
    pub calibrate_settle_ms: u64,

    pub default_speed: u8,
    pub pan: AxisLimits,
    pub tilt: AxisLimits,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            host_device: None,
            host_baud: 115_200,
            bus_device: None,
            bus_baud: 115_200,
            candidate_ids: default_candidate_ids(),
            detect_timeout_ms: 500,
            detect_retries: 3,
            retry_delay_ms: 500,
            startup_delay_ms: 1000,
            exchange_timeout_ms: 100,
            aggregate_timeout_ms: 2000,
            watchdog_ms: 2000,
            fault_repeat_ms: 3000,
            calibrate_settle_ms: 2500,
            default_speed: 50,
            pan: AxisLimits::PAN,
            tilt: AxisLimits::TILT,
        }
    }
}

impl FirmwareConfig {
    pub fn discovery(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            candidate_ids: self.candidate_ids.clone(),
            detect_timeout: Duration::from_millis(self.detect_timeout_ms),
            retries: self.detect_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }

    pub fn aggregate_timeout(&self) -> Duration {
        Duration::from_millis(self.aggregate_timeout_ms)
    }

    pub fn watchdog_period(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }

    pub fn calibrate_settle(&self) -> Duration {
        Duration::from_millis(self.calibrate_settle_ms)
    }

    pub fn fault_repeat(&self) -> Duration {
        Duration::from_millis(self.fault_repeat_ms)
    }

    /// Longest the serve loop waits for host input before going round again.
    pub fn idle_tick(&self) -> Duration {
        Duration::from_millis((self.watchdog_ms / 4).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: FirmwareConfig = toml::from_str(
            r#"
            bus_device = "/dev/ttyS1"
            watchdog_ms = 4000
            [tilt]
            min = 30
            max = 150
            init = 60
            "#,
        )
        .unwrap();
        assert_eq!(cfg.bus_device.as_deref(), Some("/dev/ttyS1"));
        assert_eq!(cfg.watchdog_period(), Duration::from_secs(4));
        assert_eq!(cfg.idle_tick(), Duration::from_secs(1));
        assert_eq!(cfg.tilt, AxisLimits { min: 30, max: 150, init: 60 });
        assert_eq!(cfg.pan, AxisLimits::PAN);
        assert_eq!(cfg.discovery().candidate_ids, vec![1, 2, 3, 4, 5]);
    }
}
