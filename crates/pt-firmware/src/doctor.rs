use std::collections::HashSet;

use anyhow::Result;
use pt_servo::{AxisLimits, SERVO_TRAVEL_DEG, SPEED_MAX, SPEED_MIN};

use crate::config::FirmwareConfig;
use crate::dispatcher::{SERVO_ID_MAX, SERVO_ID_MIN};

pub fn check_axis(name: &str, l: &AxisLimits) -> Result<()> {
    anyhow::ensure!(l.min <= l.max, "firmware.{name}: min > max");
    anyhow::ensure!(l.min >= 0 && l.max <= SERVO_TRAVEL_DEG, "firmware.{name}: limits outside 0..={SERVO_TRAVEL_DEG}");
    anyhow::ensure!(l.min <= l.init && l.init <= l.max, "firmware.{name}.init outside min..=max");
    Ok(())
}

pub fn check_firmware(cfg: &FirmwareConfig) -> Result<()> {
    anyhow::ensure!(cfg.candidate_ids.len() >= 2, "firmware.candidate_ids needs at least two ids");
    let mut seen = HashSet::new();
    for &id in &cfg.candidate_ids {
        let id32 = i32::from(id);
        anyhow::ensure!((SERVO_ID_MIN..=SERVO_ID_MAX).contains(&id32), "firmware.candidate_ids: {id} not a servo id");
        anyhow::ensure!(seen.insert(id), "firmware.candidate_ids: {id} listed twice");
    }
    anyhow::ensure!(cfg.detect_retries >= 1, "firmware.detect_retries must be >= 1");
    anyhow::ensure!(cfg.detect_timeout_ms > 0, "firmware.detect_timeout_ms must be > 0");
    anyhow::ensure!(cfg.exchange_timeout_ms > 0, "firmware.exchange_timeout_ms must be > 0");
    anyhow::ensure!(
        cfg.exchange_timeout_ms <= cfg.aggregate_timeout_ms,
        "firmware.exchange_timeout_ms exceeds aggregate_timeout_ms"
    );
    // an aggregate that runs to its deadline must still answer before the watchdog fires
    anyhow::ensure!(
        cfg.aggregate_timeout_ms <= cfg.watchdog_ms,
        "firmware.aggregate_timeout_ms exceeds watchdog_ms"
    );
    anyhow::ensure!(cfg.fault_repeat_ms >= 100, "firmware.fault_repeat_ms too small");
    let speed = i32::from(cfg.default_speed);
    anyhow::ensure!((SPEED_MIN..=SPEED_MAX).contains(&speed), "firmware.default_speed should be 1..100");
    check_axis("pan", &cfg.pan)?;
    check_axis("tilt", &cfg.tilt)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass() {
        check_firmware(&FirmwareConfig::default()).unwrap();
    }

    #[test]
    fn bad_values_are_named() {
        let mut cfg = FirmwareConfig::default();
        cfg.candidate_ids = vec![1, 1];
        assert!(check_firmware(&cfg).unwrap_err().to_string().contains("listed twice"));

        let mut cfg = FirmwareConfig::default();
        cfg.tilt.init = 170;
        assert!(check_firmware(&cfg).unwrap_err().to_string().contains("tilt.init"));

        let mut cfg = FirmwareConfig::default();
        cfg.aggregate_timeout_ms = 5000;
        assert!(check_firmware(&cfg).is_err());
    }
}
