use anyhow::Result;

use crate::LinkConfig;

/// Checks the link against the controller's own timing: its deadline for
/// multi-read commands and the pause after each of the five `CAL` poses.
pub fn check_link(cfg: &LinkConfig, aggregate_timeout_ms: u64, calibrate_settle_ms: u64) -> Result<()> {
    anyhow::ensure!(cfg.baud > 0, "link.baud invalid");
    anyhow::ensure!(cfg.startup_timeout_ms > 0, "link.startup_timeout_ms must be positive");
    anyhow::ensure!(cfg.startup_max_lines >= 1, "link.startup_max_lines must be >= 1");
    anyhow::ensure!(
        cfg.response_timeout_ms > aggregate_timeout_ms,
        "link.response_timeout_ms ({}) must exceed firmware.aggregate_timeout_ms ({})",
        cfg.response_timeout_ms,
        aggregate_timeout_ms
    );
    anyhow::ensure!(
        cfg.calibrate_timeout_ms > calibrate_settle_ms.saturating_mul(5),
        "link.calibrate_timeout_ms must exceed five firmware.calibrate_settle_ms pauses"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass() {
        check_link(&LinkConfig::default(), 2000, 2500).unwrap();
    }

    #[test]
    fn response_timeout_must_outlast_aggregates() {
        let cfg = LinkConfig { response_timeout_ms: 2000, ..LinkConfig::default() };
        assert!(check_link(&cfg, 2000, 2500).is_err());
        check_link(&cfg, 1500, 2500).unwrap();
    }

    #[test]
    fn calibration_budget_covers_the_sweep() {
        assert!(check_link(&LinkConfig::default(), 2000, 3000).is_err());
    }
}
