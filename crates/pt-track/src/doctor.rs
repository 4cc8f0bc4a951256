use anyhow::Result;

use crate::{DetectorConfig, MarkerConfig, TargetingConfig};

pub fn check_targeting(t: &TargetingConfig) -> Result<()> {
    anyhow::ensure!(t.frame_width > 0 && t.frame_height > 0, "targeting frame size must be non-zero");
    anyhow::ensure!(t.pan_gain > 0.0 && t.tilt_gain > 0.0, "targeting gains must be positive");
    anyhow::ensure!(
        (0.0..=1.0).contains(&t.min_confidence) && (0.0..=1.0).contains(&t.arm_confidence),
        "targeting confidences must be within 0..1"
    );
    anyhow::ensure!(t.arm_confidence > t.min_confidence, "targeting.arm_confidence must exceed min_confidence");
    anyhow::ensure!(t.lock_distance_px > 0.0, "targeting.lock_distance_px must be positive");
    anyhow::ensure!(t.deadband_px >= 0.0, "targeting.deadband_px negative");
    anyhow::ensure!(t.no_detection_timeout_s > 0.0, "targeting.no_detection_timeout_s must be positive");
    anyhow::ensure!(t.move_threshold_deg >= 0, "targeting.move_threshold_deg negative");
    anyhow::ensure!(t.max_consecutive_failures >= 1, "targeting.max_consecutive_failures must be >= 1");
    anyhow::ensure!(t.cycle_ms >= 10, "targeting.cycle_ms too small");
    Ok(())
}

pub fn check_marker(m: &MarkerConfig) -> Result<()> {
    anyhow::ensure!(m.cooldown_ms <= 60_000, "marker.cooldown_ms over a minute");
    Ok(())
}

pub fn check_detector(d: &DetectorConfig) -> Result<()> {
    if let Some(path) = &d.replay_path {
        anyhow::ensure!(std::path::Path::new(path).is_file(), "detector.replay_path {} not found", path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass() {
        check_targeting(&TargetingConfig::default()).unwrap();
        check_marker(&MarkerConfig::default()).unwrap();
        check_detector(&DetectorConfig::default()).unwrap();
    }

    #[test]
    fn arm_threshold_must_be_stricter() {
        let t = TargetingConfig { arm_confidence: 0.3, ..TargetingConfig::default() };
        assert!(check_targeting(&t).is_err());
    }

    #[test]
    fn missing_replay_file() {
        let d = DetectorConfig { replay_path: Some("/nonexistent/detections.jsonl".into()), loop_replay: false };
        assert!(check_detector(&d).is_err());
    }
}
