use std::time::{Duration, Instant};

/// Spaces out marker activations. Deactivation is never throttled.
#[derive(Debug)]
pub struct MarkerGate {
    enabled: bool,
    cooldown: Duration,
    last_on: Option<Instant>,
}

impl MarkerGate {
    pub fn new(enabled: bool, cooldown: Duration) -> Self {
        Self { enabled, cooldown, last_on: None }
    }

    pub fn allow_on(&mut self, now: Instant) -> bool {
        if !self.enabled {
            return false;
        }
        if let Some(t) = self.last_on {
            if now.duration_since(t) < self.cooldown {
                return false;
            }
        }
        self.last_on = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_between_activations() {
        let t0 = Instant::now();
        let mut g = MarkerGate::new(true, Duration::from_millis(500));
        assert!(g.allow_on(t0));
        assert!(!g.allow_on(t0 + Duration::from_millis(499)));
        assert!(g.allow_on(t0 + Duration::from_millis(500)));
    }

    #[test]
    fn disabled_gate_never_fires() {
        let mut g = MarkerGate::new(false, Duration::ZERO);
        assert!(!g.allow_on(Instant::now()));
    }
}
