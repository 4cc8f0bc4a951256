use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

/// Why the supervisor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogExit {
    /// No heartbeat for a whole period.
    Tripped { period: Duration },
    /// Every [`Heartbeat`] was dropped; the supervised loop ended on its own.
    Released,
}

/// Petting side, held by the supervised loop.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    tx: mpsc::Sender<()>,
}

impl Heartbeat {
    pub fn pet(&self) {
        // a full slot already counts as a pet
        let _ = self.tx.try_send(());
    }
}

/// Supervisor task. Dropping it disarms the watchdog.
#[derive(Debug)]
pub struct Watchdog {
    task: JoinHandle<WatchdogExit>,
    period: Duration,
}

impl Watchdog {
    pub fn arm(period: Duration) -> (Heartbeat, Watchdog) {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        let task = tokio::spawn(async move {
            loop {
                match timeout(period, rx.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) => return WatchdogExit::Released,
                    Err(_) => return WatchdogExit::Tripped { period },
                }
            }
        });
        debug!(?period, "watchdog armed");
        (Heartbeat { tx }, Watchdog { task, period })
    }

    /// Resolves once the supervisor stops.
    pub async fn expired(&mut self) -> WatchdogExit {
        match (&mut self.task).await {
            Ok(exit) => exit,
            // supervisor vanished; treat it like a trip so the loop restarts
            Err(_) => WatchdogExit::Tripped { period: self.period },
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn regular_pets_keep_it_quiet() {
        let (hb, mut dog) = Watchdog::arm(Duration::from_secs(2));
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            hb.pet();
        }
        drop(hb);
        assert_eq!(dog.expired().await, WatchdogExit::Released);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_trips_after_one_period() {
        let (hb, mut dog) = Watchdog::arm(Duration::from_secs(2));
        hb.pet();
        let start = tokio::time::Instant::now();
        let exit = dog.expired().await;
        assert_eq!(exit, WatchdogExit::Tripped { period: Duration::from_secs(2) });
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(3), "{waited:?}");
        drop(hb);
    }
}
