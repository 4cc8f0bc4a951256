use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::packet::{CommandCode, Packet, BROADCAST_ID};
use crate::transport::{BusError, BusTransport};

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub candidate_ids: Vec<u8>,
    pub detect_timeout: Duration,
    /// Attempts per candidate id.
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            candidate_ids: default_candidate_ids(),
            detect_timeout: Duration::from_millis(500),
            retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

pub fn default_candidate_ids() -> Vec<u8> {
    vec![1, 2, 3, 4, 5]
}

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub id: u8,
    pub attempts: u32,
    pub responded: bool,
    pub elapsed_ms: u64,
    pub note: String,
}

#[derive(Debug, Clone, Default)]
pub struct DiscoveryResult {
    /// Distinct ids in the order they answered.
    pub responders: Vec<u8>,
    pub probes: Vec<ProbeResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("need two servos, found {found:?}")]
    NotEnoughAxes { found: Vec<u8> },
    #[error("pan and tilt both resolve to id {0}")]
    DuplicateId(u8),
}

impl DiscoveryResult {
    /// First responder is PAN, second is TILT.
    pub fn roles(&self) -> Result<(u8, u8), DiscoveryError> {
        match self.responders.as_slice() {
            [pan, tilt, ..] if pan == tilt => Err(DiscoveryError::DuplicateId(*pan)),
            [pan, tilt, ..] => Ok((*pan, *tilt)),
            found => Err(DiscoveryError::NotEnoughAxes { found: found.to_vec() }),
        }
    }
}

/// Probes each candidate id with POS_READ, retrying silent ones, and stops as
/// soon as two distinct servos have answered.
pub async fn discover<S>(bus: &mut BusTransport<S>, cfg: &DiscoveryConfig) -> DiscoveryResult
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut out = DiscoveryResult::default();

    for &id in &cfg.candidate_ids {
        if out.responders.len() >= 2 {
            break;
        }
        if out.responders.contains(&id) {
            continue;
        }

        let start = Instant::now();
        let mut attempts = 0;
        let mut responded = false;
        let mut note = String::new();

        while attempts < cfg.retries.max(1) {
            if attempts > 0 {
                tokio::time::sleep(cfg.retry_delay).await;
            }
            attempts += 1;
            match bus.send_and_receive(&Packet::read(id, CommandCode::PosRead), cfg.detect_timeout).await {
                Ok(_) => {
                    responded = true;
                    note = "position reply".into();
                    break;
                }
                Err(e @ BusError::Io(_)) | Err(e @ BusError::Closed) => {
                    warn!("servo discovery: bus unusable at id={} err={}", id, e);
                    note = format!("bus error: {}", e);
                    break;
                }
                Err(e) => note = e.to_string(),
            }
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        if responded {
            info!("servo discovery: id {} answered after {} attempt(s)", id, attempts);
            out.responders.push(id);
        }
        out.probes.push(ProbeResult { id, attempts, responded, elapsed_ms, note });
    }

    out
}

/// Broadcasts ID_WRITE. Only meaningful with exactly one servo on the bus.
pub async fn assign_id<S>(bus: &mut BusTransport<S>, new_id: u8) -> Result<(), BusError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    info!("servo id write: broadcast -> {}", new_id);
    bus.send(&Packet::id_write(BROADCAST_ID, new_id)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_follow_response_order() {
        let r = DiscoveryResult { responders: vec![4, 2], probes: vec![] };
        assert_eq!(r.roles(), Ok((4, 2)));
        let r = DiscoveryResult { responders: vec![3], probes: vec![] };
        assert_eq!(r.roles(), Err(DiscoveryError::NotEnoughAxes { found: vec![3] }));
        let r = DiscoveryResult { responders: vec![3, 3], probes: vec![] };
        assert_eq!(r.roles(), Err(DiscoveryError::DuplicateId(3)));
    }
}
