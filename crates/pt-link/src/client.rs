use std::io;
use std::time::Duration;

use anyhow::Context;
use pt_proto::startup::is_discovery_failure;
use pt_proto::{Command, Response, StartupInfo, Status};
use thiserror::Error;
use tokio::io::{split, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines, ReadHalf, WriteHalf};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use crate::state::LinkStatus;
use crate::LinkConfig;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("no answer within {0} ms")]
    Timeout(u64),
    #[error("controller link closed")]
    Closed,
    #[error("controller rejected command: {0}")]
    Rejected(String),
    #[error("controller reports servo discovery failure (found ids {found:?})")]
    DiscoveryFault { found: Vec<u8> },
    #[error("link i/o: {0}")]
    Io(#[from] io::Error),
    #[error("unexpected reply {0}")]
    Decode(String),
}

/// Host end of the line protocol. One request in flight at a time.
pub struct ControllerLink<S> {
    rx: Lines<BufReader<ReadHalf<S>>>,
    tx: WriteHalf<S>,
    cfg: LinkConfig,
    status: LinkStatus,
    info: Option<StartupInfo>,
    /// The last request timed out; its reply may still be on the way.
    desynced: bool,
}

impl ControllerLink<SerialStream> {
    pub fn open(cfg: &LinkConfig) -> anyhow::Result<Self> {
        let dev = cfg.device.as_deref().context("link.device not set")?;
        let port = tokio_serial::new(dev, cfg.baud)
            .open_native_async()
            .with_context(|| format!("open controller serial device {}", dev))?;
        let mut link = Self::new(port, cfg.clone());
        link.status.port = Some(dev.to_string());
        link.status.baud = Some(cfg.baud);
        info!("controller link: {} @ {}", dev, cfg.baud);
        Ok(link)
    }
}

impl<S> ControllerLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(io: S, cfg: LinkConfig) -> Self {
        let (rx, tx) = split(io);
        Self { rx: BufReader::new(rx).lines(), tx, cfg, status: LinkStatus::default(), info: None, desynced: false }
    }

    pub fn status(&self) -> &LinkStatus {
        &self.status
    }

    /// Axis ids and bounds from the last handshake or `GETINFO`.
    pub fn info(&self) -> Option<&StartupInfo> {
        self.info.as_ref()
    }

    /// Consumes boot chatter until the startup record shows up.
    pub async fn await_startup(&mut self) -> Result<StartupInfo, LinkError> {
        let deadline = Instant::now() + self.cfg.startup_timeout();
        for _ in 0..self.cfg.startup_max_lines {
            let line = self.next_line(deadline, self.cfg.startup_timeout_ms).await?;
            let Some(rec) = Response::parse(&line) else {
                debug!("startup chatter: {}", line);
                continue;
            };
            if is_discovery_failure(&rec) {
                let err = LinkError::DiscoveryFault { found: found_ids(&rec) };
                self.status.record_failure(&err.to_string());
                return Err(err);
            }
            if let Some(info) = StartupInfo::from_response(&rec) {
                info!(pan_id = info.pan_id, tilt_id = info.tilt_id, "controller ready");
                self.status.record_ok();
                self.info = Some(info);
                return Ok(info);
            }
        }
        let err = LinkError::Timeout(self.cfg.startup_timeout_ms);
        self.status.record_failure(&err.to_string());
        Err(err)
    }

    /// Startup record if it arrives, otherwise an explicit `GETINFO`.
    pub async fn handshake(&mut self) -> Result<StartupInfo, LinkError> {
        match self.await_startup().await {
            Err(LinkError::Timeout(_)) => {
                warn!("no startup record; asking GETINFO");
                self.get_info().await
            }
            other => other,
        }
    }

    pub async fn request(&mut self, cmd: &Command) -> Result<Response, LinkError> {
        let res = self.exchange(&cmd.to_string(), self.budget_ms(Some(cmd))).await;
        match &res {
            Ok(_) => self.status.record_ok(),
            Err(e) => {
                warn!(%cmd, err = %e, "controller request failed");
                self.status.record_failure(&e.to_string());
            }
        }
        res
    }

    /// Sends a raw line and returns whatever record answers it, `ERROR`
    /// included.
    pub async fn send_raw(&mut self, line: &str) -> Result<Response, LinkError> {
        let budget_ms = self.budget_ms(Command::parse(line).ok().as_ref());
        match self.exchange(line, budget_ms).await {
            Err(LinkError::Rejected(msg)) => Ok(Response::error(msg)),
            other => other,
        }
    }

    /// The calibration sweep answers only once it has finished.
    fn budget_ms(&self, cmd: Option<&Command>) -> u64 {
        match cmd {
            Some(Command::Calibrate) => self.cfg.calibrate_timeout_ms,
            _ => self.cfg.response_timeout_ms,
        }
    }

    async fn exchange(&mut self, line: &str, budget_ms: u64) -> Result<Response, LinkError> {
        self.resync().await?;
        self.tx.write_all(line.as_bytes()).await?;
        self.tx.write_all(b"\n").await?;
        self.tx.flush().await?;

        let res = self.await_reply(budget_ms).await;
        if matches!(res, Err(LinkError::Timeout(_))) {
            self.desynced = true;
        }
        res
    }

    /// Gets rid of anything that cannot answer the next request. The
    /// controller answers in order, so the reply to a timed-out request
    /// arrives before the next answer or not at all.
    async fn resync(&mut self) -> Result<(), LinkError> {
        if self.desynced {
            let deadline = Instant::now() + self.cfg.response_timeout();
            loop {
                match self.next_line(deadline, self.cfg.response_timeout_ms).await {
                    Ok(line) => match Response::parse(&line) {
                        Some(rec) if rec.status != Status::Info => {
                            warn!("discarding late reply: {}", line);
                            break;
                        }
                        _ => debug!("skipping while resyncing: {}", line),
                    },
                    Err(LinkError::Timeout(_)) => {
                        warn!("late reply never arrived");
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            self.desynced = false;
        }

        while let Ok(res) = timeout(Duration::ZERO, self.rx.next_line()).await {
            match res? {
                Some(line) => debug!("discarding unsolicited line: {}", line),
                None => {
                    self.status.connected = false;
                    return Err(LinkError::Closed);
                }
            }
        }
        Ok(())
    }

    async fn await_reply(&mut self, budget_ms: u64) -> Result<Response, LinkError> {
        let deadline = Instant::now() + Duration::from_millis(budget_ms);
        loop {
            let line = self.next_line(deadline, budget_ms).await?;
            let Some(rec) = Response::parse(&line) else {
                debug!("skipping non-record line: {}", line);
                continue;
            };
            match rec.status {
                Status::Info => continue,
                Status::Ok => return Ok(rec),
                Status::Error if is_discovery_failure(&rec) => {
                    return Err(LinkError::DiscoveryFault { found: found_ids(&rec) })
                }
                Status::Error => return Err(LinkError::Rejected(rec.message().unwrap_or("ERROR").to_string())),
            }
        }
    }

    async fn next_line(&mut self, deadline: Instant, budget_ms: u64) -> Result<String, LinkError> {
        match timeout_at(deadline, self.rx.next_line()).await {
            Err(_) => Err(LinkError::Timeout(budget_ms)),
            Ok(Ok(Some(line))) => Ok(line),
            Ok(Ok(None)) => {
                self.status.connected = false;
                Err(LinkError::Closed)
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }

    pub async fn get_info(&mut self) -> Result<StartupInfo, LinkError> {
        let rec = self.request(&Command::GetInfo).await?;
        let info = StartupInfo::from_response(&rec).ok_or_else(|| LinkError::Decode(rec.to_line()))?;
        self.info = Some(info);
        Ok(info)
    }

    /// Relative move; returns the angles the controller settled on.
    pub async fn move_by(&mut self, pan: i32, tilt: i32) -> Result<(i32, i32), LinkError> {
        let rec = self.request(&Command::MoveBy { pan, tilt }).await?;
        angles(&rec)
    }

    pub async fn move_to(&mut self, pan: i32, tilt: i32) -> Result<(i32, i32), LinkError> {
        let rec = self.request(&Command::Move { pan, tilt }).await?;
        angles(&rec)
    }

    pub async fn home(&mut self) -> Result<(i32, i32), LinkError> {
        let rec = self.request(&Command::Home).await?;
        angles(&rec)
    }

    /// Angles plus the controller's stale flag.
    pub async fn position(&mut self) -> Result<(i32, i32, bool), LinkError> {
        let rec = self.request(&Command::Pos).await?;
        let (pan, tilt) = angles(&rec)?;
        Ok((pan, tilt, rec.get_bool("stale").unwrap_or(false)))
    }

    pub async fn laser(&mut self, on: bool) -> Result<(), LinkError> {
        self.request(&Command::Laser(on)).await.map(|_| ())
    }

    /// Runs the `CAL` sweep; returns the park angles it ends on.
    pub async fn calibrate(&mut self) -> Result<(i32, i32), LinkError> {
        let rec = self.request(&Command::Calibrate).await?;
        angles(&rec)
    }
}

fn angles(rec: &Response) -> Result<(i32, i32), LinkError> {
    let get = |k: &str| rec.get_i64(k).and_then(|v| i32::try_from(v).ok());
    match (get("pan"), get("tilt")) {
        (Some(p), Some(t)) => Ok((p, t)),
        _ => Err(LinkError::Decode(rec.to_line())),
    }
}

fn found_ids(rec: &Response) -> Vec<u8> {
    rec.fields
        .get("found_ids")
        .and_then(|v| v.as_array())
        .map(|ids| ids.iter().filter_map(|v| v.as_u64()).filter_map(|v| u8::try_from(v).ok()).collect())
        .unwrap_or_default()
}
