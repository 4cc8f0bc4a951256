use std::io;

use anyhow::{Context, Result};
use pt_proto::startup::{discovery_failed, STARTUP_MESSAGE};
use pt_proto::{Command, Response, FIRMWARE_VERSION};
use pt_servo::{discover, AxisRegistry, BusTransport};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{error, info, warn};

use crate::config::FirmwareConfig;
use crate::dispatcher::{fault_response, is_aggregate, DispatchError, Dispatcher};
use crate::line::{Feed, LineAssembler};
use crate::outputs::Outputs;
use crate::state::{transition, Event, State};
use crate::watchdog::{Heartbeat, Watchdog, WatchdogExit};

enum Booted {
    Ready(Dispatcher),
    Fault { found: Vec<u8> },
}

/// Motion-controller main loop: BOOT, discovery, then READY (watchdog armed)
/// or FAULT. A watchdog trip goes back to BOOT.
pub struct Controller<R, W, B, O> {
    host_rx: BufReader<R>,
    host_tx: W,
    bus: BusTransport<B>,
    outputs: O,
    cfg: FirmwareConfig,
    state: State,
    lines: LineAssembler,
    boots: u32,
}

impl<R, W, B, O> Controller<R, W, B, O>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
    O: Outputs,
{
    pub fn new(host_rx: R, host_tx: W, bus: B, outputs: O, cfg: FirmwareConfig) -> Self {
        let bus = BusTransport::new(bus, cfg.exchange_timeout());
        Self {
            host_rx: BufReader::new(host_rx),
            host_tx,
            bus,
            outputs,
            cfg,
            state: State::Boot,
            lines: LineAssembler::new(),
            boots: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn boots(&self) -> u32 {
        self.boots
    }

    fn apply(&mut self, event: Event) {
        let next = transition(self.state, event);
        if next != self.state {
            tracing::trace!(from = %self.state, to = %next, ?event, "state");
        }
        self.state = next;
    }

    /// Runs until the host link closes.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            match self.boot().await? {
                Booted::Ready(mut dispatcher) => {
                    let (heartbeat, mut dog) = Watchdog::arm(self.cfg.watchdog_period());
                    let exit = tokio::select! {
                        res = self.serve(&mut dispatcher, &heartbeat) => {
                            return res;
                        }
                        exit = dog.expired() => exit,
                    };
                    if let WatchdogExit::Tripped { period } = exit {
                        error!(?period, state = %self.state, "watchdog tripped; rebooting");
                    }
                    self.apply(Event::WatchdogTrip);
                }
                Booted::Fault { found } => return self.fault_loop(&found).await,
            }
        }
    }

    async fn boot(&mut self) -> Result<Booted> {
        self.state = State::Boot;
        self.lines.reset();
        self.boots += 1;
        self.reply(&Response::info(format!("PT2D firmware {} booting", FIRMWARE_VERSION))).await?;
        sleep(self.cfg.startup_delay()).await;

        self.apply(Event::StartDiscovery);
        let found = discover(&mut self.bus, &self.cfg.discovery()).await;
        for p in &found.probes {
            info!("probe id={} attempts={} responded={} elapsed_ms={} note={}", p.id, p.attempts, p.responded, p.elapsed_ms, p.note);
        }

        let (pan_id, tilt_id) = match found.roles() {
            Ok(ids) => ids,
            Err(e) => {
                error!("servo discovery failed: {}", e);
                self.apply(Event::DiscoveryFailed);
                return Ok(Booted::Fault { found: found.responders });
            }
        };

        let mut registry = AxisRegistry::new(pan_id, tilt_id, self.cfg.pan, self.cfg.tilt, self.cfg.default_speed);
        if let Err(e) = registry.home(&mut self.bus).await {
            warn!("park at init angles failed: {}", e);
        }
        let dispatcher =
            Dispatcher::new(registry, self.cfg.aggregate_timeout()).with_calibrate_settle(self.cfg.calibrate_settle());
        self.reply(&dispatcher.info().to_response(STARTUP_MESSAGE)).await?;
        self.apply(Event::AxesAssigned);
        info!(pan_id, tilt_id, "ready");
        Ok(Booted::Ready(dispatcher))
    }

    async fn serve(&mut self, dispatcher: &mut Dispatcher, heartbeat: &Heartbeat) -> Result<()> {
        let tick = self.cfg.idle_tick();
        dispatcher.keep_alive(heartbeat.clone(), tick);
        loop {
            heartbeat.pet();

            let b = match timeout(tick, self.host_rx.read_u8()).await {
                Err(_) => continue,
                Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    info!("host link closed");
                    return Ok(());
                }
                Ok(r) => r.context("host link read")?,
            };

            let Some(parsed) = self.on_byte(b) else { continue };
            let resp = match parsed {
                Ok(cmd) => {
                    if is_aggregate(&cmd) {
                        self.apply(Event::AggregateStarted);
                    }
                    dispatcher.dispatch(cmd, &mut self.bus, &mut self.outputs).await
                }
                Err(e) => {
                    warn!(err = %e, "rejected host line");
                    e.to_response()
                }
            };
            self.reply(&resp).await?;
            self.apply(Event::Responded);
        }
    }

    /// FAULT: repeat the failure record (with a beep) until reset, answering
    /// host lines in between.
    async fn fault_loop(&mut self, found: &[u8]) -> Result<()> {
        let record = discovery_failed(found);
        self.outputs.beep(3);
        self.reply(&record).await?;
        let mut next = Instant::now() + self.cfg.fault_repeat();

        loop {
            let b = match timeout_at(next, self.host_rx.read_u8()).await {
                Err(_) => {
                    self.outputs.beep(1);
                    self.reply(&record).await?;
                    next += self.cfg.fault_repeat();
                    continue;
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    info!("host link closed");
                    return Ok(());
                }
                Ok(r) => r.context("host link read")?,
            };

            let resp = match self.on_byte(b) {
                None => continue,
                Some(Ok(cmd)) => fault_response(&cmd, found, &mut self.outputs),
                Some(Err(e)) => e.to_response(),
            };
            self.reply(&resp).await?;
        }
    }

    /// Feeds one host byte. Returns a parsed command (or the reason there is
    /// none) once a line is complete.
    fn on_byte(&mut self, b: u8) -> Option<Result<Command, DispatchError>> {
        match self.lines.push(b) {
            Feed::Pending => None,
            Feed::Started => {
                self.apply(Event::LineStarted);
                None
            }
            Feed::Overflow => {
                self.apply(Event::LineDiscarded);
                Some(Err(DispatchError::Overflow))
            }
            Feed::Line(line) => {
                let text = String::from_utf8_lossy(&line);
                if text.trim().is_empty() {
                    self.apply(Event::LineDiscarded);
                    return None;
                }
                self.apply(Event::LineComplete);
                Some(Command::parse(&text).map_err(DispatchError::from))
            }
        }
    }

    async fn reply(&mut self, resp: &Response) -> Result<()> {
        let mut line = resp.to_line();
        line.push('\n');
        self.host_tx.write_all(line.as_bytes()).await.context("host link write")?;
        self.host_tx.flush().await.context("host link flush")?;
        Ok(())
    }
}
