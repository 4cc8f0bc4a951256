use std::time::Duration;

use pt_proto::startup::discovery_failed;
use pt_proto::{Command, ParseError, Response, StartupInfo, FIRMWARE_VERSION};
use pt_servo::discovery::assign_id;
use pt_servo::{AxisRegistry, BusError, BusTransport, LimitError, Role};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::outputs::Outputs;
use crate::watchdog::Heartbeat;

pub const SERVO_ID_MIN: i32 = 1;
pub const SERVO_ID_MAX: i32 = 253;

/// Pause after each calibration pose.
pub const CALIBRATE_SETTLE: Duration = Duration::from_millis(2500);

/// Everything that turns a host line into an `ERROR` record.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Command too long")]
    Overflow,
    #[error(transparent)]
    Malformed(#[from] ParseError),
    #[error("Invalid speed (1-100)")]
    Speed(i32),
    #[error("Unknown servo id {0}")]
    UnknownAxis(i32),
    #[error("Invalid servo id (1-253)")]
    ServoId(i32),
    #[error("Aggregate command timeout")]
    AggregateTimeout,
    #[error("Servo bus error: {0}")]
    Bus(#[from] BusError),
    #[error("Servo bus error: tilt not moved, pan moved to {pan}: {source}")]
    HalfMove { pan: i32, source: BusError },
    #[error("Servo discovery failed; reset required")]
    Fault,
}

impl From<LimitError> for DispatchError {
    fn from(e: LimitError) -> Self {
        match e {
            LimitError::Speed(v) => DispatchError::Speed(v),
            LimitError::UnknownAxis(id) => DispatchError::UnknownAxis(id),
        }
    }
}

impl DispatchError {
    pub fn to_response(&self) -> Response {
        Response::error(self.to_string())
    }
}

/// Verbs that read more than one metric under a single deadline.
pub fn is_aggregate(cmd: &Command) -> bool {
    matches!(cmd, Command::Status | Command::Temp | Command::Volt)
}

/// One deadline shared by every sub-read of an aggregate.
struct Deadline {
    at: Instant,
    per_read: Duration,
}

impl Deadline {
    fn start(total: Duration, per_read: Duration) -> Self {
        Self { at: Instant::now() + total, per_read }
    }

    /// Wait allowed for the next sub-read.
    fn budget(&self) -> Result<Duration, DispatchError> {
        let left = self.at.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(DispatchError::AggregateTimeout);
        }
        Ok(left.min(self.per_read))
    }

    fn fail(&self, e: BusError) -> DispatchError {
        if Instant::now() >= self.at {
            DispatchError::AggregateTimeout
        } else {
            DispatchError::Bus(e)
        }
    }
}

/// Handlers for READY. Owns the axis registry for the lifetime of one boot.
pub struct Dispatcher {
    registry: AxisRegistry,
    info: StartupInfo,
    aggregate_timeout: Duration,
    calibrate_settle: Duration,
    keep_alive: Option<(Heartbeat, Duration)>,
}

impl Dispatcher {
    pub fn new(registry: AxisRegistry, aggregate_timeout: Duration) -> Self {
        let pan = registry.axis(Role::Pan);
        let tilt = registry.axis(Role::Tilt);
        let info = StartupInfo {
            pan_id: pan.id,
            tilt_id: tilt.id,
            pan: pan.limits.bounds(),
            tilt: tilt.limits.bounds(),
        };
        Self { registry, info, aggregate_timeout, calibrate_settle: CALIBRATE_SETTLE, keep_alive: None }
    }

    pub fn with_calibrate_settle(mut self, settle: Duration) -> Self {
        self.calibrate_settle = settle;
        self
    }

    /// Pets `heartbeat` at least every `every` during long handlers.
    pub fn keep_alive(&mut self, heartbeat: Heartbeat, every: Duration) {
        self.keep_alive = Some((heartbeat, every));
    }

    pub fn info(&self) -> &StartupInfo {
        &self.info
    }

    pub fn registry(&self) -> &AxisRegistry {
        &self.registry
    }

    /// Runs one command to completion. Always yields exactly one record.
    pub async fn dispatch<S, O>(&mut self, cmd: Command, bus: &mut BusTransport<S>, outputs: &mut O) -> Response
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
        O: Outputs,
    {
        match self.handle(cmd, bus, outputs).await {
            Ok(r) => r,
            Err(e) => {
                warn!(verb = cmd.verb(), err = %e, "command failed");
                e.to_response()
            }
        }
    }

    async fn handle<S, O>(&mut self, cmd: Command, bus: &mut BusTransport<S>, outputs: &mut O) -> Result<Response, DispatchError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
        O: Outputs,
    {
        debug!(%cmd, "dispatch");
        match cmd {
            Command::Move { pan, tilt } => self.move_to(bus, pan, tilt).await,
            Command::MoveBy { pan, tilt } => {
                let p = self.registry.axis(Role::Pan).cached_angle().saturating_add(pan);
                let t = self.registry.axis(Role::Tilt).cached_angle().saturating_add(tilt);
                self.move_to(bus, p, t).await
            }
            Command::Stop => {
                self.registry.stop(bus).await?;
                Ok(Response::ok_message("OK"))
            }
            Command::Home => {
                let pan = self.registry.axis(Role::Pan).limits.init;
                let tilt = self.registry.axis(Role::Tilt).limits.init;
                self.move_to(bus, pan, tilt).await
            }
            Command::SetSpeed(v) => {
                let speed = self.registry.set_speed(v)?;
                Ok(Response::ok_message("OK").with("speed", speed))
            }
            Command::Pos => {
                let pan = self.registry.read_position(bus, Role::Pan).await;
                let tilt = self.registry.read_position(bus, Role::Tilt).await;
                Ok(Response::ok()
                    .with("pan", pan.angle)
                    .with("tilt", tilt.angle)
                    .with("stale", pan.stale || tilt.stale))
            }
            Command::Status => self.status(bus).await,
            Command::Temp => self.temperatures(bus).await,
            Command::Volt => self.voltages(bus).await,
            Command::ReadAngle(id) => {
                let role = self.registry.role_of(id)?;
                let r = self.registry.read_position(bus, role).await;
                Ok(Response::ok().with("id", id).with("angle", r.angle).with("stale", r.stale))
            }
            Command::ReadVoltTemp(id) => {
                let role = self.registry.role_of(id)?;
                let wait = bus.exchange_timeout();
                let t = self.registry.read_telemetry(bus, role, wait).await?;
                Ok(Response::ok()
                    .with("id", id)
                    .with("voltage_mv", t.voltage_mv)
                    .with("temp_c", t.temperature_c))
            }
            Command::GetInfo => Ok(self
                .info
                .to_response("OK")
                .with("firmware_version", FIRMWARE_VERSION)
                .with("speed", self.registry.speed())),
            Command::Laser(on) => {
                outputs.laser(on);
                Ok(Response::ok_message("OK").with("laser", on))
            }
            Command::Led(on) => {
                outputs.led(on);
                Ok(Response::ok_message("OK").with("led", on))
            }
            Command::Beep => {
                outputs.beep(1);
                Ok(Response::ok_message("OK"))
            }
            Command::Calibrate => self.calibrate(bus).await,
            Command::ConfigServo(id) => {
                if !(SERVO_ID_MIN..=SERVO_ID_MAX).contains(&id) {
                    return Err(DispatchError::ServoId(id));
                }
                assign_id(bus, id as u8).await?;
                info!("servo id {} written; discovery picks it up after reset", id);
                Ok(Response::ok_message("Servo id written; reset to rediscover").with("id", id))
            }
        }
    }

    async fn move_to<S>(&mut self, bus: &mut BusTransport<S>, pan: i32, tilt: i32) -> Result<Response, DispatchError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let pan = self.registry.write_angle(bus, Role::Pan, pan).await?;
        let tilt = match self.registry.write_angle(bus, Role::Tilt, tilt).await {
            Ok(t) => t,
            Err(source) => {
                warn!(pan, err = %source, "move half-applied: pan sent, tilt write failed");
                return Err(DispatchError::HalfMove { pan, source });
            }
        };
        Ok(Response::ok_message("OK").with("pan", pan).with("tilt", tilt))
    }

    /// Centre, pan min, pan max, tilt min, tilt max, then back to the park
    /// angles. Every pose goes through the registry, so it is clamped and
    /// cached like any other move.
    async fn calibrate<S>(&mut self, bus: &mut BusTransport<S>) -> Result<Response, DispatchError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let pan = self.registry.axis(Role::Pan).limits;
        let tilt = self.registry.axis(Role::Tilt).limits;
        info!("calibration sweep");

        self.move_to(bus, pan.init, tilt.init).await?;
        self.settle().await;
        for (role, angle) in [(Role::Pan, pan.min), (Role::Pan, pan.max), (Role::Tilt, tilt.min), (Role::Tilt, tilt.max)] {
            self.registry.write_angle(bus, role, angle).await?;
            self.settle().await;
        }
        let resp = self.move_to(bus, pan.init, tilt.init).await?;
        info!("calibration done");
        Ok(resp)
    }

    async fn settle(&self) {
        let end = Instant::now() + self.calibrate_settle;
        loop {
            if let Some((heartbeat, _)) = &self.keep_alive {
                heartbeat.pet();
            }
            let left = end.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return;
            }
            let nap = self.keep_alive.as_ref().map_or(left, |(_, every)| left.min(*every));
            sleep(nap).await;
        }
    }

    /// Both angles, then voltage and temperature of each axis. Nothing is
    /// reported unless all six reads succeed before the deadline.
    async fn status<S>(&mut self, bus: &mut BusTransport<S>) -> Result<Response, DispatchError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let d = Deadline::start(self.aggregate_timeout, bus.exchange_timeout());
        let reg = &mut self.registry;

        let pan = reg.read_angle(bus, Role::Pan, d.budget()?).await.map_err(|e| d.fail(e))?;
        let tilt = reg.read_angle(bus, Role::Tilt, d.budget()?).await.map_err(|e| d.fail(e))?;
        let pan_mv = reg.read_voltage(bus, Role::Pan, d.budget()?).await.map_err(|e| d.fail(e))?;
        let pan_c = reg.read_temperature(bus, Role::Pan, d.budget()?).await.map_err(|e| d.fail(e))?;
        let tilt_mv = reg.read_voltage(bus, Role::Tilt, d.budget()?).await.map_err(|e| d.fail(e))?;
        let tilt_c = reg.read_temperature(bus, Role::Tilt, d.budget()?).await.map_err(|e| d.fail(e))?;

        Ok(Response::ok()
            .with("pan", pan)
            .with("tilt", tilt)
            .with("pan_voltage_mv", pan_mv)
            .with("pan_temp_c", pan_c)
            .with("tilt_voltage_mv", tilt_mv)
            .with("tilt_temp_c", tilt_c)
            .with("speed", reg.speed()))
    }

    async fn temperatures<S>(&mut self, bus: &mut BusTransport<S>) -> Result<Response, DispatchError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let d = Deadline::start(self.aggregate_timeout, bus.exchange_timeout());
        let reg = &mut self.registry;
        let pan = reg.read_temperature(bus, Role::Pan, d.budget()?).await.map_err(|e| d.fail(e))?;
        let tilt = reg.read_temperature(bus, Role::Tilt, d.budget()?).await.map_err(|e| d.fail(e))?;
        Ok(Response::ok().with("pan_temp_c", pan).with("tilt_temp_c", tilt))
    }

    async fn voltages<S>(&mut self, bus: &mut BusTransport<S>) -> Result<Response, DispatchError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let d = Deadline::start(self.aggregate_timeout, bus.exchange_timeout());
        let reg = &mut self.registry;
        let pan = reg.read_voltage(bus, Role::Pan, d.budget()?).await.map_err(|e| d.fail(e))?;
        let tilt = reg.read_voltage(bus, Role::Tilt, d.budget()?).await.map_err(|e| d.fail(e))?;
        Ok(Response::ok().with("pan_voltage_mv", pan).with("tilt_voltage_mv", tilt))
    }
}

/// Answer for a controller stuck in FAULT. Only `GETINFO`, `STATUS` and
/// `BEEP` get anything but the fixed rejection.
pub fn fault_response<O: Outputs>(cmd: &Command, found: &[u8], outputs: &mut O) -> Response {
    if !cmd.answered_in_fault() {
        return DispatchError::Fault.to_response();
    }
    match cmd {
        Command::Beep => {
            outputs.beep(1);
            Response::ok_message("OK")
        }
        Command::GetInfo => discovery_failed(found).with("firmware_version", FIRMWARE_VERSION),
        _ => discovery_failed(found).with("state", "FAULT"),
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};

    use pt_servo::{position_to_angle, AxisLimits, CommandCode, Packet};
    use tokio::io::ReadBuf;

    use super::*;
    use crate::outputs::LogOutputs;
    use crate::watchdog::{Watchdog, WatchdogExit};

    /// Write-only servo bus: keeps every byte written and fails once the
    /// allowed number of writes is used up. Never answers.
    #[derive(Clone, Default)]
    struct WriteLog {
        bytes: Arc<Mutex<Vec<u8>>>,
        writes_left: Option<usize>,
    }

    impl WriteLog {
        fn moves(&self) -> Vec<(u8, i32)> {
            let bytes = self.bytes.lock().unwrap();
            bytes
                .chunks(10)
                .map(|f| Packet::decode(f).unwrap())
                .filter(|p| p.command == CommandCode::MoveTimeWrite)
                .map(|p| (p.id, position_to_angle(i32::from(p.u16_param(0).unwrap()))))
                .collect()
        }
    }

    impl AsyncRead for WriteLog {
        fn poll_read(self: Pin<&mut Self>, _: &mut Context<'_>, _: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for WriteLog {
        fn poll_write(mut self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            match self.writes_left {
                Some(0) => return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
                Some(n) => self.writes_left = Some(n - 1),
                None => {}
            }
            self.bytes.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(AxisRegistry::new(1, 2, AxisLimits::PAN, AxisLimits::TILT, 50), Duration::from_millis(2000))
    }

    #[tokio::test]
    async fn led_follows_the_command() {
        let mut d = dispatcher();
        let mut bus = BusTransport::new(WriteLog::default(), Duration::from_millis(100));
        let mut out = LogOutputs::default();

        let r = d.dispatch(Command::Led(true), &mut bus, &mut out).await;
        assert!(r.is_ok());
        assert_eq!(r.get_bool("led"), Some(true));
        assert!(out.led_on);

        d.dispatch(Command::parse("<led:off>").unwrap(), &mut bus, &mut out).await;
        assert!(!out.led_on);
        assert!(!out.laser_on);
    }

    #[tokio::test(start_paused = true)]
    async fn calibration_sweeps_limits_and_parks() {
        let log = WriteLog::default();
        let mut bus = BusTransport::new(log.clone(), Duration::from_millis(100));
        let mut d = dispatcher();
        let (heartbeat, mut dog) = Watchdog::arm(Duration::from_millis(2000));
        d.keep_alive(heartbeat, Duration::from_millis(500));

        let started = Instant::now();
        let r = d.dispatch(Command::Calibrate, &mut bus, &mut LogOutputs::default()).await;
        assert!(r.is_ok());
        assert_eq!((r.get_i64("pan"), r.get_i64("tilt")), (Some(135), Some(90)));
        assert!(started.elapsed() >= CALIBRATE_SETTLE * 5);

        assert_eq!(
            log.moves(),
            vec![(1, 135), (2, 90), (1, 0), (1, 270), (2, 15), (2, 165), (1, 135), (2, 90)]
        );
        assert_eq!(d.registry().axis(Role::Tilt).cached_angle(), 90);
        // the sweep outlasts the watchdog period; the pets kept it alive
        assert!(tokio::time::timeout(Duration::ZERO, dog.expired()).await.is_err());
        drop(d);
        assert_eq!(dog.expired().await, WatchdogExit::Released);
    }

    #[tokio::test]
    async fn failed_tilt_write_reports_the_pan_that_moved() {
        let log = WriteLog { writes_left: Some(1), ..WriteLog::default() };
        let mut bus = BusTransport::new(log.clone(), Duration::from_millis(100));
        let mut d = dispatcher();

        let r = d.dispatch(Command::Move { pan: 200, tilt: 100 }, &mut bus, &mut LogOutputs::default()).await;
        assert!(!r.is_ok());
        assert!(r.message().unwrap().starts_with("Servo bus error: tilt not moved, pan moved to 200"));
        assert_eq!(log.moves(), vec![(1, 200)]);
        assert_eq!(d.registry().axis(Role::Pan).cached_angle(), 200);
        assert_eq!(d.registry().axis(Role::Tilt).cached_angle(), 90);
    }

    #[test]
    fn fault_rejects_motion_but_answers_queries() {
        let mut out = LogOutputs::default();
        let r = fault_response(&Command::Move { pan: 1, tilt: 1 }, &[3], &mut out);
        assert_eq!(r.message(), Some("Servo discovery failed; reset required"));
        let r = fault_response(&Command::Calibrate, &[3], &mut out);
        assert_eq!(r.message(), Some("Servo discovery failed; reset required"));

        let r = fault_response(&Command::GetInfo, &[3], &mut out);
        assert!(!r.is_ok());
        assert_eq!(r.fields.get("firmware_version").and_then(|v| v.as_str()), Some(FIRMWARE_VERSION));

        let r = fault_response(&Command::Beep, &[3], &mut out);
        assert!(r.is_ok());
        assert_eq!(out.beeps, 1);
    }

    #[test]
    fn parse_failures_keep_their_wording() {
        let e: DispatchError = Command::parse("<FLY>").unwrap_err().into();
        assert_eq!(e.to_response().to_line(), r#"{"status":"error","message":"Unknown command"}"#);
        assert_eq!(DispatchError::from(LimitError::Speed(0)).to_string(), "Invalid speed (1-100)");
    }
}
