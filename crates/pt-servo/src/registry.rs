use std::fmt;
use std::time::Duration;

use pt_proto::AngleBounds;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::packet::{CommandCode, Packet};
use crate::transport::{BusError, BusTransport};
use crate::{angle_to_position, position_to_angle, speed_to_time, SPEED_MAX, SPEED_MIN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Pan,
    Tilt,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Pan, Role::Tilt];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Pan => "pan",
            Role::Tilt => "tilt",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-axis travel limits and park angle, degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct AxisLimits {
    pub min: i32,
    pub max: i32,
    pub init: i32,
}

impl AxisLimits {
    pub const PAN: AxisLimits = AxisLimits { min: 0, max: 270, init: 135 };
    pub const TILT: AxisLimits = AxisLimits { min: 15, max: 165, init: 90 };

    pub fn bounds(&self) -> AngleBounds {
        AngleBounds { min: self.min, max: self.max }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Telemetry {
    pub voltage_mv: u16,
    pub temperature_c: u8,
}

/// Result of a lenient position read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading {
    pub angle: i32,
    /// The read failed and `angle` is the cached value.
    pub stale: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LimitError {
    #[error("speed {0} outside 1..=100")]
    Speed(i32),
    #[error("unknown axis id {0}")]
    UnknownAxis(i32),
}

#[derive(Debug, Clone)]
pub struct Axis {
    pub id: u8,
    pub role: Role,
    pub limits: AxisLimits,
    cached_angle: i32,
    telemetry: Option<Telemetry>,
}

impl Axis {
    fn new(id: u8, role: Role, limits: AxisLimits) -> Self {
        let cached_angle = limits.bounds().clamp(limits.init);
        Self { id, role, limits, cached_angle, telemetry: None }
    }

    /// Last commanded or read-back angle, always within the axis bounds.
    pub fn cached_angle(&self) -> i32 {
        self.cached_angle
    }

    pub fn telemetry(&self) -> Option<Telemetry> {
        self.telemetry
    }

    fn remember_angle(&mut self, angle: i32) -> i32 {
        self.cached_angle = self.limits.bounds().clamp(angle);
        self.cached_angle
    }
}

/// Sole owner of the per-axis cache. All bus traffic that touches axis state
/// goes through here.
#[derive(Debug, Clone)]
pub struct AxisRegistry {
    pan: Axis,
    tilt: Axis,
    speed: u8,
}

impl AxisRegistry {
    pub fn new(pan_id: u8, tilt_id: u8, pan: AxisLimits, tilt: AxisLimits, speed: u8) -> Self {
        Self {
            pan: Axis::new(pan_id, Role::Pan, pan),
            tilt: Axis::new(tilt_id, Role::Tilt, tilt),
            speed: speed.clamp(SPEED_MIN as u8, SPEED_MAX as u8),
        }
    }

    pub fn axis(&self, role: Role) -> &Axis {
        match role {
            Role::Pan => &self.pan,
            Role::Tilt => &self.tilt,
        }
    }

    fn axis_mut(&mut self, role: Role) -> &mut Axis {
        match role {
            Role::Pan => &mut self.pan,
            Role::Tilt => &mut self.tilt,
        }
    }

    pub fn role_of(&self, id: i32) -> Result<Role, LimitError> {
        Role::ALL
            .into_iter()
            .find(|r| i32::from(self.axis(*r).id) == id)
            .ok_or(LimitError::UnknownAxis(id))
    }

    pub fn speed(&self) -> u8 {
        self.speed
    }

    pub fn set_speed(&mut self, speed: i32) -> Result<u8, LimitError> {
        if !(SPEED_MIN..=SPEED_MAX).contains(&speed) {
            return Err(LimitError::Speed(speed));
        }
        self.speed = speed as u8;
        Ok(self.speed)
    }

    /// Clamps `angle` to the axis bounds and commands it at the current speed.
    /// The cache only moves once the frame is on the wire.
    pub async fn write_angle<S>(&mut self, bus: &mut BusTransport<S>, role: Role, angle: i32) -> Result<i32, BusError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let axis = self.axis(role);
        let target = axis.limits.bounds().clamp(angle);
        if target != angle {
            debug!(axis = %role, requested = angle, clamped = target, "angle clamped");
        }
        let packet = Packet::move_time_write(axis.id, angle_to_position(target), speed_to_time(self.speed));
        bus.send(&packet).await?;
        Ok(self.axis_mut(role).remember_angle(target))
    }

    pub async fn home<S>(&mut self, bus: &mut BusTransport<S>) -> Result<(i32, i32), BusError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (pan_init, tilt_init) = (self.pan.limits.init, self.tilt.limits.init);
        let pan = self.write_angle(bus, Role::Pan, pan_init).await?;
        let tilt = self.write_angle(bus, Role::Tilt, tilt_init).await?;
        Ok((pan, tilt))
    }

    pub async fn stop<S>(&mut self, bus: &mut BusTransport<S>) -> Result<(), BusError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        for role in Role::ALL {
            bus.send(&Packet::stop(self.axis(role).id)).await?;
        }
        Ok(())
    }

    /// Strict position read bounded by `wait`; refreshes the cache on success.
    pub async fn read_angle<S>(&mut self, bus: &mut BusTransport<S>, role: Role, wait: Duration) -> Result<i32, BusError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let reply = bus.send_and_receive(&Packet::read(self.axis(role).id, CommandCode::PosRead), wait).await?;
        let raw = reply.u16_param(0).ok_or(BusError::ShortReply(CommandCode::PosRead))?;
        let angle = position_to_angle(i32::from(raw as i16));
        Ok(self.axis_mut(role).remember_angle(angle))
    }

    /// Fresh angle if the servo answers in time, otherwise the cached one flagged stale.
    pub async fn read_position<S>(&mut self, bus: &mut BusTransport<S>, role: Role) -> Reading
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let wait = bus.exchange_timeout();
        match self.read_angle(bus, role, wait).await {
            Ok(angle) => Reading { angle, stale: false },
            Err(e) => {
                warn!(axis = %role, err = %e, "position read failed; using cached angle");
                Reading { angle: self.axis(role).cached_angle, stale: true }
            }
        }
    }

    pub async fn read_voltage<S>(&mut self, bus: &mut BusTransport<S>, role: Role, wait: Duration) -> Result<u16, BusError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let reply = bus.send_and_receive(&Packet::read(self.axis(role).id, CommandCode::VoltageRead), wait).await?;
        let mv = reply.u16_param(0).ok_or(BusError::ShortReply(CommandCode::VoltageRead))?;
        let axis = self.axis_mut(role);
        axis.telemetry.get_or_insert_with(Telemetry::default).voltage_mv = mv;
        Ok(mv)
    }

    pub async fn read_temperature<S>(&mut self, bus: &mut BusTransport<S>, role: Role, wait: Duration) -> Result<u8, BusError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let reply = bus.send_and_receive(&Packet::read(self.axis(role).id, CommandCode::TempRead), wait).await?;
        let c = *reply.params.first().ok_or(BusError::ShortReply(CommandCode::TempRead))?;
        let axis = self.axis_mut(role);
        axis.telemetry.get_or_insert_with(Telemetry::default).temperature_c = c;
        Ok(c)
    }

    pub async fn read_telemetry<S>(&mut self, bus: &mut BusTransport<S>, role: Role, wait: Duration) -> Result<Telemetry, BusError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let voltage_mv = self.read_voltage(bus, role, wait).await?;
        let temperature_c = self.read_temperature(bus, role, wait).await?;
        Ok(Telemetry { voltage_mv, temperature_c })
    }
}
