pub mod discovery;
pub mod packet;
pub mod registry;
pub mod sim;
pub mod transport;

pub use discovery::{discover, DiscoveryConfig, DiscoveryError, DiscoveryResult, ProbeResult};
pub use packet::{CommandCode, FrameError, Packet};
pub use registry::{Axis, AxisLimits, AxisRegistry, LimitError, Reading, Role, Telemetry};
pub use transport::{open_serial, BusError, BusTransport};

/// Mechanical travel of an LX-series servo, degrees.
pub const SERVO_TRAVEL_DEG: i32 = 270;
/// Position units spanning [`SERVO_TRAVEL_DEG`].
pub const POSITION_MAX: i32 = 1000;

pub const SPEED_MIN: i32 = 1;
pub const SPEED_MAX: i32 = 100;

const TIME_SLOWEST_MS: i32 = 5000;
const TIME_FASTEST_MS: i32 = 100;

/// Degrees to servo position units, rounded to nearest.
pub fn angle_to_position(angle: i32) -> u16 {
    let a = angle.clamp(0, SERVO_TRAVEL_DEG);
    ((a * POSITION_MAX + SERVO_TRAVEL_DEG / 2) / SERVO_TRAVEL_DEG) as u16
}

/// Servo position units to degrees, rounded to nearest. Positions outside
/// 0..=1000 (the servo reports a signed value) are clamped first.
pub fn position_to_angle(position: i32) -> i32 {
    let p = position.clamp(0, POSITION_MAX);
    (p * SERVO_TRAVEL_DEG + POSITION_MAX / 2) / POSITION_MAX
}

/// Speed setting 1..=100 to MOVE_TIME_WRITE transit time. Higher is faster.
pub fn speed_to_time(speed: u8) -> u16 {
    let s = (speed as i32).clamp(SPEED_MIN, SPEED_MAX);
    let span = TIME_SLOWEST_MS - TIME_FASTEST_MS;
    (TIME_SLOWEST_MS - (s - SPEED_MIN) * span / (SPEED_MAX - SPEED_MIN)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_whole_angle_survives_the_position_scale() {
        for a in 0..=SERVO_TRAVEL_DEG {
            assert_eq!(position_to_angle(angle_to_position(a) as i32), a, "angle {a}");
        }
        assert_eq!(angle_to_position(135), 500);
        assert_eq!(angle_to_position(400), 1000);
        assert_eq!(position_to_angle(-12), 0);
    }

    #[test]
    fn speed_maps_inverted_onto_time() {
        assert_eq!(speed_to_time(1), 5000);
        assert_eq!(speed_to_time(100), 100);
        assert!(speed_to_time(50) < speed_to_time(49));
        assert_eq!(speed_to_time(0), 5000);
    }
}
