use std::time::Duration;

use pt_servo::sim::{SimBus, SimServo};
use pt_servo::{discover, AxisLimits, AxisRegistry, BusError, BusTransport, DiscoveryConfig, Role};
use tokio::io::{duplex, DuplexStream};

fn bus_with(sim: &SimBus) -> BusTransport<DuplexStream> {
    let (ours, theirs) = duplex(256);
    sim.spawn(theirs);
    BusTransport::new(ours, Duration::from_millis(100))
}

fn registry(pan: u8, tilt: u8) -> AxisRegistry {
    AxisRegistry::new(pan, tilt, AxisLimits::PAN, AxisLimits::TILT, 50)
}

#[tokio::test(start_paused = true)]
async fn discovery_assigns_pan_then_tilt_in_answer_order() {
    let sim = SimBus::with_ids(&[1, 2]);
    let mut bus = bus_with(&sim);
    let res = discover(&mut bus, &DiscoveryConfig::default()).await;
    assert_eq!(res.roles(), Ok((1, 2)));
    // stops once two servos answered
    assert_eq!(res.probes.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn discovery_result_does_not_depend_on_retries() {
    let mut slow = SimServo::new(2);
    slow.drop_requests = 2;
    let sim = SimBus::new(vec![slow, SimServo::new(4)]);
    let mut bus = bus_with(&sim);
    let res = discover(&mut bus, &DiscoveryConfig::default()).await;
    assert_eq!(res.roles(), Ok((2, 4)));

    let probe2 = res.probes.iter().find(|p| p.id == 2).unwrap();
    assert_eq!(probe2.attempts, 3);
    assert!(probe2.responded);
    assert!(!res.probes.iter().find(|p| p.id == 1).unwrap().responded);
}

#[tokio::test(start_paused = true)]
async fn discovery_with_one_servo_cannot_assign_roles() {
    let sim = SimBus::with_ids(&[3]);
    let mut bus = bus_with(&sim);
    let res = discover(&mut bus, &DiscoveryConfig::default()).await;
    assert_eq!(res.responders, vec![3]);
    assert!(res.roles().is_err());
    assert_eq!(res.probes.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn out_of_range_writes_are_clamped_and_cached() {
    let sim = SimBus::with_ids(&[1, 2]);
    let mut bus = bus_with(&sim);
    let mut reg = registry(1, 2);

    assert_eq!(reg.write_angle(&mut bus, Role::Pan, 999).await.unwrap(), 270);
    assert_eq!(reg.write_angle(&mut bus, Role::Tilt, 999).await.unwrap(), 165);
    assert_eq!(reg.write_angle(&mut bus, Role::Tilt, -40).await.unwrap(), 15);
    assert_eq!(reg.axis(Role::Pan).cached_angle(), 270);
    assert_eq!(reg.axis(Role::Tilt).cached_angle(), 15);

    let r = reg.read_position(&mut bus, Role::Pan).await;
    assert_eq!((r.angle, r.stale), (270, false));
    assert_eq!(sim.servo(1).unwrap().position, 1000);
}

#[tokio::test(start_paused = true)]
async fn failed_read_falls_back_to_cache() {
    let sim = SimBus::with_ids(&[1, 2]);
    let mut bus = bus_with(&sim);
    let mut reg = registry(1, 2);
    reg.write_angle(&mut bus, Role::Tilt, 120).await.unwrap();

    sim.update(2, |s| s.silent = true);
    let r = reg.read_position(&mut bus, Role::Tilt).await;
    assert_eq!((r.angle, r.stale), (120, true));
}

#[tokio::test(start_paused = true)]
async fn corrupted_reply_never_reaches_the_cache() {
    let sim = SimBus::with_ids(&[1, 2]);
    let mut bus = bus_with(&sim);
    let mut reg = registry(1, 2);

    sim.update(1, |s| {
        s.position = 100;
        s.corrupt_replies = 1;
    });
    let err = reg.read_angle(&mut bus, Role::Pan, Duration::from_millis(100)).await.unwrap_err();
    assert!(matches!(err, BusError::Checksum { .. }));
    assert_eq!(reg.axis(Role::Pan).cached_angle(), 135);

    // next exchange is clean again
    assert_eq!(reg.read_angle(&mut bus, Role::Pan, Duration::from_millis(100)).await.unwrap(), 27);
}

#[tokio::test(start_paused = true)]
async fn local_echo_is_skipped() {
    let sim = SimBus::with_ids(&[1, 2]);
    sim.set_echo(true);
    let mut bus = bus_with(&sim);
    let mut reg = registry(1, 2);

    let t = reg.read_telemetry(&mut bus, Role::Tilt, Duration::from_millis(100)).await.unwrap();
    assert_eq!((t.voltage_mv, t.temperature_c), (7400, 35));
    assert_eq!(reg.axis(Role::Tilt).telemetry(), Some(t));

    // moves echo too; the leftover echo is drained before the next read
    reg.write_angle(&mut bus, Role::Pan, 200).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let r = reg.read_position(&mut bus, Role::Pan).await;
    assert_eq!((r.angle, r.stale), (200, false));
}

#[tokio::test(start_paused = true)]
async fn broadcast_id_write_renumbers_a_lone_servo() {
    let sim = SimBus::with_ids(&[1]);
    let mut bus = bus_with(&sim);
    pt_servo::discovery::assign_id(&mut bus, 9).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(sim.servo(9).is_some());
    assert!(sim.servo(1).is_none());
}
