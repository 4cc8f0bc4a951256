use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use pt_firmware::{Controller, FirmwareConfig, LogOutputs};
use pt_proto::startup::is_discovery_failure;
use pt_proto::{Response, StartupInfo, Status};
use pt_servo::sim::SimBus;
use tokio::io::{
    duplex, split, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadBuf,
    ReadHalf, WriteHalf,
};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Bus stream whose next write never completes once `wedged` is set.
struct Wedge {
    inner: DuplexStream,
    wedged: Arc<AtomicBool>,
}

impl AsyncRead for Wedge {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Wedge {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if self.wedged.swap(false, Ordering::SeqCst) {
            return Poll::Pending;
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

struct Rig {
    rx: Lines<BufReader<ReadHalf<DuplexStream>>>,
    tx: WriteHalf<DuplexStream>,
    sim: SimBus,
    wedged: Arc<AtomicBool>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Rig {
    fn start(ids: &[u8]) -> Self {
        let sim = SimBus::with_ids(ids);
        let (bus_ours, bus_theirs) = duplex(256);
        sim.spawn(bus_theirs);
        let wedged = Arc::new(AtomicBool::new(false));
        let bus = Wedge { inner: bus_ours, wedged: wedged.clone() };

        let (fw_side, host_side) = duplex(4096);
        let (fw_rx, fw_tx) = split(fw_side);
        let (host_rx, host_tx) = split(host_side);

        let mut ctl = Controller::new(fw_rx, fw_tx, bus, LogOutputs::default(), FirmwareConfig::default());
        let task = tokio::spawn(async move { ctl.run().await });
        Rig { rx: BufReader::new(host_rx).lines(), tx: host_tx, sim, wedged, task }
    }

    async fn record(&mut self) -> Response {
        let line = self.rx.next_line().await.unwrap().expect("firmware hung up");
        Response::parse(&line).unwrap_or_else(|| panic!("not a record: {line}"))
    }

    async fn send(&mut self, line: &str) {
        self.tx.write_all(line.as_bytes()).await.unwrap();
        self.tx.write_all(b"\n").await.unwrap();
    }

    async fn ask(&mut self, line: &str) -> Response {
        self.send(line).await;
        self.record().await
    }

    async fn booted(&mut self) -> StartupInfo {
        let banner = self.record().await;
        assert_eq!(banner.status, Status::Info);
        let startup = self.record().await;
        StartupInfo::from_response(&startup).expect("startup record")
    }
}

fn int(r: &Response, key: &str) -> i64 {
    r.get_i64(key).unwrap_or_else(|| panic!("missing {key} in {}", r.to_line()))
}

#[tokio::test(start_paused = true)]
async fn boot_assigns_roles_and_parks_at_init() {
    let mut rig = Rig::start(&[1, 2]);
    let info = rig.booted().await;
    assert_eq!((info.pan_id, info.tilt_id), (1, 2));
    assert_eq!((info.pan.min, info.pan.max), (0, 270));
    assert_eq!((info.tilt.min, info.tilt.max), (15, 165));

    let pos = rig.ask("<POS>").await;
    assert!(pos.is_ok());
    assert_eq!((int(&pos, "pan"), int(&pos, "tilt")), (135, 90));
    assert_eq!(pos.get_bool("stale"), Some(false));
}

#[tokio::test(start_paused = true)]
async fn out_of_range_move_is_clamped() {
    let mut rig = Rig::start(&[1, 2]);
    rig.booted().await;

    let r = rig.ask("<MOVE:999,999>").await;
    assert_eq!(r.message(), Some("OK"));
    assert_eq!((int(&r, "pan"), int(&r, "tilt")), (270, 165));

    let pos = rig.ask("<POS>").await;
    assert_eq!((int(&pos, "pan"), int(&pos, "tilt")), (270, 165));

    let r = rig.ask("<MOVEBY:-300,-10>").await;
    assert_eq!((int(&r, "pan"), int(&r, "tilt")), (0, 155));
}

#[tokio::test(start_paused = true)]
async fn failed_aggregate_reports_nothing_partial() {
    let mut rig = Rig::start(&[1, 2]);
    rig.booted().await;

    rig.sim.update(2, |s| s.silent = true);
    let r = rig.ask("<STATUS>").await;
    assert_eq!(r.status, Status::Error);
    assert!(!r.has("pan"));
    assert!(!r.has("tilt"));
    let r = rig.ask("<VOLT>").await;
    assert_eq!(r.status, Status::Error);
    assert!(!r.has("pan_voltage_mv"));

    rig.sim.update(2, |s| s.silent = false);
    let r = rig.ask("<STATUS>").await;
    assert!(r.is_ok(), "{}", r.to_line());
    for key in ["pan", "tilt", "pan_voltage_mv", "pan_temp_c", "tilt_voltage_mv", "tilt_temp_c"] {
        assert!(r.has(key), "missing {key}");
    }
    assert_eq!(int(&r, "tilt_temp_c"), 35);
}

#[tokio::test(start_paused = true)]
async fn wedged_bus_trips_watchdog_and_rediscovers() {
    let mut rig = Rig::start(&[1, 2]);
    rig.booted().await;

    rig.wedged.store(true, Ordering::SeqCst);
    let sent = Instant::now();
    rig.send("<STATUS>").await;

    // no answer to STATUS; the next thing on the wire is a fresh boot
    let banner = rig.record().await;
    assert_eq!(banner.status, Status::Info, "{}", banner.to_line());
    assert!(sent.elapsed() >= Duration::from_secs(2));
    let startup = rig.record().await;
    let info = StartupInfo::from_response(&startup).expect("second startup record");
    assert_eq!((info.pan_id, info.tilt_id), (1, 2));

    let pos = rig.ask("<POS>").await;
    assert_eq!((int(&pos, "pan"), int(&pos, "tilt")), (135, 90));
}

#[tokio::test(start_paused = true)]
async fn single_servo_enters_fault_and_stays_there() {
    let mut rig = Rig::start(&[3]);
    assert_eq!(rig.record().await.status, Status::Info);
    let failure = rig.record().await;
    assert!(is_discovery_failure(&failure));
    assert_eq!(failure.fields.get("found_ids"), Some(&serde_json_value(&[3])));
    let entered = Instant::now();

    let r = rig.ask("<MOVE:10,10>").await;
    assert_eq!(r.message(), Some("Servo discovery failed; reset required"));
    let r = rig.ask("<POS>").await;
    assert_eq!(r.status, Status::Error);

    let r = rig.ask("<GETINFO>").await;
    assert!(is_discovery_failure(&r));
    assert!(r.has("firmware_version"));
    assert!(rig.ask("<BEEP>").await.is_ok());

    let again = rig.record().await;
    assert!(is_discovery_failure(&again));
    assert!(!again.has("firmware_version"));
    assert!(entered.elapsed() >= Duration::from_secs(2));
}

fn serde_json_value(ids: &[u8]) -> serde_json::Value {
    serde_json::Value::from(ids.to_vec())
}

#[tokio::test(start_paused = true)]
async fn overlong_line_is_rejected_once() {
    let mut rig = Rig::start(&[1, 2]);
    rig.booted().await;

    let long = "A".repeat(80);
    let r = rig.ask(&long).await;
    assert_eq!(r.message(), Some("Command too long"));
    // the tail of the long line produced nothing; the next record answers POS
    let pos = rig.ask("<POS>").await;
    assert!(pos.is_ok());
    assert!(pos.has("pan"));
}

#[tokio::test(start_paused = true)]
async fn bad_lines_get_specific_errors_without_bus_traffic() {
    let mut rig = Rig::start(&[1, 2]);
    rig.booted().await;
    // round trip so the parking moves have reached the bus
    assert!(rig.ask("<POS>").await.is_ok());
    let before = rig.sim.requests();

    assert_eq!(rig.ask("<SETSPEED:0>").await.message(), Some("Invalid speed (1-100)"));
    assert_eq!(rig.ask("<READANGLE:7>").await.message(), Some("Unknown servo id 7"));
    assert_eq!(rig.ask("<FLY:1,2>").await.message(), Some("Unknown command"));
    assert_eq!(rig.ask("<MOVE:1,x>").await.message(), Some("Invalid parameter"));
    assert_eq!(rig.ask("<CONFIGSERVO:254>").await.message(), Some("Invalid servo id (1-253)"));
    assert_eq!(rig.sim.requests(), before);

    let r = rig.ask("<getinfo>").await;
    assert_eq!(r.fields.get("firmware_version").and_then(|v| v.as_str()), Some("2.4.0"));
    assert_eq!(int(&r, "speed"), 50);
    let r = rig.ask("<SPEED:80>").await;
    assert_eq!(int(&r, "speed"), 80);
    let r = rig.ask("<READANGLE:2>").await;
    assert_eq!(int(&r, "angle"), 90);
}

#[tokio::test(start_paused = true)]
async fn closing_the_host_link_ends_the_run() {
    let mut rig = Rig::start(&[1, 2]);
    rig.booted().await;
    let Rig { rx, tx, task, .. } = rig;
    drop(tx);
    drop(rx);
    task.await.unwrap().unwrap();
}
