use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{info, warn};

use pt_firmware::{doctor as fw_doctor, Controller, FirmwareConfig, LogOutputs};
use pt_link::{doctor as link_doctor, ControllerLink, LinkConfig, LinkError};
use pt_servo::sim::SimBus;
use pt_servo::{discover, open_serial, BusTransport};
use pt_track::{doctor as track_doctor, ControlLoop, DetectorConfig, MarkerConfig, ReplayDetector, TargetingConfig};

#[derive(Debug, Parser)]
#[command(name = "pt2d", version, about = "PT2D - pan/tilt targeting controller and host")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Doctor,
    /// Run the motion controller on the configured serial ports.
    Firmware {
        /// Use an in-process simulated servo bus (ids 1 and 2).
        #[arg(long)]
        simulate: bool,
    },
    /// Run servo discovery once and print every probe.
    Probe {
        #[arg(long)]
        simulate: bool,
    },
    /// Run the targeting loop against the controller link.
    Track {
        /// Stop after this many cycles.
        #[arg(long)]
        cycles: Option<u64>,
    },
    /// Send one raw command line and print the record that answers it.
    Send { line: String },
    /// Handshake, then print axis info and link status.
    Info,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct Config {
    firmware: FirmwareConfig,
    link: LinkConfig,
    targeting: TargetingConfig,
    marker: MarkerConfig,
    detector: DetectorConfig,
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    toml::from_str(&s).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout may be the host link
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Firmware { simulate } => firmware(&cfg, simulate).await?,
        Command::Probe { simulate } => probe(&cfg, simulate).await?,
        Command::Track { cycles } => track(&cfg, cycles).await?,
        Command::Send { line } => send(&cfg, &line).await?,
        Command::Info => show_info(&cfg).await?,
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");
    fw_doctor::check_firmware(&cfg.firmware)?;

    link_doctor::check_link(&cfg.link, cfg.firmware.aggregate_timeout_ms, cfg.firmware.calibrate_settle_ms)?;
    if cfg.link.device.is_none() {
        warn!("doctor: link.device not set; track/send/info will not run");
    }

    track_doctor::check_targeting(&cfg.targeting)?;
    track_doctor::check_marker(&cfg.marker)?;
    track_doctor::check_detector(&cfg.detector)?;

    info!("doctor: OK");
    Ok(())
}

async fn firmware(cfg: &Config, simulate: bool) -> Result<()> {
    let fw = cfg.firmware.clone();
    match fw.host_device.clone() {
        Some(dev) => {
            let port = tokio_serial::new(&dev, fw.host_baud)
                .open_native_async()
                .with_context(|| format!("open host serial {}", dev))?;
            info!("host link: {} @ {}", dev, fw.host_baud);
            let (rx, tx) = tokio::io::split(port);
            run_controller(rx, tx, fw, simulate).await
        }
        None => {
            info!("host link: stdin/stdout");
            run_controller(tokio::io::stdin(), tokio::io::stdout(), fw, simulate).await
        }
    }
}

async fn run_controller<R, W>(rx: R, tx: W, fw: FirmwareConfig, simulate: bool) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    if simulate {
        let bus = simulated_bus();
        drive(Controller::new(rx, tx, bus, LogOutputs::default(), fw)).await
    } else {
        let bus = open_bus(&fw)?;
        drive(Controller::new(rx, tx, bus, LogOutputs::default(), fw)).await
    }
}

async fn drive<R, W, B>(mut ctl: Controller<R, W, B, LogOutputs>) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    tokio::select! {
        res = ctl.run() => res,
        _ = tokio::signal::ctrl_c() => {
            info!("firmware: interrupted");
            Ok(())
        }
    }
}

fn simulated_bus() -> DuplexStream {
    let sim = SimBus::with_ids(&[1, 2]);
    let (ours, theirs) = tokio::io::duplex(256);
    sim.spawn(theirs);
    info!("servo bus: simulated, ids 1 and 2");
    ours
}

fn open_bus(fw: &FirmwareConfig) -> Result<SerialStream> {
    let dev = fw.bus_device.as_deref().context("firmware.bus_device missing (or pass --simulate)")?;
    let port = open_serial(dev, fw.bus_baud).with_context(|| format!("open servo bus {}", dev))?;
    info!("servo bus: {} @ {}", dev, fw.bus_baud);
    Ok(port)
}

async fn probe(cfg: &Config, simulate: bool) -> Result<()> {
    let fw = &cfg.firmware;
    let res = if simulate {
        let mut bus = BusTransport::new(simulated_bus(), fw.exchange_timeout());
        discover(&mut bus, &fw.discovery()).await
    } else {
        let mut bus = BusTransport::new(open_bus(fw)?, fw.exchange_timeout());
        discover(&mut bus, &fw.discovery()).await
    };

    match res.roles() {
        Ok((pan, tilt)) => println!("CHOSEN: pan={} tilt={}", pan, tilt),
        Err(e) => println!("CHOSEN: none ({})", e),
    }
    for p in &res.probes {
        println!(
            "probe id={} attempts={} responded={} {}ms note={}",
            p.id, p.attempts, p.responded, p.elapsed_ms, p.note
        );
    }
    Ok(())
}

async fn track(cfg: &Config, cycles: Option<u64>) -> Result<()> {
    let path = cfg.detector.replay_path.as_deref().context("detector.replay_path missing")?;
    let detector = ReplayDetector::open(path, cfg.detector.loop_replay)?;
    let link = ControllerLink::open(&cfg.link)?;

    let mut lp = ControlLoop::new(link, detector, cfg.targeting.clone(), &cfg.marker);
    lp.start().await?;
    tokio::select! {
        res = lp.run(cycles) => res?,
        _ = tokio::signal::ctrl_c() => info!("track: interrupted"),
    }
    Ok(())
}

async fn connect(cfg: &Config) -> Result<ControllerLink<SerialStream>> {
    let mut link = ControllerLink::open(&cfg.link)?;
    match link.handshake().await {
        Ok(_) => {}
        // still worth talking to: GETINFO and STATUS report the fault
        Err(LinkError::DiscoveryFault { found }) => warn!("controller in FAULT (found ids {:?})", found),
        Err(e) => return Err(e).context("controller handshake"),
    }
    Ok(link)
}

async fn send(cfg: &Config, line: &str) -> Result<()> {
    let mut link = connect(cfg).await?;
    let rec = link.send_raw(line).await?;
    println!("{}", rec.to_line());
    Ok(())
}

async fn show_info(cfg: &Config) -> Result<()> {
    let mut link = connect(cfg).await?;
    let info = link.get_info().await?;
    println!("pan_id={} range={}..{}", info.pan_id, info.pan.min, info.pan.max);
    println!("tilt_id={} range={}..{}", info.tilt_id, info.tilt.min, info.tilt.max);

    let st = link.status();
    println!("connected={}", st.connected);
    println!("port={:?} baud={:?}", st.port, st.baud);
    println!("last_response_age={:?}", st.response_age());
    println!("last_error={:?}", st.last_error);
    Ok(())
}
