mod host;
mod logging;

use anyhow::{Context, Result, bail};
use clap::Parser;
use host::PassThrough;
use isobridge_engine::hw::config;
use isobridge_engine::hw::status::DeviceStatus;
use isobridge_engine::hw::usb::sim::{SimConfig, SimDevice, SimSource};
use isobridge_engine::{Bridge, ChannelRequest, HostLayout, HwOptions, Message, Settings};
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::Receiver;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "isobridge",
    version,
    about = "Run the USB isochronous bridge against a simulated interface and report its health."
)]
struct Args {
    /// Settings file (NrIns, NrOuts, NrSamples, FifoSize). Falls back to $ISOBRIDGE_SETTINGS.
    #[arg(long, value_name = "PATH")]
    settings: Option<PathBuf>,

    /// How long to stream
    #[arg(long, value_name = "SECONDS", default_value_t = 2.0)]
    seconds: f64,

    /// Feed transmitted frames back into the capture side
    #[arg(long, action = clap::ArgAction::SetTrue)]
    loopback: bool,

    /// Capture a sine tone at this frequency when nothing else is captured
    #[arg(long, value_name = "HZ")]
    tone: Option<f32>,

    /// Print the final status as JSON
    #[arg(long, action = clap::ArgAction::SetTrue)]
    json: bool,

    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(Debug, Serialize)]
struct Report {
    driver: &'static str,
    version: &'static str,
    sessions: usize,
    host_periods: u64,
    host_stale_periods: u64,
    input_peak_dbfs: Option<f64>,
    status: DeviceStatus,
}

fn load_settings(path: Option<PathBuf>) -> Result<Settings> {
    let path = path.or_else(config::settings_path);
    match path {
        Some(path) => Settings::load(&path)
            .with_context(|| format!("loading settings from {}", path.display())),
        None => Ok(Settings::default()),
    }
}

fn reset_requested(rx: &mut Receiver<Message>) -> bool {
    let mut reset = false;
    while let Ok(msg) = rx.try_recv() {
        match msg {
            Message::ResetRequest => reset = true,
            other => info!("device notification: {:?}", other),
        }
    }
    reset
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level)?;
    if !(args.seconds.is_finite() && args.seconds > 0.0) {
        bail!("--seconds must be positive");
    }

    let settings = load_settings(args.settings)?;
    let options = HwOptions::from_settings(&settings);
    let device = SimDevice::new(SimConfig {
        input_channels: options.input_channels,
        output_channels: options.output_channels,
        packet_frames: options.packet_frames,
        ..SimConfig::default()
    });
    device.set_recording(false);
    device.set_loopback(args.loopback);
    if let Some(hz) = args.tone {
        device.set_source(SimSource::Tone { hz });
    }
    let _clock = device.start_clock()?;

    let (notifier, mut rx) = isobridge_engine::init();
    let mut bridge = Bridge::new(Box::new(device.transport()), options, notifier);
    let mut process = PassThrough::default();
    let until = Instant::now() + Duration::from_secs_f64(args.seconds);
    let mut sessions = 0;

    while Instant::now() < until {
        bridge.open().context("opening bridge")?;
        sessions += 1;
        let (inputs, outputs) = bridge.channels()?;
        let requests: Vec<ChannelRequest> = (0..inputs)
            .map(ChannelRequest::input)
            .chain((0..outputs).map(ChannelRequest::output))
            .collect();
        let mut buffers = bridge.create_buffers(&requests, HostLayout::Planar)?;
        let gate = bridge.gate().context("bridge opened without a gate")?;
        bridge.start().context("starting bridge")?;
        info!(
            "streaming {} in / {} out, latency {:?}",
            inputs,
            outputs,
            bridge.latencies()?
        );

        let mut reset = false;
        host::run_periods(&gate, &mut buffers, &mut process, until, || {
            reset = reset_requested(&mut rx);
            !reset
        });
        if let Err(e) = bridge.stop(true) {
            warn!("stop: {}", e);
        }
        if !reset {
            break;
        }
        warn!("device requested a reset, reopening");
        bridge.close()?;
    }

    let report = Report {
        driver: bridge.driver_name(),
        version: bridge.driver_version(),
        sessions,
        host_periods: process.periods,
        host_stale_periods: process.stale,
        input_peak_dbfs: Some(process.peak_dbfs()).filter(|v| v.is_finite()),
        status: bridge.status(),
    };
    bridge.close()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let c = &report.status.counters;
        println!(
            "{} {}: {} Hz, period {} frames, {} in / {} out",
            report.driver,
            report.version,
            report.status.sample_rate,
            report.status.period_frames,
            report.status.input_channels,
            report.status.output_channels
        );
        println!(
            "host periods {} (stale {}), captured {}, skipped {}, padded {}",
            report.host_periods,
            report.host_stale_periods,
            c.captured_periods,
            c.skipped_exchanges,
            c.padded_periods
        );
        println!(
            "packets rx {} tx {}, malformed {}, overruns {} (output {}), underruns {}",
            c.rx_packets,
            c.tx_packets,
            c.malformed,
            c.overruns,
            c.output_overruns,
            c.underruns
        );
        if let Some(db) = report.input_peak_dbfs {
            println!("input peak {:.1} dBFS", db);
        }
    }
    Ok(())
}
