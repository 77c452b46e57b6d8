//! Headless runner
//!
//! Connects to the rig, logs one session and drains the live-plot queues
//! into the trace log until Ctrl-C or the end of a replayed capture.
//!
//! ```bash
//! drumlink --transport serial --source /dev/ttyUSB0
//! drumlink --transport replay --source captures/run3.bin --config rig.yaml
//! ```

use std::path::PathBuf;
#[cfg(feature = "serial")]
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use tracing_subscriber::EnvFilter;

use drumlink::PipelineConfig;
use drumlink::codec::PacketCodec;
use drumlink::detector::DerivativeEventDetector;
use drumlink::logger::next_session_dir;
use drumlink::queue::QueueReader;
use drumlink::router::SampleRouter;
#[cfg(feature = "serial")]
use drumlink::snapshot::Publishers;
use drumlink::snapshot::external_state;
use drumlink::stream::DrainExt;
use drumlink::supervisor::ConnectionSupervisor;
use drumlink::transport::{DeviceTarget, ReplayTransport, Transport};
use drumlink::types::Framing;

const HEARTBEAT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    /// Bluetooth LE notifications
    Ble,
    /// USB serial bridge
    Serial,
    /// Recorded binary capture
    Replay,
}

impl TransportKind {
    /// BLE when compiled in, then serial, then replay.
    const fn preferred() -> Self {
        if cfg!(feature = "ble") {
            TransportKind::Ble
        } else if cfg!(feature = "serial") {
            TransportKind::Serial
        } else {
            TransportKind::Replay
        }
    }
}

#[derive(Parser)]
#[command(name = "drumlink")]
#[command(about = "Drum rig telemetry ingestion and session logging", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Link to ingest from; defaults to the preferred compiled-in transport
    #[arg(long, value_enum, default_value_t = TransportKind::preferred())]
    transport: TransportKind,

    /// Device address, serial port or capture file; skips discovery
    #[arg(long)]
    source: Option<String>,

    /// Parent directory for session folders (overrides `log.base_dir`)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Stream without writing a session log
    #[arg(long)]
    no_log: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = &cli.log_dir {
        config.log.base_dir = dir.clone();
    }
    if let Some(source) = &cli.source {
        config.device.target = DeviceTarget::Address(source.clone());
    }

    let layout = config.layout()?;
    let framing = match cli.transport {
        TransportKind::Serial => Framing::Text,
        TransportKind::Replay => Framing::Binary,
        TransportKind::Ble => config.packet.framing,
    };
    let codec = PacketCodec::new(layout.clone(), framing);

    let (publishers, snapshots) = external_state();
    let detector = DerivativeEventDetector::new(
        config.detector_channels(&layout),
        config.calibration,
        config.detector.dt,
        config.detector.threshold,
    );
    let mut router =
        SampleRouter::new(&layout, config.calibration, detector, config.log.columns, snapshots);

    let plots: Vec<(String, QueueReader<f64>)> = config
        .plot
        .channels
        .iter()
        .map(|channel| (channel.clone(), router.plot_queue(channel.clone(), config.plot.queue_capacity)))
        .collect();

    if config.log.enabled && !cli.no_log {
        let dir = next_session_dir(&config.log.base_dir)?;
        info!("Logging session to {}", dir.display());
        router.session_control().begin_in(dir)?;
    }

    match cli.transport {
        TransportKind::Replay => {
            let DeviceTarget::Address(path) = &config.device.target else {
                bail!("--source <capture file> is required for replay");
            };
            let transport = ReplayTransport::open(path, layout.frame_len())
                .with_rate(config.replay.rate_hz)
                .with_speed(config.replay.speed);
            supervise(transport, codec, router, plots, publishers, &config).await
        }
        #[cfg(feature = "serial")]
        TransportKind::Serial => {
            let Publishers { motor, vision, frame } = publishers;
            let transport = drumlink::transport::SerialTransport::new(config.device.baud)
                .with_motor(Arc::new(motor));
            supervise(transport, codec, router, plots, (vision, frame), &config).await
        }
        #[cfg(feature = "ble")]
        TransportKind::Ble => {
            let transport = drumlink::transport::BleTransport::new(config.device.characteristic.clone());
            supervise(transport, codec, router, plots, publishers, &config).await
        }
        #[allow(unreachable_patterns)]
        other => bail!("{other:?} transport support was not compiled in"),
    }
}

async fn supervise<T: Transport, P>(
    transport: T,
    codec: PacketCodec,
    router: SampleRouter,
    plots: Vec<(String, QueueReader<f64>)>,
    // held so collaborators' snapshots stay published for the whole run
    _publishers: P,
    config: &PipelineConfig,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let supervisor = ConnectionSupervisor::new(transport, codec, router, config.supervisor());
    let handle = supervisor.spawn(cancel.clone());

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, stopping");
            ctrl_c.cancel();
        }
    });

    let mut states = handle.states();
    tokio::spawn(async move {
        while let Some(state) = states.next().await {
            debug!("Connection state: {state}");
        }
    });

    let consumers: Vec<_> = plots
        .into_iter()
        .map(|(channel, reader)| {
            let mut batches = reader.drain_every(config.drain_period(), config.plot.max_batch);
            tokio::spawn(async move {
                let mut total = 0usize;
                let mut since_heartbeat = 0usize;
                let mut heartbeat = Instant::now();
                while let Some(batch) = batches.next().await {
                    total += batch.len();
                    since_heartbeat += batch.len();
                    trace!(%channel, n = batch.len(), last = ?batch.last(), "Plot batch");
                    if heartbeat.elapsed() >= HEARTBEAT {
                        info!(
                            %channel,
                            received = since_heartbeat,
                            buffered = batches.reader().size(),
                            evicted = batches.reader().evicted(),
                            "Plot heartbeat"
                        );
                        since_heartbeat = 0;
                        heartbeat = Instant::now();
                    }
                }
                debug!(%channel, total, "Plot consumer finished");
            })
        })
        .collect();

    let report = handle.join().await.context("supervisor stopped with an error")?;
    for consumer in consumers {
        if let Err(e) = consumer.await {
            warn!("Plot consumer failed: {e}");
        }
    }

    let c = report.counters;
    info!(
        exit = ?report.exit,
        frames = c.frames_received,
        samples = c.samples_routed,
        decode_errors = c.decode_errors,
        reconnects = c.reconnects,
        "Run finished"
    );
    info!(
        "Reception: {:.1}% ({} received, {} missed, {} stale)",
        report.loss.percent(),
        report.loss.received,
        report.loss.missed,
        report.loss.stale
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_replay_invocation() {
        let cli = Cli::try_parse_from([
            "drumlink",
            "--transport",
            "replay",
            "--source",
            "run3.bin",
            "--no-log",
        ])
        .expect("valid arguments");
        assert_eq!(cli.transport, TransportKind::Replay);
        assert_eq!(cli.source.as_deref(), Some("run3.bin"));
        assert!(cli.no_log);
        assert!(cli.config.is_none());
    }

    #[test]
    fn cli_defaults_to_a_compiled_in_transport() {
        let cli = Cli::try_parse_from(["drumlink"]).expect("valid arguments");
        assert_eq!(cli.transport, TransportKind::preferred());
        if cfg!(feature = "ble") {
            assert_eq!(cli.transport, TransportKind::Ble);
        } else if cfg!(feature = "serial") {
            assert_eq!(cli.transport, TransportKind::Serial);
        }
    }
}
