//! beast-feed: live Beast TCP ingest and offline capture decoding.

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use beast_core::config::{self, Endpoint, FeedConfig, OutputKind};
use beast_core::{AircraftStore, BeastReader, Counters, Pipeline};
use beast_feed::telemetry::{self, RecorderSink};
use beast_feed::{run_consumer, source, Broadcaster, Consumer, Source, SourceConfig};

/// How often the frame counters are logged.
const COUNTER_REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "beast-feed", version, about = "Beast feed ADS-B decoder and aircraft tracker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to Beast sources and broadcast the live aircraft table
    Run {
        /// Config file (defaults to ~/.beast-feed/config.yaml)
        #[arg(long, env = "BEAST_FEED_CONFIG")]
        config: Option<PathBuf>,

        /// Beast source as host:port; repeatable, replaces configured sources
        #[arg(short, long = "source", env = "BEAST_FEED_SOURCES", value_delimiter = ',')]
        sources: Vec<Endpoint>,

        /// Output consumer (log, json); repeatable
        #[arg(short, long = "output")]
        outputs: Vec<OutputKind>,

        /// Broadcast interval in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Receiver latitude (enables surface position decoding)
        #[arg(long, requires = "lon", allow_hyphen_values = true)]
        lat: Option<f64>,

        /// Receiver longitude
        #[arg(long, requires = "lat", allow_hyphen_values = true)]
        lon: Option<f64>,

        /// Serve Prometheus metrics on this address (e.g. 0.0.0.0:9100)
        #[arg(long, env = "BEAST_FEED_METRICS_ADDR")]
        metrics_addr: Option<SocketAddr>,

        /// Debug logging for the decoder
        #[arg(long)]
        debug: bool,
    },

    /// Decode a captured Beast binary file and print the aircraft table as JSON lines
    Decode {
        /// Path to Beast capture (`-` for stdin)
        file: PathBuf,

        /// Config file for decoder and receiver settings
        #[arg(long, env = "BEAST_FEED_CONFIG")]
        config: Option<PathBuf>,

        #[arg(long)]
        debug: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            sources,
            outputs,
            interval_ms,
            lat,
            lon,
            metrics_addr,
            debug,
        } => {
            let mut cfg = load(config)?;
            if !sources.is_empty() {
                cfg.sources = sources;
            }
            if !outputs.is_empty() {
                cfg.outputs = outputs;
            }
            if let Some(ms) = interval_ms {
                cfg.broadcast.interval_ms = ms;
            }
            if lat.is_some() {
                cfg.receiver.lat = lat;
                cfg.receiver.lon = lon;
            }
            cfg.debug |= debug;
            telemetry::init_tracing(cfg.debug);
            if let Some(addr) = metrics_addr {
                telemetry::init_metrics(addr)?;
            }
            cmd_run(cfg).await
        }
        Commands::Decode {
            file,
            config,
            debug,
        } => {
            let cfg = load(config)?;
            telemetry::init_tracing(cfg.debug || debug);
            cmd_decode(file, &cfg)
        }
    }
}

fn load(path: Option<PathBuf>) -> anyhow::Result<FeedConfig> {
    let path = path.unwrap_or_else(config::config_file);
    config::load_config(&path).with_context(|| format!("loading config {}", path.display()))
}

async fn cmd_run(cfg: FeedConfig) -> anyhow::Result<()> {
    if cfg.sources.is_empty() {
        anyhow::bail!("no Beast sources configured");
    }

    let store = Arc::new(AircraftStore::new());
    let counters = Arc::new(Counters::new());
    let pipeline = Pipeline::new(
        store.clone(),
        Arc::new(RecorderSink::new(counters.clone())),
        cfg.decode_options(),
    );

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let broadcaster = Broadcaster::new(
        store,
        Duration::from_millis(cfg.broadcast.interval_ms.max(1)),
        cfg.broadcast.max_age_secs,
    );
    for &kind in &cfg.outputs {
        let consumer = Consumer::from_kind(kind);
        let subscriber = broadcaster.subscribe();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            // Failure is already logged; other consumers keep running.
            let _ = run_consumer(consumer, subscriber, cancel).await;
        });
    }
    tracker.spawn(broadcaster.run(cancel.clone()));
    tracker.spawn(telemetry::report_counters(
        counters.clone(),
        COUNTER_REPORT_INTERVAL,
        cancel.clone(),
    ));

    for endpoint in &cfg.sources {
        let src = Source::new(SourceConfig::new(endpoint.clone()), pipeline.clone());
        tracker.spawn(source::supervise(src, cancel.clone()));
    }
    tracker.close();

    info!(
        sources = cfg.sources.len(),
        outputs = cfg.outputs.len(),
        "beast-feed running, Ctrl+C to stop"
    );

    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            if let Err(e) = r {
                warn!(error = %e, "failed to listen for Ctrl+C");
            }
        }
        _ = tracker.wait() => {}
    }
    info!("shutting down");
    cancel.cancel();
    tracker.wait().await;
    telemetry::log_counters(&counters);
    Ok(())
}

fn cmd_decode(file: PathBuf, cfg: &FeedConfig) -> anyhow::Result<()> {
    let input: Box<dyn io::Read> = if file.to_str() == Some("-") {
        Box::new(io::stdin().lock())
    } else {
        let f = File::open(&file).with_context(|| format!("opening {}", file.display()))?;
        Box::new(BufReader::new(f))
    };

    let counters = Arc::new(Counters::new());
    let pipeline = Pipeline::new(
        Arc::new(AircraftStore::new()),
        counters.clone(),
        cfg.decode_options(),
    );

    let mut frames = 0u64;
    let mut updates = 0u64;
    let mut reader = BeastReader::new(input);
    for frame in reader.by_ref() {
        let frame = frame.with_context(|| format!("reading {}", file.display()))?;
        frames += 1;
        if pipeline.process(&frame).is_update() {
            updates += 1;
        }
    }

    if reader.overruns() > 0 {
        warn!(dropped = reader.overruns(), "oversized frames dropped, input may not be Beast");
        pipeline.report_overruns(reader.overruns());
    }

    let mut aircraft = pipeline.store().snapshot();
    aircraft.sort_by_key(|ac| ac.icao);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for ac in &aircraft {
        serde_json::to_writer(&mut out, ac)?;
        writeln!(out)?;
    }
    out.flush()?;

    info!(frames, updates, aircraft = aircraft.len(), "decode complete");
    telemetry::log_counters(&counters);
    Ok(())
}
