//! Tracing setup and the metrics sink wired into the decoder.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use beast_core::metrics::{kind_metric_name, BAD_RATE, GOOD_RATE};
use beast_core::{Counters, MessageKind, MetricsSink};

/// Install the global subscriber. `RUST_LOG` wins over `debug`.
///
/// Logs go to stderr so JSON output on stdout stays clean.
pub fn init_tracing(debug: bool) {
    let default = if debug {
        "info,beast_core=debug,beast_feed=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Install the Prometheus recorder with a scrape endpoint on `addr`.
///
/// Without this call the `metrics` macros are no-ops and only the local
/// counters are kept. Must run inside the tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("installing Prometheus exporter on {addr}"))?;
    info!("serving metrics on http://{}/metrics", addr);
    Ok(())
}

fn kind_label(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::ModeAc => "mode_ac",
        MessageKind::ModeSShort => "mode_s_short",
        MessageKind::ModeSLong => "mode_s_long",
    }
}

/// Forwards decoder events to the `metrics` facade and keeps local counts
/// for the periodic summary.
#[derive(Debug, Clone, Default)]
pub struct RecorderSink {
    counters: Arc<Counters>,
}

impl RecorderSink {
    pub fn new(counters: Arc<Counters>) -> Self {
        RecorderSink { counters }
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }
}

impl MetricsSink for RecorderSink {
    fn frame_accepted(&self, kind: MessageKind) {
        self.counters.frame_accepted(kind);
        metrics::counter!("beast.frames.good_total", "kind" => kind_label(kind)).increment(1);
    }

    fn frame_rejected(&self) {
        self.counters.frame_rejected();
        metrics::counter!("beast.frames.bad_total").increment(1);
    }

    fn downlink_format(&self, df: u8) {
        self.counters.downlink_format(df);
        metrics::counter!("beast.frames.df_total", "df" => format!("{df:02}")).increment(1);
    }

    fn crc_failed(&self) {
        self.counters.crc_failed();
        metrics::counter!("beast.crc.failed_total").increment(1);
    }

    fn crc_repaired(&self) {
        self.counters.crc_repaired();
        metrics::counter!("beast.crc.repaired_total").increment(1);
    }
}

/// Log one summary of `counters`.
pub fn log_counters(counters: &Counters) {
    let snap = counters.snapshot();
    info!(
        good = snap.get(GOOD_RATE),
        bad = snap.get(BAD_RATE),
        mode_ac = snap.get(kind_metric_name(MessageKind::ModeAc)),
        mode_s_short = snap.get(kind_metric_name(MessageKind::ModeSShort)),
        mode_s_long = snap.get(kind_metric_name(MessageKind::ModeSLong)),
        good_rate = snap.good_rate,
        bad_rate = snap.bad_rate,
        "frame counters"
    );
}

/// Log counters every `every` until cancelled.
pub async fn report_counters(counters: Arc<Counters>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    // First tick fires immediately; skip it so the first report has data.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => log_counters(&counters),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use beast_core::metrics::{df_metric_name, CRC_REPAIRED, MODE_S_LONG_COUNT};

    #[test]
    fn test_recorder_sink_tees_into_counters() {
        let sink = RecorderSink::default();
        sink.frame_accepted(MessageKind::ModeSLong);
        sink.frame_accepted(MessageKind::ModeSLong);
        sink.frame_rejected();
        sink.downlink_format(17);
        sink.crc_repaired();

        let snap = sink.counters().snapshot();
        assert_eq!(snap.get(GOOD_RATE), 2);
        assert_eq!(snap.get(BAD_RATE), 1);
        assert_eq!(snap.get(MODE_S_LONG_COUNT), 2);
        assert_eq!(snap.get(&df_metric_name(17)), 1);
        assert_eq!(snap.get(CRC_REPAIRED), 1);
    }

    #[test]
    fn test_recorder_sink_reaches_prometheus() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let sink = RecorderSink::default();
        metrics::with_local_recorder(&recorder, || {
            sink.frame_accepted(MessageKind::ModeSShort);
            sink.frame_rejected();
            sink.downlink_format(11);
        });

        let text = handle.render();
        assert!(text.contains("beast_frames_good_total{kind=\"mode_s_short\"} 1"));
        assert!(text.contains("beast_frames_bad_total 1"));
        assert!(text.contains("beast_frames_df_total{df=\"11\"} 1"));
    }

    #[tokio::test]
    async fn test_report_counters_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(report_counters(
            Arc::new(Counters::new()),
            Duration::from_millis(5),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
