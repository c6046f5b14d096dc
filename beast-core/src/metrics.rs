//! Decoder metrics.
//!
//! The classifier and decoder report into a [`MetricsSink`] handed to them by
//! the caller, there is no process-global registry. [`Counters`] is the
//! in-memory implementation; the feed binary wraps it to also forward into
//! its metrics exporter.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::frame::MessageKind;

pub const GOOD_RATE: &str = "good rate";
pub const BAD_RATE: &str = "bad rate";
pub const MODE_AC_COUNT: &str = "Mode A/C count";
pub const MODE_S_SHORT_COUNT: &str = "Mode S short count";
pub const MODE_S_LONG_COUNT: &str = "Mode S long count";
pub const CRC_FAILED: &str = "CRC failed";
pub const CRC_REPAIRED: &str = "CRC repaired";

/// Name of the per-DF counter, e.g. "DF 04", "DF 17".
pub fn df_metric_name(df: u8) -> String {
    format!("DF {df:02}")
}

/// Name of the per-type counter for an accepted frame.
pub fn kind_metric_name(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::ModeAc => MODE_AC_COUNT,
        MessageKind::ModeSShort => MODE_S_SHORT_COUNT,
        MessageKind::ModeSLong => MODE_S_LONG_COUNT,
    }
}

/// Receiver of decode events.
pub trait MetricsSink: Send + Sync {
    /// A frame passed the type and length gate.
    fn frame_accepted(&self, kind: MessageKind);
    /// A frame failed the type or length gate.
    fn frame_rejected(&self);
    /// A Mode S payload with this downlink format reached the decoder.
    fn downlink_format(&self, df: u8);
    fn crc_failed(&self) {}
    fn crc_repaired(&self) {}
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn frame_accepted(&self, _kind: MessageKind) {}
    fn frame_rejected(&self) {}
    fn downlink_format(&self, _df: u8) {}
}

// ---------------------------------------------------------------------------
// In-memory counters
// ---------------------------------------------------------------------------

/// Monotonic count plus mean rate since creation.
#[derive(Debug)]
pub struct RateMeter {
    count: AtomicU64,
    started: Instant,
}

impl RateMeter {
    pub fn new() -> Self {
        RateMeter {
            count: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn mark(&self, n: u64) {
        self.count.fetch_add(n, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Events per second since the meter was created.
    pub fn mean_rate(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.count() as f64 / elapsed
    }
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock-free counters for every decoder event.
#[derive(Debug)]
pub struct Counters {
    good: RateMeter,
    bad: RateMeter,
    mode_ac: AtomicU64,
    mode_s_short: AtomicU64,
    mode_s_long: AtomicU64,
    df: [AtomicU64; 32],
    crc_failed: AtomicU64,
    crc_repaired: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Counters {
            good: RateMeter::new(),
            bad: RateMeter::new(),
            mode_ac: AtomicU64::new(0),
            mode_s_short: AtomicU64::new(0),
            mode_s_long: AtomicU64::new(0),
            df: std::array::from_fn(|_| AtomicU64::new(0)),
            crc_failed: AtomicU64::new(0),
            crc_repaired: AtomicU64::new(0),
        }
    }

    pub fn good(&self) -> &RateMeter {
        &self.good
    }

    pub fn bad(&self) -> &RateMeter {
        &self.bad
    }

    pub fn kind_count(&self, kind: MessageKind) -> u64 {
        match kind {
            MessageKind::ModeAc => self.mode_ac.load(Ordering::Relaxed),
            MessageKind::ModeSShort => self.mode_s_short.load(Ordering::Relaxed),
            MessageKind::ModeSLong => self.mode_s_long.load(Ordering::Relaxed),
        }
    }

    pub fn df_count(&self, df: u8) -> u64 {
        self.df
            .get(df as usize)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Point-in-time copy of every non-zero counter, keyed by metric name.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut counts = BTreeMap::new();
        let mut put = |name: String, value: u64| {
            if value > 0 {
                counts.insert(name, value);
            }
        };
        put(GOOD_RATE.to_string(), self.good.count());
        put(BAD_RATE.to_string(), self.bad.count());
        for kind in [MessageKind::ModeAc, MessageKind::ModeSShort, MessageKind::ModeSLong] {
            put(kind_metric_name(kind).to_string(), self.kind_count(kind));
        }
        for df in 0..32u8 {
            put(df_metric_name(df), self.df_count(df));
        }
        put(CRC_FAILED.to_string(), self.crc_failed.load(Ordering::Relaxed));
        put(CRC_REPAIRED.to_string(), self.crc_repaired.load(Ordering::Relaxed));

        MetricsSnapshot {
            counts,
            good_rate: self.good.mean_rate(),
            bad_rate: self.bad.mean_rate(),
        }
    }
}

impl Default for Counters {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for Counters {
    fn frame_accepted(&self, kind: MessageKind) {
        self.good.mark(1);
        let counter = match kind {
            MessageKind::ModeAc => &self.mode_ac,
            MessageKind::ModeSShort => &self.mode_s_short,
            MessageKind::ModeSLong => &self.mode_s_long,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn frame_rejected(&self) {
        self.bad.mark(1);
    }

    fn downlink_format(&self, df: u8) {
        if let Some(c) = self.df.get(df as usize) {
            c.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn crc_failed(&self) {
        self.crc_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn crc_repaired(&self) {
        self.crc_repaired.fetch_add(1, Ordering::Relaxed);
    }
}

/// Serializable copy of [`Counters`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counts: BTreeMap<String, u64>,
    /// Mean accepted frames per second.
    pub good_rate: f64,
    /// Mean rejected frames per second.
    pub bad_rate: f64,
}

impl MetricsSnapshot {
    pub fn get(&self, name: &str) -> u64 {
        self.counts.get(name).copied().unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
