//! Frame → classifier → decoder → store.
//!
//! Every source worker owns a `Pipeline` clone and pushes raw frames through
//! it in arrival order. All clones share one store and one metrics sink.

use std::sync::Arc;

use tracing::debug;

use crate::decode::{decode_mode_s, DecodeOptions, Decoded, FrameMeta, Invalid};
use crate::frame::{classify_counted, FrameError, MessageKind};
use crate::metrics::MetricsSink;
use crate::store::AircraftStore;
use crate::types::{hex_encode, now_secs};

/// What happened to one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Frame failed the type/length gate.
    Discarded(FrameError),
    /// Frame was well formed; decode result attached.
    Decoded(Decoded),
}

impl Outcome {
    pub fn is_update(&self) -> bool {
        matches!(self, Outcome::Decoded(d) if d.is_valid())
    }
}

#[derive(Clone)]
pub struct Pipeline {
    store: Arc<AircraftStore>,
    metrics: Arc<dyn MetricsSink>,
    options: DecodeOptions,
}

impl Pipeline {
    pub fn new(store: Arc<AircraftStore>, metrics: Arc<dyn MetricsSink>, options: DecodeOptions) -> Self {
        Pipeline {
            store,
            metrics,
            options,
        }
    }

    pub fn store(&self) -> &Arc<AircraftStore> {
        &self.store
    }

    pub fn options(&self) -> &DecodeOptions {
        &self.options
    }

    /// Count frames the splitter dropped for running past the size limit.
    pub fn report_overruns(&self, dropped: u64) {
        for _ in 0..dropped {
            self.metrics.frame_rejected();
        }
        if dropped > 0 {
            debug!(dropped, "dropped oversized frames");
        }
    }

    /// Process one frame stamped with the current wall clock.
    pub fn process(&self, frame: &[u8]) -> Outcome {
        self.process_at(frame, now_secs())
    }

    /// Process one frame as if received at `received_at`.
    pub fn process_at(&self, frame: &[u8], received_at: f64) -> Outcome {
        let beast = match classify_counted(frame, self.metrics.as_ref()) {
            Ok(f) => f,
            Err(FrameError::Empty) => return Outcome::Discarded(FrameError::Empty),
            Err(e) => {
                debug!(reason = %e, frame = %hex_encode(frame), "discarded frame");
                return Outcome::Discarded(e);
            }
        };

        if beast.kind == MessageKind::ModeAc {
            return Outcome::Decoded(Decoded::Invalid(Invalid::ModeAc));
        }

        let meta = FrameMeta {
            mlat: beast.is_mlat(),
            signal: beast.signal,
            received_at,
        };
        Outcome::Decoded(decode_mode_s(
            &beast.payload,
            &meta,
            &self.store,
            self.metrics.as_ref(),
            &self.options,
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
