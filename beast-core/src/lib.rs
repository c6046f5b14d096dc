//! beast-core: Beast frame splitting, Mode S / ADS-B decoding, CPR position
//! resolution, and the shared aircraft store.
//!
//! No async, no sockets. `beast-feed` owns the network side and drives
//! [`Pipeline`] from one task per source.

pub mod aircraft;
pub mod config;
pub mod cpr;
pub mod crc;
pub mod decode;
pub mod frame;
pub mod framing;
pub mod metrics;
pub mod pipeline;
pub mod squitter;
pub mod store;
pub mod types;

// Re-export commonly used types at crate root
pub use aircraft::AircraftState;
pub use decode::{decode_mode_s, DecodeOptions, Decoded, FrameMeta};
pub use frame::{classify, BeastFrame, FrameError, MessageKind};
pub use framing::{BeastReader, FrameSplitter};
pub use metrics::{Counters, MetricsSink, NoopSink};
pub use pipeline::{Outcome, Pipeline};
pub use store::{AircraftStore, EVICTION_AGE_SECS};
pub use types::*;
