//! beast-feed: network side of the Beast decoder.
//!
//! One task per TCP source pushes frames through a shared
//! [`beast_core::Pipeline`]; a broadcaster task evicts and fans out the
//! aircraft table once per interval; consumer tasks render it.

pub mod broadcast;
pub mod consumer;
pub mod source;
pub mod telemetry;

pub use broadcast::{Broadcaster, Snapshot, Subscriber};
pub use consumer::{run_consumer, Consumer};
pub use source::{Source, SourceConfig};
pub use telemetry::RecorderSink;
