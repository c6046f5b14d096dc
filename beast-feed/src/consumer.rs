//! Built-in snapshot consumers.

use std::io::{self, Write};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use beast_core::config::OutputKind;
use beast_core::icao_to_string;

use crate::broadcast::{Snapshot, Subscriber};

/// Output backend fed by the broadcaster.
pub enum Consumer {
    /// Summary line per tick through the log; per-aircraft lines at debug.
    Log,
    /// One JSON object per aircraft per tick.
    Json(Box<dyn Write + Send>),
}

impl Consumer {
    /// The default backend for each configured output (JSON goes to stdout).
    pub fn from_kind(kind: OutputKind) -> Self {
        match kind {
            OutputKind::Log => Consumer::Log,
            OutputKind::Json => Consumer::Json(Box::new(io::stdout())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Consumer::Log => "log",
            Consumer::Json(_) => "json",
        }
    }

    pub fn handle(&mut self, snapshot: &Snapshot) -> anyhow::Result<()> {
        match self {
            Consumer::Log => {
                info!(
                    aircraft = snapshot.len(),
                    positioned = snapshot.positioned().count(),
                    "aircraft table"
                );
                for ac in &snapshot.aircraft {
                    debug!(
                        icao = %icao_to_string(&ac.icao),
                        callsign = ac.callsign.as_deref().unwrap_or("-"),
                        squawk = ac.squawk_string().as_deref().unwrap_or("-"),
                        altitude_ft = ?ac.altitude_ft,
                        lat = ?ac.lat,
                        lon = ?ac.lon,
                        speed_kts = ?ac.speed_kts,
                        heading = ?ac.heading_deg,
                        messages = ac.message_count,
                        "aircraft"
                    );
                }
            }
            Consumer::Json(out) => {
                for ac in &snapshot.aircraft {
                    serde_json::to_writer(&mut *out, ac)?;
                    out.write_all(b"\n")?;
                }
                out.flush()?;
            }
        }
        Ok(())
    }
}

/// Feed `consumer` from `subscriber` until cancelled or the broadcaster
/// goes away. A write failure stops this consumer only. JSON writes run on
/// the blocking pool.
pub async fn run_consumer(
    mut consumer: Consumer,
    mut subscriber: Subscriber,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let name = consumer.name();
    loop {
        let snapshot = tokio::select! {
            _ = cancel.cancelled() => break,
            s = subscriber.recv() => match s {
                Some(s) => s,
                None => break,
            },
        };
        let result = match consumer {
            Consumer::Log => consumer.handle(&snapshot),
            // Writers like stdout block; keep them off the runtime threads.
            json => {
                let (json, result) = tokio::task::spawn_blocking(move || {
                    let mut json = json;
                    let result = json.handle(&snapshot);
                    (json, result)
                })
                .await?;
                consumer = json;
                result
            }
        };
        if let Err(e) = result {
            error!(consumer = name, error = %e, "consumer failed, stopping");
            return Err(e);
        }
    }
    debug!(consumer = name, "consumer stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
