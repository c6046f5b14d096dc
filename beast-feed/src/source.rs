//! Source connection manager.
//!
//! Each configured feed is a two-state machine:
//!
//! ```text
//!   Disconnected --dial ok--> Connected
//!        ^                        |
//!        +---- read ends ---------+   (constant reconnect interval)
//! ```
//!
//! Dialing itself retries with capped exponential backoff for a bounded
//! number of attempts. When those are exhausted the source waits one
//! reconnect interval and starts dialing again, forever, unless it was
//! configured as one-shot.

use std::time::Duration;

use anyhow::anyhow;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use beast_core::config::Endpoint;
use beast_core::{FrameSplitter, Pipeline};

const READ_BUF_SIZE: usize = 16 * 1024;

/// Dial and reconnect policy for one feed.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub endpoint: Endpoint,
    /// Delay before the first dial retry; doubles per attempt.
    pub dial_initial_delay: Duration,
    pub dial_max_delay: Duration,
    /// Retries after the first failed dial.
    pub dial_max_retries: u32,
    pub connect_timeout: Duration,
    /// Pause between a lost connection and the next dial sequence.
    pub reconnect_interval: Duration,
    /// Give up after the dial sequence fails instead of reconnecting.
    pub one_shot: bool,
}

impl SourceConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        SourceConfig {
            endpoint,
            dial_initial_delay: Duration::from_millis(500),
            dial_max_delay: Duration::from_secs(30),
            dial_max_retries: 5,
            connect_timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(1),
            one_shot: false,
        }
    }
}

enum SourceState {
    Disconnected,
    Connected(TcpStream),
}

/// How a connected read loop ended.
#[derive(Debug)]
enum ReadEnd {
    Cancelled,
    PeerClosed,
    Failed(std::io::Error),
}

/// One feed: dials, reads, and pushes every frame into the pipeline.
#[derive(Clone)]
pub struct Source {
    config: SourceConfig,
    pipeline: Pipeline,
}

impl Source {
    pub fn new(config: SourceConfig, pipeline: Pipeline) -> Self {
        Source { config, pipeline }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.config.endpoint
    }

    /// Run until cancelled. Only a one-shot source returns an error.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let endpoint = self.config.endpoint.to_string();
        let mut state = SourceState::Disconnected;

        loop {
            state = match state {
                SourceState::Disconnected => match self.dial(&cancel).await {
                    Ok(Some(stream)) => {
                        info!("connected");
                        metrics::counter!("beast.source.connected_total", "source" => endpoint.clone())
                            .increment(1);
                        metrics::gauge!("beast.source.connected", "source" => endpoint.clone()).set(1.0);
                        SourceState::Connected(stream)
                    }
                    Ok(None) => return Ok(()),
                    Err(e) if self.config.one_shot => {
                        error!(error = %e, "giving up on one-shot source");
                        return Err(e);
                    }
                    Err(e) => {
                        warn!(error = %e, retry_in = ?self.config.reconnect_interval, "dial sequence failed");
                        if !sleep_or_cancel(self.config.reconnect_interval, &cancel).await {
                            return Ok(());
                        }
                        SourceState::Disconnected
                    }
                },
                SourceState::Connected(stream) => {
                    let end = self.read_loop(stream, &cancel).await;
                    metrics::gauge!("beast.source.connected", "source" => endpoint.clone()).set(0.0);
                    match end {
                        ReadEnd::Cancelled => return Ok(()),
                        ReadEnd::PeerClosed => info!("peer closed connection"),
                        ReadEnd::Failed(e) => warn!(error = %e, "read failed"),
                    }
                    metrics::counter!("beast.source.disconnected_total", "source" => endpoint.clone())
                        .increment(1);
                    if self.config.one_shot {
                        return Ok(());
                    }
                    if !sleep_or_cancel(self.config.reconnect_interval, &cancel).await {
                        return Ok(());
                    }
                    SourceState::Disconnected
                }
            };
        }
    }

    /// Dial with capped exponential backoff.
    ///
    /// `Ok(None)` means cancellation arrived first.
    async fn dial(&self, cancel: &CancellationToken) -> anyhow::Result<Option<TcpStream>> {
        let Endpoint { host, port } = &self.config.endpoint;
        let mut delay = self.config.dial_initial_delay;
        let mut attempt = 0u32;

        loop {
            let connect = tokio::time::timeout(
                self.config.connect_timeout,
                TcpStream::connect((host.as_str(), *port)),
            );
            let result = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                r = connect => r,
            };
            let err = match result {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(error = %e, "set_nodelay failed");
                    }
                    return Ok(Some(stream));
                }
                Ok(Err(e)) => anyhow::Error::new(e),
                Err(_) => anyhow!("connect timed out after {:?}", self.config.connect_timeout),
            };

            if attempt >= self.config.dial_max_retries {
                return Err(err.context(format!(
                    "failed to connect to {} after {} attempts",
                    self.config.endpoint,
                    attempt + 1
                )));
            }
            attempt += 1;
            warn!(error = %err, attempt, retry_in = ?delay, "dial failed");
            if !sleep_or_cancel(delay, cancel).await {
                return Ok(None);
            }
            delay = std::cmp::min(delay * 2, self.config.dial_max_delay);
        }
    }

    /// Read until EOF, error, or cancellation, decoding frames in arrival order.
    async fn read_loop(&self, mut stream: TcpStream, cancel: &CancellationToken) -> ReadEnd {
        let mut splitter = FrameSplitter::new();
        let mut buf = vec![0u8; READ_BUF_SIZE];

        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => return ReadEnd::Cancelled,
                r = stream.read(&mut buf) => match r {
                    Ok(n) => n,
                    Err(e) => return ReadEnd::Failed(e),
                },
            };

            if n == 0 {
                if let Some(tail) = splitter.finish() {
                    self.pipeline.process(&tail);
                }
                return ReadEnd::PeerClosed;
            }

            let dropped = splitter.push(&buf[..n]);
            if dropped > 0 {
                warn!("frame overran the size limit without a delimiter, is this a Beast port?");
                self.pipeline.report_overruns(dropped as u64);
            }
            while let Some(frame) = splitter.next_frame() {
                self.pipeline.process(&frame);
            }
        }
    }
}

/// Sleep for `duration`; `false` if cancelled first.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Supervise a worker for `source` until cancelled.
///
/// A worker that panics is logged and restarted from the disconnected
/// state. Returns when cancelled or when a one-shot source gives up.
pub async fn supervise(source: Source, cancel: CancellationToken) {
    let span = tracing::info_span!("source", endpoint = %source.endpoint());
    async move {
        loop {
            let worker = {
                let source = source.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { source.run(cancel).await }.in_current_span())
            };
            match worker.await {
                Err(e) if e.is_panic() && !cancel.is_cancelled() => {
                    error!("source worker panicked, restarting");
                    if !sleep_or_cancel(source.config.reconnect_interval, &cancel).await {
                        return;
                    }
                }
                _ => return,
            }
        }
    }
    .instrument(span)
    .await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use beast_core::framing::DELIMITER;
    use beast_core::{hex_decode, AircraftStore, Counters, DecodeOptions};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn beast_bytes(payload_hex: &str) -> Vec<u8> {
        let mut v = vec![DELIMITER, 0x33, 0, 0, 0, 0, 0, 0, 0x80];
        v.extend(hex_decode(payload_hex).unwrap());
        v
    }

    fn pipeline() -> Pipeline {
        Pipeline::new(
            Arc::new(AircraftStore::new()),
            Arc::new(Counters::new()),
            DecodeOptions::default(),
        )
    }

    fn fast_config(endpoint: Endpoint) -> SourceConfig {
        SourceConfig {
            dial_initial_delay: Duration::from_millis(5),
            dial_max_delay: Duration::from_millis(20),
            dial_max_retries: 2,
            connect_timeout: Duration::from_secs(1),
            reconnect_interval: Duration::from_millis(10),
            ..SourceConfig::new(endpoint)
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_reconnects_after_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            // First connection: one frame, tail without a trailing delimiter.
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(&beast_bytes("8dabeb31204d7074db782012f83a")).await.unwrap();
            drop(sock);
            // Second connection after the reconnect.
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(&beast_bytes("8D40621D58C386435CC412692AD6")).await.unwrap();
            drop(sock);
        });

        let p = pipeline();
        let store = p.store().clone();
        let source = Source::new(fast_config(Endpoint::new("127.0.0.1", port)), p);
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { source.run(cancel).await })
        };

        wait_for(|| store.contains(&[0xAB, 0xEB, 0x31]) && store.contains(&[0x40, 0x62, 0x1D])).await;
        server.await.unwrap();

        let ac = store.load(&[0xAB, 0xEB, 0x31]).unwrap();
        assert_eq!(ac.callsign.as_deref(), Some("SWA467"));
        assert_eq!(ac.signal, 0x80);

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_frames_split_across_reads() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut bytes = beast_bytes("8D40621D58C386435CC412692AD6");
            bytes.extend(beast_bytes("8D40621D58C382D690C8AC2863A7"));
            bytes.push(DELIMITER);
            for chunk in bytes.chunks(3) {
                sock.write_all(chunk).await.unwrap();
                sock.flush().await.unwrap();
            }
            // Hold the connection open until the client is done.
            let mut scratch = [0u8; 1];
            let _ = tokio::io::AsyncReadExt::read(&mut sock, &mut scratch).await;
        });

        let p = pipeline();
        let store = p.store().clone();
        let source = Source::new(fast_config(Endpoint::new("127.0.0.1", port)), p);
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { source.run(cancel).await })
        };

        wait_for(|| {
            store
                .load(&[0x40, 0x62, 0x1D])
                .map(|ac| ac.has_position())
                .unwrap_or(false)
        })
        .await;

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
        server.abort();
    }

    #[tokio::test]
    async fn test_text_stream_counted_as_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let line = b"*8DABEB31204D7074DB782012F83A;\n".repeat(100);
            sock.write_all(&line).await.unwrap();
            let mut scratch = [0u8; 1];
            let _ = tokio::io::AsyncReadExt::read(&mut sock, &mut scratch).await;
        });

        let counters = Arc::new(Counters::new());
        let p = Pipeline::new(
            Arc::new(AircraftStore::new()),
            counters.clone(),
            DecodeOptions::default(),
        );
        let store = p.store().clone();
        let source = Source::new(fast_config(Endpoint::new("127.0.0.1", port)), p);
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { source.run(cancel).await })
        };

        wait_for(|| counters.bad().count() >= 1).await;
        assert!(store.is_empty());

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
        server.abort();
    }

    #[tokio::test]
    async fn test_one_shot_gives_up_on_closed_port() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let config = SourceConfig {
            one_shot: true,
            ..fast_config(Endpoint::new("127.0.0.1", port))
        };
        let source = Source::new(config, pipeline());
        let err = source.run(CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let config = SourceConfig {
            dial_initial_delay: Duration::from_secs(60),
            ..fast_config(Endpoint::new("127.0.0.1", port))
        };
        let source = Source::new(config, pipeline());
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { source.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("source did not stop on cancel");
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_supervised_worker_stops_on_cancel() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let source = Source::new(fast_config(Endpoint::new("127.0.0.1", port)), pipeline());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervise(source, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}
