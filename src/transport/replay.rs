//! Replay transport for recorded captures
//!
//! A capture is the raw notification payloads of one run written back to
//! back. Every frame has the layout's fixed size, so the file is split into
//! equal chunks and replayed at the nominal rate. A trailing short chunk is
//! delivered as-is and rejected by the codec like any other bad frame.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::{Duration, Interval, MissedTickBehavior, interval};
use tracing::{debug, info, trace};

use super::{Inbound, Link, Peripheral, Transport};
use crate::{Result, TelemetryError};

/// Nominal firmware notification rate.
pub const DEFAULT_RATE_HZ: f64 = 100.0;

#[derive(Debug, Clone)]
enum Source {
    File(PathBuf),
    Memory(Arc<[u8]>),
}

/// Transport that "connects" to a capture file
#[derive(Debug, Clone)]
pub struct ReplayTransport {
    source: Source,
    frame_len: usize,
    rate_hz: f64,
    speed: f64,
}

impl ReplayTransport {
    /// Replay a capture file of `frame_len`-byte frames.
    pub fn open(path: impl AsRef<Path>, frame_len: usize) -> Self {
        Self::with_source(Source::File(path.as_ref().to_path_buf()), frame_len)
    }

    /// Replay an in-memory capture.
    pub fn from_bytes(data: impl Into<Arc<[u8]>>, frame_len: usize) -> Self {
        Self::with_source(Source::Memory(data.into()), frame_len)
    }

    fn with_source(source: Source, frame_len: usize) -> Self {
        Self { source, frame_len: frame_len.max(1), rate_hz: DEFAULT_RATE_HZ, speed: 1.0 }
    }

    /// Set the recorded notification rate.
    pub fn with_rate(mut self, rate_hz: f64) -> Self {
        if rate_hz > 0.0 {
            self.rate_hz = rate_hz;
        }
        self
    }

    /// Set playback speed (1.0 = recorded rate).
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed.clamp(0.1, 100.0);
        self
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / (self.rate_hz * self.speed))
    }

    fn address(&self) -> String {
        match &self.source {
            Source::File(path) => path.display().to_string(),
            Source::Memory(_) => "memory".to_string(),
        }
    }

    fn load(&self) -> Result<Arc<[u8]>> {
        match &self.source {
            Source::File(path) => std::fs::read(path).map(Arc::from).map_err(|e| {
                TelemetryError::connection_failed_with_source(
                    format!("Cannot read capture {}", path.display()),
                    Box::new(e),
                )
            }),
            Source::Memory(data) => Ok(Arc::clone(data)),
        }
    }
}

#[async_trait::async_trait]
impl Transport for ReplayTransport {
    type Link = ReplayLink;

    async fn discover(&mut self, _name: &str) -> Result<Option<Peripheral>> {
        let found = match &self.source {
            Source::File(path) => path.is_file(),
            Source::Memory(_) => true,
        };
        Ok(found.then(|| Peripheral { address: self.address(), name: Some("replay".to_string()) }))
    }

    async fn connect(&mut self, peripheral: &Peripheral) -> Result<ReplayLink> {
        let data = self.load()?;
        let frames = data.len().div_ceil(self.frame_len);
        info!(
            "Opened capture {}: {} frames at {:.1}Hz",
            peripheral.address,
            frames,
            self.rate_hz * self.speed
        );

        let mut interval = interval(self.frame_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Ok(ReplayLink { data, frame_len: self.frame_len, position: 0, interval, subscribed: false })
    }
}

/// An open capture being replayed
#[derive(Debug)]
pub struct ReplayLink {
    data: Arc<[u8]>,
    frame_len: usize,
    position: usize,
    interval: Interval,
    subscribed: bool,
}

impl ReplayLink {
    /// Frames not yet delivered.
    pub fn remaining(&self) -> usize {
        (self.data.len() - self.position).div_ceil(self.frame_len)
    }
}

#[async_trait::async_trait]
impl Link for ReplayLink {
    async fn subscribe(&mut self) -> Result<()> {
        self.subscribed = true;
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Inbound> {
        if !self.subscribed {
            return Err(TelemetryError::unexpected("next_frame called before subscribe"));
        }
        if self.position >= self.data.len() {
            debug!("Reached end of capture");
            return Ok(Inbound::Finished);
        }

        // position only advances after the tick, so dropping this future loses nothing
        self.interval.tick().await;

        let end = (self.position + self.frame_len).min(self.data.len());
        let frame = self.data[self.position..end].to_vec();
        self.position = end;
        trace!("Replayed {} bytes, {} frames left", frame.len(), self.remaining());
        Ok(Inbound::Frame(frame))
    }

    async fn is_connected(&mut self) -> bool {
        true
    }

    async fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn replays_fixed_size_chunks_then_finishes() {
        let data: Vec<u8> = (0..10).collect();
        let mut transport = ReplayTransport::from_bytes(data, 4);
        let peripheral = transport.discover("any").await.expect("discover").expect("found");
        let mut link = transport.connect(&peripheral).await.expect("connect");
        link.subscribe().await.expect("subscribe");

        assert_eq!(link.next_frame().await.expect("frame"), Inbound::Frame(vec![0, 1, 2, 3]));
        assert_eq!(link.next_frame().await.expect("frame"), Inbound::Frame(vec![4, 5, 6, 7]));
        assert_eq!(link.next_frame().await.expect("frame"), Inbound::Frame(vec![8, 9]));
        assert_eq!(link.next_frame().await.expect("end"), Inbound::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn paces_at_nominal_rate() {
        let mut transport = ReplayTransport::from_bytes(vec![0u8; 40], 4);
        let peripheral = transport.discover("any").await.expect("discover").expect("found");
        let mut link = transport.connect(&peripheral).await.expect("connect");
        link.subscribe().await.expect("subscribe");

        let start = tokio::time::Instant::now();
        while let Inbound::Frame(_) = link.next_frame().await.expect("frame") {}
        // first tick is immediate, nine more at 10 ms
        assert_eq!(start.elapsed(), Duration::from_millis(90));
    }

    #[tokio::test]
    async fn missing_file_is_not_discovered() {
        let mut transport = ReplayTransport::open("/nonexistent/capture.bin", 14);
        assert_eq!(transport.discover("any").await.expect("discover"), None);

        let err = transport.connect(&Peripheral::at("/nonexistent/capture.bin")).await;
        assert!(err.expect_err("unreadable").is_retryable());
    }
}
