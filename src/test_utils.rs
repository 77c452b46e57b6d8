//! Test utilities: frame builders, a scripted transport and a recording sink
//!
//! Shared by unit tests, the supervisor scenario tests and the benches.

#![cfg(any(test, feature = "benchmark"))]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::{Instant, sleep_until};

use crate::codec::PacketCodec;
use crate::logger::{LogRow, RowSink};
use crate::transport::{Inbound, Link, Peripheral, Transport};
use crate::types::{DecodedSample, RawFrame, ReceptionClock};
use crate::{Result, TelemetryError};

/// Raw values for frame `index`: a slow ramp per field, inside 14-bit range.
pub fn ramp_values(index: usize, fields: usize) -> Vec<u16> {
    (0..fields).map(|f| ((8192 + index * 7 + f * 100) % 16384) as u16).collect()
}

/// `count` encoded frames with sequence numbers from 0 and 10 ms device time steps.
pub fn frame_bytes(codec: &PacketCodec, count: usize) -> Vec<Vec<u8>> {
    let fields = codec.layout().fields.len();
    (0..count)
        .map(|i| {
            codec
                .encode(i as u32, (i * 10) as u32, &ramp_values(i, fields))
                .unwrap_or_else(|e| panic!("encoding test frame {i}: {e}"))
        })
        .collect()
}

/// `count` decoded samples stamped 10 ms apart.
pub fn sample_stream(codec: &PacketCodec, count: usize) -> Vec<DecodedSample> {
    let clock = ReceptionClock::new();
    frame_bytes(codec, count)
        .into_iter()
        .enumerate()
        .map(|(i, bytes)| {
            let frame = RawFrame::new(bytes, clock.at(Duration::from_millis(i as u64 * 10)));
            codec.decode(&frame).unwrap_or_else(|e| panic!("decoding test frame {i}: {e}"))
        })
        .collect()
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Recorded {
    rows: Vec<LogRow>,
    closes: usize,
}

/// Sink that keeps rows in memory and counts `close` calls.
pub struct RecordingSink {
    shared: Arc<Mutex<Recorded>>,
    fail_after: Option<usize>,
    closed: bool,
}

/// Observer side of a [`RecordingSink`].
#[derive(Clone)]
pub struct SinkProbe {
    shared: Arc<Mutex<Recorded>>,
}

impl RecordingSink {
    pub fn new() -> (Self, SinkProbe) {
        let shared = Arc::new(Mutex::new(Recorded::default()));
        (Self { shared: Arc::clone(&shared), fail_after: None, closed: false }, SinkProbe { shared })
    }

    /// A sink that accepts `rows` rows and then reports a disk error.
    pub fn failing_after(rows: usize) -> Self {
        let (mut sink, _) = Self::new();
        sink.fail_after = Some(rows);
        sink
    }
}

impl RowSink for RecordingSink {
    fn append(&mut self, row: &LogRow) -> Result<u64> {
        let mut recorded = lock(&self.shared);
        if self.closed {
            return Err(TelemetryError::unexpected("append after close"));
        }
        if self.fail_after.is_some_and(|n| recorded.rows.len() >= n) {
            return Err(TelemetryError::log_error(
                "memory".into(),
                std::io::Error::other("disk full"),
            ));
        }
        recorded.rows.push(row.clone());
        Ok(recorded.rows.len() as u64 - 1)
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        lock(&self.shared).closes += 1;
        Ok(())
    }
}

impl SinkProbe {
    pub fn rows(&self) -> Vec<LogRow> {
        lock(&self.shared).rows.clone()
    }

    pub fn row_count(&self) -> usize {
        lock(&self.shared).rows.len()
    }

    pub fn closes(&self) -> usize {
        lock(&self.shared).closes
    }
}

/// Outcome of one scripted discovery call.
#[derive(Debug, Clone)]
pub enum DiscoverStep {
    Found,
    NotFound,
    /// Never completes; exercises the discovery timeout.
    Hang,
    Fail,
}

/// Outcome of one scripted connect call.
#[derive(Debug, Clone)]
pub enum ConnectStep {
    /// Connect and stream the given steps.
    Link(Vec<LinkStep>),
    Fail,
    /// Never completes; exercises the connect timeout.
    Hang,
    /// Fails with a non-retryable error.
    Unexpected,
    /// Connects, but `subscribe` never completes.
    SubscribeHang,
    /// Connects, but `subscribe` fails with a non-retryable error.
    SubscribeUnexpected,
}

#[derive(Debug, Clone, Copy)]
enum Subscribe {
    Ok,
    Hang,
    Unexpected,
}

/// One event on a scripted link.
#[derive(Debug, Clone)]
pub enum LinkStep {
    Frame(Vec<u8>),
    /// Deliver nothing for a while.
    Wait(Duration),
    /// Report the peer gone through `next_frame`.
    Disconnect,
    /// Silently drop the link; only the liveness poll notices.
    Vanish,
    Finish,
}

#[derive(Default)]
struct Script {
    discoveries: VecDeque<DiscoverStep>,
    connects: VecDeque<ConnectStep>,
    discover_calls: Vec<Instant>,
    connect_calls: Vec<Instant>,
    opened_links: usize,
    active_links: usize,
    max_active_links: usize,
    disconnects: usize,
}

/// Transport that replays a fixed script.
///
/// Once a script list runs out, discovery finds the device and connections
/// open links that never deliver anything.
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

/// Observer side of a [`ScriptedTransport`].
#[derive(Clone)]
pub struct ScriptProbe {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    pub fn new(
        discoveries: impl IntoIterator<Item = DiscoverStep>,
        connects: impl IntoIterator<Item = ConnectStep>,
    ) -> (Self, ScriptProbe) {
        let script = Arc::new(Mutex::new(Script {
            discoveries: discoveries.into_iter().collect(),
            connects: connects.into_iter().collect(),
            ..Script::default()
        }));
        (Self { script: Arc::clone(&script) }, ScriptProbe { script })
    }
}

impl ScriptProbe {
    pub fn discover_calls(&self) -> Vec<Instant> {
        lock(&self.script).discover_calls.clone()
    }

    pub fn connect_calls(&self) -> Vec<Instant> {
        lock(&self.script).connect_calls.clone()
    }

    /// Links handed out by successful `connect` calls.
    pub fn opened_links(&self) -> usize {
        lock(&self.script).opened_links
    }

    pub fn active_links(&self) -> usize {
        lock(&self.script).active_links
    }

    pub fn max_active_links(&self) -> usize {
        lock(&self.script).max_active_links
    }

    pub fn disconnects(&self) -> usize {
        lock(&self.script).disconnects
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    type Link = ScriptedLink;

    async fn discover(&mut self, name: &str) -> Result<Option<Peripheral>> {
        let step = {
            let mut script = lock(&self.script);
            script.discover_calls.push(Instant::now());
            script.discoveries.pop_front().unwrap_or(DiscoverStep::Found)
        };
        match step {
            DiscoverStep::Found => {
                Ok(Some(Peripheral { address: "00:11:22:33:44:55".into(), name: Some(name.into()) }))
            }
            DiscoverStep::NotFound => Ok(None),
            DiscoverStep::Hang => std::future::pending().await,
            DiscoverStep::Fail => Err(TelemetryError::connection_failed("adapter powered off")),
        }
    }

    async fn connect(&mut self, peripheral: &Peripheral) -> Result<ScriptedLink> {
        let step = {
            let mut script = lock(&self.script);
            script.connect_calls.push(Instant::now());
            script.connects.pop_front().unwrap_or(ConnectStep::Link(Vec::new()))
        };
        let (steps, subscribe) = match step {
            ConnectStep::Link(steps) => (steps, Subscribe::Ok),
            ConnectStep::SubscribeHang => (Vec::new(), Subscribe::Hang),
            ConnectStep::SubscribeUnexpected => (Vec::new(), Subscribe::Unexpected),
            ConnectStep::Fail => {
                return Err(TelemetryError::connection_failed(format!("{} refused", peripheral.address)));
            }
            ConnectStep::Unexpected => return Err(TelemetryError::unexpected("adapter state corrupted")),
            ConnectStep::Hang => std::future::pending().await,
        };
        {
            let mut script = lock(&self.script);
            script.opened_links += 1;
            script.active_links += 1;
            script.max_active_links = script.max_active_links.max(script.active_links);
        }
        Ok(ScriptedLink {
            steps: steps.into(),
            subscribe,
            wait_until: None,
            connected: true,
            released: false,
            script: Arc::clone(&self.script),
        })
    }
}

/// Link created by [`ScriptedTransport`].
pub struct ScriptedLink {
    steps: VecDeque<LinkStep>,
    subscribe: Subscribe,
    wait_until: Option<Instant>,
    connected: bool,
    released: bool,
    script: Arc<Mutex<Script>>,
}

impl ScriptedLink {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            lock(&self.script).active_links -= 1;
        }
    }
}

#[async_trait::async_trait]
impl Link for ScriptedLink {
    async fn subscribe(&mut self) -> Result<()> {
        match self.subscribe {
            Subscribe::Ok => Ok(()),
            Subscribe::Hang => std::future::pending().await,
            Subscribe::Unexpected => Err(TelemetryError::unexpected("characteristic vanished")),
        }
    }

    async fn next_frame(&mut self) -> Result<Inbound> {
        loop {
            // steps are only consumed once complete, so a dropped call loses nothing
            match self.steps.front().cloned() {
                None => std::future::pending::<()>().await,
                Some(LinkStep::Wait(delay)) => {
                    let deadline = *self.wait_until.get_or_insert_with(|| Instant::now() + delay);
                    sleep_until(deadline).await;
                    self.wait_until = None;
                    self.steps.pop_front();
                }
                Some(LinkStep::Frame(bytes)) => {
                    self.steps.pop_front();
                    return Ok(Inbound::Frame(bytes));
                }
                Some(LinkStep::Disconnect) => {
                    self.steps.pop_front();
                    self.connected = false;
                    return Ok(Inbound::Disconnected);
                }
                Some(LinkStep::Vanish) => {
                    self.steps.pop_front();
                    self.connected = false;
                }
                Some(LinkStep::Finish) => return Ok(Inbound::Finished),
            }
        }
    }

    async fn is_connected(&mut self) -> bool {
        self.connected
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        lock(&self.script).disconnects += 1;
        self.release();
        Ok(())
    }
}

impl Drop for ScriptedLink {
    fn drop(&mut self) {
        self.release();
    }
}
