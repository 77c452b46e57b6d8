//! Connection supervision
//!
//! [`ConnectionSupervisor`] owns the transport, the codec and the router and
//! runs the whole ingestion loop in one task:
//!
//! ```text
//! Disconnected -> Discovering -> Connecting -> Subscribed -> Streaming
//!       ^              |              |                         |
//!       |         not found      failed/timeout           link lost
//!       |              v              v                         |
//!       +------- Error + backoff <----+-------------------------+
//! ```
//!
//! Every wait (discovery, connect, backoff, streaming) races the stop token,
//! so a stop request is honoured within one poll or backoff interval. On
//! every exit path the link is disconnected and the router closed exactly
//! once.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, timeout_at};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::codec::PacketCodec;
use crate::router::SampleRouter;
use crate::transport::{DeviceTarget, Inbound, Link, Peripheral, Transport};
use crate::types::{ConnectionState, LossSummary, RawFrame, ReceptionClock, SequenceStep, SequenceTracker};
use crate::{Result, TelemetryError};


/// Timing and target of the connection cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub target: DeviceTarget,
    /// Longest single discovery scan
    pub discovery_timeout: Duration,
    /// Wait after a scan found nothing
    pub discovery_backoff: Duration,
    /// Longest connect plus subscribe
    pub connect_timeout: Duration,
    /// Wait after a failed connection
    pub connection_backoff: Duration,
    /// Link liveness check cadence
    pub poll_interval: Duration,
    /// Cadence of reception summaries
    pub summary_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            target: DeviceTarget::default(),
            discovery_timeout: Duration::from_secs(8),
            discovery_backoff: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            connection_backoff: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
            summary_interval: Duration::from_secs(1),
        }
    }
}

/// Running totals kept by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SupervisorCounters {
    pub frames_received: u64,
    pub samples_routed: u64,
    pub decode_errors: u64,
    pub discovery_failures: u64,
    pub connection_failures: u64,
    pub backoffs: u64,
    pub connections: u64,
    pub reconnects: u64,
}

/// Why a supervisor stopped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// The stop token fired.
    Cancelled,
    /// The link reported the end of its source.
    SourceFinished,
}

/// Summary returned by a supervisor that stopped cleanly.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorReport {
    pub exit: SupervisorExit,
    pub counters: SupervisorCounters,
    /// Sequence accounting over the whole run
    pub loss: LossSummary,
}

/// Handle to a spawned supervisor task.
#[derive(Debug)]
pub struct SupervisorHandle {
    /// Current connection state
    pub state: watch::Receiver<ConnectionState>,
    /// Stop signal shared with the task
    pub cancel: CancellationToken,
    join: JoinHandle<Result<SupervisorReport>>,
}

impl SupervisorHandle {
    /// Request a stop; the task exits within one poll or backoff interval.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stream of state changes, starting with the current state.
    pub fn states(&self) -> WatchStream<ConnectionState> {
        WatchStream::new(self.state.clone())
    }

    /// Wait until the supervisor reaches `state`.
    ///
    /// Fails if the task exits first.
    pub async fn wait_for(&mut self, state: ConnectionState) -> Result<()> {
        self.state
            .wait_for(|s| *s == state)
            .await
            .map(|_| ())
            .map_err(|_| TelemetryError::unexpected(format!("supervisor exited before reaching {state}")))
    }

    /// Wait for the task and return its outcome.
    pub async fn join(self) -> Result<SupervisorReport> {
        self.join.await.map_err(|e| {
            TelemetryError::unexpected_with_source("supervisor task failed", Box::new(e))
        })?
    }
}

enum LinkEnd {
    Lost,
    Finished,
    Cancelled,
}

enum StreamEvent {
    Cancel,
    Poll,
    Summary,
    Inbound(Result<Inbound>),
}

/// Discovery, connection and streaming state machine for one transport.
pub struct ConnectionSupervisor<T: Transport> {
    transport: T,
    codec: PacketCodec,
    router: SampleRouter,
    config: SupervisorConfig,
    clock: ReceptionClock,
    tracker: SequenceTracker,
    counters: SupervisorCounters,
    state: watch::Sender<ConnectionState>,
}

impl<T: Transport> ConnectionSupervisor<T> {
    pub fn new(transport: T, codec: PacketCodec, router: SampleRouter, config: SupervisorConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            codec,
            router,
            config,
            clock: ReceptionClock::new(),
            tracker: SequenceTracker::new(),
            counters: SupervisorCounters::default(),
            state,
        }
    }

    /// Subscribe to state changes.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Mutable access to the router, for registering plot queues before spawning.
    pub fn router_mut(&mut self) -> &mut SampleRouter {
        &mut self.router
    }

    /// Run the supervisor on its own task.
    pub fn spawn(self, cancel: CancellationToken) -> SupervisorHandle {
        let state = self.state();
        let task_cancel = cancel.clone();
        let join = tokio::spawn(async move { self.run(task_cancel).await });
        SupervisorHandle { state, cancel, join }
    }

    /// Run until stopped, until the source finishes, or until a fatal error.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<SupervisorReport> {
        info!(device = %self.config.target, "Supervisor started");

        let outcome = self.cycle(&cancel).await;
        self.set_state(ConnectionState::Disconnected);
        let closed = self.router.close();

        let exit = match (outcome, closed) {
            (Ok(exit), Ok(())) => exit,
            (Ok(_), Err(e)) => {
                error!("Closing the session failed: {e}");
                return Err(e);
            }
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    warn!("Closing the session failed: {close_err}");
                }
                error!("Supervisor stopped: {e}");
                return Err(e);
            }
        };

        info!(?exit, frames = self.counters.frames_received, "Supervisor finished");
        Ok(SupervisorReport { exit, counters: self.counters, loss: self.tracker.total() })
    }

    async fn cycle(&mut self, cancel: &CancellationToken) -> Result<SupervisorExit> {
        loop {
            if cancel.is_cancelled() {
                return Ok(SupervisorExit::Cancelled);
            }

            let peripheral = match self.discover(cancel).await {
                None => return Ok(SupervisorExit::Cancelled),
                Some(Ok(peripheral)) => peripheral,
                Some(Err(e)) if e.is_retryable() => {
                    self.counters.discovery_failures += 1;
                    warn!("Discovery failed: {e}");
                    self.set_state(ConnectionState::Error);
                    if !self.backoff(self.config.discovery_backoff, cancel).await {
                        return Ok(SupervisorExit::Cancelled);
                    }
                    continue;
                }
                Some(Err(e)) => return Err(e),
            };

            if cancel.is_cancelled() {
                return Ok(SupervisorExit::Cancelled);
            }

            let mut link = match self.open(&peripheral, cancel).await {
                None => return Ok(SupervisorExit::Cancelled),
                Some(Ok(link)) => link,
                Some(Err(e)) if e.is_retryable() => {
                    self.counters.connection_failures += 1;
                    warn!("Connection to {} failed: {e}", peripheral.address);
                    self.set_state(ConnectionState::Error);
                    if !self.backoff(self.config.connection_backoff, cancel).await {
                        return Ok(SupervisorExit::Cancelled);
                    }
                    continue;
                }
                Some(Err(e)) => return Err(e),
            };

            self.link_established(&peripheral);
            let streamed = self.stream(&mut link, cancel).await;
            if let Err(e) = link.disconnect().await {
                warn!("Disconnecting {} failed: {e}", peripheral.address);
            }
            drop(link);

            match streamed {
                Ok(LinkEnd::Lost) => {
                    warn!("Link to {} lost, rediscovering", peripheral.address);
                    self.set_state(ConnectionState::Disconnected);
                }
                Ok(LinkEnd::Finished) => {
                    info!("Source {} finished", peripheral.address);
                    return Ok(SupervisorExit::SourceFinished);
                }
                Ok(LinkEnd::Cancelled) => return Ok(SupervisorExit::Cancelled),
                Err(e) => return Err(e),
            }
        }
    }

    /// `None` when cancelled.
    async fn discover(&mut self, cancel: &CancellationToken) -> Option<Result<Peripheral>> {
        let name = match &self.config.target {
            DeviceTarget::Address(address) => return Some(Ok(Peripheral::at(address.clone()))),
            DeviceTarget::Name(name) => name.clone(),
        };

        self.set_state(ConnectionState::Discovering);
        let timeout = self.config.discovery_timeout;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            result = tokio::time::timeout(timeout, self.transport.discover(&name)) => result,
        };

        Some(match result {
            Ok(Ok(Some(peripheral))) => {
                debug!("Discovered {} at {}", name, peripheral.address);
                Ok(peripheral)
            }
            Ok(Ok(None)) | Err(_) => Err(TelemetryError::device_not_found(name, timeout)),
            Ok(Err(e)) => Err(e),
        })
    }

    /// Connect, then subscribe, both within one deadline. `None` when cancelled.
    ///
    /// A link that was opened but not subscribed is disconnected before returning.
    async fn open(
        &mut self,
        peripheral: &Peripheral,
        cancel: &CancellationToken,
    ) -> Option<Result<T::Link>> {
        self.set_state(ConnectionState::Connecting);
        let timeout = self.config.connect_timeout;
        let deadline = Instant::now() + timeout;

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            result = timeout_at(deadline, self.transport.connect(peripheral)) => result,
        };
        let mut link = match connected {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => return Some(Err(e)),
            Err(_) => return Some(Err(TelemetryError::timeout("connect", timeout))),
        };

        let subscribed = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = timeout_at(deadline, link.subscribe()) => Some(result),
        };
        let failure = match subscribed {
            Some(Ok(Ok(()))) => return Some(Ok(link)),
            Some(Ok(Err(e))) => Some(e),
            Some(Err(_)) => Some(TelemetryError::timeout("subscribe", timeout)),
            None => None,
        };

        if let Err(e) = link.disconnect().await {
            warn!("Disconnecting {} failed: {e}", peripheral.address);
        }
        failure.map(Err)
    }

    fn link_established(&mut self, peripheral: &Peripheral) {
        self.counters.connections += 1;
        if self.counters.connections > 1 {
            self.counters.reconnects += 1;
        }
        self.tracker.reset();
        self.router.link_established();
        info!(address = %peripheral.address, "Subscribed");
        self.set_state(ConnectionState::Subscribed);
    }

    async fn stream(&mut self, link: &mut T::Link, cancel: &CancellationToken) -> Result<LinkEnd> {
        let mut poll = interval_at(Instant::now() + self.config.poll_interval, self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut summary =
            interval_at(Instant::now() + self.config.summary_interval, self.config.summary_interval);
        summary.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => StreamEvent::Cancel,
                _ = poll.tick() => StreamEvent::Poll,
                _ = summary.tick() => StreamEvent::Summary,
                inbound = link.next_frame() => StreamEvent::Inbound(inbound),
            };

            match event {
                StreamEvent::Cancel => return Ok(LinkEnd::Cancelled),
                StreamEvent::Poll => {
                    if !link.is_connected().await {
                        return Ok(LinkEnd::Lost);
                    }
                }
                StreamEvent::Summary => self.log_reception(),
                StreamEvent::Inbound(Ok(Inbound::Frame(bytes))) => self.handle_frame(bytes)?,
                StreamEvent::Inbound(Ok(Inbound::Disconnected)) => return Ok(LinkEnd::Lost),
                StreamEvent::Inbound(Ok(Inbound::Finished)) => return Ok(LinkEnd::Finished),
                StreamEvent::Inbound(Err(e)) if e.is_retryable() => {
                    warn!("Link error: {e}");
                    return Ok(LinkEnd::Lost);
                }
                StreamEvent::Inbound(Err(e)) => return Err(e),
            }
        }
    }

    fn handle_frame(&mut self, bytes: Vec<u8>) -> Result<()> {
        let frame = RawFrame::new(bytes, self.clock.now());
        self.counters.frames_received += 1;
        if *self.state.borrow() != ConnectionState::Streaming {
            self.set_state(ConnectionState::Streaming);
        }

        let sample = match self.codec.decode(&frame) {
            Ok(sample) => sample,
            Err(e) => {
                self.counters.decode_errors += 1;
                warn!(len = frame.len(), "{e}");
                return Ok(());
            }
        };

        if let Some(seq) = sample.sequence {
            match self.tracker.observe(seq) {
                SequenceStep::Gap { missed } => debug!(seq, missed, "Sequence gap"),
                SequenceStep::Stale => debug!(seq, "Stale or repeated sequence"),
                SequenceStep::First | SequenceStep::InOrder => {}
            }
        }

        let report = self.router.route(&sample)?;
        self.counters.samples_routed += 1;
        trace!(plotted = report.plotted, row = ?report.row_index, "Routed sample");
        Ok(())
    }

    fn log_reception(&mut self) {
        let window = self.tracker.take_window();
        if window.expected() == 0 {
            return;
        }
        info!(
            received = window.received,
            missed = window.missed,
            stale = window.stale,
            "[RX] {:.1}% (rx={}, miss={}, exp={})",
            window.percent(),
            window.received,
            window.missed,
            window.expected()
        );
    }

    async fn backoff(&mut self, delay: Duration, cancel: &CancellationToken) -> bool {
        self.counters.backoffs += 1;
        info!("Retrying in {delay:?}");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            info!(state = %next, "Connection state changed");
        }
    }
}
