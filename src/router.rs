//! Fan-out of decoded samples.
//!
//! The supervisor task owns the [`SampleRouter`] and calls [`SampleRouter::route`]
//! once per decoded sample. Each call pushes volts into the plot queues, runs
//! the detector, and appends one row to the active session sink, in that
//! order. The detector and the sink therefore see every sample exactly once
//! and in reception order, however slow the plot consumers are.
//!
//! Sessions are started and stopped from other tasks through a
//! [`SessionControl`]; commands are applied at the start of the next `route`
//! and when the router closes.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::detector::{ChannelEvents, DerivativeEventDetector};
use crate::logger::{LogColumns, LogRow, LogSchema, RowSink, SessionLogger};
use crate::queue::{ChannelQueue, QueueReader, QueueWriter};
use crate::snapshot::SnapshotReader;
use crate::types::{Calibration, DecodedSample, PacketLayout};
use crate::{Result, TelemetryError};

/// Request to change the active session.
pub enum SessionCommand {
    /// Start logging into a fresh file in this directory.
    BeginIn(PathBuf),
    /// Start logging into a caller-provided sink.
    Begin(Box<dyn RowSink>),
    /// Close the active session, if any.
    End,
}

impl std::fmt::Debug for SessionCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionCommand::BeginIn(dir) => f.debug_tuple("BeginIn").field(dir).finish(),
            SessionCommand::Begin(_) => f.write_str("Begin(..)"),
            SessionCommand::End => f.write_str("End"),
        }
    }
}

/// Cloneable handle for starting and stopping sessions.
#[derive(Debug, Clone)]
pub struct SessionControl {
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionControl {
    /// Start a session logging to a new file in `dir`.
    pub fn begin_in(&self, dir: impl Into<PathBuf>) -> Result<()> {
        self.send(SessionCommand::BeginIn(dir.into()))
    }

    /// Start a session writing to `sink`.
    pub fn begin(&self, sink: impl RowSink + 'static) -> Result<()> {
        self.send(SessionCommand::Begin(Box::new(sink)))
    }

    /// End the active session.
    pub fn end(&self) -> Result<()> {
        self.send(SessionCommand::End)
    }

    fn send(&self, command: SessionCommand) -> Result<()> {
        self.tx.send(command).map_err(|_| TelemetryError::unexpected("sample router has shut down"))
    }
}

/// What one `route` call did.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteReport {
    /// Values pushed across all plot queues
    pub plotted: usize,
    /// Detector output for the sample
    pub events: ChannelEvents,
    /// Index of the logged row, when a session is active
    pub row_index: Option<u64>,
}

/// Owns the plot writers, the detector and the session sink.
pub struct SampleRouter {
    calibration: Calibration,
    schema: LogSchema,
    plots: HashMap<String, Vec<QueueWriter<f64>>>,
    detector: DerivativeEventDetector,
    sink: Option<Box<dyn RowSink>>,
    snapshots: SnapshotReader,
    control: SessionControl,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
}

impl SampleRouter {
    pub fn new(
        layout: &PacketLayout,
        calibration: Calibration,
        detector: DerivativeEventDetector,
        columns: LogColumns,
        snapshots: SnapshotReader,
    ) -> Self {
        let schema = LogSchema::new(layout, columns, detector.channels());
        let (tx, commands) = mpsc::unbounded_channel();
        Self {
            calibration,
            schema,
            plots: HashMap::new(),
            detector,
            sink: None,
            snapshots,
            control: SessionControl { tx },
            commands,
        }
    }

    /// Handle for starting and stopping sessions from other tasks.
    pub fn session_control(&self) -> SessionControl {
        self.control.clone()
    }

    /// Column set of session files this router writes.
    pub fn schema(&self) -> &LogSchema {
        &self.schema
    }

    /// Register a plot consumer for a logical channel.
    ///
    /// Every call creates a new queue; consumers never share one.
    pub fn plot_queue(&mut self, channel: impl Into<String>, capacity: usize) -> QueueReader<f64> {
        let (writer, reader) = ChannelQueue::split(capacity);
        self.plots.entry(channel.into()).or_default().push(writer);
        reader
    }

    pub fn has_session(&self) -> bool {
        self.sink.is_some()
    }

    /// Replace the active session; the previous one is closed first.
    pub fn begin_session(&mut self, sink: Box<dyn RowSink>) -> Result<()> {
        self.end_session()?;
        self.detector.reset();
        self.sink = Some(sink);
        info!("Session started");
        Ok(())
    }

    /// Close the active session, if any.
    pub fn end_session(&mut self) -> Result<()> {
        if let Some(mut sink) = self.sink.take() {
            sink.close()?;
            info!("Session ended");
        }
        Ok(())
    }

    /// A new link was established; derivatives restart from the next sample.
    pub fn link_established(&mut self) {
        self.detector.reset();
    }

    /// Route one sample to every consumer.
    pub fn route(&mut self, sample: &DecodedSample) -> Result<RouteReport> {
        self.apply_commands()?;

        let volts = sample.volts(&self.calibration);
        let mut plotted = 0;
        for (reading, value) in sample.readings.iter().zip(&volts) {
            if let Some(writers) = self.plots.get(sample.channel_name(reading)) {
                for writer in writers {
                    writer.push(*value);
                    plotted += 1;
                }
            }
        }

        let events = self.detector.update(sample);

        let row_index = match self.sink.as_mut() {
            Some(sink) => {
                let row = LogRow::new(sample, volts, self.snapshots.snapshot(), events.clone());
                Some(sink.append(&row)?)
            }
            None => None,
        };

        Ok(RouteReport { plotted, events, row_index })
    }

    /// Apply pending session commands and end the active session.
    pub fn close(&mut self) -> Result<()> {
        self.apply_commands()?;
        self.end_session()
    }

    fn apply_commands(&mut self) -> Result<()> {
        while let Ok(command) = self.commands.try_recv() {
            debug!(?command, "Applying session command");
            match command {
                SessionCommand::BeginIn(dir) => {
                    let logger = SessionLogger::init(&dir, self.schema.clone())?;
                    self.begin_session(Box::new(logger))?;
                }
                SessionCommand::Begin(sink) => self.begin_session(sink)?,
                SessionCommand::End => self.end_session()?,
            }
        }
        Ok(())
    }
}
