//! Serial bridge transport
//!
//! The USB bridge forwards each notification as a text line
//! `seq,ms,v0,v1,...` and interleaves its own status lines: reception
//! summaries such as `[BLE RX] 99.0% (rx=99, miss=1, exp=100)` and motor
//! markers (`RUNNING`, `STOP`, `PROBE_LOW`). Data lines are handed to the
//! supervisor as text frames; everything else is logged here.

use std::io::{BufRead, BufReader, ErrorKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serialport::{SerialPort, SerialPortType};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Inbound, Link, Peripheral, Transport};
use crate::snapshot::{MotorSnapshot, Publisher};
use crate::types::LossSummary;
use crate::{Result, TelemetryError};

/// Bridge firmware baud rate.
pub const DEFAULT_BAUD: u32 = 115_200;

const READ_TIMEOUT: Duration = Duration::from_millis(100);
const LINE_BUFFER: usize = 1024;

/// Transport over a USB serial port
pub struct SerialTransport {
    baud: u32,
    motor: Option<Arc<Publisher<MotorSnapshot>>>,
}

impl Default for SerialTransport {
    fn default() -> Self {
        Self::new(DEFAULT_BAUD)
    }
}

impl SerialTransport {
    pub fn new(baud: u32) -> Self {
        Self { baud, motor: None }
    }

    /// Publish `RUNNING`/`STOP` markers into the motor snapshot.
    pub fn with_motor(mut self, motor: Arc<Publisher<MotorSnapshot>>) -> Self {
        self.motor = Some(motor);
        self
    }
}

#[async_trait::async_trait]
impl Transport for SerialTransport {
    type Link = SerialLink;

    /// Match `name` against port names and USB product strings.
    async fn discover(&mut self, name: &str) -> Result<Option<Peripheral>> {
        let ports = serialport::available_ports().map_err(|e| {
            TelemetryError::connection_failed_with_source("Cannot enumerate serial ports", Box::new(e))
        })?;

        let found = ports.into_iter().find_map(|port| {
            let product = match &port.port_type {
                SerialPortType::UsbPort(usb) => usb.product.clone(),
                _ => None,
            };
            let matches = port.port_name.contains(name)
                || product.as_deref().is_some_and(|p| p.contains(name));
            matches.then(|| Peripheral { address: port.port_name, name: product })
        });
        Ok(found)
    }

    async fn connect(&mut self, peripheral: &Peripheral) -> Result<SerialLink> {
        let port = serialport::new(&peripheral.address, self.baud)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| {
                TelemetryError::connection_failed_with_source(
                    format!("Cannot open {}", peripheral.address),
                    Box::new(e),
                )
            })?;
        info!("Opened {} at {} baud", peripheral.address, self.baud);

        Ok(SerialLink {
            port: Some(port),
            lines: None,
            alive: Arc::new(AtomicBool::new(true)),
            stop: Arc::new(AtomicBool::new(false)),
            motor: self.motor.clone(),
        })
    }
}

/// An open serial port
pub struct SerialLink {
    port: Option<Box<dyn SerialPort>>,
    lines: Option<mpsc::Receiver<Vec<u8>>>,
    alive: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    motor: Option<Arc<Publisher<MotorSnapshot>>>,
}

#[async_trait::async_trait]
impl Link for SerialLink {
    /// Start the blocking line reader.
    async fn subscribe(&mut self) -> Result<()> {
        let port = self
            .port
            .take()
            .ok_or_else(|| TelemetryError::unexpected("serial link already subscribed"))?;

        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        let alive = Arc::clone(&self.alive);
        let stop = Arc::clone(&self.stop);
        tokio::task::spawn_blocking(move || read_lines(port, tx, &stop, &alive));
        self.lines = Some(rx);
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Inbound> {
        let lines = self
            .lines
            .as_mut()
            .ok_or_else(|| TelemetryError::unexpected("next_frame called before subscribe"))?;

        loop {
            let Some(raw) = lines.recv().await else {
                return Ok(Inbound::Disconnected);
            };
            let text = String::from_utf8_lossy(&raw);
            match classify_line(&text) {
                BridgeLine::Data(line) => return Ok(Inbound::Frame(line.as_bytes().to_vec())),
                BridgeLine::Summary(summary) => info!(
                    received = summary.received,
                    missed = summary.missed,
                    expected = summary.expected(),
                    "[BLE RX] {:.1}%",
                    summary.percent()
                ),
                BridgeLine::Marker(marker) => handle_marker(self.motor.as_deref(), marker),
                BridgeLine::Other(line) => debug!("[DEV] {line}"),
                BridgeLine::Empty => {}
            }
        }
    }

    async fn is_connected(&mut self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        self.lines = None;
        self.port = None;
        Ok(())
    }
}

fn handle_marker(motor: Option<&Publisher<MotorSnapshot>>, marker: Marker) {
    match marker {
        Marker::ProbeLow => info!("Probe activated"),
        Marker::Running | Marker::Stop => {
            let running = marker == Marker::Running;
            debug!(running, "Motor marker");
            if let Some(motor) = motor {
                motor.update(|m| m.running = running);
            }
        }
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn read_lines(
    port: Box<dyn SerialPort>,
    tx: mpsc::Sender<Vec<u8>>,
    stop: &AtomicBool,
    alive: &AtomicBool,
) {
    let mut reader = BufReader::new(port);
    let mut line = Vec::new();

    while !stop.load(Ordering::Relaxed) {
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => {
                debug!("Serial port reached end of stream");
                break;
            }
            Ok(_) if line.ends_with(b"\n") => {
                if tx.blocking_send(std::mem::take(&mut line)).is_err() {
                    break;
                }
            }
            // partial line; keep it and read on
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::TimedOut => {}
            Err(e) => {
                warn!("Serial read failed: {e}");
                break;
            }
        }
    }

    alive.store(false, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Running,
    Stop,
    ProbeLow,
}

#[derive(Debug, PartialEq)]
enum BridgeLine<'a> {
    Data(&'a str),
    Summary(LossSummary),
    Marker(Marker),
    Other(&'a str),
    Empty,
}

fn classify_line(raw: &str) -> BridgeLine<'_> {
    let line = raw.trim();
    if line.is_empty() {
        return BridgeLine::Empty;
    }
    if let Some(summary) = parse_rx_summary(line) {
        return BridgeLine::Summary(summary);
    }
    match line {
        "RUNNING" => return BridgeLine::Marker(Marker::Running),
        "STOP" => return BridgeLine::Marker(Marker::Stop),
        "PROBE_LOW" => return BridgeLine::Marker(Marker::ProbeLow),
        _ => {}
    }
    let header = line.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("seq"));
    if line.contains(',') && !line.starts_with('[') && !header {
        BridgeLine::Data(line)
    } else {
        BridgeLine::Other(line)
    }
}

/// Parse `[BLE RX] 99.0% (rx=99, miss=1, exp=100)`.
fn parse_rx_summary(line: &str) -> Option<LossSummary> {
    let rest = line.strip_prefix("[BLE RX]")?;
    let counts = rest.split_once('(')?.1.strip_suffix(')')?;

    let mut received = None;
    let mut missed = None;
    for part in counts.split(',') {
        let (key, value) = part.trim().split_once('=')?;
        let value: u64 = value.trim().parse().ok()?;
        match key {
            "rx" => received = Some(value),
            "miss" => missed = Some(value),
            _ => {}
        }
    }
    Some(LossSummary { received: received?, missed: missed?, stale: 0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_lines_pass_through_trimmed() {
        assert_eq!(classify_line("12,120,8192,8000,7000\r\n"), BridgeLine::Data("12,120,8192,8000,7000"));
    }

    #[test]
    fn status_lines_are_recognised() {
        assert_eq!(
            classify_line("[BLE RX] 99.0% (rx=99, miss=1, exp=100)"),
            BridgeLine::Summary(LossSummary { received: 99, missed: 1, stale: 0 })
        );
        assert_eq!(classify_line("RUNNING\n"), BridgeLine::Marker(Marker::Running));
        assert_eq!(classify_line("STOP"), BridgeLine::Marker(Marker::Stop));
        assert_eq!(classify_line("PROBE_LOW"), BridgeLine::Marker(Marker::ProbeLow));
        assert_eq!(classify_line("seq,ms,ch0,ch2,ch3"), BridgeLine::Other("seq,ms,ch0,ch2,ch3"));
        assert_eq!(classify_line("[BOOT] ready"), BridgeLine::Other("[BOOT] ready"));
        assert_eq!(classify_line("  \r\n"), BridgeLine::Empty);
    }

    #[test]
    fn malformed_summary_is_not_a_summary() {
        assert_eq!(parse_rx_summary("[BLE RX] 99.0% (rx=99)"), None);
        assert_eq!(parse_rx_summary("[BLE RX] 99.0% (rx=x, miss=1, exp=100)"), None);
        let summary = parse_rx_summary("[BLE RX] 50.0% (rx=50, miss=50, exp=100)").expect("valid");
        assert_eq!(summary.expected(), 100);
    }
}
