//! Append-only session logging.
//!
//! A session is one CSV file in one session directory. Every row is flushed
//! as soon as it is written, so a crash loses at most the row in flight. A
//! session file is never reopened: initializing again starts a new file.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::detector::ChannelEvents;
use crate::snapshot::ExternalSnapshot;
use crate::types::{DecodedSample, PacketLayout, ReceptionTime};
use crate::{Result, TelemetryError};

/// Base name of session log files.
pub const LOG_FILE_STEM: &str = "experiment_log";

/// Subdirectory reserved for the vision collaborator's saved frames.
pub const IMAGES_DIR: &str = "images";

/// Optional column groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogColumns {
    /// Add `motor_speed` after `motor_angle_deg`
    pub motor_speed: bool,
    /// Add `ellipse_angle_deg, ellipse_area_px2, frame_name`
    pub vision: bool,
}

impl Default for LogColumns {
    fn default() -> Self {
        Self { motor_speed: true, vision: true }
    }
}

/// Column set of one session file, fixed once the file is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSchema {
    sequence_header: bool,
    columns: LogColumns,
    fields: Vec<String>,
    event_channels: Vec<String>,
}

impl LogSchema {
    pub fn new<S: Into<String>>(
        layout: &PacketLayout,
        columns: LogColumns,
        event_channels: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            sequence_header: layout.sequence_header,
            columns,
            fields: layout.fields.iter().map(|f| f.name.clone()).collect(),
            event_channels: event_channels.into_iter().map(Into::into).collect(),
        }
    }

    /// Header row in column order.
    pub fn header(&self) -> Vec<String> {
        let mut header = vec!["row_index".to_string(), "timestamp".to_string()];
        if self.sequence_header {
            header.extend(["seq".to_string(), "ms".to_string()]);
        }
        header.push("motor_angle_deg".to_string());
        if self.columns.motor_speed {
            header.push("motor_speed".to_string());
        }
        header.extend(self.fields.iter().map(|f| format!("{}_volts", f.to_uppercase())));
        if self.columns.vision {
            header.extend(
                ["ellipse_angle_deg", "ellipse_area_px2", "frame_name"].map(String::from),
            );
        }
        header.extend(self.event_channels.iter().map(|c| format!("{c}_dv/dt")));
        header.extend(self.event_channels.iter().map(|c| format!("{c}_flag")));
        header
    }

    fn render(&self, row_index: u64, row: &LogRow) -> Result<Vec<String>> {
        if row.volts.len() != self.fields.len() || row.events.len() != self.event_channels.len() {
            return Err(TelemetryError::unexpected(format!(
                "row has {} volts and {} events, schema expects {} and {}",
                row.volts.len(),
                row.events.len(),
                self.fields.len(),
                self.event_channels.len()
            )));
        }

        let mut record = vec![row_index.to_string(), format!("{:.6}", row.timestamp.epoch_seconds())];
        if self.sequence_header {
            record.push(row.sequence.map(|s| s.to_string()).unwrap_or_default());
            record.push(row.device_ms.map(|m| m.to_string()).unwrap_or_default());
        }
        record.push(format!("{:.2}", row.snapshot.motor.angle_deg));
        if self.columns.motor_speed {
            record.push(format!("{:.2}", row.snapshot.motor.speed_rpm));
        }
        record.extend(row.volts.iter().map(|v| format!("{v:.6}")));
        if self.columns.vision {
            let vision = &row.snapshot.vision;
            record.push(vision.ellipse_angle_deg.map(|a| format!("{a:.2}")).unwrap_or_default());
            record.push(vision.ellipse_area_px2.map(|a| format!("{a:.1}")).unwrap_or_default());
            record.push(row.snapshot.frame.name.clone());
        }
        record.extend(row.events.iter().map(|e| format!("{:.6}", e.derivative)));
        record.extend(row.events.iter().map(|e| if e.flag { "1" } else { "0" }.to_string()));
        Ok(record)
    }
}

/// One synchronized record: a sample's volts plus the state around it.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRow {
    pub timestamp: ReceptionTime,
    pub sequence: Option<u32>,
    pub device_ms: Option<u32>,
    pub volts: Vec<f64>,
    pub snapshot: ExternalSnapshot,
    pub events: ChannelEvents,
}

impl LogRow {
    /// Build a row from a sample and the volts already computed for it.
    pub fn new(
        sample: &DecodedSample,
        volts: Vec<f64>,
        snapshot: ExternalSnapshot,
        events: ChannelEvents,
    ) -> Self {
        Self {
            timestamp: sample.received_at,
            sequence: sample.sequence,
            device_ms: sample.device_ms,
            volts,
            snapshot,
            events,
        }
    }
}

/// Destination for persisted rows.
pub trait RowSink: Send {
    /// Persist one row; returns its index within the session.
    fn append(&mut self, row: &LogRow) -> Result<u64>;

    /// Flush and release the destination.
    fn close(&mut self) -> Result<()>;
}

/// CSV session log.
pub struct SessionLogger {
    dir: PathBuf,
    path: PathBuf,
    schema: LogSchema,
    writer: Option<csv::Writer<File>>,
    next_index: u64,
}

impl SessionLogger {
    /// Create `dir` and `dir/images`, open a fresh log file and write the header.
    pub fn init(dir: impl AsRef<Path>, schema: LogSchema) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let images = dir.join(IMAGES_DIR);
        fs::create_dir_all(&images).map_err(|e| TelemetryError::log_error(images.clone(), e))?;

        let (path, file) = create_fresh_file(&dir)?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(schema.header()).map_err(|e| TelemetryError::log_error(path.clone(), e.into()))?;
        writer.flush().map_err(|e| TelemetryError::log_error(path.clone(), e))?;

        info!("Logging to {}", path.display());
        Ok(Self { dir, path, schema, writer: Some(writer), next_index: 0 })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn schema(&self) -> &LogSchema {
        &self.schema
    }

    /// Rows written so far.
    pub fn rows(&self) -> u64 {
        self.next_index
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }
}

impl RowSink for SessionLogger {
    fn append(&mut self, row: &LogRow) -> Result<u64> {
        let record = self.schema.render(self.next_index, row)?;
        let writer = self.writer.as_mut().ok_or_else(|| {
            TelemetryError::log_error(self.path.clone(), io::Error::other("session log is closed"))
        })?;

        writer.write_record(&record).map_err(|e| TelemetryError::log_error(self.path.clone(), e.into()))?;
        writer.flush().map_err(|e| TelemetryError::log_error(self.path.clone(), e))?;

        let index = self.next_index;
        self.next_index += 1;
        Ok(index)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(|e| TelemetryError::log_error(self.path.clone(), e))?;
            info!("Session log closed after {} rows: {}", self.next_index, self.path.display());
        }
        Ok(())
    }
}

impl Drop for SessionLogger {
    fn drop(&mut self) {
        if self.writer.is_some() {
            debug!("Dropping open session log {}", self.path.display());
            let _ = self.close();
        }
    }
}

fn create_fresh_file(dir: &Path) -> Result<(PathBuf, File)> {
    for n in 0..10_000u32 {
        let name = match n {
            0 => format!("{LOG_FILE_STEM}.csv"),
            n => format!("{LOG_FILE_STEM}_{n}.csv"),
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(TelemetryError::log_error(path, e)),
        }
    }
    Err(TelemetryError::log_error(
        dir.to_path_buf(),
        io::Error::other("no free session log file name"),
    ))
}

/// Pick the next `session<N>_<date>` directory under `base`.
///
/// `N` is one past the highest existing `session<k>` entry. The base
/// directory is created; the session directory itself is left to
/// [`SessionLogger::init`].
pub fn next_session_dir(base: impl AsRef<Path>) -> Result<PathBuf> {
    let base = base.as_ref();
    fs::create_dir_all(base).map_err(|e| TelemetryError::log_error(base.to_path_buf(), e))?;

    let mut highest = 0u32;
    let entries = fs::read_dir(base).map_err(|e| TelemetryError::log_error(base.to_path_buf(), e))?;
    for entry in entries.flatten() {
        if !entry.path().is_dir() {
            continue;
        }
        if let Some(index) = session_index(&entry.file_name().to_string_lossy()) {
            highest = highest.max(index);
        }
    }

    let stamp = Local::now().format("%Y-%m-%d_%H_%M");
    Ok(base.join(format!("session{}_{stamp}", highest + 1)))
}

fn session_index(name: &str) -> Option<u32> {
    let digits: String =
        name.strip_prefix("session")?.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::ChannelEvent;
    use crate::snapshot::{FrameSnapshot, MotorSnapshot, VisionSnapshot};
    use crate::types::ReceptionClock;
    use chrono::DateTime;
    use std::time::Duration;

    fn schema() -> LogSchema {
        LogSchema::new(
            &PacketLayout::sequenced(&["ch0", "ch2", "ch3"]),
            LogColumns::default(),
            ["ch2", "ch3"],
        )
    }

    fn row(ms: u64) -> LogRow {
        let epoch = DateTime::from_timestamp(1_700_000_000, 0).expect("epoch");
        LogRow {
            timestamp: ReceptionClock::starting_at(epoch).at(Duration::from_millis(ms)),
            sequence: Some(ms as u32),
            device_ms: Some(ms as u32 * 10),
            volts: vec![0.0, 1.25, -6.144],
            snapshot: ExternalSnapshot {
                motor: MotorSnapshot { angle_deg: 45.456, speed_rpm: 1.0, running: true },
                vision: VisionSnapshot { ellipse_angle_deg: Some(12.345), ellipse_area_px2: None },
                frame: FrameSnapshot { name: "frame_0001.jpg".into() },
            },
            events: vec![
                ChannelEvent { channel: "ch2".into(), derivative: 2.5, flag: true },
                ChannelEvent { channel: "ch3".into(), derivative: 0.0, flag: false },
            ],
        }
    }

    #[test]
    fn header_follows_column_order() {
        assert_eq!(
            schema().header(),
            vec![
                "row_index", "timestamp", "seq", "ms", "motor_angle_deg", "motor_speed",
                "CH0_volts", "CH2_volts", "CH3_volts", "ellipse_angle_deg", "ellipse_area_px2",
                "frame_name", "ch2_dv/dt", "ch3_dv/dt", "ch2_flag", "ch3_flag",
            ]
        );

        let minimal = LogSchema::new(
            &PacketLayout::four_channel(),
            LogColumns { motor_speed: false, vision: false },
            Vec::<String>::new(),
        );
        assert_eq!(
            minimal.header(),
            vec!["row_index", "timestamp", "motor_angle_deg", "CH0_volts", "CH2_volts", "CH3_volts", "CH4_volts"]
        );
    }

    #[test]
    fn rows_are_formatted_with_fixed_precision() {
        let record = schema().render(3, &row(1500)).expect("render");
        assert_eq!(
            record,
            vec![
                "3", "1700000001.500000", "1500", "15000", "45.46", "1.00", "0.000000",
                "1.250000", "-6.144000", "12.35", "", "frame_0001.jpg", "2.500000", "0.000000",
                "1", "0",
            ]
        );
    }

    #[test]
    fn mismatched_row_is_rejected() {
        let mut bad = row(0);
        bad.volts.pop();
        assert!(schema().render(0, &bad).is_err());
    }

    #[test]
    fn appends_are_indexed_and_flushed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("session1");
        let mut logger = SessionLogger::init(&dir, schema()).expect("init");
        assert!(dir.join(IMAGES_DIR).is_dir());

        for i in 0..3 {
            assert_eq!(logger.append(&row(i * 10)).expect("append"), i);
        }

        // flushed per row: visible before close
        let contents = fs::read_to_string(logger.path()).expect("read");
        assert_eq!(contents.lines().count(), 4);

        logger.close().expect("close");
        assert!(logger.is_closed());
        logger.close().expect("second close is a no-op");
        assert!(logger.append(&row(99)).is_err());
    }

    #[test]
    fn reinit_never_reuses_a_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut first = SessionLogger::init(tmp.path(), schema()).expect("first");
        first.append(&row(0)).expect("append");
        first.close().expect("close");

        let second = SessionLogger::init(tmp.path(), schema()).expect("second");
        assert_ne!(first.path(), second.path());
        assert!(second.path().ends_with("experiment_log_1.csv"));

        let original = fs::read_to_string(first.path()).expect("read");
        assert_eq!(original.lines().count(), 2);
    }

    #[test]
    fn session_dirs_count_up() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::create_dir(tmp.path().join("session1_2024-01-01_10_00")).expect("mkdir");
        fs::create_dir(tmp.path().join("session7_2024-01-02_10_00")).expect("mkdir");
        fs::create_dir(tmp.path().join("notes")).expect("mkdir");

        let next = next_session_dir(tmp.path()).expect("next");
        let name = next.file_name().expect("name").to_string_lossy().into_owned();
        assert!(name.starts_with("session8_"), "{name}");
    }

    #[test]
    fn session_index_parsing() {
        assert_eq!(session_index("session12_2024"), Some(12));
        assert_eq!(session_index("session"), None);
        assert_eq!(session_index("sessions"), None);
        assert_eq!(session_index("my_session3"), None);
    }
}
