//! Pipeline configuration
//!
//! Loaded from YAML; every field has a default, so an empty document is a
//! valid configuration for the 100 Hz BLE firmware.
//!
//! ```rust
//! use drumlink::config::PipelineConfig;
//!
//! let config = PipelineConfig::from_yaml_str(
//!     "packet:\n  preset: four_channel\ndetector:\n  threshold: 2.5\n",
//! ).unwrap();
//! assert_eq!(config.layout().unwrap().fields.len(), 4);
//! assert_eq!(config.detector.threshold, 2.5);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::detector::{DEFAULT_DT, DEFAULT_THRESHOLD};
use crate::logger::LogColumns;
use crate::queue::DEFAULT_CAPACITY;
use crate::stream::{DEFAULT_MAX_BATCH, DEFAULT_PERIOD};
use crate::supervisor::SupervisorConfig;
use crate::transport::{DEFAULT_CHARACTERISTIC, DeviceTarget};
use crate::types::{Calibration, Framing, PacketLayout};
use crate::{Result, TelemetryError};

/// Built-in firmware variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutPreset {
    FourChannel,
    FiveChannel,
    DualBurst,
    /// `seq, ms` header followed by `packet.fields`
    #[default]
    Sequenced,
    /// `packet.custom` verbatim
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    /// `{ name: ... }` or `{ address: ... }`
    #[serde(with = "serde_yaml_ng::with::singleton_map")]
    pub target: DeviceTarget,
    /// Telemetry characteristic UUID
    pub characteristic: String,
    /// Serial bridge baud rate
    pub baud: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            target: DeviceTarget::default(),
            characteristic: DEFAULT_CHARACTERISTIC.to_string(),
            baud: 115_200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PacketConfig {
    pub preset: LayoutPreset,
    pub fields: Vec<String>,
    pub custom: Option<PacketLayout>,
    pub framing: Framing,
}

impl Default for PacketConfig {
    fn default() -> Self {
        Self {
            preset: LayoutPreset::Sequenced,
            fields: ["ch0", "ch2", "ch3"].map(String::from).to_vec(),
            custom: None,
            framing: Framing::Binary,
        }
    }
}

/// Connection timing, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingConfig {
    pub discovery_timeout_ms: u64,
    pub discovery_backoff_ms: u64,
    pub connect_timeout_ms: u64,
    pub connection_backoff_ms: u64,
    pub poll_interval_ms: u64,
    pub summary_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            discovery_timeout_ms: 8_000,
            discovery_backoff_ms: 5_000,
            connect_timeout_ms: 10_000,
            connection_backoff_ms: 2_000,
            poll_interval_ms: 100,
            summary_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlotConfig {
    /// Logical channels that get a live-plot queue
    pub channels: Vec<String>,
    pub queue_capacity: usize,
    pub drain_period_ms: u64,
    pub max_batch: usize,
}

impl Default for PlotConfig {
    fn default() -> Self {
        Self {
            channels: ["ch2", "ch3"].map(String::from).to_vec(),
            queue_capacity: DEFAULT_CAPACITY,
            drain_period_ms: DEFAULT_PERIOD.as_millis() as u64,
            max_batch: DEFAULT_MAX_BATCH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectorConfig {
    /// Fields to watch; unset means `ch2` and `ch3` where the layout has them
    pub channels: Option<Vec<String>>,
    /// Nominal sample interval in seconds
    pub dt: f64,
    /// Derivative threshold in volts per second
    pub threshold: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self { channels: None, dt: DEFAULT_DT, threshold: DEFAULT_THRESHOLD }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Start a session as soon as the pipeline starts
    pub enabled: bool,
    /// Parent of the `session<N>_<date>` directories
    pub base_dir: PathBuf,
    pub columns: LogColumns,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { enabled: true, base_dir: PathBuf::from("sessions"), columns: LogColumns::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplayConfig {
    pub rate_hz: f64,
    pub speed: f64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self { rate_hz: 100.0, speed: 1.0 }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub device: DeviceConfig,
    pub packet: PacketConfig,
    pub calibration: Calibration,
    pub timing: TimingConfig,
    pub plot: PlotConfig,
    pub detector: DetectorConfig,
    pub log: LogConfig,
    pub replay: ReplayConfig,
}

impl PipelineConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)
            .map_err(|e| TelemetryError::config(format!("invalid YAML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            TelemetryError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        debug!("Loaded configuration from {}", path.display());
        Self::from_yaml_str(&yaml)
    }

    /// The session's packet layout.
    pub fn layout(&self) -> Result<PacketLayout> {
        let layout = match self.packet.preset {
            LayoutPreset::FourChannel => PacketLayout::four_channel(),
            LayoutPreset::FiveChannel => PacketLayout::five_channel(),
            LayoutPreset::DualBurst => PacketLayout::dual_burst(),
            LayoutPreset::Sequenced => {
                let names: Vec<&str> = self.packet.fields.iter().map(String::as_str).collect();
                PacketLayout::sequenced(&names)
            }
            LayoutPreset::Custom => self.packet.custom.clone().ok_or_else(|| {
                TelemetryError::config("packet.preset is custom but packet.custom is missing")
            })?,
        };
        layout.validate()?;
        Ok(layout)
    }

    /// Detector channels resolved against the layout.
    pub fn detector_channels(&self, layout: &PacketLayout) -> Vec<String> {
        match &self.detector.channels {
            Some(channels) => channels.clone(),
            None => ["ch2", "ch3"]
                .into_iter()
                .filter(|c| layout.field_index(c).is_some())
                .map(String::from)
                .collect(),
        }
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        let t = &self.timing;
        SupervisorConfig {
            target: self.device.target.clone(),
            discovery_timeout: Duration::from_millis(t.discovery_timeout_ms),
            discovery_backoff: Duration::from_millis(t.discovery_backoff_ms),
            connect_timeout: Duration::from_millis(t.connect_timeout_ms),
            connection_backoff: Duration::from_millis(t.connection_backoff_ms),
            poll_interval: Duration::from_millis(t.poll_interval_ms),
            summary_interval: Duration::from_millis(t.summary_interval_ms),
        }
    }

    pub fn drain_period(&self) -> Duration {
        Duration::from_millis(self.plot.drain_period_ms)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let layout = self.layout()?;

        let t = &self.timing;
        for (name, value) in [
            ("timing.discovery_timeout_ms", t.discovery_timeout_ms),
            ("timing.discovery_backoff_ms", t.discovery_backoff_ms),
            ("timing.connect_timeout_ms", t.connect_timeout_ms),
            ("timing.connection_backoff_ms", t.connection_backoff_ms),
            ("timing.poll_interval_ms", t.poll_interval_ms),
            ("timing.summary_interval_ms", t.summary_interval_ms),
            ("plot.drain_period_ms", self.plot.drain_period_ms),
        ] {
            if value == 0 {
                return Err(TelemetryError::config(format!("{name} must be greater than zero")));
            }
        }
        if self.plot.queue_capacity == 0 {
            return Err(TelemetryError::config("plot.queue_capacity must be greater than zero"));
        }
        if self.plot.max_batch == 0 {
            return Err(TelemetryError::config("plot.max_batch must be greater than zero"));
        }

        let channels = layout.channels();
        if let Some(missing) = self.plot.channels.iter().find(|c| !channels.contains(&c.as_str())) {
            return Err(TelemetryError::config(format!("plot channel '{missing}' is not in the layout")));
        }
        if let Some(missing) =
            self.detector_channels(&layout).iter().find(|c| layout.field_index(c).is_none())
        {
            return Err(TelemetryError::config(format!(
                "detector channel '{missing}' is not in the layout"
            )));
        }

        if !(self.detector.dt > 0.0 && self.detector.dt.is_finite()) {
            return Err(TelemetryError::config("detector.dt must be a positive number of seconds"));
        }
        if !self.detector.threshold.is_finite() {
            return Err(TelemetryError::config("detector.threshold must be finite"));
        }
        if !(1..=7).contains(&self.calibration.input_range) {
            return Err(TelemetryError::config("calibration.input_range must be between 1 and 7"));
        }
        if !(self.replay.rate_hz > 0.0 && self.replay.speed > 0.0) {
            return Err(TelemetryError::config("replay.rate_hz and replay.speed must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = PipelineConfig::from_yaml_str("{}").expect("defaults are valid");
        assert_eq!(config, PipelineConfig::default());

        let supervisor = config.supervisor();
        assert_eq!(supervisor.discovery_timeout, Duration::from_secs(8));
        assert_eq!(supervisor.discovery_backoff, Duration::from_secs(5));
        assert_eq!(supervisor.connect_timeout, Duration::from_secs(10));
        assert_eq!(supervisor.connection_backoff, Duration::from_secs(2));
        assert_eq!(supervisor.poll_interval, Duration::from_millis(100));
        assert_eq!(supervisor.target, DeviceTarget::Name("ESP32-Analog-100Hz".into()));

        let layout = config.layout().expect("layout");
        assert_eq!(layout, PacketLayout::sequenced(&["ch0", "ch2", "ch3"]));
        assert_eq!(config.detector_channels(&layout), vec!["ch2", "ch3"]);
    }

    #[test]
    fn parses_a_full_document() {
        let yaml = r#"
device:
  target:
    address: "AA:BB:CC:DD:EE:FF"
packet:
  preset: custom
  framing: text
  custom:
    sequence_header: true
    fields:
      - { name: probe, channel: probe }
      - { name: ref, channel: probe }
calibration:
  input_range: 6
timing:
  discovery_backoff_ms: 1000
plot:
  channels: [probe]
detector:
  channels: [probe]
  threshold: 0.5
log:
  enabled: false
  columns:
    motor_speed: false
"#;
        let config = PipelineConfig::from_yaml_str(yaml).expect("valid");
        assert_eq!(config.device.target, DeviceTarget::Address("AA:BB:CC:DD:EE:FF".into()));
        assert_eq!(config.packet.framing, Framing::Text);
        assert_eq!(config.calibration.input_range, 6);
        assert_eq!(config.calibration.vref, 4.096);
        assert_eq!(config.supervisor().discovery_backoff, Duration::from_secs(1));
        assert_eq!(config.layout().expect("layout").channels(), vec!["probe"]);
        assert!(!config.log.enabled);
        assert!(!config.log.columns.motor_speed);
        assert!(config.log.columns.vision);
    }

    #[test]
    fn device_target_is_a_single_key_map() {
        let config = PipelineConfig::from_yaml_str("device: { target: { name: Rig-2 } }").expect("valid");
        assert_eq!(config.device.target, DeviceTarget::Name("Rig-2".into()));

        let device = DeviceConfig { target: DeviceTarget::Address("/dev/ttyUSB1".into()), ..DeviceConfig::default() };
        let yaml = serde_yaml_ng::to_string(&device).expect("serialize");
        assert!(yaml.contains("address:"), "{yaml}");
        let parsed: DeviceConfig = serde_yaml_ng::from_str(&yaml).expect("reparse");
        assert_eq!(parsed, device);
    }

    #[test]
    fn dual_burst_drops_default_detector_channels() {
        let config =
            PipelineConfig::from_yaml_str("packet: { preset: dual_burst }\nplot: { channels: [a0, a1] }\n")
                .expect("valid");
        let layout = config.layout().expect("layout");
        assert!(config.detector_channels(&layout).is_empty());
    }

    #[test]
    fn rejects_unusable_values() {
        let cases = [
            "timing: { poll_interval_ms: 0 }",
            "plot: { queue_capacity: 0 }",
            "plot: { channels: [ch9] }",
            "detector: { channels: [ch4] }",
            "detector: { dt: 0.0 }",
            "calibration: { input_range: 9 }",
            "packet: { preset: custom }",
            "packet: { fields: [] }",
            "packet: { fields: [ch2, ch2] }",
            "unknown_section: 1",
        ];
        for yaml in cases {
            let err = PipelineConfig::from_yaml_str(yaml).expect_err(yaml);
            assert!(matches!(err, TelemetryError::Config { .. }), "{yaml}: {err}");
        }
    }

    #[test]
    fn load_reports_missing_file() {
        let err = PipelineConfig::load("/nonexistent/drumlink.yaml").expect_err("missing");
        assert!(matches!(err, TelemetryError::Config { .. }));
    }
}
