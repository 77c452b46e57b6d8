//! Telemetry ingestion and multi-sensor logging for a rotating-drum rig.
//!
//! Drumlink connects to an ESP32 analog front end over Bluetooth LE (or a
//! serial bridge, or a recorded capture), decodes its fixed-width frames,
//! and fans every sample out to live-plot queues, a derivative event
//! detector and a CSV session log that also carries the latest motor and
//! vision state.
//!
//! # Features
//!
//! - **Supervised links**: discovery, connection and reconnection with fixed
//!   backoffs, one link at a time
//! - **Layouts**: the deployed firmware variants plus custom layouts from config
//! - **Bounded plot queues**: drop-oldest buffers that never stall ingestion
//! - **Session logs**: one CSV row per sample, flushed as it is written
//!
//! ## Example (replay a capture)
//!
//! ```rust,no_run
//! use drumlink::codec::PacketCodec;
//! use drumlink::detector::DerivativeEventDetector;
//! use drumlink::logger::LogColumns;
//! use drumlink::router::SampleRouter;
//! use drumlink::snapshot::SnapshotReader;
//! use drumlink::supervisor::{ConnectionSupervisor, SupervisorConfig};
//! use drumlink::transport::{DeviceTarget, ReplayTransport};
//! use drumlink::types::{Calibration, PacketLayout};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let layout = PacketLayout::sequenced(&["ch0", "ch2", "ch3"]);
//!     let codec = PacketCodec::binary(layout.clone());
//!     let detector = DerivativeEventDetector::new(["ch2", "ch3"], Calibration::default(), 0.01, 1.0);
//!     let mut router = SampleRouter::new(
//!         &layout,
//!         Calibration::default(),
//!         detector,
//!         LogColumns::default(),
//!         SnapshotReader::detached(),
//!     );
//!     router.session_control().begin_in("sessions/replay")?;
//!
//!     let transport = ReplayTransport::open("capture.bin", layout.frame_len());
//!     let config = SupervisorConfig {
//!         target: DeviceTarget::Address("capture.bin".into()),
//!         ..SupervisorConfig::default()
//!     };
//!     let report = ConnectionSupervisor::new(transport, codec, router, config)
//!         .run(CancellationToken::new())
//!         .await?;
//!     println!("{} samples logged", report.counters.samples_routed);
//!     Ok(())
//! }
//! ```

// Core types and error handling
mod error;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Per-sample processing
pub mod codec;
pub mod detector;
pub mod logger;
pub mod queue;
pub mod router;
pub mod snapshot;
pub mod stream;

// Links and their supervision
pub mod config;
pub mod supervisor;
pub mod transport;

// Core exports
pub use error::*;
pub use types::*;

pub use codec::PacketCodec;
pub use config::PipelineConfig;
pub use detector::DerivativeEventDetector;
pub use logger::{RowSink, SessionLogger};
pub use queue::ChannelQueue;
pub use router::{SampleRouter, SessionControl};
pub use supervisor::{ConnectionSupervisor, SupervisorConfig, SupervisorHandle};
