//! End-to-end: capture file -> replay link -> supervisor -> router -> CSV session

use std::path::Path;

use drumlink::codec::PacketCodec;
use drumlink::detector::DerivativeEventDetector;
use drumlink::logger::{LOG_FILE_STEM, next_session_dir};
use drumlink::router::SampleRouter;
use drumlink::snapshot::{MotorSnapshot, external_state};
use drumlink::supervisor::{ConnectionSupervisor, SupervisorExit};
use drumlink::transport::{DeviceTarget, ReplayTransport};
use drumlink::{PipelineConfig, TelemetryError};
use tokio_util::sync::CancellationToken;

const RESTING: u16 = 8192;
const STEP: u16 = 12_000;

/// Sequenced ch0/ch2/ch3 frames; frame 20 is lost and ch2 steps up at frame 30.
fn write_capture(path: &Path, codec: &PacketCodec) {
    let mut bytes = Vec::new();
    for seq in (0..50u32).filter(|s| *s != 20) {
        let ch2 = if seq >= 30 { STEP } else { RESTING };
        bytes.extend(codec.encode(seq, seq * 10, &[RESTING, ch2, RESTING]).expect("encode"));
    }
    // truncated final notification
    bytes.extend([0u8; 5]);
    std::fs::write(path, bytes).expect("write capture");
}

fn read_log(dir: &Path) -> (Vec<String>, Vec<csv::StringRecord>) {
    let path = dir.join(format!("{LOG_FILE_STEM}.csv"));
    let mut reader = csv::Reader::from_path(&path).expect("open session log");
    let header = reader.headers().expect("header").iter().map(String::from).collect();
    let rows = reader.records().collect::<Result<Vec<_>, _>>().expect("rows");
    (header, rows)
}

#[tokio::test(start_paused = true)]
async fn replayed_capture_is_logged_row_for_row() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = PipelineConfig::from_yaml_str("{}").expect("defaults");
    let layout = config.layout().expect("layout");
    let codec = PacketCodec::binary(layout.clone());

    let capture = tmp.path().join("run.bin");
    write_capture(&capture, &codec);

    let (publishers, snapshots) = external_state();
    publishers.motor.publish(MotorSnapshot { angle_deg: 45.0, speed_rpm: 2.5, running: true });

    let detector = DerivativeEventDetector::new(
        config.detector_channels(&layout),
        config.calibration,
        config.detector.dt,
        config.detector.threshold,
    );
    let mut router =
        SampleRouter::new(&layout, config.calibration, detector, config.log.columns, snapshots);
    let ch2 = router.plot_queue("ch2", config.plot.queue_capacity);

    let session = next_session_dir(tmp.path().join("sessions")).expect("session dir");
    assert!(session.file_name().unwrap().to_string_lossy().starts_with("session1_"));
    router.session_control().begin_in(&session).expect("begin");

    let transport = ReplayTransport::open(&capture, layout.frame_len());
    let supervisor_config = drumlink::SupervisorConfig {
        target: DeviceTarget::Address(capture.display().to_string()),
        ..config.supervisor()
    };
    let report = ConnectionSupervisor::new(transport, codec, router, supervisor_config)
        .run(CancellationToken::new())
        .await
        .expect("clean run");

    assert_eq!(report.exit, SupervisorExit::SourceFinished);
    assert_eq!(report.counters.frames_received, 50);
    assert_eq!(report.counters.decode_errors, 1);
    assert_eq!(report.counters.samples_routed, 49);
    assert_eq!(report.loss.received, 49);
    assert_eq!(report.loss.missed, 1);

    assert_eq!(ch2.size(), 49);
    assert!(ch2.is_orphaned());

    assert!(session.join("images").is_dir());
    let (header, rows) = read_log(&session);
    assert_eq!(
        header,
        [
            "row_index",
            "timestamp",
            "seq",
            "ms",
            "motor_angle_deg",
            "motor_speed",
            "CH0_volts",
            "CH2_volts",
            "CH3_volts",
            "ellipse_angle_deg",
            "ellipse_area_px2",
            "frame_name",
            "ch2_dv/dt",
            "ch3_dv/dt",
            "ch2_flag",
            "ch3_flag",
        ]
    );
    assert_eq!(rows.len(), 49);

    for (i, row) in rows.iter().enumerate() {
        assert_eq!(row[0], i.to_string(), "row_index is contiguous");
        assert_eq!(&row[4], "45.00");
        assert_eq!(&row[5], "2.50");
        assert_eq!(&row[9], "", "no ellipse fit published");
        assert_eq!(&row[15], "0");
    }

    let seqs: Vec<u32> = rows.iter().map(|r| r[2].parse().expect("seq")).collect();
    assert!(!seqs.contains(&20));
    assert_eq!(seqs.first(), Some(&0));
    assert_eq!(seqs.last(), Some(&49));

    let flagged: Vec<&str> = rows.iter().filter(|r| &r[14] == "1").map(|r| &r[2]).collect();
    assert_eq!(flagged, vec!["30"]);
    let step = rows.iter().find(|r| &r[2] == "30").expect("step row");
    assert!(step[12].parse::<f64>().expect("dv/dt") > 100.0);
}

#[tokio::test(start_paused = true)]
async fn missing_capture_retries_until_stopped() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = PipelineConfig::from_yaml_str("packet: { preset: four_channel }").expect("valid");
    let layout = config.layout().expect("layout");
    let codec = PacketCodec::binary(layout.clone());
    let detector = DerivativeEventDetector::new(
        config.detector_channels(&layout),
        config.calibration,
        config.detector.dt,
        config.detector.threshold,
    );
    let (_publishers, snapshots) = external_state();
    let router =
        SampleRouter::new(&layout, config.calibration, detector, config.log.columns, snapshots);

    let capture = tmp.path().join("absent.bin");
    let transport = ReplayTransport::open(&capture, layout.frame_len());
    let supervisor = ConnectionSupervisor::new(transport, codec, router, config.supervisor());

    let handle = supervisor.spawn(CancellationToken::new());
    tokio::time::sleep(std::time::Duration::from_secs(12)).await;
    assert!(!handle.is_finished());
    handle.stop();

    let report = handle.join().await.expect("clean exit");
    assert_eq!(report.exit, SupervisorExit::Cancelled);
    assert!(report.counters.discovery_failures >= 2);
    assert_eq!(report.counters.samples_routed, 0);
}

#[test]
fn invalid_config_is_rejected_before_anything_starts() {
    let err = PipelineConfig::from_yaml_str("detector: { channels: [ch7] }").expect_err("invalid");
    assert!(matches!(err, TelemetryError::Config { .. }));
    assert!(!err.is_retryable());
}
