//! Read-only snapshots of the rig's other collaborators.
//!
//! Motor control, vision tracking and the frame saver each own one publisher
//! and are the only writer of their snapshot. The router holds a
//! [`SnapshotReader`] and copies the current values once per routed sample.
//! Reads may be a little stale; this metadata is advisory.

use tokio::sync::watch;

/// Drum motor state as last published by the motor controller.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MotorSnapshot {
    /// Drum angle in degrees
    pub angle_deg: f64,
    /// Drum speed in revolutions per minute
    pub speed_rpm: f64,
    /// Whether the motor is turning
    pub running: bool,
}

/// Particle ellipse fit as last published by the vision tracker.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VisionSnapshot {
    pub ellipse_angle_deg: Option<f64>,
    pub ellipse_area_px2: Option<f64>,
}

/// Name of the most recently saved camera frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FrameSnapshot {
    pub name: String,
}

/// Everything the router copies into one log row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExternalSnapshot {
    pub motor: MotorSnapshot,
    pub vision: VisionSnapshot,
    pub frame: FrameSnapshot,
}

/// Single-writer handle for one snapshot.
#[derive(Debug)]
pub struct Publisher<T> {
    tx: watch::Sender<T>,
}

impl<T> Publisher<T> {
    /// Replace the published value.
    pub fn publish(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Edit the published value in place.
    pub fn update(&self, edit: impl FnOnce(&mut T)) {
        self.tx.send_modify(edit);
    }
}

/// The three publishers, to be handed to their owning collaborators.
#[derive(Debug)]
pub struct Publishers {
    pub motor: Publisher<MotorSnapshot>,
    pub vision: Publisher<VisionSnapshot>,
    pub frame: Publisher<FrameSnapshot>,
}

/// Read-only view over all three snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotReader {
    motor: watch::Receiver<MotorSnapshot>,
    vision: watch::Receiver<VisionSnapshot>,
    frame: watch::Receiver<FrameSnapshot>,
}

impl SnapshotReader {
    /// Copy the current values.
    pub fn snapshot(&self) -> ExternalSnapshot {
        ExternalSnapshot {
            motor: *self.motor.borrow(),
            vision: *self.vision.borrow(),
            frame: self.frame.borrow().clone(),
        }
    }

    /// A reader over fixed defaults with no live publishers.
    pub fn detached() -> Self {
        let (_, reader) = external_state();
        reader
    }
}

/// Create the publishers and a reader over them.
pub fn external_state() -> (Publishers, SnapshotReader) {
    let (motor_tx, motor) = watch::channel(MotorSnapshot::default());
    let (vision_tx, vision) = watch::channel(VisionSnapshot::default());
    let (frame_tx, frame) = watch::channel(FrameSnapshot::default());

    (
        Publishers {
            motor: Publisher { tx: motor_tx },
            vision: Publisher { tx: vision_tx },
            frame: Publisher { tx: frame_tx },
        },
        SnapshotReader { motor, vision, frame },
    )
}
