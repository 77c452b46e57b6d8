//! Discrete-time derivative and threshold event detection.
//!
//! The derivative uses the fixed nominal sample interval, not the measured
//! time between receptions, so a 100 Hz stream always divides by 0.01 s.

use crate::types::{Calibration, DecodedSample};

/// Default nominal sample interval for a 100 Hz stream.
pub const DEFAULT_DT: f64 = 0.01;

/// Default derivative threshold in volts per second.
pub const DEFAULT_THRESHOLD: f64 = 1.0;

/// Detector output for one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub channel: String,
    pub derivative: f64,
    pub flag: bool,
}

/// Detector output for one sample, in configured channel order.
pub type ChannelEvents = Vec<ChannelEvent>;

#[derive(Debug, Clone)]
struct Tracked {
    name: String,
    previous: Option<f64>,
}

/// Per-channel derivative state. Only the router mutates it.
#[derive(Debug, Clone)]
pub struct DerivativeEventDetector {
    channels: Vec<Tracked>,
    calibration: Calibration,
    dt: f64,
    threshold: f64,
}

impl DerivativeEventDetector {
    pub fn new<S: Into<String>>(
        channels: impl IntoIterator<Item = S>,
        calibration: Calibration,
        dt: f64,
        threshold: f64,
    ) -> Self {
        let channels =
            channels.into_iter().map(|c| Tracked { name: c.into(), previous: None }).collect();
        Self { channels, calibration, dt, threshold }
    }

    /// Channels the detector tracks, in output order.
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(|c| c.name.as_str())
    }

    /// Forget previous values; the next update seeds them.
    pub fn reset(&mut self) {
        for channel in &mut self.channels {
            channel.previous = None;
        }
    }

    /// Compute derivative and flag for every tracked channel.
    ///
    /// A channel missing from the sample reports 0.0/false and keeps its
    /// previous value.
    pub fn update(&mut self, sample: &DecodedSample) -> ChannelEvents {
        let mut events = Vec::with_capacity(self.channels.len());
        for tracked in &mut self.channels {
            let Some(raw) = sample.raw(&tracked.name) else {
                events.push(ChannelEvent {
                    channel: tracked.name.clone(),
                    derivative: 0.0,
                    flag: false,
                });
                continue;
            };

            let current = self.calibration.volts(raw);
            let derivative = match tracked.previous {
                Some(previous) => (current - previous) / self.dt,
                None => 0.0,
            };
            tracked.previous = Some(current);

            events.push(ChannelEvent {
                channel: tracked.name.clone(),
                derivative,
                flag: derivative > self.threshold,
            });
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PacketCodec;
    use crate::types::{PacketLayout, RawFrame, ReceptionClock};

    fn sample(codec: &PacketCodec, ch2: u16, ch3: u16) -> DecodedSample {
        let bytes = codec.encode(0, 0, &[0, ch2, ch3, 0]).expect("encode");
        codec.decode(&RawFrame::new(bytes, ReceptionClock::new().now())).expect("decode")
    }

    fn detector() -> DerivativeEventDetector {
        DerivativeEventDetector::new(["ch2", "ch3"], Calibration::default(), DEFAULT_DT, DEFAULT_THRESHOLD)
    }

    #[test]
    fn first_update_seeds_without_events() {
        let codec = PacketCodec::binary(PacketLayout::four_channel());
        let mut det = detector();
        let events = det.update(&sample(&codec, 16383, 0));
        assert_eq!(events.len(), 2);
        for event in &events {
            assert_eq!(event.derivative, 0.0);
            assert!(!event.flag);
        }
    }

    #[test]
    fn derivative_uses_nominal_dt() {
        let codec = PacketCodec::binary(PacketLayout::four_channel());
        let mut det = detector();
        det.update(&sample(&codec, 8192, 8192));
        // one count in range 4 is 3*4.096/16384 V = 0.00075 V
        let events = det.update(&sample(&codec, 8193, 8191));

        let step = 3.0 * 4.096 / 16384.0;
        assert!((events[0].derivative - step / DEFAULT_DT).abs() < 1e-9);
        assert!((events[1].derivative + step / DEFAULT_DT).abs() < 1e-9);
        assert!(!events[0].flag);
    }

    #[test]
    fn flag_is_strictly_greater_than_threshold() {
        let codec = PacketCodec::binary(PacketLayout::four_channel());
        let mut probe = detector();
        probe.update(&sample(&codec, 8192, 0));
        let exact = probe.update(&sample(&codec, 8193, 0))[0].derivative;

        let mut det = DerivativeEventDetector::new(["ch2"], Calibration::default(), DEFAULT_DT, exact);
        det.update(&sample(&codec, 8192, 0));
        let at_threshold = det.update(&sample(&codec, 8193, 0));
        assert_eq!(at_threshold[0].derivative, exact);
        assert!(!at_threshold[0].flag);

        let mut det =
            DerivativeEventDetector::new(["ch2"], Calibration::default(), DEFAULT_DT, DEFAULT_THRESHOLD);
        det.update(&sample(&codec, 8192, 0));
        let jump = det.update(&sample(&codec, 8300, 0));
        assert!(jump[0].derivative > DEFAULT_THRESHOLD);
        assert!(jump[0].flag);

        let fall = det.update(&sample(&codec, 8192, 0));
        assert!(!fall[0].flag);
    }

    #[test]
    fn reset_reseeds() {
        let codec = PacketCodec::binary(PacketLayout::four_channel());
        let mut det = detector();
        det.update(&sample(&codec, 0, 0));
        det.reset();
        let events = det.update(&sample(&codec, 16000, 16000));
        assert!(events.iter().all(|e| e.derivative == 0.0 && !e.flag));
    }

    #[test]
    fn missing_channel_reports_zero() {
        let codec = PacketCodec::binary(PacketLayout::four_channel());
        let mut det =
            DerivativeEventDetector::new(["ch9"], Calibration::default(), DEFAULT_DT, DEFAULT_THRESHOLD);
        let events = det.update(&sample(&codec, 1, 1));
        assert_eq!(events, vec![ChannelEvent { channel: "ch9".into(), derivative: 0.0, flag: false }]);
    }
}
