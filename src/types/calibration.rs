//! Raw ADC count to volts conversion

use serde::{Deserialize, Serialize};

/// Full-scale count of the 14-bit converter.
pub const FULL_SCALE: f64 = (1u32 << 14) as f64;

/// Default converter reference voltage.
pub const DEFAULT_VREF: f64 = 4.096;

/// Default input range code (bipolar ±1.5·vref).
pub const DEFAULT_INPUT_RANGE: u8 = 4;

/// Convert one raw count to volts for the converter's input range code.
///
/// Range codes 1-7 select the piecewise-linear transfer functions of the
/// converter; any other code yields `0.0`.
pub fn raw_to_volts(raw: u32, input_range: u8, vref: f64) -> f64 {
    let ratio = raw as f64 / FULL_SCALE;
    match input_range {
        1 => ratio * 3.0 * vref / 2.0 - 1.5 * vref / 2.0,
        2 => ratio * 3.0 * vref / 2.0 - 3.0 * vref / 2.0,
        3 => ratio * 3.0 * vref / 2.0,
        4 => ratio * 3.0 * vref - 1.5 * vref,
        5 => ratio * 3.0 * vref - 3.0 * vref,
        6 => ratio * 3.0 * vref,
        7 => ratio * 6.0 * vref - 3.0 * vref,
        _ => 0.0,
    }
}

/// Converter settings applied to every channel of a session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Calibration {
    /// Input range code (1-7)
    pub input_range: u8,
    /// Reference voltage
    pub vref: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self { input_range: DEFAULT_INPUT_RANGE, vref: DEFAULT_VREF }
    }
}

impl Calibration {
    /// Convert one raw count.
    pub fn volts(&self, raw: u16) -> f64 {
        raw_to_volts(u32::from(raw), self.input_range, self.vref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn half_scale_is_zero_in_bipolar_range() {
        let v = raw_to_volts(8192, 4, 4.096);
        let expected = 0.5 * 3.0 * 4.096 - 1.5 * 4.096;
        assert_eq!(v, expected);
        assert!(v.abs() < 1e-12);
    }

    #[test]
    fn range_endpoints() {
        assert!((raw_to_volts(0, 4, 4.096) + 6.144).abs() < 1e-12);
        assert!((raw_to_volts(0, 7, 4.096) + 12.288).abs() < 1e-12);
        assert_eq!(raw_to_volts(0, 3, 4.096), 0.0);
        assert!((raw_to_volts(16384, 6, 4.096) - 12.288).abs() < 1e-12);
    }

    #[test]
    fn calibration_defaults_match_firmware() {
        let cal = Calibration::default();
        assert_eq!(cal.input_range, 4);
        assert_eq!(cal.vref, 4.096);
        assert_eq!(cal.volts(8192), raw_to_volts(8192, 4, 4.096));
    }

    proptest! {
        #[test]
        fn out_of_range_codes_yield_zero(raw in 0u32..65536, code in 8u8..=255, vref in 0.1f64..10.0) {
            prop_assert_eq!(raw_to_volts(raw, code, vref), 0.0);
            prop_assert_eq!(raw_to_volts(raw, 0, vref), 0.0);
        }

        #[test]
        fn conversion_is_reproducible(raw in 0u32..65536, code in 1u8..=7) {
            let a = raw_to_volts(raw, code, DEFAULT_VREF);
            let b = raw_to_volts(raw, code, DEFAULT_VREF);
            prop_assert_eq!(a.to_bits(), b.to_bits());
        }
    }
}
