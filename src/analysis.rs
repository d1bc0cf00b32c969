//! Pulse timing analysis for shutter measurements.
//!
//! A photodiode behind the shutter produces one rectangular pulse per
//! exposure. The pulse is located with a 50% threshold (midway between the
//! waveform minimum and maximum) and its edges are placed between samples by
//! linear interpolation.

use crate::waveform::Waveform;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Reported instead of a fraction when no positive pulse width was measured.
pub const NOT_APPLICABLE: &str = "N/A";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PulseMeasurementError {
    #[error("Waveform too short for pulse detection")]
    TooShort,

    #[error("No rising edge found in waveform")]
    NoRisingEdge,

    #[error("No falling edge found after rising edge")]
    NoFallingEdge,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThreePointError {
    #[error("No waveform captured for channel {0}")]
    MissingChannel(u8),

    #[error("Channel {channel}: {source}")]
    Pulse {
        channel: u8,
        source: PulseMeasurementError,
    },
}

/// Timing of one pulse. Times in seconds, voltages in volts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PulseMetrics {
    pub pulse_width: f64,
    pub rising_edge_time: f64,
    pub falling_edge_time: f64,
    pub threshold_voltage: f64,
    pub min_voltage: f64,
    pub max_voltage: f64,
}

impl PulseMetrics {
    pub fn pulse_width_ms(&self) -> f64 {
        self.pulse_width * 1000.0
    }

    /// Nominal shutter speed such as `"1/125"`.
    pub fn shutter_speed_fraction(&self) -> String {
        if self.pulse_width <= 0.0 {
            return NOT_APPLICABLE.to_string();
        }
        format!("1/{:.0}", (1.0 / self.pulse_width).round())
    }
}

/// Which way the shutter travels across the three sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    #[default]
    Horizontal,
    Vertical,
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Horizontal => "horizontal",
            Self::Vertical => "vertical",
        })
    }
}

impl FromStr for Orientation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "horizontal" => Ok(Self::Horizontal),
            "vertical" => Ok(Self::Vertical),
            other => Err(format!("unknown orientation '{other}'")),
        }
    }
}

/// Shutter travel across three sensors that saw the same exposure.
///
/// Delays are differences of rising edge times and keep their sign: a
/// shutter moving from the last sensor towards the first yields negative
/// delays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThreePointMetrics {
    pub first: PulseMetrics,
    pub center: PulseMetrics,
    pub last: PulseMetrics,
    pub orientation: Orientation,
}

impl ThreePointMetrics {
    pub fn first_to_center_delay(&self) -> f64 {
        self.center.rising_edge_time - self.first.rising_edge_time
    }

    pub fn center_to_last_delay(&self) -> f64 {
        self.last.rising_edge_time - self.center.rising_edge_time
    }

    pub fn shutter_travel_time(&self) -> f64 {
        self.last.rising_edge_time - self.first.rising_edge_time
    }

    pub fn first_to_center_delay_ms(&self) -> f64 {
        self.first_to_center_delay() * 1000.0
    }

    pub fn center_to_last_delay_ms(&self) -> f64 {
        self.center_to_last_delay() * 1000.0
    }

    pub fn shutter_travel_time_ms(&self) -> f64 {
        self.shutter_travel_time() * 1000.0
    }

    /// Curtain speed in m/s given the distance between first and last sensor.
    pub fn shutter_velocity(&self, sensor_span_m: f64) -> Option<f64> {
        let travel = self.shutter_travel_time();
        (travel != 0.0).then(|| sensor_span_m / travel)
    }

    /// 100% when all three exposures last equally long, reduced by the largest
    /// relative deviation from the mean width, never below 0.
    pub fn timing_uniformity(&self) -> f64 {
        let widths = [
            self.first.pulse_width,
            self.center.pulse_width,
            self.last.pulse_width,
        ];
        let mean = widths.iter().sum::<f64>() / widths.len() as f64;
        if mean == 0.0 {
            return 0.0;
        }
        let max_deviation = widths
            .iter()
            .map(|w| (w - mean).abs())
            .fold(0.0, f64::max);
        (100.0 * (1.0 - max_deviation / mean)).max(0.0)
    }
}

/// Measure the first complete rising-then-falling pulse in `waveform`.
pub fn measure_pulse_width(waveform: &Waveform) -> Result<PulseMetrics, PulseMeasurementError> {
    #[cfg(feature = "cpu-profiling")]
    let _span = tracy_client::span!("measure_pulse_width");

    let samples = waveform.samples();
    if samples.len() < 2 {
        return Err(PulseMeasurementError::TooShort);
    }

    let min_voltage = samples.iter().copied().fold(f64::INFINITY, f64::min);
    let max_voltage = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let threshold = (min_voltage + max_voltage) / 2.0;

    let rising = samples
        .windows(2)
        .position(|pair| pair[0] <= threshold && threshold < pair[1])
        .ok_or(PulseMeasurementError::NoRisingEdge)?;

    let falling = samples[rising + 1..]
        .windows(2)
        .position(|pair| pair[0] > threshold && threshold >= pair[1])
        .map(|offset| rising + 1 + offset)
        .ok_or(PulseMeasurementError::NoFallingEdge)?;

    let dt = waveform.sample_interval();
    let rising_edge_time = interpolate_crossing(
        samples[rising],
        samples[rising + 1],
        threshold,
        waveform.time(rising),
        dt,
    );
    let falling_edge_time = interpolate_crossing(
        samples[falling],
        samples[falling + 1],
        threshold,
        waveform.time(falling),
        dt,
    );

    log::debug!(
        "Pulse: rising {} s, falling {} s, threshold {} V",
        rising_edge_time,
        falling_edge_time,
        threshold
    );

    Ok(PulseMetrics {
        pulse_width: falling_edge_time - rising_edge_time,
        rising_edge_time,
        falling_edge_time,
        threshold_voltage: threshold,
        min_voltage,
        max_voltage,
    })
}

/// Time at which the line through `(t1, v1)` and `(t1 + dt, v2)` reaches `threshold`.
fn interpolate_crossing(v1: f64, v2: f64, threshold: f64, t1: f64, dt: f64) -> f64 {
    if v1 == v2 {
        return t1;
    }
    t1 + dt * (threshold - v1) / (v2 - v1)
}

/// Measure the same exposure on three sensors and relate their timing.
pub fn measure_three_point(
    waveforms: &BTreeMap<u8, Waveform>,
    orientation: Orientation,
    first_channel: u8,
    center_channel: u8,
    last_channel: u8,
) -> Result<ThreePointMetrics, ThreePointError> {
    let measure = |channel: u8| -> Result<PulseMetrics, ThreePointError> {
        let waveform = waveforms
            .get(&channel)
            .ok_or(ThreePointError::MissingChannel(channel))?;
        measure_pulse_width(waveform).map_err(|source| ThreePointError::Pulse { channel, source })
    };

    Ok(ThreePointMetrics {
        first: measure(first_channel)?,
        center: measure(center_channel)?,
        last: measure(last_channel)?,
        orientation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pulse(low_before: usize, high: usize, low_after: usize) -> Vec<f64> {
        let mut samples = vec![0.0; low_before];
        samples.extend(std::iter::repeat(3.3).take(high));
        samples.extend(std::iter::repeat(0.0).take(low_after));
        samples
    }

    fn metrics(pulse_width: f64) -> PulseMetrics {
        PulseMetrics {
            pulse_width,
            rising_edge_time: -pulse_width / 2.0,
            falling_edge_time: pulse_width / 2.0,
            threshold_voltage: 1.65,
            min_voltage: 0.0,
            max_voltage: 3.3,
        }
    }

    fn staggered(widths: [usize; 3]) -> BTreeMap<u8, Waveform> {
        BTreeMap::from([
            (1, Waveform::new(pulse(10, widths[0], 30), 1e6, 0.0).unwrap()),
            (2, Waveform::new(pulse(20, widths[1], 20), 1e6, 0.0).unwrap()),
            (3, Waveform::new(pulse(30, widths[2], 10), 1e6, 0.0).unwrap()),
        ])
    }

    fn assert_close(actual: f64, expected: f64, tolerance: f64) {
        assert!(
            (actual - expected).abs() <= tolerance,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn test_measure_pulse_width_ideal_square_pulse() {
        let waveform = Waveform::new(pulse(20, 60, 20), 1e6, 0.0).unwrap();
        let metrics = measure_pulse_width(&waveform).unwrap();

        assert_close(metrics.pulse_width, 60e-6, 1e-12);
        assert_eq!(metrics.min_voltage, 0.0);
        assert_eq!(metrics.max_voltage, 3.3);
        assert_close(metrics.threshold_voltage, 1.65, 1e-12);
        assert_eq!(metrics.shutter_speed_fraction(), "1/16667");
    }

    #[test]
    fn test_edge_interpolates_to_midpoint() {
        let waveform = Waveform::new(pulse(20, 60, 20), 1e6, 0.0).unwrap();
        let metrics = measure_pulse_width(&waveform).unwrap();

        // Samples 19 and 20 bracket the rising edge, 79 and 80 the falling edge
        assert_close(metrics.rising_edge_time, 19.5e-6, 1e-15);
        assert_close(metrics.falling_edge_time, 79.5e-6, 1e-15);
    }

    #[test]
    fn test_measure_pulse_width_with_offset_levels() {
        let mut samples = vec![1.0; 20];
        samples.extend(vec![4.0; 50]);
        samples.extend(vec![1.0; 30]);
        let metrics = measure_pulse_width(&Waveform::new(samples, 1e6, 0.0).unwrap()).unwrap();

        assert_close(metrics.pulse_width, 50e-6, 1e-12);
        assert_close(metrics.threshold_voltage, 2.5, 1e-12);
    }

    #[test]
    fn test_start_time_shifts_edges_only() {
        let base = measure_pulse_width(&Waveform::new(pulse(10, 80, 10), 1e6, 0.0).unwrap()).unwrap();
        let shifted =
            measure_pulse_width(&Waveform::new(pulse(10, 80, 10), 1e6, -50e-6).unwrap()).unwrap();

        assert_close(shifted.rising_edge_time, -40.5e-6, 1e-12);
        assert_close(shifted.falling_edge_time, 39.5e-6, 1e-12);
        assert_close(shifted.rising_edge_time - base.rising_edge_time, -50e-6, 1e-12);
        assert_close(shifted.falling_edge_time - base.falling_edge_time, -50e-6, 1e-12);
        assert_close(shifted.pulse_width, base.pulse_width, 1e-12);
    }

    #[test]
    fn test_slow_edges_interpolate_between_samples() {
        let samples = vec![0.0, 0.0, 1.0, 3.0, 3.0, 3.0, 2.0, 0.0, 0.0];
        let metrics = measure_pulse_width(&Waveform::new(samples, 1000.0, 0.0).unwrap()).unwrap();

        // Threshold 1.5 V: rising between 1.0 and 3.0 at index 2.25, falling between 2.0 and 0.0 at 6.25
        assert_close(metrics.rising_edge_time, 2.25e-3, 1e-12);
        assert_close(metrics.falling_edge_time, 6.25e-3, 1e-12);
        assert_close(metrics.pulse_width, 4e-3, 1e-12);
    }

    #[test]
    fn test_only_first_pulse_is_measured() {
        let mut samples = pulse(5, 10, 5);
        samples.extend(pulse(0, 30, 5));
        let metrics = measure_pulse_width(&Waveform::new(samples, 1e6, 0.0).unwrap()).unwrap();
        assert_close(metrics.pulse_width, 10e-6, 1e-12);
    }

    #[test]
    fn test_measure_pulse_width_no_rising_edge() {
        let waveform = Waveform::new(vec![0.0; 100], 1e6, 0.0).unwrap();
        assert_eq!(
            measure_pulse_width(&waveform),
            Err(PulseMeasurementError::NoRisingEdge)
        );
    }

    #[test]
    fn test_measure_pulse_width_no_falling_edge() {
        let waveform = Waveform::new(pulse(20, 80, 0), 1e6, 0.0).unwrap();
        assert_eq!(
            measure_pulse_width(&waveform),
            Err(PulseMeasurementError::NoFallingEdge)
        );

        let rising: Vec<f64> = (0..50).map(f64::from).collect();
        assert_eq!(
            measure_pulse_width(&Waveform::new(rising, 1e6, 0.0).unwrap()),
            Err(PulseMeasurementError::NoFallingEdge)
        );
    }

    #[test]
    fn test_measure_pulse_width_waveform_too_short() {
        let waveform = Waveform::new(vec![0.0], 1e6, 0.0).unwrap();
        let err = measure_pulse_width(&waveform).unwrap_err();
        assert_eq!(err, PulseMeasurementError::TooShort);
        assert!(err.to_string().contains("too short"));

        assert_eq!(
            measure_pulse_width(&Waveform::new(Vec::new(), 1e6, 0.0).unwrap()),
            Err(PulseMeasurementError::TooShort)
        );
    }

    #[test]
    fn test_pulse_metrics_pulse_width_ms() {
        assert_close(metrics(0.008).pulse_width_ms(), 8.0, 1e-12);
    }

    #[test]
    fn test_pulse_metrics_shutter_speed_fraction() {
        assert_eq!(metrics(0.008).shutter_speed_fraction(), "1/125");
        assert_eq!(metrics(0.001).shutter_speed_fraction(), "1/1000");
        assert_eq!(metrics(0.0333).shutter_speed_fraction(), "1/30");
        assert_eq!(metrics(0.0).shutter_speed_fraction(), NOT_APPLICABLE);
        assert_eq!(metrics(-1e-3).shutter_speed_fraction(), NOT_APPLICABLE);
    }

    #[test]
    fn test_measure_three_point_basic() {
        let metrics =
            measure_three_point(&staggered([60, 60, 60]), Orientation::Horizontal, 1, 2, 3)
                .unwrap();

        for pulse in [metrics.first, metrics.center, metrics.last] {
            assert_close(pulse.pulse_width, 60e-6, 1e-12);
        }
        assert_close(metrics.first_to_center_delay(), 10e-6, 1e-12);
        assert_close(metrics.center_to_last_delay(), 10e-6, 1e-12);
        assert_close(metrics.shutter_travel_time(), 20e-6, 1e-12);
        assert_close(metrics.timing_uniformity(), 100.0, 1e-6);
        assert_eq!(metrics.orientation, Orientation::Horizontal);
    }

    #[test]
    fn test_three_point_delay_ms_and_velocity() {
        let metrics =
            measure_three_point(&staggered([60, 60, 60]), Orientation::Vertical, 1, 2, 3).unwrap();

        assert_eq!(metrics.orientation, Orientation::Vertical);
        assert_close(metrics.first_to_center_delay_ms(), 0.01, 1e-9);
        assert_close(metrics.center_to_last_delay_ms(), 0.01, 1e-9);
        assert_close(metrics.shutter_travel_time_ms(), 0.02, 1e-9);
        // 24 mm frame height crossed in 20 us
        assert_close(metrics.shutter_velocity(0.024).unwrap(), 1200.0, 1e-6);
    }

    #[test]
    fn test_three_point_timing_uniformity_varied() {
        let metrics =
            measure_three_point(&staggered([50, 60, 70]), Orientation::Horizontal, 1, 2, 3)
                .unwrap();

        // Mean 60 us, largest deviation 10 us
        assert_close(metrics.timing_uniformity(), 100.0 * (1.0 - 10.0 / 60.0), 1e-6);
    }

    #[test]
    fn test_timing_uniformity_degenerate_cases() {
        let zero = ThreePointMetrics {
            first: metrics(0.0),
            center: metrics(0.0),
            last: metrics(0.0),
            orientation: Orientation::Horizontal,
        };
        assert_eq!(zero.timing_uniformity(), 0.0);
        assert_eq!(zero.shutter_velocity(0.024), None);

        let wild = ThreePointMetrics {
            first: metrics(1e-3),
            center: metrics(1e-3),
            last: metrics(10e-3),
            orientation: Orientation::Horizontal,
        };
        assert_eq!(wild.timing_uniformity(), 0.0);
    }

    #[test]
    fn test_reverse_travel_gives_negative_delays() {
        let waveforms = staggered([60, 60, 60]);
        let metrics =
            measure_three_point(&waveforms, Orientation::Horizontal, 3, 2, 1).unwrap();

        assert_close(metrics.first_to_center_delay(), -10e-6, 1e-12);
        assert_close(metrics.shutter_travel_time(), -20e-6, 1e-12);
    }

    #[test]
    fn test_measure_three_point_custom_channels() {
        let mut waveforms = staggered([60, 60, 60]);
        let third = waveforms.remove(&3).unwrap();
        let second = waveforms.remove(&2).unwrap();
        let first = waveforms.remove(&1).unwrap();
        let waveforms = BTreeMap::from([(2, first), (3, second), (4, third)]);

        let metrics =
            measure_three_point(&waveforms, Orientation::Horizontal, 2, 3, 4).unwrap();
        assert_close(metrics.first.pulse_width, 60e-6, 1e-12);
        assert_close(metrics.shutter_travel_time(), 20e-6, 1e-12);
    }

    #[test]
    fn test_measure_three_point_missing_channel() {
        let mut waveforms = staggered([60, 60, 60]);
        waveforms.remove(&3);

        assert_eq!(
            measure_three_point(&waveforms, Orientation::Horizontal, 1, 2, 3),
            Err(ThreePointError::MissingChannel(3))
        );
    }

    #[test]
    fn test_measure_three_point_reports_failing_channel() {
        let mut waveforms = staggered([60, 60, 60]);
        waveforms.insert(2, Waveform::new(vec![0.0; 100], 1e6, 0.0).unwrap());

        assert_eq!(
            measure_three_point(&waveforms, Orientation::Horizontal, 1, 2, 3),
            Err(ThreePointError::Pulse {
                channel: 2,
                source: PulseMeasurementError::NoRisingEdge
            })
        );
    }

    #[test]
    fn test_orientation_parse_and_display() {
        assert_eq!("Vertical".parse::<Orientation>(), Ok(Orientation::Vertical));
        assert!("diagonal".parse::<Orientation>().is_err());
        assert_eq!(Orientation::Horizontal.to_string(), "horizontal");
    }
}
