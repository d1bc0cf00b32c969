//! Acquisition window planning for the DS1000Z.
//!
//! The constants here are specific to the DS1000Z family and were validated
//! against hardware. Changing them requires re-checking captures on a real
//! instrument.

#[derive(Debug, thiserror::Error)]
pub enum CaptureConfigError {
    #[error("Maximum pulse duration must be finite and positive, got {0} s")]
    InvalidMaxDuration(f64),

    #[error("Sample interval must be finite and positive, got {0} s")]
    InvalidSampleInterval(f64),

    #[error("Channel {0} does not exist (valid channels are 1-4)")]
    InvalidChannel(u8),

    #[error("Trigger level must be finite, got {0} V")]
    InvalidTriggerLevel(f64),
}

/// Horizontal divisions on the DS1000Z screen.
pub const HORIZONTAL_DIVISIONS: f64 = 12.0;
/// Divisions the expected pulse is spread over, leaving the rest as margin.
pub const PULSE_DIVISIONS: f64 = 10.0;
/// Trigger point sits this many divisions right of center.
pub const TRIGGER_DIVISIONS_RIGHT_OF_CENTER: f64 = 5.0;

/// Single-channel memory depths accepted by `:ACQuire:MDEPth`, ascending.
pub const MEMORY_DEPTHS: [u64; 6] = [1_000, 10_000, 100_000, 1_000_000, 6_000_000, 12_000_000];

/// Vertical scale for a 0-2.5 V logic signal: 8 divisions at 0.5 V/div span 4 V.
pub const CHANNEL_SCALE_VOLTS: f64 = 0.5;
/// Puts 0 V one division above the bottom of the screen (3 divisions below center).
pub const CHANNEL_OFFSET_VOLTS: f64 = -1.5;

pub const CHANNEL_COUNT: u8 = 4;

pub fn validate_channel(channel: u8) -> Result<(), CaptureConfigError> {
    if (1..=CHANNEL_COUNT).contains(&channel) {
        Ok(())
    } else {
        Err(CaptureConfigError::InvalidChannel(channel))
    }
}

/// Concrete acquisition settings derived from a pulse duration bound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimebasePlan {
    pub time_per_division: f64,
    pub desired_depth: u64,
    pub memory_depth: u64,
    pub trigger_offset: f64,
}

impl TimebasePlan {
    pub fn for_pulse(max_duration: f64, sample_interval: f64) -> Result<Self, CaptureConfigError> {
        if !(max_duration.is_finite() && max_duration > 0.0) {
            return Err(CaptureConfigError::InvalidMaxDuration(max_duration));
        }
        if !(sample_interval.is_finite() && sample_interval > 0.0) {
            return Err(CaptureConfigError::InvalidSampleInterval(sample_interval));
        }

        let time_per_division = max_duration / PULSE_DIVISIONS;
        let total_time = time_per_division * HORIZONTAL_DIVISIONS;
        let desired_depth = (total_time / sample_interval) as u64;
        let memory_depth = nearest_memory_depth(desired_depth);
        let trigger_offset = -time_per_division * TRIGGER_DIVISIONS_RIGHT_OF_CENTER;

        log::debug!(
            "Timebase plan: {} s/div, wanted {} points, using {} points, trigger offset {} s",
            time_per_division,
            desired_depth,
            memory_depth,
            trigger_offset
        );

        Ok(Self {
            time_per_division,
            desired_depth,
            memory_depth,
            trigger_offset,
        })
    }

    /// Effective sample interval once the chosen depth fills the whole window.
    pub fn sample_interval(&self) -> f64 {
        self.time_per_division * HORIZONTAL_DIVISIONS / self.memory_depth as f64
    }
}

/// Closest supported memory depth to `desired`. Equidistant candidates resolve
/// to the smaller depth.
pub fn nearest_memory_depth(desired: u64) -> u64 {
    let mut chosen = MEMORY_DEPTHS[0];
    for depth in MEMORY_DEPTHS {
        if depth <= desired {
            chosen = depth;
        } else {
            if depth.abs_diff(desired) < chosen.abs_diff(desired) {
                chosen = depth;
            }
            break;
        }
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearest_memory_depth() {
        assert_eq!(nearest_memory_depth(0), 1_000);
        assert_eq!(nearest_memory_depth(1_000), 1_000);
        assert_eq!(nearest_memory_depth(4_000), 1_000);
        assert_eq!(nearest_memory_depth(6_000), 10_000);
        assert_eq!(nearest_memory_depth(1_200_000), 1_000_000);
        assert_eq!(nearest_memory_depth(4_000_000), 6_000_000);
        assert_eq!(nearest_memory_depth(50_000_000), 12_000_000);
    }

    #[test]
    fn test_nearest_memory_depth_tie_prefers_smaller() {
        assert_eq!(nearest_memory_depth(5_500), 1_000);
        assert_eq!(nearest_memory_depth(3_500_000), 1_000_000);
        assert_eq!(nearest_memory_depth(9_000_000), 6_000_000);
    }

    #[test]
    fn test_plan_for_one_second_window() {
        let plan = TimebasePlan::for_pulse(1.0, 1e-6).unwrap();
        assert!((plan.time_per_division - 0.1).abs() < 1e-12);
        assert!((plan.trigger_offset + 0.5).abs() < 1e-12);
        assert_eq!(plan.memory_depth, 1_000_000);
        assert!((plan.sample_interval() - 1.2e-6).abs() < 1e-12);
    }

    #[test]
    fn test_plan_rejects_non_positive_inputs() {
        assert!(matches!(
            TimebasePlan::for_pulse(0.0, 1e-6),
            Err(CaptureConfigError::InvalidMaxDuration(_))
        ));
        assert!(matches!(
            TimebasePlan::for_pulse(1.0, -1e-6),
            Err(CaptureConfigError::InvalidSampleInterval(_))
        ));
        assert!(TimebasePlan::for_pulse(f64::NAN, 1e-6).is_err());
        assert!(matches!(
            TimebasePlan::for_pulse(f64::INFINITY, 1e-6),
            Err(CaptureConfigError::InvalidMaxDuration(_))
        ));
        assert!(matches!(
            TimebasePlan::for_pulse(1.0, f64::NAN),
            Err(CaptureConfigError::InvalidSampleInterval(_))
        ));
    }

    #[test]
    fn test_validate_channel() {
        assert!(validate_channel(1).is_ok());
        assert!(validate_channel(4).is_ok());
        assert!(validate_channel(0).is_err());
        assert!(validate_channel(5).is_err());
    }
}
