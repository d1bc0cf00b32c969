use polars::prelude::*;

pub const TIME_COLUMN_NAME: &str = "time_s";
pub const VOLTAGE_COLUMN_NAME: &str = "voltage_v";

/// Slack when mapping a time back onto a sample index, absorbs float rounding.
const INDEX_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum WaveformError {
    #[error("Sample rate must be finite and positive, got {0}")]
    InvalidSampleRate(f64),

    #[error("Start time must be finite, got {0}")]
    InvalidStartTime(f64),
}

/// Calibrated voltage samples on a uniform time grid.
///
/// Sample `i` was taken at `start_time + i / sample_rate`, with t = 0 at the
/// trigger event. `start_time` is negative when pre-trigger data was captured.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    samples: Vec<f64>,
    sample_rate: f64,
    start_time: f64,
}

impl Waveform {
    /// An empty waveform carries no timing, so its rate is not checked.
    pub fn new(
        samples: Vec<f64>,
        sample_rate: f64,
        start_time: f64,
    ) -> Result<Self, WaveformError> {
        if !samples.is_empty() && !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(WaveformError::InvalidSampleRate(sample_rate));
        }
        if !start_time.is_finite() {
            return Err(WaveformError::InvalidStartTime(start_time));
        }
        Ok(Self {
            samples,
            sample_rate,
            start_time,
        })
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f64> {
        self.samples
    }

    /// Samples per second.
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Time of the first sample relative to the trigger, in seconds.
    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    pub fn sample_interval(&self) -> f64 {
        1.0 / self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn time(&self, index: usize) -> f64 {
        self.start_time + index as f64 / self.sample_rate
    }

    pub fn times(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.samples.len()).map(|i| self.time(i))
    }

    /// Samples whose time lies in `[start, end)`, clamped to the captured range.
    pub fn trim(&self, start: f64, end: f64) -> Self {
        let start_idx = self.index_at_or_after(start);
        let end_idx = self.index_at_or_after(end).max(start_idx);

        Self {
            samples: self.samples[start_idx..end_idx].to_vec(),
            sample_rate: self.sample_rate,
            start_time: self.time(start_idx),
        }
    }

    fn index_at_or_after(&self, time: f64) -> usize {
        let position = ((time - self.start_time) * self.sample_rate - INDEX_EPSILON).ceil();
        if position.is_nan() || position <= 0.0 {
            0
        } else {
            (position as usize).min(self.samples.len())
        }
    }

    /// Two-column frame (`time_s`, `voltage_v`), one row per sample.
    pub fn to_dataframe(&self) -> Result<DataFrame, PolarsError> {
        #[cfg(feature = "cpu-profiling")]
        let _span = tracy_client::span!("Waveform::to_dataframe");

        let voltage: Column = Series::new(VOLTAGE_COLUMN_NAME.into(), self.samples.clone()).into();
        DataFrame::new(vec![voltage])?
            .lazy()
            .with_row_index("row_index", Some(0))
            .with_columns([(col("row_index").cast(DataType::Float64)
                * lit(1.0 / self.sample_rate)
                + lit(self.start_time))
            .alias(TIME_COLUMN_NAME)])
            .select([col(TIME_COLUMN_NAME), col(VOLTAGE_COLUMN_NAME)])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Waveform {
        Waveform::new((0..n).map(|i| i as f64).collect(), 1e6, 0.0).unwrap()
    }

    #[test]
    fn test_time_reconstruction() {
        let waveform = Waveform::new(vec![1.0, 2.0, 3.0], 1e6, -50e-6).unwrap();
        let times: Vec<f64> = waveform.times().collect();
        assert_eq!(times.len(), 3);
        assert!((times[0] + 50e-6).abs() < 1e-15);
        assert!((times[2] + 48e-6).abs() < 1e-15);
        assert!((waveform.sample_interval() - 1e-6).abs() < 1e-18);
    }

    #[test]
    fn test_new_rejects_unusable_sample_rate() {
        for rate in [0.0, -1e6, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                Waveform::new(vec![0.0, 3.3, 0.0], rate, 0.0),
                Err(WaveformError::InvalidSampleRate(_))
            ));
        }
        assert!(matches!(
            Waveform::new(vec![0.0], 1e6, f64::NAN),
            Err(WaveformError::InvalidStartTime(_))
        ));
        assert!(Waveform::new(Vec::new(), 0.0, 0.0).unwrap().is_empty());
    }

    #[test]
    fn test_trim_keeps_half_open_window() {
        let waveform = ramp(100);
        let trimmed = waveform.trim(10e-6, 20e-6);

        assert_eq!(trimmed.len(), 10);
        assert_eq!(trimmed.samples()[0], 10.0);
        assert_eq!(trimmed.samples()[9], 19.0);
        assert!((trimmed.start_time() - 10e-6).abs() < 1e-15);
        assert_eq!(trimmed.sample_rate(), 1e6);
    }

    #[test]
    fn test_trim_between_samples() {
        let waveform = ramp(100);
        let trimmed = waveform.trim(10.5e-6, 12.5e-6);
        assert_eq!(trimmed.samples(), &[11.0, 12.0]);
    }

    #[test]
    fn test_trim_clamps_to_available_data() {
        let waveform = Waveform::new(vec![0.5; 100], 1e6, -20e-6).unwrap();
        let trimmed = waveform.trim(-1.0, 1.0);
        assert_eq!(trimmed.len(), 100);
        assert_eq!(trimmed.start_time(), -20e-6);
    }

    #[test]
    fn test_trim_outside_or_inverted_window_is_empty() {
        let waveform = ramp(100);
        assert!(waveform.trim(1.0, 2.0).is_empty());
        assert!(waveform.trim(-2.0, -1.0).is_empty());
        assert!(waveform.trim(50e-6, 40e-6).is_empty());
    }

    #[test]
    fn test_trim_leaves_original_untouched() {
        let waveform = ramp(10);
        let _ = waveform.trim(2e-6, 4e-6);
        assert_eq!(waveform.len(), 10);
    }

    #[test]
    fn test_to_dataframe() {
        let waveform = Waveform::new(vec![0.0, 3.3, 0.0], 1e6, -1e-6).unwrap();
        let df = waveform.to_dataframe().unwrap();

        assert_eq!(df.height(), 3);
        assert_eq!(
            df.get_column_names()
                .iter()
                .map(|name| name.as_str())
                .collect::<Vec<_>>(),
            vec![TIME_COLUMN_NAME, VOLTAGE_COLUMN_NAME]
        );
        let times: Vec<f64> = df
            .column(TIME_COLUMN_NAME)
            .unwrap()
            .f64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert!((times[0] + 1e-6).abs() < 1e-15);
        assert!((times[2] - 1e-6).abs() < 1e-15);
    }
}
