use crate::analysis::{Orientation, PulseMetrics, ThreePointMetrics};
use crate::waveform::{Waveform, WaveformError};
use chrono::{DateTime, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Schema version written to, and required from, JSON capture files.
pub const WAVEFORM_JSON_VERSION: u32 = 1;
pub const THREE_POINT_MODE: &str = "three_point";

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("DataFrame error: {0}")]
    Polars(#[from] PolarsError),

    #[error("Unsupported waveform file version: {0:?}")]
    UnsupportedVersion(Option<u64>),

    #[error("Invalid waveform in file: {0}")]
    InvalidWaveform(#[from] WaveformError),
}

/// Microvolt resolution is far below one ADC step.
fn round_sample(volts: f64) -> f64 {
    (volts * 1e6).round() / 1e6
}

/// Single-point capture file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveformRecord {
    pub version: u32,
    pub capture_time: DateTime<Utc>,
    pub sample_rate_hz: f64,
    pub start_time_s: f64,
    pub samples: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutter_speed_s: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutter_speed_fraction: Option<String>,
}

impl WaveformRecord {
    pub fn new(
        waveform: &Waveform,
        metrics: Option<&PulseMetrics>,
        capture_time: DateTime<Utc>,
    ) -> Self {
        Self {
            version: WAVEFORM_JSON_VERSION,
            capture_time,
            sample_rate_hz: waveform.sample_rate(),
            start_time_s: waveform.start_time(),
            samples: waveform.samples().iter().copied().map(round_sample).collect(),
            shutter_speed_s: metrics.map(|m| m.pulse_width),
            shutter_speed_fraction: metrics.map(PulseMetrics::shutter_speed_fraction),
        }
    }

    pub fn into_waveform(self) -> Result<Waveform, WaveformError> {
        Waveform::new(self.samples, self.sample_rate_hz, self.start_time_s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub label: String,
    pub sample_rate_hz: f64,
    pub start_time_s: f64,
    pub samples: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulseSummary {
    pub pulse_width_s: f64,
    pub shutter_speed_fraction: String,
}

impl From<&PulseMetrics> for PulseSummary {
    fn from(metrics: &PulseMetrics) -> Self {
        Self {
            pulse_width_s: metrics.pulse_width,
            shutter_speed_fraction: metrics.shutter_speed_fraction(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreePointMeasurements {
    pub first: PulseSummary,
    pub center: PulseSummary,
    pub last: PulseSummary,
    pub first_to_center_delay_s: f64,
    pub center_to_last_delay_s: f64,
    pub shutter_travel_time_s: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutter_velocity_m_per_s: Option<f64>,
    pub timing_uniformity: f64,
}

impl ThreePointMeasurements {
    pub fn new(metrics: &ThreePointMetrics, sensor_span_m: Option<f64>) -> Self {
        Self {
            first: (&metrics.first).into(),
            center: (&metrics.center).into(),
            last: (&metrics.last).into(),
            first_to_center_delay_s: metrics.first_to_center_delay(),
            center_to_last_delay_s: metrics.center_to_last_delay(),
            shutter_travel_time_s: metrics.shutter_travel_time(),
            shutter_velocity_m_per_s: sensor_span_m.and_then(|span| metrics.shutter_velocity(span)),
            timing_uniformity: metrics.timing_uniformity(),
        }
    }
}

/// Three-point capture file, channels keyed by channel number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreePointRecord {
    pub version: u32,
    pub mode: String,
    pub capture_time: DateTime<Utc>,
    pub channels: BTreeMap<String, ChannelRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<Orientation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurements: Option<ThreePointMeasurements>,
}

impl ThreePointRecord {
    /// `roles` holds the first, center and last channel, used for labels.
    pub fn new(
        waveforms: &BTreeMap<u8, Waveform>,
        roles: [u8; 3],
        metrics: Option<&ThreePointMetrics>,
        sensor_span_m: Option<f64>,
        capture_time: DateTime<Utc>,
    ) -> Self {
        let channels = waveforms
            .iter()
            .map(|(&channel, waveform)| {
                let label = match roles.iter().position(|&role| role == channel) {
                    Some(0) => "first".to_string(),
                    Some(1) => "center".to_string(),
                    Some(_) => "last".to_string(),
                    None => format!("channel_{channel}"),
                };
                let record = ChannelRecord {
                    label,
                    sample_rate_hz: waveform.sample_rate(),
                    start_time_s: waveform.start_time(),
                    samples: waveform.samples().iter().copied().map(round_sample).collect(),
                };
                (channel.to_string(), record)
            })
            .collect();

        Self {
            version: WAVEFORM_JSON_VERSION,
            mode: THREE_POINT_MODE.to_string(),
            capture_time,
            channels,
            orientation: metrics.map(|m| m.orientation),
            measurements: metrics.map(|m| ThreePointMeasurements::new(m, sensor_span_m)),
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ExportError> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}

pub fn save_waveform_json(
    path: &Path,
    waveform: &Waveform,
    metrics: Option<&PulseMetrics>,
) -> Result<(), ExportError> {
    write_json(path, &WaveformRecord::new(waveform, metrics, Utc::now()))?;
    log::debug!("Saved {} samples to {}", waveform.len(), path.display());
    Ok(())
}

pub fn save_three_point_json(
    path: &Path,
    waveforms: &BTreeMap<u8, Waveform>,
    roles: [u8; 3],
    metrics: Option<&ThreePointMetrics>,
    sensor_span_m: Option<f64>,
) -> Result<(), ExportError> {
    let record = ThreePointRecord::new(waveforms, roles, metrics, sensor_span_m, Utc::now());
    write_json(path, &record)?;
    log::debug!("Saved {} channels to {}", waveforms.len(), path.display());
    Ok(())
}

/// Read a single-point capture file written by [`save_waveform_json`].
pub fn load_waveform_json(path: &Path) -> Result<Waveform, ExportError> {
    let value: serde_json::Value = serde_json::from_reader(BufReader::new(File::open(path)?))?;
    let version = value.get("version").and_then(serde_json::Value::as_u64);
    if version != Some(u64::from(WAVEFORM_JSON_VERSION)) {
        return Err(ExportError::UnsupportedVersion(version));
    }
    let record: WaveformRecord = serde_json::from_value(value)?;
    Ok(record.into_waveform()?)
}

/// `time_s,voltage_v` header, then one row per sample.
pub fn save_waveform_csv(path: &Path, waveform: &Waveform) -> Result<(), ExportError> {
    let mut df = waveform.to_dataframe()?;
    let mut writer = BufWriter::new(File::create(path)?);
    CsvWriter::new(&mut writer)
        .include_header(true)
        .finish(&mut df)?;
    writer.flush()?;
    log::debug!("Saved {} rows to {}", df.height(), path.display());
    Ok(())
}
