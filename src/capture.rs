use crate::analysis::{
    measure_pulse_width, measure_three_point, Orientation, PulseMetrics, ThreePointError,
    ThreePointMetrics,
};
use crate::export::ExportError;
use crate::oscilloscope::{Oscilloscope, ScopeError};
use crate::trigger_config::TriggerSlope;
use crate::waveform::Waveform;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Oscilloscope error: {0}")]
    Scope(#[from] ScopeError),

    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    #[error("No waveform captured for channel {0}")]
    MissingChannel(u8),
}

/// Which sensors are read and how they are related.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    Single {
        channel: u8,
    },
    ThreePoint {
        orientation: Orientation,
        first: u8,
        center: u8,
        last: u8,
    },
}

impl CaptureMode {
    pub fn channels(&self) -> Vec<u8> {
        match *self {
            Self::Single { channel } => vec![channel],
            Self::ThreePoint {
                first,
                center,
                last,
                ..
            } => vec![first, center, last],
        }
    }

    /// Channel the edge trigger watches: the single sensor, or the last
    /// sensor the shutter passes so all three pulses precede the trigger.
    pub fn trigger_channel(&self) -> u8 {
        match *self {
            Self::Single { channel } => channel,
            Self::ThreePoint { last, .. } => last,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSettings {
    pub mode: CaptureMode,
    pub trigger_level: f64,
    pub trigger_slope: TriggerSlope,
    /// Desired time between samples, in seconds.
    pub sample_interval: f64,
    /// Longest pulse the window must hold, in seconds.
    pub max_duration: f64,
    /// `None` waits for the shutter indefinitely.
    pub trigger_timeout: Option<Duration>,
    /// Margin kept around a measured pulse, as a fraction of its width.
    pub trim_margin_fraction: f64,
}

impl CaptureSettings {
    pub const DEFAULT_TRIGGER_LEVEL: f64 = 0.2;
    pub const DEFAULT_SAMPLE_INTERVAL: f64 = 1e-6;
    /// One second covers every mechanical shutter speed in practice.
    pub const DEFAULT_MAX_DURATION: f64 = 1.0;
    pub const DEFAULT_TRIGGER_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_TRIM_MARGIN_FRACTION: f64 = 0.1;

    pub fn single(channel: u8) -> Self {
        Self {
            mode: CaptureMode::Single { channel },
            ..Self::default()
        }
    }

    pub fn three_point(orientation: Orientation, first: u8, center: u8, last: u8) -> Self {
        Self {
            mode: CaptureMode::ThreePoint {
                orientation,
                first,
                center,
                last,
            },
            ..Self::default()
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            mode: CaptureMode::Single { channel: 1 },
            trigger_level: Self::DEFAULT_TRIGGER_LEVEL,
            trigger_slope: TriggerSlope::default(),
            sample_interval: Self::DEFAULT_SAMPLE_INTERVAL,
            max_duration: Self::DEFAULT_MAX_DURATION,
            trigger_timeout: Some(Self::DEFAULT_TRIGGER_TIMEOUT),
            trim_margin_fraction: Self::DEFAULT_TRIM_MARGIN_FRACTION,
        }
    }
}

/// Result of one trigger event. Metrics are `None` when no pulse could be measured.
#[derive(Debug, Clone, PartialEq)]
pub enum Capture {
    Single {
        waveform: Waveform,
        metrics: Option<PulseMetrics>,
    },
    ThreePoint {
        waveforms: BTreeMap<u8, Waveform>,
        metrics: Option<ThreePointMetrics>,
    },
}

/// Configure, arm, wait, download and analyze once.
///
/// Returns `Ok(None)` when the trigger did not fire within the timeout.
pub fn capture_once<S: Oscilloscope + ?Sized>(
    scope: &mut S,
    settings: &CaptureSettings,
) -> Result<Option<Capture>, CaptureError> {
    let channels = settings.mode.channels();
    scope.configure_timebase(settings.max_duration, settings.sample_interval, &channels)?;
    scope.setup_edge_trigger(
        settings.mode.trigger_channel(),
        settings.trigger_level,
        settings.trigger_slope,
    )?;

    log::info!("Waiting for trigger...");
    if !scope.wait_for_trigger(settings.trigger_timeout)? {
        log::info!("Trigger timeout");
        return Ok(None);
    }
    log::info!("Triggered, downloading {} channel(s)", channels.len());

    match settings.mode {
        CaptureMode::Single { channel } => {
            let waveform = scope.get_waveform(channel)?;
            Ok(Some(analyze_single(waveform, settings.trim_margin_fraction)))
        }
        CaptureMode::ThreePoint {
            orientation,
            first,
            center,
            last,
        } => {
            let waveforms = scope.get_waveforms(&channels)?;
            let metrics =
                match measure_three_point(&waveforms, orientation, first, center, last) {
                    Ok(metrics) => {
                        log::info!(
                            "Shutter travel {:.3} ms, uniformity {:.1}%",
                            metrics.shutter_travel_time_ms(),
                            metrics.timing_uniformity()
                        );
                        Some(metrics)
                    }
                    Err(ThreePointError::Pulse { channel, source }) => {
                        log::warn!("Could not measure pulse on channel {}: {}", channel, source);
                        None
                    }
                    Err(ThreePointError::MissingChannel(channel)) => {
                        return Err(CaptureError::MissingChannel(channel))
                    }
                };
            Ok(Some(Capture::ThreePoint { waveforms, metrics }))
        }
    }
}

/// Measure the pulse and trim the waveform around it. Keeps the raw waveform
/// when no pulse is found.
pub fn analyze_single(waveform: Waveform, trim_margin_fraction: f64) -> Capture {
    match measure_pulse_width(&waveform) {
        Ok(metrics) => {
            log::info!(
                "Shutter speed: {:.2} ms ({})",
                metrics.pulse_width_ms(),
                metrics.shutter_speed_fraction()
            );
            let margin = metrics.pulse_width * trim_margin_fraction;
            let waveform = waveform.trim(
                metrics.rising_edge_time - margin,
                metrics.falling_edge_time + margin,
            );
            Capture::Single {
                waveform,
                metrics: Some(metrics),
            }
        }
        Err(e) => {
            log::warn!("Could not measure pulse: {}", e);
            Capture::Single {
                waveform,
                metrics: None,
            }
        }
    }
}

/// Repeat [`capture_once`] until `stop` is raised or `max_captures` captures
/// were handed to `on_capture`. Trigger timeouts start a new cycle.
///
/// `stop` is only checked between cycles. Returns the number of captures.
pub fn continuous_capture<S, F>(
    scope: &mut S,
    settings: &CaptureSettings,
    stop: &AtomicBool,
    max_captures: Option<usize>,
    mut on_capture: F,
) -> Result<usize, CaptureError>
where
    S: Oscilloscope + ?Sized,
    F: FnMut(usize, Capture) -> Result<(), CaptureError>,
{
    let mut captured = 0;
    while !stop.load(Ordering::SeqCst) && max_captures.is_none_or(|max| captured < max) {
        match capture_once(scope, settings)? {
            Some(capture) => {
                captured += 1;
                on_capture(captured, capture)?;
            }
            None => log::debug!("Re-arming after trigger timeout"),
        }
    }
    if stop.load(Ordering::SeqCst) {
        log::info!("Capture loop interrupted after {} capture(s)", captured);
    }
    Ok(captured)
}
