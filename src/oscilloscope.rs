use crate::instrument_channel::ChannelError;
use crate::timebase::CaptureConfigError;
use crate::trigger_config::TriggerSlope;
use crate::waveform::{Waveform, WaveformError};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    #[error("Not connected to oscilloscope")]
    NotConnected,

    #[error("Instrument channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Invalid capture configuration: {0}")]
    Config(#[from] CaptureConfigError),

    #[error("Unexpected reply to '{command}': '{reply}'")]
    InvalidReply { command: String, reply: String },

    #[error("Short waveform read at point {start}: expected {expected} bytes, got {received}")]
    ShortRead {
        start: usize,
        expected: usize,
        received: usize,
    },

    #[error("Invalid waveform: {0}")]
    Waveform(#[from] WaveformError),
}

/// What the capture pipeline needs from an oscilloscope.
pub trait Oscilloscope {
    /// Size the acquisition window so a pulse of up to `max_duration` seconds
    /// fits with margin, sampled about every `sample_interval` seconds, and
    /// set up the vertical axis of each of `channels`.
    fn configure_timebase(
        &mut self,
        max_duration: f64,
        sample_interval: f64,
        channels: &[u8],
    ) -> Result<(), ScopeError>;

    /// Arm a single-shot edge trigger and start one acquisition sweep.
    fn setup_edge_trigger(
        &mut self,
        channel: u8,
        level: f64,
        slope: TriggerSlope,
    ) -> Result<(), ScopeError>;

    /// Block until the acquisition completes. `Ok(false)` when `timeout`
    /// elapses first; without a timeout this waits indefinitely.
    fn wait_for_trigger(&mut self, timeout: Option<Duration>) -> Result<bool, ScopeError>;

    /// Download and calibrate the full acquisition memory of one channel.
    fn get_waveform(&mut self, channel: u8) -> Result<Waveform, ScopeError>;

    /// Download several channels of the same completed acquisition, in order.
    fn get_waveforms(&mut self, channels: &[u8]) -> Result<BTreeMap<u8, Waveform>, ScopeError> {
        let mut waveforms = BTreeMap::new();
        for &channel in channels {
            waveforms.insert(channel, self.get_waveform(channel)?);
        }
        Ok(waveforms)
    }
}
