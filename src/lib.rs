//! # ShutterScope RS
//!
//! A Rust library for measuring mechanical camera shutter timing with a Rigol
//! DS1000Z series oscilloscope.
//!
//! A photodiode behind the shutter produces a voltage pulse while the shutter is
//! open. This library configures the oscilloscope so the longest expected pulse
//! fits in one acquisition, arms a single-shot edge trigger, downloads the full
//! acquisition memory in RAW mode and measures the pulse at the 50% threshold.
//! With three sensors across the frame it also measures shutter travel time and
//! timing uniformity.
//!
//! ## Features
//!
//! - **Device connection**: raw SCPI over TCP (port 5555) or serial, discovery of serial-attached scopes via `serialport`
//! - **Timebase planning**: time/div, memory depth and trigger position from the longest pulse
//! - **Full memory download**: chunked RAW reads with manual calibration
//! - **Pulse analysis**: interpolated edge times, shutter speed fractions, three-point travel
//! - **Export**: versioned JSON records and `polars` CSV output
//!
//! ## Examples
//!
//! ### Single Capture
//!
//! ```rust,no_run
//! use shutterscope_rs::{capture_once, CaptureSettings, RigolDs1000z, ScopeConnector};
//!
//! let address = "TCPIP::192.168.1.100::INSTR".parse()?;
//! let channel = ScopeConnector::connect(&address)?;
//!
//! let capture = RigolDs1000z::session(channel, |scope| {
//!     capture_once(scope, &CaptureSettings::single(1))
//! })?;
//! println!("{:?}", capture);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Driving the Oscilloscope Directly
//!
//! ```rust,no_run
//! use shutterscope_rs::{Oscilloscope, RigolDs1000z, ScopeConnector, TriggerSlope};
//! use std::time::Duration;
//!
//! let address = "TCPIP0::192.168.1.100::inst0::INSTR".parse()?;
//! let mut channel = ScopeConnector::connect(&address)?;
//! if let Some(identity) = ScopeConnector::identify(channel.as_mut())? {
//!     println!("Using {} {}", identity.manufacturer, identity.model);
//! }
//!
//! let mut scope = RigolDs1000z::new(channel);
//! scope.configure_timebase(0.1, 1e-6, &[1])?;
//! scope.setup_edge_trigger(1, 0.2, TriggerSlope::Negative)?;
//! if scope.wait_for_trigger(Some(Duration::from_secs(30)))? {
//!     let waveform = scope.get_waveform(1)?;
//!     println!("Captured {} samples at {} Sa/s", waveform.len(), waveform.sample_rate());
//! }
//! scope.disconnect()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Pulse Analysis
//!
//! ```rust
//! use shutterscope_rs::{measure_pulse_width, Waveform};
//!
//! // 1 MSa/s, open for 60 us
//! let mut samples = vec![0.0; 20];
//! samples.extend([3.3; 60]);
//! samples.extend([0.0; 20]);
//! let waveform = Waveform::new(samples, 1e6, 0.0).unwrap();
//!
//! let metrics = measure_pulse_width(&waveform).unwrap();
//! assert!((metrics.pulse_width - 60e-6).abs() < 1e-12);
//! assert_eq!(metrics.shutter_speed_fraction(), "1/16667");
//! ```

pub mod analysis;
pub mod capture;
pub mod connector;
pub mod export;
pub mod instrument_channel;
pub mod oscilloscope;
pub mod rigol;
pub mod timebase;
pub mod trigger_config;
pub mod waveform;

// Re-export the main types for convenience
pub use analysis::{
    measure_pulse_width, measure_three_point, Orientation, PulseMeasurementError, PulseMetrics,
    ThreePointError, ThreePointMetrics,
};

pub use capture::{continuous_capture, capture_once, Capture, CaptureError, CaptureMode, CaptureSettings};

pub use connector::{BoxedChannel, ConnectorError, DiscoveredScope, Identity, ScopeAddress, ScopeConnector};

pub use export::ExportError;

pub use instrument_channel::{ChannelError, InstrumentChannel, ScpiTerminal, SerialChannel, TcpChannel};

pub use oscilloscope::{Oscilloscope, ScopeError};

pub use rigol::RigolDs1000z;

pub use timebase::{CaptureConfigError, TimebasePlan};

pub use trigger_config::{EdgeTrigger, EdgeTriggerBuilder, TriggerSlope};

pub use waveform::{Waveform, WaveformError};
