use clap::Parser;
use shutterscope_rs::{
    continuous_capture, capture_once, export, Capture, CaptureError, CaptureMode, CaptureSettings,
    Orientation, RigolDs1000z, ScopeAddress, ScopeConnector, TriggerSlope,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Measure camera shutter timing with a Rigol DS1000Z oscilloscope.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Instrument address, e.g. TCPIP::192.168.1.100::INSTR, 192.168.1.100:5555
    /// or /dev/ttyUSB0. Serial ports are searched when omitted.
    address: Option<String>,

    /// Trigger level in volts
    #[arg(long, default_value_t = CaptureSettings::DEFAULT_TRIGGER_LEVEL)]
    trigger_level: f64,

    /// Trigger slope: rising or falling
    #[arg(long, default_value_t = TriggerSlope::Negative)]
    slope: TriggerSlope,

    /// Desired sample interval in seconds
    #[arg(long, default_value_t = CaptureSettings::DEFAULT_SAMPLE_INTERVAL)]
    sample_interval: f64,

    /// Longest shutter opening to capture, in seconds
    #[arg(long, default_value_t = CaptureSettings::DEFAULT_MAX_DURATION)]
    max_duration: f64,

    /// Seconds to wait for the shutter; 0 waits forever
    #[arg(long, default_value_t = CaptureSettings::DEFAULT_TRIGGER_TIMEOUT.as_secs_f64())]
    timeout: f64,

    /// Read three sensors and measure shutter travel
    #[arg(long)]
    three_point: bool,

    /// Direction of shutter travel across the three sensors
    #[arg(long, default_value_t = Orientation::Horizontal)]
    orientation: Orientation,

    /// Sensor channels: one for single-point, first,center,last for three-point
    #[arg(long, value_delimiter = ',')]
    channels: Vec<u8>,

    /// Distance between the first and last sensor in meters, for shutter velocity
    #[arg(long)]
    sensor_span: Option<f64>,

    /// Keep capturing until interrupted
    #[arg(long)]
    continuous: bool,

    /// Stop continuous capture after this many shutter releases
    #[arg(long, requires = "continuous")]
    count: Option<usize>,

    /// Directory for capture files
    #[arg(long, default_value = ".")]
    output: PathBuf,

    /// Also write time/voltage CSV files
    #[arg(long)]
    csv: bool,
}

impl Args {
    fn capture_settings(&self) -> Result<CaptureSettings, String> {
        let mut settings = if self.three_point {
            match self.channels.as_slice() {
                [] => CaptureSettings::three_point(self.orientation, 1, 2, 3),
                &[first, center, last] => {
                    CaptureSettings::three_point(self.orientation, first, center, last)
                }
                other => {
                    return Err(format!(
                        "three-point mode needs exactly 3 channels, got {}",
                        other.len()
                    ))
                }
            }
        } else {
            match self.channels.as_slice() {
                [] => CaptureSettings::default(),
                &[channel] => CaptureSettings::single(channel),
                other => {
                    return Err(format!(
                        "single-point mode needs exactly 1 channel, got {}",
                        other.len()
                    ))
                }
            }
        };

        settings.trigger_level = self.trigger_level;
        settings.trigger_slope = self.slope;
        settings.sample_interval = self.sample_interval;
        settings.max_duration = self.max_duration;
        settings.trigger_timeout = if self.timeout > 0.0 {
            Some(Duration::try_from_secs_f64(self.timeout).map_err(|e| e.to_string())?)
        } else {
            None
        };
        Ok(settings)
    }
}

/// Writes each capture next to the previous ones.
struct CaptureWriter<'a> {
    directory: &'a Path,
    mode: CaptureMode,
    sensor_span: Option<f64>,
    csv: bool,
}

impl CaptureWriter<'_> {
    fn stem(&self, index: Option<usize>) -> String {
        let base = match self.mode {
            CaptureMode::Single { .. } => "capture",
            CaptureMode::ThreePoint { .. } => "three_point",
        };
        index.map_or_else(|| base.to_string(), |i| format!("{base}_{i:04}"))
    }

    fn save(&self, index: Option<usize>, capture: &Capture) -> Result<(), CaptureError> {
        let stem = self.stem(index);
        match (capture, self.mode) {
            (Capture::Single { waveform, metrics }, _) => {
                let path = self.directory.join(format!("{stem}.json"));
                export::save_waveform_json(&path, waveform, metrics.as_ref())?;
                println!("Saved {}", path.display());
                if self.csv {
                    let path = self.directory.join(format!("{stem}.csv"));
                    export::save_waveform_csv(&path, waveform)?;
                    println!("Saved {}", path.display());
                }
            }
            (
                Capture::ThreePoint { waveforms, metrics },
                CaptureMode::ThreePoint {
                    first,
                    center,
                    last,
                    ..
                },
            ) => {
                let path = self.directory.join(format!("{stem}.json"));
                export::save_three_point_json(
                    &path,
                    waveforms,
                    [first, center, last],
                    metrics.as_ref(),
                    self.sensor_span,
                )?;
                println!("Saved {}", path.display());
                if self.csv {
                    for (channel, waveform) in waveforms {
                        let path = self.directory.join(format!("{stem}_ch{channel}.csv"));
                        export::save_waveform_csv(&path, waveform)?;
                        println!("Saved {}", path.display());
                    }
                }
            }
            (Capture::ThreePoint { .. }, CaptureMode::Single { .. }) => {
                log::warn!("Ignoring three-point capture in single-point mode");
            }
        }
        Ok(())
    }
}

fn print_summary(capture: &Capture, sensor_span: Option<f64>) {
    match capture {
        Capture::Single {
            metrics: Some(metrics),
            ..
        } => {
            println!(
                "Shutter speed: {:.3} ms ({})",
                metrics.pulse_width_ms(),
                metrics.shutter_speed_fraction()
            );
        }
        Capture::ThreePoint {
            metrics: Some(metrics),
            ..
        } => {
            println!("Orientation: {}", metrics.orientation);
            for (label, pulse) in [
                ("First", &metrics.first),
                ("Center", &metrics.center),
                ("Last", &metrics.last),
            ] {
                println!(
                    "  {label:<6} {:.3} ms ({})",
                    pulse.pulse_width_ms(),
                    pulse.shutter_speed_fraction()
                );
            }
            println!(
                "  First to center: {:.3} ms",
                metrics.first_to_center_delay_ms()
            );
            println!(
                "  Center to last:  {:.3} ms",
                metrics.center_to_last_delay_ms()
            );
            println!("  Travel time:     {:.3} ms", metrics.shutter_travel_time_ms());
            println!("  Uniformity:      {:.1}%", metrics.timing_uniformity());
            if let Some(velocity) = sensor_span.and_then(|span| metrics.shutter_velocity(span)) {
                println!("  Velocity:        {velocity:.2} m/s");
            }
        }
        _ => println!("No complete pulse found in the capture"),
    }
}

fn install_interrupt_handler() -> Result<Arc<AtomicBool>, ctrlc::Error> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!("Stopping after the current capture (Ctrl-C again to abort)");
    })?;
    Ok(stop)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    #[cfg(feature = "cpu-profiling")]
    let _profiler = tracy_client::Client::start();

    let args = Args::parse();
    let settings = args.capture_settings()?;
    std::fs::create_dir_all(&args.output)?;

    let channel = match &args.address {
        Some(address) => {
            let address: ScopeAddress = address.parse()?;
            log::info!("Connecting to {}", address);
            ScopeConnector::connect(&address)?
        }
        None => {
            let (channel, scope) = ScopeConnector::auto_connect()?;
            log::info!(
                "Found {} {} at {}",
                scope.identity.manufacturer,
                scope.identity.model,
                scope.address
            );
            channel
        }
    };

    let writer = CaptureWriter {
        directory: &args.output,
        mode: settings.mode,
        sensor_span: args.sensor_span,
        csv: args.csv,
    };

    if args.continuous {
        let stop = install_interrupt_handler()?;
        let count = RigolDs1000z::session(channel, |scope| {
            continuous_capture(scope, &settings, &stop, args.count, |index, capture| {
                println!("Capture {index}");
                print_summary(&capture, args.sensor_span);
                writer.save(Some(index), &capture)
            })
        })?;
        println!("Captured {count} shutter release(s)");
    } else {
        let capture = RigolDs1000z::session(channel, |scope| capture_once(scope, &settings))?;
        match capture {
            Some(capture) => {
                print_summary(&capture, args.sensor_span);
                writer.save(None, &capture)?;
            }
            None => println!("No trigger within the timeout"),
        }
    }

    Ok(())
}
