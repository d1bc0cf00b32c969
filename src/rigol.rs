use crate::instrument_channel::InstrumentChannel;
use crate::oscilloscope::{Oscilloscope, ScopeError};
use crate::timebase::{
    validate_channel, TimebasePlan, CHANNEL_OFFSET_VOLTS, CHANNEL_SCALE_VOLTS,
    HORIZONTAL_DIVISIONS,
};
use crate::trigger_config::{EdgeTrigger, TriggerSlope};
use crate::waveform::Waveform;
use std::thread;
use std::time::{Duration, Instant};

/// Rigol DS1000Z series oscilloscope driven over an owned instrument channel.
///
/// The channel is closed exactly once: by [`disconnect`](Self::disconnect),
/// at the end of a [`session`](Self::session), or on drop.
pub struct RigolDs1000z<C: InstrumentChannel> {
    instrument: Option<C>,
    settle_delay: Duration,
    poll_interval: Duration,
}

impl<C: InstrumentChannel> RigolDs1000z<C> {
    /// Largest `:WAVeform:DATA?` transfer the DS1000Z allows in RAW byte mode.
    pub const CHUNK_SIZE: usize = 250_000;
    /// ADC code at the vertical center of the screen.
    pub const ADC_CENTER: f64 = 128.0;
    /// 256 ADC levels spread over 8 vertical divisions.
    pub const LEVELS_PER_DIVISION: f64 = 32.0;

    const SETTLE_DELAY: Duration = Duration::from_millis(100);
    const POLL_INTERVAL: Duration = Duration::from_millis(100);

    pub fn new(instrument: C) -> Self {
        Self {
            instrument: Some(instrument),
            settle_delay: Self::SETTLE_DELAY,
            poll_interval: Self::POLL_INTERVAL,
        }
    }

    /// A driver with no connection; every device operation fails with `NotConnected`.
    pub fn disconnected() -> Self {
        Self {
            instrument: None,
            settle_delay: Self::SETTLE_DELAY,
            poll_interval: Self::POLL_INTERVAL,
        }
    }

    /// Pause between stopping acquisition and reading waveform memory.
    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    /// Interval between trigger status polls.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.instrument.is_some()
    }

    pub fn disconnect(&mut self) -> Result<(), ScopeError> {
        if let Some(mut instrument) = self.instrument.take() {
            log::debug!("Disconnecting from oscilloscope");
            instrument.close()?;
        }
        Ok(())
    }

    /// Run `f` against a connected scope and disconnect afterwards, whatever
    /// `f` returned.
    pub fn session<T, E>(instrument: C, f: impl FnOnce(&mut Self) -> Result<T, E>) -> Result<T, E>
    where
        E: From<ScopeError>,
    {
        let mut scope = Self::new(instrument);
        let result = f(&mut scope);
        let closed = scope.disconnect();
        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), closed) => {
                if let Err(close_error) = closed {
                    log::warn!("Failed to close oscilloscope connection: {}", close_error);
                }
                Err(e)
            }
        }
    }

    fn instrument(&mut self) -> Result<&mut C, ScopeError> {
        self.instrument.as_mut().ok_or(ScopeError::NotConnected)
    }

    fn write(&mut self, command: &str) -> Result<(), ScopeError> {
        self.instrument()?.write(command)?;
        Ok(())
    }

    fn query_f64(&mut self, command: &str) -> Result<f64, ScopeError> {
        let reply = self.instrument()?.query(command)?;
        let parsed = reply.trim().parse::<f64>();
        parsed.map_err(|_| ScopeError::InvalidReply {
            command: command.to_string(),
            reply,
        })
    }

    /// Number of points in acquisition memory.
    fn memory_points(&mut self) -> Result<usize, ScopeError> {
        let depth = self.instrument()?.query(":ACQuire:MDEPth?")?;
        let depth = depth.trim();
        if depth.eq_ignore_ascii_case("AUTO") {
            let sample_rate = self.query_f64(":ACQuire:SRATe?")?;
            let scale = self.query_f64(":TIMebase:MAIN:SCALe?")?;
            let points = (sample_rate * scale * HORIZONTAL_DIVISIONS) as usize;
            log::debug!("Memory depth AUTO, derived {} points", points);
            return Ok(points);
        }
        depth
            .parse::<f64>()
            .map(|points| points as usize)
            .map_err(|_| ScopeError::InvalidReply {
                command: ":ACQuire:MDEPth?".to_string(),
                reply: depth.to_string(),
            })
    }

    /// Read `total_points` bytes of RAW memory in transfer-sized windows.
    fn read_raw_memory(&mut self, total_points: usize) -> Result<Vec<u8>, ScopeError> {
        #[cfg(feature = "cpu-profiling")]
        let _span = tracy_client::span!("RigolDs1000z::read_raw_memory");

        let mut raw = Vec::with_capacity(total_points);
        for start in (1..=total_points).step_by(Self::CHUNK_SIZE) {
            let stop = (start + Self::CHUNK_SIZE - 1).min(total_points);
            self.write(&format!(":WAVeform:STARt {start}"))?;
            self.write(&format!(":WAVeform:STOP {stop}"))?;
            let chunk = self.instrument()?.query_binary(":WAVeform:DATA?")?;
            log::debug!("Read points {}..={} ({} bytes)", start, stop, chunk.len());
            let expected = stop - start + 1;
            if chunk.len() != expected {
                return Err(ScopeError::ShortRead {
                    start,
                    expected,
                    received: chunk.len(),
                });
            }
            raw.extend_from_slice(&chunk);
        }
        Ok(raw)
    }

    /// Convert a RAW mode byte to volts.
    ///
    /// The voltage step comes from the channel scale, not from
    /// `:WAVeform:PREamble?`: in RAW mode the preamble increments reported by
    /// the DS1000Z firmware are wrong.
    pub fn raw_to_voltage(raw: u8, scale_per_division: f64, channel_offset: f64) -> f64 {
        let step = scale_per_division / Self::LEVELS_PER_DIVISION;
        (f64::from(raw) - Self::ADC_CENTER) * step - channel_offset
    }

    /// Time of the first memory point relative to the trigger.
    ///
    /// Memory is centered on the screen center; a negative trigger offset moves
    /// the trigger right of center and puts more of memory before t = 0.
    pub fn memory_start_time(total_points: usize, sample_rate: f64, trigger_offset: f64) -> f64 {
        let total_duration = total_points as f64 / sample_rate;
        -(total_duration / 2.0) + trigger_offset
    }
}

impl<C: InstrumentChannel> Oscilloscope for RigolDs1000z<C> {
    fn configure_timebase(
        &mut self,
        max_duration: f64,
        sample_interval: f64,
        channels: &[u8],
    ) -> Result<(), ScopeError> {
        self.instrument()?;
        let plan = TimebasePlan::for_pulse(max_duration, sample_interval)?;
        for &channel in channels {
            validate_channel(channel)?;
        }

        // Settings must not change while acquiring
        self.write(":STOP")?;

        self.write(&format!(":TIMebase:MAIN:SCALe {}", plan.time_per_division))?;
        self.write(&format!(":ACQuire:MDEPth {}", plan.memory_depth))?;
        self.write(&format!(":TIMebase:MAIN:OFFSet {}", plan.trigger_offset))?;

        for &channel in channels {
            self.write(&format!(":CHAN{channel}:SCALe {CHANNEL_SCALE_VOLTS}"))?;
            self.write(&format!(":CHAN{channel}:OFFSet {CHANNEL_OFFSET_VOLTS}"))?;
            self.write(&format!(":CHAN{channel}:DISPlay ON"))?;
        }

        log::info!(
            "Timebase configured: {} s/div, {} points, channels {:?}",
            plan.time_per_division,
            plan.memory_depth,
            channels
        );
        Ok(())
    }

    fn setup_edge_trigger(
        &mut self,
        channel: u8,
        level: f64,
        slope: TriggerSlope,
    ) -> Result<(), ScopeError> {
        self.instrument()?;
        let trigger = EdgeTrigger::new(channel, level, slope)?;
        for command in trigger.into_commands() {
            self.write(&command)?;
        }
        log::info!("Trigger armed on channel {} at {} V ({} edge)", channel, level, slope);
        Ok(())
    }

    fn wait_for_trigger(&mut self, timeout: Option<Duration>) -> Result<bool, ScopeError> {
        let started = Instant::now();
        loop {
            let status = self.instrument()?.query(":TRIGger:STATus?")?;
            match status.trim() {
                "TD" | "STOP" => return Ok(true),
                other => log::trace!("Trigger status {}", other),
            }
            if let Some(timeout) = timeout {
                if started.elapsed() >= timeout {
                    log::debug!("No trigger within {:?}", timeout);
                    return Ok(false);
                }
            }
            thread::sleep(self.poll_interval);
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    fn get_waveform(&mut self, channel: u8) -> Result<Waveform, ScopeError> {
        self.instrument()?;
        validate_channel(channel)?;

        // Waveform memory is undefined while acquisition runs
        self.write(":STOP")?;
        thread::sleep(self.settle_delay);

        self.write(&format!(":WAVeform:SOURce CHAN{channel}"))?;
        self.write(":WAVeform:MODE RAW")?;
        self.write(":WAVeform:FORMat BYTE")?;

        let total_points = self.memory_points()?;
        self.write(":WAVeform:STARt 1")?;
        self.write(&format!(":WAVeform:STOP {}", total_points.min(Self::CHUNK_SIZE)))?;

        let scale = self.query_f64(&format!(":CHAN{channel}:SCALe?"))?;
        let offset = self.query_f64(&format!(":CHAN{channel}:OFFSet?"))?;

        // The preamble x increment is also wrong in RAW mode
        let sample_rate = self.query_f64(":ACQuire:SRATe?")?;
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(ScopeError::InvalidReply {
                command: ":ACQuire:SRATe?".to_string(),
                reply: sample_rate.to_string(),
            });
        }
        let trigger_offset = self.query_f64(":TIMebase:MAIN:OFFSet?")?;
        let start_time = Self::memory_start_time(total_points, sample_rate, trigger_offset);

        let raw = self.read_raw_memory(total_points)?;
        let samples = raw
            .iter()
            .map(|&byte| Self::raw_to_voltage(byte, scale, offset))
            .collect();

        log::debug!(
            "Channel {}: {} points at {} Sa/s starting at {} s",
            channel,
            raw.len(),
            sample_rate,
            start_time
        );
        Ok(Waveform::new(samples, sample_rate, start_time)?)
    }
}

impl<C: InstrumentChannel> Drop for RigolDs1000z<C> {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            log::warn!("Failed to close oscilloscope connection: {}", e);
        }
    }
}
