use crate::timebase::{validate_channel, CaptureConfigError};
use std::fmt;
use std::str::FromStr;

/// Direction of the edge that fires the trigger.
///
/// Defaults to falling: the photodiode pulse is captured in the pre-trigger
/// region and the trigger fires when the shutter closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerSlope {
    Positive,
    #[default]
    Negative,
}

impl TriggerSlope {
    pub fn as_scpi(&self) -> &'static str {
        match self {
            Self::Positive => "POSitive",
            Self::Negative => "NEGative",
        }
    }
}

impl fmt::Display for TriggerSlope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Positive => "rising",
            Self::Negative => "falling",
        })
    }
}

impl FromStr for TriggerSlope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pos" | "positive" | "rising" => Ok(Self::Positive),
            "neg" | "negative" | "falling" => Ok(Self::Negative),
            other => Err(format!("unknown trigger slope '{other}'")),
        }
    }
}

/// Single-shot edge trigger on one analog channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeTrigger {
    pub channel: u8,
    pub level: f64,
    pub slope: TriggerSlope,
}

#[derive(Debug)]
pub struct EdgeTriggerBuilder {
    channel: u8,
    level: f64,
}

impl EdgeTriggerBuilder {
    pub fn rising_edge(self) -> Result<EdgeTrigger, CaptureConfigError> {
        EdgeTrigger::new(self.channel, self.level, TriggerSlope::Positive)
    }

    pub fn falling_edge(self) -> Result<EdgeTrigger, CaptureConfigError> {
        EdgeTrigger::new(self.channel, self.level, TriggerSlope::Negative)
    }
}

impl EdgeTrigger {
    pub fn new(channel: u8, level: f64, slope: TriggerSlope) -> Result<Self, CaptureConfigError> {
        validate_channel(channel)?;
        if !level.is_finite() {
            return Err(CaptureConfigError::InvalidTriggerLevel(level));
        }
        Ok(Self {
            channel,
            level,
            slope,
        })
    }

    /// `EdgeTrigger::start_capturing_when(1, 0.2).falling_edge()`
    pub fn start_capturing_when(channel: u8, volts: f64) -> EdgeTriggerBuilder {
        EdgeTriggerBuilder {
            channel,
            level: volts,
        }
    }

    /// Commands that arm the trigger and start one acquisition sweep.
    pub fn into_commands(self) -> Vec<String> {
        vec![
            ":TRIGger:MODE EDGE".to_string(),
            format!(":TRIGger:EDGe:SOURce CHAN{}", self.channel),
            format!(":TRIGger:EDGe:LEVel {}", self.level),
            format!(":TRIGger:EDGe:SLOPe {}", self.slope.as_scpi()),
            ":TRIGger:SWEep SINGle".to_string(),
            ":SINGle".to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_slope_is_falling() {
        assert_eq!(TriggerSlope::default(), TriggerSlope::Negative);
        assert_eq!(TriggerSlope::default().as_scpi(), "NEGative");
    }

    #[test]
    fn test_slope_from_str() {
        assert_eq!("POS".parse::<TriggerSlope>(), Ok(TriggerSlope::Positive));
        assert_eq!("falling".parse::<TriggerSlope>(), Ok(TriggerSlope::Negative));
        assert!("sideways".parse::<TriggerSlope>().is_err());
    }

    #[test]
    fn test_builder_commands() {
        let commands = EdgeTrigger::start_capturing_when(2, 0.5)
            .rising_edge()
            .unwrap()
            .into_commands();
        assert_eq!(
            commands,
            vec![
                ":TRIGger:MODE EDGE",
                ":TRIGger:EDGe:SOURce CHAN2",
                ":TRIGger:EDGe:LEVel 0.5",
                ":TRIGger:EDGe:SLOPe POSitive",
                ":TRIGger:SWEep SINGle",
                ":SINGle",
            ]
        );
    }

    #[test]
    fn test_rejects_invalid_channel_and_level() {
        assert!(EdgeTrigger::new(0, 0.2, TriggerSlope::Negative).is_err());
        assert!(EdgeTrigger::new(5, 0.2, TriggerSlope::Negative).is_err());
        assert!(EdgeTrigger::new(1, f64::NAN, TriggerSlope::Negative).is_err());
    }
}
