use crate::instrument_channel::{ChannelError, InstrumentChannel, SerialChannel, TcpChannel};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Where an oscilloscope can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeAddress {
    Tcp { host: String, port: u16 },
    Serial { port: String },
}

impl ScopeAddress {
    /// Raw SCPI socket port of the DS1000Z LAN interface.
    pub const DEFAULT_SCPI_PORT: u16 = 5555;
}

impl fmt::Display for ScopeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "TCPIP::{host}::{port}::SOCKET"),
            Self::Serial { port } => write!(f, "ASRL{port}::INSTR"),
        }
    }
}

impl FromStr for ScopeAddress {
    type Err = ConnectorError;

    /// Accepts VISA-style resource strings (`TCPIP::host::INSTR`,
    /// `TCPIP0::host::inst0::INSTR`, `TCPIP0::host::5555::SOCKET`, `ASRL/dev/ttyUSB0::INSTR`), bare serial
    /// port names (`/dev/ttyUSB0`, `COM3`) and `host[:port]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConnectorError::InvalidAddress {
            address: s.to_string(),
        };
        let s = s.trim();
        if s.is_empty() {
            return Err(invalid());
        }

        let upper = s.to_ascii_uppercase();
        if upper.starts_with("TCPIP") {
            let parts: Vec<&str> = s.split("::").collect();
            return match parts.as_slice() {
                // The LAN device name (`inst0`, `hislip0`) selects nothing on the raw socket
                [_, host, suffix] | [_, host, _, suffix] if suffix.eq_ignore_ascii_case("INSTR") => {
                    Ok(Self::Tcp {
                        host: (*host).to_string(),
                        port: Self::DEFAULT_SCPI_PORT,
                    })
                }
                [_, host, port, suffix] if suffix.eq_ignore_ascii_case("SOCKET") => {
                    Ok(Self::Tcp {
                        host: (*host).to_string(),
                        port: port.parse().map_err(|_| invalid())?,
                    })
                }
                _ => Err(invalid()),
            };
        }

        if upper.starts_with("ASRL") {
            let port = s[4..].split("::").next().unwrap_or_default();
            if port.is_empty() {
                return Err(invalid());
            }
            return Ok(Self::Serial {
                port: port.to_string(),
            });
        }

        if s.starts_with('/') || upper.starts_with("COM") {
            return Ok(Self::Serial {
                port: s.to_string(),
            });
        }

        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => Ok(Self::Tcp {
                host: host.to_string(),
                port: port.parse().map_err(|_| invalid())?,
            }),
            Some(_) => Err(invalid()),
            None => Ok(Self::Tcp {
                host: s.to_string(),
                port: Self::DEFAULT_SCPI_PORT,
            }),
        }
    }
}

/// Parsed `*IDN?` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
}

impl Identity {
    pub fn parse(idn: &str) -> Self {
        let mut fields = idn.trim().split(',').map(|f| f.trim().to_string());
        Self {
            manufacturer: fields.next().unwrap_or_default(),
            model: fields.next().unwrap_or_default(),
            serial: fields.next().unwrap_or_default(),
            firmware: fields.next().unwrap_or_default(),
        }
    }

    /// True for any Rigol DS1000Z family instrument.
    pub fn is_ds1000z(&self) -> bool {
        let idn = format!("{},{}", self.manufacturer, self.model);
        idn.contains(ScopeConnector::VENDOR_MARKER) && idn.contains(ScopeConnector::FAMILY_MARKER)
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveredScope {
    pub address: ScopeAddress,
    pub identity: Identity,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Instrument channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Cannot parse instrument address '{address}'")]
    InvalidAddress { address: String },

    #[error("No Rigol DS1000Z oscilloscope found")]
    DeviceNotFound,
}

pub type BoxedChannel = Box<dyn InstrumentChannel + Send>;

pub struct ScopeConnector;

impl ScopeConnector {
    pub const VENDOR_MARKER: &'static str = "RIGOL";
    pub const FAMILY_MARKER: &'static str = "DS1";
    pub const SERIAL_BAUD_RATE: u32 = 115_200;
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
    /// A full 250k point chunk takes about 22 s at 115200 baud.
    const SERIAL_REPLY_TIMEOUT: Duration = Duration::from_secs(60);

    /// Open a channel to the instrument at `address`.
    pub fn connect(address: &ScopeAddress) -> Result<BoxedChannel, ConnectorError> {
        log::debug!("Connecting to {}", address);
        let channel: BoxedChannel = match address {
            ScopeAddress::Tcp { host, port } => {
                Box::new(TcpChannel::open_tcp(host, *port, Self::CONNECT_TIMEOUT)?)
            }
            ScopeAddress::Serial { port } => Box::new(
                SerialChannel::open_serial(port, Self::SERIAL_BAUD_RATE)?
                    .with_timeout(Self::SERIAL_REPLY_TIMEOUT),
            ),
        };
        Ok(channel)
    }

    /// Find the first DS1000Z and return an open channel to it.
    ///
    /// Only serial ports are searched. Scopes on the LAN or on USBTMC need an
    /// explicit address for [`connect`](Self::connect).
    pub fn auto_connect() -> Result<(BoxedChannel, DiscoveredScope), ConnectorError> {
        for address in Self::candidate_addresses()? {
            match Self::probe(&address) {
                Ok(Some((channel, identity))) => {
                    log::debug!("Found {} {} at {}", identity.manufacturer, identity.model, address);
                    return Ok((channel, DiscoveredScope { address, identity }));
                }
                Ok(None) => {}
                Err(e) => log::debug!("Skipping {}: {}", address, e),
            }
        }
        Err(ConnectorError::DeviceNotFound)
    }

    /// All DS1000Z instruments reachable over the local serial ports.
    pub fn available_devices() -> Result<Vec<DiscoveredScope>, ConnectorError> {
        let mut devices = Vec::new();
        for address in Self::candidate_addresses()? {
            match Self::probe(&address) {
                Ok(Some((mut channel, identity))) => {
                    if let Err(e) = channel.close() {
                        log::debug!("Failed to close {}: {}", address, e);
                    }
                    devices.push(DiscoveredScope { address, identity });
                }
                Ok(None) => {}
                Err(e) => log::debug!("Skipping {}: {}", address, e),
            }
        }
        Ok(devices)
    }

    fn candidate_addresses() -> Result<Vec<ScopeAddress>, ConnectorError> {
        let ports = serialport::available_ports().map_err(ChannelError::from)?;
        Ok(ports
            .into_iter()
            .map(|p| ScopeAddress::Serial { port: p.port_name })
            .collect())
    }

    /// Open `address` and check its identity. Returns the still-open channel on a match.
    fn probe(address: &ScopeAddress) -> Result<Option<(BoxedChannel, Identity)>, ConnectorError> {
        match address {
            ScopeAddress::Serial { port } => {
                // Short timeout while asking, full timeout once it is ours
                let mut channel = SerialChannel::open_serial(port, Self::SERIAL_BAUD_RATE)?
                    .with_timeout(Self::PROBE_TIMEOUT);
                let identity = Self::identify(&mut channel)?;
                Ok(identity.map(|identity| {
                    let channel: BoxedChannel =
                        Box::new(channel.with_timeout(Self::SERIAL_REPLY_TIMEOUT));
                    (channel, identity)
                }))
            }
            ScopeAddress::Tcp { .. } => {
                let mut channel = Self::connect(address)?;
                Ok(Self::identify(channel.as_mut())?.map(|identity| (channel, identity)))
            }
        }
    }

    /// Query `*IDN?` and keep the identity only if it is a DS1000Z. Closes non-matching channels.
    pub fn identify<C: InstrumentChannel + ?Sized>(
        channel: &mut C,
    ) -> Result<Option<Identity>, ChannelError> {
        let identity = Identity::parse(&channel.query("*IDN?")?);
        if identity.is_ds1000z() {
            Ok(Some(identity))
        } else {
            log::debug!("Ignoring instrument '{},{}'", identity.manufacturer, identity.model);
            channel.close()?;
            Ok(None)
        }
    }
}
