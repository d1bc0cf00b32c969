use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

/// Request/response channel to an instrument speaking SCPI.
///
/// Every call is a blocking round trip. Implementations own their transport
/// handle exclusively.
pub trait InstrumentChannel {
    fn write(&mut self, command: &str) -> Result<(), ChannelError>;
    fn query(&mut self, command: &str) -> Result<String, ChannelError>;
    fn query_binary(&mut self, command: &str) -> Result<Vec<u8>, ChannelError>;
    fn close(&mut self) -> Result<(), ChannelError>;
}

impl<C: InstrumentChannel + ?Sized> InstrumentChannel for Box<C> {
    fn write(&mut self, command: &str) -> Result<(), ChannelError> {
        (**self).write(command)
    }

    fn query(&mut self, command: &str) -> Result<String, ChannelError> {
        (**self).query(command)
    }

    fn query_binary(&mut self, command: &str) -> Result<Vec<u8>, ChannelError> {
        (**self).query_binary(command)
    }

    fn close(&mut self) -> Result<(), ChannelError> {
        (**self).close()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout waiting for reply to '{command}' ({received} bytes received)")]
    Timeout { command: String, received: usize },

    #[error("Connection to instrument is closed")]
    Closed,

    #[error("Malformed binary block: {0}")]
    MalformedBlock(String),

    #[error("UTF-8 conversion error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Line-oriented SCPI terminal over any byte stream.
///
/// Commands are terminated with `\n`, text replies are read up to the next
/// `\n` and binary replies are IEEE 488.2 definite-length blocks
/// (`#<n><length><payload>\n`).
pub struct ScpiTerminal<S: Read + Write> {
    stream: Option<S>,
    timeout: Duration,
}

pub type SerialChannel = ScpiTerminal<Box<dyn SerialPort>>;
pub type TcpChannel = ScpiTerminal<TcpStream>;

impl<S: Read + Write> ScpiTerminal<S> {
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Upper bound for a single reply, text or binary.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn stream(&mut self) -> Result<&mut S, ChannelError> {
        self.stream.as_mut().ok_or(ChannelError::Closed)
    }

    fn send(&mut self, command: &str) -> Result<(), ChannelError> {
        log::trace!("-> {}", command);
        let stream = self.stream()?;
        stream.write_all(format!("{command}\n").as_bytes())?;
        stream.flush()?;
        Ok(())
    }

    fn read_line(&mut self, command: &str) -> Result<String, ChannelError> {
        let deadline = Instant::now() + self.timeout;
        let stream = self.stream()?;

        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            read_full(stream, &mut byte, deadline, command, response.len())?;
            if byte[0] == b'\n' {
                break;
            }
            response.push(byte[0]);
        }

        let reply = String::from_utf8(response)?;
        log::trace!("<- {}", reply.trim_end());
        Ok(reply.trim_end().to_string())
    }

    fn read_block(&mut self, command: &str) -> Result<Vec<u8>, ChannelError> {
        let deadline = Instant::now() + self.timeout;
        let stream = self.stream()?;

        let mut marker = [0u8; 2];
        read_full(stream, &mut marker, deadline, command, 0)?;
        if marker[0] != b'#' {
            return Err(ChannelError::MalformedBlock(format!(
                "expected '#', got 0x{:02x}",
                marker[0]
            )));
        }
        let digits = match marker[1] {
            b'1'..=b'9' => usize::from(marker[1] - b'0'),
            b'0' => {
                return Err(ChannelError::MalformedBlock(
                    "indefinite-length blocks are not supported".to_string(),
                ))
            }
            other => {
                return Err(ChannelError::MalformedBlock(format!(
                    "invalid length digit count 0x{other:02x}"
                )))
            }
        };

        let mut length_field = vec![0u8; digits];
        read_full(stream, &mut length_field, deadline, command, 2)?;
        let length: usize = std::str::from_utf8(&length_field)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                ChannelError::MalformedBlock(format!(
                    "invalid length field {:?}",
                    String::from_utf8_lossy(&length_field)
                ))
            })?;

        let mut payload = vec![0u8; length];
        read_full(stream, &mut payload, deadline, command, 2 + digits)?;

        let mut terminator = [0u8; 1];
        read_full(stream, &mut terminator, deadline, command, 2 + digits + length)?;

        log::trace!("<- block of {} bytes", length);
        Ok(payload)
    }
}

impl<S: Read + Write> InstrumentChannel for ScpiTerminal<S> {
    fn write(&mut self, command: &str) -> Result<(), ChannelError> {
        self.send(command)
    }

    fn query(&mut self, command: &str) -> Result<String, ChannelError> {
        self.send(command)?;
        self.read_line(command)
    }

    fn query_binary(&mut self, command: &str) -> Result<Vec<u8>, ChannelError> {
        self.send(command)?;
        self.read_block(command)
    }

    fn close(&mut self) -> Result<(), ChannelError> {
        if let Some(mut stream) = self.stream.take() {
            log::debug!("Closing instrument channel");
            stream.flush()?;
        }
        Ok(())
    }
}

impl ScpiTerminal<Box<dyn SerialPort>> {
    /// Open a serial port carrying SCPI.
    pub fn open_serial(port: &str, baud_rate: u32) -> Result<Self, ChannelError> {
        log::debug!("Opening serial port {} at {} baud", port, baud_rate);
        let serial = serialport::new(port, baud_rate)
            .timeout(Duration::from_millis(10))
            .open()?;
        serial.clear(serialport::ClearBuffer::All)?;
        Ok(Self::new(serial))
    }
}

impl ScpiTerminal<TcpStream> {
    /// Open a raw SCPI socket (the DS1000Z listens on port 5555).
    pub fn open_tcp(host: &str, port: u16, timeout: Duration) -> Result<Self, ChannelError> {
        log::debug!("Connecting to {}:{}", host, port);
        let addr = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            std::io::Error::new(ErrorKind::NotFound, format!("cannot resolve {host}"))
        })?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(Duration::from_millis(100)))?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream).with_timeout(timeout))
    }
}

/// Fill `buf` completely, retrying on transport read timeouts until `deadline`.
fn read_full<R: Read>(
    stream: &mut R,
    buf: &mut [u8],
    deadline: Instant,
    command: &str,
    already_received: usize,
) -> Result<(), ChannelError> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(ChannelError::Closed),
            Ok(n) => filled += n,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                if Instant::now() >= deadline {
                    return Err(ChannelError::Timeout {
                        command: command.to_string(),
                        received: already_received + filled,
                    });
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
