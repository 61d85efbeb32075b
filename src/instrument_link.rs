use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

/// How long a single blocking read may wait before the deadline is re-checked.
const READ_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout error: expected {expected} within {timeout:?} but got '{received}'")]
    Timeout {
        expected: String,
        received: String,
        timeout: Duration,
    },

    #[error("UTF-8 conversion error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Connection closed by the instrument")]
    Closed,
}

/// A byte-oriented connection to one instrument.
///
/// Every driver in this crate owns exactly one link and talks to the device
/// through it; nothing else writes to the same port.
pub trait InstrumentLink {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError>;

    /// Read up to `terminator`. The terminator itself is consumed but not returned.
    fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, LinkError>;

    /// Read exactly `len` bytes.
    fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, LinkError>;

    /// Drop anything the device sent that nobody asked for.
    fn clear_input(&mut self) -> Result<(), LinkError>;

    fn send_line(&mut self, command: &str, terminator: &str) -> Result<(), LinkError> {
        log::trace!("-> {}", command);
        self.write_all(format!("{command}{terminator}").as_bytes())
    }

    /// Send a command and read one LF-terminated reply, trimmed.
    fn query_line(
        &mut self,
        command: &str,
        terminator: &str,
        timeout: Duration,
    ) -> Result<String, LinkError> {
        self.send_line(command, terminator)?;
        let reply = String::from_utf8(self.read_until(b'\n', timeout)?)?;
        log::trace!("<- {}", reply.trim());
        Ok(reply.trim().to_string())
    }
}

impl<T: InstrumentLink + ?Sized> InstrumentLink for Box<T> {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        (**self).write_all(bytes)
    }

    fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, LinkError> {
        (**self).read_until(terminator, timeout)
    }

    fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, LinkError> {
        (**self).read_exact(len, timeout)
    }

    fn clear_input(&mut self) -> Result<(), LinkError> {
        (**self).clear_input()
    }
}

/// Type-erased link as stored by the bench controller.
pub type DynLink = Box<dyn InstrumentLink + Send>;

fn is_idle(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}

fn tail(received: &[u8]) -> String {
    let start = received.len().saturating_sub(16);
    String::from_utf8_lossy(&received[start..]).to_string()
}

fn read_until_deadline<R: Read + ?Sized>(
    reader: &mut R,
    terminator: u8,
    timeout: Duration,
) -> Result<Vec<u8>, LinkError> {
    let start = Instant::now();
    let mut response = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Err(LinkError::Closed),
            Ok(_) => {
                if byte[0] == terminator {
                    return Ok(response);
                }
                response.push(byte[0]);
            }
            Err(e) if is_idle(&e) => {}
            Err(e) => return Err(e.into()),
        }

        if start.elapsed() >= timeout {
            return Err(LinkError::Timeout {
                expected: format!("{:?}", terminator as char),
                received: tail(&response),
                timeout,
            });
        }
    }
}

fn read_exact_deadline<R: Read + ?Sized>(
    reader: &mut R,
    len: usize,
    timeout: Duration,
) -> Result<Vec<u8>, LinkError> {
    let start = Instant::now();
    let mut buffer = vec![0u8; len];
    let mut filled = 0;

    while filled < len {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => return Err(LinkError::Closed),
            Ok(n) => filled += n,
            Err(e) if is_idle(&e) => {}
            Err(e) => return Err(e.into()),
        }

        if filled < len && start.elapsed() >= timeout {
            return Err(LinkError::Timeout {
                expected: format!("{len} bytes"),
                received: format!("{filled} bytes"),
                timeout,
            });
        }
    }

    Ok(buffer)
}

/// RS-232 / USB-serial connection.
pub struct SerialLink {
    serial: Box<dyn SerialPort>,
}

impl SerialLink {
    pub fn open(port: &str, baud_rate: u32) -> Result<Self, LinkError> {
        log::debug!("Opening serial port {} at {} baud", port, baud_rate);
        let serial = serialport::new(port, baud_rate)
            .timeout(READ_SLICE)
            .open()?;

        let mut link = Self { serial };
        link.clear_input()?;
        Ok(link)
    }

    pub fn port_name(&self) -> Option<String> {
        self.serial.name()
    }
}

impl InstrumentLink for SerialLink {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.serial.write_all(bytes)?;
        self.serial.flush()?;
        Ok(())
    }

    fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, LinkError> {
        read_until_deadline(&mut self.serial, terminator, timeout)
    }

    fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, LinkError> {
        read_exact_deadline(&mut self.serial, len, timeout)
    }

    fn clear_input(&mut self) -> Result<(), LinkError> {
        self.serial.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }
}

/// Raw SCPI socket, e.g. a Rigol scope on port 5555.
pub struct TcpLink {
    stream: TcpStream,
}

impl TcpLink {
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, LinkError> {
        log::debug!("Connecting to {}:{}", host, port);
        let address = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            std::io::Error::new(
                ErrorKind::NotFound,
                format!("{host}:{port} did not resolve to an address"),
            )
        })?;

        let stream = TcpStream::connect_timeout(&address, timeout)?;
        stream.set_read_timeout(Some(READ_SLICE))?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }
}

impl InstrumentLink for TcpLink {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.stream.write_all(bytes)?;
        Ok(())
    }

    fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, LinkError> {
        read_until_deadline(&mut self.stream, terminator, timeout)
    }

    fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, LinkError> {
        read_exact_deadline(&mut self.stream, len, timeout)
    }

    fn clear_input(&mut self) -> Result<(), LinkError> {
        self.stream.set_nonblocking(true)?;
        let mut scratch = [0u8; 512];
        let drained = loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => break Err(LinkError::Closed),
                Ok(_) => {}
                Err(e) if is_idle(&e) => break Ok(()),
                Err(e) => break Err(e.into()),
            }
        };
        self.stream.set_nonblocking(false)?;
        drained
    }
}
