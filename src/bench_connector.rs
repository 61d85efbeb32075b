use crate::instrument_link::{DynLink, LinkError, SerialLink, TcpLink};
use std::str::FromStr;
use std::time::Duration;

/// Raw socket port Rigol scopes listen on.
pub const RIGOL_SOCKET_PORT: u16 = 5555;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
}

impl PortInfo {
    pub fn new(name: String, description: String) -> Self {
        Self { name, description }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("'{resource}' is not a valid instrument resource")]
    InvalidResource { resource: String },

    #[error("'{resource}' needs a VISA backend; use a TCPIP socket or serial resource instead")]
    UnsupportedResource { resource: String },
}

/// Where an instrument lives.
///
/// Accepts the VISA spellings used on the bench (`TCPIP0::host::5555::SOCKET`,
/// `TCPIP0::host::INSTR`, `ASRL3::INSTR`) as well as plain `host:port` and
/// serial port names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceAddress {
    Serial { port: String },
    Tcp { host: String, port: u16 },
}

impl ResourceAddress {
    pub fn serial(port: &str) -> Self {
        Self::Serial {
            port: port.to_string(),
        }
    }

    fn parse_visa(resource: &str) -> Result<Self, ConnectorError> {
        let invalid = || ConnectorError::InvalidResource {
            resource: resource.to_string(),
        };
        let parts: Vec<&str> = resource.split("::").collect();
        let interface = parts[0].to_ascii_uppercase();

        if interface.starts_with("TCPIP") {
            let host = parts.get(1).filter(|h| !h.is_empty()).ok_or_else(invalid)?;
            let class = parts.last().map(|c| c.to_ascii_uppercase());
            let port = match (parts.len(), class.as_deref()) {
                (4, Some("SOCKET")) => parts[2].parse().map_err(|_| invalid())?,
                (3, Some("INSTR")) => RIGOL_SOCKET_PORT,
                _ => return Err(invalid()),
            };
            Ok(Self::Tcp {
                host: (*host).to_string(),
                port,
            })
        } else if let Some(number) = interface.strip_prefix("ASRL") {
            let port = parts[0][4..].to_string();
            if port.is_empty() {
                return Err(invalid());
            }
            if number.chars().all(|c| c.is_ascii_digit()) {
                Ok(Self::Serial {
                    port: format!("COM{number}"),
                })
            } else {
                Ok(Self::Serial { port })
            }
        } else {
            Err(ConnectorError::UnsupportedResource {
                resource: resource.to_string(),
            })
        }
    }
}

impl FromStr for ResourceAddress {
    type Err = ConnectorError;

    fn from_str(resource: &str) -> Result<Self, Self::Err> {
        let resource = resource.trim();
        if resource.is_empty() {
            return Err(ConnectorError::InvalidResource {
                resource: resource.to_string(),
            });
        }

        if resource.contains("::") {
            return Self::parse_visa(resource);
        }

        if let Some((host, port)) = resource.rsplit_once(':') {
            if !host.is_empty() && !host.contains(['/', '\\']) {
                if let Ok(port) = port.parse() {
                    return Ok(Self::Tcp {
                        host: host.to_string(),
                        port,
                    });
                }
            }
        }

        Ok(Self::serial(resource))
    }
}

impl std::fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serial { port } => write!(f, "{port}"),
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

pub struct BenchConnector;

impl BenchConnector {
    /// Open a link to the instrument at `address`. `baud_rate` only matters for serial links.
    pub fn open(address: &ResourceAddress, baud_rate: u32) -> Result<DynLink, ConnectorError> {
        log::debug!("Opening instrument link {}", address);
        let link: DynLink = match address {
            ResourceAddress::Serial { port } => Box::new(SerialLink::open(port, baud_rate)?),
            ResourceAddress::Tcp { host, port } => {
                Box::new(TcpLink::connect(host, *port, CONNECT_TIMEOUT)?)
            }
        };
        Ok(link)
    }

    /// Get all serial ports the OS reports
    pub fn available_ports() -> Result<Vec<PortInfo>, ConnectorError> {
        let ports = serialport::available_ports()?
            .into_iter()
            .map(|port| {
                let description = match port.port_type {
                    serialport::SerialPortType::UsbPort(info) => format!(
                        "USB {:04x}:{:04x} {}",
                        info.vid,
                        info.pid,
                        info.product.or(info.manufacturer).unwrap_or_default()
                    ),
                    serialport::SerialPortType::PciPort => "PCI".to_string(),
                    serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                    serialport::SerialPortType::Unknown => "unknown".to_string(),
                };
                PortInfo::new(port.port_name, description)
            })
            .collect();

        Ok(ports)
    }
}
