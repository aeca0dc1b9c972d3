//! # Serial Device Layer
//!
//! The platform seam for everything the scale manager needs from the OS:
//! enumerating serial ports and opening one of them with a given baud rate and
//! modem-control line state.
//!
//! - [`SerialBackend`] is the trait the manager talks to. Production code uses
//!   [`SystemSerial`] (backed by the `serialport` crate, `serial` feature);
//!   tests hand in scripted backends.
//! - [`OpenError`] classifies open failures into the three kinds the operator
//!   can act on differently: missing device, port held by someone else, and
//!   everything else.
//! - [`identity`] holds the VID/PID resolver used by the hardware-ID fallback.

pub mod identity;

pub use identity::{
    resolve_by_name, resolve_port, DeviceIdentity, ParseIdentityError, PortCandidate,
};

use log::{info, warn};
use std::io;
use std::time::Duration;

/// What to do with DTR and RTS after opening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalLines {
    /// Leave the driver defaults alone.
    Untouched,
    /// Raise both DTR and RTS.
    Asserted,
    /// Lower both DTR and RTS.
    Deasserted,
}

impl SignalLines {
    pub fn label(&self) -> &'static str {
        match self {
            SignalLines::Untouched => "default",
            SignalLines::Asserted => "dtr/rts on",
            SignalLines::Deasserted => "dtr/rts off",
        }
    }
}

/// Everything needed for one low-level open attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenParams {
    pub path: String,
    pub baud_rate: u32,
    pub signals: SignalLines,
    /// Per-read timeout applied to the opened handle.
    pub timeout: Duration,
}

/// Why a single open attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpenError {
    /// The path does not exist (unplugged, renamed by the OS).
    #[error("{path}: device not found ({message})")]
    NotFound { path: String, message: String },

    /// The OS refused access, usually because another process holds the port.
    #[error("{path}: access denied or port busy ({message})")]
    BusyOrDenied { path: String, message: String },

    /// Any other driver or configuration error.
    #[error("{path}: {message}")]
    Transient { path: String, message: String },
}

impl OpenError {
    pub fn path(&self) -> &str {
        match self {
            OpenError::NotFound { path, .. }
            | OpenError::BusyOrDenied { path, .. }
            | OpenError::Transient { path, .. } => path,
        }
    }

    /// Classify a raw I/O error for `path`.
    pub fn from_io(path: &str, err: &io::Error) -> Self {
        let message = err.to_string();
        match err.kind() {
            io::ErrorKind::NotFound => OpenError::NotFound {
                path: path.to_string(),
                message,
            },
            io::ErrorKind::PermissionDenied => OpenError::BusyOrDenied {
                path: path.to_string(),
                message,
            },
            _ if mentions_busy(&message) => OpenError::BusyOrDenied {
                path: path.to_string(),
                message,
            },
            _ => OpenError::Transient {
                path: path.to_string(),
                message,
            },
        }
    }
}

/// Windows reports a held COM port as "Access is denied"; Unix as EBUSY.
fn mentions_busy(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("access is denied")
        || lower.contains("access denied")
        || lower.contains("resource busy")
        || lower.contains("device or resource busy")
}

/// A live, readable connection to the scale.
pub trait ScaleHandle: Send {
    /// Read whatever is available into `buf`.
    ///
    /// Returns `Ok(0)` when nothing arrived within the handle's timeout.
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// OS-facing operations the scale manager depends on.
pub trait SerialBackend: Send + Sync {
    /// Enumerate the serial ports present right now.
    fn enumerate(&self) -> io::Result<Vec<PortCandidate>>;

    /// Open a port with the given parameters.
    fn open(&self, params: &OpenParams) -> Result<Box<dyn ScaleHandle>, OpenError>;
}

/// Log every enumerated port with its hardware identity. Returns the list.
pub fn audit(backend: &dyn SerialBackend) -> Vec<PortCandidate> {
    info!("Hardware audit: enumerating serial ports");
    let ports = match backend.enumerate() {
        Ok(p) => p,
        Err(e) => {
            warn!("Hardware audit failed to enumerate ports: {}", e);
            return Vec::new();
        }
    };
    if ports.is_empty() {
        warn!("No serial ports detected on this system");
    }
    for p in &ports {
        let id = p
            .identity()
            .map(|i| i.to_string())
            .unwrap_or_else(|| "-".to_string());
        info!(
            "  {} id={} desc={}",
            p.path,
            id,
            p.description.as_deref().unwrap_or("-")
        );
    }
    ports
}

#[cfg(feature = "serial")]
pub use system::SystemSerial;

#[cfg(feature = "serial")]
mod system {
    use super::{OpenError, OpenParams, PortCandidate, ScaleHandle, SerialBackend, SignalLines};
    use log::debug;
    use serialport::SerialPort;
    use std::io::{self, Read};

    /// [`SerialBackend`] backed by the host's serial drivers.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct SystemSerial;

    impl SystemSerial {
        pub fn new() -> Self {
            Self
        }
    }

    struct SystemHandle {
        port: Box<dyn SerialPort>,
    }

    impl ScaleHandle for SystemHandle {
        fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.port.read(buf) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
                Err(e) => Err(e),
            }
        }
    }

    fn classify(path: &str, err: serialport::Error) -> OpenError {
        match err.kind() {
            serialport::ErrorKind::NoDevice => OpenError::NotFound {
                path: path.to_string(),
                message: err.description,
            },
            serialport::ErrorKind::Io(_) => OpenError::from_io(path, &io::Error::from(err)),
            _ => OpenError::Transient {
                path: path.to_string(),
                message: err.description,
            },
        }
    }

    impl SerialBackend for SystemSerial {
        fn enumerate(&self) -> io::Result<Vec<PortCandidate>> {
            let ports = serialport::available_ports().map_err(io::Error::from)?;
            Ok(ports
                .into_iter()
                .map(|p| match p.port_type {
                    serialport::SerialPortType::UsbPort(usb) => PortCandidate {
                        path: p.port_name,
                        vid: Some(usb.vid),
                        pid: Some(usb.pid),
                        description: usb.product.or(usb.manufacturer),
                    },
                    serialport::SerialPortType::BluetoothPort => PortCandidate {
                        description: Some("bluetooth".to_string()),
                        ..PortCandidate::plain(p.port_name)
                    },
                    serialport::SerialPortType::PciPort => PortCandidate {
                        description: Some("pci".to_string()),
                        ..PortCandidate::plain(p.port_name)
                    },
                    serialport::SerialPortType::Unknown => PortCandidate::plain(p.port_name),
                })
                .collect())
        }

        fn open(&self, params: &OpenParams) -> Result<Box<dyn ScaleHandle>, OpenError> {
            debug!(
                "Opening {} at {} baud ({})",
                params.path,
                params.baud_rate,
                params.signals.label()
            );
            let mut builder = serialport::new(params.path.as_str(), params.baud_rate)
                .timeout(params.timeout)
                .flow_control(serialport::FlowControl::None);
            // Some USB serial adapters need explicit settings
            #[cfg(unix)]
            {
                builder = builder
                    .data_bits(serialport::DataBits::Eight)
                    .stop_bits(serialport::StopBits::One)
                    .parity(serialport::Parity::None);
            }
            let mut port = builder.open().map_err(|e| classify(&params.path, e))?;
            let level = match params.signals {
                SignalLines::Untouched => None,
                SignalLines::Asserted => Some(true),
                SignalLines::Deasserted => Some(false),
            };
            if let Some(level) = level {
                port.write_data_terminal_ready(level)
                    .map_err(|e| classify(&params.path, e))?;
                port.write_request_to_send(level)
                    .map_err(|e| classify(&params.path, e))?;
            }
            Ok(Box::new(SystemHandle { port }))
        }
    }
}
