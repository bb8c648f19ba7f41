//! Physical transport layer for the HSM connection.
//!
//! This module handles enumeration of serial endpoints and raw byte access
//! to them without any protocol knowledge. A [`Transport`] describes one
//! endpoint and can be opened into a [`Link`]; dropping the link closes the
//! port, so every exit path releases it.
//!
//! Two implementations exist: [`serial`] for real ports and [`sim`], a
//! virtual device used for testing and dry runs.

pub mod serial;
pub mod sim;

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_serial::{DataBits, Parity, StopBits};

use crate::config::UsbId;
use crate::error::Result;
use crate::protocol;

pub use serial::{SerialPortSource, SerialTransport};
pub use sim::{OpenBehavior, SimTransport};

/// USB metadata of a serial port, when the port sits on USB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceInfo {
    pub vid: u16,
    pub pid: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl UsbDeviceInfo {
    pub fn id(&self) -> UsbId {
        UsbId {
            vid: self.vid,
            pid: self.pid,
        }
    }
}

/// Static description of an enumerated port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDescriptor {
    /// OS name of the port (e.g. /dev/ttyACM0, COM3)
    pub name: String,
    /// USB details if the port is USB-backed
    pub usb: Option<UsbDeviceInfo>,
}

impl PortDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            usb: None,
        }
    }

    pub fn with_usb(mut self, usb: UsbDeviceInfo) -> Self {
        self.usb = Some(usb);
        self
    }
}

impl fmt::Display for PortDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(usb) = &self.usb {
            write!(f, " [usb {}", usb.id())?;
            if let Some(product) = &usb.product {
                write!(f, " {}", product)?;
            }
            if let Some(serial) = &usb.serial_number {
                write!(f, " sn={}", serial)?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

/// Line configuration applied when a port is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSettings {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub read_timeout: Duration,
}

impl LineSettings {
    /// The fixed settings the HSM firmware expects.
    pub const fn hsm() -> Self {
        Self {
            baud_rate: protocol::BAUD_RATE,
            data_bits: protocol::DATA_BITS,
            stop_bits: protocol::STOP_BITS,
            parity: protocol::PARITY,
            read_timeout: protocol::READ_TIMEOUT,
        }
    }
}

impl Default for LineSettings {
    fn default() -> Self {
        Self::hsm()
    }
}

/// A serial endpoint that can be opened.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    fn descriptor(&self) -> &PortDescriptor;

    /// Open the endpoint. The port stays open until the link is dropped.
    async fn open(&self, settings: &LineSettings) -> Result<Box<dyn Link>>;
}

/// An open, exclusively owned connection to a transport.
#[async_trait]
pub trait Link: Send {
    /// Write the whole frame in one call.
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Number of received bytes waiting to be read.
    fn bytes_available(&mut self) -> io::Result<usize>;

    /// Read whatever is available into `buf`, waiting for at least one byte.
    /// Returns 0 once the other end has closed.
    async fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Shared handle to a transport, passed from discovery to the channel.
///
/// Clones refer to the same endpoint and share one exclusivity guard, so two
/// exchanges through the same handle never overlap.
#[derive(Clone)]
pub struct TransportHandle {
    transport: Arc<dyn Transport>,
    in_use: Arc<Mutex<()>>,
}

impl TransportHandle {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::from_arc(Arc::new(transport))
    }

    pub fn from_arc(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            in_use: Arc::new(Mutex::new(())),
        }
    }

    pub fn name(&self) -> &str {
        &self.transport.descriptor().name
    }

    pub fn descriptor(&self) -> &PortDescriptor {
        self.transport.descriptor()
    }

    /// Open the port without taking the exclusivity guard.
    ///
    /// Used by probes; exchanges go through [`TransportHandle::acquire`]
    /// first.
    pub async fn open(&self, settings: &LineSettings) -> Result<Box<dyn Link>> {
        self.transport.open(settings).await
    }

    /// Wait until no other exchange is using this handle.
    pub async fn acquire(&self) -> OwnedMutexGuard<()> {
        self.in_use.clone().lock_owned().await
    }
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("port", &self.transport.descriptor().name)
            .finish()
    }
}

/// Source of candidate transports for discovery.
#[async_trait]
pub trait PortSource: Send + Sync {
    async fn enumerate(&self) -> Result<Vec<TransportHandle>>;
}

/// A fixed list of transports, e.g. a pinned port or simulated devices.
pub struct StaticPorts(pub Vec<TransportHandle>);

#[async_trait]
impl PortSource for StaticPorts {
    async fn enumerate(&self) -> Result<Vec<TransportHandle>> {
        Ok(self.0.clone())
    }
}
