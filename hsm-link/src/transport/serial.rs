//! Serial port transport backed by tokio-serial.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{FlowControl, SerialPortBuilderExt, SerialPortType, SerialStream};

use super::{Link, LineSettings, PortDescriptor, PortSource, Transport, TransportHandle, UsbDeviceInfo};
use crate::error::Result;
use crate::tracing::prelude::*;

/// A serial port known by name.
#[derive(Debug, Clone)]
pub struct SerialTransport {
    descriptor: PortDescriptor,
}

impl SerialTransport {
    /// Port with no USB metadata, e.g. one pinned in the configuration.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            descriptor: PortDescriptor::new(name),
        }
    }

    pub fn from_descriptor(descriptor: PortDescriptor) -> Self {
        Self { descriptor }
    }

    pub fn handle(self) -> TransportHandle {
        TransportHandle::new(self)
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn descriptor(&self) -> &PortDescriptor {
        &self.descriptor
    }

    async fn open(&self, settings: &LineSettings) -> Result<Box<dyn Link>> {
        trace!(port = %self.descriptor.name, baud = settings.baud_rate, "Opening serial port.");
        let stream = tokio_serial::new(&self.descriptor.name, settings.baud_rate)
            .data_bits(settings.data_bits)
            .stop_bits(settings.stop_bits)
            .parity(settings.parity)
            .flow_control(FlowControl::None)
            .timeout(settings.read_timeout)
            .open_native_async()?;
        Ok(Box::new(SerialLink::new(stream)))
    }
}

/// Open serial port. The port closes when this is dropped.
pub struct SerialLink {
    stream: SerialStream,
}

impl SerialLink {
    pub fn new(stream: SerialStream) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl Link for SerialLink {
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.stream.write_all(frame).await?;
        self.stream.flush().await
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        let n = tokio_serial::SerialPort::bytes_to_read(&self.stream)?;
        Ok(n as usize)
    }

    async fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf).await
    }
}

/// Enumerates the host's serial ports.
#[derive(Debug, Default)]
pub struct SerialPortSource;

impl SerialPortSource {
    /// Describe every serial port the OS reports.
    pub fn descriptors() -> Result<Vec<PortDescriptor>> {
        let ports = tokio_serial::available_ports()?;
        Ok(ports
            .into_iter()
            .map(|info| {
                let descriptor = PortDescriptor::new(info.port_name);
                match info.port_type {
                    SerialPortType::UsbPort(usb) => descriptor.with_usb(UsbDeviceInfo {
                        vid: usb.vid,
                        pid: usb.pid,
                        serial_number: usb.serial_number,
                        manufacturer: usb.manufacturer,
                        product: usb.product,
                    }),
                    _ => descriptor,
                }
            })
            .collect())
    }
}

#[async_trait]
impl PortSource for SerialPortSource {
    async fn enumerate(&self) -> Result<Vec<TransportHandle>> {
        let descriptors = tokio::task::spawn_blocking(Self::descriptors)
            .await
            .map_err(|e| io::Error::other(format!("port enumeration task failed: {}", e)))??;
        debug!(count = descriptors.len(), "Enumerated serial ports.");
        Ok(descriptors
            .into_iter()
            .map(|d| SerialTransport::from_descriptor(d).handle())
            .collect())
    }
}
