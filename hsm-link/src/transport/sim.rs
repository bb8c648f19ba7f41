//! Simulated HSM transport.
//!
//! A virtual device that behaves like the firmware at the byte level. Tests
//! use it to script responses and observe what was written; `hsmctl --sim`
//! uses it for dry runs. Each [`SimTransport`] is cheap to clone and all
//! clones share the same recorded state.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

use super::{Link, LineSettings, PortDescriptor, Transport, TransportHandle, UsbDeviceInfo};
use crate::config::UsbId;
use crate::error::{Result, TransportError};
use crate::protocol::{CommandId, GENERATE_PAYLOAD_LEN, GENERATE_TAG, LOCK_OK, RESPONSE_LEN};

/// USB id reported by simulated devices.
pub const SIM_USB_ID: UsbId = UsbId {
    vid: 0x1209,
    pid: 0x0001,
};

/// What happens when the simulated port is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenBehavior {
    /// Opens immediately
    Ready,
    /// Opening fails as if the device were unplugged
    Fail,
    /// Opening never completes
    Stall,
    /// Opens after the given delay
    Delay(Duration),
}

/// Computes the device's reply to a written frame. `None` means silence.
pub type Responder = dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync;

struct SimState {
    descriptor: PortDescriptor,
    open_behavior: Mutex<OpenBehavior>,
    responder: Box<Responder>,
    frames: Mutex<Vec<Vec<u8>>>,
    open_links: AtomicUsize,
    peak_open_links: AtomicUsize,
    total_opens: AtomicUsize,
}

/// Virtual serial endpoint.
#[derive(Clone)]
pub struct SimTransport {
    state: Arc<SimState>,
}

impl SimTransport {
    /// A device answering with `responder`, enumerated as [`SIM_USB_ID`].
    pub fn new<F>(name: impl Into<String>, responder: F) -> Self
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        let usb = UsbDeviceInfo {
            vid: SIM_USB_ID.vid,
            pid: SIM_USB_ID.pid,
            serial_number: None,
            manufacturer: Some("hsm-link".into()),
            product: Some("Simulated HSM".into()),
        };
        Self::with_descriptor(PortDescriptor::new(name).with_usb(usb), responder)
    }

    /// A device with an explicit descriptor, e.g. a non-USB port.
    pub fn with_descriptor<F>(descriptor: PortDescriptor, responder: F) -> Self
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(SimState {
                descriptor,
                open_behavior: Mutex::new(OpenBehavior::Ready),
                responder: Box::new(responder),
                frames: Mutex::new(Vec::new()),
                open_links: AtomicUsize::new(0),
                peak_open_links: AtomicUsize::new(0),
                total_opens: AtomicUsize::new(0),
            }),
        }
    }

    /// A device that answers like the real firmware.
    pub fn hsm(name: impl Into<String>) -> Self {
        Self::new(name, firmware_reply)
    }

    /// A device that never answers.
    pub fn silent(name: impl Into<String>) -> Self {
        Self::new(name, |_| None)
    }

    pub fn with_open(self, behavior: OpenBehavior) -> Self {
        self.set_open(behavior);
        self
    }

    /// Change how later opens behave, e.g. to simulate unplugging.
    pub fn set_open(&self, behavior: OpenBehavior) {
        *self.state.open_behavior.lock() = behavior;
    }

    /// New handle to this device, with its own exclusivity guard.
    pub fn handle(&self) -> TransportHandle {
        TransportHandle::new(self.clone())
    }

    /// Every frame written so far, one entry per write.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.state.frames.lock().clone()
    }

    /// Links currently open.
    pub fn open_links(&self) -> usize {
        self.state.open_links.load(Ordering::SeqCst)
    }

    /// Most links ever open at the same time.
    pub fn peak_open_links(&self) -> usize {
        self.state.peak_open_links.load(Ordering::SeqCst)
    }

    /// Successful opens since creation.
    pub fn total_opens(&self) -> usize {
        self.state.total_opens.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for SimTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimTransport")
            .field("port", &self.state.descriptor.name)
            .field("open_links", &self.open_links())
            .finish()
    }
}

#[async_trait]
impl Transport for SimTransport {
    fn descriptor(&self) -> &PortDescriptor {
        &self.state.descriptor
    }

    async fn open(&self, _settings: &LineSettings) -> Result<Box<dyn Link>> {
        let behavior = *self.state.open_behavior.lock();
        match behavior {
            OpenBehavior::Ready => {}
            OpenBehavior::Fail => {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{}: no such device", self.state.descriptor.name),
                ))
                .into());
            }
            OpenBehavior::Stall => std::future::pending::<()>().await,
            OpenBehavior::Delay(delay) => time::sleep(delay).await,
        }

        let open = self.state.open_links.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak_open_links.fetch_max(open, Ordering::SeqCst);
        self.state.total_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimLink {
            state: self.state.clone(),
            pending: VecDeque::new(),
        }))
    }
}

struct SimLink {
    state: Arc<SimState>,
    pending: VecDeque<u8>,
}

#[async_trait]
impl Link for SimLink {
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.state.frames.lock().push(frame.to_vec());
        if let Some(reply) = (self.state.responder)(frame) {
            self.pending.extend(reply);
        }
        Ok(())
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.pending.len())
    }

    async fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            // A silent device: the caller's timeout has to end this.
            std::future::pending::<()>().await;
        }
        let n = buf.len().min(self.pending.len());
        for (dst, src) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Drop for SimLink {
    fn drop(&mut self) {
        self.state.open_links.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Reply the way the firmware does.
///
/// LOCK answers status 0. GENERATE with a well-formed payload answers 32
/// bytes that depend only on the key identifier. Anything else gets a
/// 0xff-filled error response.
pub fn firmware_reply(frame: &[u8]) -> Option<Vec<u8>> {
    let (&command, payload) = frame.split_first()?;
    let mut reply = vec![0u8; RESPONSE_LEN];
    match CommandId::from_repr(command) {
        Some(CommandId::Lock) if payload.is_empty() => reply[0] = LOCK_OK,
        Some(CommandId::Generate)
            if payload.len() == GENERATE_PAYLOAD_LEN && payload[0] == GENERATE_TAG =>
        {
            let key_id = &payload[1..];
            for (i, byte) in reply.iter_mut().enumerate() {
                let k = key_id[i % key_id.len()];
                *byte = k.rotate_left(i as u32 % 8) ^ (i as u8).wrapping_mul(0x9d);
            }
        }
        _ => reply.fill(0xff),
    }
    Some(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_counts_and_release() {
        let sim = SimTransport::hsm("sim0");
        let link = sim.handle().open(&LineSettings::hsm()).await.unwrap();
        assert_eq!(sim.open_links(), 1);
        drop(link);
        assert_eq!(sim.open_links(), 0);
        assert_eq!(sim.total_opens(), 1);
    }

    #[tokio::test]
    async fn test_open_failure() {
        let sim = SimTransport::hsm("sim0").with_open(OpenBehavior::Fail);
        assert!(sim.handle().open(&LineSettings::hsm()).await.is_err());
        assert_eq!(sim.open_links(), 0);
    }

    #[tokio::test]
    async fn test_records_frames_and_replies() {
        let sim = SimTransport::new("sim0", |frame| Some(frame.to_vec()));
        let mut link = sim.handle().open(&LineSettings::hsm()).await.unwrap();
        link.write_frame(&[0x09, 0x08]).await.unwrap();
        assert_eq!(sim.frames(), vec![vec![0x09, 0x08]]);
        assert_eq!(link.bytes_available().unwrap(), 2);

        let mut buf = [0u8; 1];
        assert_eq!(link.read_some(&mut buf).await.unwrap(), 1);
        assert_eq!(buf, [0x09]);
        assert_eq!(link.bytes_available().unwrap(), 1);
    }

    #[test]
    fn test_firmware_reply() {
        let lock = firmware_reply(&[0x01]).unwrap();
        assert_eq!(lock.len(), RESPONSE_LEN);
        assert_eq!(lock[0], LOCK_OK);

        let a = firmware_reply(&[0x02, GENERATE_TAG, 1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let b = firmware_reply(&[0x02, GENERATE_TAG, 1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let c = firmware_reply(&[0x02, GENERATE_TAG, 8, 7, 6, 5, 4, 3, 2, 1]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        // Bad tag and unknown commands get the error fill.
        assert_eq!(firmware_reply(&[0x02, 0x00, 1, 2, 3, 4, 5, 6, 7, 8]).unwrap(), vec![0xff; RESPONSE_LEN]);
        assert_eq!(firmware_reply(&[0x42]).unwrap(), vec![0xff; RESPONSE_LEN]);
        assert!(firmware_reply(&[]).is_none());
    }
}
