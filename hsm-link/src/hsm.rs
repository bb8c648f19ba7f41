//! The HSM facade: discovery plus one exchange, as a unit.
//!
//! [`Hsm`] is what the rest of an application talks to. Every operation
//! holds an internal lock across "find the device, run one exchange", so two
//! callers sharing an `Hsm` can never drive the device at the same time.
//! By default the device is re-discovered for every operation; set
//! `cache_transport` to keep the last port until it fails.

use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::channel::CommandChannel;
use crate::config::HsmConfig;
use crate::discovery::{DeviceProbe, Discovery, Probe};
use crate::error::{Error, Result};
use crate::protocol::{KeyId, KeyMaterial, LockStatus, Request, Response};
use crate::tracing::prelude::*;
use crate::transport::{PortSource, SerialPortSource, SerialTransport, TransportHandle};

pub struct Hsm {
    source: Arc<dyn PortSource>,
    pinned: Option<TransportHandle>,
    discovery: Discovery,
    channel: CommandChannel,
    cache_transport: bool,
    /// Serialises operations; holds the cached port when caching is on.
    current: Mutex<Option<TransportHandle>>,
    cancel: CancellationToken,
}

impl Hsm {
    /// HSM on the host's serial ports, probed according to `config`.
    pub fn new(config: &HsmConfig) -> Result<Self> {
        let probe = Arc::new(DeviceProbe::from_config(config)?);
        let mut hsm = Self::with_source(config, Arc::new(SerialPortSource), probe)?;
        hsm.pinned = config
            .port
            .as_ref()
            .map(|name| SerialTransport::new(name.clone()).handle());
        Ok(hsm)
    }

    /// HSM found among the transports `source` yields.
    pub fn with_source(
        config: &HsmConfig,
        source: Arc<dyn PortSource>,
        probe: Arc<dyn Probe>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            source,
            pinned: None,
            discovery: Discovery::new(probe, config.probe_timeout()),
            channel: CommandChannel::new(config.exchange_timeout()),
            cache_transport: config.cache_transport,
            current: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Use `cancel` to interrupt operations instead of a private token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that interrupts every running and future operation.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Token for a single call, for the `*_with` methods.
    ///
    /// Cancelling it aborts only that call; cancelling the `Hsm`'s own token
    /// still reaches it.
    pub fn call_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Find the device. A pinned port is returned without probing.
    ///
    /// Waits for any operation in progress, so probing never opens a port
    /// an exchange is using.
    pub async fn discover(&self) -> Result<TransportHandle> {
        let _current = self.lock_current(&self.cancel).await?;
        self.discover_unlocked(&self.cancel).await
    }

    async fn discover_unlocked(&self, cancel: &CancellationToken) -> Result<TransportHandle> {
        if let Some(pinned) = &self.pinned {
            return Ok(pinned.clone());
        }

        let transports = match self.source.enumerate().await {
            Ok(transports) => transports,
            Err(e) => {
                warn!(error = %e, "Could not enumerate serial ports.");
                return Err(Error::DeviceNotFound);
            }
        };
        self.discovery.discover(transports, cancel).await
    }

    async fn lock_current(
        &self,
        cancel: &CancellationToken,
    ) -> Result<MutexGuard<'_, Option<TransportHandle>>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Interrupted),
            guard = self.current.lock() => Ok(guard),
        }
    }

    /// Run one exchange with the device, discovering it first if needed.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        self.execute_with(request, &self.cancel).await
    }

    /// [`Hsm::execute`], interrupted by `cancel` (see [`Hsm::call_token`]).
    pub async fn execute_with(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let mut current = self.lock_current(cancel).await?;

        let transport = match current.take() {
            Some(transport) => transport,
            None => self.discover_unlocked(cancel).await?,
        };

        let result = self.channel.execute(&transport, request, cancel).await;

        // A port that failed at the transport level may have gone away.
        if self.cache_transport && !matches!(result, Err(Error::Transport(_))) {
            *current = Some(transport);
        }
        result
    }

    /// Create a new key: fresh identifier, material derived by the device.
    ///
    /// The identifier must be stored; [`Hsm::derive_key`] with the same
    /// identifier yields the same material.
    pub async fn new_key(&self) -> Result<(KeyId, KeyMaterial)> {
        self.new_key_with(&self.cancel).await
    }

    pub async fn new_key_with(&self, cancel: &CancellationToken) -> Result<(KeyId, KeyMaterial)> {
        let key_id = KeyId::random();
        let material = self.derive_key_with(&key_id, cancel).await?;
        info!(key_id = %key_id, "Generated new hardware key.");
        Ok((key_id, material))
    }

    /// Recover the material for a stored identifier.
    pub async fn derive_key(&self, key_id: &KeyId) -> Result<KeyMaterial> {
        self.derive_key_with(key_id, &self.cancel).await
    }

    pub async fn derive_key_with(
        &self,
        key_id: &KeyId,
        cancel: &CancellationToken,
    ) -> Result<KeyMaterial> {
        let response = self.execute_with(Request::generate(key_id), cancel).await?;
        Ok(response.into_key_material())
    }

    /// Lock the device.
    pub async fn lock(&self) -> Result<()> {
        self.lock_with(&self.cancel).await
    }

    pub async fn lock_with(&self, cancel: &CancellationToken) -> Result<()> {
        let response = self.execute_with(Request::lock(), cancel).await?;
        match response.lock_status() {
            LockStatus::Locked => {
                info!("Device locked.");
                Ok(())
            }
            LockStatus::Failed(code) => {
                warn!(status = code, "Device refused to lock.");
                Err(Error::LockRejected(code))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::protocol::RESPONSE_LEN;
    use crate::transport::sim::{firmware_reply, SIM_USB_ID};
    use crate::transport::{OpenBehavior, PortDescriptor, SimTransport, StaticPorts};
    use std::time::Duration;

    fn hsm_with(sims: &[SimTransport], config: HsmConfig) -> Hsm {
        let source = Arc::new(StaticPorts(sims.iter().map(|s| s.handle()).collect()));
        let probe = Arc::new(DeviceProbe::new(vec![SIM_USB_ID]));
        Hsm::with_source(&config, source, probe).unwrap()
    }

    #[tokio::test]
    async fn test_lock_success_twice() {
        let device = SimTransport::hsm("hsm");
        let uart = SimTransport::with_descriptor(PortDescriptor::new("ttyS0"), firmware_reply);
        let hsm = hsm_with(&[uart.clone(), device.clone()], HsmConfig::default());

        hsm.lock().await.unwrap();
        assert_eq!(device.open_links(), 0);
        hsm.lock().await.unwrap();
        assert_eq!(device.open_links(), 0);

        assert_eq!(device.frames(), vec![vec![0x01], vec![0x01]]);
        assert!(uart.frames().is_empty());
    }

    #[tokio::test]
    async fn test_lock_rejected() {
        let device = SimTransport::new("hsm", |_| {
            let mut reply = vec![0u8; RESPONSE_LEN];
            reply[0] = 0x01;
            Some(reply)
        });
        let hsm = hsm_with(&[device], HsmConfig::default());
        assert!(matches!(hsm.lock().await, Err(Error::LockRejected(0x01))));
    }

    #[tokio::test]
    async fn test_new_key_then_derive_matches() {
        let device = SimTransport::hsm("hsm");
        let hsm = hsm_with(&[device.clone()], HsmConfig::default());

        let (key_id, material) = hsm.new_key().await.unwrap();
        let again = hsm.derive_key(&key_id).await.unwrap();
        assert_eq!(material, again);

        let frames = device.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], frames[1]);
        assert_eq!(&frames[0][2..], key_id.as_bytes());
    }

    #[tokio::test]
    async fn test_no_device() {
        let hsm = hsm_with(&[], HsmConfig::default());
        assert!(matches!(hsm.lock().await, Err(Error::DeviceNotFound)));
    }

    #[tokio::test]
    async fn test_rediscovers_by_default() {
        let device = SimTransport::hsm("hsm");
        let hsm = hsm_with(&[device.clone()], HsmConfig::default());
        hsm.lock().await.unwrap();
        hsm.lock().await.unwrap();
        // One probe open plus one exchange open per operation.
        assert_eq!(device.total_opens(), 4);
    }

    #[tokio::test]
    async fn test_cached_transport_skips_discovery() {
        let device = SimTransport::hsm("hsm");
        let config = HsmConfig {
            cache_transport: true,
            ..Default::default()
        };
        let hsm = hsm_with(&[device.clone()], config);
        hsm.lock().await.unwrap();
        hsm.lock().await.unwrap();
        assert_eq!(device.total_opens(), 3);
    }

    #[tokio::test]
    async fn test_cache_dropped_after_transport_error() {
        let device = SimTransport::hsm("hsm");
        let config = HsmConfig {
            cache_transport: true,
            ..Default::default()
        };
        let hsm = hsm_with(&[device.clone()], config);
        hsm.lock().await.unwrap();

        device.set_open(OpenBehavior::Fail);
        assert!(matches!(hsm.lock().await, Err(Error::Transport(_))));
        // Nothing cached and nothing discoverable now.
        assert!(matches!(hsm.lock().await, Err(Error::DeviceNotFound)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_are_serialised() {
        let device = SimTransport::hsm("hsm").with_open(OpenBehavior::Delay(Duration::from_millis(20)));
        let hsm = hsm_with(&[device.clone()], HsmConfig::default());

        let (a, b, c) = tokio::join!(hsm.lock(), hsm.lock(), hsm.new_key());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(device.peak_open_links(), 1);
        assert_eq!(device.frames().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_token_interrupts() {
        let device = SimTransport::silent("hsm");
        let hsm = hsm_with(&[device.clone()], HsmConfig::default());
        let cancel = hsm.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        assert!(matches!(hsm.lock().await, Err(Error::Interrupted)));
        assert_eq!(device.open_links(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_waits_for_exchange_in_progress() {
        let device = SimTransport::silent("hsm");
        let hsm = Arc::new(hsm_with(&[device.clone()], HsmConfig::default()));

        let locking = {
            let hsm = hsm.clone();
            tokio::spawn(async move { hsm.lock().await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(device.open_links(), 1);

        // Only runs once the silent exchange has timed out and closed.
        let found = hsm.discover().await.unwrap();
        assert_eq!(found.name(), "hsm");
        assert!(matches!(
            locking.await.unwrap(),
            Err(Error::Transport(TransportError::Timeout(_)))
        ));
        assert_eq!(device.peak_open_links(), 1);
        assert_eq!(device.open_links(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_token_interrupts_one_call_only() {
        let silent = SimTransport::silent("hsm");
        let hsm = hsm_with(&[silent.clone()], HsmConfig::default());

        let call = hsm.call_token();
        let canceller = call.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        assert!(matches!(hsm.lock_with(&call).await, Err(Error::Interrupted)));
        assert_eq!(silent.open_links(), 0);

        // The Hsm itself is still usable.
        assert!(!hsm.cancellation_token().is_cancelled());
        assert!(matches!(
            hsm.lock().await,
            Err(Error::Transport(TransportError::Timeout(_)))
        ));
    }

    #[tokio::test]
    async fn test_hsm_token_reaches_call_tokens() {
        let device = SimTransport::hsm("hsm");
        let hsm = hsm_with(&[device], HsmConfig::default());
        let call = hsm.call_token();
        hsm.cancellation_token().cancel();
        assert!(call.is_cancelled());
        assert!(matches!(hsm.lock_with(&call).await, Err(Error::Interrupted)));
    }
}
