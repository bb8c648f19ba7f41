//! Port discovery.
//!
//! The HSM has no stable port name across hosts, so it is found
//! empirically: every enumerated port gets its own probe task and the first
//! probe to succeed wins. Racing keeps total latency near that of the
//! slowest *responding* port instead of the sum over all ports, which
//! matters when debug consoles or modems are slow to open.
//!
//! Losing probes are aborted once a winner is known, and the race waits for
//! them to wind down so none of them is left holding a port open.

use async_trait::async_trait;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::config::{HsmConfig, UsbId};
use crate::error::{Error, Result, TransportError};
use crate::tracing::prelude::*;
use crate::transport::{LineSettings, TransportHandle};

/// Device-specific check that a transport is the HSM.
///
/// Returning `Ok` claims the transport. A probe that opens the port must
/// drop the link before returning.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, transport: &TransportHandle) -> Result<()>;
}

/// Probe using descriptor metadata, optionally followed by a trial open.
#[derive(Debug, Clone)]
pub struct DeviceProbe {
    usb_ids: Vec<UsbId>,
    port_pattern: Option<Regex>,
    open_check: bool,
    settings: LineSettings,
}

impl DeviceProbe {
    pub fn new(usb_ids: Vec<UsbId>) -> Self {
        Self {
            usb_ids,
            port_pattern: None,
            open_check: true,
            settings: LineSettings::hsm(),
        }
    }

    pub fn from_config(config: &HsmConfig) -> Result<Self> {
        Ok(Self {
            usb_ids: config.usb_ids.clone(),
            port_pattern: config.port_regex()?,
            open_check: config.open_check,
            settings: LineSettings::hsm(),
        })
    }

    pub fn with_port_pattern(mut self, pattern: Regex) -> Self {
        self.port_pattern = Some(pattern);
        self
    }

    pub fn with_open_check(mut self, open_check: bool) -> Self {
        self.open_check = open_check;
        self
    }

    fn matches_descriptor(&self, transport: &TransportHandle) -> bool {
        let descriptor = transport.descriptor();

        if let Some(pattern) = &self.port_pattern {
            if !pattern.is_match(&descriptor.name) {
                return false;
            }
        }

        // The HSM enumerates as a USB CDC device, never as a native UART.
        let Some(usb) = &descriptor.usb else {
            return false;
        };

        self.usb_ids.is_empty() || self.usb_ids.contains(&usb.id())
    }
}

#[async_trait]
impl Probe for DeviceProbe {
    async fn probe(&self, transport: &TransportHandle) -> Result<()> {
        if !self.matches_descriptor(transport) {
            trace!(port = %transport.descriptor(), "Port does not look like an HSM.");
            return Err(Error::DeviceNotFound);
        }

        if self.open_check {
            let link = transport.open(&self.settings).await?;
            drop(link);
        }

        Ok(())
    }
}

/// The discovery race.
#[derive(Clone)]
pub struct Discovery {
    probe: Arc<dyn Probe>,
    probe_timeout: Duration,
}

impl Discovery {
    pub fn new(probe: Arc<dyn Probe>, probe_timeout: Duration) -> Self {
        Self {
            probe,
            probe_timeout,
        }
    }

    /// Race probes against `transports` and return the first that passes.
    ///
    /// Fails with [`Error::DeviceNotFound`] if the list is empty or every
    /// probe fails, and with [`Error::Interrupted`] if `cancel` fires first.
    /// In every case all probe tasks have finished when this returns.
    pub async fn discover(
        &self,
        transports: Vec<TransportHandle>,
        cancel: &CancellationToken,
    ) -> Result<TransportHandle> {
        if transports.is_empty() {
            warn!("No serial ports to probe.");
            return Err(Error::DeviceNotFound);
        }

        debug!(candidates = transports.len(), "Probing serial ports.");
        let mut probes = JoinSet::new();
        for transport in transports {
            let probe = self.probe.clone();
            let probe_timeout = self.probe_timeout;
            probes.spawn(async move {
                match time::timeout(probe_timeout, probe.probe(&transport)).await {
                    Ok(Ok(())) => Ok(transport),
                    Ok(Err(e)) => {
                        debug!(port = %transport.name(), error = %e, "Probe failed.");
                        Err(e)
                    }
                    Err(_) => {
                        debug!(
                            port = %transport.name(),
                            timeout_ms = probe_timeout.as_millis() as u64,
                            "Probe timed out."
                        );
                        Err(TransportError::Timeout(probe_timeout).into())
                    }
                }
            });
        }

        let winner = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    probes.shutdown().await;
                    warn!("Discovery interrupted.");
                    return Err(Error::Interrupted);
                }
                joined = probes.join_next() => match joined {
                    Some(Ok(Ok(transport))) => break transport,
                    Some(Ok(Err(_))) => continue,
                    Some(Err(join_error)) => {
                        error!(error = %join_error, "Probe task panicked.");
                        continue;
                    }
                    None => {
                        warn!("No serial port answered as an HSM.");
                        return Err(Error::DeviceNotFound);
                    }
                },
            }
        };

        // Abort the losers and wait, so their ports are closed on return.
        probes.shutdown().await;
        info!(port = %winner.descriptor(), "HSM found.");
        Ok(winner)
    }
}
