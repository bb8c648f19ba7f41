//! Background worker for HSM operations.
//!
//! Callers such as a UI must not block on the device. The worker owns the
//! [`Hsm`] and runs commands from a queue one at a time; callers hold a
//! cloneable [`HsmWorkerHandle`] and await the reply sent back on a oneshot
//! channel carried in each command.

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::hsm::Hsm;
use crate::protocol::{KeyId, KeyMaterial, Request, Response};
use crate::tracing::prelude::*;

/// Commands that can be sent to the worker for execution.
///
/// Each carries the token that interrupts it; see [`HsmWorkerHandle::call_token`].
#[derive(Debug)]
pub enum HsmCommand {
    /// Create a new key identifier and its material.
    NewKey {
        cancel: CancellationToken,
        response_tx: oneshot::Sender<Result<(KeyId, KeyMaterial)>>,
    },
    /// Recover material for a stored key identifier.
    DeriveKey {
        key_id: KeyId,
        cancel: CancellationToken,
        response_tx: oneshot::Sender<Result<KeyMaterial>>,
    },
    /// Lock the device.
    Lock {
        cancel: CancellationToken,
        response_tx: oneshot::Sender<Result<()>>,
    },
    /// Raw exchange.
    Execute {
        request: Request,
        cancel: CancellationToken,
        response_tx: oneshot::Sender<Result<Response>>,
    },
}

/// Runs queued commands against one [`Hsm`].
pub struct HsmWorker {
    hsm: Hsm,
    cmd_rx: mpsc::Receiver<HsmCommand>,
}

impl HsmWorker {
    /// Create a worker and the handle used to reach it.
    pub fn new(hsm: Hsm, queue_depth: usize) -> (Self, HsmWorkerHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(queue_depth);
        let handle = HsmWorkerHandle {
            cmd_tx,
            parent: hsm.cancellation_token(),
            cancel: None,
        };
        (Self { hsm, cmd_rx }, handle)
    }

    /// Run until `running` is cancelled or every handle is dropped.
    ///
    /// Cancelling `running` does not interrupt the command in progress; use
    /// the [`Hsm`]'s own token for that (or give both the same token).
    pub async fn run(mut self, running: CancellationToken) {
        trace!("Worker started.");

        loop {
            tokio::select! {
                biased;
                _ = running.cancelled() => break,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
            }
        }

        trace!("Worker stopped.");
    }

    async fn handle_command(&mut self, cmd: HsmCommand) {
        // Send responses back, ignoring callers that gave up waiting.
        match cmd {
            HsmCommand::NewKey {
                cancel,
                response_tx,
            } => {
                let _ = response_tx.send(self.hsm.new_key_with(&cancel).await);
            }
            HsmCommand::DeriveKey {
                key_id,
                cancel,
                response_tx,
            } => {
                let _ = response_tx.send(self.hsm.derive_key_with(&key_id, &cancel).await);
            }
            HsmCommand::Lock {
                cancel,
                response_tx,
            } => {
                let _ = response_tx.send(self.hsm.lock_with(&cancel).await);
            }
            HsmCommand::Execute {
                request,
                cancel,
                response_tx,
            } => {
                let _ = response_tx.send(self.hsm.execute_with(request, &cancel).await);
            }
        }
    }
}

/// Caller side of the worker queue.
///
/// Commands sent through a plain handle get a fresh call token each, so they
/// stop only when the [`Hsm`]'s token is cancelled. To abort one command,
/// bind a token from [`HsmWorkerHandle::call_token`] with
/// [`HsmWorkerHandle::with_cancellation`] and cancel it.
#[derive(Debug, Clone)]
pub struct HsmWorkerHandle {
    cmd_tx: mpsc::Sender<HsmCommand>,
    parent: CancellationToken,
    cancel: Option<CancellationToken>,
}

impl HsmWorkerHandle {
    /// A token that interrupts commands sent through a handle bound to it.
    pub fn call_token(&self) -> CancellationToken {
        self.parent.child_token()
    }

    /// A handle whose commands are interrupted by `cancel`.
    pub fn with_cancellation(&self, cancel: CancellationToken) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            parent: self.parent.clone(),
            cancel: Some(cancel),
        }
    }

    pub async fn new_key(&self) -> Result<(KeyId, KeyMaterial)> {
        self.call(|cancel, response_tx| HsmCommand::NewKey {
            cancel,
            response_tx,
        })
        .await
    }

    pub async fn derive_key(&self, key_id: KeyId) -> Result<KeyMaterial> {
        self.call(|cancel, response_tx| HsmCommand::DeriveKey {
            key_id,
            cancel,
            response_tx,
        })
        .await
    }

    pub async fn lock(&self) -> Result<()> {
        self.call(|cancel, response_tx| HsmCommand::Lock {
            cancel,
            response_tx,
        })
        .await
    }

    pub async fn execute(&self, request: Request) -> Result<Response> {
        self.call(|cancel, response_tx| HsmCommand::Execute {
            request,
            cancel,
            response_tx,
        })
        .await
    }

    // A stopped worker reads as an interruption: the caller was waiting and
    // shutdown intervened.
    async fn call<T>(
        &self,
        make: impl FnOnce(CancellationToken, oneshot::Sender<Result<T>>) -> HsmCommand,
    ) -> Result<T> {
        let cancel = self
            .cancel
            .clone()
            .unwrap_or_else(|| self.parent.child_token());
        let (response_tx, response_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(cancel, response_tx))
            .await
            .map_err(|_| Error::Interrupted)?;
        response_rx.await.map_err(|_| Error::Interrupted)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HsmConfig;
    use crate::discovery::DeviceProbe;
    use crate::error::TransportError;
    use crate::transport::sim::SIM_USB_ID;
    use crate::transport::{SimTransport, StaticPorts};
    use std::sync::Arc;
    use std::time::Duration;

    fn spawn_worker(device: &SimTransport) -> (HsmWorkerHandle, CancellationToken) {
        let source = Arc::new(StaticPorts(vec![device.handle()]));
        let probe = Arc::new(DeviceProbe::new(vec![SIM_USB_ID]));
        let running = CancellationToken::new();
        let hsm = Hsm::with_source(&HsmConfig::default(), source, probe)
            .unwrap()
            .with_cancellation(running.clone());
        let (worker, handle) = HsmWorker::new(hsm, 8);
        tokio::spawn(worker.run(running.clone()));
        (handle, running)
    }

    #[tokio::test]
    async fn test_commands_through_worker() {
        let device = SimTransport::hsm("hsm");
        let (handle, running) = spawn_worker(&device);

        handle.lock().await.unwrap();
        let (key_id, material) = handle.new_key().await.unwrap();
        assert_eq!(handle.derive_key(key_id).await.unwrap(), material);

        let raw = handle.execute(Request::lock()).await.unwrap();
        assert_eq!(raw.as_bytes()[0], 0);

        assert_eq!(device.frames().len(), 4);
        assert_eq!(device.open_links(), 0);
        running.cancel();
    }

    #[tokio::test]
    async fn test_concurrent_handles_serialised() {
        let device = SimTransport::hsm("hsm");
        let (handle, running) = spawn_worker(&device);

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let handle = handle.clone();
                tokio::spawn(async move { handle.lock().await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(device.peak_open_links(), 1);
        running.cancel();
    }

    #[tokio::test]
    async fn test_stopped_worker_reports_interrupted() {
        let device = SimTransport::hsm("hsm");
        let (handle, running) = spawn_worker(&device);
        running.cancel();
        // Let the worker observe cancellation and drop its receiver.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(matches!(handle.lock().await, Err(Error::Interrupted)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_token_aborts_one_command() {
        let device = SimTransport::silent("hsm");
        let (handle, running) = spawn_worker(&device);

        let call = handle.call_token();
        let bound = handle.with_cancellation(call.clone());
        let pending = tokio::spawn(async move { bound.lock().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        call.cancel();

        assert!(matches!(pending.await.unwrap(), Err(Error::Interrupted)));
        assert_eq!(device.open_links(), 0);

        // The worker and the Hsm carry on with later commands.
        assert!(matches!(
            handle.lock().await,
            Err(Error::Transport(TransportError::Timeout(_)))
        ));
        running.cancel();
    }
}
