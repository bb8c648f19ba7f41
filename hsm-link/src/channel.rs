//! Command channel: one request/response exchange per call.
//!
//! An exchange opens the port, writes the request frame in a single write,
//! polls until the device starts answering, reads one full response and
//! closes the port. The port is a [`Link`] owned by the exchange future, so
//! it is closed on success, on error and when the exchange is cancelled.
//!
//! Two deadlines apply. The whole exchange is bounded by the configured
//! exchange timeout, so a silent device becomes a
//! [`TransportError::Timeout`] instead of a hang. Once the first byte is in,
//! the rest of the response must arrive within [`READ_TIMEOUT`] or the
//! exchange fails with [`TransportError::ShortRead`].

use bytes::BytesMut;
use std::time::Duration;
use tokio::time::{self, Instant};
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{Error, Result, TransportError};
use crate::protocol::{
    Request, RequestCodec, Response, ResponseCodec, POLL_INTERVAL, READ_TIMEOUT, RESPONSE_LEN,
};
use crate::tracing::prelude::*;
use crate::transport::{LineSettings, Link, TransportHandle};

/// Executes single exchanges against a known transport.
#[derive(Debug, Clone)]
pub struct CommandChannel {
    settings: LineSettings,
    exchange_timeout: Duration,
}

impl CommandChannel {
    pub fn new(exchange_timeout: Duration) -> Self {
        Self {
            settings: LineSettings::hsm(),
            exchange_timeout,
        }
    }

    /// Send `request` over `transport` and return the device's response.
    ///
    /// Waits for any other exchange on the same handle to finish first.
    pub async fn execute(
        &self,
        transport: &TransportHandle,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let port = transport.name().to_string();
        let command = request.command_name();

        let _in_use = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Interrupted),
            guard = transport.acquire() => guard,
        };

        debug!(port = %port, command = %command, "Executing command.");
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Interrupted),
            r = time::timeout(self.exchange_timeout, self.exchange(transport, request)) => {
                r.unwrap_or_else(|_| Err(TransportError::Timeout(self.exchange_timeout).into()))
            }
        };

        match &result {
            Ok(_) => debug!(port = %port, command = %command, "Command complete."),
            Err(e) => warn!(
                port = %port,
                command = %command,
                kind = e.kind(),
                error = %e,
                "Command failed."
            ),
        }
        result
    }

    async fn exchange(&self, transport: &TransportHandle, request: Request) -> Result<Response> {
        let mut link = transport.open(&self.settings).await?;

        let mut frame = BytesMut::new();
        RequestCodec.encode(request, &mut frame)?;
        trace!(frame = %hex::encode(&frame), "Writing frame.");
        link.write_frame(&frame).await?;

        while link.bytes_available()? == 0 {
            time::sleep(POLL_INTERVAL).await;
        }

        let response = read_response(link.as_mut()).await?;
        trace!(response = ?response, "Read response.");
        Ok(response)
    }
}

/// Read one full response, allowing [`READ_TIMEOUT`] for all of it.
///
/// Received bytes may be key material; both buffers are wiped on every exit,
/// including cancellation.
async fn read_response(link: &mut dyn Link) -> Result<Response> {
    let deadline = Instant::now() + READ_TIMEOUT;
    let mut codec = ResponseCodec;
    let mut buf = WipedBuf(BytesMut::with_capacity(RESPONSE_LEN));
    let mut chunk = Zeroizing::new([0u8; RESPONSE_LEN]);

    loop {
        if let Some(response) = codec.decode(&mut buf.0)? {
            return Ok(response);
        }

        let got = buf.0.len();
        let short = move || TransportError::ShortRead {
            expected: RESPONSE_LEN,
            actual: got,
        };
        match time::timeout_at(deadline, link.read_some(&mut chunk[..RESPONSE_LEN - got])).await {
            Ok(Ok(0)) if got == 0 => return Err(TransportError::Closed.into()),
            Ok(Ok(0)) => return Err(short().into()),
            Ok(Ok(n)) => buf.0.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(short().into()),
        }
    }
}

// The decoder wipes the frame it splits off; this covers a partial response.
struct WipedBuf(BytesMut);

impl Drop for WipedBuf {
    fn drop(&mut self) {
        self.0[..].zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{KeyId, LockStatus};
    use crate::transport::{OpenBehavior, SimTransport};

    fn channel() -> CommandChannel {
        CommandChannel::new(Duration::from_secs(3))
    }

    fn sequence() -> Vec<u8> {
        (0..RESPONSE_LEN as u8).collect()
    }

    #[tokio::test]
    async fn test_generate_frame_and_response() {
        let sim = SimTransport::new("sim0", |_| Some((0..RESPONSE_LEN as u8).collect()));
        let key_id = KeyId::new([1, 2, 3, 4, 5, 6, 7, 8]);
        let request = Request::generate(&key_id);
        let mut expected_frame = vec![0x02];
        expected_frame.extend_from_slice(request.payload());

        let response = channel()
            .execute(&sim.handle(), request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sim.frames(), vec![expected_frame]);
        assert_eq!(response.as_bytes().to_vec(), sequence());
        assert_eq!(sim.open_links(), 0);
        assert_eq!(sim.total_opens(), 1);
    }

    #[tokio::test]
    async fn test_lock_frame_and_status() {
        let ok = SimTransport::new("ok", |_| Some(vec![0u8; RESPONSE_LEN]));
        let response = channel()
            .execute(&ok.handle(), Request::lock(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ok.frames(), vec![vec![0x01]]);
        assert_eq!(response.lock_status(), LockStatus::Locked);

        let mut refused = vec![0u8; RESPONSE_LEN];
        refused[0] = 1;
        let bad = SimTransport::new("bad", move |_| Some(refused.clone()));
        let response = channel()
            .execute(&bad.handle(), Request::lock(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.lock_status(), LockStatus::Failed(1));
    }

    #[tokio::test]
    async fn test_lock_twice_releases_port() {
        let sim = SimTransport::hsm("sim0");
        let handle = sim.handle();
        for _ in 0..2 {
            let response = channel()
                .execute(&handle, Request::lock(), &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(response.lock_status(), LockStatus::Locked);
            assert_eq!(sim.open_links(), 0);
        }
        assert_eq!(sim.total_opens(), 2);
        assert_eq!(sim.peak_open_links(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out() {
        let sim = SimTransport::silent("sim0");
        let started = Instant::now();
        let result = channel()
            .execute(&sim.handle(), Request::lock(), &CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(Error::Transport(TransportError::Timeout(d))) if d == Duration::from_secs(3)
        ));
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(sim.open_links(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_read_is_an_error() {
        let sim = SimTransport::new("sim0", |_| Some(vec![0xaa; 7]));
        let result = channel()
            .execute(&sim.handle(), Request::lock(), &CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(Error::Transport(TransportError::ShortRead { expected: RESPONSE_LEN, actual: 7 }))
        ));
        assert_eq!(sim.open_links(), 0);
    }

    #[tokio::test]
    async fn test_open_failure_is_transport_error() {
        let sim = SimTransport::hsm("sim0").with_open(OpenBehavior::Fail);
        let result = channel()
            .execute(&sim.handle(), Request::lock(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::Transport(TransportError::Io(_)))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_while_polling() {
        let sim = SimTransport::silent("sim0");
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let result = channel().execute(&sim.handle(), Request::lock(), &cancel).await;
        assert!(matches!(result, Err(Error::Interrupted)));
        assert_eq!(sim.frames(), vec![vec![0x01]]);
        assert_eq!(sim.open_links(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_exchanges_do_not_interleave() {
        let sim = SimTransport::hsm("sim0").with_open(OpenBehavior::Delay(Duration::from_millis(30)));
        let handle = sim.handle();
        let cancel = CancellationToken::new();

        let ch = channel();
        let a = ch.execute(&handle, Request::lock(), &cancel);
        let b = ch.execute(&handle, Request::generate(&KeyId::new([9; 8])), &cancel);
        let (a, b) = tokio::join!(a, b);

        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(sim.frames().len(), 2);
        assert_eq!(sim.peak_open_links(), 1);
        assert_eq!(sim.open_links(), 0);
    }
}
