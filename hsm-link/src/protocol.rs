//! Wire protocol for the HSM command channel.
//!
//! Every exchange is one request frame followed by one fixed-size response:
//!
//! ```text
//! request:  [command_id: u8][payload: 0..N bytes]    (single write)
//! response: [32 bytes]                               (no length, no checksum)
//! ```
//!
//! The device defines two commands. `LOCK` carries no payload and answers
//! with a status in byte 0. `GENERATE` carries a tag byte followed by an
//! 8-byte key identifier and answers with 32 bytes of key material derived
//! from that identifier, so re-sending a stored identifier recovers the same
//! material.
//!
//! All line settings and sizes live here; nothing else in the crate should
//! spell out these numbers.

use bytes::{BufMut, BytesMut};
use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;
use strum::{Display, FromRepr};
use tokio_serial::{DataBits, Parity, StopBits};
use tokio_util::codec::{Decoder, Encoder};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Serial line speed.
pub const BAUD_RATE: u32 = 115_200;

/// Serial data bits.
pub const DATA_BITS: DataBits = DataBits::Eight;

/// Serial stop bits.
pub const STOP_BITS: StopBits = StopBits::One;

/// Serial parity.
pub const PARITY: Parity = Parity::None;

/// Per-read timeout once the device has started answering.
pub const READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// Interval between checks for available response bytes.
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Size of every response from the device.
pub const RESPONSE_LEN: usize = 32;

/// Length of the key identifier carried in a GENERATE payload.
pub const KEY_ID_LEN: usize = 8;

/// First payload byte of a GENERATE request, ahead of the key identifier.
pub const GENERATE_TAG: u8 = 0x02;

/// Length of a GENERATE payload (tag + key identifier).
pub const GENERATE_PAYLOAD_LEN: usize = 1 + KEY_ID_LEN;

/// Lock status byte meaning success.
pub const LOCK_OK: u8 = 0x00;

/// Command identifiers understood by the device.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[strum(serialize_all = "UPPERCASE")]
pub enum CommandId {
    Lock = 1,
    Generate = 2,
}

impl From<CommandId> for u8 {
    fn from(id: CommandId) -> u8 {
        id as u8
    }
}

/// One request frame: command byte plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    command: u8,
    payload: Vec<u8>,
}

impl Request {
    /// Build a request for an arbitrary command id.
    pub fn new(command: impl Into<u8>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command: command.into(),
            payload: payload.into(),
        }
    }

    /// `LOCK`, no payload.
    pub fn lock() -> Self {
        Self::new(CommandId::Lock, Vec::new())
    }

    /// `GENERATE` for the given key identifier.
    pub fn generate(key_id: &KeyId) -> Self {
        let mut payload = Vec::with_capacity(GENERATE_PAYLOAD_LEN);
        payload.push(GENERATE_TAG);
        payload.extend_from_slice(key_id.as_bytes());
        Self::new(CommandId::Generate, payload)
    }

    pub fn command(&self) -> u8 {
        self.command
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Length of the encoded frame.
    pub fn frame_len(&self) -> usize {
        1 + self.payload.len()
    }

    /// Name of the command for logs, falling back to the raw id.
    pub fn command_name(&self) -> String {
        match CommandId::from_repr(self.command) {
            Some(id) => id.to_string(),
            None => format!("0x{:02x}", self.command),
        }
    }
}

/// Encoder producing the request frame.
#[derive(Debug, Default)]
pub struct RequestCodec;

impl Encoder<Request> for RequestCodec {
    type Error = io::Error;

    fn encode(&mut self, request: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(request.frame_len());
        dst.put_u8(request.command);
        dst.put_slice(&request.payload);
        Ok(())
    }
}

/// Decoder yielding one response per `RESPONSE_LEN` bytes received.
#[derive(Debug, Default)]
pub struct ResponseCodec;

impl Decoder for ResponseCodec {
    type Item = Response;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < RESPONSE_LEN {
            src.reserve(RESPONSE_LEN - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(RESPONSE_LEN);
        let mut response = Response::new([0u8; RESPONSE_LEN]);
        response.bytes.copy_from_slice(&frame);
        frame[..].zeroize();
        Ok(Some(response))
    }
}

/// A complete response from the device. Zeroed when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Response {
    bytes: [u8; RESPONSE_LEN],
}

impl Response {
    pub fn new(bytes: [u8; RESPONSE_LEN]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; RESPONSE_LEN] {
        &self.bytes
    }

    /// Interpret as the answer to a LOCK request.
    pub fn lock_status(&self) -> LockStatus {
        match self.bytes[0] {
            LOCK_OK => LockStatus::Locked,
            code => LockStatus::Failed(code),
        }
    }

    /// Interpret as the answer to a GENERATE request.
    pub fn into_key_material(self) -> KeyMaterial {
        KeyMaterial(self.bytes)
    }
}

// Responses may carry key material, so only the first byte is shown.
impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Response {{ status: 0x{:02x}, .. }}", self.bytes[0])
    }
}

/// Outcome of a LOCK request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Locked,
    Failed(u8),
}

/// Identifier the device derives key material from.
///
/// Stored next to the vault so the same material can be requested again.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyId([u8; KEY_ID_LEN]);

impl KeyId {
    pub fn new(bytes: [u8; KEY_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Fresh identifier from the thread-local CSPRNG.
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; KEY_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self.to_hex())
    }
}

impl FromStr for KeyId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; KEY_ID_LEN];
        hex::decode_to_slice(s.trim(), &mut bytes)?;
        Ok(Self(bytes))
    }
}

/// Key material returned by GENERATE. Zeroed when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial([u8; RESPONSE_LEN]);

impl KeyMaterial {
    pub fn as_bytes(&self) -> &[u8; RESPONSE_LEN] {
        &self.0
    }

    /// Lowercase hex rendering, usable as a vault passphrase.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(<redacted>)")
    }
}
