//! Serial link layer for a key-management hardware security module.
//!
//! The HSM is a USB serial token that derives key material and can be
//! locked. This crate finds it among the host's serial ports ([`discovery`])
//! and runs its fixed-format request/response protocol ([`channel`],
//! [`protocol`]). [`Hsm`] ties the two together and [`worker`] moves the
//! blocking parts off the caller's task.

pub mod channel;
pub mod config;
pub mod discovery;
pub mod error;
pub mod hsm;
pub mod protocol;
pub mod tracing;
pub mod transport;
pub mod worker;

pub use config::HsmConfig;
pub use error::{Error, Result, TransportError};
pub use hsm::Hsm;
pub use protocol::{CommandId, KeyId, KeyMaterial, LockStatus, Request, Response};
pub use transport::TransportHandle;
pub use worker::{HsmWorker, HsmWorkerHandle};
