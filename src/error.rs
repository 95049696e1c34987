//! Error types for the link core.
//!
//! Runtime failures that a client can observe are reported as a
//! [`Status`] in a completion message. [`LinkError`] covers everything
//! that propagates through `Result` inside the crate: configuration,
//! persistence, channel and protocol errors. Broken configuration
//! invariants never propagate; they go through [`fatal`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::BdAddr;

/// Main error type for the link core.
#[derive(Error, Debug)]
pub enum LinkError {
   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Device store error: {0}")]
   Store(#[from] heed::Error),

   #[error("Payload encoding error: {0}")]
   Codec(#[from] serde_json::Error),

   #[cfg(feature = "bluez")]
   #[error("BlueZ error: {0}")]
   Bluez(#[from] bluer::Error),

   #[error("Invalid address: {0}")]
   InvalidAddress(String),

   #[error("Device not found: {0}")]
   DeviceNotFound(BdAddr),

   #[error("Link registry full ({capacity} records)")]
   RegistryFull { capacity: usize },

   #[error("Session pool exhausted")]
   SessionPoolExhausted,

   #[error("Peer channel not connected")]
   PeerNotConnected,

   #[error("Handover vetoed by {0}")]
   HandoverVetoed(&'static str),

   #[error("Handover failed: {0}")]
   HandoverFailed(String),

   #[error("Handover already in progress")]
   HandoverBusy,

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("Could not determine data directory")]
   DataDirNotFound,

   #[error("Core has been shut down")]
   CoreShutdown,
}

/// Convenience type alias for Results with `LinkError`.
pub type Result<T> = std::result::Result<T, LinkError>;

/// Completion status delivered to clients and exchanged with
/// collaborators.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::Display,
   strum::IntoStaticStr,
)]
pub enum Status {
   #[strum(serialize = "success")]
   Success,
   #[strum(serialize = "failure")]
   Failure,
   #[strum(serialize = "cancelled")]
   Cancelled,
   #[strum(serialize = "no_such_device")]
   NoSuchDevice,
   #[strum(serialize = "link_loss")]
   LinkLoss,
}

impl Status {
   pub const fn is_success(self) -> bool {
      matches!(self, Self::Success)
   }
}

/// Terminates on a broken configuration invariant.
///
/// Registry capacity and the presence of the promoted handset are fixed
/// at provisioning time; reaching this is a build defect.
#[track_caller]
pub fn fatal(what: impl fmt::Display) -> ! {
   log::error!("fatal: {what}");
   panic!("{what}");
}
