//! Error types for the central-role session manager.
//!
//! Command validation failures (unknown device, malformed address or
//! identifier) are returned synchronously to the caller. Native failures are
//! wrapped in [`CentralError::Driver`] and, for spawned operations, converted
//! into events rather than propagated.

use thiserror::Error;
use uuid::Uuid;

use crate::{bluetooth::driver::DriverError, central::address::DeviceAddress};

/// Main error type for the session manager.
#[derive(Error, Debug)]
pub enum CentralError {
   #[error("Invalid device address: {0}")]
   InvalidAddress(String),

   #[error("Invalid UUID: {0}")]
   InvalidUuid(String),

   #[error("Unknown device: {}", .0.device_id())]
   UnknownDevice(DeviceAddress),

   #[error("Device already connected: {}", .0.device_id())]
   AlreadyConnected(DeviceAddress),

   #[error("Service not found: {0}")]
   ServiceNotFound(Uuid),

   #[error("Characteristic {characteristic} not found in service {service}")]
   CharacteristicNotFound { service: Uuid, characteristic: Uuid },

   #[error("Native call failed: {0}")]
   Driver(#[from] DriverError),

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Paired-device watcher is still stopping")]
   WatcherStopping,

   #[error("Manager has been shut down")]
   ManagerShutdown,

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

/// Convenience type alias for Results with `CentralError`.
pub type Result<T> = std::result::Result<T, CentralError>;
