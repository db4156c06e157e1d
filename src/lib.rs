//! BLE central-role session manager.
//!
//! Discovers devices by advertisement, enumerates bonded devices, and keeps
//! per-device GATT sessions with lazily resolved handles and notification
//! subscriptions. Commands go in through [`SessionManager::dispatch`] (or a
//! spawned [`ManagerHandle`]); every asynchronous outcome comes back out as a
//! [`CentralEvent`] on the configured [`EventBus`].

pub mod bluetooth;
pub mod central;
pub mod command;
pub mod config;
pub mod error;
pub mod event;

pub use central::{
   address::DeviceAddress,
   manager::{ManagerHandle, ManagerRequest, SessionManager},
};
pub use command::{Command, CommandReply};
pub use config::Config;
pub use error::{CentralError, Result};
pub use event::{CentralEvent, EventBus, EventSender};
