//! Inbound command surface.
//!
//! Commands carry the host's textual arguments (decimal device ids, UUID
//! strings); the manager validates them on dispatch and reports malformed
//! input synchronously.

use serde::{Deserialize, Serialize};

use crate::central::{address::DeviceAddress, session::ConnectionState};

pub use crate::bluetooth::driver::WriteMode;

/// Requested client characteristic configuration.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
)]
pub enum NotifyMode {
   #[serde(rename = "disabled")]
   #[strum(serialize = "disabled")]
   Disabled,
   #[serde(rename = "notification")]
   #[strum(serialize = "notification")]
   Notify,
   #[serde(rename = "indication")]
   #[strum(serialize = "indication")]
   Indicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
   IsBluetoothAvailable,
   StartScanPairedDevices,
   StopScanPairedDevices,
   StartScan {
      #[serde(default)]
      service_uuid: Option<String>,
   },
   StopScan,
   Connect {
      device_id: String,
   },
   Disconnect {
      device_id: String,
   },
   DiscoverServices {
      device_id: String,
   },
   SetNotifiable {
      device_id: String,
      service: String,
      characteristic: String,
      #[serde(alias = "bleInputProperty")]
      mode: NotifyMode,
   },
   RequestMtu {
      device_id: String,
      expected_mtu: u16,
   },
   ReadValue {
      device_id: String,
      service: String,
      characteristic: String,
   },
   WriteValue {
      device_id: String,
      service: String,
      characteristic: String,
      value: Vec<u8>,
      #[serde(alias = "bleOutputProperty")]
      mode: WriteMode,
   },
   GetConnectedDevices,
   DeviceState {
      device_id: String,
   },
}

impl Command {
   /// Method name as the host spells it.
   pub const fn name(&self) -> &'static str {
      match self {
         Self::IsBluetoothAvailable => "isBluetoothAvailable",
         Self::StartScanPairedDevices => "startScanPairedDevices",
         Self::StopScanPairedDevices => "stopScanPairedDevices",
         Self::StartScan { .. } => "startScan",
         Self::StopScan => "stopScan",
         Self::Connect { .. } => "connect",
         Self::Disconnect { .. } => "disconnect",
         Self::DiscoverServices { .. } => "discoverServices",
         Self::SetNotifiable { .. } => "setNotifiable",
         Self::RequestMtu { .. } => "requestMtu",
         Self::ReadValue { .. } => "readValue",
         Self::WriteValue { .. } => "writeValue",
         Self::GetConnectedDevices => "getConnectedDevices",
         Self::DeviceState { .. } => "deviceState",
      }
   }
}

/// Synchronous answer to a command. Most commands only acknowledge; their
/// results arrive later as events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reply", content = "value", rename_all = "camelCase")]
pub enum CommandReply {
   Done,
   Available(bool),
   ConnectedDevices(Vec<DeviceAddress>),
   DeviceState(ConnectionState),
}
