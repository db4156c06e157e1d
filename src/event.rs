//! Outbound event payloads and the sink they are pushed into.
//!
//! Every asynchronous completion and every unsolicited platform event ends up
//! as a [`CentralEvent`] handed to a single [`EventBus`]. Producers include
//! command tasks as well as driver callback paths, so implementations must
//! tolerate concurrent `emit` calls.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::{
   bluetooth::driver::WriteMode,
   central::{
      address::DeviceAddress, gatt_cache::DiscoveredService, scanner::ScanResult,
      uuid::serialize_canonical, watcher::PairedDeviceEvent,
   },
};

/// Link state reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum LinkState {
   Connected,
   Disconnected,
}

/// Operations whose failure is reported as [`CentralEvent::OperationFailed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum Operation {
   SetNotifiable,
   ReadValue,
   WriteValue,
   RequestMtu,
   DiscoverServices,
}

/// Events that can be emitted by the session manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CentralEvent {
   ScanResult(ScanResult),
   PairedDevice(PairedDeviceEvent),
   ConnectionState {
      device_id: DeviceAddress,
      state: LinkState,
   },
   CharacteristicValue {
      device_id: DeviceAddress,
      #[serde(serialize_with = "serialize_canonical")]
      characteristic: Uuid,
      value: Vec<u8>,
   },
   WriteAck {
      device_id: DeviceAddress,
      #[serde(serialize_with = "serialize_canonical")]
      characteristic: Uuid,
      mode: WriteMode,
   },
   Mtu {
      device_id: DeviceAddress,
      mtu: u16,
   },
   ServicesDiscovered {
      device_id: DeviceAddress,
      services: Vec<DiscoveredService>,
   },
   OperationFailed {
      device_id: DeviceAddress,
      operation: Operation,
      characteristic: Option<Uuid>,
      error: String,
   },
}

impl CentralEvent {
   pub const fn connected(device_id: DeviceAddress) -> Self {
      Self::ConnectionState {
         device_id,
         state: LinkState::Connected,
      }
   }

   pub const fn disconnected(device_id: DeviceAddress) -> Self {
      Self::ConnectionState {
         device_id,
         state: LinkState::Disconnected,
      }
   }

   /// Address the event is scoped to, if any.
   pub fn device(&self) -> Option<DeviceAddress> {
      match self {
         Self::ScanResult(result) => Some(result.address),
         Self::PairedDevice(_) => None,
         Self::ConnectionState { device_id, .. }
         | Self::CharacteristicValue { device_id, .. }
         | Self::WriteAck { device_id, .. }
         | Self::Mtu { device_id, .. }
         | Self::ServicesDiscovered { device_id, .. }
         | Self::OperationFailed { device_id, .. } => Some(*device_id),
      }
   }
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Pushes an event to the consumer. Must not block.
   fn emit(&self, event: CentralEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
