//! Platform driver seam.
//!
//! [`BleDriver`] is the set of primitives the session manager needs from the
//! OS Bluetooth stack. Every callback registration returns a
//! [`SubscriptionToken`] which the caller stores next to the resource it
//! instruments and hands back to the matching `unsubscribe_*` call during
//! teardown. Callbacks may be invoked from any thread, including
//! synchronously from inside a driver call, so callers must not hold locks
//! across driver calls that can re-enter them.

use std::sync::{
   Arc,
   atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::central::address::DeviceAddress;

/// Native call failures.
#[derive(Error, Debug)]
pub enum DriverError {
   #[error("Device unreachable: {0}")]
   Unreachable(DeviceAddress),

   #[error("GATT communication failed: {0}")]
   Communication(String),

   #[error("Handle closed")]
   Closed,

   #[error("Not supported by this platform: {0}")]
   Unsupported(&'static str),

   #[cfg(feature = "bluez")]
   #[error("BlueZ error: {0}")]
   BlueZ(#[from] bluer::Error),
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Registration handle for a platform callback.
///
/// Deliberately neither `Clone` nor `Copy`: a token is consumed by the single
/// `unsubscribe_*` call that releases it.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

impl SubscriptionToken {
   /// Allocates a process-unique token.
   pub fn next() -> Self {
      static NEXT: AtomicU64 = AtomicU64::new(1);
      Self(NEXT.fetch_add(1, Ordering::Relaxed))
   }

   pub const fn id(&self) -> u64 {
      self.0
   }
}

/// An opened native device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
   pub address: DeviceAddress,
}

/// A resolved GATT service instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceHandle {
   pub device: DeviceAddress,
   /// Platform identifier of the instance (ATT handle or object id).
   pub id: u16,
   pub uuid: Uuid,
}

/// A resolved GATT characteristic instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
   pub device: DeviceAddress,
   pub service_id: u16,
   pub id: u16,
   pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManufacturerData {
   pub company_id: u16,
   pub data: Vec<u8>,
}

/// One received advertisement frame, as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
   pub address: DeviceAddress,
   pub local_name: Option<String>,
   pub rssi: i16,
   pub manufacturer_data: Vec<ManufacturerData>,
   pub service_uuids: Vec<Uuid>,
}

/// Raw paired-device enumeration events.
///
/// `address` is the platform's textual MAC and still needs validating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
   Added {
      system_id: String,
      name: String,
      address: String,
      is_connected: bool,
   },
   Updated {
      system_id: String,
      is_connected: bool,
   },
   Removed {
      system_id: String,
      is_connected: bool,
   },
   EnumerationCompleted,
   Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
   Connected,
   Disconnected,
}

/// Client characteristic configuration descriptor values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientConfiguration {
   None,
   Notify,
   Indicate,
}

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
pub enum WriteMode {
   #[serde(rename = "withResponse")]
   #[strum(serialize = "withResponse")]
   WithResponse,
   #[serde(rename = "withoutResponse")]
   #[strum(serialize = "withoutResponse")]
   WithoutResponse,
}

/// Parameters for advertisement scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSettings {
   pub service_filter: Option<Uuid>,
   pub in_range_threshold_dbm: i16,
   pub out_of_range_threshold_dbm: i16,
}

pub type AdvertisementHandler = Arc<dyn Fn(Advertisement) + Send + Sync>;
pub type WatcherHandler = Arc<dyn Fn(WatcherEvent) + Send + Sync>;
pub type ConnectionStatusHandler = Arc<dyn Fn(LinkStatus) + Send + Sync>;
pub type ValueChangedHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Primitives provided by the OS Bluetooth stack.
#[async_trait]
pub trait BleDriver: Send + Sync {
   /// Radio present and powered on.
   async fn radio_available(&self) -> bool;

   fn subscribe_advertisements(
      &self,
      handler: AdvertisementHandler,
   ) -> DriverResult<SubscriptionToken>;
   fn unsubscribe_advertisements(&self, token: SubscriptionToken);
   /// Starts scanning, or reconfigures an active scan.
   fn start_scan(&self, settings: &ScanSettings) -> DriverResult<()>;
   fn stop_scan(&self) -> DriverResult<()>;

   fn subscribe_paired_devices(&self, handler: WatcherHandler) -> DriverResult<SubscriptionToken>;
   fn unsubscribe_paired_devices(&self, token: SubscriptionToken);
   fn start_paired_enumeration(&self) -> DriverResult<()>;
   /// Requests a stop; completion is signalled by [`WatcherEvent::Stopped`].
   fn stop_paired_enumeration(&self) -> DriverResult<()>;

   async fn open_device(&self, address: DeviceAddress) -> DriverResult<DeviceHandle>;
   fn close_device(&self, device: &DeviceHandle);
   fn subscribe_connection_status(
      &self,
      device: &DeviceHandle,
      handler: ConnectionStatusHandler,
   ) -> DriverResult<SubscriptionToken>;
   fn unsubscribe_connection_status(&self, device: &DeviceHandle, token: SubscriptionToken);

   async fn services(&self, device: &DeviceHandle) -> DriverResult<Vec<ServiceHandle>>;
   async fn characteristics(
      &self,
      service: &ServiceHandle,
   ) -> DriverResult<Vec<CharacteristicHandle>>;
   async fn read_value(&self, characteristic: &CharacteristicHandle) -> DriverResult<Vec<u8>>;
   async fn write_value(
      &self,
      characteristic: &CharacteristicHandle,
      value: &[u8],
      mode: WriteMode,
   ) -> DriverResult<()>;
   async fn write_client_configuration(
      &self,
      characteristic: &CharacteristicHandle,
      value: ClientConfiguration,
   ) -> DriverResult<()>;
   fn subscribe_value_changed(
      &self,
      characteristic: &CharacteristicHandle,
      handler: ValueChangedHandler,
   ) -> DriverResult<SubscriptionToken>;
   fn unsubscribe_value_changed(
      &self,
      characteristic: &CharacteristicHandle,
      token: SubscriptionToken,
   );

   /// Negotiated maximum payload size for the link. `expected` is a hint the
   /// platform may use to renegotiate.
   async fn max_pdu_size(&self, device: &DeviceHandle, expected: u16) -> DriverResult<u16>;
}
