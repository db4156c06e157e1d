//! One physical connection and everything registered against it.
//!
//! A session owns the native device handle, the connection-status
//! registration, its [`GattCache`] and the value-changed registrations created
//! by `setNotifiable`. [`DeviceSession::teardown`] releases all of them; after
//! that no new registration can be attached.
//!
//! `setNotifiable` requests are stamped in command order by
//! [`DeviceSession::notify_request`] and applied one at a time. A request
//! older than one already applied to the same characteristic is dropped.

use std::{collections::HashMap, sync::Arc};

use crossbeam::atomic::AtomicCell;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::{
   bluetooth::driver::{
      BleDriver, CharacteristicHandle, ClientConfiguration, DeviceHandle, SubscriptionToken,
      ValueChangedHandler, WriteMode,
   },
   central::{
      address::DeviceAddress,
      gatt_cache::{DiscoveredService, GattCache},
   },
   command::NotifyMode,
   error::{CentralError, Result},
   event::{CentralEvent, EventSender},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ConnectionState {
   Connecting,
   Connected,
   Disconnecting,
   Disconnected,
}

/// An active value-changed registration.
#[derive(Debug)]
pub struct NotificationSubscription {
   pub characteristic: CharacteristicHandle,
   pub mode: NotifyMode,
   token: SubscriptionToken,
}

pub struct DeviceSession {
   address: DeviceAddress,
   device: DeviceHandle,
   ticket: u64,
   state: AtomicCell<ConnectionState>,
   gatt: GattCache,
   driver: Arc<dyn BleDriver>,
   status_token: Mutex<Option<SubscriptionToken>>,
   /// `None` once torn down.
   subscriptions: Mutex<Option<HashMap<Uuid, NotificationSubscription>>>,
   notify_stamp: AtomicCell<u64>,
   /// Last applied stamp per characteristic.
   notify_applied: AsyncMutex<HashMap<Uuid, u64>>,
}

impl DeviceSession {
   pub fn new(driver: Arc<dyn BleDriver>, device: DeviceHandle, ticket: u64) -> Self {
      Self {
         address: device.address,
         gatt: GattCache::new(driver.clone(), device.clone()),
         device,
         ticket,
         state: AtomicCell::new(ConnectionState::Connecting),
         driver,
         status_token: Mutex::new(None),
         subscriptions: Mutex::new(Some(HashMap::new())),
         notify_stamp: AtomicCell::new(0),
         notify_applied: AsyncMutex::new(HashMap::new()),
      }
   }

   pub const fn address(&self) -> DeviceAddress {
      self.address
   }

   /// Registry reservation this session was created under.
   pub const fn ticket(&self) -> u64 {
      self.ticket
   }

   pub fn state(&self) -> ConnectionState {
      self.state.load()
   }

   pub fn set_state(&self, state: ConnectionState) {
      self.state.store(state);
   }

   pub const fn gatt(&self) -> &GattCache {
      &self.gatt
   }

   /// Fails once teardown has started.
   fn ensure_live(&self) -> Result<()> {
      match self.state() {
         ConnectionState::Disconnecting | ConnectionState::Disconnected => {
            Err(CentralError::UnknownDevice(self.address))
         },
         ConnectionState::Connecting | ConnectionState::Connected => Ok(()),
      }
   }

   pub fn set_status_token(&self, token: SubscriptionToken) {
      let previous = self.status_token.lock().replace(token);
      if let Some(previous) = previous {
         self.driver.unsubscribe_connection_status(&self.device, previous);
      }
   }

   /// Characteristics with a live value-changed registration.
   pub fn notifying(&self) -> Vec<(Uuid, NotifyMode)> {
      self.subscriptions
         .lock()
         .as_ref()
         .map(|subs| subs.iter().map(|(uuid, sub)| (*uuid, sub.mode)).collect())
         .unwrap_or_default()
   }

   /// Stamps a `setNotifiable` request. Call in command order, before the
   /// request is handed off.
   pub fn notify_request(&self) -> u64 {
      self.notify_stamp.fetch_add(1) + 1
   }

   pub async fn set_notifiable(
      &self,
      request: u64,
      service: Uuid,
      characteristic: Uuid,
      mode: NotifyMode,
      events: &EventSender,
   ) -> Result<()> {
      self.ensure_live()?;
      let mut applied = self.notify_applied.lock().await;
      if applied
         .get(&characteristic)
         .is_some_and(|&latest| latest > request)
      {
         debug!(
            "Dropping stale notification request {request} for {characteristic} on {}",
            self.address
         );
         return Ok(());
      }
      applied.insert(characteristic, request);

      let handle = self.gatt.resolve_characteristic(service, characteristic).await?;

      let configuration = match mode {
         NotifyMode::Disabled => ClientConfiguration::None,
         NotifyMode::Notify => ClientConfiguration::Notify,
         NotifyMode::Indicate => ClientConfiguration::Indicate,
      };
      if let Err(e) = self
         .driver
         .write_client_configuration(&handle, configuration)
         .await
      {
         warn!(
            "Descriptor write for {characteristic} on {} failed, continuing: {e}",
            self.address
         );
      }

      if mode == NotifyMode::Disabled {
         let previous = self
            .subscriptions
            .lock()
            .as_mut()
            .and_then(|subs| subs.remove(&characteristic));
         if let Some(previous) = previous {
            self.driver
               .unsubscribe_value_changed(&previous.characteristic, previous.token);
         }
         info!("Notifications for {characteristic} on {} disabled", self.address);
         return Ok(());
      }

      // The new registration goes in before the old one is released, so the
      // characteristic never drops to zero handlers while re-enabling.
      let handler = value_handler(self.address, characteristic, events.clone());
      let token = self.driver.subscribe_value_changed(&handle, handler)?;
      let subscription = NotificationSubscription {
         characteristic: handle,
         mode,
         token,
      };

      let replaced = {
         let mut subs = self.subscriptions.lock();
         match subs.as_mut() {
            Some(subs) => subs.insert(characteristic, subscription).map(Ok),
            None => Some(Err(subscription)),
         }
      };
      match replaced {
         None => {},
         Some(Ok(previous)) => {
            self.driver
               .unsubscribe_value_changed(&previous.characteristic, previous.token);
         },
         Some(Err(orphan)) => {
            self.driver
               .unsubscribe_value_changed(&orphan.characteristic, orphan.token);
            return Err(CentralError::UnknownDevice(self.address));
         },
      }

      info!("Notifications for {characteristic} on {} set to {mode}", self.address);
      Ok(())
   }

   pub async fn read_value(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
      self.ensure_live()?;
      let handle = self.gatt.resolve_characteristic(service, characteristic).await?;
      let value = self.driver.read_value(&handle).await?;
      debug!(
         "Read {characteristic} on {}: {}",
         self.address,
         hex::encode(&value)
      );
      Ok(value)
   }

   pub async fn write_value(
      &self,
      service: Uuid,
      characteristic: Uuid,
      value: &[u8],
      mode: WriteMode,
   ) -> Result<()> {
      self.ensure_live()?;
      let handle = self.gatt.resolve_characteristic(service, characteristic).await?;
      debug!(
         "Writing {characteristic} on {} ({mode}): {}",
         self.address,
         hex::encode(value)
      );
      self.driver.write_value(&handle, value, mode).await?;
      Ok(())
   }

   pub async fn max_pdu_size(&self, expected: u16) -> Result<u16> {
      self.ensure_live()?;
      Ok(self.driver.max_pdu_size(&self.device, expected).await?)
   }

   pub async fn discover(&self) -> Result<Vec<DiscoveredService>> {
      self.ensure_live()?;
      self.gatt.populate().await
   }

   /// Releases every native registration. Closes the device handle when
   /// `dispose` is set. Returns the number of value registrations released.
   pub fn teardown(&self, dispose: bool) -> usize {
      self.state.store(ConnectionState::Disconnecting);

      let status = self.status_token.lock().take();
      if let Some(token) = status {
         self.driver.unsubscribe_connection_status(&self.device, token);
      }

      let subscriptions = self.subscriptions.lock().take().unwrap_or_default();
      let released = subscriptions.len();
      for (_, subscription) in subscriptions {
         self.driver
            .unsubscribe_value_changed(&subscription.characteristic, subscription.token);
      }

      if dispose {
         self.driver.close_device(&self.device);
      }
      self.state.store(ConnectionState::Disconnected);
      info!(
         "Session for {} torn down, released {released} subscriptions",
         self.address
      );
      released
   }
}

fn value_handler(
   address: DeviceAddress,
   characteristic: Uuid,
   events: EventSender,
) -> ValueChangedHandler {
   Arc::new(move |value: Vec<u8>| {
      debug!("{address} {characteristic} changed: {}", hex::encode(&value));
      events.emit(CentralEvent::CharacteristicValue {
         device_id: address,
         characteristic,
         value,
      });
   })
}
