//! In-memory driver and event sink for unit tests.
//!
//! [`StubDriver`] keeps a scripted GATT layout per device and counts every
//! registration it hands out, so tests can assert that each token is released
//! exactly once. Platform events are injected through the helper methods and
//! delivered to handlers outside the internal lock, the same way a real stack
//! calls back from its own threads.

use std::{
   collections::HashMap,
   sync::Arc,
   time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::{
   bluetooth::driver::{
      Advertisement, AdvertisementHandler, BleDriver, CharacteristicHandle, ClientConfiguration,
      ConnectionStatusHandler, DeviceHandle, DriverError, DriverResult, LinkStatus, ScanSettings,
      ServiceHandle, SubscriptionToken, ValueChangedHandler, WatcherEvent, WatcherHandler,
      WriteMode,
   },
   central::address::DeviceAddress,
   event::{CentralEvent, EventBus},
};

#[derive(Default)]
struct StubState {
   radio_off: bool,

   advertisement_handlers: HashMap<u64, AdvertisementHandler>,
   scan_settings: Option<ScanSettings>,
   scanning: bool,

   paired_handlers: HashMap<u64, WatcherHandler>,
   paired_starts: usize,
   paired_stops: usize,

   layouts: HashMap<DeviceAddress, Vec<(Uuid, Vec<Uuid>)>>,
   open_gate: Option<Arc<Notify>>,
   status_handlers: HashMap<DeviceAddress, HashMap<u64, ConnectionStatusHandler>>,
   value_handlers: HashMap<(DeviceAddress, Uuid), HashMap<u64, ValueChangedHandler>>,
   values: HashMap<Uuid, Vec<u8>>,
   mtu: u16,

   fail_services: bool,
   fail_configuration: bool,
   fail_read: bool,

   service_enumerations: usize,
   characteristic_enumerations: usize,
   status_unsubscribes: usize,
   value_unsubscribes: usize,
   value_keys_released: usize,
   closes: usize,
   hang_reads: bool,
   configurations: Vec<(Uuid, ClientConfiguration)>,
   writes: Vec<(Uuid, Vec<u8>, WriteMode)>,
}

/// Scriptable [`BleDriver`].
pub struct StubDriver {
   state: Mutex<StubState>,
}

impl Default for StubDriver {
   fn default() -> Self {
      Self::new()
   }
}

const fn service_id(index: usize) -> u16 {
   (index as u16 + 1) * 0x10
}

impl StubDriver {
   pub fn new() -> Self {
      Self {
         state: Mutex::new(StubState {
            mtu: 247,
            ..Default::default()
         }),
      }
   }

   /// Makes `address` reachable with the given services and characteristics.
   pub fn add_device(&self, address: DeviceAddress, layout: &[(Uuid, &[Uuid])]) {
      let layout = layout
         .iter()
         .map(|(service, chars)| (*service, chars.to_vec()))
         .collect();
      self.state.lock().layouts.insert(address, layout);
   }

   pub fn set_radio_off(&self) {
      self.state.lock().radio_off = true;
   }

   /// Makes `open_device` wait until the returned gate is notified.
   pub fn gate_open(&self) -> Arc<Notify> {
      let gate = Arc::new(Notify::new());
      self.state.lock().open_gate = Some(gate.clone());
      gate
   }

   pub fn fail_services(&self) {
      self.state.lock().fail_services = true;
   }

   pub fn fail_configuration(&self) {
      self.state.lock().fail_configuration = true;
   }

   pub fn fail_read(&self) {
      self.state.lock().fail_read = true;
   }

   /// Makes every read wait forever.
   pub fn hang_reads(&self) {
      self.state.lock().hang_reads = true;
   }

   pub fn set_value(&self, characteristic: Uuid, value: &[u8]) {
      self.state.lock().values.insert(characteristic, value.to_vec());
   }

   pub fn set_mtu(&self, mtu: u16) {
      self.state.lock().mtu = mtu;
   }

   pub fn advertise(&self, adv: Advertisement) {
      let handlers: Vec<_> = self
         .state
         .lock()
         .advertisement_handlers
         .values()
         .cloned()
         .collect();
      for handler in handlers {
         handler(adv.clone());
      }
   }

   pub fn watcher_event(&self, event: WatcherEvent) {
      let handlers: Vec<_> = self.state.lock().paired_handlers.values().cloned().collect();
      for handler in handlers {
         handler(event.clone());
      }
   }

   /// Simulates the remote side dropping the link.
   pub fn drop_link(&self, address: DeviceAddress) {
      let handlers: Vec<_> = self
         .state
         .lock()
         .status_handlers
         .get(&address)
         .map(|handlers| handlers.values().cloned().collect())
         .unwrap_or_default();
      for handler in handlers {
         handler(LinkStatus::Disconnected);
      }
   }

   /// Delivers a notification for `characteristic`. Returns the number of
   /// handlers that received it.
   pub fn notify_value(&self, address: DeviceAddress, characteristic: Uuid, value: &[u8]) -> usize {
      let handlers: Vec<_> = self
         .state
         .lock()
         .value_handlers
         .get(&(address, characteristic))
         .map(|handlers| handlers.values().cloned().collect())
         .unwrap_or_default();
      for handler in &handlers {
         handler(value.to_vec());
      }
      handlers.len()
   }

   pub fn advertisement_subscriptions(&self) -> usize {
      self.state.lock().advertisement_handlers.len()
   }

   pub fn scan_settings(&self) -> Option<ScanSettings> {
      self.state.lock().scan_settings
   }

   pub fn is_scanning(&self) -> bool {
      self.state.lock().scanning
   }

   pub fn paired_subscriptions(&self) -> usize {
      self.state.lock().paired_handlers.len()
   }

   pub fn paired_enumeration_starts(&self) -> usize {
      self.state.lock().paired_starts
   }

   pub fn paired_enumeration_stops(&self) -> usize {
      self.state.lock().paired_stops
   }

   pub fn status_subscriptions(&self, address: DeviceAddress) -> usize {
      self.state.lock().status_handlers.get(&address).map_or(0, HashMap::len)
   }

   pub fn value_subscriptions(&self, address: DeviceAddress) -> usize {
      self.state
         .lock()
         .value_handlers
         .iter()
         .filter(|((device, _), _)| *device == address)
         .map(|(_, handlers)| handlers.len())
         .sum()
   }

   pub fn service_enumerations(&self) -> usize {
      self.state.lock().service_enumerations
   }

   pub fn characteristic_enumerations(&self) -> usize {
      self.state.lock().characteristic_enumerations
   }

   pub fn status_unsubscribes(&self) -> usize {
      self.state.lock().status_unsubscribes
   }

   pub fn value_unsubscribes(&self) -> usize {
      self.state.lock().value_unsubscribes
   }

   /// Number of times a characteristic lost its last value handler.
   pub fn value_keys_released(&self) -> usize {
      self.state.lock().value_keys_released
   }

   pub fn closes(&self) -> usize {
      self.state.lock().closes
   }

   pub fn configurations(&self) -> Vec<(Uuid, ClientConfiguration)> {
      self.state.lock().configurations.clone()
   }

   pub fn writes(&self) -> Vec<(Uuid, Vec<u8>, WriteMode)> {
      self.state.lock().writes.clone()
   }
}

#[async_trait]
impl BleDriver for StubDriver {
   async fn radio_available(&self) -> bool {
      !self.state.lock().radio_off
   }

   fn subscribe_advertisements(
      &self,
      handler: AdvertisementHandler,
   ) -> DriverResult<SubscriptionToken> {
      let token = SubscriptionToken::next();
      self.state.lock().advertisement_handlers.insert(token.id(), handler);
      Ok(token)
   }

   fn unsubscribe_advertisements(&self, token: SubscriptionToken) {
      self.state.lock().advertisement_handlers.remove(&token.id());
   }

   fn start_scan(&self, settings: &ScanSettings) -> DriverResult<()> {
      let mut state = self.state.lock();
      if state.radio_off {
         return Err(DriverError::Unsupported("radio is off"));
      }
      state.scan_settings = Some(*settings);
      state.scanning = true;
      Ok(())
   }

   fn stop_scan(&self) -> DriverResult<()> {
      self.state.lock().scanning = false;
      Ok(())
   }

   fn subscribe_paired_devices(&self, handler: WatcherHandler) -> DriverResult<SubscriptionToken> {
      let token = SubscriptionToken::next();
      self.state.lock().paired_handlers.insert(token.id(), handler);
      Ok(token)
   }

   fn unsubscribe_paired_devices(&self, token: SubscriptionToken) {
      self.state.lock().paired_handlers.remove(&token.id());
   }

   fn start_paired_enumeration(&self) -> DriverResult<()> {
      let mut state = self.state.lock();
      if state.radio_off {
         return Err(DriverError::Unsupported("radio is off"));
      }
      state.paired_starts += 1;
      Ok(())
   }

   fn stop_paired_enumeration(&self) -> DriverResult<()> {
      self.state.lock().paired_stops += 1;
      Ok(())
   }

   async fn open_device(&self, address: DeviceAddress) -> DriverResult<DeviceHandle> {
      let gate = self.state.lock().open_gate.take();
      if let Some(gate) = gate {
         gate.notified().await;
      }
      if self.state.lock().layouts.contains_key(&address) {
         Ok(DeviceHandle { address })
      } else {
         Err(DriverError::Unreachable(address))
      }
   }

   fn close_device(&self, _device: &DeviceHandle) {
      self.state.lock().closes += 1;
   }

   fn subscribe_connection_status(
      &self,
      device: &DeviceHandle,
      handler: ConnectionStatusHandler,
   ) -> DriverResult<SubscriptionToken> {
      let token = SubscriptionToken::next();
      self.state
         .lock()
         .status_handlers
         .entry(device.address)
         .or_default()
         .insert(token.id(), handler);
      Ok(token)
   }

   fn unsubscribe_connection_status(&self, device: &DeviceHandle, token: SubscriptionToken) {
      let mut state = self.state.lock();
      state.status_unsubscribes += 1;
      if let Some(handlers) = state.status_handlers.get_mut(&device.address) {
         handlers.remove(&token.id());
      }
   }

   async fn services(&self, device: &DeviceHandle) -> DriverResult<Vec<ServiceHandle>> {
      tokio::time::sleep(Duration::from_millis(1)).await;
      let mut state = self.state.lock();
      state.service_enumerations += 1;
      if state.fail_services {
         return Err(DriverError::Communication("service enumeration failed".into()));
      }
      let layout = state
         .layouts
         .get(&device.address)
         .ok_or(DriverError::Unreachable(device.address))?;
      Ok(layout
         .iter()
         .enumerate()
         .map(|(index, (uuid, _))| ServiceHandle {
            device: device.address,
            id: service_id(index),
            uuid: *uuid,
         })
         .collect())
   }

   async fn characteristics(
      &self,
      service: &ServiceHandle,
   ) -> DriverResult<Vec<CharacteristicHandle>> {
      let mut state = self.state.lock();
      state.characteristic_enumerations += 1;
      let layout = state
         .layouts
         .get(&service.device)
         .ok_or(DriverError::Unreachable(service.device))?;
      let (_, chars) = layout
         .iter()
         .enumerate()
         .find(|(index, _)| service_id(*index) == service.id)
         .map(|(_, entry)| entry)
         .ok_or(DriverError::Closed)?;
      Ok(chars
         .iter()
         .enumerate()
         .map(|(index, uuid)| CharacteristicHandle {
            device: service.device,
            service_id: service.id,
            id: service.id + index as u16 + 1,
            uuid: *uuid,
         })
         .collect())
   }

   async fn read_value(&self, characteristic: &CharacteristicHandle) -> DriverResult<Vec<u8>> {
      let hang = self.state.lock().hang_reads;
      if hang {
         std::future::pending::<()>().await;
      }
      let state = self.state.lock();
      if state.fail_read {
         return Err(DriverError::Communication("read failed".into()));
      }
      Ok(state.values.get(&characteristic.uuid).cloned().unwrap_or_default())
   }

   async fn write_value(
      &self,
      characteristic: &CharacteristicHandle,
      value: &[u8],
      mode: WriteMode,
   ) -> DriverResult<()> {
      self.state
         .lock()
         .writes
         .push((characteristic.uuid, value.to_vec(), mode));
      Ok(())
   }

   async fn write_client_configuration(
      &self,
      characteristic: &CharacteristicHandle,
      value: ClientConfiguration,
   ) -> DriverResult<()> {
      let mut state = self.state.lock();
      if state.fail_configuration {
         return Err(DriverError::Communication("descriptor write failed".into()));
      }
      state.configurations.push((characteristic.uuid, value));
      Ok(())
   }

   fn subscribe_value_changed(
      &self,
      characteristic: &CharacteristicHandle,
      handler: ValueChangedHandler,
   ) -> DriverResult<SubscriptionToken> {
      let token = SubscriptionToken::next();
      self.state
         .lock()
         .value_handlers
         .entry((characteristic.device, characteristic.uuid))
         .or_default()
         .insert(token.id(), handler);
      Ok(token)
   }

   fn unsubscribe_value_changed(
      &self,
      characteristic: &CharacteristicHandle,
      token: SubscriptionToken,
   ) {
      let key = (characteristic.device, characteristic.uuid);
      let mut state = self.state.lock();
      state.value_unsubscribes += 1;
      let emptied = state.value_handlers.get_mut(&key).is_some_and(|handlers| {
         handlers.remove(&token.id());
         handlers.is_empty()
      });
      if emptied {
         state.value_handlers.remove(&key);
         state.value_keys_released += 1;
      }
   }

   async fn max_pdu_size(&self, _device: &DeviceHandle, _expected: u16) -> DriverResult<u16> {
      Ok(self.state.lock().mtu)
   }
}

/// Event sink that records everything it receives.
#[derive(Default)]
pub struct RecordingBus {
   events: Mutex<Vec<CentralEvent>>,
   notify: Notify,
}

impl RecordingBus {
   pub fn events(&self) -> Vec<CentralEvent> {
      self.events.lock().clone()
   }

   pub fn count(&self, pred: impl Fn(&CentralEvent) -> bool) -> usize {
      self.events.lock().iter().filter(|event| pred(event)).count()
   }

   /// Waits for the first recorded event matching `pred`. Panics after two
   /// seconds.
   pub async fn wait_for(&self, pred: impl Fn(&CentralEvent) -> bool) -> CentralEvent {
      let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
      loop {
         let notified = self.notify.notified();
         if let Some(event) = self.events.lock().iter().find(|event| pred(event)) {
            return event.clone();
         }
         if tokio::time::timeout_at(deadline, notified).await.is_err() {
            panic!("timed out waiting for event, got {:?}", self.events());
         }
      }
   }
}

impl EventBus for RecordingBus {
   fn emit(&self, event: CentralEvent) {
      self.events.lock().push(event);
      self.notify.notify_waiters();
   }
}
