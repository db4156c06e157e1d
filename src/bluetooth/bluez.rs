//! [`BleDriver`] on top of BlueZ via `bluer`.
//!
//! BlueZ exposes most primitives as D-Bus property streams rather than
//! callbacks, so every registration here is backed by a task that follows the
//! relevant stream and invokes the handler. Dropping the task's
//! [`TaskGuard`] aborts it. Client characteristic configuration is handled by
//! BlueZ itself: enabling notifications opens a notify stream (BlueZ writes the
//! descriptor, choosing notify or indicate from the characteristic flags).
//! Disabling drops it, and so does releasing the last value handler of the
//! characteristic.

use std::{
   collections::{HashMap, HashSet},
   pin::pin,
   sync::Arc,
   time::Duration,
};

use async_trait::async_trait;
use bluer::{
   Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, DiscoveryFilter,
   DiscoveryTransport, Session,
   gatt::{
      WriteOp,
      remote::{Characteristic, CharacteristicWriteRequest},
   },
};
use crossbeam::atomic::AtomicCell;
use futures::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{runtime::Handle, task::JoinHandle, time};

use crate::{
   bluetooth::driver::{
      Advertisement, AdvertisementHandler, BleDriver, CharacteristicHandle, ClientConfiguration,
      ConnectionStatusHandler, DeviceHandle, DriverError, DriverResult, LinkStatus,
      ManufacturerData, ScanSettings, ServiceHandle, SubscriptionToken, ValueChangedHandler,
      WatcherEvent, WatcherHandler, WriteMode,
   },
   central::address::DeviceAddress,
};

/// Poll interval while waiting for BlueZ to resolve services after connect
const SERVICES_RESOLVED_POLL: Duration = Duration::from_millis(100);

/// Aborts the wrapped task when dropped.
struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
   fn drop(&mut self) {
      self.0.abort();
   }
}

type CharacteristicKey = (DeviceAddress, u16, u16);

fn key_of(handle: &CharacteristicHandle) -> CharacteristicKey {
   (handle.device, handle.service_id, handle.id)
}

fn to_bluer(address: DeviceAddress) -> Address {
   Address::new(address.octets())
}

fn from_bluer(address: Address) -> DeviceAddress {
   DeviceAddress::from_octets(address.0)
}

#[derive(Default)]
struct Handlers {
   advertisements: Mutex<HashMap<u64, AdvertisementHandler>>,
   paired: Mutex<HashMap<u64, WatcherHandler>>,
   values: Mutex<HashMap<CharacteristicKey, HashMap<u64, ValueChangedHandler>>>,
}

impl Handlers {
   fn advertise(&self, adv: &Advertisement) {
      let handlers: Vec<_> = self.advertisements.lock().values().cloned().collect();
      for handler in handlers {
         handler(adv.clone());
      }
   }

   fn watcher(&self, event: &WatcherEvent) {
      let handlers: Vec<_> = self.paired.lock().values().cloned().collect();
      for handler in handlers {
         handler(event.clone());
      }
   }

   fn value(&self, key: &CharacteristicKey, value: &[u8]) {
      let handlers: Vec<_> = self
         .values
         .lock()
         .get(key)
         .map(|handlers| handlers.values().cloned().collect())
         .unwrap_or_default();
      for handler in handlers {
         handler(value.to_vec());
      }
   }

   /// Drops one value handler. Returns true when it was the last one for
   /// `key`.
   fn remove_value(&self, key: &CharacteristicKey, id: u64) -> bool {
      let mut values = self.values.lock();
      let Some(handlers) = values.get_mut(key) else {
         return false;
      };
      handlers.remove(&id);
      if handlers.is_empty() {
         values.remove(key);
         true
      } else {
         false
      }
   }
}

#[derive(Default)]
struct Tasks {
   discovery: Option<TaskGuard>,
   enumeration: Option<TaskGuard>,
   status: HashMap<u64, TaskGuard>,
   notify: HashMap<CharacteristicKey, TaskGuard>,
}

/// BlueZ-backed platform driver.
pub struct BlueZDriver {
   _session: Session,
   adapter: Adapter,
   runtime: Handle,
   handlers: Arc<Handlers>,
   tasks: Mutex<Tasks>,
   /// Disconnects issued by `close_device` that may still be running.
   closing: Mutex<Vec<JoinHandle<()>>>,
}

impl BlueZDriver {
   /// Opens `adapter_name`, or the default adapter.
   pub async fn new(adapter_name: Option<&str>) -> DriverResult<Self> {
      let session = Session::new().await?;
      let adapter = match adapter_name {
         Some(name) => session.adapter(name)?,
         None => session.default_adapter().await?,
      };
      info!("Using Bluetooth adapter {}", adapter.name());
      Ok(Self {
         _session: session,
         adapter,
         runtime: Handle::current(),
         handlers: Arc::default(),
         tasks: Mutex::default(),
         closing: Mutex::default(),
      })
   }

   /// Waits for every disconnect issued so far to complete.
   pub async fn settle(&self) {
      let pending = std::mem::take(&mut *self.closing.lock());
      for task in pending {
         if let Err(e) = task.await {
            debug!("Disconnect task ended abnormally: {e}");
         }
      }
   }

   fn device(&self, address: DeviceAddress) -> DriverResult<Device> {
      Ok(self.adapter.device(to_bluer(address))?)
   }

   async fn characteristic(&self, handle: &CharacteristicHandle) -> DriverResult<Characteristic> {
      let service = self.device(handle.device)?.service(handle.service_id).await?;
      Ok(service.characteristic(handle.id).await?)
   }
}

/// Reads the advertisement-related properties BlueZ cached for `device`.
/// Returns `None` when the device has not been heard recently.
async fn read_advertisement(device: &Device) -> Option<Advertisement> {
   let rssi = device.rssi().await.ok().flatten()?;
   let local_name = device.name().await.ok().flatten();
   let mut manufacturer_data: Vec<_> = device
      .manufacturer_data()
      .await
      .ok()
      .flatten()
      .unwrap_or_default()
      .into_iter()
      .map(|(company_id, data)| ManufacturerData { company_id, data })
      .collect();
   manufacturer_data.sort_by_key(|section| section.company_id);
   let service_uuids = device
      .uuids()
      .await
      .ok()
      .flatten()
      .unwrap_or_default()
      .into_iter()
      .collect();

   Some(Advertisement {
      address: from_bluer(device.address()),
      local_name,
      rssi,
      manufacturer_data,
      service_uuids,
   })
}

async fn follow_advertiser(device: Device, handlers: Arc<Handlers>) {
   let Ok(events) = device.events().await else {
      return;
   };
   let mut events = pin!(events);
   while let Some(DeviceEvent::PropertyChanged(property)) = events.next().await {
      if matches!(
         property,
         DeviceProperty::Rssi(_) | DeviceProperty::ManufacturerData(_)
      ) && let Some(adv) = read_advertisement(&device).await
      {
         handlers.advertise(&adv);
      }
   }
}

async fn run_discovery(adapter: Adapter, settings: ScanSettings, handlers: Arc<Handlers>) {
   let mut filter = DiscoveryFilter::default();
   filter.transport = DiscoveryTransport::Le;
   filter.rssi = Some(settings.out_of_range_threshold_dbm);
   if let Some(uuid) = settings.service_filter {
      filter.uuids = HashSet::from([uuid]);
   }
   if let Err(e) = adapter.set_discovery_filter(filter).await {
      warn!("Failed to set discovery filter: {e}");
   }

   let events = match adapter.discover_devices().await {
      Ok(events) => events,
      Err(e) => {
         warn!("Failed to start discovery on {}: {e}", adapter.name());
         return;
      },
   };
   let mut events = pin!(events);
   let mut followers: HashMap<Address, TaskGuard> = HashMap::new();

   while let Some(event) = events.next().await {
      match event {
         AdapterEvent::DeviceAdded(addr) => {
            let Ok(device) = adapter.device(addr) else {
               continue;
            };
            if let Some(adv) = read_advertisement(&device).await {
               handlers.advertise(&adv);
            }
            followers.entry(addr).or_insert_with(|| {
               TaskGuard(tokio::spawn(follow_advertiser(device, handlers.clone())))
            });
         },
         AdapterEvent::DeviceRemoved(addr) => {
            followers.remove(&addr);
         },
         _ => {},
      }
   }
   debug!("Discovery stream on {} ended", adapter.name());
}

/// A paired device being followed. `paired` mirrors the last `Added` or
/// `Removed` reported for it.
struct PairedFollower {
   paired: Arc<AtomicCell<bool>>,
   _task: TaskGuard,
}

/// Records a pairing change. Returns true when it differs from what was last
/// reported.
fn pairing_changed(paired: &AtomicCell<bool>, now: bool) -> bool {
   paired.swap(now) != now
}

/// Drops the follower of `addr`. Returns the `Removed` still owed for it.
fn forget_paired(
   followers: &mut HashMap<Address, PairedFollower>,
   addr: Address,
) -> Option<WatcherEvent> {
   let follower = followers.remove(&addr)?;
   follower.paired.load().then(|| WatcherEvent::Removed {
      system_id: addr.to_string(),
      is_connected: false,
   })
}

async fn paired_added(device: &Device, system_id: &str) -> WatcherEvent {
   WatcherEvent::Added {
      system_id: system_id.to_owned(),
      name: device.alias().await.unwrap_or_default(),
      address: device.address().to_string(),
      is_connected: device.is_connected().await.unwrap_or(false),
   }
}

async fn follow_paired(
   device: Device,
   system_id: String,
   paired: Arc<AtomicCell<bool>>,
   handlers: Arc<Handlers>,
) {
   let Ok(events) = device.events().await else {
      return;
   };
   let mut events = pin!(events);
   while let Some(DeviceEvent::PropertyChanged(property)) = events.next().await {
      match property {
         DeviceProperty::Connected(is_connected) if paired.load() => {
            handlers.watcher(&WatcherEvent::Updated {
               system_id: system_id.clone(),
               is_connected,
            });
         },
         DeviceProperty::Paired(now) if pairing_changed(&paired, now) => {
            let event = if now {
               paired_added(&device, &system_id).await
            } else {
               WatcherEvent::Removed {
                  system_id: system_id.clone(),
                  is_connected: device.is_connected().await.unwrap_or(false),
               }
            };
            handlers.watcher(&event);
         },
         _ => {},
      }
   }
}

/// Emits `Added` for a paired device and starts following it.
async fn announce_paired(
   adapter: &Adapter,
   addr: Address,
   handlers: &Arc<Handlers>,
   followers: &mut HashMap<Address, PairedFollower>,
) {
   if followers.contains_key(&addr) {
      return;
   }
   let Ok(device) = adapter.device(addr) else {
      return;
   };
   if !device.is_paired().await.unwrap_or(false) {
      return;
   }
   let system_id = addr.to_string();
   handlers.watcher(&paired_added(&device, &system_id).await);
   let paired = Arc::new(AtomicCell::new(true));
   let task = tokio::spawn(follow_paired(
      device,
      system_id,
      paired.clone(),
      handlers.clone(),
   ));
   followers.insert(
      addr,
      PairedFollower {
         paired,
         _task: TaskGuard(task),
      },
   );
}

async fn run_enumeration(adapter: Adapter, handlers: Arc<Handlers>) {
   let mut followers: HashMap<Address, PairedFollower> = HashMap::new();

   match adapter.device_addresses().await {
      Ok(addresses) => {
         for addr in addresses {
            announce_paired(&adapter, addr, &handlers, &mut followers).await;
         }
      },
      Err(e) => warn!("Failed to list devices on {}: {e}", adapter.name()),
   }
   handlers.watcher(&WatcherEvent::EnumerationCompleted);

   let Ok(events) = adapter.events().await else {
      warn!("Failed to follow adapter events on {}", adapter.name());
      return;
   };
   let mut events = pin!(events);
   while let Some(event) = events.next().await {
      match event {
         AdapterEvent::DeviceAdded(addr) => {
            announce_paired(&adapter, addr, &handlers, &mut followers).await;
         },
         AdapterEvent::DeviceRemoved(addr) => {
            if let Some(removed) = forget_paired(&mut followers, addr) {
               handlers.watcher(&removed);
            }
         },
         _ => {},
      }
   }
}

async fn follow_link(device: Device, handler: ConnectionStatusHandler) {
   let Ok(events) = device.events().await else {
      return;
   };
   let mut events = pin!(events);
   while let Some(DeviceEvent::PropertyChanged(property)) = events.next().await {
      if let DeviceProperty::Connected(connected) = property {
         handler(if connected {
            LinkStatus::Connected
         } else {
            LinkStatus::Disconnected
         });
      }
   }
}

#[async_trait]
impl BleDriver for BlueZDriver {
   async fn radio_available(&self) -> bool {
      self.adapter.is_powered().await.unwrap_or(false)
   }

   fn subscribe_advertisements(
      &self,
      handler: AdvertisementHandler,
   ) -> DriverResult<SubscriptionToken> {
      let token = SubscriptionToken::next();
      self.handlers.advertisements.lock().insert(token.id(), handler);
      Ok(token)
   }

   fn unsubscribe_advertisements(&self, token: SubscriptionToken) {
      self.handlers.advertisements.lock().remove(&token.id());
   }

   fn start_scan(&self, settings: &ScanSettings) -> DriverResult<()> {
      let task = self.runtime.spawn(run_discovery(
         self.adapter.clone(),
         *settings,
         self.handlers.clone(),
      ));
      // Replacing the guard restarts discovery with the new filter.
      self.tasks.lock().discovery = Some(TaskGuard(task));
      Ok(())
   }

   fn stop_scan(&self) -> DriverResult<()> {
      self.tasks.lock().discovery = None;
      Ok(())
   }

   fn subscribe_paired_devices(&self, handler: WatcherHandler) -> DriverResult<SubscriptionToken> {
      let token = SubscriptionToken::next();
      self.handlers.paired.lock().insert(token.id(), handler);
      Ok(token)
   }

   fn unsubscribe_paired_devices(&self, token: SubscriptionToken) {
      self.handlers.paired.lock().remove(&token.id());
   }

   fn start_paired_enumeration(&self) -> DriverResult<()> {
      let task = self
         .runtime
         .spawn(run_enumeration(self.adapter.clone(), self.handlers.clone()));
      self.tasks.lock().enumeration = Some(TaskGuard(task));
      Ok(())
   }

   fn stop_paired_enumeration(&self) -> DriverResult<()> {
      let running = self.tasks.lock().enumeration.take();
      let handlers = self.handlers.clone();
      self.runtime.spawn(async move {
         drop(running);
         handlers.watcher(&WatcherEvent::Stopped);
      });
      Ok(())
   }

   async fn open_device(&self, address: DeviceAddress) -> DriverResult<DeviceHandle> {
      let device = self.device(address)?;
      if !device.is_connected().await? {
         device.connect().await.map_err(|e| {
            debug!("Connect to {address} failed: {e}");
            DriverError::Unreachable(address)
         })?;
      }
      while !device.is_services_resolved().await? {
         time::sleep(SERVICES_RESOLVED_POLL).await;
      }
      Ok(DeviceHandle { address })
   }

   fn close_device(&self, device: &DeviceHandle) {
      let address = device.address;
      let Ok(device) = self.device(address) else {
         return;
      };
      let task = self.runtime.spawn(async move {
         if let Err(e) = device.disconnect().await {
            debug!("Disconnect of {address} failed: {e}");
         }
      });
      let mut closing = self.closing.lock();
      closing.retain(|task| !task.is_finished());
      closing.push(task);
   }

   fn subscribe_connection_status(
      &self,
      device: &DeviceHandle,
      handler: ConnectionStatusHandler,
   ) -> DriverResult<SubscriptionToken> {
      let token = SubscriptionToken::next();
      let task = self
         .runtime
         .spawn(follow_link(self.device(device.address)?, handler));
      self.tasks.lock().status.insert(token.id(), TaskGuard(task));
      Ok(token)
   }

   fn unsubscribe_connection_status(&self, _device: &DeviceHandle, token: SubscriptionToken) {
      self.tasks.lock().status.remove(&token.id());
   }

   async fn services(&self, device: &DeviceHandle) -> DriverResult<Vec<ServiceHandle>> {
      let services = self.device(device.address)?.services().await?;
      let mut handles = Vec::with_capacity(services.len());
      for service in services {
         handles.push(ServiceHandle {
            device: device.address,
            id: service.id(),
            uuid: service.uuid().await?,
         });
      }
      Ok(handles)
   }

   async fn characteristics(
      &self,
      service: &ServiceHandle,
   ) -> DriverResult<Vec<CharacteristicHandle>> {
      let characteristics = self
         .device(service.device)?
         .service(service.id)
         .await?
         .characteristics()
         .await?;
      let mut handles = Vec::with_capacity(characteristics.len());
      for characteristic in characteristics {
         handles.push(CharacteristicHandle {
            device: service.device,
            service_id: service.id,
            id: characteristic.id(),
            uuid: characteristic.uuid().await?,
         });
      }
      Ok(handles)
   }

   async fn read_value(&self, handle: &CharacteristicHandle) -> DriverResult<Vec<u8>> {
      Ok(self.characteristic(handle).await?.read().await?)
   }

   async fn write_value(
      &self,
      handle: &CharacteristicHandle,
      value: &[u8],
      mode: WriteMode,
   ) -> DriverResult<()> {
      let mut request = CharacteristicWriteRequest::default();
      request.op_type = match mode {
         WriteMode::WithResponse => WriteOp::Request,
         WriteMode::WithoutResponse => WriteOp::Command,
      };
      self.characteristic(handle)
         .await?
         .write_ext(value, &request)
         .await?;
      Ok(())
   }

   async fn write_client_configuration(
      &self,
      handle: &CharacteristicHandle,
      value: ClientConfiguration,
   ) -> DriverResult<()> {
      let key = key_of(handle);
      if value == ClientConfiguration::None {
         self.tasks.lock().notify.remove(&key);
         return Ok(());
      }

      let stream = self.characteristic(handle).await?.notify().await?;
      let handlers = self.handlers.clone();
      let task = self.runtime.spawn(async move {
         let mut stream = pin!(stream);
         while let Some(value) = stream.next().await {
            handlers.value(&key, &value);
         }
      });
      self.tasks.lock().notify.insert(key, TaskGuard(task));
      Ok(())
   }

   fn subscribe_value_changed(
      &self,
      handle: &CharacteristicHandle,
      handler: ValueChangedHandler,
   ) -> DriverResult<SubscriptionToken> {
      let token = SubscriptionToken::next();
      self.handlers
         .values
         .lock()
         .entry(key_of(handle))
         .or_default()
         .insert(token.id(), handler);
      Ok(token)
   }

   fn unsubscribe_value_changed(&self, handle: &CharacteristicHandle, token: SubscriptionToken) {
      let key = key_of(handle);
      if self.handlers.remove_value(&key, token.id())
         && self.tasks.lock().notify.remove(&key).is_some()
      {
         debug!("Notify session for {} {} closed", handle.device, handle.uuid);
      }
   }

   /// BlueZ negotiates the ATT MTU on its own; `expected` is only logged.
   async fn max_pdu_size(&self, device: &DeviceHandle, expected: u16) -> DriverResult<u16> {
      debug!("MTU of {} requested (expected {expected})", device.address);
      for service in self.device(device.address)?.services().await? {
         if let Some(characteristic) = service.characteristics().await?.into_iter().next() {
            let mtu = characteristic.mtu().await?;
            return Ok(u16::try_from(mtu).unwrap_or(u16::MAX));
         }
      }
      Err(DriverError::Unsupported("no characteristic to query the MTU from"))
   }
}
