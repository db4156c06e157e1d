//! Session manager.
//!
//! Routes inbound [`Command`]s to the scanner, the paired-device watcher or a
//! [`DeviceSession`], and forwards every asynchronous outcome to the event
//! sink. Validation errors are returned to the caller; anything that needs a
//! platform round trip is spawned and reports back through an event.

use std::{
   future::Future,
   sync::{Arc, Weak},
};

use log::{debug, error, info, warn};
use tokio::{
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time::{self, Instant},
};
use uuid::Uuid;

use crate::{
   bluetooth::driver::{BleDriver, ConnectionStatusHandler, LinkStatus},
   central::{
      address::DeviceAddress,
      registry::{ConnectionRegistry, RegistryEntry},
      scanner::AdvertisementScanner,
      session::{ConnectionState, DeviceSession},
      uuid::parse_uuid,
      watcher::PairedDeviceWatcher,
   },
   command::{Command, CommandReply},
   config::Config,
   error::{CentralError, Result},
   event::{CentralEvent, EventSender, Operation},
};

/// Inbox capacity of a spawned manager
const INBOX_CAPACITY: usize = 1000;

// === Requests ===

/// A command plus the slot its synchronous reply goes to.
#[derive(Debug)]
pub struct ManagerRequest {
   pub command: Command,
   pub reply: Option<oneshot::Sender<Result<CommandReply>>>,
}

/// Sending side of a spawned manager's inbox.
#[derive(Clone)]
pub struct ManagerHandle {
   inbox: mpsc::Sender<ManagerRequest>,
}

impl ManagerHandle {
   /// Submits `command` and waits for its synchronous reply.
   pub async fn request(&self, command: Command) -> Result<CommandReply> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerRequest {
            command,
            reply: Some(tx),
         })
         .await
         .map_err(|_| CentralError::ManagerShutdown)?;
      rx.await.map_err(|_| CentralError::ManagerShutdown)?
   }

   /// Submits `command` without waiting for the reply.
   pub async fn submit(&self, command: Command) -> Result<()> {
      self
         .inbox
         .send(ManagerRequest {
            command,
            reply: None,
         })
         .await
         .map_err(|_| CentralError::ManagerShutdown)
   }
}

// === Manager ===

struct ManagerInner {
   driver: Arc<dyn BleDriver>,
   events: EventSender,
   config: Config,
   registry: ConnectionRegistry,
   scanner: AdvertisementScanner,
   watcher: PairedDeviceWatcher,
}

/// Top-level entry point of the central role.
#[derive(Clone)]
pub struct SessionManager {
   inner: Arc<ManagerInner>,
}

impl SessionManager {
   pub fn new(driver: Arc<dyn BleDriver>, events: EventSender, config: Config) -> Self {
      let scanner = AdvertisementScanner::new(
         driver.clone(),
         events.clone(),
         config.in_range_threshold_dbm,
         config.out_of_range_threshold_dbm,
      );
      let watcher = PairedDeviceWatcher::new(driver.clone(), events.clone());
      Self {
         inner: Arc::new(ManagerInner {
            driver,
            events,
            config,
            registry: ConnectionRegistry::new(),
            scanner,
            watcher,
         }),
      }
   }

   /// Runs the manager on its own task. Returns its inbox and the task, which
   /// finishes once shutdown has run.
   pub fn spawn(self) -> (ManagerHandle, JoinHandle<()>) {
      let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
      let serving = tokio::spawn(self.serve(rx));
      (ManagerHandle { inbox: tx }, serving)
   }

   /// Serves requests until every sender is gone, then shuts down.
   pub async fn serve(self, mut inbox: mpsc::Receiver<ManagerRequest>) {
      info!("Session manager starting up");
      while let Some(ManagerRequest { command, reply }) = inbox.recv().await {
         let name = command.name();
         let outcome = self.dispatch(command).await;
         if let Err(e) = &outcome {
            warn!("{name} rejected: {e}");
         }
         if let Some(reply) = reply {
            let _ = reply.send(outcome);
         }
      }
      info!("Session manager shutting down");
      self.shutdown();
   }

   pub fn registry(&self) -> &ConnectionRegistry {
      &self.inner.registry
   }

   pub fn scanner(&self) -> &AdvertisementScanner {
      &self.inner.scanner
   }

   pub fn watcher(&self) -> &PairedDeviceWatcher {
      &self.inner.watcher
   }

   /// Handles one command. Returns once the command is validated and its
   /// work, if any, has been spawned.
   pub async fn dispatch(&self, command: Command) -> Result<CommandReply> {
      debug!("Dispatching {}", command.name());
      let inner = &self.inner;
      match command {
         Command::IsBluetoothAvailable => {
            Ok(CommandReply::Available(inner.driver.radio_available().await))
         },
         Command::StartScanPairedDevices => {
            inner.watcher.start()?;
            Ok(CommandReply::Done)
         },
         Command::StopScanPairedDevices => {
            inner.watcher.stop()?;
            Ok(CommandReply::Done)
         },
         Command::StartScan { service_uuid } => {
            let filter = service_uuid
               .as_deref()
               .map(str::trim)
               .filter(|uuid| !uuid.is_empty())
               .map(parse_uuid)
               .transpose()?;
            inner.scanner.start(filter)?;
            Ok(CommandReply::Done)
         },
         Command::StopScan => {
            inner.scanner.stop();
            Ok(CommandReply::Done)
         },
         Command::Connect { device_id } => {
            self.connect(DeviceAddress::from_device_id(&device_id)?)?;
            Ok(CommandReply::Done)
         },
         Command::Disconnect { device_id } => {
            self.disconnect(DeviceAddress::from_device_id(&device_id)?);
            Ok(CommandReply::Done)
         },
         Command::DiscoverServices { device_id } => {
            let address = DeviceAddress::from_device_id(&device_id)?;
            let session = inner.registry.require(address)?;
            self.spawn_operation(Operation::DiscoverServices, address, None, async move {
               let services = session.discover().await?;
               info!("Discovered {} services on {address}", services.len());
               Ok(Some(CentralEvent::ServicesDiscovered {
                  device_id: address,
                  services,
               }))
            });
            Ok(CommandReply::Done)
         },
         Command::SetNotifiable {
            device_id,
            service,
            characteristic,
            mode,
         } => {
            let address = DeviceAddress::from_device_id(&device_id)?;
            let session = inner.registry.require(address)?;
            let (service, characteristic) = (parse_uuid(&service)?, parse_uuid(&characteristic)?);
            let events = inner.events.clone();
            let request = session.notify_request();
            self.spawn_operation(
               Operation::SetNotifiable,
               address,
               Some(characteristic),
               async move {
                  session
                     .set_notifiable(request, service, characteristic, mode, &events)
                     .await?;
                  Ok(None)
               },
            );
            Ok(CommandReply::Done)
         },
         Command::RequestMtu {
            device_id,
            expected_mtu,
         } => {
            let address = DeviceAddress::from_device_id(&device_id)?;
            let session = inner.registry.require(address)?;
            self.spawn_operation(Operation::RequestMtu, address, None, async move {
               let mtu = session.max_pdu_size(expected_mtu).await?;
               info!("MTU for {address} is {mtu} (asked for {expected_mtu})");
               Ok(Some(CentralEvent::Mtu {
                  device_id: address,
                  mtu,
               }))
            });
            Ok(CommandReply::Done)
         },
         Command::ReadValue {
            device_id,
            service,
            characteristic,
         } => {
            let address = DeviceAddress::from_device_id(&device_id)?;
            let session = inner.registry.require(address)?;
            let (service, characteristic) = (parse_uuid(&service)?, parse_uuid(&characteristic)?);
            self.spawn_operation(
               Operation::ReadValue,
               address,
               Some(characteristic),
               async move {
                  let value = session.read_value(service, characteristic).await?;
                  Ok(Some(CentralEvent::CharacteristicValue {
                     device_id: address,
                     characteristic,
                     value,
                  }))
               },
            );
            Ok(CommandReply::Done)
         },
         Command::WriteValue {
            device_id,
            service,
            characteristic,
            value,
            mode,
         } => {
            let address = DeviceAddress::from_device_id(&device_id)?;
            let session = inner.registry.require(address)?;
            let (service, characteristic) = (parse_uuid(&service)?, parse_uuid(&characteristic)?);
            self.spawn_operation(
               Operation::WriteValue,
               address,
               Some(characteristic),
               async move {
                  session
                     .write_value(service, characteristic, &value, mode)
                     .await?;
                  Ok(Some(CentralEvent::WriteAck {
                     device_id: address,
                     characteristic,
                     mode,
                  }))
               },
            );
            Ok(CommandReply::Done)
         },
         Command::GetConnectedDevices => {
            Ok(CommandReply::ConnectedDevices(inner.registry.connected()))
         },
         Command::DeviceState { device_id } => {
            let address = DeviceAddress::from_device_id(&device_id)?;
            Ok(CommandReply::DeviceState(inner.registry.state(address)))
         },
      }
   }

   /// Reserves `address` and spawns the native connect.
   ///
   /// The outcome arrives as a `connectionState` event.
   pub fn connect(&self, address: DeviceAddress) -> Result<()> {
      let ticket = self.inner.registry.reserve(address)?;
      info!("Connecting to {address}");
      tokio::spawn(self.inner.clone().establish(address, ticket));
      Ok(())
   }

   /// Caller-initiated disconnect. Emits `disconnected` even when there was
   /// nothing to disconnect.
   pub fn disconnect(&self, address: DeviceAddress) {
      self.inner.disconnect(address, true);
   }

   /// Stops discovery and disconnects every device.
   pub fn shutdown(&self) {
      let inner = &self.inner;
      inner.scanner.stop();
      if let Err(e) = inner.watcher.stop() {
         warn!("Failed to stop paired-device watcher: {e}");
      }
      for (address, entry) in inner.registry.drain() {
         if let RegistryEntry::Connected(session) = entry {
            session.teardown(true);
         }
         inner.events.emit(CentralEvent::disconnected(address));
      }
   }

   /// Runs `task` under the operation timeout. Its event, or a failure
   /// event, goes to the sink.
   fn spawn_operation<F>(
      &self,
      operation: Operation,
      address: DeviceAddress,
      characteristic: Option<Uuid>,
      task: F,
   ) where
      F: Future<Output = Result<Option<CentralEvent>>> + Send + 'static,
   {
      let events = self.inner.events.clone();
      let limit = self.inner.config.operation_timeout();
      tokio::spawn(async move {
         let outcome = match time::timeout(limit, task).await {
            Ok(outcome) => outcome,
            Err(_) => Err(CentralError::RequestTimeout),
         };
         match outcome {
            Ok(Some(event)) => events.emit(event),
            Ok(None) => {},
            Err(e) => {
               error!("{operation} on {address} failed: {e}");
               events.emit(CentralEvent::OperationFailed {
                  device_id: address,
                  operation,
                  characteristic,
                  error: e.to_string(),
               });
            },
         }
      });
   }
}

impl ManagerInner {
   async fn establish(self: Arc<Self>, address: DeviceAddress, ticket: u64) {
      let deadline = Instant::now() + self.config.connect_timeout();
      let session = match self.open_session(address, ticket, deadline).await {
         Ok(session) => session,
         Err(e) => {
            warn!("Connect to {address} failed: {e}");
            if self.registry.release_reservation(address, ticket) {
               self.events.emit(CentralEvent::disconnected(address));
            }
            return;
         },
      };

      session.set_state(ConnectionState::Connected);
      match self.registry.install(session) {
         Ok(()) => {
            info!("Connected to {address}");
            self.events.emit(CentralEvent::connected(address));
         },
         Err(session) => {
            info!("Connect to {address} was cancelled");
            session.teardown(true);
         },
      }
   }

   async fn open_session(
      self: &Arc<Self>,
      address: DeviceAddress,
      ticket: u64,
      deadline: Instant,
   ) -> Result<Arc<DeviceSession>> {
      let device = time::timeout_at(deadline, self.driver.open_device(address))
         .await
         .map_err(|_| CentralError::RequestTimeout)??;

      // One enumeration proves the device is reachable.
      let checked = match time::timeout_at(deadline, self.driver.services(&device)).await {
         Ok(Ok(services)) => {
            debug!("{address} exposes {} services", services.len());
            Ok(())
         },
         Ok(Err(e)) => Err(e.into()),
         Err(_) => Err(CentralError::RequestTimeout),
      };
      if let Err(e) = checked {
         self.driver.close_device(&device);
         return Err(e);
      }

      let session = Arc::new(DeviceSession::new(
         self.driver.clone(),
         device.clone(),
         ticket,
      ));
      let handler = link_handler(Arc::downgrade(self), address, ticket);
      match self.driver.subscribe_connection_status(&device, handler) {
         Ok(token) => session.set_status_token(token),
         Err(e) => {
            self.driver.close_device(&device);
            return Err(e.into());
         },
      }
      Ok(session)
   }

   fn disconnect(&self, address: DeviceAddress, dispose: bool) {
      match self.registry.remove(address) {
         Some(RegistryEntry::Connected(session)) => {
            session.teardown(dispose);
         },
         Some(RegistryEntry::Connecting { .. }) => {
            info!("Cancelled pending connect to {address}");
         },
         None => debug!("Disconnect for {address} without a session"),
      }
      self.events.emit(CentralEvent::disconnected(address));
   }

   /// Unsolicited link loss. Only tears down the generation that registered
   /// the callback.
   fn on_link_lost(&self, address: DeviceAddress, ticket: u64) {
      match self.registry.remove_if(address, ticket) {
         Some(RegistryEntry::Connected(session)) => {
            info!("{address} disconnected by the remote side");
            session.teardown(false);
         },
         Some(RegistryEntry::Connecting { .. }) => {
            info!("{address} dropped the link while connecting");
         },
         None => {
            debug!("Ignoring link loss for {address}: session already gone");
            return;
         },
      }
      self.events.emit(CentralEvent::disconnected(address));
   }
}

fn link_handler(
   inner: Weak<ManagerInner>,
   address: DeviceAddress,
   ticket: u64,
) -> ConnectionStatusHandler {
   Arc::new(move |status: LinkStatus| {
      if status == LinkStatus::Disconnected
         && let Some(inner) = inner.upgrade()
      {
         inner.on_link_lost(address, ticket);
      }
   })
}

#[cfg(test)]
mod tests {
   use std::time::Duration;

   use super::*;
   use crate::{
      bluetooth::{
         driver::ClientConfiguration,
         stub::{RecordingBus, StubDriver},
      },
      central::uuid::from_short,
      command::{NotifyMode, WriteMode},
      event::LinkState,
   };

   const HEART_RATE: Uuid = from_short(0x180d);
   const MEASUREMENT: Uuid = from_short(0x2a37);
   const CONTROL_POINT: Uuid = from_short(0x2a39);

   fn address() -> DeviceAddress {
      DeviceAddress::new(0x0011_2233_4455).unwrap()
   }

   fn device_id() -> String {
      address().device_id()
   }

   fn setup() -> (Arc<StubDriver>, Arc<RecordingBus>, SessionManager) {
      setup_with(Config::default())
   }

   fn setup_with(config: Config) -> (Arc<StubDriver>, Arc<RecordingBus>, SessionManager) {
      let driver = Arc::new(StubDriver::new());
      driver.add_device(address(), &[(HEART_RATE, &[MEASUREMENT, CONTROL_POINT])]);
      let bus = Arc::new(RecordingBus::default());
      let manager = SessionManager::new(driver.clone(), bus.clone(), config);
      (driver, bus, manager)
   }

   fn is_state(event: &CentralEvent, wanted: LinkState) -> bool {
      matches!(event, CentralEvent::ConnectionState { device_id, state }
         if *device_id == address() && *state == wanted)
   }

   fn disconnected_events(bus: &RecordingBus) -> usize {
      bus.count(|e| is_state(e, LinkState::Disconnected))
   }

   async fn connect(manager: &SessionManager, bus: &RecordingBus) {
      let reply = manager
         .dispatch(Command::Connect {
            device_id: device_id(),
         })
         .await
         .unwrap();
      assert_eq!(reply, CommandReply::Done);
      bus.wait_for(|e| is_state(e, LinkState::Connected)).await;
   }

   /// Polls `cond` until it holds. Panics after two seconds.
   async fn settle(cond: impl Fn() -> bool) {
      for _ in 0..400 {
         if cond() {
            return;
         }
         time::sleep(Duration::from_millis(5)).await;
      }
      panic!("condition never held");
   }

   fn set_notifiable(characteristic: &str, mode: NotifyMode) -> Command {
      Command::SetNotifiable {
         device_id: device_id(),
         service: "180d".into(),
         characteristic: characteristic.into(),
         mode,
      }
   }

   #[tokio::test]
   async fn test_disconnect_without_session_emits_once() {
      let (_driver, bus, manager) = setup();
      let reply = manager
         .dispatch(Command::Disconnect {
            device_id: device_id(),
         })
         .await
         .unwrap();
      assert_eq!(reply, CommandReply::Done);
      assert_eq!(disconnected_events(&bus), 1);
      assert_eq!(bus.events().len(), 1);
   }

   #[tokio::test]
   async fn test_second_connect_is_rejected() {
      let (_driver, bus, manager) = setup();
      manager.connect(address()).unwrap();
      assert!(matches!(
         manager.connect(address()),
         Err(CentralError::AlreadyConnected(a)) if a == address()
      ));

      bus.wait_for(|e| is_state(e, LinkState::Connected)).await;
      assert!(matches!(
         manager
            .dispatch(Command::Connect {
               device_id: device_id(),
            })
            .await,
         Err(CentralError::AlreadyConnected(_))
      ));
   }

   #[tokio::test]
   async fn test_connect_installs_session_and_resolution_is_cached() {
      let (driver, bus, manager) = setup();
      connect(&manager, &bus).await;
      assert_eq!(manager.registry().state(address()), ConnectionState::Connected);
      assert_eq!(
         manager.dispatch(Command::GetConnectedDevices).await.unwrap(),
         CommandReply::ConnectedDevices(vec![address()])
      );

      let session = manager.registry().get(address()).unwrap();
      let before = driver.service_enumerations();
      let first = session.gatt().resolve_service(HEART_RATE).await.unwrap();
      let second = session.gatt().resolve_service(HEART_RATE).await.unwrap();
      assert_eq!(first, second);
      assert_eq!(driver.service_enumerations(), before + 1);
   }

   #[tokio::test]
   async fn test_end_to_end_characteristic_resolution() {
      let (driver, bus, manager) = setup();
      connect(&manager, &bus).await;
      let session = manager.registry().get(address()).unwrap();

      let first = session
         .gatt()
         .resolve_characteristic(HEART_RATE, MEASUREMENT)
         .await
         .unwrap();
      let enumerations = (driver.service_enumerations(), driver.characteristic_enumerations());
      let second = session
         .gatt()
         .resolve_characteristic(HEART_RATE, MEASUREMENT)
         .await
         .unwrap();
      assert_eq!(first, second);
      assert_eq!(first.uuid, MEASUREMENT);
      assert_eq!(
         (driver.service_enumerations(), driver.characteristic_enumerations()),
         enumerations
      );
   }

   #[tokio::test]
   async fn test_disable_after_notify_stops_value_events() {
      let (driver, bus, manager) = setup();
      connect(&manager, &bus).await;

      manager
         .dispatch(set_notifiable("2a37", NotifyMode::Notify))
         .await
         .unwrap();
      settle(|| driver.value_subscriptions(address()) == 1).await;
      driver.notify_value(address(), MEASUREMENT, &[0x00, 0x48]);
      bus.wait_for(|e| matches!(e, CentralEvent::CharacteristicValue { .. }))
         .await;

      manager
         .dispatch(set_notifiable("2a37", NotifyMode::Disabled))
         .await
         .unwrap();
      settle(|| driver.value_subscriptions(address()) == 0).await;
      assert_eq!(driver.notify_value(address(), MEASUREMENT, &[0x00, 0x49]), 0);
      assert_eq!(
         bus.count(|e| matches!(e, CentralEvent::CharacteristicValue { .. })),
         1
      );
   }

   #[tokio::test]
   async fn test_disconnect_releases_every_subscription() {
      let (driver, bus, manager) = setup();
      connect(&manager, &bus).await;
      for characteristic in ["2a37", "2a39"] {
         manager
            .dispatch(set_notifiable(characteristic, NotifyMode::Notify))
            .await
            .unwrap();
      }
      settle(|| driver.value_subscriptions(address()) == 2).await;

      manager
         .dispatch(Command::Disconnect {
            device_id: device_id(),
         })
         .await
         .unwrap();
      assert_eq!(driver.value_unsubscribes(), 2);
      assert_eq!(driver.status_unsubscribes(), 1);
      assert_eq!(driver.closes(), 1);
      assert!(manager.registry().get(address()).is_none());
      assert_eq!(disconnected_events(&bus), 1);
   }

   #[tokio::test]
   async fn test_unsolicited_disconnect_tears_down() {
      let (driver, bus, manager) = setup();
      connect(&manager, &bus).await;
      manager
         .dispatch(set_notifiable("2a37", NotifyMode::Indicate))
         .await
         .unwrap();
      settle(|| driver.value_subscriptions(address()) == 1).await;

      driver.drop_link(address());
      assert!(manager.registry().get(address()).is_none());
      assert_eq!(
         manager.registry().state(address()),
         ConnectionState::Disconnected
      );
      assert_eq!(driver.value_unsubscribes(), 1);
      assert_eq!(driver.status_subscriptions(address()), 0);
      assert_eq!(driver.closes(), 0, "handle is already gone");
      assert_eq!(disconnected_events(&bus), 1);

      driver.drop_link(address());
      assert_eq!(disconnected_events(&bus), 1);
   }

   #[tokio::test]
   async fn test_connect_failures_emit_disconnected() {
      let (driver, bus, manager) = setup();
      let stranger = DeviceAddress::new(0x0A0B_0C0D_0E0F).unwrap();
      manager.connect(stranger).unwrap();
      bus.wait_for(|e| matches!(e, CentralEvent::ConnectionState { device_id, state: LinkState::Disconnected } if *device_id == stranger))
         .await;
      assert_eq!(manager.registry().state(stranger), ConnectionState::Disconnected);

      driver.fail_services();
      connect_expecting_failure(&manager, &bus).await;
      assert_eq!(driver.closes(), 1);
      assert!(manager.registry().get(address()).is_none());
   }

   async fn connect_expecting_failure(manager: &SessionManager, bus: &RecordingBus) {
      manager.connect(address()).unwrap();
      bus.wait_for(|e| is_state(e, LinkState::Disconnected)).await;
      assert_eq!(bus.count(|e| is_state(e, LinkState::Connected)), 0);
   }

   #[tokio::test]
   async fn test_disconnect_while_connecting_cancels() {
      let (driver, bus, manager) = setup();
      let gate = driver.gate_open();
      manager.connect(address()).unwrap();
      assert_eq!(
         manager
            .dispatch(Command::DeviceState {
               device_id: device_id(),
            })
            .await
            .unwrap(),
         CommandReply::DeviceState(ConnectionState::Connecting)
      );
      assert!(matches!(
         manager
            .dispatch(Command::ReadValue {
               device_id: device_id(),
               service: "180d".into(),
               characteristic: "2a37".into(),
            })
            .await,
         Err(CentralError::UnknownDevice(_))
      ));

      manager.disconnect(address());
      gate.notify_one();
      settle(|| driver.closes() == 1).await;

      assert_eq!(driver.status_unsubscribes(), 1);
      assert_eq!(manager.registry().state(address()), ConnectionState::Disconnected);
      assert_eq!(bus.count(|e| is_state(e, LinkState::Connected)), 0);
      assert_eq!(disconnected_events(&bus), 1);
   }

   #[tokio::test]
   async fn test_descriptor_failure_still_subscribes() {
      let (driver, bus, manager) = setup();
      driver.fail_configuration();
      connect(&manager, &bus).await;
      manager
         .dispatch(set_notifiable("2a37", NotifyMode::Notify))
         .await
         .unwrap();
      settle(|| driver.value_subscriptions(address()) == 1).await;
      driver.notify_value(address(), MEASUREMENT, &[0x01]);
      bus.wait_for(|e| matches!(e, CentralEvent::CharacteristicValue { value, .. } if value == &[0x01]))
         .await;
      assert_eq!(
         bus.count(|e| matches!(e, CentralEvent::OperationFailed { .. })),
         0
      );
   }

   #[tokio::test]
   async fn test_read_write_and_mtu_report_events() {
      let (driver, bus, manager) = setup();
      driver.set_value(MEASUREMENT, &[0x06, 0x40]);
      driver.set_mtu(185);
      connect(&manager, &bus).await;

      manager
         .dispatch(Command::ReadValue {
            device_id: device_id(),
            service: "180d".into(),
            characteristic: "00002a37-0000-1000-8000-00805f9b34fb".into(),
         })
         .await
         .unwrap();
      let read = bus
         .wait_for(|e| matches!(e, CentralEvent::CharacteristicValue { .. }))
         .await;
      assert_eq!(
         read,
         CentralEvent::CharacteristicValue {
            device_id: address(),
            characteristic: MEASUREMENT,
            value: vec![0x06, 0x40],
         }
      );

      manager
         .dispatch(Command::WriteValue {
            device_id: device_id(),
            service: "180d".into(),
            characteristic: "2a39".into(),
            value: vec![0x01],
            mode: WriteMode::WithoutResponse,
         })
         .await
         .unwrap();
      bus.wait_for(|e| matches!(e, CentralEvent::WriteAck { characteristic, mode: WriteMode::WithoutResponse, .. } if *characteristic == CONTROL_POINT))
         .await;
      assert_eq!(
         driver.writes(),
         vec![(CONTROL_POINT, vec![0x01], WriteMode::WithoutResponse)]
      );

      manager
         .dispatch(Command::RequestMtu {
            device_id: device_id(),
            expected_mtu: 512,
         })
         .await
         .unwrap();
      let mtu = bus
         .wait_for(|e| matches!(e, CentralEvent::Mtu { .. }))
         .await;
      assert_eq!(
         mtu,
         CentralEvent::Mtu {
            device_id: address(),
            mtu: 185,
         }
      );
   }

   #[tokio::test]
   async fn test_failed_read_reports_operation_failed() {
      let (driver, bus, manager) = setup();
      driver.fail_read();
      connect(&manager, &bus).await;
      manager
         .dispatch(Command::ReadValue {
            device_id: device_id(),
            service: "180d".into(),
            characteristic: "2a37".into(),
         })
         .await
         .unwrap();
      let failure = bus
         .wait_for(|e| matches!(e, CentralEvent::OperationFailed { .. }))
         .await;
      assert!(matches!(
         failure,
         CentralEvent::OperationFailed {
            operation: Operation::ReadValue,
            characteristic: Some(c),
            ..
         } if c == MEASUREMENT
      ));

      manager
         .dispatch(Command::ReadValue {
            device_id: device_id(),
            service: "180d".into(),
            characteristic: "2aff".into(),
         })
         .await
         .unwrap();
      settle(|| bus.count(|e| matches!(e, CentralEvent::OperationFailed { .. })) == 2).await;
   }

   #[tokio::test]
   async fn test_discover_services() {
      let (_driver, bus, manager) = setup();
      connect(&manager, &bus).await;
      manager
         .dispatch(Command::DiscoverServices {
            device_id: device_id(),
         })
         .await
         .unwrap();
      let discovered = bus
         .wait_for(|e| matches!(e, CentralEvent::ServicesDiscovered { .. }))
         .await;
      let CentralEvent::ServicesDiscovered { services, .. } = discovered else {
         unreachable!();
      };
      assert_eq!(services.len(), 1);
      assert_eq!(services[0].uuid, HEART_RATE);
      assert_eq!(services[0].characteristics, vec![MEASUREMENT, CONTROL_POINT]);
   }

   #[tokio::test]
   async fn test_validation_errors_are_synchronous() {
      let (_driver, _bus, manager) = setup();
      assert!(matches!(
         manager
            .dispatch(Command::ReadValue {
               device_id: device_id(),
               service: "180d".into(),
               characteristic: "2a37".into(),
            })
            .await,
         Err(CentralError::UnknownDevice(a)) if a == address()
      ));
      assert!(matches!(
         manager
            .dispatch(Command::Connect {
               device_id: "not a number".into(),
            })
            .await,
         Err(CentralError::InvalidAddress(_))
      ));
      assert!(matches!(
         manager
            .dispatch(Command::StartScan {
               service_uuid: Some("zz".into()),
            })
            .await,
         Err(CentralError::InvalidUuid(_))
      ));
   }

   #[tokio::test]
   async fn test_scan_commands() {
      let (driver, _bus, manager) = setup();
      manager
         .dispatch(Command::StartScan {
            service_uuid: Some(String::new()),
         })
         .await
         .unwrap();
      assert_eq!(driver.scan_settings().unwrap().service_filter, None);
      assert_eq!(driver.scan_settings().unwrap().in_range_threshold_dbm, -70);

      manager
         .dispatch(Command::StartScan {
            service_uuid: Some("180d".into()),
         })
         .await
         .unwrap();
      assert_eq!(
         driver.scan_settings().unwrap().service_filter,
         Some(HEART_RATE)
      );
      assert_eq!(driver.advertisement_subscriptions(), 1);

      manager.dispatch(Command::StopScan).await.unwrap();
      assert!(!manager.scanner().is_scanning());
      assert_eq!(driver.advertisement_subscriptions(), 0);

      manager
         .dispatch(Command::StartScanPairedDevices)
         .await
         .unwrap();
      assert_eq!(driver.paired_enumeration_starts(), 1);
      manager.dispatch(Command::StopScanPairedDevices).await.unwrap();
      assert_eq!(driver.paired_enumeration_stops(), 1);
   }

   #[tokio::test]
   async fn test_spawned_manager_serves_and_shuts_down() {
      let (driver, bus, manager) = setup();
      let (handle, serving) = manager.clone().spawn();
      assert_eq!(
         handle.request(Command::IsBluetoothAvailable).await.unwrap(),
         CommandReply::Available(true)
      );
      handle
         .submit(Command::StartScan { service_uuid: None })
         .await
         .unwrap();
      handle
         .request(Command::Connect {
            device_id: device_id(),
         })
         .await
         .unwrap();
      bus.wait_for(|e| is_state(e, LinkState::Connected)).await;

      drop(handle);
      serving.await.unwrap();
      assert!(manager.registry().connected().is_empty());
      assert!(!manager.scanner().is_scanning(), "shutdown stops the scan");
      assert_eq!(driver.closes(), 1);
      assert_eq!(disconnected_events(&bus), 1);
   }

   #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
   async fn test_back_to_back_notify_commands_keep_order() {
      let (driver, bus, manager) = setup();
      connect(&manager, &bus).await;

      for _ in 0..20 {
         manager
            .dispatch(set_notifiable("2a37", NotifyMode::Notify))
            .await
            .unwrap();
         manager
            .dispatch(set_notifiable("2a37", NotifyMode::Disabled))
            .await
            .unwrap();
      }
      let disabled = (MEASUREMENT, ClientConfiguration::None);
      settle(|| driver.configurations().last() == Some(&disabled)).await;
      time::sleep(Duration::from_millis(50)).await;

      assert_eq!(driver.value_subscriptions(address()), 0);
      assert_eq!(driver.configurations().last(), Some(&disabled));
      let session = manager.registry().get(address()).unwrap();
      assert!(session.notifying().is_empty());
   }

   #[tokio::test]
   async fn test_connect_timeout_releases_reservation() {
      let (driver, bus, manager) = setup_with(Config {
         connect_timeout_sec: 1,
         ..Config::default()
      });
      let _gate = driver.gate_open();
      manager.connect(address()).unwrap();
      bus.wait_for(|e| is_state(e, LinkState::Disconnected)).await;

      assert_eq!(manager.registry().state(address()), ConnectionState::Disconnected);
      assert_eq!(bus.count(|e| is_state(e, LinkState::Connected)), 0);
      assert_eq!(driver.status_subscriptions(address()), 0);

      connect(&manager, &bus).await;
      assert_eq!(manager.registry().state(address()), ConnectionState::Connected);
   }

   #[tokio::test]
   async fn test_operation_timeout_reports_request_timeout() {
      let (driver, bus, manager) = setup_with(Config {
         operation_timeout_sec: 1,
         ..Config::default()
      });
      driver.hang_reads();
      connect(&manager, &bus).await;

      manager
         .dispatch(Command::ReadValue {
            device_id: device_id(),
            service: "180d".into(),
            characteristic: "2a37".into(),
         })
         .await
         .unwrap();
      let failure = bus
         .wait_for(|e| matches!(e, CentralEvent::OperationFailed { .. }))
         .await;
      assert_eq!(
         failure,
         CentralEvent::OperationFailed {
            device_id: address(),
            operation: Operation::ReadValue,
            characteristic: Some(MEASUREMENT),
            error: CentralError::RequestTimeout.to_string(),
         }
      );
      assert_eq!(manager.registry().state(address()), ConnectionState::Connected);
   }

   #[tokio::test]
   async fn test_radio_off() {
      let (driver, _bus, manager) = setup();
      driver.set_radio_off();
      assert_eq!(
         manager.dispatch(Command::IsBluetoothAvailable).await.unwrap(),
         CommandReply::Available(false)
      );
      assert!(matches!(
         manager.dispatch(Command::StartScan { service_uuid: None }).await,
         Err(CentralError::Driver(_))
      ));
      assert!(matches!(
         manager.dispatch(Command::StartScanPairedDevices).await,
         Err(CentralError::Driver(_))
      ));
      assert_eq!(driver.advertisement_subscriptions(), 0);
      assert_eq!(driver.paired_subscriptions(), 0);
   }
}
