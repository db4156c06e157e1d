//! Paired-device enumeration.
//!
//! Stopping is two-phase: [`PairedDeviceWatcher::stop`] only asks the
//! platform to stop, and the registration plus the record table are released
//! once the platform confirms with a `stopped` event. Membership events that
//! arrive while the watcher is not running are dropped.

use std::{
   collections::HashMap,
   sync::{Arc, Weak},
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use smol_str::SmolStr;

use crate::{
   bluetooth::driver::{BleDriver, SubscriptionToken, WatcherEvent, WatcherHandler},
   central::address::DeviceAddress,
   error::{CentralError, Result},
   event::{CentralEvent, EventSender},
};

/// Lifecycle of the enumeration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum WatcherStatus {
   Created,
   Started,
   EnumerationCompleted,
   Stopping,
   Stopped,
   Aborted,
}

impl WatcherStatus {
   /// Membership events are forwarded only in these states.
   pub const fn is_started(self) -> bool {
      matches!(self, Self::Started | Self::EnumerationCompleted)
   }
}

/// A bonded device known to the current watcher session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairedDeviceRecord {
   pub system_id: SmolStr,
   pub address: DeviceAddress,
   pub name: SmolStr,
   pub is_connected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PairedDeviceChange {
   Added {
      system_id: SmolStr,
      name: SmolStr,
      is_connected: bool,
      address: DeviceAddress,
   },
   Updated {
      system_id: SmolStr,
      is_connected: bool,
   },
   Removed {
      system_id: SmolStr,
      is_connected: bool,
   },
   EnumerationCompleted,
   Stopped,
}

/// A watcher event tagged with the watcher status at the time it was handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairedDeviceEvent {
   pub status: WatcherStatus,
   #[serde(flatten)]
   pub change: PairedDeviceChange,
}

struct WatcherState {
   status: WatcherStatus,
   token: Option<SubscriptionToken>,
   records: HashMap<SmolStr, PairedDeviceRecord>,
}

struct WatcherInner {
   driver: Arc<dyn BleDriver>,
   events: EventSender,
   state: Mutex<WatcherState>,
}

/// Drives enumeration of already-bonded devices.
#[derive(Clone)]
pub struct PairedDeviceWatcher(Arc<WatcherInner>);

impl PairedDeviceWatcher {
   pub fn new(driver: Arc<dyn BleDriver>, events: EventSender) -> Self {
      Self(Arc::new(WatcherInner {
         driver,
         events,
         state: Mutex::new(WatcherState {
            status: WatcherStatus::Created,
            token: None,
            records: HashMap::new(),
         }),
      }))
   }

   pub fn start(&self) -> Result<()> {
      let inner = &self.0;
      {
         let mut state = inner.state.lock();
         match state.status {
            status if status.is_started() => return Ok(()),
            WatcherStatus::Stopping => return Err(CentralError::WatcherStopping),
            _ => {},
         }
         if state.token.is_none() {
            let handler = Self::handler(Arc::downgrade(inner));
            state.token = Some(inner.driver.subscribe_paired_devices(handler)?);
         }
         state.records.clear();
         state.status = WatcherStatus::Started;
      }

      if let Err(e) = inner.driver.start_paired_enumeration() {
         warn!("Failed to start paired-device enumeration: {e}");
         let token = {
            let mut state = inner.state.lock();
            state.status = WatcherStatus::Aborted;
            state.token.take()
         };
         if let Some(token) = token {
            inner.driver.unsubscribe_paired_devices(token);
         }
         return Err(e.into());
      }

      info!("Paired-device enumeration started");
      Ok(())
   }

   /// Requests a stop. Internal state is released on the `stopped` event.
   pub fn stop(&self) -> Result<()> {
      let inner = &self.0;
      let previous = {
         let mut state = inner.state.lock();
         if !state.status.is_started() {
            return Ok(());
         }
         std::mem::replace(&mut state.status, WatcherStatus::Stopping)
      };

      if let Err(e) = inner.driver.stop_paired_enumeration() {
         warn!("Failed to stop paired-device enumeration: {e}");
         let mut state = inner.state.lock();
         if state.status == WatcherStatus::Stopping {
            state.status = previous;
         }
         return Err(e.into());
      }

      info!("Paired-device enumeration stopping");
      Ok(())
   }

   pub fn status(&self) -> WatcherStatus {
      self.0.state.lock().status
   }

   /// Snapshot of the devices known to the current session.
   pub fn records(&self) -> Vec<PairedDeviceRecord> {
      let mut records: Vec<_> = self.0.state.lock().records.values().cloned().collect();
      records.sort_by(|a, b| a.system_id.cmp(&b.system_id));
      records
   }

   fn handler(inner: Weak<WatcherInner>) -> WatcherHandler {
      Arc::new(move |event: WatcherEvent| {
         if let Some(inner) = inner.upgrade() {
            inner.on_platform_event(event);
         }
      })
   }
}

impl WatcherInner {
   fn on_platform_event(&self, event: WatcherEvent) {
      let mut released = None;
      let forwarded = {
         let mut state = self.state.lock();
         let change = match event {
            WatcherEvent::Added {
               system_id,
               name,
               address,
               is_connected,
            } => {
               if !state.status.is_started() {
                  debug!("Dropping paired-device add for {system_id}: watcher not running");
                  return;
               }
               let address = match address.parse::<DeviceAddress>() {
                  Ok(address) => address,
                  Err(e) => {
                     warn!("Ignoring paired device {system_id}: {e}");
                     return;
                  },
               };
               let record = PairedDeviceRecord {
                  system_id: system_id.into(),
                  address,
                  name: name.into(),
                  is_connected,
               };
               state.records.insert(record.system_id.clone(), record.clone());
               PairedDeviceChange::Added {
                  system_id: record.system_id,
                  name: record.name,
                  is_connected,
                  address,
               }
            },
            WatcherEvent::Updated {
               system_id,
               is_connected,
            } => {
               if !state.status.is_started() {
                  debug!("Dropping paired-device update for {system_id}: watcher not running");
                  return;
               }
               let system_id = SmolStr::from(system_id);
               if let Some(record) = state.records.get_mut(&system_id) {
                  record.is_connected = is_connected;
               }
               PairedDeviceChange::Updated {
                  system_id,
                  is_connected,
               }
            },
            WatcherEvent::Removed {
               system_id,
               is_connected,
            } => {
               if !state.status.is_started() {
                  debug!("Dropping paired-device removal for {system_id}: watcher not running");
                  return;
               }
               let system_id = SmolStr::from(system_id);
               state.records.remove(&system_id);
               PairedDeviceChange::Removed {
                  system_id,
                  is_connected,
               }
            },
            WatcherEvent::EnumerationCompleted => {
               if state.status == WatcherStatus::Started {
                  state.status = WatcherStatus::EnumerationCompleted;
               }
               info!(
                  "Paired-device enumeration completed with {} devices",
                  state.records.len()
               );
               PairedDeviceChange::EnumerationCompleted
            },
            WatcherEvent::Stopped => {
               state.status = WatcherStatus::Stopped;
               state.records.clear();
               released = state.token.take();
               info!("Paired-device enumeration stopped");
               PairedDeviceChange::Stopped
            },
         };
         PairedDeviceEvent {
            status: state.status,
            change,
         }
      };

      if let Some(token) = released {
         self.driver.unsubscribe_paired_devices(token);
      }
      self.events.emit(CentralEvent::PairedDevice(forwarded));
   }
}
