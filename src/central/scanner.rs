//! Advertisement scanning.
//!
//! The scanner owns at most one advertisement registration with the driver.
//! Restarting only reconfigures the scan; stopping releases the registration.
//! Frames still in flight when a stop lands are discarded by the handler's
//! state check.

use std::{
   collections::{BTreeSet, HashSet},
   sync::{Arc, Weak},
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{
   bluetooth::driver::{
      Advertisement, AdvertisementHandler, BleDriver, ManufacturerData, ScanSettings,
      SubscriptionToken,
   },
   central::address::DeviceAddress,
   error::Result,
   event::{CentralEvent, EventSender},
};

/// One parsed advertisement, emitted once per received frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
   pub name: SmolStr,
   #[serde(rename = "deviceId")]
   pub address: DeviceAddress,
   pub manufacturer_data: Vec<u8>,
   pub rssi: i16,
   pub advertised_service_uuids: BTreeSet<Uuid>,
}

impl ScanResult {
   pub fn from_advertisement(adv: Advertisement) -> Self {
      let name = match adv.local_name {
         Some(name) if !name.is_empty() => SmolStr::from(name),
         _ => SmolStr::from(adv.address.short_hex()),
      };
      Self {
         name,
         address: adv.address,
         manufacturer_data: manufacturer_payload(&adv.manufacturer_data),
         rssi: adv.rssi,
         advertised_service_uuids: adv.service_uuids.into_iter().collect(),
      }
   }
}

/// First manufacturer section, prefixed with its little-endian company id.
pub fn manufacturer_payload(sections: &[ManufacturerData]) -> Vec<u8> {
   let Some(first) = sections.first() else {
      return Vec::new();
   };
   let mut payload = Vec::with_capacity(2 + first.data.len());
   payload.extend_from_slice(&first.company_id.to_le_bytes());
   payload.extend_from_slice(&first.data);
   payload
}

/// In-range/out-of-range hysteresis on RSSI, tracked per address.
#[derive(Debug)]
struct SignalFilter {
   in_range: i16,
   out_of_range: i16,
   visible: HashSet<DeviceAddress>,
}

impl SignalFilter {
   fn new(in_range: i16, out_of_range: i16) -> Self {
      Self {
         in_range,
         out_of_range,
         visible: HashSet::new(),
      }
   }

   fn admit(&mut self, address: DeviceAddress, rssi: i16) -> bool {
      if rssi >= self.in_range {
         self.visible.insert(address);
         true
      } else if rssi < self.out_of_range {
         self.visible.remove(&address);
         false
      } else {
         self.visible.contains(&address)
      }
   }
}

struct ScannerState {
   token: Option<SubscriptionToken>,
   active: bool,
   filter: Option<Uuid>,
   signal: SignalFilter,
}

struct ScannerInner {
   driver: Arc<dyn BleDriver>,
   events: EventSender,
   in_range_threshold_dbm: i16,
   out_of_range_threshold_dbm: i16,
   state: Mutex<ScannerState>,
}

/// Drives device discovery by advertisement.
#[derive(Clone)]
pub struct AdvertisementScanner(Arc<ScannerInner>);

impl AdvertisementScanner {
   pub fn new(
      driver: Arc<dyn BleDriver>,
      events: EventSender,
      in_range_threshold_dbm: i16,
      out_of_range_threshold_dbm: i16,
   ) -> Self {
      Self(Arc::new(ScannerInner {
         driver,
         events,
         in_range_threshold_dbm,
         out_of_range_threshold_dbm,
         state: Mutex::new(ScannerState {
            token: None,
            active: false,
            filter: None,
            signal: SignalFilter::new(in_range_threshold_dbm, out_of_range_threshold_dbm),
         }),
      }))
   }

   /// Starts scanning, or replaces the filter of an active scan.
   pub fn start(&self, filter: Option<Uuid>) -> Result<()> {
      let inner = &self.0;
      let settings = ScanSettings {
         service_filter: filter,
         in_range_threshold_dbm: inner.in_range_threshold_dbm,
         out_of_range_threshold_dbm: inner.out_of_range_threshold_dbm,
      };

      {
         let mut state = inner.state.lock();
         state.filter = filter;
         state.signal = SignalFilter::new(
            inner.in_range_threshold_dbm,
            inner.out_of_range_threshold_dbm,
         );
         if state.token.is_none() {
            let handler = Self::handler(Arc::downgrade(inner));
            state.token = Some(inner.driver.subscribe_advertisements(handler)?);
         }
         state.active = true;
      }

      if let Err(e) = inner.driver.start_scan(&settings) {
         warn!("Failed to start advertisement scan: {e}");
         self.release();
         return Err(e.into());
      }

      match filter {
         Some(uuid) => info!("Advertisement scan started, filtering on {uuid}"),
         None => info!("Advertisement scan started"),
      }
      Ok(())
   }

   /// Stops scanning. Safe to call when not scanning.
   pub fn stop(&self) {
      if self.release() {
         info!("Advertisement scan stopped");
      }
   }

   pub fn is_scanning(&self) -> bool {
      self.0.state.lock().active
   }

   fn release(&self) -> bool {
      let token = {
         let mut state = self.0.state.lock();
         state.active = false;
         state.token.take()
      };
      let Some(token) = token else {
         return false;
      };
      if let Err(e) = self.0.driver.stop_scan() {
         warn!("Failed to stop advertisement scan: {e}");
      }
      self.0.driver.unsubscribe_advertisements(token);
      true
   }

   fn handler(inner: Weak<ScannerInner>) -> AdvertisementHandler {
      Arc::new(move |adv: Advertisement| {
         if let Some(inner) = inner.upgrade() {
            inner.on_advertisement(adv);
         }
      })
   }
}

impl ScannerInner {
   fn on_advertisement(&self, adv: Advertisement) {
      {
         let mut state = self.state.lock();
         if !state.active {
            debug!("Dropping advertisement from {} after stop", adv.address);
            return;
         }
         if let Some(filter) = state.filter
            && !adv.service_uuids.contains(&filter)
         {
            return;
         }
         if !state.signal.admit(adv.address, adv.rssi) {
            return;
         }
      }

      self
         .events
         .emit(CentralEvent::ScanResult(ScanResult::from_advertisement(adv)));
   }
}
