//! Per-connection memo of resolved GATT handles.
//!
//! Entries are only ever added. The whole cache is dropped together with the
//! session that owns it. Concurrent misses for the same UUID may both hit the
//! driver; whichever insert lands last wins, as all handles for one UUID are
//! interchangeable.

use std::{collections::HashMap, sync::Arc};

use log::{debug, warn};
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::{
   bluetooth::driver::{BleDriver, CharacteristicHandle, DeviceHandle, ServiceHandle},
   central::uuid::serialize_canonical,
   error::{CentralError, Result},
};

/// One service and the characteristics it exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredService {
   #[serde(serialize_with = "serialize_canonical")]
   pub uuid: Uuid,
   pub characteristics: Vec<Uuid>,
}

pub struct GattCache {
   driver: Arc<dyn BleDriver>,
   device: DeviceHandle,
   services: RwLock<HashMap<Uuid, ServiceHandle>>,
   characteristics: RwLock<HashMap<(Uuid, Uuid), CharacteristicHandle>>,
}

impl GattCache {
   pub fn new(driver: Arc<dyn BleDriver>, device: DeviceHandle) -> Self {
      Self {
         driver,
         device,
         services: RwLock::new(HashMap::new()),
         characteristics: RwLock::new(HashMap::new()),
      }
   }

   pub async fn resolve_service(&self, uuid: Uuid) -> Result<ServiceHandle> {
      let cached = self.services.read().get(&uuid).cloned();
      if let Some(service) = cached {
         return Ok(service);
      }

      let services = self.driver.services(&self.device).await.map_err(|e| {
         warn!("Service enumeration on {} failed: {e}", self.device.address);
         CentralError::ServiceNotFound(uuid)
      })?;
      let service = services
         .into_iter()
         .find(|service| service.uuid == uuid)
         .ok_or(CentralError::ServiceNotFound(uuid))?;

      debug!("Resolved service {uuid} on {}", self.device.address);
      self.services.write().insert(uuid, service.clone());
      Ok(service)
   }

   pub async fn resolve_characteristic(
      &self,
      service: Uuid,
      characteristic: Uuid,
   ) -> Result<CharacteristicHandle> {
      let key = (service, characteristic);
      let cached = self.characteristics.read().get(&key).cloned();
      if let Some(handle) = cached {
         return Ok(handle);
      }

      let service_handle = self.resolve_service(service).await?;
      let not_found = || CentralError::CharacteristicNotFound {
         service,
         characteristic,
      };
      let handles = self
         .driver
         .characteristics(&service_handle)
         .await
         .map_err(|e| {
            warn!("Characteristic enumeration of {service} failed: {e}");
            not_found()
         })?;
      let handle = handles
         .into_iter()
         .find(|handle| handle.uuid == characteristic)
         .ok_or_else(not_found)?;

      debug!("Resolved characteristic {characteristic} in {service}");
      self.characteristics.write().insert(key, handle.clone());
      Ok(handle)
   }

   /// Enumerates every service and characteristic, caching anything not yet
   /// resolved.
   pub async fn populate(&self) -> Result<Vec<DiscoveredService>> {
      let services = self.driver.services(&self.device).await?;
      let mut discovered = Vec::with_capacity(services.len());

      for service in services {
         let handles = self.driver.characteristics(&service).await?;
         let characteristics = handles.iter().map(|handle| handle.uuid).collect();
         {
            let mut cache = self.characteristics.write();
            for handle in handles {
               cache.entry((service.uuid, handle.uuid)).or_insert(handle);
            }
         }
         discovered.push(DiscoveredService {
            uuid: service.uuid,
            characteristics,
         });
         self.services.write().entry(service.uuid).or_insert(service);
      }

      Ok(discovered)
   }

   /// Number of cached services and characteristics.
   pub fn cached(&self) -> (usize, usize) {
      (self.services.read().len(), self.characteristics.read().len())
   }
}
