//! Address to session map.
//!
//! The registry is the only authority on whether a device is connected.
//! A connect first reserves the address with a ticket; the session created by
//! that connect can only be installed while the reservation is still there.
//! Removing an entry is the point of no return for a disconnect.

use std::{
   collections::HashMap,
   sync::{
      Arc,
      atomic::{AtomicU64, Ordering},
   },
};

use parking_lot::RwLock;

use crate::{
   central::{
      address::DeviceAddress,
      session::{ConnectionState, DeviceSession},
   },
   error::{CentralError, Result},
};

pub enum RegistryEntry {
   Connecting { ticket: u64 },
   Connected(Arc<DeviceSession>),
}

impl RegistryEntry {
   pub fn ticket(&self) -> u64 {
      match self {
         Self::Connecting { ticket } => *ticket,
         Self::Connected(session) => session.ticket(),
      }
   }
}

pub struct ConnectionRegistry {
   entries: RwLock<HashMap<DeviceAddress, RegistryEntry>>,
   next_ticket: AtomicU64,
}

impl Default for ConnectionRegistry {
   fn default() -> Self {
      Self::new()
   }
}

impl ConnectionRegistry {
   pub fn new() -> Self {
      Self {
         entries: RwLock::new(HashMap::new()),
         next_ticket: AtomicU64::new(1),
      }
   }

   /// Reserves `address` for a connect in progress.
   pub fn reserve(&self, address: DeviceAddress) -> Result<u64> {
      let mut entries = self.entries.write();
      if entries.contains_key(&address) {
         return Err(CentralError::AlreadyConnected(address));
      }
      let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
      entries.insert(address, RegistryEntry::Connecting { ticket });
      Ok(ticket)
   }

   /// Replaces the matching reservation with `session`. Hands the session
   /// back when the reservation is gone.
   pub fn install(
      &self,
      session: Arc<DeviceSession>,
   ) -> std::result::Result<(), Arc<DeviceSession>> {
      let mut entries = self.entries.write();
      match entries.get(&session.address()) {
         Some(RegistryEntry::Connecting { ticket }) if *ticket == session.ticket() => {
            entries.insert(session.address(), RegistryEntry::Connected(session));
            Ok(())
         },
         _ => Err(session),
      }
   }

   /// Drops a reservation that never became a session.
   pub fn release_reservation(&self, address: DeviceAddress, ticket: u64) -> bool {
      let mut entries = self.entries.write();
      match entries.get(&address) {
         Some(RegistryEntry::Connecting { ticket: held }) if *held == ticket => {
            entries.remove(&address);
            true
         },
         _ => false,
      }
   }

   pub fn get(&self, address: DeviceAddress) -> Option<Arc<DeviceSession>> {
      match self.entries.read().get(&address) {
         Some(RegistryEntry::Connected(session)) => Some(session.clone()),
         _ => None,
      }
   }

   /// Like [`get`](Self::get), failing with `UnknownDevice`.
   pub fn require(&self, address: DeviceAddress) -> Result<Arc<DeviceSession>> {
      self.get(address).ok_or(CentralError::UnknownDevice(address))
   }

   pub fn remove(&self, address: DeviceAddress) -> Option<RegistryEntry> {
      self.entries.write().remove(&address)
   }

   /// Removes the entry only if it still belongs to `ticket`.
   pub fn remove_if(&self, address: DeviceAddress, ticket: u64) -> Option<RegistryEntry> {
      let mut entries = self.entries.write();
      if entries.get(&address)?.ticket() != ticket {
         return None;
      }
      entries.remove(&address)
   }

   pub fn state(&self, address: DeviceAddress) -> ConnectionState {
      match self.entries.read().get(&address) {
         Some(RegistryEntry::Connecting { .. }) => ConnectionState::Connecting,
         Some(RegistryEntry::Connected(session)) => session.state(),
         None => ConnectionState::Disconnected,
      }
   }

   /// Addresses with an installed session, in ascending order.
   pub fn connected(&self) -> Vec<DeviceAddress> {
      let mut addresses: Vec<_> = self
         .entries
         .read()
         .iter()
         .filter_map(|(address, entry)| {
            matches!(entry, RegistryEntry::Connected(_)).then_some(*address)
         })
         .collect();
      addresses.sort_unstable();
      addresses
   }

   /// Removes every entry.
   pub fn drain(&self) -> Vec<(DeviceAddress, RegistryEntry)> {
      self.entries.write().drain().collect()
   }
}
