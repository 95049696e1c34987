//! Fixed-capacity table of link records.
//!
//! The table is sized once from configuration. Slots are never
//! allocated or freed; a slot whose address is all-zero is free. Running
//! out of slots is a provisioning defect, not a runtime condition.

use std::fmt;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{
   address::{TransportMask, TypedAddress},
   controller::DisconnectReason,
   device::AddressResolver,
   error::{LinkError, Result},
   link::{
      qos::{ConnParams, QosHistogram},
      state::{LinkLock, LinkState},
   },
};

/// Controller power mode last reported for a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PowerMode {
   #[default]
   Active,
   Sniff,
}

/// One link slot.
#[derive(Clone, PartialEq, Eq)]
pub struct LinkRecord {
   slot: usize,
   pub address: TypedAddress,
   state: LinkState,
   lock: LinkLock,
   /// Local users holding the link open.
   pub users: u16,
   /// We asked for this link, rather than the remote.
   pub local: bool,
   pub qos: QosHistogram,
   /// Parameters last applied to the link.
   pub params: Option<ConnParams>,
   pub power_mode: PowerMode,
   pub disconnect_reason: Option<DisconnectReason>,
}

impl LinkRecord {
   pub const fn free(slot: usize) -> Self {
      Self {
         slot,
         address: TypedAddress::EMPTY,
         state: LinkState::Disconnected,
         lock: LinkLock::NONE,
         users: 0,
         local: false,
         qos: QosHistogram::new(),
         params: None,
         power_mode: PowerMode::Active,
         disconnect_reason: None,
      }
   }

   pub const fn slot(&self) -> usize {
      self.slot
   }

   pub const fn state(&self) -> LinkState {
      self.state
   }

   pub const fn lock(&self) -> LinkLock {
      self.lock
   }

   pub const fn is_free(&self) -> bool {
      self.address.is_empty()
   }

   /// Moves to `state` and recomputes the lock.
   pub fn set_state(&mut self, state: LinkState) {
      if self.state != state {
         debug!("link {} [{}]: {} -> {state}", self.address, self.slot, self.state);
      }
      self.state = state;
      self.lock = state.lock();
   }

   fn reset(&mut self) {
      *self = Self::free(self.slot);
   }

   /// Externally observable view of the record.
   pub fn image(&self) -> LinkImage {
      LinkImage {
         address: self.address,
         state: self.state,
         users: self.users,
         local: self.local,
         qos: self.qos,
         params: self.params,
      }
   }
}

impl fmt::Debug for LinkRecord {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("LinkRecord")
         .field("slot", &self.slot)
         .field("address", &format_args!("{}", self.address))
         .field("state", &self.state)
         .field("lock", &self.lock.bits())
         .field("users", &self.users)
         .field("local", &self.local)
         .finish_non_exhaustive()
   }
}

/// Transferable copy of a link record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkImage {
   pub address: TypedAddress,
   pub state: LinkState,
   pub users: u16,
   pub local: bool,
   pub qos: QosHistogram,
   pub params: Option<ConnParams>,
}

fn same_link(a: &TypedAddress, b: &TypedAddress) -> bool {
   a.transport == b.transport && a.addr == b.addr
}

/// The link table.
#[derive(Debug, Clone)]
pub struct Registry {
   slots: Box<[LinkRecord]>,
}

impl Registry {
   pub fn new(capacity: usize) -> Self {
      Self {
         slots: (0..capacity).map(LinkRecord::free).collect(),
      }
   }

   pub fn capacity(&self) -> usize {
      self.slots.len()
   }

   fn normalize(addr: &TypedAddress, resolver: &dyn AddressResolver) -> TypedAddress {
      if addr.needs_resolution() {
         resolver.resolve(addr).unwrap_or(*addr)
      } else {
         *addr
      }
   }

   fn position(&self, addr: &TypedAddress, resolver: &dyn AddressResolver) -> Option<usize> {
      if addr.is_empty() {
         return None;
      }
      let wanted = Self::normalize(addr, resolver);
      self
         .slots
         .iter()
         .position(|r| !r.is_free() && (same_link(&r.address, &wanted) || same_link(&r.address, addr)))
   }

   /// Looks up the record for `addr`, resolving random addresses first.
   pub fn find(&self, addr: &TypedAddress, resolver: &dyn AddressResolver) -> Option<&LinkRecord> {
      self.position(addr, resolver).map(|i| &self.slots[i])
   }

   pub fn find_mut(
      &mut self,
      addr: &TypedAddress,
      resolver: &dyn AddressResolver,
   ) -> Option<&mut LinkRecord> {
      self.position(addr, resolver).map(|i| &mut self.slots[i])
   }

   pub fn get(&self, slot: usize) -> Option<&LinkRecord> {
      self.slots.get(slot).filter(|r| !r.is_free())
   }

   pub fn get_mut(&mut self, slot: usize) -> Option<&mut LinkRecord> {
      self.slots.get_mut(slot).filter(|r| !r.is_free())
   }

   /// Lock of the link for `addr`; clear when there is no record.
   pub fn lock(&self, addr: &TypedAddress, resolver: &dyn AddressResolver) -> LinkLock {
      self.find(addr, resolver).map_or(LinkLock::NONE, LinkRecord::lock)
   }

   /// Updates the record for `addr`, or claims one.
   ///
   /// Claims a free slot first, then reclaims a record left behind by a
   /// link loss. Fails with [`LinkError::RegistryFull`] otherwise.
   pub fn add_or_update(
      &mut self,
      addr: &TypedAddress,
      state: LinkState,
      local: bool,
      resolver: &dyn AddressResolver,
   ) -> Result<&mut LinkRecord> {
      let index = match self.position(addr, resolver) {
         Some(index) => index,
         None => {
            let index = self
               .slots
               .iter()
               .position(LinkRecord::is_free)
               .or_else(|| {
                  self
                     .slots
                     .iter()
                     .position(|r| r.state() == LinkState::DisconnectedLinkLoss)
               })
               .ok_or(LinkError::RegistryFull {
                  capacity: self.slots.len(),
               })?;
            let record = &mut self.slots[index];
            if !record.is_free() {
               info!("Reclaiming link-loss record {} for {addr}", record.address);
            }
            record.reset();
            record.address = Self::normalize(addr, resolver);
            index
         },
      };
      let record = &mut self.slots[index];
      record.local = local;
      record.set_state(state);
      Ok(record)
   }

   /// First connected or connecting link on one of the masked transports.
   pub fn first_active(&self, mask: TransportMask) -> Option<&LinkRecord> {
      self
         .iter()
         .find(|r| r.state().is_active() && mask.contains(r.address.transport))
   }

   /// Returns the slot to its free state.
   pub fn remove(&mut self, slot: usize) {
      if let Some(record) = self.slots.get_mut(slot) {
         debug!("link {} [{slot}]: removed", record.address);
         record.reset();
      }
   }

   /// Live records.
   pub fn iter(&self) -> impl Iterator<Item = &LinkRecord> {
      self.slots.iter().filter(|r| !r.is_free())
   }

   pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut LinkRecord> {
      self.slots.iter_mut().filter(|r| !r.is_free())
   }

   pub fn len(&self) -> usize {
      self.iter().count()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      address::{BdAddr, Transport},
      device::{MemoryDevices, NoResolver},
   };

   const HANDSET: BdAddr = BdAddr([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13]);
   const RPA: BdAddr = BdAddr([0x4A, 0x11, 0x22, 0x33, 0x44, 0x55]);

   fn addr(last: u8) -> TypedAddress {
      TypedAddress::bredr(BdAddr([0x10, 0, 0, 0, 0, last]))
   }

   #[test]
   fn test_find_after_add() {
      let mut reg = Registry::new(4);
      for i in 1..=4 {
         let slot = reg
            .add_or_update(&addr(i), LinkState::Connected, false, &NoResolver)
            .unwrap()
            .slot();
         assert_eq!(reg.find(&addr(i), &NoResolver).map(LinkRecord::slot), Some(slot));
      }
      assert_eq!(reg.len(), 4);
      assert!(reg.find(&addr(9), &NoResolver).is_none());
   }

   #[test]
   fn test_update_existing_keeps_slot() {
      let mut reg = Registry::new(2);
      let first = reg
         .add_or_update(&addr(1), LinkState::ConnectingLocalInitiated, true, &NoResolver)
         .unwrap()
         .slot();
      let record = reg
         .add_or_update(&addr(1), LinkState::Connected, true, &NoResolver)
         .unwrap();
      assert_eq!(record.slot(), first);
      assert_eq!(record.state(), LinkState::Connected);
      assert!(record.lock().is_clear());
      assert_eq!(reg.len(), 1);
   }

   #[test]
   fn test_transports_are_separate_links() {
      let mut reg = Registry::new(2);
      reg.add_or_update(&TypedAddress::bredr(HANDSET), LinkState::Connected, false, &NoResolver)
         .unwrap();
      reg.add_or_update(&TypedAddress::le_public(HANDSET), LinkState::Connected, false, &NoResolver)
         .unwrap();
      assert_eq!(reg.len(), 2);
      assert_eq!(
         reg.first_active(TransportMask::LE).map(|r| r.address.transport),
         Some(Transport::Le)
      );
   }

   #[test]
   fn test_random_address_resolves_to_public_record() {
      let devices = MemoryDevices::new();
      devices.add_resolvable(RPA, HANDSET);

      let mut reg = Registry::new(2);
      let slot = reg
         .add_or_update(&TypedAddress::le_public(HANDSET), LinkState::Connected, false, &devices)
         .unwrap()
         .slot();

      let found = reg.find(&TypedAddress::le_random(RPA), &devices).unwrap();
      assert_eq!(found.slot(), slot);
      assert_eq!(found.address.addr, HANDSET);

      // Without the resolver the random address is unknown.
      assert!(reg.find(&TypedAddress::le_random(RPA), &NoResolver).is_none());
   }

   #[test]
   fn test_add_with_random_address_stores_public() {
      let devices = MemoryDevices::new();
      devices.add_resolvable(RPA, HANDSET);
      let mut reg = Registry::new(1);
      reg.add_or_update(&TypedAddress::le_random(RPA), LinkState::Connected, false, &devices)
         .unwrap();
      assert!(reg.find(&TypedAddress::le_public(HANDSET), &devices).is_some());
   }

   #[test]
   fn test_full_registry_reclaims_link_loss() {
      let mut reg = Registry::new(2);
      reg.add_or_update(&addr(1), LinkState::Connected, false, &NoResolver)
         .unwrap();
      reg.add_or_update(&addr(2), LinkState::DisconnectedLinkLoss, false, &NoResolver)
         .unwrap();

      let record = reg
         .add_or_update(&addr(3), LinkState::ConnectingLocalInitiated, true, &NoResolver)
         .unwrap();
      assert_eq!(record.address, addr(3));
      assert!(record.qos.is_empty());
      assert!(reg.find(&addr(2), &NoResolver).is_none());
   }

   #[test]
   fn test_full_registry_errors() {
      let mut reg = Registry::new(1);
      reg.add_or_update(&addr(1), LinkState::Connected, false, &NoResolver)
         .unwrap();
      let err = reg
         .add_or_update(&addr(2), LinkState::Connected, false, &NoResolver)
         .unwrap_err();
      assert!(matches!(err, LinkError::RegistryFull { capacity: 1 }));
   }

   #[test]
   fn test_remove_zeroes_record() {
      let mut reg = Registry::new(3);
      let record = reg
         .add_or_update(&addr(1), LinkState::Connected, true, &NoResolver)
         .unwrap();
      record.users = 2;
      let slot = record.slot();
      reg.remove(slot);
      assert!(reg.get(slot).is_none());
      assert_eq!(reg.slots[slot], LinkRecord::free(slot));
      assert!(reg.is_empty());
   }

   #[test]
   fn test_first_active_skips_disconnected() {
      let mut reg = Registry::new(3);
      reg.add_or_update(&addr(1), LinkState::DisconnectedLinkLoss, false, &NoResolver)
         .unwrap();
      assert!(reg.first_active(TransportMask::ALL).is_none());
      reg.add_or_update(&addr(2), LinkState::ConnectingInternal, true, &NoResolver)
         .unwrap();
      assert_eq!(
         reg.first_active(TransportMask::BREDR).map(|r| r.address),
         Some(addr(2))
      );
      assert!(reg.first_active(TransportMask::LE).is_none());
   }
}
