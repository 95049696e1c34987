//! Per-link state machine.
//!
//! The manager reacts to local requests and controller indications,
//! keeps the registry and QoS state current and queues the controller
//! calls and link events that follow. It never talks to the controller
//! itself: the dispatcher drains [`LinkManager::take_actions`] after
//! every call and executes them in order.

use std::{mem, sync::Arc};

use log::{debug, info, warn};

use crate::{
   address::{BdAddr, Transport, TransportMask, TypedAddress},
   controller::{ControllerEvent, DisconnectReason},
   device::DeviceRegistry,
   error::{Status, fatal},
   handover::{HandoverParticipant, MarshalData, MarshalType, Role, Unmarshalled},
   link::{
      qos::{ConnParams, QosEngine, QosLevel},
      registry::{LinkImage, LinkRecord, Registry},
      state::{LinkLock, LinkState},
   },
   notify::Notifier,
};

/// Work the dispatcher performs on the manager's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
   Open(TypedAddress),
   Close { addr: TypedAddress, force: bool },
   SetDefaultParams(ConnParams),
   UpdateParams { addr: TypedAddress, params: ConnParams },
   SetConnectable(bool),
   /// Delivered back through [`LinkManager::on_internal`] on the next turn.
   Internal(LinkInternal),
   /// Routed to the sessions and the mirror.
   Event(LinkEvent),
}

/// Messages the manager queues to itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkInternal {
   Open(TypedAddress),
}

/// Link outcomes for the rest of the core. Addresses are the ones stored
/// in the registry, so random addresses arrive resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
   Connected { addr: TypedAddress, incoming: bool },
   ConnectFailed { addr: TypedAddress, status: Status },
   Disconnected { addr: TypedAddress, reason: DisconnectReason },
}

impl LinkEvent {
   pub const fn addr(&self) -> &TypedAddress {
      match self {
         Self::Connected { addr, .. }
         | Self::ConnectFailed { addr, .. }
         | Self::Disconnected { addr, .. } => addr,
      }
   }
}

pub struct LinkManager {
   registry: Registry,
   qos: QosEngine,
   notifier: Notifier,
   devices: Arc<dyn DeviceRegistry>,
   local_addr: BdAddr,
   peer_addr: BdAddr,
   connectable: bool,
   actions: Vec<LinkAction>,
}

impl LinkManager {
   pub fn new(
      capacity: usize,
      qos: QosEngine,
      devices: Arc<dyn DeviceRegistry>,
      local_addr: BdAddr,
      peer_addr: BdAddr,
   ) -> Self {
      Self {
         registry: Registry::new(capacity),
         qos,
         notifier: Notifier::new(),
         devices,
         local_addr,
         peer_addr,
         connectable: false,
         actions: Vec::new(),
      }
   }

   /// Drains the queued actions.
   pub fn take_actions(&mut self) -> Vec<LinkAction> {
      if let Some(params) = self.qos.take_resync() {
         self.actions.push(LinkAction::SetDefaultParams(params));
      }
      mem::take(&mut self.actions)
   }

   pub fn registry(&self) -> &Registry {
      &self.registry
   }

   pub fn qos(&self) -> &QosEngine {
      &self.qos
   }

   pub fn qos_mut(&mut self) -> &mut QosEngine {
      &mut self.qos
   }

   pub fn notifier_mut(&mut self) -> &mut Notifier {
      &mut self.notifier
   }

   pub const fn local_addr(&self) -> BdAddr {
      self.local_addr
   }

   pub const fn peer_addr(&self) -> BdAddr {
      self.peer_addr
   }

   pub const fn is_connectable(&self) -> bool {
      self.connectable
   }

   /// The link to the other earbud.
   pub fn is_peer(&self, addr: &TypedAddress) -> bool {
      addr.transport == Transport::BrEdr && addr.addr == self.peer_addr
   }

   pub fn find(&self, addr: &TypedAddress) -> Option<&LinkRecord> {
      self.registry.find(addr, &*self.devices)
   }

   pub fn lock(&self, addr: &TypedAddress) -> LinkLock {
      self.registry.lock(addr, &*self.devices)
   }

   pub fn state(&self, addr: &TypedAddress) -> LinkState {
      self.find(addr).map_or(LinkState::Disconnected, LinkRecord::state)
   }

   pub fn is_connected(&self, addr: &TypedAddress) -> bool {
      self.state(addr) == LinkState::Connected
   }

   /// Any live handset link on the masked transports.
   pub fn handset_link(&self, mask: TransportMask) -> Option<&LinkRecord> {
      self
         .registry
         .iter()
         .find(|r| {
            r.state().is_active() && mask.contains(r.address.transport) && !self.is_peer(&r.address)
         })
   }

   pub fn images(&self) -> Vec<LinkImage> {
      self.registry.iter().map(LinkRecord::image).collect()
   }

   fn claim<'a>(
      registry: &'a mut Registry,
      devices: &dyn DeviceRegistry,
      addr: &TypedAddress,
      state: LinkState,
      local: bool,
   ) -> &'a mut LinkRecord {
      match registry.add_or_update(addr, state, local, devices) {
         Ok(record) => record,
         Err(e) => fatal(e),
      }
   }

   // === Local requests ===

   /// Takes a user reference on the link to `addr`, opening it if needed.
   ///
   /// The controller call is not made here: the record goes to
   /// `ConnectingInternal` and the open is queued back to the manager so
   /// the parameters are fixed first.
   pub fn connect(&mut self, addr: TypedAddress) {
      if let Some(record) = self.registry.find_mut(&addr, &*self.devices) {
         let state = record.state();
         if state.is_active() {
            record.users = record.users.saturating_add(1);
            debug!("link {addr}: user added ({} users, {state})", record.users);
            if state == LinkState::Connected {
               let addr = record.address;
               self
                  .actions
                  .push(LinkAction::Event(LinkEvent::Connected { addr, incoming: false }));
            }
            return;
         }
      }
      let record = Self::claim(
         &mut self.registry,
         &*self.devices,
         &addr,
         LinkState::ConnectingInternal,
         true,
      );
      record.users = 1;
      let stored = record.address;
      self
         .actions
         .push(LinkAction::Internal(LinkInternal::Open(stored)));
   }

   /// Drops a user reference. A locally opened link is closed with its
   /// last user.
   pub fn release(&mut self, addr: &TypedAddress) {
      let Some(record) = self.registry.find_mut(addr, &*self.devices) else {
         debug!("link {addr}: release without record");
         return;
      };
      record.users = record.users.saturating_sub(1);
      if record.users == 0 && record.local && record.state().is_active() {
         self.disconnect(addr, false);
      }
   }

   /// Closes the link regardless of its users.
   pub fn disconnect(&mut self, addr: &TypedAddress, force: bool) {
      let Some(record) = self.registry.find_mut(addr, &*self.devices) else {
         debug!("link {addr}: disconnect without record");
         return;
      };
      let stored = record.address;
      match record.state() {
         LinkState::ConnectingInternal => {
            // Not yet handed to the controller.
            let slot = record.slot();
            self.registry.remove(slot);
            self.actions.push(LinkAction::Event(LinkEvent::ConnectFailed {
               addr: stored,
               status: Status::Cancelled,
            }));
         },
         LinkState::Connected => {
            record.users = 0;
            self.notifier.disconnect_requested(stored);
            self
               .actions
               .push(LinkAction::Close { addr: stored, force });
         },
         state if state.is_connecting() => {
            record.users = 0;
            self
               .actions
               .push(LinkAction::Close { addr: stored, force });
         },
         _ => {},
      }
   }

   /// Delivery of a message queued through [`LinkAction::Internal`].
   pub fn on_internal(&mut self, msg: LinkInternal) {
      match msg {
         LinkInternal::Open(addr) => {
            let default = self.qos.default_params();
            let Some(record) = self.registry.find_mut(&addr, &*self.devices) else {
               debug!("link {addr}: open dropped, record gone");
               return;
            };
            if record.state() != LinkState::ConnectingInternal {
               debug!("link {addr}: open dropped in {}", record.state());
               return;
            }
            let wanted = addr
               .is_le()
               .then(|| self.qos.params(self.qos.effective(&record.qos)))
               .filter(|p| *p != default);
            record.set_state(LinkState::ConnectingLocalInitiated);
            match wanted {
               Some(params) => {
                  record.params = Some(params);
                  self.actions.extend([
                     LinkAction::SetDefaultParams(params),
                     LinkAction::Open(addr),
                     LinkAction::SetDefaultParams(default),
                  ]);
               },
               None => self.actions.push(LinkAction::Open(addr)),
            }
         },
      }
   }

   // === Controller indications ===

   pub fn on_controller(&mut self, event: ControllerEvent) {
      match event {
         ControllerEvent::ConnectRequested { addr } => {
            if let Some(record) = self.registry.find(&addr, &*self.devices)
               && record.state().is_active()
            {
               debug!("link {addr}: remote open crosses {}", record.state());
               return;
            }
            Self::claim(
               &mut self.registry,
               &*self.devices,
               &addr,
               LinkState::ConnectingControllerInitiated,
               false,
            );
         },
         ControllerEvent::Connected { addr, incoming, status } => {
            if status.is_success() {
               self.on_connected(addr, incoming);
            } else {
               self.on_connect_failed(addr, status);
            }
         },
         ControllerEvent::Disconnected { addr, reason } => self.on_disconnected(addr, reason),
      }
   }

   fn on_connected(&mut self, addr: TypedAddress, incoming: bool) {
      let existing = self.registry.find(&addr, &*self.devices);
      if existing.is_some_and(|r| r.state() == LinkState::Connected) {
         debug!("link {addr}: duplicate connect indication");
         return;
      }
      let local = existing.map_or(!incoming, |r| r.local && r.state().is_connecting());
      let record = Self::claim(
         &mut self.registry,
         &*self.devices,
         &addr,
         LinkState::Connected,
         local,
      );
      record.disconnect_reason = None;
      let stored = record.address;
      let update = self.qos.apply(record);
      info!("Link {stored} connected ({})", if incoming { "incoming" } else { "outgoing" });

      self.notifier.connected(stored, incoming);
      if let Some(params) = update {
         self
            .actions
            .push(LinkAction::UpdateParams { addr: stored, params });
         self.notifier.params_changed(stored, params);
      }
      self
         .actions
         .push(LinkAction::Event(LinkEvent::Connected { addr: stored, incoming }));
   }

   fn on_connect_failed(&mut self, addr: TypedAddress, status: Status) {
      let Some(record) = self.registry.find(&addr, &*self.devices) else {
         debug!("link {addr}: connect failure without record");
         return;
      };
      if record.state() == LinkState::Connected {
         warn!("link {addr}: connect failure on connected link ignored");
         return;
      }
      let (slot, stored) = (record.slot(), record.address);
      info!("Link {stored} failed to connect: {status}");
      self.registry.remove(slot);
      self
         .actions
         .push(LinkAction::Event(LinkEvent::ConnectFailed { addr: stored, status }));
   }

   fn on_disconnected(&mut self, addr: TypedAddress, reason: DisconnectReason) {
      let Some(record) = self.registry.find_mut(&addr, &*self.devices) else {
         debug!("link {addr}: disconnect without record");
         return;
      };
      let was = record.state();
      let stored = record.address;
      if reason == DisconnectReason::LinkLoss {
         record.set_state(LinkState::DisconnectedLinkLoss);
         record.disconnect_reason = Some(reason);
         record.users = 0;
         record.params = None;
      } else {
         let slot = record.slot();
         self.registry.remove(slot);
      }
      info!("Link {stored} disconnected ({reason:?})");

      let event = match was {
         LinkState::Connected => {
            self.notifier.disconnected(stored, reason);
            LinkEvent::Disconnected { addr: stored, reason }
         },
         state if state.is_connecting() => LinkEvent::ConnectFailed {
            addr: stored,
            status: if reason == DisconnectReason::LinkLoss {
               Status::LinkLoss
            } else {
               Status::Failure
            },
         },
         _ => return,
      };
      self.actions.push(LinkAction::Event(event));
   }

   // === QoS ===

   fn signal(&mut self, addr: TypedAddress, params: Option<ConnParams>) {
      if let Some(params) = params {
         self.actions.push(LinkAction::UpdateParams { addr, params });
         self.notifier.params_changed(addr, params);
      }
   }

   pub fn request_qos(&mut self, addr: &TypedAddress, level: QosLevel) {
      let Some(record) = self.registry.find_mut(addr, &*self.devices) else {
         warn!("QoS {level} requested on unknown link {addr}");
         return;
      };
      let update = self.qos.request(record, level);
      let stored = record.address;
      self.signal(stored, update);
   }

   pub fn release_qos(&mut self, addr: &TypedAddress, level: QosLevel) {
      let Some(record) = self.registry.find_mut(addr, &*self.devices) else {
         warn!("QoS {level} released on unknown link {addr}");
         return;
      };
      let update = self.qos.release(record, level);
      let stored = record.address;
      self.signal(stored, update);
   }

   pub fn request_default_qos(&mut self, level: QosLevel) {
      if let Some(params) = self.qos.request_default(level) {
         self.actions.push(LinkAction::SetDefaultParams(params));
      }
   }

   /// Moves the ceiling and re-applies every link.
   pub fn set_qos_ceiling(&mut self, level: QosLevel) {
      self.qos.set_ceiling(level);
      let updates: Vec<_> = self
         .registry
         .iter_mut()
         .filter_map(|record| {
            let address = record.address;
            self.qos.apply(record).map(|params| (address, params))
         })
         .collect();
      for (addr, params) in updates {
         self.signal(addr, Some(params));
      }
   }

   // === Connectable ===

   pub fn set_handset_connectable(&mut self, connectable: bool) {
      if self.connectable == connectable {
         return;
      }
      info!("Handset connectable: {connectable}");
      self.connectable = connectable;
      self.actions.push(LinkAction::SetConnectable(connectable));
      self.notifier.connectable_changed(connectable);
   }
}

impl HandoverParticipant for LinkManager {
   fn veto(&self) -> bool {
      match self.registry.iter().find(|r| !r.lock().is_clear()) {
         Some(busy) => {
            info!("Links veto handover: {} is {}", busy.address, busy.state());
            true
         },
         None => false,
      }
   }

   fn marshal(&mut self, ty: MarshalType) -> Option<MarshalData> {
      if ty != MarshalType::LinkRecords {
         return None;
      }
      let images: Vec<LinkImage> = self
         .registry
         .iter()
         .filter(|r| r.state() == LinkState::Connected && !self.is_peer(&r.address))
         .map(LinkRecord::image)
         .collect();
      if images.is_empty() {
         return None;
      }
      MarshalData::encode(ty, &images)
   }

   fn unmarshal(&mut self, data: MarshalData) -> Unmarshalled {
      let images: Vec<LinkImage> = match data.decode() {
         Ok(images) => images,
         Err(e) => return Unmarshalled::Failed(e.to_string()),
      };
      for image in images {
         let record = match self.registry.add_or_update(
            &image.address,
            image.state,
            image.local,
            &*self.devices,
         ) {
            Ok(record) => record,
            Err(e) => return Unmarshalled::Failed(e.to_string()),
         };
         record.users = image.users;
         record.qos = image.qos;
         record.params = image.params;
         debug!("link {}: adopted from peer", image.address);
      }
      Unmarshalled::Copied(data)
   }

   fn commit(&mut self, role: Role) {
      let old_peer = self.peer_addr;
      mem::swap(&mut self.local_addr, &mut self.peer_addr);
      let new_peer = self.peer_addr;
      for record in self.registry.iter_mut() {
         if record.address.transport == Transport::BrEdr && record.address.addr == old_peer {
            record.address.addr = new_peer;
         }
      }
      if role == Role::Secondary {
         let handsets: Vec<usize> = self
            .registry
            .iter()
            .filter(|r| !self.is_peer(&r.address))
            .map(LinkRecord::slot)
            .collect();
         for slot in handsets {
            self.registry.remove(slot);
         }
      }
      info!("Links committed as {role}: local {} peer {}", self.local_addr, self.peer_addr);
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      device::MemoryDevices,
      link::qos::default_qos_table,
   };

   const LOCAL: BdAddr = BdAddr([0x02, 0, 0, 0, 0, 0x01]);
   const PEER: BdAddr = BdAddr([0x02, 0, 0, 0, 0, 0x02]);
   const PHONE: BdAddr = BdAddr([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13]);

   fn manager() -> LinkManager {
      let qos = QosEngine::new(QosLevel::LowPower, QosLevel::LowLatency, default_qos_table());
      LinkManager::new(4, qos, Arc::new(MemoryDevices::new()), LOCAL, PEER)
   }

   fn connected(manager: &mut LinkManager, addr: TypedAddress, incoming: bool) {
      manager.on_controller(ControllerEvent::Connected {
         addr,
         incoming,
         status: Status::Success,
      });
   }

   fn events(actions: &[LinkAction]) -> Vec<LinkEvent> {
      actions
         .iter()
         .filter_map(|a| match a {
            LinkAction::Event(e) => Some(*e),
            _ => None,
         })
         .collect()
   }

   #[test]
   fn test_local_connect_goes_through_internal_state() {
      let mut links = manager();
      let phone = TypedAddress::bredr(PHONE);
      links.connect(phone);
      assert_eq!(links.state(&phone), LinkState::ConnectingInternal);
      assert!(!links.lock(&phone).is_clear());
      assert_eq!(
         links.take_actions(),
         [LinkAction::Internal(LinkInternal::Open(phone))]
      );

      links.on_internal(LinkInternal::Open(phone));
      assert_eq!(links.state(&phone), LinkState::ConnectingLocalInitiated);
      assert_eq!(links.take_actions(), [LinkAction::Open(phone)]);

      connected(&mut links, phone, false);
      assert!(links.lock(&phone).is_clear());
      assert_eq!(
         events(&links.take_actions()),
         [LinkEvent::Connected { addr: phone, incoming: false }]
      );
      assert!(links.find(&phone).unwrap().local);
   }

   #[test]
   fn test_le_open_fixes_parameters_first() {
      let mut links = manager();
      let le = TypedAddress::le_public(PHONE);
      links.connect(le);
      links.request_qos(&le, QosLevel::LowLatency);
      links.take_actions();

      links.on_internal(LinkInternal::Open(le));
      let fast = links.qos().params(QosLevel::LowLatency);
      assert_eq!(
         links.take_actions(),
         [
            LinkAction::SetDefaultParams(fast),
            LinkAction::Open(le),
            LinkAction::SetDefaultParams(links.qos().default_params()),
         ]
      );

      // Opened with the right parameters; nothing to update.
      connected(&mut links, le, false);
      assert!(
         !links
            .take_actions()
            .iter()
            .any(|a| matches!(a, LinkAction::UpdateParams { .. }))
      );
   }

   #[test]
   fn test_duplicate_connect_indication_is_benign() {
      let mut links = manager();
      let phone = TypedAddress::bredr(PHONE);
      let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
      links.notifier_mut().register_connections(tx);

      connected(&mut links, phone, true);
      connected(&mut links, phone, true);
      assert_eq!(events(&links.take_actions()).len(), 1);
      assert!(rx.try_recv().is_ok());
      assert!(rx.try_recv().is_err());
   }

   #[test]
   fn test_connect_failure_removes_record() {
      let mut links = manager();
      let phone = TypedAddress::bredr(PHONE);
      links.connect(phone);
      links.on_internal(LinkInternal::Open(phone));
      links.take_actions();

      links.on_controller(ControllerEvent::Connected {
         addr: phone,
         incoming: false,
         status: Status::Failure,
      });
      assert!(links.find(&phone).is_none());
      assert_eq!(
         events(&links.take_actions()),
         [LinkEvent::ConnectFailed { addr: phone, status: Status::Failure }]
      );
   }

   #[test]
   fn test_link_loss_keeps_reclaimable_record() {
      let mut links = manager();
      let phone = TypedAddress::bredr(PHONE);
      connected(&mut links, phone, true);
      links.on_controller(ControllerEvent::Disconnected {
         addr: phone,
         reason: DisconnectReason::LinkLoss,
      });
      let record = links.find(&phone).unwrap();
      assert_eq!(record.state(), LinkState::DisconnectedLinkLoss);
      assert_eq!(record.disconnect_reason, Some(DisconnectReason::LinkLoss));

      links.on_controller(ControllerEvent::Disconnected {
         addr: phone,
         reason: DisconnectReason::RemoteTerminated,
      });
      assert!(links.find(&phone).is_none());
   }

   #[test]
   fn test_last_user_closes_local_link() {
      let mut links = manager();
      let phone = TypedAddress::bredr(PHONE);
      links.connect(phone);
      links.on_internal(LinkInternal::Open(phone));
      connected(&mut links, phone, false);
      links.connect(phone);
      links.take_actions();

      links.release(&phone);
      assert!(links.take_actions().is_empty());
      links.release(&phone);
      assert_eq!(
         links.take_actions(),
         [LinkAction::Close { addr: phone, force: false }]
      );
   }

   #[test]
   fn test_disconnect_before_open_cancels() {
      let mut links = manager();
      let phone = TypedAddress::bredr(PHONE);
      links.connect(phone);
      links.disconnect(&phone, false);
      links.on_internal(LinkInternal::Open(phone));
      let actions = links.take_actions();
      assert!(!actions.contains(&LinkAction::Open(phone)));
      assert!(events(&actions).contains(&LinkEvent::ConnectFailed {
         addr: phone,
         status: Status::Cancelled,
      }));
   }

   #[test]
   fn test_default_qos_is_monotonic() {
      let mut links = manager();
      links.request_default_qos(QosLevel::Audio);
      links.request_default_qos(QosLevel::LowPower);
      assert_eq!(
         links.take_actions(),
         [LinkAction::SetDefaultParams(links.qos().params(QosLevel::Audio))]
      );
      assert_eq!(links.qos().default_level(), QosLevel::Audio);
   }

   #[test]
   fn test_ceiling_reapplies_connected_le_links() {
      let mut links = manager();
      let le = TypedAddress::le_public(PHONE);
      connected(&mut links, le, true);
      links.request_qos(&le, QosLevel::LowLatency);
      links.take_actions();

      links.set_qos_ceiling(QosLevel::ShortDataExchange);
      assert_eq!(
         links.take_actions(),
         [LinkAction::UpdateParams {
            addr: le,
            params: links.qos().params(QosLevel::ShortDataExchange),
         }]
      );
   }

   #[test]
   fn test_connectable_changes_notify_once() {
      let mut links = manager();
      let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
      links.notifier_mut().register_connectable(tx);
      links.set_handset_connectable(true);
      links.set_handset_connectable(true);
      assert_eq!(links.take_actions(), [LinkAction::SetConnectable(true)]);
      assert!(rx.try_recv().unwrap().connectable);
      assert!(rx.try_recv().is_err());
   }

   #[test]
   fn test_veto_while_connecting() {
      let mut links = manager();
      assert!(!links.veto());
      links.on_controller(ControllerEvent::ConnectRequested {
         addr: TypedAddress::bredr(PHONE),
      });
      assert!(links.veto());
   }

   #[test]
   fn test_link_record_survives_marshal_round_trip() {
      let phone = TypedAddress::le_public(PHONE);
      let mut source = manager();
      connected(&mut source, TypedAddress::bredr(PEER), false);
      connected(&mut source, phone, true);
      source.request_qos(&phone, QosLevel::Audio);
      let before = source.find(&phone).unwrap().image();

      let data = source.marshal(MarshalType::LinkRecords).unwrap();
      let mut destination = LinkManager::new(
         4,
         QosEngine::new(QosLevel::LowPower, QosLevel::LowLatency, default_qos_table()),
         Arc::new(MemoryDevices::new()),
         PEER,
         LOCAL,
      );
      assert!(matches!(destination.unmarshal(data.clone()), Unmarshalled::Copied(_)));
      assert_eq!(destination.find(&phone).unwrap().image(), before);

      // Marshalling again yields the same payload.
      assert_eq!(destination.marshal(MarshalType::LinkRecords), Some(data));
   }

   #[test]
   fn test_commit_swaps_addresses_and_drops_handsets_on_demotion() {
      let mut links = manager();
      connected(&mut links, TypedAddress::bredr(PEER), false);
      connected(&mut links, TypedAddress::bredr(PHONE), true);

      links.commit(Role::Secondary);
      assert_eq!((links.local_addr(), links.peer_addr()), (PEER, LOCAL));
      assert!(links.find(&TypedAddress::bredr(PHONE)).is_none());
      // The peer link now carries the new peer address.
      assert!(links.is_connected(&TypedAddress::bredr(LOCAL)));
      assert_eq!(links.registry().len(), 1);
   }
}
