//! Handset session state machine.
//!
//! One session per handset, from a bounded pool. A session drives the
//! classic link and then the profiles on it, answers the clients queued
//! on it and persists what was connected. Like the link manager it only
//! queues work; the dispatcher executes [`SessionAction`]s.

use std::{mem, sync::Arc, time::Duration};

use log::{debug, info, warn};

use crate::{
   address::{BdAddr, Transport, TypedAddress},
   controller::DisconnectReason,
   device::DeviceRegistry,
   error::{Status, fatal},
   event::{Client, SessionNotice},
   handover::{HandoverParticipant, MarshalData, MarshalType, Role, Unmarshalled},
   link::{LinkEvent, LinkManager},
   profile::{ProfileEvent, ProfileSet, overall},
   session::{
      record::{SessionImage, SessionRecord},
      state::{ConnectingPhase, SessionState},
   },
};

/// Work the dispatcher performs on the sessions' behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
   /// Opens the classic link once its lock is clear.
   OpenAcl(TypedAddress),
   CloseAcl(TypedAddress),
   ConnectProfiles(BdAddr, ProfileSet),
   DisconnectProfiles(BdAddr, ProfileSet),
   StartRetryTimer(BdAddr, Duration),
   CancelRetryTimer(BdAddr),
}

#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
   pub max_sessions: usize,
   pub acl_attempts: u32,
   pub acl_retry_delay: Duration,
}

fn reply(client: &Client, notice: SessionNotice) {
   if client.send(notice).is_err() {
      debug!("client gone before {notice:?}");
   }
}

pub struct SessionManager {
   sessions: Vec<SessionRecord>,
   limits: SessionLimits,
   devices: Arc<dyn DeviceRegistry>,
   actions: Vec<SessionAction>,
}

impl SessionManager {
   pub fn new(limits: SessionLimits, devices: Arc<dyn DeviceRegistry>) -> Self {
      Self {
         sessions: Vec::with_capacity(limits.max_sessions),
         limits,
         devices,
         actions: Vec::new(),
      }
   }

   pub fn take_actions(&mut self) -> Vec<SessionAction> {
      mem::take(&mut self.actions)
   }

   pub fn session(&self, addr: &BdAddr) -> Option<&SessionRecord> {
      self.sessions.iter().find(|s| s.matches(addr))
   }

   pub fn iter(&self) -> impl Iterator<Item = &SessionRecord> {
      self.sessions.iter()
   }

   pub fn len(&self) -> usize {
      self.sessions.len()
   }

   pub fn is_empty(&self) -> bool {
      self.sessions.is_empty()
   }

   pub fn images(&self) -> Vec<SessionImage> {
      self.sessions.iter().map(SessionRecord::image).collect()
   }

   fn index(&self, addr: &BdAddr) -> Option<usize> {
      self.sessions.iter().position(|s| s.matches(addr))
   }

   fn allocate(&mut self, record: SessionRecord) -> Option<usize> {
      if self.sessions.len() >= self.limits.max_sessions {
         warn!("Session pool exhausted ({} sessions)", self.limits.max_sessions);
         return None;
      }
      self.sessions.push(record);
      Some(self.sessions.len() - 1)
   }

   fn free_if_idle(&mut self, i: usize) {
      if self.sessions.get(i).is_some_and(SessionRecord::is_idle) {
         let session = self.sessions.swap_remove(i);
         debug!("session {:?}: freed", session.device);
      }
   }

   fn device(&self, i: usize) -> BdAddr {
      match self.sessions[i].device {
         Some(device) => device,
         None => fatal("classic operation on a session without a device"),
      }
   }

   // === State transitions ===

   fn set_state(&mut self, i: usize, state: SessionState) {
      let old = self.sessions[i].state;
      if old == state {
         return;
      }
      self.exit(i, old, state);
      self.sessions[i].state = state;
      debug!("session {:?}: {old} -> {state}", self.sessions[i].device);
      self.entry(i, old, state);
   }

   fn exit(&mut self, i: usize, old: SessionState, new: SessionState) {
      match old {
         SessionState::Connecting(ConnectingPhase::Acl) => {
            let device = self.device(i);
            self.actions.push(SessionAction::CancelRetryTimer(device));
         },
         SessionState::ConnectedBredr => {
            let session = &self.sessions[i];
            if let Some(device) = session.device
               && !session.connected.is_empty()
            {
               let connected = session.connected;
               if let Err(e) = self
                  .devices
                  .update(&device, &mut |p| p.last_connected = connected)
               {
                  warn!("Could not record profiles of {device}: {e}");
               }
            }
         },
         _ => {},
      }
      if old.is_connecting() && !new.is_connecting() {
         self.sessions[i].attempted = ProfileSet::EMPTY;
      }
   }

   fn entry(&mut self, i: usize, old: SessionState, new: SessionState) {
      if new.is_connecting() && !old.is_connecting() {
         let session = &mut self.sessions[i];
         session.acl_attempts = 0;
         session.attempted = ProfileSet::EMPTY;
         session.disconnect_pending = false;
      }
      match new {
         SessionState::Connecting(ConnectingPhase::Acl) => {
            let device = self.device(i);
            self
               .actions
               .push(SessionAction::OpenAcl(TypedAddress::bredr(device)));
         },
         SessionState::ConnectedBredr => {
            let session = &mut self.sessions[i];
            session.disconnect_reason = None;
            if let Some(device) = session.device {
               info!("Handset {device} connected ({})", session.connected);
               if let Err(e) = self.devices.set_most_recently_used(&device) {
                  warn!("Could not mark {device} most recently used: {e}");
               }
            }
         },
         SessionState::Disconnected => {
            let session = &mut self.sessions[i];
            session.connected = ProfileSet::EMPTY;
            session.requested = ProfileSet::EMPTY;
         },
         _ => {},
      }
   }

   /// Where a session goes once its classic side is gone.
   fn rest_state(&self, i: usize) -> SessionState {
      if self.sessions[i].le_connected {
         SessionState::ConnectedLe
      } else {
         SessionState::Disconnected
      }
   }

   // === Client requests ===

   /// Connects `profiles` on the handset `addr`, opening the link first if
   /// needed. `client` gets exactly one `ConnectCfm`.
   pub fn connect(&mut self, links: &LinkManager, client: Client, addr: BdAddr, profiles: ProfileSet) {
      let notice = |status| SessionNotice::ConnectCfm { addr, status };
      if self.devices.properties(&addr).is_none() {
         warn!("Connect to unknown device {addr}");
         return reply(&client, notice(Status::NoSuchDevice));
      }
      let i = match self.index(&addr) {
         Some(i) => i,
         None => match self.allocate(SessionRecord::for_device(addr)) {
            Some(i) => i,
            None => return reply(&client, notice(Status::Failure)),
         },
      };
      let session = &mut self.sessions[i];
      session.device.get_or_insert(addr);
      match session.state {
         SessionState::Disconnected | SessionState::ConnectedLe => {
            session.requested = profiles;
            session.connect_waiters.push(client);
            if links.is_connected(&TypedAddress::bredr(addr)) {
               self.connect_profiles(i);
            } else {
               self.set_state(i, SessionState::Connecting(ConnectingPhase::Acl));
            }
         },
         SessionState::Connecting(_) => {
            session.requested = session.requested.union(profiles);
            session.connect_waiters.push(client);
         },
         SessionState::ConnectedBredr => {
            session.connect_waiters.push(client);
            if profiles.without(session.connected).is_empty() {
               session.connect_waiters.complete(notice(Status::Success));
            } else {
               session.requested = session.requested.union(profiles);
               self.connect_profiles(i);
            }
         },
         SessionState::DisconnectingBredr | SessionState::DisconnectingLe => {
            reply(&client, notice(Status::Cancelled));
         },
      }
   }

   /// Disconnects every profile and link of `addr`.
   pub fn disconnect(&mut self, links: &LinkManager, client: Client, addr: BdAddr) {
      let Some(i) = self.index(&addr) else {
         return reply(&client, SessionNotice::DisconnectCfm { addr, status: Status::Success });
      };
      let session = &mut self.sessions[i];
      match session.state {
         SessionState::Disconnected => {
            reply(&client, SessionNotice::DisconnectCfm { addr, status: Status::Success });
            self.free_if_idle(i);
         },
         SessionState::Connecting(ConnectingPhase::Acl) => {
            session.disconnect_waiters.push(client);
            self.cancel_acl(i, links);
            self.finish_disconnect(i);
         },
         SessionState::Connecting(ConnectingPhase::Profiles) => {
            session.disconnect_waiters.push(client);
            session.disconnect_pending = true;
         },
         SessionState::ConnectedBredr => {
            session.disconnect_waiters.push(client);
            self.begin_disconnect(i, links);
         },
         SessionState::ConnectedLe => {
            session.disconnect_waiters.push(client);
            self.disconnect_le(i);
         },
         SessionState::DisconnectingBredr | SessionState::DisconnectingLe => {
            session.disconnect_waiters.push(client);
         },
      }
   }

   /// Stops an in-flight connect. The link phase is abandoned at once; a
   /// profile phase is allowed to finish first.
   pub fn stop(&mut self, links: &LinkManager, client: Client, addr: BdAddr) {
      let notice = SessionNotice::StopCfm { addr, status: Status::Success };
      let Some(i) = self.index(&addr) else {
         return reply(&client, notice);
      };
      match self.sessions[i].state {
         SessionState::Connecting(ConnectingPhase::Acl) => {
            self.cancel_acl(i, links);
            let rest = self.rest_state(i);
            self.set_state(i, rest);
            reply(&client, notice);
            self.free_if_idle(i);
         },
         SessionState::Connecting(ConnectingPhase::Profiles) => {
            if let Some(previous) = self.sessions[i].stop_waiter.replace(client) {
               reply(&previous, SessionNotice::StopCfm { addr, status: Status::Cancelled });
            }
         },
         _ => reply(&client, notice),
      }
   }

   /// Abandons the link phase: every queued connect is cancelled.
   fn cancel_acl(&mut self, i: usize, links: &LinkManager) {
      let device = self.device(i);
      let bredr = TypedAddress::bredr(device);
      if links.state(&bredr).is_connecting() {
         self.actions.push(SessionAction::CloseAcl(bredr));
      }
      self.sessions[i]
         .connect_waiters
         .complete(SessionNotice::ConnectCfm { addr: device, status: Status::Cancelled });
      info!("Handset {device}: link attempt stopped");
   }

   fn connect_profiles(&mut self, i: usize) {
      if self.sessions[i].state != SessionState::Connecting(ConnectingPhase::Profiles) {
         self.set_state(i, SessionState::Connecting(ConnectingPhase::Profiles));
      }
      let device = self.device(i);
      let session = &mut self.sessions[i];
      let todo = session
         .requested
         .without(session.connected)
         .without(session.attempted);
      if todo.is_empty() {
         return self.finish_connect(i, Status::Success);
      }
      session.attempted = session.attempted.union(todo);
      self
         .actions
         .push(SessionAction::ConnectProfiles(device, todo));
   }

   fn finish_connect(&mut self, i: usize, status: Status) {
      let device = self.device(i);
      let notice = SessionNotice::ConnectCfm { addr: device, status };
      if !status.is_success() && self.sessions[i].connected.is_empty() {
         // Nothing usable came up; the link goes too.
         self.sessions[i].connect_waiters.complete(notice);
         self.set_state(i, SessionState::DisconnectingBredr);
         self
            .actions
            .push(SessionAction::CloseAcl(TypedAddress::bredr(device)));
         return;
      }
      self.set_state(i, SessionState::ConnectedBredr);
      self.sessions[i].connect_waiters.complete(notice);
   }

   fn begin_disconnect(&mut self, i: usize, links: &LinkManager) {
      let device = self.device(i);
      let session = &self.sessions[i];
      let targets = session.requested.union(session.connected);
      self.set_state(i, SessionState::DisconnectingBredr);
      if targets.is_empty() {
         self.close_acl_or_finish(i, links);
      } else {
         info!("Handset {device}: disconnecting {targets}");
         self
            .actions
            .push(SessionAction::DisconnectProfiles(device, targets));
      }
   }

   fn close_acl_or_finish(&mut self, i: usize, links: &LinkManager) {
      let bredr = TypedAddress::bredr(self.device(i));
      if links.state(&bredr).is_active() {
         self.actions.push(SessionAction::CloseAcl(bredr));
      } else {
         self.finish_disconnect(i);
      }
   }

   /// The classic side is down. Takes the LE link down too when a client
   /// asked for the disconnect.
   fn finish_disconnect(&mut self, i: usize) {
      let session = &self.sessions[i];
      if session.le_connected && !session.disconnect_waiters.is_empty() {
         return self.disconnect_le(i);
      }
      let rest = self.rest_state(i);
      self.set_state(i, rest);
      self.complete_disconnect(i);
      self.free_if_idle(i);
   }

   fn disconnect_le(&mut self, i: usize) {
      let Some(le) = self.sessions[i].le_addr else {
         return;
      };
      self.set_state(i, SessionState::DisconnectingLe);
      self.actions.push(SessionAction::CloseAcl(le));
   }

   fn complete_disconnect(&mut self, i: usize) {
      let session = &mut self.sessions[i];
      let Some(addr) = session.device.or(session.le_addr.map(|le| le.addr)) else {
         return;
      };
      session
         .disconnect_waiters
         .complete(SessionNotice::DisconnectCfm { addr, status: Status::Success });
   }

   // === Indications ===

   /// Delayed retry of the link phase.
   pub fn on_retry(&mut self, addr: BdAddr) {
      let Some(i) = self.index(&addr) else {
         return;
      };
      if self.sessions[i].state == SessionState::Connecting(ConnectingPhase::Acl) {
         debug!("session {addr}: retrying link");
         self
            .actions
            .push(SessionAction::OpenAcl(TypedAddress::bredr(addr)));
      }
   }

   pub fn on_link_event(&mut self, links: &LinkManager, event: LinkEvent) {
      if links.is_peer(event.addr()) {
         return;
      }
      match (event, event.addr().transport) {
         (LinkEvent::Connected { addr, incoming }, Transport::BrEdr) => {
            self.on_bredr_connected(addr.addr, incoming);
         },
         (LinkEvent::Connected { addr, .. }, Transport::Le) => self.on_le_connected(addr),
         (LinkEvent::ConnectFailed { addr, status }, Transport::BrEdr) => {
            self.on_bredr_failed(addr.addr, status);
         },
         (LinkEvent::Disconnected { addr, reason }, Transport::BrEdr) => {
            let Some(i) = self.index(&addr.addr) else {
               return;
            };
            self.sessions[i].disconnect_reason = Some(reason);
            match self.sessions[i].state {
               SessionState::Connecting(ConnectingPhase::Profiles) => {
                  let status = if reason == DisconnectReason::LinkLoss {
                     Status::LinkLoss
                  } else {
                     Status::Failure
                  };
                  let device = self.device(i);
                  let session = &mut self.sessions[i];
                  session
                     .connect_waiters
                     .complete(SessionNotice::ConnectCfm { addr: device, status });
                  if let Some(stop) = session.stop_waiter.take() {
                     reply(&stop, SessionNotice::StopCfm { addr: device, status: Status::Success });
                  }
                  self.finish_disconnect(i);
               },
               SessionState::ConnectedBredr => {
                  info!("Handset {} lost ({reason:?})", addr.addr);
                  let rest = self.rest_state(i);
                  self.set_state(i, rest);
                  self.free_if_idle(i);
               },
               SessionState::DisconnectingBredr => self.finish_disconnect(i),
               _ => {},
            }
         },
         (LinkEvent::Disconnected { addr, .. }, Transport::Le) => {
            let Some(i) = self.index(&addr.addr) else {
               return;
            };
            self.sessions[i].le_connected = false;
            if matches!(
               self.sessions[i].state,
               SessionState::ConnectedLe | SessionState::DisconnectingLe
            ) {
               self.set_state(i, SessionState::Disconnected);
               self.complete_disconnect(i);
            }
            self.free_if_idle(i);
         },
         (LinkEvent::ConnectFailed { .. }, Transport::Le) => {},
      }
   }

   fn on_bredr_connected(&mut self, addr: BdAddr, incoming: bool) {
      match self.index(&addr) {
         Some(i) => match self.sessions[i].state {
            SessionState::Connecting(ConnectingPhase::Acl) => self.connect_profiles(i),
            SessionState::Disconnected | SessionState::ConnectedLe if incoming => {
               self.sessions[i].device.get_or_insert(addr);
               self.set_state(i, SessionState::ConnectedBredr);
            },
            _ => {},
         },
         None if incoming && self.devices.properties(&addr).is_some() => {
            if let Some(i) = self.allocate(SessionRecord::for_device(addr)) {
               self.set_state(i, SessionState::ConnectedBredr);
            }
         },
         None => debug!("link {addr} up without a session"),
      }
   }

   fn on_le_connected(&mut self, addr: TypedAddress) {
      let i = match self.index(&addr.addr) {
         Some(i) => i,
         None => match self.allocate(SessionRecord::for_le(addr)) {
            Some(i) => i,
            None => return,
         },
      };
      let session = &mut self.sessions[i];
      session.le_addr = Some(addr);
      session.le_connected = true;
      if session.state == SessionState::Disconnected {
         self.set_state(i, SessionState::ConnectedLe);
      }
   }

   fn on_bredr_failed(&mut self, addr: BdAddr, status: Status) {
      let Some(i) = self.index(&addr) else {
         return;
      };
      if self.sessions[i].state != SessionState::Connecting(ConnectingPhase::Acl)
         || status == Status::Cancelled
      {
         return;
      }
      let session = &mut self.sessions[i];
      session.acl_attempts += 1;
      if session.acl_attempts < self.limits.acl_attempts {
         info!(
            "Handset {addr}: link attempt {} failed ({status}), retrying",
            session.acl_attempts
         );
         self
            .actions
            .push(SessionAction::StartRetryTimer(addr, self.limits.acl_retry_delay));
         return;
      }
      warn!("Handset {addr}: giving up after {} link attempts", session.acl_attempts);
      session
         .connect_waiters
         .complete(SessionNotice::ConnectCfm { addr, status: Status::Failure });
      let rest = self.rest_state(i);
      self.set_state(i, rest);
      self.complete_disconnect(i);
      self.free_if_idle(i);
   }

   pub fn on_profile_event(&mut self, links: &LinkManager, event: ProfileEvent) {
      match event {
         ProfileEvent::Connected { addr, profile } => {
            if let Some(i) = self.index(&addr) {
               let session = &mut self.sessions[i];
               session.connected = session.connected.with(profile);
            }
         },
         ProfileEvent::Disconnected { addr, profile } => {
            if let Some(i) = self.index(&addr) {
               let session = &mut self.sessions[i];
               session.connected = session.connected.remove(profile);
            }
         },
         ProfileEvent::ConnectCfm { addr, results } => {
            let Some(i) = self.index(&addr) else {
               return;
            };
            let session = &mut self.sessions[i];
            for (profile, status) in &results {
               if status.is_success() {
                  session.connected = session.connected.with(*profile);
               }
            }
            if session.state != SessionState::Connecting(ConnectingPhase::Profiles) {
               debug!("session {addr}: late profile completion");
               return;
            }
            let status = overall(&results);
            if session.disconnect_pending {
               session.disconnect_pending = false;
               session
                  .connect_waiters
                  .complete(SessionNotice::ConnectCfm { addr, status: Status::Cancelled });
               return self.begin_disconnect(i, links);
            }
            if let Some(stop) = session.stop_waiter.take() {
               session
                  .connect_waiters
                  .complete(SessionNotice::ConnectCfm { addr, status: Status::Cancelled });
               reply(&stop, SessionNotice::StopCfm { addr, status: Status::Success });
               self.set_state(i, SessionState::ConnectedBredr);
               return;
            }
            if status.is_success() {
               // Profiles added to the request while this attempt ran.
               return self.connect_profiles(i);
            }
            self.finish_connect(i, status);
         },
         ProfileEvent::DisconnectCfm { addr, results } => {
            let Some(i) = self.index(&addr) else {
               return;
            };
            let session = &mut self.sessions[i];
            for (profile, status) in &results {
               if status.is_success() {
                  session.connected = session.connected.remove(*profile);
               }
            }
            if session.state == SessionState::DisconnectingBredr {
               self.close_acl_or_finish(i, links);
            }
         },
      }
   }
}

impl HandoverParticipant for SessionManager {
   fn veto(&self) -> bool {
      match self
         .sessions
         .iter()
         .find(|s| s.state.is_transient() || s.has_waiters())
      {
         Some(busy) => {
            info!("Sessions veto handover: {:?} is {}", busy.device, busy.state);
            true
         },
         None => false,
      }
   }

   fn marshal(&mut self, ty: MarshalType) -> Option<MarshalData> {
      if ty != MarshalType::HandsetSession {
         return None;
      }
      let images: Vec<SessionImage> = self
         .sessions
         .iter()
         .filter(|s| s.state.is_connected())
         .map(SessionRecord::image)
         .collect();
      if images.is_empty() {
         return None;
      }
      MarshalData::encode(ty, &images)
   }

   fn unmarshal(&mut self, data: MarshalData) -> Unmarshalled {
      let images: Vec<SessionImage> = match data.decode() {
         Ok(images) => images,
         Err(e) => return Unmarshalled::Failed(e.to_string()),
      };
      for image in images {
         let key = image.device.or(image.le_addr.map(|le| le.addr));
         let existing = key.and_then(|addr| self.index(&addr));
         let device = image.device;
         let record = SessionRecord::from(image);
         match existing {
            Some(i) => self.sessions[i] = record,
            None => {
               if self.allocate(record).is_none() {
                  return Unmarshalled::Failed("session pool exhausted".into());
               }
            },
         }
         if let Some(device) = device
            && let Err(e) = self.devices.set_most_recently_used(&device)
         {
            warn!("Adopted session for {device}: {e}");
         }
      }
      Unmarshalled::Adopted
   }

   fn commit(&mut self, role: Role) {
      if role == Role::Secondary {
         if !self.sessions.is_empty() {
            info!("Sessions committed as secondary: dropping {}", self.sessions.len());
         }
         self.sessions.clear();
         return;
      }
      if self.sessions.is_empty() {
         return;
      }
      let Some(mru) = self.devices.most_recently_used() else {
         fatal("promoted with sessions but no most-recently-used handset");
      };
      self.sessions.retain(|s| s.device == Some(mru));
      for session in &mut self.sessions {
         let Some(props) = self.devices.properties(&mru) else {
            fatal(format_args!("promoted handset {mru} missing from device store"));
         };
         session.requested = if session.connected.is_empty() {
            props.default_profiles()
         } else {
            session.connected
         };
         info!("Session for {} ({}) kept as primary", mru, props.name);
      }
   }
}

#[cfg(test)]
mod tests {
   use tokio::sync::mpsc;

   use super::*;
   use crate::{
      controller::ControllerEvent,
      device::{DeviceProperties, MemoryDevices},
      link::{LinkAction, QosEngine, QosLevel, qos::default_qos_table},
      profile::{Profile, ProfileResults},
   };

   const LOCAL: BdAddr = BdAddr([0x02, 0, 0, 0, 0, 0x01]);
   const PEER: BdAddr = BdAddr([0x02, 0, 0, 0, 0, 0x02]);
   const PHONE: BdAddr = BdAddr([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13]);
   const TABLET: BdAddr = BdAddr([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x14]);

   struct Harness {
      devices: MemoryDevices,
      links: LinkManager,
      sessions: SessionManager,
   }

   impl Harness {
      fn new(max_sessions: usize) -> Self {
         let devices = MemoryDevices::new();
         for (addr, name) in [(PHONE, "Phone"), (TABLET, "Tablet")] {
            devices
               .store(&addr, DeviceProperties::handset(name, ProfileSet::ALL))
               .unwrap();
         }
         let qos = QosEngine::new(QosLevel::LowPower, QosLevel::LowLatency, default_qos_table());
         let links = LinkManager::new(4, qos, Arc::new(devices.clone()), LOCAL, PEER);
         let limits = SessionLimits {
            max_sessions,
            acl_attempts: 3,
            acl_retry_delay: Duration::from_millis(500),
         };
         let sessions = SessionManager::new(limits, Arc::new(devices.clone()));
         Self { devices, links, sessions }
      }

      fn connect(&mut self, client: &Client, addr: BdAddr, profiles: ProfileSet) {
         self.sessions.connect(&self.links, client.clone(), addr, profiles);
      }

      fn disconnect(&mut self, client: &Client, addr: BdAddr) {
         self.sessions.disconnect(&self.links, client.clone(), addr);
      }

      fn stop(&mut self, client: &Client, addr: BdAddr) {
         self.sessions.stop(&self.links, client.clone(), addr);
      }

      /// Feeds a controller indication through the link manager and on to
      /// the sessions.
      fn controller(&mut self, event: ControllerEvent) {
         self.links.on_controller(event);
         for action in self.links.take_actions() {
            if let LinkAction::Event(event) = action {
               self.sessions.on_link_event(&self.links, event);
            }
         }
      }

      fn link_up(&mut self, addr: TypedAddress, incoming: bool) {
         self.controller(ControllerEvent::Connected {
            addr,
            incoming,
            status: Status::Success,
         });
      }

      fn link_down(&mut self, addr: TypedAddress, reason: DisconnectReason) {
         self.controller(ControllerEvent::Disconnected { addr, reason });
      }

      fn link_failed(&mut self, addr: TypedAddress) {
         self.links.connect(addr);
         self.links.take_actions();
         self.controller(ControllerEvent::Connected {
            addr,
            incoming: false,
            status: Status::Failure,
         });
      }

      fn profiles(&mut self, event: ProfileEvent) {
         self.sessions.on_profile_event(&self.links, event);
      }

      fn state(&self, addr: BdAddr) -> Option<SessionState> {
         self.sessions.session(&addr).map(SessionRecord::state)
      }
   }

   fn results(entries: &[(Profile, Status)]) -> ProfileResults {
      entries.iter().copied().collect()
   }

   fn drain(rx: &mut mpsc::UnboundedReceiver<SessionNotice>) -> Vec<SessionNotice> {
      std::iter::from_fn(|| rx.try_recv().ok()).collect()
   }

   fn client() -> (Client, mpsc::UnboundedReceiver<SessionNotice>) {
      mpsc::unbounded_channel()
   }

   #[test]
   fn test_classic_connect_scenario() {
      let mut h = Harness::new(2);
      let (tx, mut rx) = client();
      let profiles = ProfileSet::HFP.union(ProfileSet::A2DP);

      h.connect(&tx, PHONE, profiles);
      assert_eq!(h.state(PHONE), Some(SessionState::Connecting(ConnectingPhase::Acl)));
      assert_eq!(
         h.sessions.take_actions(),
         [SessionAction::OpenAcl(TypedAddress::bredr(PHONE))]
      );

      h.link_up(TypedAddress::bredr(PHONE), false);
      assert_eq!(
         h.state(PHONE),
         Some(SessionState::Connecting(ConnectingPhase::Profiles))
      );
      assert_eq!(
         h.sessions.take_actions(),
         [
            SessionAction::CancelRetryTimer(PHONE),
            SessionAction::ConnectProfiles(PHONE, profiles),
         ]
      );
      assert!(drain(&mut rx).is_empty());

      h.profiles(ProfileEvent::ConnectCfm {
         addr: PHONE,
         results: results(&[(Profile::Hfp, Status::Success), (Profile::A2dp, Status::Success)]),
      });
      assert_eq!(h.state(PHONE), Some(SessionState::ConnectedBredr));
      assert_eq!(
         drain(&mut rx),
         [SessionNotice::ConnectCfm { addr: PHONE, status: Status::Success }]
      );
      assert_eq!(h.sessions.session(&PHONE).unwrap().connected, profiles);
      assert_eq!(h.devices.most_recently_used(), Some(PHONE));
   }

   #[test]
   fn test_overlapping_connects_complete_each_client_once() {
      let mut h = Harness::new(2);
      let clients: Vec<_> = (0..4).map(|_| client()).collect();
      for (tx, _) in &clients {
         h.connect(tx, PHONE, ProfileSet::HFP);
      }
      // Queuing twice on the same list still yields one completion.
      h.connect(&clients[0].0, PHONE, ProfileSet::HFP);

      h.link_up(TypedAddress::bredr(PHONE), false);
      h.profiles(ProfileEvent::ConnectCfm {
         addr: PHONE,
         results: results(&[(Profile::Hfp, Status::Success)]),
      });

      for (_, mut rx) in clients {
         assert_eq!(
            drain(&mut rx),
            [SessionNotice::ConnectCfm { addr: PHONE, status: Status::Success }]
         );
      }
   }

   #[test]
   fn test_connect_with_link_up_and_no_profiles_completes_at_once() {
      let mut h = Harness::new(2);
      h.link_up(TypedAddress::bredr(PHONE), true);
      assert_eq!(h.state(PHONE), Some(SessionState::ConnectedBredr));

      let (tx, mut rx) = client();
      h.connect(&tx, PHONE, ProfileSet::EMPTY);
      assert_eq!(
         drain(&mut rx),
         [SessionNotice::ConnectCfm { addr: PHONE, status: Status::Success }]
      );
   }

   #[test]
   fn test_unknown_device_and_full_pool() {
      let mut h = Harness::new(1);
      let (tx, mut rx) = client();
      let stranger = BdAddr([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
      h.connect(&tx, stranger, ProfileSet::ALL);
      h.connect(&tx, PHONE, ProfileSet::ALL);
      h.connect(&tx, TABLET, ProfileSet::ALL);
      assert_eq!(
         drain(&mut rx),
         [
            SessionNotice::ConnectCfm { addr: stranger, status: Status::NoSuchDevice },
            SessionNotice::ConnectCfm { addr: TABLET, status: Status::Failure },
         ]
      );
   }

   #[test]
   fn test_acl_retries_then_fails() {
      let mut h = Harness::new(2);
      let (tx, mut rx) = client();
      h.connect(&tx, PHONE, ProfileSet::HFP);
      h.sessions.take_actions();

      let bredr = TypedAddress::bredr(PHONE);
      for attempt in 1..3 {
         h.link_failed(bredr);
         assert_eq!(
            h.sessions.take_actions(),
            [SessionAction::StartRetryTimer(PHONE, Duration::from_millis(500))],
            "attempt {attempt}"
         );
         h.sessions.on_retry(PHONE);
         assert_eq!(h.sessions.take_actions(), [SessionAction::OpenAcl(bredr)]);
      }
      h.link_failed(bredr);
      assert_eq!(
         drain(&mut rx),
         [SessionNotice::ConnectCfm { addr: PHONE, status: Status::Failure }]
      );
      assert!(h.sessions.session(&PHONE).is_none());
   }

   #[test]
   fn test_stop_during_acl_cancels_at_once() {
      let mut h = Harness::new(2);
      let (tx, mut rx) = client();
      h.connect(&tx, PHONE, ProfileSet::HFP);
      // The link open is in flight.
      h.links.connect(TypedAddress::bredr(PHONE));
      h.links.on_internal(crate::link::LinkInternal::Open(TypedAddress::bredr(PHONE)));
      h.sessions.take_actions();

      h.stop(&tx, PHONE);
      assert_eq!(
         drain(&mut rx),
         [
            SessionNotice::ConnectCfm { addr: PHONE, status: Status::Cancelled },
            SessionNotice::StopCfm { addr: PHONE, status: Status::Success },
         ]
      );
      let actions = h.sessions.take_actions();
      assert!(actions.contains(&SessionAction::CloseAcl(TypedAddress::bredr(PHONE))));
      assert!(actions.contains(&SessionAction::CancelRetryTimer(PHONE)));
      assert!(h.sessions.is_empty());
   }

   #[test]
   fn test_stop_during_profiles_waits_for_completion() {
      let mut h = Harness::new(2);
      let (tx, mut rx) = client();
      h.connect(&tx, PHONE, ProfileSet::A2DP);
      h.link_up(TypedAddress::bredr(PHONE), false);
      h.stop(&tx, PHONE);
      assert!(drain(&mut rx).is_empty());

      h.profiles(ProfileEvent::ConnectCfm {
         addr: PHONE,
         results: results(&[(Profile::A2dp, Status::Success)]),
      });
      assert_eq!(
         drain(&mut rx),
         [
            SessionNotice::ConnectCfm { addr: PHONE, status: Status::Cancelled },
            SessionNotice::StopCfm { addr: PHONE, status: Status::Success },
         ]
      );
      assert_eq!(h.state(PHONE), Some(SessionState::ConnectedBredr));
   }

   #[test]
   fn test_disconnect_targets_requested_and_connected() {
      let mut h = Harness::new(2);
      let (tx, mut rx) = client();
      h.connect(&tx, PHONE, ProfileSet::A2DP);
      h.link_up(TypedAddress::bredr(PHONE), false);
      h.profiles(ProfileEvent::ConnectCfm {
         addr: PHONE,
         results: results(&[(Profile::A2dp, Status::Success)]),
      });
      // The handset brought up call control on its own.
      h.profiles(ProfileEvent::Connected { addr: PHONE, profile: Profile::Hfp });
      h.sessions.take_actions();
      drain(&mut rx);

      h.disconnect(&tx, PHONE);
      assert_eq!(h.state(PHONE), Some(SessionState::DisconnectingBredr));
      assert_eq!(
         h.sessions.take_actions(),
         [SessionAction::DisconnectProfiles(PHONE, ProfileSet::A2DP.union(ProfileSet::HFP))]
      );

      h.profiles(ProfileEvent::DisconnectCfm {
         addr: PHONE,
         results: results(&[(Profile::A2dp, Status::Success), (Profile::Hfp, Status::Success)]),
      });
      assert_eq!(
         h.sessions.take_actions(),
         [SessionAction::CloseAcl(TypedAddress::bredr(PHONE))]
      );
      h.link_down(TypedAddress::bredr(PHONE), DisconnectReason::LocalTerminated);
      assert_eq!(
         drain(&mut rx),
         [SessionNotice::DisconnectCfm { addr: PHONE, status: Status::Success }]
      );
      assert!(h.sessions.is_empty());
      assert_eq!(
         h.devices.properties(&PHONE).unwrap().last_connected,
         ProfileSet::A2DP.union(ProfileSet::HFP)
      );
   }

   #[test]
   fn test_connect_while_disconnecting_is_cancelled() {
      let mut h = Harness::new(2);
      let (tx, mut rx) = client();
      h.link_up(TypedAddress::bredr(PHONE), true);
      h.disconnect(&tx, PHONE);
      assert_eq!(h.state(PHONE), Some(SessionState::DisconnectingBredr));
      h.connect(&tx, PHONE, ProfileSet::HFP);
      assert_eq!(
         drain(&mut rx),
         [SessionNotice::ConnectCfm { addr: PHONE, status: Status::Cancelled }]
      );
   }

   #[test]
   fn test_disconnect_while_connecting_profiles() {
      let mut h = Harness::new(2);
      let (tx, mut rx) = client();
      h.connect(&tx, PHONE, ProfileSet::HFP);
      h.link_up(TypedAddress::bredr(PHONE), false);
      h.disconnect(&tx, PHONE);
      h.sessions.take_actions();

      h.profiles(ProfileEvent::ConnectCfm {
         addr: PHONE,
         results: results(&[(Profile::Hfp, Status::Success)]),
      });
      assert_eq!(
         drain(&mut rx),
         [SessionNotice::ConnectCfm { addr: PHONE, status: Status::Cancelled }]
      );
      assert_eq!(
         h.sessions.take_actions(),
         [SessionAction::DisconnectProfiles(PHONE, ProfileSet::HFP)]
      );
   }

   #[test]
   fn test_link_loss_returns_to_disconnected_silently() {
      let mut h = Harness::new(2);
      let (tx, mut rx) = client();
      h.connect(&tx, PHONE, ProfileSet::HFP);
      h.link_up(TypedAddress::bredr(PHONE), false);
      h.profiles(ProfileEvent::ConnectCfm {
         addr: PHONE,
         results: results(&[(Profile::Hfp, Status::Success)]),
      });
      drain(&mut rx);

      h.link_down(TypedAddress::bredr(PHONE), DisconnectReason::LinkLoss);
      assert!(drain(&mut rx).is_empty());
      assert!(h.sessions.is_empty());
      assert_eq!(h.devices.properties(&PHONE).unwrap().last_connected, ProfileSet::HFP);
   }

   #[test]
   fn test_le_only_session_lives_until_le_link_goes() {
      let mut h = Harness::new(2);
      let watch = TypedAddress::le_random(BdAddr([0x7A, 1, 2, 3, 4, 5]));
      h.link_up(watch, true);
      let session = h.sessions.session(&watch.addr).unwrap();
      assert_eq!(session.state(), SessionState::ConnectedLe);
      assert!(session.device.is_none());

      h.link_down(watch, DisconnectReason::RemoteTerminated);
      assert!(h.sessions.is_empty());
   }

   #[test]
   fn test_classic_loss_keeps_le_branch() {
      let mut h = Harness::new(2);
      h.link_up(TypedAddress::le_public(PHONE), true);
      h.link_up(TypedAddress::bredr(PHONE), true);
      assert_eq!(h.state(PHONE), Some(SessionState::ConnectedBredr));

      h.link_down(TypedAddress::bredr(PHONE), DisconnectReason::RemoteTerminated);
      assert_eq!(h.state(PHONE), Some(SessionState::ConnectedLe));
      h.link_down(TypedAddress::le_public(PHONE), DisconnectReason::RemoteTerminated);
      assert!(h.sessions.is_empty());
   }

   #[test]
   fn test_veto_while_busy() {
      let mut h = Harness::new(2);
      assert!(!h.sessions.veto());
      let (tx, _rx) = client();
      h.connect(&tx, PHONE, ProfileSet::HFP);
      assert!(h.sessions.veto());
   }

   #[test]
   fn test_commit_keeps_only_most_recently_used() {
      let mut h = Harness::new(2);
      h.link_up(TypedAddress::bredr(TABLET), true);
      h.link_up(TypedAddress::bredr(PHONE), true);
      assert_eq!(h.sessions.len(), 2);
      assert_eq!(h.devices.most_recently_used(), Some(PHONE));

      h.sessions.commit(Role::Primary);
      assert_eq!(h.sessions.len(), 1);
      let kept = h.sessions.session(&PHONE).unwrap();
      assert_eq!(kept.requested, ProfileSet::ALL);

      h.sessions.commit(Role::Secondary);
      assert!(h.sessions.is_empty());
   }

   #[test]
   fn test_session_marshal_round_trip() {
      let mut source = Harness::new(2);
      source.link_up(TypedAddress::bredr(PHONE), true);
      source.profiles(ProfileEvent::Connected { addr: PHONE, profile: Profile::A2dp });
      let data = source.sessions.marshal(MarshalType::HandsetSession).unwrap();

      let mut destination = Harness::new(2);
      assert_eq!(destination.sessions.unmarshal(data.clone()), Unmarshalled::Adopted);
      destination.sessions.commit(Role::Primary);
      let adopted = destination.sessions.session(&PHONE).unwrap();
      assert_eq!(adopted.state(), SessionState::ConnectedBredr);
      assert_eq!(adopted.connected, ProfileSet::A2DP);
      assert_eq!(
         destination.sessions.marshal(MarshalType::HandsetSession).map(|d| d.ty),
         Some(data.ty)
      );
   }
}
