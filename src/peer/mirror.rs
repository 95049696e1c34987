//! The peer state mirror.
//!
//! Holds two snapshots: ours and the last one the peer sent. Local
//! changes are applied, fanned out to subscribers and forwarded to the
//! peer through the [`Outbox`]; messages from the peer update the remote
//! snapshot and fan out the same way.
//!
//! The mirror starts paused. While paused, local changes still apply
//! and notify but nothing is queued for the peer. Unpausing queues the
//! whole local snapshot as the initial state, and losing the peer link
//! pauses again.

use std::{mem, time::Duration};

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::{
   address::BdAddr,
   channel::PeerChannel,
   event::Subscriber,
   handover::{HandoverParticipant, MarshalData, MarshalType, Role, Unmarshalled},
   notify::SubscriberList,
   peer::{
      collect::Connection,
      message::{Outbox, PeerMessage},
      snapshot::{
         BatteryState, FeatureMode, Flag, LinkQualities, LinkQualityEntry, PeerSnapshot,
         PhysicalState, StateFlags,
      },
   },
};

/// Whose snapshot an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Side {
   Local,
   Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MirrorEvent {
   InitialStateReceived,
   PeerLinkChanged { connected: bool },
   Physical { side: Side, state: PhysicalState },
   Flag { side: Side, flag: Flag, on: bool },
   Battery { side: Side, battery: BatteryState },
   Handset { side: Side, addr: Option<BdAddr> },
   LinkQuality { side: Side, links: LinkQualities },
   MicQuality { side: Side, quality: Option<u8> },
   FeatureMode { side: Side, mode: FeatureMode },
}

impl MirrorEvent {
   pub const fn kind(&self) -> EventMask {
      match self {
         Self::InitialStateReceived => EventMask::INITIAL_STATE,
         Self::PeerLinkChanged { .. } => EventMask::PEER_LINK,
         Self::Physical { .. } => EventMask::PHYSICAL,
         Self::Flag { .. } => EventMask::FLAGS,
         Self::Battery { .. } => EventMask::BATTERY,
         Self::Handset { .. } => EventMask::HANDSET,
         Self::LinkQuality { .. } => EventMask::LINK_QUALITY,
         Self::MicQuality { .. } => EventMask::MIC_QUALITY,
         Self::FeatureMode { .. } => EventMask::FEATURE_MODE,
      }
   }
}

/// Per-subscriber filter over [`MirrorEvent`] kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(u32);

impl EventMask {
   pub const NONE: Self = Self(0);
   pub const INITIAL_STATE: Self = Self(1 << 0);
   pub const PEER_LINK: Self = Self(1 << 1);
   pub const PHYSICAL: Self = Self(1 << 2);
   pub const FLAGS: Self = Self(1 << 3);
   pub const BATTERY: Self = Self(1 << 4);
   pub const HANDSET: Self = Self(1 << 5);
   pub const LINK_QUALITY: Self = Self(1 << 6);
   pub const MIC_QUALITY: Self = Self(1 << 7);
   pub const FEATURE_MODE: Self = Self(1 << 8);
   pub const ALL: Self = Self((1 << 9) - 1);

   pub const fn from_bits(bits: u32) -> Self {
      Self(bits & Self::ALL.0)
   }

   pub const fn bits(self) -> u32 {
      self.0
   }

   pub const fn union(self, other: Self) -> Self {
      Self(self.0 | other.0)
   }

   pub const fn intersects(self, other: Self) -> bool {
      self.0 & other.0 != 0
   }
}

/// A change to the local snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalUpdate {
   Physical(PhysicalState),
   /// Non-physical flags only; physical position goes through
   /// [`LocalUpdate::Physical`].
   Flag(Flag, bool),
   Battery(BatteryState),
   Handset(Option<BdAddr>),
   LinkQuality(LinkQualities),
   MicQuality(Option<u8>),
   FeatureMode(FeatureMode),
}

/// Timer changes requested of the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorAction {
   StartLinkPoll(Duration),
   StopLinkPoll,
   StartMicPoll(Duration),
   StopMicPoll,
}

#[derive(Debug, Clone, Copy)]
pub struct MirrorConfig {
   pub outbox_limit: usize,
   pub link_poll: Duration,
   pub mic_poll: Duration,
}

impl Default for MirrorConfig {
   fn default() -> Self {
      Self {
         outbox_limit: 16,
         link_poll: Duration::from_secs(1),
         mic_poll: Duration::from_millis(500),
      }
   }
}

#[derive(Debug)]
pub struct Mirror {
   config: MirrorConfig,
   local: PeerSnapshot,
   remote: PeerSnapshot,
   paused: bool,
   initial_sent: bool,
   initial_received: bool,
   peer_connected: bool,
   outbox: Outbox,
   subscribers: SubscriberList<MirrorEvent, EventMask>,
   link_polling: bool,
   mic_polling: bool,
   actions: Vec<MirrorAction>,
}

impl Mirror {
   pub fn new(config: MirrorConfig) -> Self {
      Self {
         outbox: Outbox::new(config.outbox_limit),
         config,
         local: PeerSnapshot::default(),
         remote: PeerSnapshot::default(),
         paused: true,
         initial_sent: false,
         initial_received: false,
         peer_connected: false,
         subscribers: SubscriberList::new(),
         link_polling: false,
         mic_polling: false,
         actions: Vec::new(),
      }
   }

   pub fn take_actions(&mut self) -> Vec<MirrorAction> {
      mem::take(&mut self.actions)
   }

   pub fn local(&self) -> &PeerSnapshot {
      &self.local
   }

   pub fn remote(&self) -> &PeerSnapshot {
      &self.remote
   }

   pub fn is_paused(&self) -> bool {
      self.paused
   }

   /// Both initial states have crossed.
   pub fn is_synced(&self) -> bool {
      self.initial_sent && self.initial_received
   }

   pub fn outbox(&self) -> &Outbox {
      &self.outbox
   }

   /// Installs the assembled local snapshot. Stays paused.
   pub fn start(&mut self, snapshot: PeerSnapshot) {
      info!(
         "Peer mirror started ({}, {})",
         snapshot.physical(),
         if snapshot.is_primary() { "primary" } else { "secondary" }
      );
      self.local = snapshot;
      self.paused = true;
      self.initial_sent = false;
      self.outbox.clear();
      self.update_polling();
   }

   pub fn pause(&mut self) {
      if !self.paused {
         debug!("mirror paused");
         self.paused = true;
      }
   }

   /// Queues the initial state ahead of anything pending.
   pub fn unpause(&mut self) {
      if !self.paused {
         return;
      }
      debug!("mirror unpaused");
      self.paused = false;
      self.initial_sent = false;
      self.outbox.push_initial(self.local.clone());
   }

   pub fn subscribe(&mut self, tx: Subscriber<MirrorEvent>, mask: EventMask) -> bool {
      let added = self.subscribers.register(tx, mask);
      self.update_polling();
      added
   }

   pub fn unsubscribe(&mut self, tx: &Subscriber<MirrorEvent>) -> bool {
      let removed = self.subscribers.unregister(tx);
      self.update_polling();
      removed
   }

   fn notify(&mut self, event: MirrorEvent) {
      let kind = event.kind();
      self.subscribers.deliver(&event, |mask| mask.intersects(kind));
   }

   fn forward(&mut self, message: PeerMessage) {
      if !self.paused {
         self.outbox.push(message);
      }
   }

   pub fn update_local(&mut self, update: LocalUpdate) {
      let side = Side::Local;
      match update {
         LocalUpdate::Physical(target) => {
            for step in self.local.physical().path_to(target) {
               self.local.set_physical(step);
               self.notify(MirrorEvent::Physical { side, state: step });
               self.forward(PeerMessage::Physical(step));
            }
         },
         LocalUpdate::Flag(flag, _) if StateFlags::PHYSICAL.contains(flag) => {
            warn!("Physical flag {flag} set directly, ignoring");
         },
         LocalUpdate::Flag(flag, on) => {
            if self.local.flags.set(flag, on) {
               self.notify(MirrorEvent::Flag { side, flag, on });
               self.forward(PeerMessage::Flags(
                  self.local.flags.without(StateFlags::PHYSICAL),
               ));
               self.update_polling();
            }
         },
         LocalUpdate::Battery(battery) => {
            if self.local.battery != battery {
               self.local.battery = battery;
               self.notify(MirrorEvent::Battery { side, battery });
               self.forward(PeerMessage::Battery(battery));
            }
         },
         LocalUpdate::Handset(addr) => {
            if self.local.handset != addr {
               self.local.handset = addr;
               self.notify(MirrorEvent::Handset { side, addr });
               self.forward(PeerMessage::Handset(addr));
            }
         },
         LocalUpdate::LinkQuality(links) => {
            if self.local.links != links {
               self.local.links = links.clone();
               self.notify(MirrorEvent::LinkQuality { side, links: links.clone() });
               self.forward(PeerMessage::LinkQuality(links));
            }
         },
         LocalUpdate::MicQuality(quality) => {
            if self.local.mic_quality != quality {
               self.local.mic_quality = quality;
               self.notify(MirrorEvent::MicQuality { side, quality });
               self.forward(PeerMessage::MicQuality(quality));
            }
         },
         LocalUpdate::FeatureMode(mode) => {
            if self.local.feature_mode != mode {
               self.local.feature_mode = mode;
               self.notify(MirrorEvent::FeatureMode { side, mode });
               self.forward(PeerMessage::FeatureMode(mode));
            }
         },
      }
   }

   /// Brings the connection-derived flags and handset in line with
   /// `conn`.
   pub fn apply_connection(&mut self, conn: Connection) {
      let current = self.local.flags.intersect(StateFlags::CONNECTION);
      let target = conn.flags.intersect(StateFlags::CONNECTION);
      for (flag, on) in current.changes(target) {
         self.update_local(LocalUpdate::Flag(flag, on));
      }
      self.update_local(LocalUpdate::Handset(conn.handset));
   }

   pub fn on_message(&mut self, message: PeerMessage) {
      let side = Side::Remote;
      let message = match message {
         PeerMessage::InitialState(snapshot) => {
            self.on_initial_state(*snapshot);
            return;
         },
         message => message,
      };
      if !self.initial_received {
         debug!("peer message before initial state, dropping: {message:?}");
         return;
      }
      match message {
         PeerMessage::InitialState(_) => {},
         PeerMessage::Flags(flags) => {
            let physical = self.remote.flags.intersect(StateFlags::PHYSICAL);
            let before = self.remote.flags;
            self.remote.flags = flags.without(StateFlags::PHYSICAL).union(physical);
            for (flag, on) in before.changes(self.remote.flags) {
               self.notify(MirrorEvent::Flag { side, flag, on });
            }
         },
         PeerMessage::Physical(state) => {
            if self.remote.physical() != state {
               self.remote.set_physical(state);
               self.notify(MirrorEvent::Physical { side, state });
            }
         },
         PeerMessage::Battery(battery) => {
            self.remote.battery = battery;
            self.notify(MirrorEvent::Battery { side, battery });
         },
         PeerMessage::Handset(addr) => {
            self.remote.handset = addr;
            self.notify(MirrorEvent::Handset { side, addr });
         },
         PeerMessage::LinkQuality(links) => {
            self.remote.links = links.clone();
            self.notify(MirrorEvent::LinkQuality { side, links });
         },
         PeerMessage::MicQuality(quality) => {
            self.remote.mic_quality = quality;
            self.notify(MirrorEvent::MicQuality { side, quality });
         },
         PeerMessage::FeatureMode(mode) => {
            self.remote.feature_mode = mode;
            self.notify(MirrorEvent::FeatureMode { side, mode });
         },
      }
   }

   fn on_initial_state(&mut self, snapshot: PeerSnapshot) {
      let previous = mem::replace(&mut self.remote, snapshot);
      self.initial_received = true;
      info!("Peer initial state received ({})", self.remote.physical());
      self.notify(MirrorEvent::InitialStateReceived);

      let side = Side::Remote;
      let state = self.remote.physical();
      if previous.physical() != state {
         self.notify(MirrorEvent::Physical { side, state });
      }
      let before = previous.flags.without(StateFlags::PHYSICAL);
      let after = self.remote.flags.without(StateFlags::PHYSICAL);
      for (flag, on) in before.changes(after) {
         self.notify(MirrorEvent::Flag { side, flag, on });
      }
   }

   /// The ACL to the other earbud came up or went down.
   pub fn on_peer_link(&mut self, connected: bool) {
      if self.peer_connected == connected {
         return;
      }
      self.peer_connected = connected;
      if !connected {
         info!("Peer link lost, mirror paused");
         self.paused = true;
         self.initial_sent = false;
         self.initial_received = false;
         self.outbox.clear();
      }
      self.notify(MirrorEvent::PeerLinkChanged { connected });
      self.update_polling();
   }

   /// The peer channel came up or went down. Queued messages wait for
   /// it to come back.
   pub fn on_channel(&mut self, up: bool) {
      let initial_queued = self
         .outbox
         .iter()
         .any(|m| matches!(m, PeerMessage::InitialState(_)));
      if up && !self.paused && !self.initial_sent && !initial_queued {
         self.outbox.push_initial(self.local.clone());
      }
   }

   /// Hands queued messages to `channel` until it refuses one.
   pub fn flush(&mut self, channel: &dyn PeerChannel) -> usize {
      if !channel.is_connected() {
         return 0;
      }
      let mut sent = 0;
      while let Some(message) = self.outbox.pop() {
         let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
               error!("Dropping unencodable peer message: {e}");
               continue;
            },
         };
         if let Err(e) = channel.send(frame) {
            debug!("peer channel refused message: {e}");
            self.outbox.unpop(message);
            break;
         }
         if matches!(message, PeerMessage::InitialState(_)) {
            self.initial_sent = true;
         }
         sent += 1;
      }
      sent
   }

   fn has_connection(&self) -> bool {
      self.peer_connected
         || self.local.flags.contains(Flag::HandsetAclConnected)
         || self.local.flags.contains(Flag::LeConnected)
   }

   fn update_polling(&mut self) {
      let link = self.has_connection()
         && self
            .subscribers
            .any(|m| m.intersects(EventMask::LINK_QUALITY));
      if link != self.link_polling {
         self.link_polling = link;
         self.actions.push(if link {
            MirrorAction::StartLinkPoll(self.config.link_poll)
         } else {
            MirrorAction::StopLinkPoll
         });
      }

      let mic = self.local.flags.contains(Flag::ScoActive)
         && self
            .subscribers
            .any(|m| m.intersects(EventMask::MIC_QUALITY));
      if mic != self.mic_polling {
         self.mic_polling = mic;
         self.actions.push(if mic {
            MirrorAction::StartMicPoll(self.config.mic_poll)
         } else {
            MirrorAction::StopMicPoll
         });
      }
   }
}

impl HandoverParticipant for Mirror {
   fn veto(&self) -> bool {
      !self.outbox.is_empty() || (!self.paused && !self.is_synced())
   }

   fn marshal(&mut self, ty: MarshalType) -> Option<MarshalData> {
      if ty != MarshalType::PeerState {
         return None;
      }
      let handsets: Vec<LinkQualityEntry> =
         self.local.links.iter().filter(|e| !e.is_peer).copied().collect();
      if handsets.is_empty() {
         return None;
      }
      MarshalData::encode(ty, &handsets)
   }

   fn unmarshal(&mut self, data: MarshalData) -> Unmarshalled {
      let handsets: Vec<LinkQualityEntry> = match data.decode() {
         Ok(v) => v,
         Err(e) => return Unmarshalled::Failed(e.to_string()),
      };
      for entry in handsets {
         if self.local.links.iter().any(|e| e.addr == entry.addr) {
            continue;
         }
         if self.local.links.push(entry).is_err() {
            return Unmarshalled::Failed(format!("no room for link entry {}", entry.addr));
         }
      }
      Unmarshalled::Copied(data)
   }

   fn commit(&mut self, role: Role) {
      let ours = self.local.peer_entry().copied();
      let theirs = self.remote.peer_entry().copied();
      self.local.set_peer_entry(theirs);
      self.remote.set_peer_entry(ours);

      // The side that is no longer primary drops its handset state.
      let before = (self.local.flags, self.remote.flags);
      let (demoted, side) = match role {
         Role::Primary => (&mut self.remote, Side::Remote),
         Role::Secondary => (&mut self.local, Side::Local),
      };
      demoted.links.retain(|e| e.is_peer);
      demoted.flags = demoted.flags.without(StateFlags::PRIMARY_ONLY);
      let handset = demoted.handset.take();

      self.local.flags.set(Flag::IsPrimary, role == Role::Primary);
      self
         .remote
         .flags
         .set(Flag::IsPrimary, role == Role::Secondary);

      for (flag, on) in before.0.changes(self.local.flags) {
         self.notify(MirrorEvent::Flag { side: Side::Local, flag, on });
      }
      for (flag, on) in before.1.changes(self.remote.flags) {
         self.notify(MirrorEvent::Flag { side: Side::Remote, flag, on });
      }
      if handset.is_some() {
         self.notify(MirrorEvent::Handset { side, addr: None });
         if side == Side::Local {
            self.forward(PeerMessage::Handset(None));
         }
      }

      self.forward(PeerMessage::Flags(
         self.local.flags.without(StateFlags::PHYSICAL),
      ));
      self.forward(PeerMessage::LinkQuality(self.local.links.clone()));
      debug!("mirror committed as {role}");
      self.update_polling();
   }
}

#[cfg(test)]
mod tests {
   use tokio::sync::mpsc;

   use super::*;
   use crate::{
      channel::{ChannelEvent, PeerLink},
      peer::snapshot::BatteryStatus,
   };

   fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
      std::iter::from_fn(|| rx.try_recv().ok()).collect()
   }

   fn received(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> Vec<PeerMessage> {
      drain(rx)
         .into_iter()
         .filter_map(|e| match e {
            ChannelEvent::Frame(f) => PeerMessage::from_frame(&f).ok(),
            ChannelEvent::Connected(_) => None,
         })
         .collect()
   }

   fn entry(addr: u8, is_peer: bool) -> LinkQualityEntry {
      LinkQualityEntry {
         addr: BdAddr([addr; 6]),
         rssi: -50,
         link_quality: 200,
         is_peer,
      }
   }

   fn started() -> Mirror {
      let mut mirror = Mirror::new(MirrorConfig::default());
      let mut snap = PeerSnapshot::default();
      snap.set_physical(PhysicalState::InCase);
      snap.flags.set(Flag::IsPrimary, true);
      mirror.start(snap);
      mirror.on_peer_link(true);
      mirror
   }

   #[test]
   fn test_unpause_sends_initial_state_first() {
      let ((a, _a_rx), (_b, mut b_rx)) = PeerLink::pair();
      let mut mirror = started();
      mirror.update_local(LocalUpdate::Battery(BatteryState::new(
         80,
         BatteryStatus::Discharging,
         3900,
      )));
      assert!(mirror.outbox().is_empty());

      mirror.unpause();
      mirror.update_local(LocalUpdate::Flag(Flag::Pairing, true));
      assert_eq!(mirror.flush(&a), 2);

      let msgs = received(&mut b_rx);
      match &msgs[0] {
         PeerMessage::InitialState(snap) => assert_eq!(snap.battery.level, 80),
         other => panic!("expected initial state, got {other:?}"),
      }
      assert!(matches!(msgs[1], PeerMessage::Flags(f) if f.contains(Flag::Pairing)));
   }

   #[test]
   fn test_local_change_notifies_and_coalesces() {
      let (tx, mut rx) = mpsc::unbounded_channel();
      let mut mirror = started();
      mirror.subscribe(tx, EventMask::BATTERY);
      mirror.unpause();
      for level in [90, 85, 80] {
         mirror.update_local(LocalUpdate::Battery(BatteryState::new(
            level,
            BatteryStatus::Discharging,
            3800,
         )));
      }
      mirror.update_local(LocalUpdate::Flag(Flag::Pairing, true));

      assert_eq!(drain(&mut rx).len(), 3);
      let queued: Vec<_> = mirror.outbox().iter().map(PeerMessage::tag).collect();
      assert_eq!(queued, [0, 3, 1]);
   }

   #[test]
   fn test_physical_transition_is_expanded() {
      let (tx, mut rx) = mpsc::unbounded_channel();
      let mut mirror = started();
      mirror.subscribe(tx, EventMask::PHYSICAL);
      mirror.unpause();
      mirror.update_local(LocalUpdate::Physical(PhysicalState::InEar));

      let states: Vec<_> = drain(&mut rx)
         .into_iter()
         .map(|e| match e {
            MirrorEvent::Physical { state, .. } => state,
            other => panic!("unexpected {other:?}"),
         })
         .collect();
      assert_eq!(states, [PhysicalState::OutOfEar, PhysicalState::InEar]);
      let physical = mirror
         .outbox()
         .iter()
         .filter(|m| matches!(m, PeerMessage::Physical(_)))
         .count();
      assert_eq!(physical, 2);
   }

   #[test]
   fn test_initial_state_derives_flag_events() {
      let (tx, mut rx) = mpsc::unbounded_channel();
      let mut mirror = started();
      mirror.subscribe(tx, EventMask::INITIAL_STATE.union(EventMask::FLAGS));

      mirror.on_message(PeerMessage::Flags([Flag::Pairing].into_iter().collect()));
      assert!(drain(&mut rx).is_empty());

      let mut snap = PeerSnapshot::default();
      snap.flags.set(Flag::A2dpConnected, true);
      mirror.on_message(PeerMessage::InitialState(Box::new(snap.clone())));
      assert_eq!(
         drain(&mut rx),
         [
            MirrorEvent::InitialStateReceived,
            MirrorEvent::Flag {
               side: Side::Remote,
               flag: Flag::A2dpConnected,
               on: true
            },
         ]
      );
      assert_eq!(mirror.remote(), &snap);
   }

   #[test]
   fn test_channel_down_keeps_queue_until_reconnect() {
      let ((a, _a_rx), (b, mut b_rx)) = PeerLink::pair();
      let mut mirror = started();
      mirror.unpause();
      b.set_connected(false);
      mirror.update_local(LocalUpdate::MicQuality(Some(3)));
      assert_eq!(mirror.flush(&a), 0);
      assert_eq!(mirror.outbox().len(), 2);

      b.set_connected(true);
      mirror.on_channel(true);
      assert_eq!(mirror.flush(&a), 2);
      assert_eq!(received(&mut b_rx).len(), 2);
   }

   #[test]
   fn test_peer_link_loss_repauses() {
      let ((a, _a_rx), (_b, mut b_rx)) = PeerLink::pair();
      let mut mirror = started();
      mirror.unpause();
      mirror.flush(&a);
      mirror.on_message(PeerMessage::InitialState(Box::default()));
      assert!(mirror.is_synced());

      mirror.on_peer_link(false);
      assert!(mirror.is_paused());
      assert!(!mirror.is_synced());
      mirror.update_local(LocalUpdate::Flag(Flag::Advertising, true));
      assert!(mirror.outbox().is_empty());

      mirror.on_peer_link(true);
      mirror.unpause();
      mirror.flush(&a);
      let msgs = received(&mut b_rx);
      assert!(matches!(msgs.last(), Some(PeerMessage::InitialState(s))
         if s.flags.contains(Flag::Advertising)));
   }

   #[test]
   fn test_link_poll_needs_subscriber_and_connection() {
      let (tx, _rx) = mpsc::unbounded_channel();
      let mut mirror = Mirror::new(MirrorConfig::default());
      mirror.start(PeerSnapshot::default());
      mirror.subscribe(tx.clone(), EventMask::LINK_QUALITY);
      assert!(mirror.take_actions().is_empty());

      mirror.on_peer_link(true);
      assert_eq!(
         mirror.take_actions(),
         [MirrorAction::StartLinkPoll(Duration::from_secs(1))]
      );
      mirror.unsubscribe(&tx);
      assert_eq!(mirror.take_actions(), [MirrorAction::StopLinkPoll]);
   }

   #[test]
   fn test_mic_poll_follows_sco() {
      let (tx, _rx) = mpsc::unbounded_channel();
      let mut mirror = started();
      mirror.subscribe(tx, EventMask::MIC_QUALITY);
      mirror.take_actions();
      mirror.update_local(LocalUpdate::Flag(Flag::ScoActive, true));
      assert!(matches!(mirror.take_actions()[..], [MirrorAction::StartMicPoll(_)]));
      mirror.update_local(LocalUpdate::Flag(Flag::ScoActive, false));
      assert_eq!(mirror.take_actions(), [MirrorAction::StopMicPoll]);
   }

   #[test]
   fn test_veto_until_synced() {
      let ((a, _a_rx), _b) = PeerLink::pair();
      let mut mirror = started();
      mirror.unpause();
      assert!(mirror.veto());
      mirror.flush(&a);
      assert!(mirror.veto());
      mirror.on_message(PeerMessage::InitialState(Box::default()));
      assert!(!mirror.veto());
   }

   #[test]
   fn test_commit_swaps_peer_entry_and_demotes() {
      let mut mirror = started();
      mirror.update_local(LocalUpdate::LinkQuality(
         [entry(1, false), entry(9, true)].into_iter().collect(),
      ));
      mirror.update_local(LocalUpdate::Flag(Flag::HfpConnected, true));
      mirror.update_local(LocalUpdate::Handset(Some(BdAddr([1; 6]))));
      mirror.on_message(PeerMessage::InitialState(Box::new(PeerSnapshot {
         links: [entry(8, true)].into_iter().collect(),
         ..Default::default()
      })));

      let data = mirror.marshal(MarshalType::PeerState).unwrap();
      let handsets: Vec<LinkQualityEntry> = data.decode().unwrap();
      assert_eq!(handsets, [entry(1, false)]);

      mirror.commit(Role::Secondary);
      let local = mirror.local();
      assert_eq!(local.links.as_slice(), [entry(8, true)]);
      assert!(!local.flags.contains(Flag::HfpConnected));
      assert!(!local.is_primary());
      assert_eq!(local.handset, None);
      assert_eq!(mirror.remote().peer_entry(), Some(&entry(9, true)));
      assert!(mirror.remote().is_primary());
   }

   #[test]
   fn test_demotion_is_forwarded_to_peer() {
      let ((a, _a_rx), (_b, mut b_rx)) = PeerLink::pair();
      let (tx, mut rx) = mpsc::unbounded_channel();
      let mut mirror = started();
      mirror.subscribe(tx, EventMask::FLAGS.union(EventMask::HANDSET));
      mirror.unpause();
      mirror.update_local(LocalUpdate::Flag(Flag::A2dpConnected, true));
      mirror.update_local(LocalUpdate::Handset(Some(BdAddr([1; 6]))));
      mirror.flush(&a);
      received(&mut b_rx);
      drain(&mut rx);

      mirror.commit(Role::Secondary);
      let events = drain(&mut rx);
      assert!(events.contains(&MirrorEvent::Flag {
         side: Side::Local,
         flag: Flag::A2dpConnected,
         on: false
      }));
      assert!(events.contains(&MirrorEvent::Handset { side: Side::Local, addr: None }));

      mirror.flush(&a);
      let msgs = received(&mut b_rx);
      assert!(msgs.contains(&PeerMessage::Handset(None)));
      assert!(msgs.iter().any(|m| matches!(m, PeerMessage::Flags(f)
         if !f.contains(Flag::A2dpConnected) && !f.contains(Flag::IsPrimary))));
   }

   #[test]
   fn test_promotion_clears_remote_handset_state() {
      let (tx, mut rx) = mpsc::unbounded_channel();
      let mut mirror = Mirror::new(MirrorConfig::default());
      mirror.start(PeerSnapshot::default());
      mirror.on_peer_link(true);
      mirror.subscribe(tx, EventMask::FLAGS.union(EventMask::HANDSET));
      let mut theirs = PeerSnapshot {
         handset: Some(BdAddr([1; 6])),
         links: [entry(1, false), entry(8, true)].into_iter().collect(),
         ..Default::default()
      };
      theirs.flags.set(Flag::IsPrimary, true);
      theirs.flags.set(Flag::HandsetAclConnected, true);
      theirs.flags.set(Flag::HfpConnected, true);
      mirror.on_message(PeerMessage::InitialState(Box::new(theirs)));
      drain(&mut rx);

      mirror.commit(Role::Primary);
      let remote = mirror.remote();
      assert_eq!(remote.handset, None);
      assert!(!remote.is_primary());
      assert!(!remote.flags.contains(Flag::HandsetAclConnected));
      assert!(!remote.flags.contains(Flag::HfpConnected));
      assert!(remote.links.iter().all(|e| e.is_peer));
      assert!(mirror.local().is_primary());
      assert!(drain(&mut rx).contains(&MirrorEvent::Handset {
         side: Side::Remote,
         addr: None
      }));
   }

   #[test]
   fn test_unmarshal_adds_handset_entries() {
      let mut mirror = started();
      let data = MarshalData::encode(MarshalType::PeerState, &vec![entry(4, false)]).unwrap();
      assert!(matches!(mirror.unmarshal(data), Unmarshalled::Copied(_)));
      assert_eq!(mirror.local().links.as_slice(), [entry(4, false)]);
   }
}
