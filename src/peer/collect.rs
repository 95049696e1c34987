//! Sub-collectors that assemble the local snapshot.
//!
//! Sensor-backed values (battery, physical position, motion, pairing and
//! feature modes) come from a [`LocalSensors`] implementation; connection
//! state is read off the link and session managers.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
   address::{BdAddr, TransportMask},
   controller::Controller,
   handover::Role,
   link::{LinkManager, LinkState},
   peer::snapshot::{
      BatteryState, FeatureMode, Flag, LinkQualities, LinkQualityEntry, PeerSnapshot,
      PhysicalState, StateFlags,
   },
   profile::Profile,
   session::{SessionManager, SessionState},
};

/// On-board sensors and local device modes.
pub trait LocalSensors: Send + Sync {
   fn battery(&self) -> BatteryState;
   fn physical(&self) -> PhysicalState;
   fn in_motion(&self) -> bool;
   fn pairing(&self) -> bool;
   fn advertising(&self) -> bool;
   fn feature_mode(&self) -> FeatureMode;
}

#[derive(Debug, Default)]
struct SensorState {
   battery: BatteryState,
   physical: PhysicalState,
   in_motion: bool,
   pairing: bool,
   advertising: bool,
   feature_mode: FeatureMode,
}

/// Sensors whose readings are set by hand. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct SimSensors(Arc<Mutex<SensorState>>);

impl SimSensors {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn set_battery(&self, battery: BatteryState) {
      self.0.lock().battery = battery;
   }

   pub fn set_physical(&self, physical: PhysicalState) {
      self.0.lock().physical = physical;
   }

   pub fn set_in_motion(&self, in_motion: bool) {
      self.0.lock().in_motion = in_motion;
   }

   pub fn set_pairing(&self, pairing: bool) {
      self.0.lock().pairing = pairing;
   }

   pub fn set_advertising(&self, advertising: bool) {
      self.0.lock().advertising = advertising;
   }

   pub fn set_feature_mode(&self, mode: FeatureMode) {
      self.0.lock().feature_mode = mode;
   }
}

impl LocalSensors for SimSensors {
   fn battery(&self) -> BatteryState {
      self.0.lock().battery
   }

   fn physical(&self) -> PhysicalState {
      self.0.lock().physical
   }

   fn in_motion(&self) -> bool {
      self.0.lock().in_motion
   }

   fn pairing(&self) -> bool {
      self.0.lock().pairing
   }

   fn advertising(&self) -> bool {
      self.0.lock().advertising
   }

   fn feature_mode(&self) -> FeatureMode {
      self.0.lock().feature_mode
   }
}

/// Signal and link quality of every connected link.
pub fn links(links: &LinkManager, controller: &dyn Controller) -> LinkQualities {
   let mut out = LinkQualities::new();
   for record in links
      .registry()
      .iter()
      .filter(|r| r.state() == LinkState::Connected)
   {
      let entry = LinkQualityEntry {
         addr: record.address.addr,
         rssi: controller.signal_strength(&record.address).unwrap_or(i8::MIN),
         link_quality: controller.link_quality(&record.address).unwrap_or(0),
         is_peer: links.is_peer(&record.address),
      };
      if out.push(entry).is_err() {
         break;
      }
   }
   out
}

pub fn battery(sensors: &dyn LocalSensors) -> BatteryState {
   sensors.battery()
}

pub fn pairing(sensors: &dyn LocalSensors) -> StateFlags {
   let mut flags = StateFlags::EMPTY;
   flags.set(Flag::Pairing, sensors.pairing());
   flags.set(Flag::Advertising, sensors.advertising());
   flags
}

pub fn feature_mode(sensors: &dyn LocalSensors) -> FeatureMode {
   sensors.feature_mode()
}

/// Connection-derived part of the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Connection {
   pub flags: StateFlags,
   pub handset: Option<BdAddr>,
}

pub fn connection(links: &LinkManager, sessions: &SessionManager) -> Connection {
   let mut flags = StateFlags::EMPTY;
   let connected =
      |mask| links.handset_link(mask).is_some_and(|r| r.state() == LinkState::Connected);
   flags.set(Flag::HandsetAclConnected, connected(TransportMask::BREDR));
   flags.set(Flag::LeConnected, connected(TransportMask::LE));

   let active = sessions
      .iter()
      .find(|s| s.state() == SessionState::ConnectedBredr);
   if let Some(session) = active {
      flags.set(Flag::HfpConnected, session.connected.contains(Profile::Hfp));
      flags.set(Flag::A2dpConnected, session.connected.contains(Profile::A2dp));
      flags.set(Flag::AvrcpConnected, session.connected.contains(Profile::Avrcp));
   }
   Connection {
      flags,
      handset: active.and_then(|s| s.device),
   }
}

/// Builds the whole local snapshot.
pub fn assemble(
   role: Role,
   sensors: &dyn LocalSensors,
   link_manager: &LinkManager,
   sessions: &SessionManager,
   controller: &dyn Controller,
) -> PeerSnapshot {
   let conn = connection(link_manager, sessions);
   let mut snapshot = PeerSnapshot {
      flags: conn.flags.union(pairing(sensors)),
      battery: battery(sensors),
      handset: conn.handset,
      links: links(link_manager, controller),
      mic_quality: controller.mic_quality(),
      feature_mode: feature_mode(sensors),
   };
   snapshot.set_physical(sensors.physical());
   snapshot.flags.set(Flag::InMotion, sensors.in_motion());
   snapshot.flags.set(Flag::IsPrimary, role == Role::Primary);
   snapshot
}
