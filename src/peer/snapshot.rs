//! The state each earbud publishes to the other.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::address::BdAddr;

/// Upper bound on per-link quality entries (handsets plus the peer).
pub const MAX_LINK_ENTRIES: usize = 4;

/// A single boolean in [`StateFlags`].
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
   strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum Flag {
   InCase = 0,
   InEar,
   HfpConnected,
   A2dpConnected,
   AvrcpConnected,
   A2dpStreaming,
   ScoActive,
   Pairing,
   Advertising,
   LeConnected,
   HandsetAclConnected,
   InMotion,
   IsPrimary,
}

impl Flag {
   pub const fn bit(self) -> u32 {
      1 << self as u8
   }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct StateFlags(u32);

impl StateFlags {
   pub const EMPTY: Self = Self(0);
   /// Bits carried by physical-state messages rather than flag messages.
   pub const PHYSICAL: Self = Self(Flag::InCase.bit() | Flag::InEar.bit());
   pub const PROFILES: Self = Self(
      Flag::HfpConnected.bit()
         | Flag::A2dpConnected.bit()
         | Flag::AvrcpConnected.bit()
         | Flag::A2dpStreaming.bit()
         | Flag::ScoActive.bit(),
   );
   /// Cleared when a device becomes secondary.
   pub const PRIMARY_ONLY: Self = Self(
      Self::PROFILES.0
         | Flag::Pairing.bit()
         | Flag::Advertising.bit()
         | Flag::LeConnected.bit()
         | Flag::HandsetAclConnected.bit(),
   );

   /// Derived from link and session state by the connection collector.
   pub const CONNECTION: Self = Self(
      Flag::HfpConnected.bit()
         | Flag::A2dpConnected.bit()
         | Flag::AvrcpConnected.bit()
         | Flag::LeConnected.bit()
         | Flag::HandsetAclConnected.bit(),
   );

   pub const fn bits(self) -> u32 {
      self.0
   }

   pub const fn contains(self, flag: Flag) -> bool {
      self.0 & flag.bit() != 0
   }

   /// Returns `true` if the flag changed.
   pub fn set(&mut self, flag: Flag, on: bool) -> bool {
      let before = self.0;
      if on {
         self.0 |= flag.bit();
      } else {
         self.0 &= !flag.bit();
      }
      before != self.0
   }

   pub const fn without(self, other: Self) -> Self {
      Self(self.0 & !other.0)
   }

   pub const fn intersect(self, other: Self) -> Self {
      Self(self.0 & other.0)
   }

   pub const fn union(self, other: Self) -> Self {
      Self(self.0 | other.0)
   }

   /// Flags that differ, with their value in `other`.
   pub fn changes(self, other: Self) -> impl Iterator<Item = (Flag, bool)> {
      let diff = self.0 ^ other.0;
      Flag::iter()
         .filter(move |f| diff & f.bit() != 0)
         .map(move |f| (f, other.contains(f)))
   }

   pub fn iter(self) -> impl Iterator<Item = Flag> {
      Flag::iter().filter(move |f| self.contains(*f))
   }
}

impl FromIterator<Flag> for StateFlags {
   fn from_iter<I: IntoIterator<Item = Flag>>(iter: I) -> Self {
      Self(iter.into_iter().fold(0, |acc, f| acc | f.bit()))
   }
}

impl fmt::Debug for StateFlags {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_set().entries(self.iter()).finish()
   }
}

/// Where the earbud physically is.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   PartialOrd,
   Ord,
   Hash,
   Default,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
   strum::FromRepr,
)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum PhysicalState {
   #[default]
   InCase = 0,
   OutOfEar = 1,
   InEar = 2,
}

impl PhysicalState {
   /// Every state passed through on the way to `target`, `target`
   /// included. Moving between the case and the ear always passes
   /// through out-of-ear.
   pub fn path_to(self, target: Self) -> heapless::Vec<Self, 2> {
      let (from, to) = (self as u8, target as u8);
      let steps: heapless::Vec<Self, 2> = if from < to {
         (from + 1..=to).filter_map(Self::from_repr).collect()
      } else {
         (to..from).rev().filter_map(Self::from_repr).collect()
      };
      steps
   }

   fn flags(self) -> StateFlags {
      match self {
         Self::InCase => [Flag::InCase].into_iter().collect(),
         Self::OutOfEar => StateFlags::EMPTY,
         Self::InEar => [Flag::InEar].into_iter().collect(),
      }
   }
}

#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum BatteryStatus {
   #[default]
   Unknown,
   Discharging,
   Charging,
   Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatteryState {
   /// Percent, 0..=100.
   pub level: u8,
   pub status: BatteryStatus,
   pub voltage_mv: u16,
}

impl BatteryState {
   pub const fn new(level: u8, status: BatteryStatus, voltage_mv: u16) -> Self {
      Self {
         level,
         status,
         voltage_mv,
      }
   }

   pub fn is_charging(&self) -> bool {
      self.status == BatteryStatus::Charging
   }
}

#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
pub enum NoiseControl {
   #[default]
   #[strum(serialize = "off")]
   Off,
   #[strum(serialize = "anc")]
   Anc,
   #[strum(serialize = "transparency", serialize = "trans")]
   Transparency,
}

/// Feature-mode fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeatureMode {
   pub noise_control: NoiseControl,
   pub leakthrough: bool,
   pub leakthrough_level: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkQualityEntry {
   pub addr: BdAddr,
   /// dBm.
   pub rssi: i8,
   pub link_quality: u16,
   pub is_peer: bool,
}

pub type LinkQualities = heapless::Vec<LinkQualityEntry, MAX_LINK_ENTRIES>;

/// One earbud's published state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PeerSnapshot {
   pub flags: StateFlags,
   pub battery: BatteryState,
   pub handset: Option<BdAddr>,
   pub links: LinkQualities,
   pub mic_quality: Option<u8>,
   pub feature_mode: FeatureMode,
}

impl PeerSnapshot {
   pub fn physical(&self) -> PhysicalState {
      if self.flags.contains(Flag::InCase) {
         PhysicalState::InCase
      } else if self.flags.contains(Flag::InEar) {
         PhysicalState::InEar
      } else {
         PhysicalState::OutOfEar
      }
   }

   pub fn set_physical(&mut self, state: PhysicalState) {
      self.flags = self.flags.without(StateFlags::PHYSICAL).union(state.flags());
   }

   pub fn is_primary(&self) -> bool {
      self.flags.contains(Flag::IsPrimary)
   }

   pub fn peer_entry(&self) -> Option<&LinkQualityEntry> {
      self.links.iter().find(|e| e.is_peer)
   }

   /// Replaces the peer-link entry, or removes it when `entry` is `None`.
   pub fn set_peer_entry(&mut self, entry: Option<LinkQualityEntry>) {
      self.links.retain(|e| !e.is_peer);
      if let Some(entry) = entry
         && self.links.push(entry).is_err()
      {
         log::warn!("No room for peer link entry {}", entry.addr);
      }
   }

   pub fn to_json(&self) -> serde_json::Value {
      serde_json::json!({
         "flags": self.flags.iter().map(|f| f.to_string()).collect::<Vec<_>>(),
         "physical": self.physical().to_string(),
         "battery_level": self.battery.level,
         "battery_status": self.battery.status.to_string(),
         "battery_voltage_mv": self.battery.voltage_mv,
         "handset": self.handset.map(|a| a.to_string()),
         "links": self.links.iter().map(|e| serde_json::json!({
            "addr": e.addr.to_string(),
            "rssi": e.rssi,
            "link_quality": e.link_quality,
            "peer": e.is_peer,
         })).collect::<Vec<_>>(),
         "mic_quality": self.mic_quality,
         "noise_control": self.feature_mode.noise_control.to_string(),
         "leakthrough": self.feature_mode.leakthrough,
      })
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_physical_paths_pass_out_of_ear() {
      use PhysicalState::*;
      assert_eq!(InCase.path_to(InEar).as_slice(), [OutOfEar, InEar]);
      assert_eq!(InEar.path_to(InCase).as_slice(), [OutOfEar, InCase]);
      assert_eq!(OutOfEar.path_to(InEar).as_slice(), [InEar]);
      assert!(InEar.path_to(InEar).is_empty());
   }

   #[test]
   fn test_physical_round_trips_through_flags() {
      let mut snap = PeerSnapshot::default();
      for state in [PhysicalState::InEar, PhysicalState::OutOfEar, PhysicalState::InCase] {
         snap.set_physical(state);
         assert_eq!(snap.physical(), state);
      }
   }

   #[test]
   fn test_flag_changes() {
      let before: StateFlags = [Flag::InEar, Flag::Pairing].into_iter().collect();
      let after: StateFlags = [Flag::InEar, Flag::ScoActive].into_iter().collect();
      let changes: Vec<_> = before.changes(after).collect();
      assert_eq!(changes, [(Flag::ScoActive, true), (Flag::Pairing, false)]);
   }

   #[test]
   fn test_peer_entry_replaced() {
      let mut snap = PeerSnapshot::default();
      let entry = |addr: u8, is_peer| LinkQualityEntry {
         addr: BdAddr([addr; 6]),
         rssi: -40,
         link_quality: 255,
         is_peer,
      };
      snap.links.push(entry(1, false)).unwrap();
      snap.set_peer_entry(Some(entry(2, true)));
      snap.set_peer_entry(Some(entry(3, true)));
      assert_eq!(snap.links.len(), 2);
      assert_eq!(snap.peer_entry().map(|e| e.addr), Some(BdAddr([3; 6])));
      snap.set_peer_entry(None);
      assert!(snap.peer_entry().is_none());
   }
}
