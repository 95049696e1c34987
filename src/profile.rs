//! Profile engine boundary.
//!
//! The audio and call-control profiles are driven by an external engine.
//! Sessions ask it to connect or disconnect a set of profiles and get a
//! completion back with one result per profile. Connected/disconnected
//! indications for individual profiles arrive on their own, independent
//! of any request.

use std::{
   fmt,
   sync::Arc,
};

use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tokio::sync::mpsc;

use crate::{address::BdAddr, error::Status};

/// A single handset profile.
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
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum Profile {
   Hfp = 0,
   A2dp = 1,
   Avrcp = 2,
}

impl Profile {
   const fn bit(self) -> u8 {
      1 << self as u8
   }
}

/// Bitmask of profiles.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ProfileSet(u8);

impl ProfileSet {
   pub const EMPTY: Self = Self(0);
   pub const HFP: Self = Self(Profile::Hfp.bit());
   pub const A2DP: Self = Self(Profile::A2dp.bit());
   pub const AVRCP: Self = Self(Profile::Avrcp.bit());
   pub const ALL: Self = Self(Self::HFP.0 | Self::A2DP.0 | Self::AVRCP.0);

   pub const fn from_bits(bits: u8) -> Self {
      Self(bits & Self::ALL.0)
   }

   pub const fn bits(self) -> u8 {
      self.0
   }

   pub const fn is_empty(self) -> bool {
      self.0 == 0
   }

   pub const fn contains(self, profile: Profile) -> bool {
      self.0 & profile.bit() != 0
   }

   pub const fn union(self, other: Self) -> Self {
      Self(self.0 | other.0)
   }

   pub const fn intersect(self, other: Self) -> Self {
      Self(self.0 & other.0)
   }

   pub const fn without(self, other: Self) -> Self {
      Self(self.0 & !other.0)
   }

   pub const fn with(self, profile: Profile) -> Self {
      Self(self.0 | profile.bit())
   }

   pub const fn remove(self, profile: Profile) -> Self {
      Self(self.0 & !profile.bit())
   }

   pub fn iter(self) -> impl Iterator<Item = Profile> {
      use strum::IntoEnumIterator;
      Profile::iter().filter(move |p| self.contains(*p))
   }
}

impl From<Profile> for ProfileSet {
   fn from(profile: Profile) -> Self {
      Self(profile.bit())
   }
}

impl FromIterator<Profile> for ProfileSet {
   fn from_iter<I: IntoIterator<Item = Profile>>(iter: I) -> Self {
      iter.into_iter().fold(Self::EMPTY, Self::with)
   }
}

impl fmt::Debug for ProfileSet {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_set().entries(self.iter()).finish()
   }
}

impl fmt::Display for ProfileSet {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      if self.is_empty() {
         return f.write_str("none");
      }
      for (i, profile) in self.iter().enumerate() {
         if i > 0 {
            f.write_str("+")?;
         }
         write!(f, "{profile}")?;
      }
      Ok(())
   }
}

/// Per-profile outcome of a request.
pub type ProfileResults = SmallVec<[(Profile, Status); 3]>;

/// Overall status of a request: the first failure, or success.
pub fn overall(results: &[(Profile, Status)]) -> Status {
   results
      .iter()
      .map(|(_, s)| *s)
      .find(|s| !s.is_success())
      .unwrap_or(Status::Success)
}

/// Indications from the profile engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileEvent {
   ConnectCfm { addr: BdAddr, results: ProfileResults },
   DisconnectCfm { addr: BdAddr, results: ProfileResults },
   Connected { addr: BdAddr, profile: Profile },
   Disconnected { addr: BdAddr, profile: Profile },
}

/// Requests into the profile engine. Each request is answered by a
/// `ConnectCfm`/`DisconnectCfm` indication.
pub trait ProfileEngine: Send + Sync {
   fn connect_profiles(&self, addr: BdAddr, profiles: ProfileSet);
   fn disconnect_profiles(&self, addr: BdAddr, profiles: ProfileSet);
}

/// What a [`SimProfileEngine`] saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileCall {
   Connect(BdAddr, ProfileSet),
   Disconnect(BdAddr, ProfileSet),
}

#[derive(Debug, Default)]
struct SimProfileState {
   calls: Vec<ProfileCall>,
   failing: ProfileSet,
   manual: bool,
}

/// Profile engine that answers from a script.
///
/// Connects succeed unless the profile is marked failing; every
/// connected profile is also reported through a `Connected` indication.
/// In manual mode nothing is answered and tests deliver completions
/// themselves.
#[derive(Debug, Clone)]
pub struct SimProfileEngine {
   events: mpsc::UnboundedSender<ProfileEvent>,
   state: Arc<Mutex<SimProfileState>>,
}

impl SimProfileEngine {
   pub fn new(events: mpsc::UnboundedSender<ProfileEvent>) -> Self {
      Self {
         events,
         state: Arc::default(),
      }
   }

   pub fn set_failing(&self, profiles: ProfileSet) {
      self.state.lock().failing = profiles;
   }

   pub fn set_manual(&self, manual: bool) {
      self.state.lock().manual = manual;
   }

   pub fn calls(&self) -> Vec<ProfileCall> {
      self.state.lock().calls.clone()
   }

   /// Injects an indication as if the engine had raised it.
   pub fn inject(&self, event: ProfileEvent) {
      let _ = self.events.send(event);
   }
}

impl ProfileEngine for SimProfileEngine {
   fn connect_profiles(&self, addr: BdAddr, profiles: ProfileSet) {
      let (manual, failing) = {
         let mut state = self.state.lock();
         state.calls.push(ProfileCall::Connect(addr, profiles));
         (state.manual, state.failing)
      };
      debug!("sim: connect {profiles} on {addr}");
      if manual {
         return;
      }
      let mut results = ProfileResults::new();
      for profile in profiles.iter() {
         if failing.contains(profile) {
            results.push((profile, Status::Failure));
         } else {
            results.push((profile, Status::Success));
            let _ = self.events.send(ProfileEvent::Connected { addr, profile });
         }
      }
      let _ = self.events.send(ProfileEvent::ConnectCfm { addr, results });
   }

   fn disconnect_profiles(&self, addr: BdAddr, profiles: ProfileSet) {
      let manual = {
         let mut state = self.state.lock();
         state.calls.push(ProfileCall::Disconnect(addr, profiles));
         state.manual
      };
      debug!("sim: disconnect {profiles} on {addr}");
      if manual {
         return;
      }
      let mut results = ProfileResults::new();
      for profile in profiles.iter() {
         let _ = self.events.send(ProfileEvent::Disconnected { addr, profile });
         results.push((profile, Status::Success));
      }
      let _ = self.events.send(ProfileEvent::DisconnectCfm { addr, results });
   }
}
