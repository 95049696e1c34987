//! Per-link states and the lock derived from them.

use serde::{Deserialize, Serialize};

/// State of one radio link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, strum::Display)]
pub enum LinkState {
   #[default]
   Disconnected,
   /// Dropped by supervision timeout; the record may be reclaimed.
   DisconnectedLinkLoss,
   /// The remote side is opening the link.
   ConnectingControllerInitiated,
   /// We asked the controller to open the link.
   ConnectingLocalInitiated,
   /// Open queued to ourselves so QoS can be fixed before the controller
   /// call is made.
   ConnectingInternal,
   Connected,
}

impl LinkState {
   pub const fn is_connecting(self) -> bool {
      matches!(
         self,
         Self::ConnectingControllerInitiated
            | Self::ConnectingLocalInitiated
            | Self::ConnectingInternal
      )
   }

   pub const fn is_disconnected(self) -> bool {
      matches!(self, Self::Disconnected | Self::DisconnectedLinkLoss)
   }

   /// Connected or on the way there.
   pub const fn is_active(self) -> bool {
      !self.is_disconnected()
   }

   /// Lock token for this state. Non-zero exactly for the connecting
   /// states.
   pub const fn lock(self) -> LinkLock {
      match self {
         Self::ConnectingControllerInitiated => LinkLock::REMOTE_OPEN,
         Self::ConnectingLocalInitiated => LinkLock::LOCAL_OPEN,
         Self::ConnectingInternal => LinkLock::INTERNAL_OPEN,
         Self::Disconnected | Self::DisconnectedLinkLoss | Self::Connected => LinkLock::NONE,
      }
   }
}

/// Advisory busy mask polled by other components before they act on a
/// link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct LinkLock(u16);

impl LinkLock {
   pub const NONE: Self = Self(0);
   pub const REMOTE_OPEN: Self = Self(1 << 0);
   pub const LOCAL_OPEN: Self = Self(1 << 1);
   pub const INTERNAL_OPEN: Self = Self(1 << 2);

   pub const fn is_clear(self) -> bool {
      self.0 == 0
   }

   pub const fn bits(self) -> u16 {
      self.0
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_lock_nonzero_iff_connecting() {
      let all = [
         LinkState::Disconnected,
         LinkState::DisconnectedLinkLoss,
         LinkState::ConnectingControllerInitiated,
         LinkState::ConnectingLocalInitiated,
         LinkState::ConnectingInternal,
         LinkState::Connected,
      ];
      for state in all {
         assert_eq!(!state.lock().is_clear(), state.is_connecting(), "{state}");
      }
   }
}
