//! Handset session states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Sub-phase of the connecting pseudo-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectingPhase {
   /// Waiting for the classic link.
   Acl,
   /// Link up, profiles being connected.
   Profiles,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SessionState {
   #[default]
   Disconnected,
   Connecting(ConnectingPhase),
   ConnectedBredr,
   DisconnectingBredr,
   ConnectedLe,
   DisconnectingLe,
}

impl SessionState {
   pub const fn is_connecting(self) -> bool {
      matches!(self, Self::Connecting(_))
   }

   pub const fn is_disconnecting(self) -> bool {
      matches!(self, Self::DisconnectingBredr | Self::DisconnectingLe)
   }

   /// Connecting or disconnecting.
   pub const fn is_transient(self) -> bool {
      self.is_connecting() || self.is_disconnecting()
   }

   pub const fn is_connected(self) -> bool {
      matches!(self, Self::ConnectedBredr | Self::ConnectedLe)
   }
}

impl fmt::Display for SessionState {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(match self {
         Self::Disconnected => "disconnected",
         Self::Connecting(ConnectingPhase::Acl) => "connecting(acl)",
         Self::Connecting(ConnectingPhase::Profiles) => "connecting(profiles)",
         Self::ConnectedBredr => "connected(bredr)",
         Self::DisconnectingBredr => "disconnecting(bredr)",
         Self::ConnectedLe => "connected(le)",
         Self::DisconnectingLe => "disconnecting(le)",
      })
   }
}
