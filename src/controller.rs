//! Radio controller boundary.
//!
//! Link open/close requests are fire-and-forget; their outcome comes back
//! later as a [`ControllerEvent`] on the core's inbound channel.

use std::{collections::HashMap, sync::Arc};

use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
   address::TypedAddress,
   error::Status,
   link::qos::ConnParams,
};

#[cfg(feature = "bluez")]
pub mod bluez;

/// Why a link went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
   /// Supervision timeout.
   LinkLoss,
   RemoteTerminated,
   LocalTerminated,
   Other(u8),
}

impl DisconnectReason {
   /// Maps an HCI reason code.
   pub const fn from_code(code: u8) -> Self {
      match code {
         0x08 => Self::LinkLoss,
         0x13..=0x15 => Self::RemoteTerminated,
         0x16 => Self::LocalTerminated,
         other => Self::Other(other),
      }
   }

   pub const fn code(self) -> u8 {
      match self {
         Self::LinkLoss => 0x08,
         Self::RemoteTerminated => 0x13,
         Self::LocalTerminated => 0x16,
         Self::Other(code) => code,
      }
   }
}

/// Indications raised by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerEvent {
   /// A remote started opening a link to us.
   ConnectRequested { addr: TypedAddress },
   /// A link open finished, successfully or not.
   Connected {
      addr: TypedAddress,
      incoming: bool,
      status: Status,
   },
   Disconnected {
      addr: TypedAddress,
      reason: DisconnectReason,
   },
}

/// Operations on the radio controller.
pub trait Controller: Send + Sync {
   fn open_link(&self, addr: &TypedAddress);
   fn close_link(&self, addr: &TypedAddress, force: bool);
   /// Controller-wide default LE parameters for new links.
   fn set_default_parameters(&self, params: &ConnParams);
   fn update_parameters(&self, addr: &TypedAddress, params: &ConnParams);
   fn set_connectable(&self, connectable: bool);
   /// RSSI in dBm.
   fn signal_strength(&self, addr: &TypedAddress) -> Option<i8>;
   /// Controller link quality metric, 0..=0xFF.
   fn link_quality(&self, addr: &TypedAddress) -> Option<u16>;
   /// Microphone quality of the active voice link, 0..=15.
   fn mic_quality(&self) -> Option<u8>;
}

/// What a [`SimController`] saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerCall {
   Open(TypedAddress),
   Close(TypedAddress, bool),
   SetDefault(ConnParams),
   Update(TypedAddress, ConnParams),
   Connectable(bool),
}

#[derive(Debug, Default)]
struct SimControllerState {
   calls: Vec<ControllerCall>,
   /// Remaining failed opens per address.
   failures: HashMap<TypedAddress, u32>,
   rssi: HashMap<TypedAddress, i8>,
   mic_quality: Option<u8>,
   manual: bool,
}

/// Controller that completes every request immediately from a script.
#[derive(Debug, Clone)]
pub struct SimController {
   events: mpsc::UnboundedSender<ControllerEvent>,
   state: Arc<Mutex<SimControllerState>>,
}

impl SimController {
   pub fn new(events: mpsc::UnboundedSender<ControllerEvent>) -> Self {
      Self {
         events,
         state: Arc::default(),
      }
   }

   /// The next `count` opens of `addr` fail.
   pub fn fail_opens(&self, addr: TypedAddress, count: u32) {
      self.state.lock().failures.insert(addr, count);
   }

   /// Stops answering open requests; tests drive indications themselves.
   pub fn set_manual(&self, manual: bool) {
      self.state.lock().manual = manual;
   }

   pub fn set_rssi(&self, addr: TypedAddress, rssi: i8) {
      self.state.lock().rssi.insert(addr, rssi);
   }

   pub fn set_mic_quality(&self, quality: Option<u8>) {
      self.state.lock().mic_quality = quality;
   }

   pub fn calls(&self) -> Vec<ControllerCall> {
      self.state.lock().calls.clone()
   }

   pub fn clear_calls(&self) {
      self.state.lock().calls.clear();
   }

   /// Raises an indication as if it came off the radio.
   pub fn inject(&self, event: ControllerEvent) {
      let _ = self.events.send(event);
   }
}

impl Controller for SimController {
   fn open_link(&self, addr: &TypedAddress) {
      let outcome = {
         let mut state = self.state.lock();
         state.calls.push(ControllerCall::Open(*addr));
         if state.manual {
            None
         } else {
            match state.failures.get_mut(addr) {
               Some(left) if *left > 0 => {
                  *left -= 1;
                  Some(Status::Failure)
               },
               _ => Some(Status::Success),
            }
         }
      };
      debug!("sim: open {addr} -> {outcome:?}");
      if let Some(status) = outcome {
         self.inject(ControllerEvent::Connected {
            addr: *addr,
            incoming: false,
            status,
         });
      }
   }

   fn close_link(&self, addr: &TypedAddress, force: bool) {
      let manual = {
         let mut state = self.state.lock();
         state.calls.push(ControllerCall::Close(*addr, force));
         state.manual
      };
      debug!("sim: close {addr} (force: {force})");
      if !manual {
         self.inject(ControllerEvent::Disconnected {
            addr: *addr,
            reason: DisconnectReason::LocalTerminated,
         });
      }
   }

   fn set_default_parameters(&self, params: &ConnParams) {
      self.state.lock().calls.push(ControllerCall::SetDefault(*params));
   }

   fn update_parameters(&self, addr: &TypedAddress, params: &ConnParams) {
      self.state.lock().calls.push(ControllerCall::Update(*addr, *params));
   }

   fn set_connectable(&self, connectable: bool) {
      self.state.lock().calls.push(ControllerCall::Connectable(connectable));
   }

   fn signal_strength(&self, addr: &TypedAddress) -> Option<i8> {
      self.state.lock().rssi.get(addr).copied()
   }

   fn link_quality(&self, addr: &TypedAddress) -> Option<u16> {
      self.state.lock().rssi.get(addr).map(|_| 0xFF)
   }

   fn mic_quality(&self) -> Option<u8> {
      self.state.lock().mic_quality
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::address::BdAddr;

   #[test]
   fn test_reason_codes() {
      assert_eq!(DisconnectReason::from_code(0x08), DisconnectReason::LinkLoss);
      assert_eq!(DisconnectReason::from_code(0x13), DisconnectReason::RemoteTerminated);
      assert_eq!(DisconnectReason::from_code(0x3E), DisconnectReason::Other(0x3E));
      assert_eq!(DisconnectReason::LocalTerminated.code(), 0x16);
   }

   #[test]
   fn test_sim_fails_then_succeeds() {
      let (tx, mut rx) = mpsc::unbounded_channel();
      let sim = SimController::new(tx);
      let addr = TypedAddress::bredr(BdAddr([1; 6]));
      sim.fail_opens(addr, 1);

      sim.open_link(&addr);
      sim.open_link(&addr);
      let statuses: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
         .map(|e| match e {
            ControllerEvent::Connected { status, .. } => status,
            other => panic!("unexpected {other:?}"),
         })
         .collect();
      assert_eq!(statuses, [Status::Failure, Status::Success]);
   }
}
