//! Session records and the client queues hanging off them.

use log::debug;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{
   address::{BdAddr, TypedAddress},
   controller::DisconnectReason,
   event::{Client, SessionNotice},
   profile::ProfileSet,
   session::state::SessionState,
};

/// Clients waiting on one kind of request.
///
/// A client queued twice is held once, so it gets exactly one completion.
#[derive(Debug, Default)]
pub struct WaitList {
   clients: SmallVec<[Client; 2]>,
}

impl WaitList {
   pub fn push(&mut self, client: Client) {
      if !self.clients.iter().any(|c| c.same_channel(&client)) {
         self.clients.push(client);
      }
   }

   pub fn len(&self) -> usize {
      self.clients.len()
   }

   pub fn is_empty(&self) -> bool {
      self.clients.is_empty()
   }

   /// Sends `notice` to every queued client and empties the queue.
   pub fn complete(&mut self, notice: SessionNotice) -> usize {
      let n = self
         .clients
         .drain(..)
         .filter(|c| c.send(notice).is_ok())
         .count();
      if n > 0 {
         debug!("completed {n} clients with {notice:?}");
      }
      n
   }
}

/// One handset session.
#[derive(Debug, Default)]
pub struct SessionRecord {
   /// Public classic address of the device; `None` for a session that
   /// only exists because of an LE link.
   pub device: Option<BdAddr>,
   pub(crate) state: SessionState,
   pub requested: ProfileSet,
   pub connected: ProfileSet,
   /// Profiles already tried in the current connect attempt.
   pub(crate) attempted: ProfileSet,
   pub acl_attempts: u32,
   pub(crate) connect_waiters: WaitList,
   pub(crate) disconnect_waiters: WaitList,
   pub(crate) stop_waiter: Option<Client>,
   /// A disconnect arrived while connecting.
   pub(crate) disconnect_pending: bool,
   pub le_addr: Option<TypedAddress>,
   pub le_connected: bool,
   pub disconnect_reason: Option<DisconnectReason>,
}

impl SessionRecord {
   pub fn for_device(device: BdAddr) -> Self {
      Self {
         device: Some(device),
         ..Default::default()
      }
   }

   pub fn for_le(addr: TypedAddress) -> Self {
      Self {
         le_addr: Some(addr),
         ..Default::default()
      }
   }

   pub const fn state(&self) -> SessionState {
      self.state
   }

   pub fn bredr_addr(&self) -> Option<TypedAddress> {
      self.device.map(TypedAddress::bredr)
   }

   pub fn matches(&self, addr: &BdAddr) -> bool {
      self.device.as_ref() == Some(addr) || self.le_addr.is_some_and(|le| le.addr == *addr)
   }

   /// Requests still waiting for an answer.
   pub fn has_waiters(&self) -> bool {
      !self.connect_waiters.is_empty()
         || !self.disconnect_waiters.is_empty()
         || self.stop_waiter.is_some()
   }

   /// Nothing left to keep the session alive.
   pub fn is_idle(&self) -> bool {
      self.state == SessionState::Disconnected && !self.le_connected && !self.has_waiters()
   }

   pub fn image(&self) -> SessionImage {
      SessionImage {
         device: self.device,
         state: self.state,
         requested: self.requested,
         connected: self.connected,
         le_addr: self.le_addr,
         le_connected: self.le_connected,
      }
   }
}

/// Transferable and displayable view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionImage {
   pub device: Option<BdAddr>,
   pub state: SessionState,
   pub requested: ProfileSet,
   pub connected: ProfileSet,
   pub le_addr: Option<TypedAddress>,
   pub le_connected: bool,
}

impl From<SessionImage> for SessionRecord {
   fn from(image: SessionImage) -> Self {
      Self {
         device: image.device,
         state: image.state,
         requested: image.requested,
         connected: image.connected,
         le_addr: image.le_addr,
         le_connected: image.le_connected,
         ..Default::default()
      }
   }
}

#[cfg(test)]
mod tests {
   use tokio::sync::mpsc;

   use super::*;
   use crate::error::Status;

   #[test]
   fn test_waitlist_completes_each_client_once() {
      let (a, mut rx_a) = mpsc::unbounded_channel();
      let (b, mut rx_b) = mpsc::unbounded_channel();
      let mut list = WaitList::default();
      list.push(a.clone());
      list.push(b);
      list.push(a);
      assert_eq!(list.len(), 2);

      let notice = SessionNotice::ConnectCfm {
         addr: BdAddr([1; 6]),
         status: Status::Success,
      };
      assert_eq!(list.complete(notice), 2);
      assert!(list.is_empty());
      assert_eq!(rx_a.try_recv().unwrap(), notice);
      assert!(rx_a.try_recv().is_err());
      assert_eq!(rx_b.try_recv().unwrap(), notice);

      // Completing an empty queue sends nothing.
      assert_eq!(list.complete(notice), 0);
   }
}
