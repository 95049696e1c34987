//! Notification fan-out.
//!
//! Three independent lists: generic connect/disconnect, transport
//! filtered connection events, and handset-connectable changes. Each
//! event is unicast to every live subscriber in registration order.

use log::debug;
use smallvec::SmallVec;

use crate::{
   address::{TransportMask, TypedAddress},
   controller::DisconnectReason,
   event::{ConnectableChanged, ConnectionEvent, Subscriber},
   link::qos::ConnParams,
};

/// Ordered subscribers, each with a filter.
#[derive(Debug)]
pub struct SubscriberList<T, F = ()> {
   entries: SmallVec<[(Subscriber<T>, F); 4]>,
}

impl<T, F> Default for SubscriberList<T, F> {
   fn default() -> Self {
      Self {
         entries: SmallVec::new(),
      }
   }
}

impl<T: Clone, F> SubscriberList<T, F> {
   pub fn new() -> Self {
      Self::default()
   }

   /// Adds `tx`. A subscriber already on the list keeps its position and
   /// its filter is replaced; returns `false` in that case.
   pub fn register(&mut self, tx: Subscriber<T>, filter: F) -> bool {
      if let Some(entry) = self.entries.iter_mut().find(|(s, _)| s.same_channel(&tx)) {
         entry.1 = filter;
         return false;
      }
      self.entries.push((tx, filter));
      true
   }

   /// Returns `false` if `tx` was not registered.
   pub fn unregister(&mut self, tx: &Subscriber<T>) -> bool {
      let before = self.entries.len();
      self.entries.retain(|(s, _)| !s.same_channel(tx));
      self.entries.len() != before
   }

   pub fn len(&self) -> usize {
      self.entries.len()
   }

   pub fn is_empty(&self) -> bool {
      self.entries.is_empty()
   }

   /// Whether any subscriber's filter accepts.
   pub fn any(&self, mut accepts: impl FnMut(&F) -> bool) -> bool {
      self.entries.iter().any(|(_, f)| accepts(f))
   }

   /// Sends `event` to every subscriber whose filter accepts it and
   /// drops subscribers that have gone away.
   pub fn deliver(&mut self, event: &T, mut accepts: impl FnMut(&F) -> bool) -> usize {
      let mut sent = 0;
      self.entries.retain(|(tx, filter)| {
         if tx.is_closed() {
            return false;
         }
         if accepts(&*filter) {
            if tx.send(event.clone()).is_err() {
               return false;
            }
            sent += 1;
         }
         true
      });
      sent
   }
}

/// The link fan-out lists.
#[derive(Debug, Default)]
pub struct Notifier {
   connections: SubscriberList<ConnectionEvent>,
   transport: SubscriberList<ConnectionEvent, TransportMask>,
   connectable: SubscriberList<ConnectableChanged>,
}

impl Notifier {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn register_connections(&mut self, tx: Subscriber<ConnectionEvent>) -> bool {
      self.connections.register(tx, ())
   }

   pub fn unregister_connections(&mut self, tx: &Subscriber<ConnectionEvent>) -> bool {
      self.connections.unregister(tx)
   }

   pub fn register_transport(
      &mut self,
      tx: Subscriber<ConnectionEvent>,
      transports: TransportMask,
   ) -> bool {
      self.transport.register(tx, transports)
   }

   pub fn unregister_transport(&mut self, tx: &Subscriber<ConnectionEvent>) -> bool {
      self.transport.unregister(tx)
   }

   pub fn register_connectable(&mut self, tx: Subscriber<ConnectableChanged>) -> bool {
      self.connectable.register(tx, ())
   }

   pub fn unregister_connectable(&mut self, tx: &Subscriber<ConnectableChanged>) -> bool {
      self.connectable.unregister(tx)
   }

   fn to_transport(&mut self, event: ConnectionEvent) {
      let transport = event.addr().transport;
      self.transport.deliver(&event, |mask| mask.contains(transport));
   }

   pub fn connected(&mut self, addr: TypedAddress, incoming: bool) {
      let event = ConnectionEvent::Connected { addr, incoming };
      let n = self.connections.deliver(&event, |_| true);
      debug!("fan-out: {addr} connected -> {n} generic subscribers");
      self.to_transport(event);
   }

   pub fn disconnected(&mut self, addr: TypedAddress, reason: DisconnectReason) {
      let event = ConnectionEvent::Disconnected { addr, reason };
      let n = self.connections.deliver(&event, |_| true);
      debug!("fan-out: {addr} disconnected ({reason:?}) -> {n} generic subscribers");
      self.to_transport(event);
   }

   pub fn disconnect_requested(&mut self, addr: TypedAddress) {
      self.to_transport(ConnectionEvent::DisconnectRequested { addr });
   }

   pub fn params_changed(&mut self, addr: TypedAddress, params: ConnParams) {
      self.to_transport(ConnectionEvent::ParamsChanged { addr, params });
   }

   pub fn connectable_changed(&mut self, connectable: bool) {
      self
         .connectable
         .deliver(&ConnectableChanged { connectable }, |_| true);
   }
}
