//! Messages exchanged by the two mirrors, and the outbox that holds them
//! until the channel takes them.

use std::collections::VecDeque;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{
   address::BdAddr,
   channel::{ChannelId, PeerFrame},
   error::Result,
   peer::snapshot::{
      BatteryState, FeatureMode, LinkQualities, PeerSnapshot, PhysicalState, StateFlags,
   },
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
   InitialState(Box<PeerSnapshot>),
   /// Every flag except the physical ones.
   Flags(StateFlags),
   Physical(PhysicalState),
   Battery(BatteryState),
   Handset(Option<BdAddr>),
   LinkQuality(LinkQualities),
   MicQuality(Option<u8>),
   FeatureMode(FeatureMode),
}

impl PeerMessage {
   /// Frame type tag; also the key messages are coalesced by.
   pub const fn tag(&self) -> u8 {
      match self {
         Self::InitialState(_) => 0,
         Self::Flags(_) => 1,
         Self::Physical(_) => 2,
         Self::Battery(_) => 3,
         Self::Handset(_) => 4,
         Self::LinkQuality(_) => 5,
         Self::MicQuality(_) => 6,
         Self::FeatureMode(_) => 7,
      }
   }

   /// Whether a newer message of the same type replaces this one.
   /// Physical transitions are all delivered.
   pub const fn coalesces(&self) -> bool {
      !matches!(self, Self::InitialState(_) | Self::Physical(_))
   }

   pub fn to_frame(&self) -> Result<PeerFrame> {
      PeerFrame::encode(ChannelId::StateProxy, self.tag(), self)
   }

   pub fn from_frame(frame: &PeerFrame) -> Result<Self> {
      frame.decode()
   }
}

/// Pending outgoing messages.
#[derive(Debug)]
pub struct Outbox {
   queue: VecDeque<PeerMessage>,
   limit: usize,
}

impl Outbox {
   pub fn new(limit: usize) -> Self {
      Self {
         queue: VecDeque::new(),
         limit: limit.max(1),
      }
   }

   /// Queues `message`, first dropping a queued message of the same type
   /// if the type coalesces.
   ///
   /// Over the limit the oldest coalescing message goes first. Physical
   /// transitions and the initial state are never dropped, so the queue
   /// may stay over the limit while only those remain.
   pub fn push(&mut self, message: PeerMessage) {
      if message.coalesces() {
         let tag = message.tag();
         self.queue.retain(|m| m.tag() != tag);
      }
      self.queue.push_back(message);
      while self.queue.len() > self.limit {
         let Some(index) = self.queue.iter().position(PeerMessage::coalesces) else {
            debug!("peer outbox over limit with {} ordered messages", self.queue.len());
            break;
         };
         if let Some(dropped) = self.queue.remove(index) {
            warn!("Peer outbox full, dropping {dropped:?}");
         }
      }
   }

   /// Queues the initial state ahead of everything else. Queued
   /// incremental messages are superseded by it.
   pub fn push_initial(&mut self, snapshot: PeerSnapshot) {
      let dropped = self.queue.len();
      self.queue.clear();
      if dropped > 0 {
         debug!("initial state supersedes {dropped} queued messages");
      }
      self
         .queue
         .push_back(PeerMessage::InitialState(Box::new(snapshot)));
   }

   pub fn pop(&mut self) -> Option<PeerMessage> {
      self.queue.pop_front()
   }

   /// Puts back a message the channel refused.
   pub fn unpop(&mut self, message: PeerMessage) {
      self.queue.push_front(message);
   }

   pub fn len(&self) -> usize {
      self.queue.len()
   }

   pub fn is_empty(&self) -> bool {
      self.queue.is_empty()
   }

   pub fn clear(&mut self) {
      self.queue.clear();
   }

   pub fn iter(&self) -> impl Iterator<Item = &PeerMessage> {
      self.queue.iter()
   }
}
