//! Channel to the other earbud.
//!
//! A reliable, ordered, message-typed pipe. Frames carry the logical
//! channel they belong to, a type tag and an opaque payload.

use std::sync::Arc;

use crossbeam::atomic::AtomicCell;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{LinkError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ChannelId {
   StateProxy,
   Handover,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerFrame {
   pub channel: ChannelId,
   pub tag: u8,
   pub payload: Vec<u8>,
}

impl PeerFrame {
   pub fn encode<T: Serialize>(channel: ChannelId, tag: u8, message: &T) -> Result<Self> {
      Ok(Self {
         channel,
         tag,
         payload: serde_json::to_vec(message)?,
      })
   }

   pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
      Ok(serde_json::from_slice(&self.payload)?)
   }
}

/// What arrives from the peer side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
   Frame(PeerFrame),
   Connected(bool),
}

pub trait PeerChannel: Send + Sync {
   fn send(&self, frame: PeerFrame) -> Result<()>;
   fn is_connected(&self) -> bool;
}

/// One end of an in-process channel pair.
#[derive(Debug, Clone)]
pub struct PeerLink {
   remote: mpsc::UnboundedSender<ChannelEvent>,
   local: mpsc::UnboundedSender<ChannelEvent>,
   connected: Arc<AtomicCell<bool>>,
}

impl PeerLink {
   /// Two connected ends and the receivers their events arrive on.
   pub fn pair() -> (
      (Self, mpsc::UnboundedReceiver<ChannelEvent>),
      (Self, mpsc::UnboundedReceiver<ChannelEvent>),
   ) {
      let (a_tx, a_rx) = mpsc::unbounded_channel();
      let (b_tx, b_rx) = mpsc::unbounded_channel();
      let connected = Arc::new(AtomicCell::new(true));
      let a = Self {
         remote: b_tx.clone(),
         local: a_tx.clone(),
         connected: connected.clone(),
      };
      let b = Self {
         remote: a_tx,
         local: b_tx,
         connected,
      };
      ((a, a_rx), (b, b_rx))
   }

   /// Brings the pipe up or down and tells both ends.
   pub fn set_connected(&self, connected: bool) {
      if self.connected.swap(connected) == connected {
         return;
      }
      debug!("peer channel {}", if connected { "up" } else { "down" });
      let _ = self.local.send(ChannelEvent::Connected(connected));
      let _ = self.remote.send(ChannelEvent::Connected(connected));
   }
}

impl PeerChannel for PeerLink {
   fn send(&self, frame: PeerFrame) -> Result<()> {
      if !self.connected.load() {
         return Err(LinkError::PeerNotConnected);
      }
      debug!(
         "peer tx [{}] tag {} ({} bytes)",
         frame.channel,
         frame.tag,
         frame.payload.len()
      );
      self
         .remote
         .send(ChannelEvent::Frame(frame))
         .map_err(|_| LinkError::PeerNotConnected)
   }

   fn is_connected(&self) -> bool {
      self.connected.load()
   }
}
