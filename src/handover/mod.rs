//! Primary-role handover.
//!
//! Every stateful component takes part in a handover through
//! [`HandoverParticipant`]: it may veto the attempt, marshal its state on
//! the device giving up the primary role, unmarshal it on the device
//! taking it over, and commit to its new role on both.

use serde::{Deserialize, Serialize};

pub mod coordinator;

pub use coordinator::{HandoverCoordinator, HandoverReport, ParticipantSet, Registration};

/// Which device owns handset connectivity.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Default,
   Serialize,
   Deserialize,
   strum::Display,
   strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum Role {
   #[default]
   Primary,
   Secondary,
}

impl Role {
   pub const fn other(self) -> Self {
      match self {
         Self::Primary => Self::Secondary,
         Self::Secondary => Self::Primary,
      }
   }
}

/// Components registered with the coordinator.
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
   strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum ComponentId {
   Links,
   Qos,
   Sessions,
   PeerState,
}

impl ComponentId {
   pub fn name(self) -> &'static str {
      self.into()
   }
}

/// Kinds of state that cross between devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum MarshalType {
   LinkRecords,
   HandsetSession,
   PeerState,
}

/// One marshalled value, carried by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarshalData {
   pub ty: MarshalType,
   pub value: serde_json::Value,
}

impl MarshalData {
   pub fn encode<T: Serialize>(ty: MarshalType, value: &T) -> Option<Self> {
      match serde_json::to_value(value) {
         Ok(value) => Some(Self { ty, value }),
         Err(e) => {
            log::error!("Failed to marshal {ty}: {e}");
            None
         },
      }
   }

   pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> crate::error::Result<T> {
      Ok(serde_json::from_value(self.value.clone())?)
   }
}

/// Outcome of an unmarshal, and with it who owns the buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Unmarshalled {
   Failed(String),
   /// The participant copied what it needed; the caller drops the data.
   Copied(MarshalData),
   /// The participant kept the data.
   Adopted,
}

/// The four-step contract each component implements.
pub trait HandoverParticipant {
   /// Returning `true` aborts the whole attempt.
   fn veto(&self) -> bool;

   /// `None` when there is nothing of `ty` to hand over.
   fn marshal(&mut self, ty: MarshalType) -> Option<MarshalData>;

   fn unmarshal(&mut self, data: MarshalData) -> Unmarshalled;

   /// Called exactly once per completed attempt, even when nothing of
   /// this participant's was transferred.
   fn commit(&mut self, role: Role);
}

/// Messages on the handover channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HandoverMessage {
   Transfer { attempt: u32, items: Vec<MarshalData> },
   Ack { attempt: u32, accepted: bool },
}
