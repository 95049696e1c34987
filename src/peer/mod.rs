//! State shared with the other earbud.

pub mod collect;
pub mod message;
pub mod mirror;
pub mod snapshot;

pub use collect::{Connection, LocalSensors, SimSensors};
pub use message::{Outbox, PeerMessage};
pub use mirror::{
   EventMask, LocalUpdate, Mirror, MirrorAction, MirrorConfig, MirrorEvent, Side,
};
pub use snapshot::{
   BatteryState, BatteryStatus, FeatureMode, Flag, LinkQualities, LinkQualityEntry,
   NoiseControl, PeerSnapshot, PhysicalState, StateFlags,
};
