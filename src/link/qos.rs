//! Connection-parameter (QoS) policy.
//!
//! Every link carries a histogram of outstanding QoS requests. The
//! effective level of a link is the highest populated bucket, or the
//! system-wide default when nothing is requested, clamped to the
//! system-wide ceiling. The default only ever rises.

use std::collections::BTreeMap;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use strum::{EnumCount, IntoEnumIterator};

use crate::{
   handover::{HandoverParticipant, MarshalData, MarshalType, Role, Unmarshalled},
   link::{registry::LinkRecord, state::LinkState},
};

/// Named policy bucket, ordered from least to most demanding.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   PartialOrd,
   Ord,
   Hash,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
   strum::EnumIter,
   strum::EnumCount,
   strum::FromRepr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum QosLevel {
   LowPower = 0,
   ShortDataExchange = 1,
   Audio = 2,
   LowLatency = 3,
}

/// LE connection parameters, in controller units (1.25 ms intervals,
/// 10 ms supervision timeout).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnParams {
   pub interval_min: u16,
   pub interval_max: u16,
   pub latency: u16,
   pub supervision_timeout: u16,
}

impl ConnParams {
   pub const fn new(interval_min: u16, interval_max: u16, latency: u16, timeout: u16) -> Self {
      Self {
         interval_min,
         interval_max,
         latency,
         supervision_timeout: timeout,
      }
   }
}

/// Level → parameter mapping.
pub type QosTable = BTreeMap<QosLevel, ConnParams>;

pub fn default_qos_table() -> QosTable {
   BTreeMap::from([
      (QosLevel::LowPower, ConnParams::new(48, 64, 4, 600)),
      (QosLevel::ShortDataExchange, ConnParams::new(24, 40, 0, 400)),
      (QosLevel::Audio, ConnParams::new(16, 24, 0, 300)),
      (QosLevel::LowLatency, ConnParams::new(6, 12, 0, 200)),
   ])
}

/// Reference counts of outstanding requests, one bucket per level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QosHistogram([u8; QosLevel::COUNT]);

impl QosHistogram {
   pub const fn new() -> Self {
      Self([0; QosLevel::COUNT])
   }

   pub fn increment(&mut self, level: QosLevel) {
      let slot = &mut self.0[level as usize];
      *slot = slot.saturating_add(1);
   }

   /// Returns `false` if nothing was outstanding at this level.
   pub fn decrement(&mut self, level: QosLevel) -> bool {
      let slot = &mut self.0[level as usize];
      if *slot == 0 {
         return false;
      }
      *slot -= 1;
      true
   }

   pub fn count(&self, level: QosLevel) -> u8 {
      self.0[level as usize]
   }

   pub fn highest(&self) -> Option<QosLevel> {
      QosLevel::iter().rev().find(|&level| self.count(level) > 0)
   }

   pub fn is_empty(&self) -> bool {
      self.0.iter().all(|&c| c == 0)
   }

   pub fn clear(&mut self) {
      self.0 = [0; QosLevel::COUNT];
   }
}

/// System-wide QoS state: floor, ceiling and the parameter table.
#[derive(Debug, Clone)]
pub struct QosEngine {
   default_level: QosLevel,
   ceiling: QosLevel,
   table: QosTable,
   /// Controller default must be pushed again (set on promotion).
   resync_default: bool,
}

impl QosEngine {
   pub fn new(default_level: QosLevel, ceiling: QosLevel, table: QosTable) -> Self {
      Self {
         default_level,
         ceiling,
         table,
         resync_default: false,
      }
   }

   pub const fn default_level(&self) -> QosLevel {
      self.default_level
   }

   pub const fn ceiling(&self) -> QosLevel {
      self.ceiling
   }

   pub fn params(&self, level: QosLevel) -> ConnParams {
      // Fall back to the nearest configured level below.
      self
         .table
         .range(..=level)
         .next_back()
         .or_else(|| self.table.iter().next())
         .map(|(_, p)| *p)
         .unwrap_or_else(|| ConnParams::new(24, 40, 0, 400))
   }

   pub fn default_params(&self) -> ConnParams {
      self.params(self.default_level)
   }

   /// Highest requested level, or the default, clamped to the ceiling.
   pub fn effective(&self, histogram: &QosHistogram) -> QosLevel {
      histogram
         .highest()
         .unwrap_or(self.default_level)
         .min(self.ceiling)
   }

   /// Registers a request; returns the parameters to signal, if any.
   pub fn request(&self, record: &mut LinkRecord, level: QosLevel) -> Option<ConnParams> {
      let before = self.effective(&record.qos);
      record.qos.increment(level);
      let after = self.effective(&record.qos);
      debug!("QoS request {level} on {}: {before} -> {after}", record.address);
      if after >= before {
         self.apply(record)
      } else {
         None
      }
   }

   /// Drops a request; returns the parameters to signal, if any.
   pub fn release(&self, record: &mut LinkRecord, level: QosLevel) -> Option<ConnParams> {
      let before = self.effective(&record.qos);
      if !record.qos.decrement(level) {
         warn!("QoS release {level} on {} without matching request", record.address);
         return None;
      }
      let after = self.effective(&record.qos);
      debug!("QoS release {level} on {}: {before} -> {after}", record.address);
      if after != before { self.apply(record) } else { None }
   }

   /// Raises the controller-wide floor. Returns the new default
   /// parameters when the floor actually moved.
   pub fn request_default(&mut self, level: QosLevel) -> Option<ConnParams> {
      if level <= self.default_level {
         if level < self.default_level {
            debug!("Ignoring default QoS {level}, floor is {}", self.default_level);
         }
         return None;
      }
      info!("Default QoS raised {} -> {level}", self.default_level);
      self.default_level = level;
      Some(self.default_params())
   }

   /// Default parameters still owed to the controller, if any.
   pub fn take_resync(&mut self) -> Option<ConnParams> {
      std::mem::take(&mut self.resync_default).then(|| self.default_params())
   }

   pub fn set_ceiling(&mut self, level: QosLevel) {
      info!("QoS ceiling {} -> {level}", self.ceiling);
      self.ceiling = level;
   }

   /// Works out whether a link needs a parameter update.
   ///
   /// Only fully connected LE links are signalled. A locally initiated
   /// link sitting at the default parameters was opened with them and is
   /// left alone.
   pub fn apply(&self, record: &mut LinkRecord) -> Option<ConnParams> {
      if !record.address.is_le() || record.state() != LinkState::Connected {
         return None;
      }
      let level = self.effective(&record.qos);
      let params = self.params(level);
      if record.params == Some(params) {
         return None;
      }
      if record.local && record.params.is_none() && params == self.default_params() {
         record.params = Some(params);
         return None;
      }
      record.params = Some(params);
      Some(params)
   }
}

// The engine carries no per-link state of its own; the histograms travel
// with the link records.
impl HandoverParticipant for QosEngine {
   fn veto(&self) -> bool {
      false
   }

   fn marshal(&mut self, _ty: MarshalType) -> Option<MarshalData> {
      None
   }

   fn unmarshal(&mut self, data: MarshalData) -> Unmarshalled {
      Unmarshalled::Failed(format!("unexpected {}", data.ty))
   }

   fn commit(&mut self, role: Role) {
      if role == Role::Primary {
         self.resync_default = true;
      }
   }
}
