//! Bluetooth device addresses.
//!
//! Links are keyed by a transport-typed address: the 48-bit device
//! address, whether it is public or random, and the transport (classic
//! BR/EDR or low energy) the link runs over.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::LinkError;

/// A 48-bit Bluetooth device address, most significant byte first.
///
/// Serialized in its `AA:BB:CC:DD:EE:FF` text form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
   /// The all-zero address. Marks a free registry slot.
   pub const ZERO: Self = Self([0; 6]);

   pub const fn new(bytes: [u8; 6]) -> Self {
      Self(bytes)
   }

   pub const fn is_zero(&self) -> bool {
      let b = self.0;
      b[0] | b[1] | b[2] | b[3] | b[4] | b[5] == 0
   }

   /// Top two bits `01` mark a resolvable private address.
   pub const fn is_resolvable_private(&self) -> bool {
      self.0[0] & 0xC0 == 0x40
   }
}

impl fmt::Display for BdAddr {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let [a, b, c, d, e, g] = self.0;
      write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
   }
}

impl FromStr for BdAddr {
   type Err = LinkError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      let invalid = || LinkError::InvalidAddress(s.into());
      let mut out = [0u8; 6];
      let mut parts = s.split(':');
      for byte in &mut out {
         let part = parts.next().ok_or_else(invalid)?;
         let decoded = hex::decode(part).map_err(|_| invalid())?;
         let [value] = decoded.as_slice() else {
            return Err(invalid());
         };
         *byte = *value;
      }
      if parts.next().is_some() {
         return Err(invalid());
      }
      Ok(Self(out))
   }
}

impl Serialize for BdAddr {
   fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
      serializer.collect_str(self)
   }
}

impl<'de> Deserialize<'de> for BdAddr {
   fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
      let text = String::deserialize(deserializer)?;
      text.parse().map_err(serde::de::Error::custom)
   }
}

/// Radio transport a link runs over.
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
   strum::EnumString,
)]
pub enum Transport {
   #[default]
   #[strum(serialize = "bredr")]
   BrEdr,
   #[strum(serialize = "le")]
   Le,
}

impl Transport {
   pub const fn mask(self) -> TransportMask {
      match self {
         Self::BrEdr => TransportMask::BREDR,
         Self::Le => TransportMask::LE,
      }
   }
}

/// Set of transports, used to filter lookups and subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TransportMask(u8);

impl TransportMask {
   pub const NONE: Self = Self(0);
   pub const BREDR: Self = Self(1 << 0);
   pub const LE: Self = Self(1 << 1);
   pub const ALL: Self = Self(Self::BREDR.0 | Self::LE.0);

   pub const fn contains(self, transport: Transport) -> bool {
      self.0 & transport.mask().0 != 0
   }

   pub const fn union(self, other: Self) -> Self {
      Self(self.0 | other.0)
   }

   pub const fn is_empty(self) -> bool {
      self.0 == 0
   }
}

/// Public or random device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AddressType {
   #[default]
   Public,
   Random,
}

/// A device address qualified by address type and transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TypedAddress {
   pub transport: Transport,
   pub kind: AddressType,
   pub addr: BdAddr,
}

impl TypedAddress {
   pub const EMPTY: Self = Self {
      transport: Transport::BrEdr,
      kind: AddressType::Public,
      addr: BdAddr::ZERO,
   };

   pub const fn bredr(addr: BdAddr) -> Self {
      Self {
         transport: Transport::BrEdr,
         kind: AddressType::Public,
         addr,
      }
   }

   pub const fn le_public(addr: BdAddr) -> Self {
      Self {
         transport: Transport::Le,
         kind: AddressType::Public,
         addr,
      }
   }

   pub const fn le_random(addr: BdAddr) -> Self {
      Self {
         transport: Transport::Le,
         kind: AddressType::Random,
         addr,
      }
   }

   pub const fn is_empty(&self) -> bool {
      self.addr.is_zero()
   }

   pub const fn is_le(&self) -> bool {
      matches!(self.transport, Transport::Le)
   }

   /// Random addresses may need resolution before they can be compared.
   pub const fn needs_resolution(&self) -> bool {
      matches!(self.kind, AddressType::Random) && self.addr.is_resolvable_private()
   }
}

impl fmt::Display for TypedAddress {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let kind = match self.kind {
         AddressType::Public => "",
         AddressType::Random => "/rnd",
      };
      write!(f, "{}[{}{}]", self.addr, self.transport, kind)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_parse_and_display() {
      let addr: BdAddr = "00:1A:7d:da:71:13".parse().unwrap();
      assert_eq!(addr, BdAddr([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13]));
      assert_eq!(addr.to_string(), "00:1A:7D:DA:71:13");
   }

   #[test]
   fn test_parse_rejects_garbage() {
      assert!("00:1A:7D:DA:71".parse::<BdAddr>().is_err());
      assert!("00:1A:7D:DA:71:13:00".parse::<BdAddr>().is_err());
      assert!("00:1A:7D:DA:71:GG".parse::<BdAddr>().is_err());
      assert!("001A:7D:DA:71:13".parse::<BdAddr>().is_err());
   }

   #[test]
   fn test_resolvable_private_bits() {
      assert!(BdAddr([0x4F, 1, 2, 3, 4, 5]).is_resolvable_private());
      assert!(!BdAddr([0xCF, 1, 2, 3, 4, 5]).is_resolvable_private());
      let rpa = TypedAddress::le_random(BdAddr([0x4F, 1, 2, 3, 4, 5]));
      assert!(rpa.needs_resolution());
      assert!(!TypedAddress::le_public(BdAddr([0x4F, 1, 2, 3, 4, 5])).needs_resolution());
   }

   #[test]
   fn test_transport_mask() {
      assert!(TransportMask::ALL.contains(Transport::Le));
      assert!(!TransportMask::BREDR.contains(Transport::Le));
      assert_eq!(TransportMask::BREDR.union(TransportMask::LE), TransportMask::ALL);
   }
}
